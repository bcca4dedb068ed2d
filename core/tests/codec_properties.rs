// Property-based tests for the wire codec
//
// Random inputs exercise the primitives, tagged-field blocks and record
// batches against edge values, and random byte strings check that decoders
// fail cleanly instead of panicking.

use bytes::{Bytes, BytesMut};
use kestrel::codec::{
    get_nullable_string, get_unsigned_varint, get_varint, get_varlong, put_nullable_string,
    put_unsigned_varint, put_varint, put_varlong, unsigned_varint_size, varint_size, varlong_size,
};
use kestrel::records::{record_body_size, record_size};
use kestrel::{
    Decodable, MetadataRequest, MetadataResponse, ProduceResponse, Record, RecordBatch,
    RecordBatchHeader, RecordHeader, TaggedFields,
};
use proptest::prelude::*;
use std::io::Cursor;

fn arb_header() -> impl Strategy<Value = RecordHeader> {
    (
        "[a-z-]{1,12}",
        prop::option::of(prop::collection::vec(any::<u8>(), 0..16)),
    )
        .prop_map(|(key, value)| RecordHeader::new(key, value.map(Bytes::from)))
}

fn arb_records() -> impl Strategy<Value = Vec<Record>> {
    prop::collection::vec(
        (
            0i64..10_000,
            prop::option::of(prop::collection::vec(any::<u8>(), 0..32)),
            prop::option::of(prop::collection::vec(any::<u8>(), 0..256)),
            prop::collection::vec(arb_header(), 0..3),
        ),
        0..12,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (ts, key, value, headers))| Record {
                attributes: 0,
                timestamp_delta: ts,
                offset_delta: i as i32,
                key: key.map(Bytes::from),
                value: value.map(Bytes::from),
                headers,
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn test_varint_roundtrip(value: i32) {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, value);
        prop_assert_eq!(buf.len(), varint_size(value));
        prop_assert!(buf.len() <= 5);
        prop_assert_eq!(get_varint(&mut Cursor::new(buf.as_ref())).unwrap(), value);
    }

    #[test]
    fn test_varlong_roundtrip(value: i64) {
        let mut buf = BytesMut::new();
        put_varlong(&mut buf, value);
        prop_assert_eq!(buf.len(), varlong_size(value));
        prop_assert!(buf.len() <= 10);
        prop_assert_eq!(get_varlong(&mut Cursor::new(buf.as_ref())).unwrap(), value);
    }

    #[test]
    fn test_unsigned_varint_roundtrip(value: u32) {
        let mut buf = BytesMut::new();
        put_unsigned_varint(&mut buf, value);
        prop_assert_eq!(buf.len(), unsigned_varint_size(value));
        prop_assert_eq!(get_unsigned_varint(&mut Cursor::new(buf.as_ref())).unwrap(), value);
    }

    #[test]
    fn test_nullable_string_roundtrip(value in prop::option::of(".{0,64}"), flexible: bool) {
        let mut buf = BytesMut::new();
        put_nullable_string(&mut buf, value.as_deref(), flexible).unwrap();
        let decoded = get_nullable_string(&mut Cursor::new(buf.as_ref()), flexible).unwrap();
        prop_assert_eq!(decoded, value);
    }

    #[test]
    fn test_tagged_fields_roundtrip(
        tags in prop::collection::btree_map(any::<u32>(), prop::collection::vec(any::<u8>(), 0..24), 0..8)
    ) {
        let mut fields = TaggedFields::new();
        for (tag, data) in &tags {
            fields.push(*tag, Bytes::from(data.clone()));
        }
        let mut buf = BytesMut::new();
        fields.encode(&mut buf);
        let decoded = TaggedFields::decode(&mut Cursor::new(buf.as_ref())).unwrap();
        prop_assert_eq!(decoded, fields);
    }

    #[test]
    fn test_record_batch_roundtrip(
        records in arb_records(),
        producer_id in -1i64..1_000_000,
        base_sequence in -1i32..i32::MAX,
        transactional: bool,
    ) {
        let batch = RecordBatch {
            header: RecordBatchHeader {
                base_timestamp: 1_700_000_000_000,
                max_timestamp: 1_700_000_000_000 + records.iter().map(|r| r.timestamp_delta).max().unwrap_or(0),
                last_offset_delta: records.len() as i32 - 1,
                producer_id,
                producer_epoch: 0,
                base_sequence,
                attributes: if transactional { kestrel::records::attributes::TRANSACTIONAL } else { 0 },
                record_count: records.len() as i32,
                ..Default::default()
            },
            records,
        };

        let mut buf = BytesMut::new();
        batch.encode(&mut buf).unwrap();
        let expected_len = kestrel::records::RECORD_BATCH_OVERHEAD
            + batch.records.iter().map(|r| record_size(r.body_size())).sum::<usize>();
        prop_assert_eq!(buf.len(), expected_len);

        let decoded = RecordBatch::decode(&mut Cursor::new(buf.as_ref())).unwrap();
        prop_assert_eq!(decoded, batch);
    }

    #[test]
    fn test_record_size_helper_agrees_with_record(
        ts in any::<i64>(),
        delta in 0i32..i32::MAX,
        key in prop::option::of(prop::collection::vec(any::<u8>(), 0..300)),
    ) {
        let record = Record {
            timestamp_delta: ts,
            offset_delta: delta,
            key: key.clone().map(Bytes::from),
            ..Default::default()
        };
        prop_assert_eq!(
            record.body_size(),
            record_body_size(ts, delta, key.as_deref(), None, &[])
        );
    }

    #[test]
    fn test_decoders_never_panic_on_garbage(
        data in prop::collection::vec(any::<u8>(), 0..256),
        version in 0i16..=12,
    ) {
        let _ = MetadataResponse::decode(&mut Cursor::new(&data[..]), version);
        let _ = MetadataRequest::decode(&mut Cursor::new(&data[..]), version);
        let _ = ProduceResponse::decode(&mut Cursor::new(&data[..]), version.clamp(3, 9));
        let _ = RecordBatch::decode(&mut Cursor::new(&data[..]));
        let _ = TaggedFields::decode(&mut Cursor::new(&data[..]));
    }
}
