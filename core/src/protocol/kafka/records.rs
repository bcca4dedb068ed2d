//! Record batch v2 (magic = 2)
//!
//! ```text
//! RecordBatch =>
//!   baseOffset int64, batchLength int32, partitionLeaderEpoch int32,
//!   magic int8, crc uint32, attributes int16, lastOffsetDelta int32,
//!   baseTimestamp int64, maxTimestamp int64, producerId int64,
//!   producerEpoch int16, baseSequence int32, records [Record]
//!
//! Record =>
//!   length varint, attributes int8, timestampDelta varlong,
//!   offsetDelta varint, keyLength varint, key, valueLength varint, value,
//!   headers [headerKeyLength varint, headerKey, headerValueLength varint, value]
//! ```
//!
//! The CRC is CRC32C over everything from `attributes` to the end of the batch.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

use super::codec::{
    get_i16, get_i32, get_i64, get_i8, get_raw, get_u32, get_varint, get_varlong, put_varint,
    put_varlong, varint_size, varlong_size, CodecError, Result,
};

pub const MAGIC_V2: i8 = 2;

/// Size of the batch header, records excluded.
pub const RECORD_BATCH_OVERHEAD: usize = 61;

/// Bytes preceding the part covered by `batchLength`.
const LOG_OVERHEAD: usize = 12;
/// Offset of the CRC field from the start of the batch.
const CRC_OFFSET: usize = 17;
/// Offset of the attributes field, where CRC coverage starts.
const ATTRIBUTES_OFFSET: usize = 21;

pub const NO_PRODUCER_ID: i64 = -1;
pub const NO_PRODUCER_EPOCH: i16 = -1;
pub const NO_SEQUENCE: i32 = -1;
pub const NO_PARTITION_LEADER_EPOCH: i32 = -1;

/// Batch attribute bits.
pub mod attributes {
    pub const COMPRESSION_MASK: i16 = 0x07;
    pub const TIMESTAMP_TYPE_LOG_APPEND: i16 = 0x08;
    pub const TRANSACTIONAL: i16 = 0x10;
    pub const CONTROL: i16 = 0x20;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Bytes>,
}

impl RecordHeader {
    pub fn new(key: impl Into<String>, value: Option<Bytes>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    fn encoded_size(&self) -> usize {
        varint_size(self.key.len() as i32)
            + self.key.len()
            + nullable_varint_bytes_size(self.value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub attributes: i8,
    pub timestamp_delta: i64,
    pub offset_delta: i32,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

fn nullable_varint_bytes_size(value: Option<&[u8]>) -> usize {
    match value {
        Some(v) => varint_size(v.len() as i32) + v.len(),
        None => varint_size(-1),
    }
}

fn put_nullable_varint_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(v) => {
            put_varint(buf, v.len() as i32);
            buf.put_slice(v);
        }
        None => put_varint(buf, -1),
    }
}

fn get_nullable_varint_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Option<Bytes>> {
    match get_varint(cursor)? {
        -1 => Ok(None),
        n if n < 0 => Err(CodecError::malformed(format!("Negative record field length {}", n))),
        n => get_raw(cursor, n as usize).map(Some),
    }
}

/// Size of a record body, i.e. everything after its own length prefix.
pub fn record_body_size(
    timestamp_delta: i64,
    offset_delta: i32,
    key: Option<&[u8]>,
    value: Option<&[u8]>,
    headers: &[RecordHeader],
) -> usize {
    1 + varlong_size(timestamp_delta)
        + varint_size(offset_delta)
        + nullable_varint_bytes_size(key)
        + nullable_varint_bytes_size(value)
        + varint_size(headers.len() as i32)
        + headers.iter().map(RecordHeader::encoded_size).sum::<usize>()
}

/// Total encoded size of a record, length prefix included.
pub fn record_size(body_size: usize) -> usize {
    varint_size(body_size as i32) + body_size
}

/// Writes one record with its length prefix.
pub fn put_record(
    buf: &mut BytesMut,
    timestamp_delta: i64,
    offset_delta: i32,
    key: Option<&[u8]>,
    value: Option<&[u8]>,
    headers: &[RecordHeader],
) {
    let body = record_body_size(timestamp_delta, offset_delta, key, value, headers);
    put_varint(buf, body as i32);
    buf.put_i8(0);
    put_varlong(buf, timestamp_delta);
    put_varint(buf, offset_delta);
    put_nullable_varint_bytes(buf, key);
    put_nullable_varint_bytes(buf, value);
    put_varint(buf, headers.len() as i32);
    for header in headers {
        put_varint(buf, header.key.len() as i32);
        buf.put_slice(header.key.as_bytes());
        put_nullable_varint_bytes(buf, header.value.as_deref());
    }
}

impl Record {
    pub fn body_size(&self) -> usize {
        record_body_size(
            self.timestamp_delta,
            self.offset_delta,
            self.key.as_deref(),
            self.value.as_deref(),
            &self.headers,
        )
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let body = self.body_size();
        put_varint(buf, body as i32);
        buf.put_i8(self.attributes);
        put_varlong(buf, self.timestamp_delta);
        put_varint(buf, self.offset_delta);
        put_nullable_varint_bytes(buf, self.key.as_deref());
        put_nullable_varint_bytes(buf, self.value.as_deref());
        put_varint(buf, self.headers.len() as i32);
        for header in &self.headers {
            put_varint(buf, header.key.len() as i32);
            buf.put_slice(header.key.as_bytes());
            put_nullable_varint_bytes(buf, header.value.as_deref());
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let length = get_varint(cursor)?;
        if length < 0 {
            return Err(CodecError::malformed(format!("Negative record length {}", length)));
        }
        let start = cursor.position();

        let attributes = get_i8(cursor)?;
        let timestamp_delta = get_varlong(cursor)?;
        let offset_delta = get_varint(cursor)?;
        let key = get_nullable_varint_bytes(cursor)?;
        let value = get_nullable_varint_bytes(cursor)?;

        let header_count = get_varint(cursor)?;
        if header_count < 0 || header_count as usize > cursor.remaining() {
            return Err(CodecError::malformed(format!(
                "Invalid record header count {}",
                header_count
            )));
        }
        let mut headers = Vec::with_capacity(header_count as usize);
        for _ in 0..header_count {
            let key_len = get_varint(cursor)?;
            if key_len < 0 {
                return Err(CodecError::malformed("Null record header key"));
            }
            let raw = get_raw(cursor, key_len as usize)?;
            let key = String::from_utf8(raw.to_vec())
                .map_err(|e| CodecError::malformed(format!("Invalid header key: {}", e)))?;
            let value = get_nullable_varint_bytes(cursor)?;
            headers.push(RecordHeader { key, value });
        }

        let consumed = cursor.position() - start;
        if consumed != length as u64 {
            return Err(CodecError::malformed(format!(
                "Record length {} does not match decoded size {}",
                length, consumed
            )));
        }

        Ok(Self {
            attributes,
            timestamp_delta,
            offset_delta,
            key,
            value,
            headers,
        })
    }
}

/// Header fields of a v2 batch. `crc` and `batchLength` are derived on encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordBatchHeader {
    pub base_offset: i64,
    pub partition_leader_epoch: i32,
    pub attributes: i16,
    pub last_offset_delta: i32,
    pub base_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub record_count: i32,
}

impl Default for RecordBatchHeader {
    fn default() -> Self {
        Self {
            base_offset: 0,
            partition_leader_epoch: NO_PARTITION_LEADER_EPOCH,
            attributes: 0,
            last_offset_delta: -1,
            base_timestamp: 0,
            max_timestamp: 0,
            producer_id: NO_PRODUCER_ID,
            producer_epoch: NO_PRODUCER_EPOCH,
            base_sequence: NO_SEQUENCE,
            record_count: 0,
        }
    }
}

impl RecordBatchHeader {
    pub fn is_transactional(&self) -> bool {
        self.attributes & attributes::TRANSACTIONAL != 0
    }

    pub fn is_control(&self) -> bool {
        self.attributes & attributes::CONTROL != 0
    }

    pub fn compression(&self) -> i16 {
        self.attributes & attributes::COMPRESSION_MASK
    }
}

/// Writes a batch header, lets `write_records` append the records, then
/// back-fills `batchLength` and the CRC.
pub fn encode_record_batch<F>(
    buf: &mut BytesMut,
    header: &RecordBatchHeader,
    write_records: F,
) -> Result<()>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let start = buf.len();
    buf.put_i64(header.base_offset);
    buf.put_i32(0); // batchLength, patched below
    buf.put_i32(header.partition_leader_epoch);
    buf.put_i8(MAGIC_V2);
    buf.put_u32(0); // crc, patched below
    buf.put_i16(header.attributes);
    buf.put_i32(header.last_offset_delta);
    buf.put_i64(header.base_timestamp);
    buf.put_i64(header.max_timestamp);
    buf.put_i64(header.producer_id);
    buf.put_i16(header.producer_epoch);
    buf.put_i32(header.base_sequence);
    buf.put_i32(header.record_count);

    write_records(buf)?;

    let batch_length = i32::try_from(buf.len() - start - LOG_OVERHEAD)
        .map_err(|_| CodecError::malformed("Record batch too large"))?;
    buf[start + 8..start + 12].copy_from_slice(&batch_length.to_be_bytes());

    let crc = crc32c::crc32c(&buf[start + ATTRIBUTES_OFFSET..]);
    buf[start + CRC_OFFSET..start + ATTRIBUTES_OFFSET].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordBatch {
    pub header: RecordBatchHeader,
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let mut header = self.header;
        header.record_count = self.records.len() as i32;
        encode_record_batch(buf, &header, |buf| {
            for record in &self.records {
                record.encode(buf);
            }
            Ok(())
        })
    }

    /// Decodes one batch, verifying magic and CRC. Compressed batches are
    /// rejected since this client never writes them.
    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let data: &[u8] = *cursor.get_ref();
        let batch_start = cursor.position() as usize;
        let base_offset = get_i64(cursor)?;
        let batch_length = get_i32(cursor)?;
        if batch_length < (RECORD_BATCH_OVERHEAD - LOG_OVERHEAD) as i32 {
            return Err(CodecError::malformed(format!(
                "Record batch length {} below minimum",
                batch_length
            )));
        }
        let batch_end = batch_start + LOG_OVERHEAD + batch_length as usize;
        if batch_end > data.len() {
            return Err(CodecError::BufferUnderrun {
                needed: batch_end - batch_start,
                available: data.len() - batch_start,
            });
        }

        let partition_leader_epoch = get_i32(cursor)?;
        let magic = get_i8(cursor)?;
        if magic != MAGIC_V2 {
            return Err(CodecError::malformed(format!(
                "Unsupported record batch magic {}",
                magic
            )));
        }
        let crc = get_u32(cursor)?;
        let computed = crc32c::crc32c(&data[batch_start + ATTRIBUTES_OFFSET..batch_end]);
        if crc != computed {
            return Err(CodecError::Corruption(format!(
                "CRC mismatch: stored 0x{:08x}, computed 0x{:08x}",
                crc, computed
            )));
        }

        let header = RecordBatchHeader {
            base_offset,
            partition_leader_epoch,
            attributes: get_i16(cursor)?,
            last_offset_delta: get_i32(cursor)?,
            base_timestamp: get_i64(cursor)?,
            max_timestamp: get_i64(cursor)?,
            producer_id: get_i64(cursor)?,
            producer_epoch: get_i16(cursor)?,
            base_sequence: get_i32(cursor)?,
            record_count: get_i32(cursor)?,
        };
        if header.compression() != 0 {
            return Err(CodecError::malformed(format!(
                "Compressed record batches are not supported (codec {})",
                header.compression()
            )));
        }
        if header.record_count < 0 {
            return Err(CodecError::malformed(format!(
                "Negative record count {}",
                header.record_count
            )));
        }

        let body = &data[..batch_end];
        let mut records_cursor = Cursor::new(body);
        records_cursor.set_position(cursor.position());
        let mut records = Vec::with_capacity((header.record_count as usize).min(body.len()));
        for _ in 0..header.record_count {
            records.push(Record::decode(&mut records_cursor)?);
        }
        if records_cursor.position() as usize != batch_end {
            return Err(CodecError::malformed("Trailing bytes after last record"));
        }
        cursor.set_position(batch_end as u64);

        Ok(Self { header, records })
    }
}
