//! Kafka Wire Protocol Primitives
//!
//! Readers and writers for the building blocks every message is made of:
//! - Fixed-width integers in network byte order (big-endian)
//! - Unsigned varints and zigzag varints/varlongs (LEB128, KIP-482)
//! - Legacy strings/bytes/arrays (int16/int32 length, -1 = null)
//! - Compact strings/bytes/arrays (unsigned varint length + 1, 0 = null)
//!
//! Writers append to a `BytesMut`, readers consume from a `Cursor<&[u8]>` and
//! fail with [`CodecError`] instead of panicking on short or malformed input.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Cursor};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;
use uuid::Uuid;

/// Largest frame accepted from the wire.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

const MAX_VARINT_BYTES: usize = 5;
const MAX_VARLONG_BYTES: usize = 10;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed data: {0}")]
    MalformedData(String),
    #[error("Corrupt record batch: {0}")]
    Corruption(String),
    #[error("Unsupported API version: key={api_key}, version={version}")]
    UnsupportedVersion { api_key: i16, version: i16 },
    #[error("Buffer underrun: needed {needed}, available {available}")]
    BufferUnderrun { needed: usize, available: usize },
}

impl CodecError {
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedData(message.into())
    }
}

// io::Error is not Clone; the copy keeps its kind and message.
impl Clone for CodecError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::MalformedData(m) => Self::MalformedData(m.clone()),
            Self::Corruption(m) => Self::Corruption(m.clone()),
            Self::UnsupportedVersion { api_key, version } => Self::UnsupportedVersion {
                api_key: *api_key,
                version: *version,
            },
            Self::BufferUnderrun { needed, available } => Self::BufferUnderrun {
                needed: *needed,
                available: *available,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

#[inline]
fn ensure(cursor: &Cursor<&[u8]>, needed: usize) -> Result<()> {
    let available = cursor.remaining();
    if available < needed {
        return Err(CodecError::BufferUnderrun { needed, available });
    }
    Ok(())
}

// ============================================================================
// Fixed-width integers
// ============================================================================

pub fn get_i8(cursor: &mut Cursor<&[u8]>) -> Result<i8> {
    ensure(cursor, 1)?;
    Ok(cursor.get_i8())
}

pub fn get_i16(cursor: &mut Cursor<&[u8]>) -> Result<i16> {
    ensure(cursor, 2)?;
    Ok(cursor.get_i16())
}

pub fn get_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    ensure(cursor, 4)?;
    Ok(cursor.get_i32())
}

pub fn get_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    ensure(cursor, 8)?;
    Ok(cursor.get_i64())
}

pub fn get_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    ensure(cursor, 4)?;
    Ok(cursor.get_u32())
}

pub fn get_bool(cursor: &mut Cursor<&[u8]>) -> Result<bool> {
    ensure(cursor, 1)?;
    Ok(cursor.get_u8() != 0)
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn get_uuid(cursor: &mut Cursor<&[u8]>) -> Result<Uuid> {
    ensure(cursor, 16)?;
    let mut raw = [0u8; 16];
    cursor.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

pub fn put_uuid(buf: &mut BytesMut, value: &Uuid) {
    buf.put_slice(value.as_bytes());
}

// ============================================================================
// Varints (KIP-482)
// ============================================================================

/// Writes an unsigned varint (LEB128).
pub fn put_unsigned_varint(buf: &mut BytesMut, value: u32) {
    let mut val = value;
    while val >= 0x80 {
        buf.put_u8((val as u8 & 0x7F) | 0x80);
        val >>= 7;
    }
    buf.put_u8(val as u8);
}

fn put_unsigned_varlong(buf: &mut BytesMut, value: u64) {
    let mut val = value;
    while val >= 0x80 {
        buf.put_u8((val as u8 & 0x7F) | 0x80);
        val >>= 7;
    }
    buf.put_u8(val as u8);
}

/// Writes a zigzag-encoded signed varint.
pub fn put_varint(buf: &mut BytesMut, value: i32) {
    put_unsigned_varint(buf, ((value << 1) ^ (value >> 31)) as u32);
}

/// Writes a zigzag-encoded signed varlong.
pub fn put_varlong(buf: &mut BytesMut, value: i64) {
    put_unsigned_varlong(buf, ((value << 1) ^ (value >> 63)) as u64);
}

fn get_unsigned_varlong_bounded(cursor: &mut Cursor<&[u8]>, max_bytes: usize) -> Result<u64> {
    let mut result = 0u64;
    for i in 0..max_bytes {
        if !cursor.has_remaining() {
            return Err(CodecError::malformed("Incomplete varint"));
        }
        let byte = cursor.get_u8();
        result |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(CodecError::malformed(format!(
        "Varint exceeds {} bytes",
        max_bytes
    )))
}

/// Reads an unsigned varint; at most 5 bytes are accepted.
pub fn get_unsigned_varint(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let value = get_unsigned_varlong_bounded(cursor, MAX_VARINT_BYTES)?;
    u32::try_from(value).map_err(|_| CodecError::malformed("Varint overflows 32 bits"))
}

/// Reads a zigzag-encoded signed varint; at most 5 bytes are accepted.
pub fn get_varint(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    let raw = get_unsigned_varint(cursor)?;
    Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
}

/// Reads a zigzag-encoded signed varlong; at most 10 bytes are accepted.
pub fn get_varlong(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    let raw = get_unsigned_varlong_bounded(cursor, MAX_VARLONG_BYTES)?;
    Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
}

pub fn unsigned_varint_size(value: u32) -> usize {
    let bits = 32 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

pub fn varint_size(value: i32) -> usize {
    unsigned_varint_size(((value << 1) ^ (value >> 31)) as u32)
}

pub fn varlong_size(value: i64) -> usize {
    let raw = ((value << 1) ^ (value >> 63)) as u64;
    let bits = 64 - raw.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

// ============================================================================
// Lengths and arrays
// ============================================================================

/// Guards collection lengths against the bytes actually left in the buffer
/// before anything gets allocated.
fn checked_len(cursor: &Cursor<&[u8]>, len: usize, min_element_size: usize) -> Result<usize> {
    if len.saturating_mul(min_element_size) > cursor.remaining() {
        return Err(CodecError::malformed(format!(
            "Length {} exceeds remaining buffer {}",
            len,
            cursor.remaining()
        )));
    }
    Ok(len)
}

/// Writes an array length; `None` encodes a null array.
pub fn put_array_len(buf: &mut BytesMut, len: Option<usize>, flexible: bool) -> Result<()> {
    match (len, flexible) {
        (None, true) => put_unsigned_varint(buf, 0),
        (None, false) => buf.put_i32(-1),
        (Some(len), true) => {
            let encoded = u32::try_from(len + 1)
                .map_err(|_| CodecError::malformed("Array too large"))?;
            put_unsigned_varint(buf, encoded);
        }
        (Some(len), false) => {
            let encoded =
                i32::try_from(len).map_err(|_| CodecError::malformed("Array too large"))?;
            buf.put_i32(encoded);
        }
    }
    Ok(())
}

/// Reads an array length; `None` is a null array.
pub fn get_array_len(cursor: &mut Cursor<&[u8]>, flexible: bool) -> Result<Option<usize>> {
    let len = if flexible {
        match get_unsigned_varint(cursor)? {
            0 => return Ok(None),
            n => (n - 1) as usize,
        }
    } else {
        match get_i32(cursor)? {
            -1 => return Ok(None),
            n if n < 0 => {
                return Err(CodecError::malformed(format!("Negative array length {}", n)))
            }
            n => n as usize,
        }
    };
    checked_len(cursor, len, 1).map(Some)
}

/// Reads a non-nullable array length; null decodes as empty.
pub fn get_array_len_or_empty(cursor: &mut Cursor<&[u8]>, flexible: bool) -> Result<usize> {
    Ok(get_array_len(cursor, flexible)?.unwrap_or(0))
}

pub fn put_i32_array(buf: &mut BytesMut, values: &[i32], flexible: bool) -> Result<()> {
    put_array_len(buf, Some(values.len()), flexible)?;
    for value in values {
        buf.put_i32(*value);
    }
    Ok(())
}

pub fn get_i32_array(cursor: &mut Cursor<&[u8]>, flexible: bool) -> Result<Vec<i32>> {
    let len = get_array_len_or_empty(cursor, flexible)?;
    checked_len(cursor, len, 4)?;
    (0..len).map(|_| get_i32(cursor)).collect()
}

// ============================================================================
// Strings
// ============================================================================

fn read_utf8(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<String> {
    ensure(cursor, len)?;
    let mut raw = vec![0u8; len];
    cursor.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|e| CodecError::malformed(format!("Invalid UTF-8: {}", e)))
}

/// Writes a string in the legacy (int16 length) or compact form.
pub fn put_string(buf: &mut BytesMut, value: &str, flexible: bool) -> Result<()> {
    put_nullable_string(buf, Some(value), flexible)
}

/// Writes a nullable string in the legacy (int16 length) or compact form.
pub fn put_nullable_string(buf: &mut BytesMut, value: Option<&str>, flexible: bool) -> Result<()> {
    match (value, flexible) {
        (None, true) => put_unsigned_varint(buf, 0),
        (None, false) => buf.put_i16(-1),
        (Some(s), true) => {
            let encoded = u32::try_from(s.len() + 1)
                .map_err(|_| CodecError::malformed("String too long"))?;
            put_unsigned_varint(buf, encoded);
            buf.put_slice(s.as_bytes());
        }
        (Some(s), false) => {
            let len = i16::try_from(s.len()).map_err(|_| {
                CodecError::malformed(format!("String of {} bytes exceeds int16 length", s.len()))
            })?;
            buf.put_i16(len);
            buf.put_slice(s.as_bytes());
        }
    }
    Ok(())
}

pub fn get_nullable_string(cursor: &mut Cursor<&[u8]>, flexible: bool) -> Result<Option<String>> {
    let len = if flexible {
        match get_unsigned_varint(cursor)? {
            0 => return Ok(None),
            n => (n - 1) as usize,
        }
    } else {
        match get_i16(cursor)? {
            -1 => return Ok(None),
            n if n < 0 => {
                return Err(CodecError::malformed(format!("Negative string length {}", n)))
            }
            n => n as usize,
        }
    };
    read_utf8(cursor, len).map(Some)
}

pub fn get_string(cursor: &mut Cursor<&[u8]>, flexible: bool) -> Result<String> {
    get_nullable_string(cursor, flexible)?
        .ok_or_else(|| CodecError::malformed("Expected non-null string"))
}

// ============================================================================
// Bytes
// ============================================================================

/// Writes nullable bytes in the legacy (int32 length) or compact form.
pub fn put_nullable_bytes(buf: &mut BytesMut, value: Option<&[u8]>, flexible: bool) -> Result<()> {
    match (value, flexible) {
        (None, true) => put_unsigned_varint(buf, 0),
        (None, false) => buf.put_i32(-1),
        (Some(b), true) => {
            let encoded =
                u32::try_from(b.len() + 1).map_err(|_| CodecError::malformed("Bytes too long"))?;
            put_unsigned_varint(buf, encoded);
            buf.put_slice(b);
        }
        (Some(b), false) => {
            let len = i32::try_from(b.len()).map_err(|_| CodecError::malformed("Bytes too long"))?;
            buf.put_i32(len);
            buf.put_slice(b);
        }
    }
    Ok(())
}

pub fn put_bytes(buf: &mut BytesMut, value: &[u8], flexible: bool) -> Result<()> {
    put_nullable_bytes(buf, Some(value), flexible)
}

pub fn get_nullable_bytes(cursor: &mut Cursor<&[u8]>, flexible: bool) -> Result<Option<Bytes>> {
    let len = if flexible {
        match get_unsigned_varint(cursor)? {
            0 => return Ok(None),
            n => (n - 1) as usize,
        }
    } else {
        match get_i32(cursor)? {
            -1 => return Ok(None),
            n if n < 0 => {
                return Err(CodecError::malformed(format!("Negative bytes length {}", n)))
            }
            n => n as usize,
        }
    };
    get_raw(cursor, len).map(Some)
}

pub fn get_bytes(cursor: &mut Cursor<&[u8]>, flexible: bool) -> Result<Bytes> {
    get_nullable_bytes(cursor, flexible)?
        .ok_or_else(|| CodecError::malformed("Expected non-null bytes"))
}

/// Copies `len` raw bytes out of the cursor.
pub fn get_raw(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Bytes> {
    ensure(cursor, len)?;
    let start = cursor.position() as usize;
    let out = Bytes::copy_from_slice(&cursor.get_ref()[start..start + len]);
    cursor.advance(len);
    Ok(out)
}

// ============================================================================
// Framing
// ============================================================================

/// Length-prefixed framing: every request and response on the wire is an
/// int32 size followed by that many bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaFrameCodec;

impl Decoder for KafkaFrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let message_length = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if message_length < 0 || message_length as usize > MAX_FRAME_SIZE {
            return Err(CodecError::malformed(format!(
                "Invalid message length: {}",
                message_length
            )));
        }

        let total_length = 4 + message_length as usize;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total_length);
        frame.advance(4);
        trace!("KafkaFrameCodec: decoded frame of {} bytes", frame.len());
        Ok(Some(frame.freeze()))
    }
}

impl Encoder<Bytes> for KafkaFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(CodecError::malformed(format!(
                "Frame of {} bytes exceeds maximum {}",
                item.len(),
                MAX_FRAME_SIZE
            )));
        }
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(buf: &BytesMut) -> Cursor<&[u8]> {
        Cursor::new(buf.as_ref())
    }

    #[test]
    fn test_unsigned_varint_known_encodings() {
        let cases: [(u32, &[u8]); 5] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (300, &[0xAC, 0x02]),
        ];
        for (value, expected) in cases {
            let mut buf = BytesMut::new();
            put_unsigned_varint(&mut buf, value);
            assert_eq!(buf.as_ref(), expected, "encoding {}", value);
            assert_eq!(unsigned_varint_size(value), expected.len());
            assert_eq!(get_unsigned_varint(&mut cursor(&buf)).unwrap(), value);
        }
    }

    #[test]
    fn test_zigzag_varint() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, -1);
        assert_eq!(buf.as_ref(), &[0x01]);

        buf.clear();
        put_varint(&mut buf, 1);
        assert_eq!(buf.as_ref(), &[0x02]);

        for value in [0, -1, 1, i32::MIN, i32::MAX, 63, -64, 64] {
            buf.clear();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_size(value));
            assert_eq!(get_varint(&mut cursor(&buf)).unwrap(), value);
        }
    }

    #[test]
    fn test_varlong_extremes() {
        for value in [0i64, -1, i64::MIN, i64::MAX, 1_700_000_000_000] {
            let mut buf = BytesMut::new();
            put_varlong(&mut buf, value);
            assert_eq!(buf.len(), varlong_size(value));
            assert_eq!(get_varlong(&mut cursor(&buf)).unwrap(), value);
        }

        let mut buf = BytesMut::new();
        put_varlong(&mut buf, i64::MIN);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_varint_rejects_overlong_sequence() {
        let buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        let err = get_varint(&mut cursor(&buf)).unwrap_err();
        assert!(matches!(err, CodecError::MalformedData(_)));

        let buf = BytesMut::from(&[0x80u8; 11][..]);
        let err = get_varlong(&mut cursor(&buf)).unwrap_err();
        assert!(matches!(err, CodecError::MalformedData(_)));
    }

    #[test]
    fn test_varint_rejects_32bit_overflow() {
        // Five bytes but the top byte carries more than four significant bits.
        let buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F][..]);
        assert!(matches!(
            get_unsigned_varint(&mut cursor(&buf)),
            Err(CodecError::MalformedData(_))
        ));
    }

    #[test]
    fn test_incomplete_varint() {
        let buf = BytesMut::from(&[0x80u8][..]);
        assert!(get_unsigned_varint(&mut cursor(&buf)).is_err());
    }

    #[test]
    fn test_string_forms() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hello", false).unwrap();
        assert_eq!(&buf[..2], &[0x00, 0x05]);
        assert_eq!(get_string(&mut cursor(&buf), false).unwrap(), "hello");

        buf.clear();
        put_string(&mut buf, "hello", true).unwrap();
        assert_eq!(buf[0], 6);
        assert_eq!(get_string(&mut cursor(&buf), true).unwrap(), "hello");

        buf.clear();
        put_nullable_string(&mut buf, None, true).unwrap();
        put_nullable_string(&mut buf, None, false).unwrap();
        put_nullable_string(&mut buf, Some(""), true).unwrap();
        assert_eq!(buf.as_ref(), &[0x00, 0xFF, 0xFF, 0x01]);

        let mut c = cursor(&buf);
        assert_eq!(get_nullable_string(&mut c, true).unwrap(), None);
        assert_eq!(get_nullable_string(&mut c, false).unwrap(), None);
        assert_eq!(get_nullable_string(&mut c, true).unwrap(), Some(String::new()));
    }

    #[test]
    fn test_non_nullable_string_rejects_null() {
        let mut buf = BytesMut::new();
        put_nullable_string(&mut buf, None, true).unwrap();
        assert!(get_string(&mut cursor(&buf), true).is_err());
    }

    #[test]
    fn test_bytes_forms() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, b"abc", false).unwrap();
        put_nullable_bytes(&mut buf, None, true).unwrap();
        put_bytes(&mut buf, b"", true).unwrap();

        let mut c = cursor(&buf);
        assert_eq!(get_bytes(&mut c, false).unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(get_nullable_bytes(&mut c, true).unwrap(), None);
        assert_eq!(get_bytes(&mut c, true).unwrap(), Bytes::new());
        assert!(!c.has_remaining());
    }

    #[test]
    fn test_array_lengths() {
        let mut buf = BytesMut::new();
        put_array_len(&mut buf, None, true).unwrap();
        put_array_len(&mut buf, Some(0), true).unwrap();
        put_array_len(&mut buf, None, false).unwrap();
        assert_eq!(buf.as_ref(), &[0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFF]);

        let mut c = cursor(&buf);
        assert_eq!(get_array_len(&mut c, true).unwrap(), None);
        assert_eq!(get_array_len(&mut c, true).unwrap(), Some(0));
        assert_eq!(get_array_len(&mut c, false).unwrap(), None);
    }

    #[test]
    fn test_array_length_larger_than_buffer_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32(1_000_000);
        assert!(matches!(
            get_array_len(&mut cursor(&buf), false),
            Err(CodecError::MalformedData(_))
        ));
    }

    #[test]
    fn test_frame_codec_roundtrip() {
        let mut codec = KafkaFrameCodec;
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"payload"), &mut wire)
            .unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 7]);

        let mut partial = wire.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(wire);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame, Bytes::from_static(b"payload"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_frame_codec_rejects_negative_length() {
        let mut codec = KafkaFrameCodec;
        let mut wire = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF][..]);
        assert!(codec.decode(&mut wire).is_err());
    }
}
