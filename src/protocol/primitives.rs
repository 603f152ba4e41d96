//! Primitive reader and writer for relay message bodies
//!
//! Message bodies are always little-endian, independent of the transport
//! byte order. Strings use a 7-bit length prefix, nullable values carry a
//! leading "is null" flag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Serialization errors
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("Unexpected end of stream: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid SourceZone value {0}. Legal range = [0..255]")]
    ZoneOutOfRange(u16),

    #[error("Invalid RelayTTL value {0}. Legal range = [-128..127]")]
    TtlOutOfRange(i16),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i32),

    #[error("Unknown relay outcome: {0}")]
    UnknownOutcome(u8),

    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Invalid VarInt32")]
    InvalidVarInt,

    #[error("Unsupported type header: {0}")]
    UnsupportedHeader(String),

    #[error("Length out of range: {0}")]
    LengthOverflow(i64),

    #[error(
        "Deserialization failed for RelayMessage of Id='{id}', ExtendedId='{extended_id}', \
         TypeId='{type_id}' and StreamLength='{stream_length}': {source}"
    )]
    MessageDecode {
        id: i32,
        extended_id: String,
        type_id: i16,
        stream_length: usize,
        #[source]
        source: Box<SerializationError>,
    },
}

pub type SerializationResult<T> = Result<T, SerializationError>;

/// Appends primitives to a growable buffer
#[derive(Debug, Default)]
pub struct PrimitiveWriter {
    buf: BytesMut,
}

impl PrimitiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Current write offset
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16_le(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    /// Raw bytes, no length prefix
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// i32 length (or -1 for `None`) followed by the bytes
    pub fn write_byte_array(&mut self, bytes: Option<&[u8]>) -> SerializationResult<()> {
        match bytes {
            Some(bytes) => {
                self.write_i32(checked_len(bytes.len())?);
                self.write_bytes(bytes);
            }
            None => self.write_i32(-1),
        }
        Ok(())
    }

    pub fn write_nullable_i64(&mut self, value: Option<i64>) {
        self.write_bool(value.is_none());
        if let Some(v) = value {
            self.write_i64(v);
        }
    }

    pub fn write_nullable_u8(&mut self, value: Option<u8>) {
        self.write_bool(value.is_none());
        if let Some(v) = value {
            self.write_u8(v);
        }
    }

    /// 7-bit length prefixed UTF-8; `None` goes out as "\0"
    pub fn write_string(&mut self, value: Option<&str>) {
        let value = value.unwrap_or("\0");
        let mut len = value.len() as u32;
        while len >= 0x80 {
            self.buf.put_u8((len as u8) | 0x80);
            len >>= 7;
        }
        self.buf.put_u8(len as u8);
        self.buf.put_slice(value.as_bytes());
    }

    /// Sign-magnitude varint: 6 bits in the first byte, 7 in each following one
    pub fn write_var_i32(&mut self, value: i32) {
        let mut magnitude = value.unsigned_abs();

        let mut first = (magnitude & 0x3F) as u8;
        if magnitude >= 0x40 {
            first |= 0x80;
        }
        if value < 0 {
            first |= 0x40;
        }
        self.buf.put_u8(first);
        magnitude >>= 6;

        if magnitude > 0 {
            while magnitude >= 0x80 {
                self.buf.put_u8(0x80 | (magnitude & 0x7F) as u8);
                magnitude >>= 7;
            }
            self.buf.put_u8(magnitude as u8);
        }
    }

    /// Write a zeroed i32 and return its offset for a later `patch_i32`
    pub fn reserve_i32(&mut self) -> usize {
        let position = self.position();
        self.write_i32(0);
        position
    }

    /// Overwrite an i32 previously written at `position`
    pub fn patch_i32(&mut self, position: usize, value: i32) {
        debug_assert!(position + 4 <= self.buf.len());
        self.buf[position..position + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn patch_i16(&mut self, position: usize, value: i16) {
        debug_assert!(position + 2 <= self.buf.len());
        self.buf[position..position + 2].copy_from_slice(&value.to_le_bytes());
    }
}

pub(crate) fn checked_len(len: usize) -> SerializationResult<i32> {
    i32::try_from(len).map_err(|_| SerializationError::LengthOverflow(len as i64))
}

/// Cursor over an encoded body
#[derive(Debug, Clone)]
pub struct PrimitiveReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PrimitiveReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Total length of the underlying stream
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Move the cursor to an absolute offset
    pub fn seek(&mut self, position: usize) -> SerializationResult<()> {
        if position > self.data.len() {
            return Err(SerializationError::UnexpectedEof {
                needed: position - self.pos.min(position),
                remaining: self.remaining(),
            });
        }
        self.pos = position;
        Ok(())
    }

    fn take(&mut self, n: usize) -> SerializationResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(SerializationError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_bool(&mut self) -> SerializationResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u8(&mut self) -> SerializationResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16(&mut self) -> SerializationResult<i16> {
        Ok(self.take(2)?.get_i16_le())
    }

    pub fn read_u16(&mut self) -> SerializationResult<u16> {
        Ok(self.take(2)?.get_u16_le())
    }

    pub fn read_i32(&mut self) -> SerializationResult<i32> {
        Ok(self.take(4)?.get_i32_le())
    }

    pub fn read_i64(&mut self) -> SerializationResult<i64> {
        Ok(self.take(8)?.get_i64_le())
    }

    pub fn read_bytes(&mut self, n: usize) -> SerializationResult<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Read an i32 length that must not be negative
    pub fn read_len(&mut self) -> SerializationResult<usize> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| SerializationError::LengthOverflow(len as i64))
    }

    pub fn read_nullable_i64(&mut self) -> SerializationResult<Option<i64>> {
        if self.read_bool()? {
            Ok(None)
        } else {
            self.read_i64().map(Some)
        }
    }

    pub fn read_nullable_u8(&mut self) -> SerializationResult<Option<u8>> {
        if self.read_bool()? {
            Ok(None)
        } else {
            self.read_u8().map(Some)
        }
    }

    pub fn read_string(&mut self) -> SerializationResult<Option<String>> {
        let mut len: u32 = 0;
        let mut shift = 0;
        loop {
            if shift > 28 {
                return Err(SerializationError::InvalidValue(
                    "string length prefix too long".to_string(),
                ));
            }
            let byte = self.read_u8()?;
            len |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let bytes = self.read_bytes(len as usize)?;
        let value = String::from_utf8(bytes)?;
        if value == "\0" {
            Ok(None)
        } else {
            Ok(Some(value))
        }
    }

    pub fn read_var_i32(&mut self) -> SerializationResult<i32> {
        let mut part = self.read_u8()?;
        let negative = part & 0x40 != 0;
        let mut value = u64::from(part & 0x3F);
        let mut bits = 6;

        while part & 0x80 != 0 {
            if bits > 32 {
                return Err(SerializationError::InvalidVarInt);
            }
            part = self.read_u8()?;
            value |= u64::from(part & 0x7F) << bits;
            bits += 7;
        }

        let value = value as u32 as i32;
        Ok(if negative { value.wrapping_neg() } else { value })
    }
}

/// Uppercase hex, used in diagnostics
pub fn to_hex(bytes: Option<&[u8]>) -> String {
    match bytes {
        Some(bytes) => bytes.iter().map(|b| format!("{:02X}", b)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_int_sizes() {
        let cases = [
            (0, 1),
            (63, 1),
            (-63, 1),
            (64, 2),
            (8191, 2),
            (-8191, 2),
            (1_048_575, 3),
            (134_217_727, 4),
            (i32::MAX, 5),
            (i32::MIN, 5),
        ];

        for (value, size) in cases {
            let mut writer = PrimitiveWriter::new();
            writer.write_var_i32(value);
            assert_eq!(writer.position(), size, "encoded size of {}", value);

            let bytes = writer.into_bytes();
            let mut reader = PrimitiveReader::new(&bytes);
            assert_eq!(reader.read_var_i32().unwrap(), value);
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn test_var_int_rejects_overlong() {
        let bytes = [0x80u8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut reader = PrimitiveReader::new(&bytes);
        assert!(matches!(
            reader.read_var_i32(),
            Err(SerializationError::InvalidVarInt)
        ));
    }

    #[test]
    fn test_null_string_marker() {
        let mut writer = PrimitiveWriter::new();
        writer.write_string(None);
        writer.write_string(Some("zone 3"));
        writer.write_string(Some(""));
        let bytes = writer.into_bytes();

        assert_eq!(&bytes[..2], &[1, 0]);

        let mut reader = PrimitiveReader::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), None);
        assert_eq!(reader.read_string().unwrap().as_deref(), Some("zone 3"));
        assert_eq!(reader.read_string().unwrap().as_deref(), Some(""));
    }

    #[test]
    fn test_long_string_prefix() {
        let long = "x".repeat(300);
        let mut writer = PrimitiveWriter::new();
        writer.write_string(Some(&long));
        let bytes = writer.into_bytes();

        // 300 = 0b10_0101100 -> [0xAC, 0x02]
        assert_eq!(&bytes[..2], &[0xAC, 0x02]);
        let mut reader = PrimitiveReader::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), Some(long));
    }

    #[test]
    fn test_nullable_header_means_null() {
        let mut writer = PrimitiveWriter::new();
        writer.write_nullable_i64(None);
        writer.write_nullable_i64(Some(-5));
        writer.write_nullable_u8(Some(9));
        let bytes = writer.into_bytes();

        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 0);

        let mut reader = PrimitiveReader::new(&bytes);
        assert_eq!(reader.read_nullable_i64().unwrap(), None);
        assert_eq!(reader.read_nullable_i64().unwrap(), Some(-5));
        assert_eq!(reader.read_nullable_u8().unwrap(), Some(9));
    }

    #[test]
    fn test_reserve_and_patch() {
        let mut writer = PrimitiveWriter::new();
        writer.write_u8(7);
        let at = writer.reserve_i32();
        writer.write_i64(1);
        let written = (writer.position() - at - 4) as i32;
        writer.patch_i32(at, written);
        let bytes = writer.into_bytes();

        let mut reader = PrimitiveReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_i32().unwrap(), 8);
    }

    #[test]
    fn test_truncated_read_reports_eof() {
        let bytes = [1u8, 2];
        let mut reader = PrimitiveReader::new(&bytes);
        match reader.read_i32() {
            Err(SerializationError::UnexpectedEof { needed, remaining }) => {
                assert_eq!(needed, 4);
                assert_eq!(remaining, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_hex() {
        assert_eq!(to_hex(Some(&[0x0A, 0xFF])), "0AFF");
        assert_eq!(to_hex(None), "");
    }
}
