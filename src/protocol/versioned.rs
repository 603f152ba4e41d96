//! Versioned object envelope
//!
//! A nested object is written as a version byte followed by its body. Two
//! version values are reserved: `NULL_VERSION` marks an absent object and
//! `TYPE_HEADER_VERSION` introduces a self-describing header that carries
//! the data version and the body length.

use super::primitives::{
    PrimitiveReader, PrimitiveWriter, SerializationError, SerializationResult,
};

/// Version byte written for a null object
pub const NULL_VERSION: u8 = 0xFF;

/// Version byte that introduces a type header
pub const TYPE_HEADER_VERSION: u8 = 0xFE;

const CURRENT_HEADER_VERSION: u8 = 1;

/// header version(1) + header length(2) + flags(1) + data version(1) + min version(1) + data length(4)
const TYPE_HEADER_LENGTH: i16 = 10;

/// An object whose wire layout depends on a version number
pub trait VersionSerializable: Sized {
    /// Version this instance will be written with
    fn current_version(&self) -> u8;

    /// Write the body at `current_version`
    fn serialize(&self, writer: &mut PrimitiveWriter) -> SerializationResult<()>;

    /// Read a body that was written at `version`
    fn deserialize(reader: &mut PrimitiveReader<'_>, version: u8) -> SerializationResult<Self>;
}

/// Write an optional nested object
pub fn write_object<T: VersionSerializable>(
    writer: &mut PrimitiveWriter,
    value: Option<&T>,
    with_header: bool,
) -> SerializationResult<()> {
    let Some(value) = value else {
        writer.write_u8(NULL_VERSION);
        return Ok(());
    };

    let version = value.current_version();
    debug_assert!(version < TYPE_HEADER_VERSION);

    if !with_header {
        writer.write_u8(version);
        return value.serialize(writer);
    }

    writer.write_u8(TYPE_HEADER_VERSION);
    writer.write_u8(CURRENT_HEADER_VERSION);
    writer.write_i16(TYPE_HEADER_LENGTH);
    writer.write_u8(0);
    writer.write_u8(version);
    writer.write_u8(1);
    let length_at = writer.reserve_i32();
    let data_start = writer.position();

    value.serialize(writer)?;

    let data_length = super::primitives::checked_len(writer.position() - data_start)?;
    writer.patch_i32(length_at, data_length);
    Ok(())
}

/// Read an optional nested object written by `write_object`
pub fn read_object<T: VersionSerializable>(
    reader: &mut PrimitiveReader<'_>,
) -> SerializationResult<Option<T>> {
    match reader.read_u8()? {
        NULL_VERSION => Ok(None),
        TYPE_HEADER_VERSION => read_with_header(reader).map(Some),
        version => T::deserialize(reader, version).map(Some),
    }
}

fn read_with_header<T: VersionSerializable>(
    reader: &mut PrimitiveReader<'_>,
) -> SerializationResult<T> {
    let header_start = reader.position();
    let header_version = reader.read_u8()?;
    let header_length = reader.read_i16()?;
    let flags = reader.read_u8()?;
    let data_version = reader.read_u8()?;
    let _data_min_version = reader.read_u8()?;
    let data_length = reader.read_len()?;

    if header_version > CURRENT_HEADER_VERSION {
        return Err(SerializationError::UnsupportedHeader(format!(
            "header version {} is newer than {}",
            header_version, CURRENT_HEADER_VERSION
        )));
    }
    if flags != 0 {
        return Err(SerializationError::UnsupportedHeader(format!(
            "unknown header flags {:#04x}",
            flags
        )));
    }
    let header_length = usize::try_from(header_length)
        .map_err(|_| SerializationError::LengthOverflow(header_length as i64))?;

    let data_start = header_start + header_length;
    reader.seek(data_start)?;
    let value = T::deserialize(reader, data_version)?;
    reader.seek(data_start + data_length)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Sample {
        a: i32,
        b: Option<i64>,
    }

    impl VersionSerializable for Sample {
        fn current_version(&self) -> u8 {
            if self.b.is_some() {
                2
            } else {
                1
            }
        }

        fn serialize(&self, writer: &mut PrimitiveWriter) -> SerializationResult<()> {
            writer.write_i32(self.a);
            if let Some(b) = self.b {
                writer.write_i64(b);
            }
            Ok(())
        }

        fn deserialize(reader: &mut PrimitiveReader<'_>, version: u8) -> SerializationResult<Self> {
            let a = reader.read_i32()?;
            let b = if version > 1 {
                Some(reader.read_i64()?)
            } else {
                None
            };
            Ok(Self { a, b })
        }
    }

    #[test]
    fn test_null_object() {
        let mut writer = PrimitiveWriter::new();
        write_object::<Sample>(&mut writer, None, false).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(&bytes[..], &[NULL_VERSION]);

        let mut reader = PrimitiveReader::new(&bytes);
        assert_eq!(read_object::<Sample>(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_plain_version_byte() {
        let sample = Sample { a: 3, b: Some(9) };
        let mut writer = PrimitiveWriter::new();
        write_object(&mut writer, Some(&sample), false).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(bytes[0], 2);

        let mut reader = PrimitiveReader::new(&bytes);
        assert_eq!(read_object::<Sample>(&mut reader).unwrap(), Some(sample));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_header_skips_unread_tail() {
        let sample = Sample { a: 3, b: None };
        let mut writer = PrimitiveWriter::new();
        write_object(&mut writer, Some(&sample), true).unwrap();

        // Append data the reader does not know about, then fix up the length
        writer.write_i32(0x5A5A);
        let bytes = writer.as_slice().to_vec();
        let mut patched = bytes.clone();
        let data_length = (bytes.len() - 1 - TYPE_HEADER_LENGTH as usize) as i32;
        patched[7..11].copy_from_slice(&data_length.to_le_bytes());
        patched.extend_from_slice(&[0xEE]);

        let mut reader = PrimitiveReader::new(&patched);
        assert_eq!(read_object::<Sample>(&mut reader).unwrap(), Some(sample));
        assert_eq!(reader.read_u8().unwrap(), 0xEE);
    }

    #[test]
    fn test_header_rejects_unknown_flags() {
        let sample = Sample { a: 1, b: None };
        let mut writer = PrimitiveWriter::new();
        write_object(&mut writer, Some(&sample), true).unwrap();
        let mut bytes = writer.as_slice().to_vec();
        bytes[4] = 0x01;

        let mut reader = PrimitiveReader::new(&bytes);
        assert!(matches!(
            read_object::<Sample>(&mut reader),
            Err(SerializationError::UnsupportedHeader(_))
        ));
    }
}
