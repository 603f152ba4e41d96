//! Relay message stream formatter
//!
//! `RelayCodec` carries the serialization settings explicitly; nothing here
//! reads process-wide state.

use bytes::Bytes;

use super::message::RelayMessage;
use super::primitives::{PrimitiveReader, PrimitiveWriter, SerializationError, SerializationResult};
use super::versioned::{read_object, write_object};

/// Default sanity bound for list counts read off the wire
pub const DEFAULT_MAX_COLLECTION_LEN: usize = 1_000_000;

/// Encodes and decodes relay messages and message lists
#[derive(Debug, Clone, Copy)]
pub struct RelayCodec {
    /// Write nested objects with a self-describing type header
    pub write_type_header: bool,
    /// Largest list count accepted when decoding
    pub max_collection_len: usize,
}

impl Default for RelayCodec {
    fn default() -> Self {
        Self {
            write_type_header: false,
            max_collection_len: DEFAULT_MAX_COLLECTION_LEN,
        }
    }
}

impl RelayCodec {
    pub fn new(write_type_header: bool, max_collection_len: usize) -> Self {
        Self {
            write_type_header,
            max_collection_len,
        }
    }

    /// Encode one message as a versioned object
    pub fn write_relay_message(&self, message: &RelayMessage) -> SerializationResult<Bytes> {
        let mut writer = PrimitiveWriter::with_capacity(64 + message.payload_len());
        write_object(&mut writer, Some(message), self.write_type_header)?;
        Ok(writer.into_bytes())
    }

    /// Decode one message written by `write_relay_message`
    pub fn read_relay_message(&self, bytes: &[u8]) -> SerializationResult<RelayMessage> {
        let mut reader = PrimitiveReader::new(bytes);
        read_object::<RelayMessage>(&mut reader)?
            .ok_or_else(|| SerializationError::InvalidValue("null relay message".to_string()))
    }

    /// i32 count followed by each message as a versioned object
    pub fn write_relay_message_list(&self, messages: &[RelayMessage]) -> SerializationResult<Bytes> {
        let (bytes, _) = self.write_relay_message_range(messages, 0, messages.len())?;
        Ok(bytes)
    }

    /// Encode `count` messages starting at `start`, clamped to the slice.
    /// Returns the encoded bytes and how many messages they hold.
    pub fn write_relay_message_range(
        &self,
        messages: &[RelayMessage],
        start: usize,
        count: usize,
    ) -> SerializationResult<(Bytes, usize)> {
        let start = start.min(messages.len());
        let end = start.saturating_add(count).min(messages.len());
        let range = &messages[start..end];

        let mut writer = PrimitiveWriter::with_capacity(4 + range.len() * 64);
        writer.write_i32(super::primitives::checked_len(range.len())?);
        for message in range {
            write_object(&mut writer, Some(message), self.write_type_header)?;
        }
        Ok((writer.into_bytes(), range.len()))
    }

    /// Decode a message list, calling `on_each` on every decoded message
    pub fn read_relay_message_list<F>(
        &self,
        bytes: &[u8],
        mut on_each: Option<F>,
    ) -> SerializationResult<Vec<RelayMessage>>
    where
        F: FnMut(&mut RelayMessage),
    {
        let mut reader = PrimitiveReader::new(bytes);
        let count = reader.read_len()?;
        if count > self.max_collection_len {
            return Err(SerializationError::LengthOverflow(count as i64));
        }

        let mut messages = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let mut message = read_object::<RelayMessage>(&mut reader)?
                .ok_or_else(|| SerializationError::InvalidValue("null relay message in list".to_string()))?;
            if let Some(f) = on_each.as_mut() {
                f(&mut message);
            }
            messages.push(message);
        }
        Ok(messages)
    }
}
