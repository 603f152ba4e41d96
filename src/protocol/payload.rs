//! Cached object payload carried by relay messages

use super::primitives::{PrimitiveReader, PrimitiveWriter, SerializationResult};
use super::versioned::VersionSerializable;
use super::{now_ticks, TICKS_PER_SECOND};

/// Object bytes plus storage metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPayload {
    pub type_id: i16,
    pub id: i32,
    pub extended_id: Option<Vec<u8>>,
    pub byte_array: Option<Vec<u8>>,
    pub compressed: bool,
    pub last_updated_ticks: i64,
    ttl: i32,
    expiration_ticks: i64,
}

impl Default for RelayPayload {
    fn default() -> Self {
        Self {
            type_id: 0,
            id: 0,
            extended_id: None,
            byte_array: None,
            compressed: false,
            last_updated_ticks: 0,
            ttl: -1,
            expiration_ticks: -1,
        }
    }
}

impl RelayPayload {
    /// Create a payload stamped with the current time. `ttl_seconds` of -1 never expires.
    pub fn new(type_id: i16, id: i32, byte_array: Vec<u8>, compressed: bool, ttl_seconds: i32) -> Self {
        let mut payload = Self {
            type_id,
            id,
            byte_array: Some(byte_array),
            compressed,
            last_updated_ticks: now_ticks(),
            ..Default::default()
        };
        payload.set_ttl(ttl_seconds);
        payload
    }

    pub fn with_extended_id(mut self, extended_id: Vec<u8>) -> Self {
        self.extended_id = Some(extended_id);
        self
    }

    pub fn ttl(&self) -> i32 {
        self.ttl
    }

    /// Set the TTL and recompute the expiration from now
    pub fn set_ttl(&mut self, ttl_seconds: i32) {
        self.ttl = ttl_seconds;
        self.expiration_ticks = if ttl_seconds == -1 {
            -1
        } else {
            now_ticks() + i64::from(ttl_seconds) * TICKS_PER_SECOND
        };
    }

    /// Absolute expiration in ticks, -1 when the payload never expires
    pub fn expiration_ticks(&self) -> i64 {
        self.expiration_ticks
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration_ticks != -1 && self.expiration_ticks <= now
    }

    pub fn len(&self) -> usize {
        self.byte_array.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VersionSerializable for RelayPayload {
    fn current_version(&self) -> u8 {
        if self.extended_id.is_none() {
            1
        } else {
            2
        }
    }

    fn serialize(&self, writer: &mut PrimitiveWriter) -> SerializationResult<()> {
        writer.write_i16(self.type_id);
        writer.write_i32(self.id);
        writer.write_i64(self.last_updated_ticks);
        writer.write_bool(self.compressed);
        writer.write_i32(self.ttl);
        writer.write_i64(self.expiration_ticks);
        writer.write_byte_array(self.byte_array.as_deref())?;

        if let Some(extended_id) = &self.extended_id {
            writer.write_byte_array(Some(extended_id))?;
        }
        Ok(())
    }

    fn deserialize(reader: &mut PrimitiveReader<'_>, version: u8) -> SerializationResult<Self> {
        let type_id = reader.read_i16()?;
        let id = reader.read_i32()?;
        let last_updated_ticks = reader.read_i64()?;
        let compressed = reader.read_bool()?;
        let ttl = reader.read_i32()?;
        let expiration_ticks = reader.read_i64()?;

        let byte_length = reader.read_i32()?;
        let byte_array = if byte_length > 0 {
            Some(reader.read_bytes(byte_length as usize)?)
        } else {
            None
        };

        let extended_id = if version > 1 {
            let len = reader.read_len()?;
            Some(reader.read_bytes(len)?)
        } else {
            None
        };

        Ok(Self {
            type_id,
            id,
            extended_id,
            byte_array,
            compressed,
            last_updated_ticks,
            ttl,
            expiration_ticks,
        })
    }
}
