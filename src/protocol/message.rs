//! Relay message definition and its versioned wire layout
//!
//! Body layout, in order: identity, packed zone/TTL, a legacy marker, address
//! history, payload, extended id, query or notification fields, and from
//! version 5 a length-prefixed extension block that older readers skip.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use super::payload::RelayPayload;
use super::primitives::{
    to_hex, PrimitiveReader, PrimitiveWriter, SerializationError, SerializationResult,
};
use super::types::{
    HydrationOptions, HydrationPolicy, MessageType, RelayErrorType, RelayKeyType, RelayOutcome,
};
use super::versioned::{read_object, write_object, VersionSerializable};

/// Version written by current peers
pub const CURRENT_MESSAGE_VERSION: u8 = 7;

/// First version carrying the extension block
pub const EXTENSION_BLOCK_VERSION: u8 = 5;

/// Default hop budget for a freshly built message
pub const DEFAULT_RELAY_TTL: i16 = 2;

/// Marker a legacy peer writes where current peers write 0
const LEGACY_SERIALIZATION_MARKER: i32 = -1;

const MAX_BYTES_TO_PRINT: usize = 32;

/// One relay operation plus routing metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub type_id: i16,
    pub id: i32,
    pub extended_id: Option<Vec<u8>>,
    pub message_type: MessageType,
    pub relay_ttl: i16,
    pub source_zone: u16,
    pub priority: i32,
    /// Ticks of the cached copy the sender already holds
    pub freshness: Option<i64>,
    pub address_history: Option<Vec<Ipv4Addr>>,
    pub payload: Option<RelayPayload>,
    pub query_id: u8,
    pub query_data_compressed: bool,
    pub query_data: Option<Vec<u8>>,
    pub notification_id: u8,
    pub hydration_policy: Option<HydrationPolicy>,
    pub error_type: RelayErrorType,
    pub result_outcome: Option<RelayOutcome>,
    pub result_details: Option<String>,
    pub using_legacy_serialization: bool,
}

impl Default for RelayMessage {
    fn default() -> Self {
        Self {
            type_id: 0,
            id: 0,
            extended_id: None,
            message_type: MessageType::Undefined,
            relay_ttl: DEFAULT_RELAY_TTL,
            source_zone: 0,
            priority: 0,
            freshness: None,
            address_history: None,
            payload: None,
            query_id: 0,
            query_data_compressed: false,
            query_data: None,
            notification_id: 0,
            hydration_policy: None,
            error_type: RelayErrorType::None,
            result_outcome: None,
            result_details: None,
            using_legacy_serialization: false,
        }
    }
}

impl RelayMessage {
    pub fn new(type_id: i16, id: i32, message_type: MessageType) -> Self {
        Self {
            type_id,
            id,
            message_type,
            ..Default::default()
        }
    }

    /// Message carrying a payload; identity is taken from the payload
    pub fn with_payload(message_type: MessageType, payload: RelayPayload) -> Self {
        Self {
            type_id: payload.type_id,
            id: payload.id,
            extended_id: payload.extended_id.clone(),
            message_type,
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn with_extended_id(mut self, extended_id: Vec<u8>) -> Self {
        self.extended_id = Some(extended_id);
        self
    }

    pub fn with_query(mut self, query_id: u8, query_data: Vec<u8>, compressed: bool) -> Self {
        self.query_id = query_id;
        self.query_data = Some(query_data);
        self.query_data_compressed = compressed;
        self
    }

    pub fn is_two_way(&self) -> bool {
        self.message_type.is_two_way()
    }

    pub fn is_cluster_broadcast(&self) -> bool {
        self.message_type.is_cluster_broadcast()
    }

    pub fn is_group_broadcast(&self) -> bool {
        self.message_type.is_group_broadcast()
    }

    pub fn allows_return_payload(&self) -> bool {
        self.message_type.allows_return_payload()
    }

    pub fn is_confirmed(&self) -> bool {
        self.message_type.is_confirmed()
    }

    /// Return to the freshly constructed state
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Derive the message forwarded into another zone; the hop counter grows by one
    pub fn create_inter_zone_message_from(message: &RelayMessage) -> RelayMessage {
        RelayMessage {
            type_id: message.type_id,
            id: message.id,
            extended_id: message.extended_id.clone(),
            message_type: message.message_type,
            result_details: message.result_details.clone(),
            result_outcome: message.result_outcome,
            freshness: message.freshness,
            using_legacy_serialization: message.using_legacy_serialization,
            payload: message.payload.clone(),
            source_zone: message.source_zone,
            relay_ttl: message.relay_ttl.saturating_add(1),
            address_history: message.address_history.clone(),
            ..Default::default()
        }
    }

    pub fn originates_directly_from_client(&self, server_zone: u16) -> bool {
        self.relay_ttl > 0 && self.source_zone == server_zone
    }

    /// Clear any result state before the message goes out
    pub fn prepare_message_to_be_sent(&mut self, use_legacy_serialization: bool) {
        self.set_error(RelayErrorType::None);
        self.result_outcome = None;
        self.result_details = None;
        self.using_legacy_serialization = use_legacy_serialization;
    }

    pub fn set_error(&mut self, error: RelayErrorType) {
        self.error_type = error;
        if error != RelayErrorType::None {
            self.result_outcome = Some(RelayOutcome::Error);
        }
    }

    /// Classify a transport failure seen by the sending side
    pub fn set_error_from_io(&mut self, error: &io::Error) {
        match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable => {
                self.set_error(RelayErrorType::NodeUnreachable);
                self.result_details = Some(format!("client: {}", error));
            }
            io::ErrorKind::TimedOut => {
                self.set_error(RelayErrorType::TimedOut);
                self.result_outcome = Some(RelayOutcome::Timeout);
                self.result_details = Some(format!("client: {}", error));
            }
            _ => self.set_error(RelayErrorType::Unknown),
        }
    }

    /// Copy the result of a server reply onto this request
    pub fn extract_response(&mut self, response: RelayMessage) {
        if self.allows_return_payload() {
            self.payload = response.payload;
        }
        self.result_outcome = Some(response.result_outcome.unwrap_or(RelayOutcome::NotSupported));
        self.result_details = response.result_details;
    }

    pub fn add_address_to_history(&mut self, address: Ipv4Addr) {
        self.address_history
            .get_or_insert_with(|| Vec::with_capacity(3))
            .push(address);
    }

    pub fn caching_key(&self) -> String {
        format!("{}_{}", self.type_id, self.id)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, RelayPayload::len)
    }

    fn read_body(&mut self, reader: &mut PrimitiveReader<'_>, version: u8) -> SerializationResult<()> {
        self.type_id = reader.read_i16()?;
        self.id = reader.read_i32()?;
        self.message_type = MessageType::try_from(reader.read_i32()?)?;
        let (zone, ttl) = unpack_zone_and_ttl(reader.read_u16()?);
        self.source_zone = zone;
        self.relay_ttl = ttl;

        self.using_legacy_serialization = reader.read_i32()? == LEGACY_SERIALIZATION_MARKER;

        if reader.read_bool()? {
            let count = reader.read_i16()?;
            let count = usize::try_from(count)
                .map_err(|_| SerializationError::LengthOverflow(i64::from(count)))?;
            let mut history = Vec::with_capacity(count);
            for _ in 0..count {
                let b = reader.read_bytes(4)?;
                history.push(Ipv4Addr::new(b[0], b[1], b[2], b[3]));
            }
            self.address_history = Some(history);
        }

        if reader.read_bool()? {
            self.payload = read_object::<RelayPayload>(reader)?;
        }

        if version > 1 {
            if version >= 4 && !reader.read_bool()? {
                self.extended_id = None;
            } else {
                let len = reader.read_len()?;
                self.extended_id = Some(reader.read_bytes(len)?);
            }
        }

        if version > 2
            && matches!(self.message_type, MessageType::Query | MessageType::Invoke)
        {
            self.query_id = reader.read_u8()?;
            self.query_data_compressed = reader.read_bool()?;
            let len = reader.read_i32()?;
            if len >= 0 {
                self.query_data = Some(reader.read_bytes(len as usize)?);
            }
        }

        if version > 3 && self.message_type == MessageType::Notification {
            self.notification_id = reader.read_u8()?;
        }

        if version >= EXTENSION_BLOCK_VERSION {
            let length = reader.read_len()?;
            let end = reader.position() + length;

            self.freshness = reader.read_nullable_i64()?;
            self.result_outcome = reader
                .read_nullable_u8()?
                .map(RelayOutcome::try_from)
                .transpose()?;
            self.result_details = reader.read_string()?;

            if version == 6 {
                self.hydration_policy = reader
                    .read_bool()?
                    .then(HydrationPolicy::legacy_default);
            } else if version >= 7 {
                self.hydration_policy = if reader.read_bool()? {
                    Some(HydrationPolicy {
                        key_type: RelayKeyType::try_from(reader.read_var_i32()?)?,
                        options: HydrationOptions::from_bits(reader.read_var_i32()?),
                    })
                } else {
                    None
                };
            }

            // Fields added after this reader's version are skipped
            reader.seek(end)?;
        }

        Ok(())
    }

    /// Write the body at an explicit version
    pub fn serialize_version(&self, writer: &mut PrimitiveWriter, version: u8) -> SerializationResult<()> {
        writer.write_i16(self.type_id);
        writer.write_i32(self.id);
        writer.write_i32(self.message_type as i32);
        writer.write_u16(pack_zone_and_ttl(self.source_zone, self.relay_ttl)?);
        writer.write_i32(0);

        match &self.address_history {
            Some(history) => {
                let count = i16::try_from(history.len())
                    .map_err(|_| SerializationError::LengthOverflow(history.len() as i64))?;
                writer.write_bool(true);
                writer.write_i16(count);
                for address in history {
                    writer.write_bytes(&address.octets());
                }
            }
            None => writer.write_bool(false),
        }

        match &self.payload {
            Some(payload) => {
                writer.write_bool(true);
                write_object(writer, Some(payload), false)?;
            }
            None => writer.write_bool(false),
        }

        match &self.extended_id {
            Some(extended_id) if version > 1 => {
                if version >= 4 {
                    writer.write_bool(true);
                }
                writer.write_byte_array(Some(extended_id))?;
            }
            None if version >= 4 => writer.write_bool(false),
            // Reads back as an empty id rather than none
            None if version >= 2 => writer.write_i32(0),
            _ => {}
        }

        match self.message_type {
            MessageType::Query | MessageType::Invoke if version > 2 => {
                writer.write_u8(self.query_id);
                writer.write_bool(self.query_data_compressed);
                writer.write_byte_array(self.query_data.as_deref())?;
            }
            MessageType::Notification if version > 3 => writer.write_u8(self.notification_id),
            _ => {}
        }

        if !self.using_legacy_serialization && version >= EXTENSION_BLOCK_VERSION {
            let length_at = writer.reserve_i32();

            writer.write_nullable_i64(self.freshness);
            writer.write_nullable_u8(self.result_outcome.map(|o| o as u8));
            writer.write_string(self.result_details.as_deref());

            if version == 6 {
                writer.write_bool(self.hydration_policy.map_or(false, |p| {
                    p.options.contains(HydrationOptions::HYDRATE_ON_MISS)
                }));
            } else if version >= 7 {
                match &self.hydration_policy {
                    Some(policy) => {
                        writer.write_bool(true);
                        writer.write_var_i32(policy.key_type as i32);
                        writer.write_var_i32(policy.options.to_bits());
                    }
                    None => writer.write_bool(false),
                }
            }

            let length = super::primitives::checked_len(writer.position() - length_at - 4)?;
            writer.patch_i32(length_at, length);
        }

        Ok(())
    }
}

impl VersionSerializable for RelayMessage {
    fn current_version(&self) -> u8 {
        if !self.using_legacy_serialization {
            return CURRENT_MESSAGE_VERSION;
        }
        match self.message_type {
            MessageType::Notification => 4,
            MessageType::Query | MessageType::Invoke => 3,
            _ if self.extended_id.is_none() => 1,
            _ => 2,
        }
    }

    fn serialize(&self, writer: &mut PrimitiveWriter) -> SerializationResult<()> {
        self.serialize_version(writer, self.current_version())
    }

    fn deserialize(reader: &mut PrimitiveReader<'_>, version: u8) -> SerializationResult<Self> {
        let mut message = RelayMessage::default();
        match message.read_body(reader, version) {
            Ok(()) => Ok(message),
            Err(source) => Err(SerializationError::MessageDecode {
                id: message.id,
                extended_id: to_hex(message.extended_id.as_deref()),
                type_id: message.type_id,
                stream_length: reader.len(),
                source: Box::new(source),
            }),
        }
    }
}

/// Pack zone into the high byte and TTL into the low byte
pub fn pack_zone_and_ttl(source_zone: u16, relay_ttl: i16) -> SerializationResult<u16> {
    if source_zone > 255 {
        return Err(SerializationError::ZoneOutOfRange(source_zone));
    }
    if !(-128..=127).contains(&relay_ttl) {
        return Err(SerializationError::TtlOutOfRange(relay_ttl));
    }
    Ok((source_zone << 8) | u16::from(relay_ttl as i8 as u8))
}

/// Inverse of `pack_zone_and_ttl`; the TTL byte is sign-extended
pub fn unpack_zone_and_ttl(packed: u16) -> (u16, i16) {
    (packed >> 8, i16::from((packed & 0x00FF) as u8 as i8))
}

fn append_bytes(f: &mut fmt::Formatter<'_>, name: &str, bytes: Option<&[u8]>) -> fmt::Result {
    let Some(bytes) = bytes else {
        return Ok(());
    };
    write!(f, " {} ", name)?;
    if bytes.len() > MAX_BYTES_TO_PRINT {
        write!(f, "{} Bytes.", bytes.len())
    } else {
        write!(f, "{}", to_hex(Some(bytes)))
    }
}

impl fmt::Display for RelayMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RelayMessage {} TTL {} Source Zone {}",
            self.message_type, self.relay_ttl, self.source_zone
        )?;

        match self.message_type.unconfirmed() {
            MessageType::Update
            | MessageType::Delete
            | MessageType::Get
            | MessageType::Save
            | MessageType::Query
            | MessageType::Invoke
            | MessageType::Notification
            | MessageType::Increment => {
                write!(f, " ID {} TypeId {}", self.id, self.type_id)?;
                append_bytes(f, "ExtendedId", self.extended_id.as_deref())?;

                if self.message_type == MessageType::Query {
                    write!(f, " QueryId {} QueryData ", self.query_id)?;
                    if self.query_data.is_none() {
                        write!(f, "null")?;
                    } else {
                        append_bytes(f, "QueryData", self.query_data.as_deref())?;
                    }
                    write!(f, " QueryDataCompressed {}", self.query_data_compressed)?;
                } else if self.message_type.unconfirmed() == MessageType::Notification {
                    write!(f, " NotificationId {}", self.notification_id)?;
                }
            }
            MessageType::DeleteAllInType => write!(f, " TypeId {}", self.type_id)?,
            MessageType::DeleteInAllTypes => {
                write!(f, " ID {}", self.id)?;
                append_bytes(f, "ExtendedId", self.extended_id.as_deref())?;
            }
            _ => {}
        }

        if let Some(payload) = &self.payload {
            append_bytes(f, "Payload", payload.byte_array.as_deref())?;
        }

        if let Some(history) = self.address_history.as_ref().filter(|h| !h.is_empty()) {
            write!(f, " From")?;
            for (i, address) in history.iter().enumerate() {
                write!(f, " {}", address)?;
                if i + 1 < history.len() {
                    write!(f, ",")?;
                }
            }
        }

        Ok(())
    }
}
