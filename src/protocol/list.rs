//! Batch containers split by reply expectation

use bytes::Bytes;

use super::formatter::RelayCodec;
use super::message::RelayMessage;
use super::primitives::{PrimitiveReader, PrimitiveWriter, SerializationResult};
use super::types::MessageType;
use super::versioned::VersionSerializable;

/// Messages partitioned into one-way (`in_messages`) and two-way (`out_messages`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageList {
    pub in_messages: Vec<RelayMessage>,
    pub out_messages: Vec<RelayMessage>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: RelayMessage) {
        if message.is_two_way() {
            self.out_messages.push(message);
        } else {
            self.in_messages.push(message);
        }
    }

    pub fn len(&self) -> usize {
        self.in_messages.len() + self.out_messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<RelayMessage> for MessageList {
    fn from_iter<I: IntoIterator<Item = RelayMessage>>(iter: I) -> Self {
        let mut list = MessageList::new();
        for message in iter {
            list.push(message);
        }
        list
    }
}

/// An encoded relay message kept as bytes until someone needs to look inside
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedRelayMessage {
    pub message_type: MessageType,
    pub payload_length: i32,
    pub stream: Option<Bytes>,
}

impl SerializedRelayMessage {
    pub fn from_message(codec: &RelayCodec, message: &RelayMessage) -> SerializationResult<Self> {
        let stream = codec.write_relay_message(message)?;
        Ok(Self {
            message_type: message.message_type,
            payload_length: super::primitives::checked_len(message.payload_len())?,
            stream: Some(stream),
        })
    }

    pub fn is_two_way(&self) -> bool {
        self.message_type.is_two_way()
    }

    /// Decode the held stream
    pub fn decode(&self, codec: &RelayCodec) -> SerializationResult<Option<RelayMessage>> {
        self.stream
            .as_deref()
            .map(|bytes| codec.read_relay_message(bytes))
            .transpose()
    }
}

impl VersionSerializable for SerializedRelayMessage {
    fn current_version(&self) -> u8 {
        1
    }

    fn serialize(&self, writer: &mut PrimitiveWriter) -> SerializationResult<()> {
        writer.write_i32(self.message_type as i32);
        writer.write_i32(self.payload_length);
        writer.write_byte_array(self.stream.as_deref())
    }

    fn deserialize(reader: &mut PrimitiveReader<'_>, _version: u8) -> SerializationResult<Self> {
        let message_type = MessageType::try_from(reader.read_i32()?)?;
        let payload_length = reader.read_i32()?;
        let len = reader.read_i32()?;
        let stream = if len >= 0 {
            Some(Bytes::from(reader.read_bytes(len as usize)?))
        } else {
            None
        };
        Ok(Self {
            message_type,
            payload_length,
            stream,
        })
    }
}

/// Batch holding one-way messages still encoded and two-way messages decoded
#[derive(Debug, Clone, Default)]
pub struct SerializedMessageList {
    pub in_messages: Vec<SerializedRelayMessage>,
    pub out_messages: Vec<RelayMessage>,
}

impl SerializedMessageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a message; one-way messages are encoded on the way in
    pub fn push(&mut self, codec: &RelayCodec, message: RelayMessage) -> SerializationResult<()> {
        if message.is_two_way() {
            self.out_messages.push(message);
        } else {
            self.in_messages
                .push(SerializedRelayMessage::from_message(codec, &message)?);
        }
        Ok(())
    }

    pub fn push_serialized(&mut self, message: SerializedRelayMessage) {
        self.in_messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.in_messages.len() + self.out_messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
