//! Protocol module - Relay messages and the transport frame format
//!
//! Two layers:
//! - `codec` frames opaque payloads on the socket (start marker, length,
//!   sequence id, command id, reply flag, payload, terminator)
//! - the remaining modules define relay messages and their versioned,
//!   little-endian body encoding

mod codec;
mod command;
mod formatter;
mod list;
mod message;
mod payload;
mod primitives;
mod ticks;
mod types;
mod versioned;

pub use codec::*;
pub use command::SocketCommand;
pub use formatter::{RelayCodec, DEFAULT_MAX_COLLECTION_LEN};
pub use list::{MessageList, SerializedMessageList, SerializedRelayMessage};
pub use message::{
    pack_zone_and_ttl, unpack_zone_and_ttl, RelayMessage, CURRENT_MESSAGE_VERSION,
    DEFAULT_RELAY_TTL, EXTENSION_BLOCK_VERSION,
};
pub use payload::RelayPayload;
pub use primitives::{
    to_hex, PrimitiveReader, PrimitiveWriter, SerializationError, SerializationResult,
};
pub use ticks::{now_ticks, ticks_from_unix_secs, TICKS_PER_SECOND, UNIX_EPOCH_TICKS};
pub use types::{
    HydrationOptions, HydrationPolicy, MessageType, RelayErrorType, RelayKeyType, RelayOutcome,
};
pub use versioned::{read_object, write_object, VersionSerializable, NULL_VERSION, TYPE_HEADER_VERSION};

/// Default port for relay servers
pub const DEFAULT_PORT: u16 = 9000;
