//! Wire-stable enumerations of the relay protocol

use std::fmt;

use super::primitives::SerializationError;

/// Relay operation. Ordinals are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum MessageType {
    #[default]
    Undefined = 0,
    Get = 1,
    Save = 2,
    Delete = 3,
    DeleteInAllTypes = 4,
    DeleteAllInType = 5,
    DeleteAll = 6,
    Update = 7,
    Query = 8,
    Invoke = 9,
    Notification = 10,
    Increment = 11,
    SaveWithConfirm = 12,
    UpdateWithConfirm = 13,
    DeleteWithConfirm = 14,
    DeleteAllInTypeWithConfirm = 15,
    DeleteAllWithConfirm = 16,
    DeleteInAllTypesWithConfirm = 17,
    NotificationWithConfirm = 18,
    IncrementWithConfirm = 19,
}

impl MessageType {
    pub const ALL: [MessageType; 20] = [
        MessageType::Undefined,
        MessageType::Get,
        MessageType::Save,
        MessageType::Delete,
        MessageType::DeleteInAllTypes,
        MessageType::DeleteAllInType,
        MessageType::DeleteAll,
        MessageType::Update,
        MessageType::Query,
        MessageType::Invoke,
        MessageType::Notification,
        MessageType::Increment,
        MessageType::SaveWithConfirm,
        MessageType::UpdateWithConfirm,
        MessageType::DeleteWithConfirm,
        MessageType::DeleteAllInTypeWithConfirm,
        MessageType::DeleteAllWithConfirm,
        MessageType::DeleteInAllTypesWithConfirm,
        MessageType::NotificationWithConfirm,
        MessageType::IncrementWithConfirm,
    ];

    /// Whether the sender waits for a reply
    pub fn is_two_way(self) -> bool {
        matches!(
            self,
            MessageType::Get
                | MessageType::Query
                | MessageType::Invoke
                | MessageType::SaveWithConfirm
                | MessageType::UpdateWithConfirm
                | MessageType::DeleteWithConfirm
                | MessageType::DeleteAllInTypeWithConfirm
                | MessageType::DeleteAllWithConfirm
                | MessageType::DeleteInAllTypesWithConfirm
                | MessageType::NotificationWithConfirm
                | MessageType::IncrementWithConfirm
        )
    }

    /// Whether the operation goes to every node of a cluster
    pub fn is_cluster_broadcast(self) -> bool {
        matches!(
            self,
            MessageType::DeleteAllInType
                | MessageType::DeleteAll
                | MessageType::DeleteAllWithConfirm
                | MessageType::DeleteAllInTypeWithConfirm
        )
    }

    /// Whether the operation goes to every type group
    pub fn is_group_broadcast(self) -> bool {
        matches!(
            self,
            MessageType::DeleteInAllTypes
                | MessageType::DeleteAll
                | MessageType::DeleteAllWithConfirm
                | MessageType::DeleteInAllTypesWithConfirm
        )
    }

    /// Whether a reply may carry a payload back to the sender
    pub fn allows_return_payload(self) -> bool {
        matches!(
            self,
            MessageType::Get | MessageType::Query | MessageType::Invoke
        )
    }

    /// Whether this is the WithConfirm form of a mutating type
    pub fn is_confirmed(self) -> bool {
        self.unconfirmed() != self
    }

    /// The fire-and-forget form of a confirmed type, or the type itself
    pub fn unconfirmed(self) -> MessageType {
        match self {
            MessageType::SaveWithConfirm => MessageType::Save,
            MessageType::UpdateWithConfirm => MessageType::Update,
            MessageType::DeleteWithConfirm => MessageType::Delete,
            MessageType::DeleteAllInTypeWithConfirm => MessageType::DeleteAllInType,
            MessageType::DeleteAllWithConfirm => MessageType::DeleteAll,
            MessageType::DeleteInAllTypesWithConfirm => MessageType::DeleteInAllTypes,
            MessageType::NotificationWithConfirm => MessageType::Notification,
            MessageType::IncrementWithConfirm => MessageType::Increment,
            other => other,
        }
    }

    /// The confirmed form of a mutating type, if one exists
    pub fn with_confirm(self) -> Option<MessageType> {
        match self {
            MessageType::Save => Some(MessageType::SaveWithConfirm),
            MessageType::Update => Some(MessageType::UpdateWithConfirm),
            MessageType::Delete => Some(MessageType::DeleteWithConfirm),
            MessageType::DeleteAllInType => Some(MessageType::DeleteAllInTypeWithConfirm),
            MessageType::DeleteAll => Some(MessageType::DeleteAllWithConfirm),
            MessageType::DeleteInAllTypes => Some(MessageType::DeleteInAllTypesWithConfirm),
            MessageType::Notification => Some(MessageType::NotificationWithConfirm),
            MessageType::Increment => Some(MessageType::IncrementWithConfirm),
            _ => None,
        }
    }
}

impl TryFrom<i32> for MessageType {
    type Error = SerializationError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|i| MessageType::ALL.get(i).copied())
            .ok_or(SerializationError::UnknownMessageType(value))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a relay operation, carried as data on the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayOutcome {
    NotSent = 0,
    Success = 1,
    Received = 2,
    Error = 3,
    NotSupported = 4,
    StillFresh = 5,
    Nonexistent = 6,
    Queued = 7,
    Timeout = 8,
    Persisted = 9,
    Denied = 10,
}

impl TryFrom<u8> for RelayOutcome {
    type Error = SerializationError;

    fn try_from(value: u8) -> Result<Self, SerializationError> {
        Ok(match value {
            0 => RelayOutcome::NotSent,
            1 => RelayOutcome::Success,
            2 => RelayOutcome::Received,
            3 => RelayOutcome::Error,
            4 => RelayOutcome::NotSupported,
            5 => RelayOutcome::StillFresh,
            6 => RelayOutcome::Nonexistent,
            7 => RelayOutcome::Queued,
            8 => RelayOutcome::Timeout,
            9 => RelayOutcome::Persisted,
            10 => RelayOutcome::Denied,
            other => return Err(SerializationError::UnknownOutcome(other)),
        })
    }
}

impl fmt::Display for RelayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transport-level failure classification. Never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayErrorType {
    #[default]
    None,
    NodeUnreachable,
    NodeInDangerZone,
    NoNodesAvailable,
    TimedOut,
    ComponentSpecific,
    Unknown,
}

/// How a hydration component derives a key from a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum RelayKeyType {
    #[default]
    Int32 = 0,
    ByteArray = 1,
    String = 2,
}

impl TryFrom<i32> for RelayKeyType {
    type Error = SerializationError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RelayKeyType::Int32),
            1 => Ok(RelayKeyType::ByteArray),
            2 => Ok(RelayKeyType::String),
            other => Err(SerializationError::InvalidValue(format!(
                "unknown key type {}",
                other
            ))),
        }
    }
}

/// Hydration behavior flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HydrationOptions(i32);

impl HydrationOptions {
    pub const NONE: HydrationOptions = HydrationOptions(0);
    pub const HYDRATE_ON_MISS: HydrationOptions = HydrationOptions(1);
    pub const HYDRATE_ON_BULK_MISS: HydrationOptions = HydrationOptions(2);
    pub const HYDRATE_ALL: HydrationOptions = HydrationOptions(3);

    pub fn to_bits(self) -> i32 {
        self.0
    }

    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: HydrationOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for HydrationOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Key type plus hydration flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HydrationPolicy {
    pub key_type: RelayKeyType,
    pub options: HydrationOptions,
}

impl HydrationPolicy {
    pub fn new(key_type: RelayKeyType, options: HydrationOptions) -> Self {
        Self { key_type, options }
    }

    /// Policy implied by the single hydrate flag of version 6 streams
    pub fn legacy_default() -> Self {
        Self {
            key_type: RelayKeyType::Int32,
            options: HydrationOptions::HYDRATE_ALL,
        }
    }
}
