//! Command ids carried in the transport frame header

/// Handler-level operation selected by a frame's command id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum SocketCommand {
    Unknown = 0,
    HandleOneWayMessage = 1,
    HandleOneWayMessages = 2,
    HandleSyncMessage = 3,
    HandleSyncMessages = 4,
    GetRuntimeInfo = 5,
}

impl SocketCommand {
    pub fn id(self) -> i16 {
        self as i16
    }

    /// Whether the sender waits for a reply
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            SocketCommand::HandleSyncMessage
                | SocketCommand::HandleSyncMessages
                | SocketCommand::GetRuntimeInfo
        )
    }
}

impl From<i16> for SocketCommand {
    fn from(id: i16) -> Self {
        match id {
            1 => SocketCommand::HandleOneWayMessage,
            2 => SocketCommand::HandleOneWayMessages,
            3 => SocketCommand::HandleSyncMessage,
            4 => SocketCommand::HandleSyncMessages,
            5 => SocketCommand::GetRuntimeInfo,
            _ => SocketCommand::Unknown,
        }
    }
}
