//! Bridges socket commands to relay message processing

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::network::{HandlerResult, MessageHandler};
use crate::protocol::{RelayCodec, RelayMessage, RelayOutcome, SocketCommand};

/// Runtime statistics reported by one data component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRuntimeInfo {
    pub name: String,
    /// Objects currently held
    pub items: u64,
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
}

/// Answer to `GetRuntimeInfo`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub node: String,
    pub zone: u16,
    pub components: Vec<ComponentRuntimeInfo>,
}

/// Applies relay operations. Outcomes are written onto the message.
#[async_trait]
pub trait DataHandler: Send + Sync + 'static {
    async fn handle_message(&self, message: &mut RelayMessage);

    async fn handle_messages(&self, messages: &mut [RelayMessage]) {
        for message in messages.iter_mut() {
            self.handle_message(message).await;
        }
    }

    fn runtime_info(&self) -> Vec<ComponentRuntimeInfo>;
}

/// `MessageHandler` decoding relay messages for a `DataHandler`
pub struct RelayMessageHandler<D> {
    data: Arc<D>,
    codec: RelayCodec,
    node: String,
    zone: u16,
}

impl<D: DataHandler> RelayMessageHandler<D> {
    pub fn new(data: Arc<D>, codec: RelayCodec, node: impl Into<String>, zone: u16) -> Self {
        Self {
            data,
            codec,
            node: node.into(),
            zone,
        }
    }

    pub fn data(&self) -> &Arc<D> {
        &self.data
    }

    fn runtime_info(&self) -> RuntimeInfo {
        RuntimeInfo {
            node: self.node.clone(),
            zone: self.zone,
            components: self.data.runtime_info(),
        }
    }
}

fn mark_received(message: &mut RelayMessage) {
    message.result_outcome = Some(RelayOutcome::Received);
}

#[async_trait]
impl<D: DataHandler> MessageHandler for RelayMessageHandler<D> {
    async fn handle_message(
        &self,
        command_id: i16,
        payload: &[u8],
        peer: SocketAddr,
    ) -> HandlerResult<Option<Bytes>> {
        match SocketCommand::from(command_id) {
            SocketCommand::HandleOneWayMessage => {
                let mut message = self.codec.read_relay_message(payload)?;
                tracing::debug!("{} from {}", message, peer);
                self.data.handle_message(&mut message).await;
                Ok(None)
            }
            SocketCommand::HandleOneWayMessages => {
                let mut messages = self
                    .codec
                    .read_relay_message_list(payload, None::<fn(&mut RelayMessage)>)?;
                tracing::debug!("{} one-way messages from {}", messages.len(), peer);
                self.data.handle_messages(&mut messages).await;
                Ok(None)
            }
            SocketCommand::HandleSyncMessage => {
                let mut message = self.codec.read_relay_message(payload)?;
                mark_received(&mut message);
                tracing::debug!("{} from {}", message, peer);
                self.data.handle_message(&mut message).await;
                Ok(Some(self.codec.write_relay_message(&message)?))
            }
            SocketCommand::HandleSyncMessages => {
                let mut messages = self
                    .codec
                    .read_relay_message_list(payload, Some(mark_received))?;
                tracing::debug!("{} sync messages from {}", messages.len(), peer);
                self.data.handle_messages(&mut messages).await;
                Ok(Some(self.codec.write_relay_message_list(&messages)?))
            }
            SocketCommand::GetRuntimeInfo => {
                let info = serde_json::to_vec(&self.runtime_info())?;
                Ok(Some(Bytes::from(info)))
            }
            SocketCommand::Unknown => {
                tracing::warn!("Unhandled command {} from {}", command_id, peer);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::HandlerError;
    use crate::protocol::{MessageType, RelayPayload};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(MessageType, Option<RelayOutcome>)>>,
    }

    #[async_trait]
    impl DataHandler for Recorder {
        async fn handle_message(&self, message: &mut RelayMessage) {
            self.seen
                .lock()
                .push((message.message_type, message.result_outcome));
            if message.is_two_way() {
                message.result_outcome = Some(RelayOutcome::Success);
            }
        }

        fn runtime_info(&self) -> Vec<ComponentRuntimeInfo> {
            vec![ComponentRuntimeInfo {
                name: "recorder".to_string(),
                items: self.seen.lock().len() as u64,
                counters: BTreeMap::new(),
            }]
        }
    }

    fn handler() -> RelayMessageHandler<Recorder> {
        RelayMessageHandler::new(Arc::new(Recorder::default()), RelayCodec::default(), "node-a", 3)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn test_default_handle_messages_visits_each() {
        let recorder = Recorder::default();
        let mut batch = vec![
            RelayMessage::new(1, 1, MessageType::Get),
            RelayMessage::new(1, 2, MessageType::Save),
        ];
        tokio_test::block_on(recorder.handle_messages(&mut batch));

        assert_eq!(recorder.seen.lock().len(), 2);
        assert_eq!(batch[0].result_outcome, Some(RelayOutcome::Success));
        assert_eq!(batch[1].result_outcome, None);
    }

    #[tokio::test]
    async fn test_one_way_message_has_no_reply() {
        let handler = handler();
        let codec = RelayCodec::default();
        let message = RelayMessage::new(1, 2, MessageType::Delete);
        let payload = codec.write_relay_message(&message).unwrap();

        let reply = handler
            .handle_message(SocketCommand::HandleOneWayMessage.id(), &payload, peer())
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(
            handler.data().seen.lock().as_slice(),
            &[(MessageType::Delete, None)]
        );
    }

    #[tokio::test]
    async fn test_sync_message_marked_received_before_handling() {
        let handler = handler();
        let codec = RelayCodec::default();
        let message = RelayMessage::with_payload(
            MessageType::SaveWithConfirm,
            RelayPayload::new(7, 42, vec![1, 2, 3], false, 60),
        );
        let payload = codec.write_relay_message(&message).unwrap();

        let reply = handler
            .handle_message(SocketCommand::HandleSyncMessage.id(), &payload, peer())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            handler.data().seen.lock()[0],
            (MessageType::SaveWithConfirm, Some(RelayOutcome::Received))
        );

        let answered = codec.read_relay_message(&reply).unwrap();
        assert_eq!(answered.result_outcome, Some(RelayOutcome::Success));
        assert_eq!(answered.id, 42);
    }

    #[tokio::test]
    async fn test_message_lists() {
        let handler = handler();
        let codec = RelayCodec::default();
        let messages = vec![
            RelayMessage::new(1, 1, MessageType::Get),
            RelayMessage::new(1, 2, MessageType::Get),
        ];
        let payload = codec.write_relay_message_list(&messages).unwrap();

        let reply = handler
            .handle_message(SocketCommand::HandleSyncMessages.id(), &payload, peer())
            .await
            .unwrap()
            .unwrap();
        let answered = codec
            .read_relay_message_list(&reply, None::<fn(&mut RelayMessage)>)
            .unwrap();
        assert_eq!(answered.len(), 2);
        assert!(answered
            .iter()
            .all(|m| m.result_outcome == Some(RelayOutcome::Success)));

        let reply = handler
            .handle_message(SocketCommand::HandleOneWayMessages.id(), &payload, peer())
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(handler.data().seen.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_runtime_info_is_json() {
        let handler = handler();
        let reply = handler
            .handle_message(SocketCommand::GetRuntimeInfo.id(), &[], peer())
            .await
            .unwrap()
            .unwrap();
        let info: RuntimeInfo = serde_json::from_slice(&reply).unwrap();
        assert_eq!(info.node, "node-a");
        assert_eq!(info.zone, 3);
        assert_eq!(info.components[0].name, "recorder");
    }

    #[tokio::test]
    async fn test_unknown_command_and_bad_payload() {
        let handler = handler();
        assert!(handler
            .handle_message(77, b"whatever", peer())
            .await
            .unwrap()
            .is_none());

        let result = handler
            .handle_message(SocketCommand::HandleSyncMessage.id(), &[1, 2], peer())
            .await;
        assert!(matches!(result, Err(HandlerError::Serialization(_))));
        assert!(handler.data().seen.lock().is_empty());
    }
}
