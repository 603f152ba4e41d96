//! Relay message client over a socket connection

use bytes::Bytes;
use std::net::SocketAddr;

use super::handler::RuntimeInfo;
use super::{RelayError, RelayResult};
use crate::config::{ClientConfig, RelayConfig};
use crate::network::{ClientError, SocketClient};
use crate::protocol::{RelayCodec, RelayMessage, RelayOutcome, SocketCommand};

/// Sends relay messages to one server and folds the replies back in
pub struct RelayClient {
    socket: SocketClient,
    codec: RelayCodec,
    legacy_serialization: bool,
}

impl RelayClient {
    pub async fn connect(
        server_addr: SocketAddr,
        client: ClientConfig,
        relay: &RelayConfig,
    ) -> RelayResult<Self> {
        let socket = SocketClient::connect(server_addr, client).await?;
        Ok(Self::from_socket(socket, relay))
    }

    pub fn from_socket(socket: SocketClient, relay: &RelayConfig) -> Self {
        Self {
            socket,
            codec: relay.codec(),
            legacy_serialization: relay.legacy_serialization,
        }
    }

    pub fn socket(&self) -> &SocketClient {
        &self.socket
    }

    /// Send one message. Two-way messages wait for the server's answer and
    /// take its outcome; transport failures are recorded on the message too.
    pub async fn send(&self, message: &mut RelayMessage) -> RelayResult<()> {
        message.prepare_message_to_be_sent(self.legacy_serialization);
        let payload = self.codec.write_relay_message(message)?;

        if !message.is_two_way() {
            let sent = self
                .socket
                .send_oneway(SocketCommand::HandleOneWayMessage.id(), payload)
                .await;
            return record_failure(sent, std::slice::from_mut(message));
        }

        let reply = self
            .socket
            .send_sync(SocketCommand::HandleSyncMessage.id(), payload)
            .await;
        match record_failure(reply, std::slice::from_mut(message))? {
            Some(bytes) => {
                let response = self.codec.read_relay_message(&bytes)?;
                message.extract_response(response);
            }
            None => mark_empty_reply(message),
        }
        Ok(())
    }

    /// Send a batch: one-way messages in one frame, two-way messages in another
    pub async fn send_list(&self, messages: &mut [RelayMessage]) -> RelayResult<()> {
        let mut one_way = Vec::new();
        let mut two_way = Vec::new();
        for (index, message) in messages.iter_mut().enumerate() {
            message.prepare_message_to_be_sent(self.legacy_serialization);
            if message.is_two_way() {
                two_way.push(index);
            } else {
                one_way.push(index);
            }
        }

        if !one_way.is_empty() {
            let batch: Vec<RelayMessage> = one_way.iter().map(|&i| messages[i].clone()).collect();
            let payload = self.codec.write_relay_message_list(&batch)?;
            let sent = self
                .socket
                .send_oneway(SocketCommand::HandleOneWayMessages.id(), payload)
                .await;
            if let Err(e) = sent {
                let io = e.to_io_error();
                for &i in &one_way {
                    messages[i].set_error_from_io(&io);
                }
                return Err(e.into());
            }
        }

        if two_way.is_empty() {
            return Ok(());
        }

        let batch: Vec<RelayMessage> = two_way.iter().map(|&i| messages[i].clone()).collect();
        let payload = self.codec.write_relay_message_list(&batch)?;
        let reply = match self
            .socket
            .send_sync(SocketCommand::HandleSyncMessages.id(), payload)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                let io = e.to_io_error();
                for &i in &two_way {
                    messages[i].set_error_from_io(&io);
                }
                return Err(e.into());
            }
        };

        let responses = match reply {
            Some(bytes) => self
                .codec
                .read_relay_message_list(&bytes, None::<fn(&mut RelayMessage)>)?,
            None => Vec::new(),
        };
        if responses.len() != two_way.len() {
            tracing::warn!(
                "Expected {} responses, server answered {}",
                two_way.len(),
                responses.len()
            );
        }

        let mut responses = responses.into_iter();
        for &i in &two_way {
            match responses.next() {
                Some(response) => messages[i].extract_response(response),
                None => mark_empty_reply(&mut messages[i]),
            }
        }
        Ok(())
    }

    /// Fetch the server's component statistics
    pub async fn get_runtime_info(&self) -> RelayResult<RuntimeInfo> {
        let reply = self
            .socket
            .send_sync(SocketCommand::GetRuntimeInfo.id(), Bytes::new())
            .await?;
        let bytes = reply.ok_or(RelayError::EmptyReply)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn close(&self) {
        self.socket.close().await;
    }
}

fn record_failure<T>(result: Result<T, ClientError>, messages: &mut [RelayMessage]) -> RelayResult<T> {
    result.map_err(|e| {
        let io = e.to_io_error();
        for message in messages.iter_mut() {
            message.set_error_from_io(&io);
        }
        RelayError::Client(e)
    })
}

fn mark_empty_reply(message: &mut RelayMessage) {
    message.result_outcome = Some(RelayOutcome::Error);
    message.result_details = Some("server sent an empty reply".to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::network::SocketServer;
    use crate::protocol::{MessageType, RelayErrorType, RelayPayload};
    use crate::relay::{MemoryStore, RelayMessageHandler};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    async fn start_store() -> (SocketServer, Arc<MemoryStore>, SocketAddr) {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(RelayMessageHandler::new(
            store.clone(),
            RelayCodec::default(),
            "test-node",
            1,
        ));
        let config = ServerConfig {
            port: 0,
            bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            connection_check_interval_secs: 0,
            ..Default::default()
        };
        let mut server = SocketServer::new(config, handler);
        let addr = server.start().await.unwrap();
        (server, store, addr)
    }

    async fn client(addr: SocketAddr) -> RelayClient {
        RelayClient::connect(addr, ClientConfig::default(), &RelayConfig::default())
            .await
            .unwrap()
    }

    /// One-way messages have no reply to wait on
    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let (_server, store, addr) = start_store().await;
        let client = client(addr).await;

        let mut save = RelayMessage::with_payload(
            MessageType::SaveWithConfirm,
            RelayPayload::new(7, 42, vec![1, 2, 3], false, 60),
        );
        save.result_outcome = Some(RelayOutcome::Denied);
        client.send(&mut save).await.unwrap();
        assert_eq!(save.result_outcome, Some(RelayOutcome::Success));
        assert_eq!(store.len(), 1);

        let mut get = RelayMessage::new(7, 42, MessageType::Get);
        client.send(&mut get).await.unwrap();
        assert_eq!(get.result_outcome, Some(RelayOutcome::Success));
        let payload = get.payload.unwrap();
        assert_eq!(payload.byte_array.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(payload.ttl(), 60);
    }

    #[tokio::test]
    async fn test_one_way_delete() {
        let (_server, store, addr) = start_store().await;
        let client = client(addr).await;

        let mut save = RelayMessage::with_payload(
            MessageType::Save,
            RelayPayload::new(1, 1, vec![5], false, -1),
        );
        client.send(&mut save).await.unwrap();
        assert_eq!(save.result_outcome, None);
        wait_for(|| store.len() == 1).await;

        let mut delete = RelayMessage::new(1, 1, MessageType::Delete);
        client.send(&mut delete).await.unwrap();
        wait_for(|| store.is_empty()).await;
    }

    #[tokio::test]
    async fn test_get_missing_keeps_no_payload() {
        let (_server, _store, addr) = start_store().await;
        let client = client(addr).await;

        let mut get = RelayMessage::new(3, 9, MessageType::Get);
        client.send(&mut get).await.unwrap();
        assert_eq!(get.result_outcome, Some(RelayOutcome::Nonexistent));
        assert!(get.payload.is_none());
    }

    #[tokio::test]
    async fn test_send_list_splits_batch() {
        let (_server, store, addr) = start_store().await;
        let client = client(addr).await;

        let mut messages = vec![
            RelayMessage::with_payload(
                MessageType::SaveWithConfirm,
                RelayPayload::new(2, 1, b"one".to_vec(), false, -1),
            ),
            RelayMessage::with_payload(
                MessageType::Save,
                RelayPayload::new(2, 2, b"two".to_vec(), false, -1),
            ),
            RelayMessage::new(2, 3, MessageType::Get),
        ];
        client.send_list(&mut messages).await.unwrap();

        assert_eq!(messages[0].result_outcome, Some(RelayOutcome::Success));
        assert_eq!(messages[1].result_outcome, None);
        assert_eq!(messages[2].result_outcome, Some(RelayOutcome::Nonexistent));
        wait_for(|| store.len() == 2).await;
    }

    #[tokio::test]
    async fn test_runtime_info() {
        let (_server, _store, addr) = start_store().await;
        let client = client(addr).await;

        let info = client.get_runtime_info().await.unwrap();
        assert_eq!(info.node, "test-node");
        assert_eq!(info.zone, 1);
        assert_eq!(info.components[0].name, "memory_store");
    }

    #[tokio::test]
    async fn test_transport_failure_recorded_on_message() {
        let (mut server, _store, addr) = start_store().await;
        let client = client(addr).await;
        server.stop().await.unwrap();
        client.close().await;

        let mut get = RelayMessage::new(1, 1, MessageType::Get);
        let result = client.send(&mut get).await;
        assert!(matches!(result, Err(RelayError::Client(_))));
        assert_eq!(get.error_type, RelayErrorType::NodeUnreachable);
        assert_eq!(get.result_outcome, Some(RelayOutcome::Error));
    }
}
