//! In-memory data handler

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use super::handler::{ComponentRuntimeInfo, DataHandler};
use crate::protocol::{now_ticks, MessageType, RelayMessage, RelayOutcome, RelayPayload};

#[derive(Debug, Default)]
struct StoreCounters {
    saves: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    deletes: AtomicU64,
    unsupported: AtomicU64,
}

/// Payloads keyed by `"{type_id}_{id}"`
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, RelayPayload>>,
    counters: StoreCounters,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Live payload for a key, if present and not expired
    pub fn get(&self, type_id: i16, id: i32) -> Option<RelayPayload> {
        let key = format!("{}_{}", type_id, id);
        self.entries
            .read()
            .get(&key)
            .filter(|p| !p.is_expired(now_ticks()))
            .cloned()
    }

    /// Drop every expired payload, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = now_ticks();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, payload| !payload.is_expired(now));
        before - entries.len()
    }

    fn store(&self, message: &mut RelayMessage) {
        match message.payload.clone() {
            Some(payload) => {
                self.entries.write().insert(message.caching_key(), payload);
                self.counters.saves.fetch_add(1, Ordering::Relaxed);
                message.result_outcome = Some(RelayOutcome::Success);
            }
            None => {
                message.result_outcome = Some(RelayOutcome::Error);
                message.result_details = Some("no payload to store".to_string());
            }
        }
    }

    fn fetch(&self, message: &mut RelayMessage) {
        let key = message.caching_key();
        let now = now_ticks();
        let found = {
            let entries = self.entries.read();
            entries.get(&key).filter(|p| !p.is_expired(now)).cloned()
        };

        match found {
            Some(payload) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                let fresh = message
                    .freshness
                    .is_some_and(|freshness| freshness >= payload.last_updated_ticks);
                if fresh {
                    message.payload = None;
                    message.result_outcome = Some(RelayOutcome::StillFresh);
                } else {
                    message.payload = Some(payload);
                    message.result_outcome = Some(RelayOutcome::Success);
                }
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                message.payload = None;
                message.result_outcome = Some(RelayOutcome::Nonexistent);
            }
        }
    }

    fn remove_where<F>(&self, keep: F) -> usize
    where
        F: Fn(&RelayPayload) -> bool,
    {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, payload| keep(payload));
        let removed = before - entries.len();
        self.counters
            .deletes
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn apply(&self, message: &mut RelayMessage) {
        match message.message_type.unconfirmed() {
            MessageType::Save | MessageType::Update => self.store(message),
            MessageType::Get => self.fetch(message),
            MessageType::Delete => {
                let removed = self.entries.write().remove(&message.caching_key());
                if removed.is_some() {
                    self.counters.deletes.fetch_add(1, Ordering::Relaxed);
                }
                message.result_outcome = Some(RelayOutcome::Success);
            }
            MessageType::DeleteInAllTypes => {
                let id = message.id;
                self.remove_where(|p| p.id != id);
                message.result_outcome = Some(RelayOutcome::Success);
            }
            MessageType::DeleteAllInType => {
                let type_id = message.type_id;
                self.remove_where(|p| p.type_id != type_id);
                message.result_outcome = Some(RelayOutcome::Success);
            }
            MessageType::DeleteAll => {
                self.remove_where(|_| false);
                message.result_outcome = Some(RelayOutcome::Success);
            }
            other => {
                tracing::debug!("{} not supported by memory store", other);
                self.counters.unsupported.fetch_add(1, Ordering::Relaxed);
                message.result_outcome = Some(RelayOutcome::NotSupported);
            }
        }
    }
}

#[async_trait]
impl DataHandler for MemoryStore {
    async fn handle_message(&self, message: &mut RelayMessage) {
        self.apply(message);
    }

    async fn handle_messages(&self, messages: &mut [RelayMessage]) {
        for message in messages.iter_mut() {
            self.apply(message);
        }
    }

    fn runtime_info(&self) -> Vec<ComponentRuntimeInfo> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let counters = BTreeMap::from([
            ("saves".to_string(), load(&self.counters.saves)),
            ("hits".to_string(), load(&self.counters.hits)),
            ("misses".to_string(), load(&self.counters.misses)),
            ("deletes".to_string(), load(&self.counters.deletes)),
            ("unsupported".to_string(), load(&self.counters.unsupported)),
        ]);
        vec![ComponentRuntimeInfo {
            name: "memory_store".to_string(),
            items: self.len() as u64,
            counters,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn save(store: &MemoryStore, type_id: i16, id: i32, data: &[u8], ttl: i32) {
        let mut message = RelayMessage::with_payload(
            MessageType::Save,
            RelayPayload::new(type_id, id, data.to_vec(), false, ttl),
        );
        store.apply(&mut message);
        assert_eq!(message.result_outcome, Some(RelayOutcome::Success));
    }

    fn get(store: &MemoryStore, type_id: i16, id: i32) -> RelayMessage {
        let mut message = RelayMessage::new(type_id, id, MessageType::Get);
        store.apply(&mut message);
        message
    }

    #[test]
    fn test_save_then_get() {
        let store = MemoryStore::new();
        save(&store, 7, 42, &[1, 2, 3], 60);

        let message = get(&store, 7, 42);
        assert_eq!(message.result_outcome, Some(RelayOutcome::Success));
        let payload = message.payload.unwrap();
        assert_eq!(payload.byte_array.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(payload.ttl(), 60);

        let missing = get(&store, 7, 43);
        assert_eq!(missing.result_outcome, Some(RelayOutcome::Nonexistent));
        assert!(missing.payload.is_none());
    }

    #[test]
    fn test_confirmed_forms_behave_like_base() {
        let store = MemoryStore::new();
        let mut message = RelayMessage::with_payload(
            MessageType::SaveWithConfirm,
            RelayPayload::new(1, 1, vec![9], false, -1),
        );
        store.apply(&mut message);
        assert_eq!(message.result_outcome, Some(RelayOutcome::Success));
        assert_eq!(store.len(), 1);

        let mut delete = RelayMessage::new(1, 1, MessageType::DeleteWithConfirm);
        store.apply(&mut delete);
        assert_eq!(delete.result_outcome, Some(RelayOutcome::Success));
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_without_payload_is_error() {
        let store = MemoryStore::new();
        let mut message = RelayMessage::new(1, 1, MessageType::Update);
        store.apply(&mut message);
        assert_eq!(message.result_outcome, Some(RelayOutcome::Error));
        assert!(store.is_empty());
    }

    #[test]
    fn test_expired_entries_are_missing() {
        let store = MemoryStore::new();
        save(&store, 2, 5, &[1], 60);

        // Force the stored copy into the past
        if let Some(stored) = store.entries.write().get_mut("2_5") {
            stored.set_ttl(0);
        }

        assert_eq!(get(&store, 2, 5).result_outcome, Some(RelayOutcome::Nonexistent));
        assert!(store.get(2, 5).is_none());
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_freshness_answers_still_fresh() {
        let store = MemoryStore::new();
        save(&store, 3, 3, b"abc", -1);
        let stored = store.get(3, 3).unwrap();

        let mut message = RelayMessage::new(3, 3, MessageType::Get);
        message.freshness = Some(stored.last_updated_ticks);
        store.apply(&mut message);
        assert_eq!(message.result_outcome, Some(RelayOutcome::StillFresh));
        assert!(message.payload.is_none());

        let mut stale = RelayMessage::new(3, 3, MessageType::Get);
        stale.freshness = Some(stored.last_updated_ticks - 1);
        store.apply(&mut stale);
        assert_eq!(stale.result_outcome, Some(RelayOutcome::Success));
        assert!(stale.payload.is_some());
    }

    #[test]
    fn test_bulk_deletes() {
        let store = MemoryStore::new();
        save(&store, 1, 1, b"a", -1);
        save(&store, 1, 2, b"b", -1);
        save(&store, 2, 1, b"c", -1);
        save(&store, 2, 2, b"d", -1);

        let mut message = RelayMessage::new(1, 0, MessageType::DeleteAllInType);
        store.apply(&mut message);
        assert_eq!(store.len(), 2);
        assert!(store.get(2, 1).is_some());

        let mut message = RelayMessage::new(0, 1, MessageType::DeleteInAllTypesWithConfirm);
        store.apply(&mut message);
        assert_eq!(store.len(), 1);
        assert!(store.get(2, 2).is_some());

        let mut message = RelayMessage::new(0, 0, MessageType::DeleteAll);
        store.apply(&mut message);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unsupported_types() {
        let store = MemoryStore::new();
        for message_type in [
            MessageType::Increment,
            MessageType::Query,
            MessageType::Invoke,
            MessageType::NotificationWithConfirm,
        ] {
            let mut message = RelayMessage::new(1, 1, message_type);
            store.apply(&mut message);
            assert_eq!(message.result_outcome, Some(RelayOutcome::NotSupported));
        }
    }

    #[tokio::test]
    async fn test_runtime_info_counts() {
        let store = MemoryStore::new();
        save(&store, 1, 1, b"a", -1);
        get(&store, 1, 1);
        get(&store, 1, 2);

        let mut batch = vec![
            RelayMessage::new(1, 1, MessageType::Delete),
            RelayMessage::new(1, 1, MessageType::Get),
        ];
        store.handle_messages(&mut batch).await;
        assert_eq!(batch[1].result_outcome, Some(RelayOutcome::Nonexistent));

        let info = store.runtime_info();
        assert_eq!(info[0].items, 0);
        assert_eq!(info[0].counters["saves"], 1);
        assert_eq!(info[0].counters["hits"], 1);
        assert_eq!(info[0].counters["misses"], 2);
        assert_eq!(info[0].counters["deletes"], 1);
    }
}
