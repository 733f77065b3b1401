use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use rkv_types::{KvError, LogIndex};

use crate::traits::LogStorage;
use crate::types::{HardState, LogEntry, LogState, SnapshotBlob};

struct MemLogInner {
    entries: BTreeMap<LogIndex, LogEntry>,
    last_purged: Option<LogIndex>,
    hard_state: Option<HardState>,
    snapshot: Option<SnapshotBlob>,
}

/// In-memory `LogStorage` backed by a `BTreeMap`.
///
/// Intended for tests. Sharing one instance between two logs stands in for
/// a restart against the same disk.
pub struct MemLogStorage {
    inner: Arc<RwLock<MemLogInner>>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        MemLogStorage {
            inner: Arc::new(RwLock::new(MemLogInner {
                entries: BTreeMap::new(),
                last_purged: None,
                hard_state: None,
                snapshot: None,
            })),
        }
    }
}

impl Default for MemLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemLogStorage {
    async fn log_state(&self) -> Result<LogState, KvError> {
        let g = self.inner.read().await;
        Ok(LogState {
            first_index: g.entries.keys().next().copied(),
            last_index: g.entries.keys().next_back().copied(),
            last_purged_index: g.last_purged,
        })
    }

    async fn get_entries(
        &self,
        from: LogIndex,
        to_inclusive: LogIndex,
    ) -> Result<Vec<LogEntry>, KvError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let g = self.inner.read().await;
        Ok(g.entries.range(from..=to_inclusive).map(|(_, e)| e.clone()).collect())
    }

    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), KvError> {
        let mut g = self.inner.write().await;
        for entry in entries {
            g.entries.insert(entry.index, entry);
        }
        Ok(())
    }

    async fn truncate(&self, from_index: LogIndex) -> Result<(), KvError> {
        let mut g = self.inner.write().await;
        g.entries.retain(|&idx, _| idx < from_index);
        Ok(())
    }

    async fn purge(&self, up_to_index: LogIndex) -> Result<(), KvError> {
        let mut g = self.inner.write().await;
        g.entries.retain(|&idx, _| idx > up_to_index);
        g.last_purged = Some(up_to_index);
        Ok(())
    }

    async fn save_hard_state(&self, state: HardState) -> Result<(), KvError> {
        self.inner.write().await.hard_state = Some(state);
        Ok(())
    }

    async fn read_hard_state(&self) -> Result<Option<HardState>, KvError> {
        Ok(self.inner.read().await.hard_state)
    }

    async fn save_snapshot(&self, snapshot: SnapshotBlob) -> Result<(), KvError> {
        self.inner.write().await.snapshot = Some(snapshot);
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Option<SnapshotBlob>, KvError> {
        Ok(self.inner.read().await.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use rkv_types::Command;

    use super::*;

    fn make_entry(index: u64, term: u64) -> LogEntry {
        LogEntry { index, term, command: Command::put(1, index, "k", "v") }
    }

    #[tokio::test]
    async fn log_storage_basic() {
        let store = MemLogStorage::new();

        let state = store.log_state().await.unwrap();
        assert!(state.first_index.is_none());
        assert!(state.last_index.is_none());
        assert!(state.last_purged_index.is_none());

        store
            .append(vec![make_entry(1, 1), make_entry(2, 1), make_entry(3, 1)])
            .await
            .unwrap();

        let state = store.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(1));
        assert_eq!(state.last_index, Some(3));

        let entries = store.get_entries(1, 2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(store.get_entries(3, 2).await.unwrap().is_empty());

        store.truncate(3).await.unwrap();
        let state = store.log_state().await.unwrap();
        assert_eq!(state.last_index, Some(2));

        store.purge(1).await.unwrap();
        let state = store.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(2));
        assert_eq!(state.last_purged_index, Some(1));
    }

    #[tokio::test]
    async fn append_overwrites_same_index() {
        let store = MemLogStorage::new();
        store.append(vec![make_entry(1, 1)]).await.unwrap();
        store
            .append(vec![LogEntry { index: 1, term: 2, command: Command::get(2, 1, "k") }])
            .await
            .unwrap();

        let entries = store.get_entries(1, 1).await.unwrap();
        assert_eq!(entries[0].term, 2);
        assert_eq!(entries[0].command.client_id, 2);
    }

    #[tokio::test]
    async fn hard_state_and_snapshot() {
        let store = MemLogStorage::new();
        assert!(store.read_hard_state().await.unwrap().is_none());
        assert!(store.read_snapshot().await.unwrap().is_none());

        let hs = HardState { term: 3, commit_index: 7 };
        store.save_hard_state(hs).await.unwrap();
        assert_eq!(store.read_hard_state().await.unwrap(), Some(hs));

        store
            .save_snapshot(SnapshotBlob {
                last_index: 7,
                last_term: 3,
                snapshot_id: "s".into(),
                data: vec![1, 2, 3],
            })
            .await
            .unwrap();
        let snap = store.read_snapshot().await.unwrap().unwrap();
        assert_eq!(snap.last_index, 7);
        assert_eq!(snap.data, vec![1, 2, 3]);
    }
}
