use std::path::Path;
use std::sync::Arc;

use rkv_types::{KvError, LogIndex};

use crate::codec::{decode, encode};
use crate::keys::{index_from_log_key, log_key, META_HARD_STATE, META_LAST_PURGED, META_SNAPSHOT};
use crate::traits::LogStorage;
use crate::types::{HardState, LogEntry, LogState, SnapshotBlob};

fn fjall_err(e: fjall::Error) -> KvError {
    KvError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> KvError {
    KvError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore — shared handle wrapping both keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// Both keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches (purge + last_purged marker) are atomic.
pub struct FjallStore {
    pub db: fjall::Database,
    /// Log entries: `index(8)` → bincode(LogEntry)
    pub log: fjall::Keyspace,
    /// Hard state, purge marker and snapshot: `label_utf8` → bincode(value)
    pub meta: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, KvError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let log = db.keyspace("log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, log, meta }))
    }

    fn read_meta<T: for<'de> serde::Deserialize<'de>>(
        &self,
        label: &str,
    ) -> Result<Option<T>, KvError> {
        match self.meta.get(label.as_bytes().to_vec()).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<T>(&b)?)),
            None => Ok(None),
        }
    }

    fn log_keys(&self, from: LogIndex, to_inclusive: LogIndex) -> Result<Vec<Vec<u8>>, KvError> {
        let start = log_key(from).to_vec();
        let end = log_key(to_inclusive).to_vec();
        self.log
            .range(start..=end)
            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FjallLogStorage
// ---------------------------------------------------------------------------

/// `LogStorage` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallLogStorage(pub Arc<FjallStore>);

impl LogStorage for FjallLogStorage {
    async fn log_state(&self) -> Result<LogState, KvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<LogState, KvError> {
            let mut first_index: Option<LogIndex> = None;
            let mut last_index: Option<LogIndex> = None;

            let start = log_key(0).to_vec();
            let end = log_key(LogIndex::MAX).to_vec();
            for guard in store.log.range(start..=end) {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                let idx = index_from_log_key(&k)
                    .ok_or_else(|| KvError::Storage("malformed log key".into()))?;
                if first_index.is_none() {
                    first_index = Some(idx);
                }
                last_index = Some(idx);
            }

            let last_purged_index = store.read_meta::<LogIndex>(META_LAST_PURGED)?;
            Ok(LogState { first_index, last_index, last_purged_index })
        })
        .await
        .map_err(join_err)?
    }

    async fn get_entries(
        &self,
        from: LogIndex,
        to_inclusive: LogIndex,
    ) -> Result<Vec<LogEntry>, KvError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogEntry>, KvError> {
            let start = log_key(from).to_vec();
            let end = log_key(to_inclusive).to_vec();
            store
                .log
                .range(start..=end)
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<LogEntry>(&v)))
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), KvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KvError> {
            let mut batch = store.db.batch();
            for entry in &entries {
                batch.insert(&store.log, log_key(entry.index).to_vec(), encode(entry)?);
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn truncate(&self, from_index: LogIndex) -> Result<(), KvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KvError> {
            let keys = store.log_keys(from_index, LogIndex::MAX)?;
            if !keys.is_empty() {
                let mut batch = store.db.batch();
                for k in keys {
                    batch.remove(&store.log, k);
                }
                batch.commit().map_err(fjall_err)?;
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn purge(&self, up_to_index: LogIndex) -> Result<(), KvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KvError> {
            let keys = store.log_keys(0, up_to_index)?;
            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.log, k);
            }
            batch.insert(&store.meta, META_LAST_PURGED.as_bytes().to_vec(), encode(&up_to_index)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn save_hard_state(&self, state: HardState) -> Result<(), KvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KvError> {
            store.meta.insert(META_HARD_STATE.as_bytes().to_vec(), encode(&state)?).map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn read_hard_state(&self) -> Result<Option<HardState>, KvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || store.read_meta::<HardState>(META_HARD_STATE))
            .await
            .map_err(join_err)?
    }

    async fn save_snapshot(&self, snapshot: SnapshotBlob) -> Result<(), KvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KvError> {
            store.meta.insert(META_SNAPSHOT.as_bytes().to_vec(), encode(&snapshot)?).map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn read_snapshot(&self) -> Result<Option<SnapshotBlob>, KvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || store.read_meta::<SnapshotBlob>(META_SNAPSHOT))
            .await
            .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
