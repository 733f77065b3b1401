use std::future::Future;

use rkv_types::{KvError, LogIndex};

use crate::types::{HardState, LogEntry, LogState, SnapshotBlob};

/// Persistent storage for the command log.
///
/// Methods use RPITIT (`-> impl Future + Send`) so implementations can be
/// plain `async fn`s without an `async-trait` dependency.
pub trait LogStorage: Send + Sync + 'static {
    /// Return first index, last index, and last purged index.
    fn log_state(&self) -> impl Future<Output = Result<LogState, KvError>> + Send;

    /// Return all entries in the inclusive range `[from, to_inclusive]`.
    fn get_entries(
        &self,
        from: LogIndex,
        to_inclusive: LogIndex,
    ) -> impl Future<Output = Result<Vec<LogEntry>, KvError>> + Send;

    /// Append entries to the log, overwriting any existing entry at the same
    /// index.
    fn append(&self, entries: Vec<LogEntry>) -> impl Future<Output = Result<(), KvError>> + Send;

    /// Delete all entries with `index >= from_index`.
    fn truncate(&self, from_index: LogIndex) -> impl Future<Output = Result<(), KvError>> + Send;

    /// Delete all entries with `index <= up_to_index` (post-snapshot GC).
    /// Updates `last_purged_index`.
    fn purge(&self, up_to_index: LogIndex) -> impl Future<Output = Result<(), KvError>> + Send;

    fn save_hard_state(&self, state: HardState)
        -> impl Future<Output = Result<(), KvError>> + Send;

    fn read_hard_state(&self) -> impl Future<Output = Result<Option<HardState>, KvError>> + Send;

    /// Replace the stored snapshot.
    fn save_snapshot(&self, snapshot: SnapshotBlob)
        -> impl Future<Output = Result<(), KvError>> + Send;

    fn read_snapshot(&self) -> impl Future<Output = Result<Option<SnapshotBlob>, KvError>> + Send;
}
