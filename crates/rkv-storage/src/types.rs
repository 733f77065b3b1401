use std::collections::BTreeMap;

use rkv_types::{ClientId, Command, LogIndex, Reply, SeqNo, Term};

/// A single entry in the command log.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: Command,
}

/// Term and commit cursor, persisted so a restarted log knows how much of its
/// history to replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HardState {
    pub term: Term,
    pub commit_index: LogIndex,
}

/// Summary of the current log extent.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogState {
    /// Smallest index currently in the log (`None` if log is empty).
    pub first_index: Option<LogIndex>,
    /// Largest index currently in the log (`None` if log is empty).
    pub last_index: Option<LogIndex>,
    /// Largest index that has been purged (compacted into a snapshot).
    pub last_purged_index: Option<LogIndex>,
}

/// Opaque state-machine snapshot stored alongside the log.
///
/// The log never interprets `data`; it hands it back to the state machine on
/// restart.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotBlob {
    pub last_index: LogIndex,
    pub last_term: Term,
    /// UUID v4 string identifying this snapshot.
    pub snapshot_id: String,
    pub data: Vec<u8>,
}

/// Per-client record of the last applied operation and its reply.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Session {
    pub last_seq: SeqNo,
    pub reply: Reply,
}

/// Everything a snapshot must capture: the data map plus the session table,
/// so duplicate detection survives compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StateImage {
    pub last_applied: LogIndex,
    pub data: BTreeMap<String, String>,
    pub sessions: BTreeMap<ClientId, Session>,
}
