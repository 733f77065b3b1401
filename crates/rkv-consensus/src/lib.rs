mod local;

use std::future::Future;

use rkv_types::{Command, KvError, LogIndex, Term};

pub use local::LocalLog;

/// Where a proposed command landed in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: LogIndex,
    pub term: Term,
}

/// Point-in-time view of this replica's role. Never cache it beyond one
/// decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStatus {
    pub term: Term,
    pub is_leader: bool,
    /// Address of the node believed to lead, if known.
    pub leader_hint: Option<String>,
}

impl LogStatus {
    pub fn not_leader_error(&self) -> KvError {
        KvError::NotLeader { leader: self.leader_hint.clone() }
    }
}

/// Messages on the commit stream, in log order.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    /// A committed command.
    Command { index: LogIndex, term: Term, command: Command },
    /// A state-machine snapshot covering every index up to `index`; sent on
    /// restart before any later command.
    Snapshot { index: LogIndex, term: Term, data: Vec<u8> },
}

impl ApplyMsg {
    pub fn index(&self) -> LogIndex {
        match self {
            ApplyMsg::Command { index, .. } | ApplyMsg::Snapshot { index, .. } => *index,
        }
    }
}

// ---------------------------------------------------------------------------
// CommandLog trait
// Uses RPITIT (Return Position Impl Trait In Trait, stable since Rust 1.75).
// The explicit `+ Send` bound on each future ensures generic callers can
// `.await` across thread boundaries.
//
// Committed entries are not pulled through this trait: every implementation
// takes an `mpsc::UnboundedSender<ApplyMsg>` at construction and pushes the
// commit stream into it.
// ---------------------------------------------------------------------------

pub trait CommandLog: Send + Sync + 'static {
    /// Append `command` if this replica leads. Does not wait for commit.
    /// Fails with `KvError::NotLeader` when nothing will ever commit for it.
    fn propose(
        &self,
        command: Command,
    ) -> impl Future<Output = Result<Proposal, KvError>> + Send;

    fn status(&self) -> impl Future<Output = LogStatus> + Send;

    /// Approximate bytes of committed log retained since the last snapshot.
    /// Uncommitted entries are not counted: no snapshot can reclaim them.
    fn state_size(&self) -> impl Future<Output = usize> + Send;

    /// Store an opaque state-machine snapshot covering `index` and discard
    /// the log prefix it replaces. `Ok(false)` when an existing snapshot
    /// already covers `index` and nothing was compacted.
    fn snapshot(
        &self,
        index: LogIndex,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<bool, KvError>> + Send;
}
