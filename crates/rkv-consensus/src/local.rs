use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use rkv_storage::{HardState, LogEntry, LogStorage, SnapshotBlob};
use rkv_types::{Command, KvError, LogIndex, Term};

use crate::{ApplyMsg, CommandLog, LogStatus, Proposal};

/// Fixed per-entry cost added to key and value length in `state_size`.
const ENTRY_OVERHEAD: usize = 32;

fn entry_size(entry: &LogEntry) -> usize {
    ENTRY_OVERHEAD + entry.command.key.len() + entry.command.value.len()
}

struct LocalInner {
    term: Term,
    is_leader: bool,
    leader_hint: Option<String>,
    auto_commit: bool,
    last_index: LogIndex,
    commit_index: LogIndex,
    snapshot_index: LogIndex,
    sizes: BTreeMap<LogIndex, usize>,
}

/// Single-replica command log over a [`LogStorage`].
///
/// Leads by default and commits each proposal as soon as it is stored. Role,
/// term and commit progress can be scripted, which is how the replica's
/// leadership-loss and supersession paths are driven without a real cluster.
pub struct LocalLog<S> {
    storage: Arc<S>,
    inner: Mutex<LocalInner>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
}

impl<S: LogStorage> LocalLog<S> {
    /// Open the log and replay its stored snapshot plus every committed entry
    /// after it into `apply_tx`.
    pub async fn open(
        storage: Arc<S>,
        apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    ) -> Result<Self, KvError> {
        let hard = storage.read_hard_state().await?.unwrap_or_default();
        let snapshot = storage.read_snapshot().await?;
        let log_state = storage.log_state().await?;

        let snapshot_index = snapshot.as_ref().map(|s| s.last_index).unwrap_or(0);
        let last_index = log_state.last_index.unwrap_or(0).max(snapshot_index);
        let commit_index = hard.commit_index.max(snapshot_index);
        let term = hard.term.max(1);

        let entries = storage.get_entries(snapshot_index + 1, last_index).await?;
        let sizes = entries.iter().map(|e| (e.index, entry_size(e))).collect();

        if term != hard.term {
            storage.save_hard_state(HardState { term, commit_index }).await?;
        }

        let log = LocalLog {
            storage,
            inner: Mutex::new(LocalInner {
                term,
                is_leader: true,
                leader_hint: None,
                auto_commit: true,
                last_index,
                commit_index,
                snapshot_index,
                sizes,
            }),
            apply_tx,
        };

        if let Some(snap) = snapshot {
            log.deliver(ApplyMsg::Snapshot {
                index: snap.last_index,
                term: snap.last_term,
                data: snap.data,
            });
        }
        let mut replayed = 0usize;
        for entry in entries.into_iter().filter(|e| e.index <= commit_index) {
            log.deliver(ApplyMsg::Command {
                index: entry.index,
                term: entry.term,
                command: entry.command,
            });
            replayed += 1;
        }

        info!(term, commit_index, last_index, snapshot_index, replayed, "command log opened");
        Ok(log)
    }

    fn deliver(&self, msg: ApplyMsg) {
        let index = msg.index();
        if self.apply_tx.send(msg).is_err() {
            debug!(index, "apply stream closed, dropping committed entry");
        }
    }

    async fn commit_locked(&self, g: &mut LocalInner, through: LogIndex) -> Result<(), KvError> {
        let through = through.min(g.last_index);
        if through <= g.commit_index {
            return Ok(());
        }
        let entries = self.storage.get_entries(g.commit_index + 1, through).await?;
        g.commit_index = through;
        self.storage.save_hard_state(HardState { term: g.term, commit_index: through }).await?;
        for entry in entries {
            self.deliver(ApplyMsg::Command {
                index: entry.index,
                term: entry.term,
                command: entry.command,
            });
        }
        Ok(())
    }

    pub async fn set_leader(&self, is_leader: bool) {
        self.inner.lock().await.is_leader = is_leader;
    }

    pub async fn set_leader_hint(&self, hint: Option<String>) {
        self.inner.lock().await.leader_hint = hint;
    }

    /// With auto-commit off, proposals stay uncommitted until
    /// [`commit_through`](Self::commit_through).
    pub async fn set_auto_commit(&self, auto_commit: bool) {
        self.inner.lock().await.auto_commit = auto_commit;
    }

    /// Start a new term, as after an election this replica won again.
    pub async fn advance_term(&self) -> Result<Term, KvError> {
        let mut g = self.inner.lock().await;
        g.term += 1;
        self.storage
            .save_hard_state(HardState { term: g.term, commit_index: g.commit_index })
            .await?;
        info!(term = g.term, "advanced term");
        Ok(g.term)
    }

    /// Commit every stored entry up to `index` and push them to the apply
    /// stream.
    pub async fn commit_through(&self, index: LogIndex) -> Result<(), KvError> {
        let mut g = self.inner.lock().await;
        self.commit_locked(&mut g, index).await
    }

    /// Replace the uncommitted entry at `index` with `command` in the current
    /// term and drop everything after it, the way a new leader's log wins
    /// over a deposed one.
    pub async fn overwrite(&self, index: LogIndex, command: Command) -> Result<Proposal, KvError> {
        let mut g = self.inner.lock().await;
        if index <= g.commit_index || index > g.last_index + 1 {
            return Err(KvError::Consensus(format!(
                "cannot overwrite index {index}: commit index {}, last index {}",
                g.commit_index, g.last_index
            )));
        }
        let entry = LogEntry { index, term: g.term, command };
        let size = entry_size(&entry);
        self.storage.truncate(index).await?;
        self.storage.append(vec![entry]).await?;
        g.sizes.retain(|&i, _| i < index);
        g.sizes.insert(index, size);
        g.last_index = index;
        debug!(index, term = g.term, "overwrote log entry");

        let proposal = Proposal { index, term: g.term };
        if g.auto_commit {
            self.commit_locked(&mut g, index).await?;
        }
        Ok(proposal)
    }

    /// Push an already-committed entry to the apply stream again, the way a
    /// replay after restart would.
    pub async fn redeliver(&self, index: LogIndex) -> Result<(), KvError> {
        let g = self.inner.lock().await;
        if index <= g.snapshot_index || index > g.commit_index {
            return Err(KvError::Consensus(format!("index {index} is not a retained committed entry")));
        }
        for entry in self.storage.get_entries(index, index).await? {
            self.deliver(ApplyMsg::Command {
                index: entry.index,
                term: entry.term,
                command: entry.command,
            });
        }
        Ok(())
    }

    pub async fn last_index(&self) -> LogIndex {
        self.inner.lock().await.last_index
    }

    pub async fn commit_index(&self) -> LogIndex {
        self.inner.lock().await.commit_index
    }

    pub async fn snapshot_index(&self) -> LogIndex {
        self.inner.lock().await.snapshot_index
    }
}

impl<S: LogStorage> CommandLog for LocalLog<S> {
    async fn propose(&self, command: Command) -> Result<Proposal, KvError> {
        let mut g = self.inner.lock().await;
        if !g.is_leader {
            return Err(KvError::NotLeader { leader: g.leader_hint.clone() });
        }
        let index = g.last_index + 1;
        let entry = LogEntry { index, term: g.term, command };
        let size = entry_size(&entry);
        self.storage.append(vec![entry]).await?;
        g.last_index = index;
        g.sizes.insert(index, size);
        debug!(index, term = g.term, "proposed");

        let proposal = Proposal { index, term: g.term };
        if g.auto_commit {
            self.commit_locked(&mut g, index).await?;
        }
        Ok(proposal)
    }

    async fn status(&self) -> LogStatus {
        let g = self.inner.lock().await;
        LogStatus { term: g.term, is_leader: g.is_leader, leader_hint: g.leader_hint.clone() }
    }

    async fn state_size(&self) -> usize {
        let g = self.inner.lock().await;
        g.sizes.range(..=g.commit_index).map(|(_, size)| size).sum()
    }

    async fn snapshot(&self, index: LogIndex, data: Vec<u8>) -> Result<bool, KvError> {
        let mut g = self.inner.lock().await;
        if index <= g.snapshot_index {
            return Ok(false);
        }
        if index > g.commit_index {
            return Err(KvError::Consensus(format!(
                "snapshot at {index} is past commit index {}",
                g.commit_index
            )));
        }
        let last_term = self
            .storage
            .get_entries(index, index)
            .await?
            .first()
            .map(|e| e.term)
            .unwrap_or(g.term);
        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let bytes = data.len();
        self.storage
            .save_snapshot(SnapshotBlob {
                last_index: index,
                last_term,
                snapshot_id: snapshot_id.clone(),
                data,
            })
            .await?;
        self.storage.purge(index).await?;
        g.snapshot_index = index;
        g.sizes.retain(|&i, _| i > index);
        info!(index, last_term, bytes, %snapshot_id, "log compacted into snapshot");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use rkv_storage::mem::MemLogStorage;

    use super::*;

    async fn open(
        storage: Arc<MemLogStorage>,
    ) -> (LocalLog<MemLogStorage>, mpsc::UnboundedReceiver<ApplyMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LocalLog::open(storage, tx).await.unwrap(), rx)
    }

    fn committed(msg: ApplyMsg) -> (LogIndex, Command) {
        match msg {
            ApplyMsg::Command { index, command, .. } => (index, command),
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn propose_commits_immediately_in_auto_mode() {
        let (log, mut rx) = open(Arc::new(MemLogStorage::new())).await;

        let p = log.propose(Command::put(1, 1, "k", "v")).await.unwrap();
        assert_eq!(p, Proposal { index: 1, term: 1 });

        let (index, cmd) = committed(rx.try_recv().unwrap());
        assert_eq!(index, 1);
        assert_eq!(cmd, Command::put(1, 1, "k", "v"));
        assert_eq!(log.commit_index().await, 1);
    }

    #[tokio::test]
    async fn follower_rejects_proposals() {
        let (log, mut rx) = open(Arc::new(MemLogStorage::new())).await;
        log.set_leader(false).await;
        log.set_leader_hint(Some("10.0.0.2:17000".into())).await;

        let err = log.propose(Command::get(1, 1, "k")).await.unwrap_err();
        assert_eq!(err, KvError::NotLeader { leader: Some("10.0.0.2:17000".into()) });
        assert!(rx.try_recv().is_err());
        assert_eq!(log.last_index().await, 0);
    }

    #[tokio::test]
    async fn manual_commit_delivers_in_order() {
        let (log, mut rx) = open(Arc::new(MemLogStorage::new())).await;
        log.set_auto_commit(false).await;

        for seq in 1..=3 {
            log.propose(Command::append(1, seq, "k", "x")).await.unwrap();
        }
        assert!(rx.try_recv().is_err());

        log.commit_through(2).await.unwrap();
        assert_eq!(committed(rx.try_recv().unwrap()).0, 1);
        assert_eq!(committed(rx.try_recv().unwrap()).0, 2);
        assert!(rx.try_recv().is_err());

        // Committing past the end stops at the last stored entry.
        log.commit_through(10).await.unwrap();
        assert_eq!(committed(rx.try_recv().unwrap()).0, 3);
        assert_eq!(log.commit_index().await, 3);
    }

    #[tokio::test]
    async fn overwrite_replaces_uncommitted_entry() {
        let (log, mut rx) = open(Arc::new(MemLogStorage::new())).await;
        log.set_auto_commit(false).await;

        log.propose(Command::put(1, 1, "k", "mine")).await.unwrap();
        log.propose(Command::put(1, 2, "k", "later")).await.unwrap();

        let p = log.overwrite(1, Command::put(2, 1, "k", "theirs")).await.unwrap();
        assert_eq!(p.index, 1);
        assert_eq!(log.last_index().await, 1);

        log.commit_through(1).await.unwrap();
        let (_, cmd) = committed(rx.try_recv().unwrap());
        assert_eq!(cmd.client_id, 2);

        // Committed entries cannot be rewritten.
        assert!(log.overwrite(1, Command::put(3, 1, "k", "no")).await.is_err());
    }

    #[tokio::test]
    async fn redeliver_repeats_committed_entry() {
        let (log, mut rx) = open(Arc::new(MemLogStorage::new())).await;
        log.propose(Command::append(1, 1, "k", "x")).await.unwrap();
        let _ = rx.try_recv().unwrap();

        log.redeliver(1).await.unwrap();
        assert_eq!(committed(rx.try_recv().unwrap()), (1, Command::append(1, 1, "k", "x")));
        assert!(log.redeliver(2).await.is_err());
    }

    #[tokio::test]
    async fn reopen_replays_only_committed_entries() {
        let storage = Arc::new(MemLogStorage::new());
        {
            let (log, _rx) = open(storage.clone()).await;
            log.propose(Command::put(1, 1, "a", "1")).await.unwrap();
            log.propose(Command::put(1, 2, "b", "2")).await.unwrap();
            log.set_auto_commit(false).await;
            log.propose(Command::put(1, 3, "c", "3")).await.unwrap();
        }

        let (log, mut rx) = open(storage).await;
        assert_eq!(committed(rx.try_recv().unwrap()).0, 1);
        assert_eq!(committed(rx.try_recv().unwrap()).0, 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(log.last_index().await, 3);
        assert_eq!(log.commit_index().await, 2);
    }

    #[tokio::test]
    async fn snapshot_purges_prefix_and_is_replayed_first() {
        let storage = Arc::new(MemLogStorage::new());
        {
            let (log, _rx) = open(storage.clone()).await;
            for seq in 1..=4 {
                log.propose(Command::put(1, seq, "k", "value")).await.unwrap();
            }
            let before = log.state_size().await;
            assert!(log.snapshot(3, b"image".to_vec()).await.unwrap());
            assert!(log.state_size().await < before);
            assert_eq!(log.snapshot_index().await, 3);

            // Already covered: nothing to compact.
            assert!(!log.snapshot(2, b"older".to_vec()).await.unwrap());
            assert!(!log.snapshot(3, b"image".to_vec()).await.unwrap());

            // Past the commit index is refused.
            assert!(log.snapshot(9, Vec::new()).await.is_err());
        }

        let (log, mut rx) = open(storage).await;
        match rx.try_recv().unwrap() {
            ApplyMsg::Snapshot { index, data, .. } => {
                assert_eq!(index, 3);
                assert_eq!(data, b"image");
            }
            other => panic!("expected a snapshot, got {other:?}"),
        }
        assert_eq!(committed(rx.try_recv().unwrap()).0, 4);
        assert!(rx.try_recv().is_err());
        assert!(log.redeliver(2).await.is_err());
    }

    #[tokio::test]
    async fn state_size_counts_only_committed_entries() {
        let (log, _rx) = open(Arc::new(MemLogStorage::new())).await;
        log.set_auto_commit(false).await;

        for seq in 1..=3 {
            log.propose(Command::put(1, seq, "k", "value")).await.unwrap();
        }
        assert_eq!(log.state_size().await, 0);

        log.commit_through(2).await.unwrap();
        let committed = log.state_size().await;
        assert_eq!(committed, 2 * (ENTRY_OVERHEAD + "k".len() + "value".len()));

        // Compacting the whole committed prefix leaves only the tail, which
        // is still not counted.
        assert!(log.snapshot(2, b"image".to_vec()).await.unwrap());
        assert_eq!(log.state_size().await, 0);
    }

    #[tokio::test]
    async fn term_survives_reopen() {
        let storage = Arc::new(MemLogStorage::new());
        {
            let (log, _rx) = open(storage.clone()).await;
            assert_eq!(log.advance_term().await.unwrap(), 2);
        }
        let (log, _rx) = open(storage).await;
        assert_eq!(log.status().await.term, 2);
        let p = log.propose(Command::get(1, 1, "k")).await.unwrap();
        assert_eq!(p.term, 2);
    }
}
