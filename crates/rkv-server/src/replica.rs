use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use rkv_consensus::{ApplyMsg, CommandLog, LogStatus};
use rkv_storage::{Applied, KvStateMachine, SnapshotCodec};
use rkv_types::{ClientId, Command, KvError, LogIndex, Reply, SeqNo, Term, WriteMode};

use crate::pending::{Outcome, PendingRegistry};

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// How long a handler waits for its command to be applied.
    pub request_timeout: Duration,
    /// How often a waiting handler re-checks term and leadership.
    pub leadership_check: Duration,
    /// Snapshot once the log retains at least this many bytes.
    pub max_raft_state: Option<usize>,
}

/// `tokio::time::interval` rejects a zero period.
const MIN_LEADERSHIP_CHECK: Duration = Duration::from_millis(1);

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            request_timeout: Duration::from_millis(800),
            leadership_check: Duration::from_millis(50),
            max_raft_state: None,
        }
    }
}

/// Everything handlers and the apply loop share. One lock, never held
/// across a proposal or a wait.
#[derive(Default)]
struct ReplicaState {
    machine: KvStateMachine,
    pending: PendingRegistry,
    shutting_down: bool,
}

enum Waited {
    Notified(Result<Outcome, oneshot::error::RecvError>),
    TimedOut,
    Deposed(LogStatus),
}

/// The replicated key/value service on one node.
///
/// Handlers propose through the [`CommandLog`] and wait for the apply loop to
/// reach their index; the apply loop is the only writer of the state machine.
pub struct KvReplica<L> {
    log: Arc<L>,
    state: Arc<Mutex<ReplicaState>>,
    config: ReplicaConfig,
    shutdown_tx: watch::Sender<bool>,
    apply_task: Mutex<Option<JoinHandle<()>>>,
}

impl<L: CommandLog> KvReplica<L> {
    /// Spawn the apply loop over `apply_rx`, the commit stream of `log`.
    pub fn start(
        log: Arc<L>,
        apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
        mut config: ReplicaConfig,
        codec: Arc<dyn SnapshotCodec>,
    ) -> Arc<Self> {
        if config.leadership_check < MIN_LEADERSHIP_CHECK {
            warn!(
                configured = ?config.leadership_check,
                "leadership check interval too small, using {MIN_LEADERSHIP_CHECK:?}"
            );
            config.leadership_check = MIN_LEADERSHIP_CHECK;
        }
        let state = Arc::new(Mutex::new(ReplicaState::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let apply = ApplyLoop {
            log: log.clone(),
            state: state.clone(),
            codec,
            max_raft_state: config.max_raft_state,
            apply_rx,
            shutdown_rx,
        };
        let handle = tokio::spawn(apply.run());
        Arc::new(KvReplica {
            log,
            state,
            config,
            shutdown_tx,
            apply_task: Mutex::new(Some(handle)),
        })
    }

    /// Linearizable read. `Ok(None)` means the key does not exist.
    pub async fn get(
        &self,
        client_id: ClientId,
        seq: SeqNo,
        key: &str,
    ) -> Result<Option<String>, KvError> {
        let reply = self.submit(Command::get(client_id, seq, key)).await?;
        Ok(reply.into_value())
    }

    pub async fn put_append(
        &self,
        client_id: ClientId,
        seq: SeqNo,
        key: &str,
        value: &str,
        mode: WriteMode,
    ) -> Result<(), KvError> {
        self.submit(Command::write(mode, client_id, seq, key, value)).await.map(|_| ())
    }

    pub async fn current_term(&self) -> Term {
        self.log.status().await.term
    }

    /// Abandon every waiting handler and stop the apply loop. Later calls
    /// fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        {
            let mut st = self.state.lock().await;
            st.shutting_down = true;
            let abandoned = st.pending.abandon_all();
            if abandoned > 0 {
                warn!(abandoned, "abandoned pending requests on shutdown");
            }
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.apply_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "apply loop ended abnormally");
            }
        }
        info!("replica stopped");
    }

    async fn submit(&self, command: Command) -> Result<Reply, KvError> {
        let status = self.log.status().await;
        if !status.is_leader {
            return Err(status.not_leader_error());
        }
        let (client_id, seq) = (command.client_id, command.seq);

        let joined = {
            let mut st = self.state.lock().await;
            if st.shutting_down {
                return Err(KvError::ShuttingDown);
            }
            if let Some(reply) = st.machine.cached_reply(client_id, seq) {
                debug!(client_id, seq, "answered from session table");
                return Ok(reply);
            }
            if let Some(session) = st.machine.session(client_id) {
                if seq < session.last_seq {
                    return Err(KvError::InvalidArgument(format!(
                        "sequence number {seq} is older than {} already applied for client {client_id}",
                        session.last_seq
                    )));
                }
            }
            let last_applied = st.machine.last_applied();
            st.pending.join(client_id, seq, status.term, last_applied)
        };

        let (index, term, rx) = match joined {
            Some(joined) => {
                debug!(client_id, seq, index = joined.0, "waiting on in-flight proposal");
                joined
            }
            None => {
                let proposal = self.log.propose(command).await?;
                let mut st = self.state.lock().await;
                if st.shutting_down {
                    return Err(KvError::ShuttingDown);
                }
                // Applied before we could register: the session table knows
                // whether it was our command.
                if st.machine.last_applied() >= proposal.index {
                    return st.machine.cached_reply(client_id, seq).ok_or_else(KvError::not_leader);
                }
                let rx = st.pending.register(proposal.index, client_id, seq, proposal.term);
                (proposal.index, proposal.term, rx)
            }
        };

        self.wait(client_id, seq, index, term, rx).await
    }

    async fn wait(
        &self,
        client_id: ClientId,
        seq: SeqNo,
        index: LogIndex,
        term: Term,
        mut rx: oneshot::Receiver<Outcome>,
    ) -> Result<Reply, KvError> {
        let deadline = time::sleep_until(Instant::now() + self.config.request_timeout);
        tokio::pin!(deadline);
        let mut check = time::interval(self.config.leadership_check);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        check.tick().await;

        let waited = loop {
            tokio::select! {
                biased;
                res = &mut rx => break Waited::Notified(res),
                _ = &mut deadline => break Waited::TimedOut,
                _ = check.tick() => {
                    let status = self.log.status().await;
                    if !status.is_leader || status.term != term {
                        break Waited::Deposed(status);
                    }
                }
            }
        };

        match waited {
            Waited::Notified(Ok(Outcome::Applied(reply))) => Ok(reply),
            Waited::Notified(Ok(Outcome::Superseded)) => Err(KvError::not_leader()),
            Waited::Notified(Ok(Outcome::ShuttingDown)) | Waited::Notified(Err(_)) => {
                Err(KvError::ShuttingDown)
            }
            Waited::TimedOut => {
                drop(rx);
                self.state.lock().await.pending.release(index);
                debug!(client_id, seq, index, "timed out waiting for commit");
                Err(KvError::Timeout)
            }
            Waited::Deposed(status) => {
                drop(rx);
                self.state.lock().await.pending.release(index);
                debug!(
                    client_id,
                    seq,
                    index,
                    proposed_term = term,
                    term = status.term,
                    is_leader = status.is_leader,
                    "lost leadership while waiting"
                );
                Err(status.not_leader_error())
            }
        }
    }
}

/// Sole consumer of the commit stream.
struct ApplyLoop<L> {
    log: Arc<L>,
    state: Arc<Mutex<ReplicaState>>,
    codec: Arc<dyn SnapshotCodec>,
    max_raft_state: Option<usize>,
    apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<L: CommandLog> ApplyLoop<L> {
    async fn run(mut self) {
        info!("apply loop started");
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => break,
                msg = self.apply_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            match msg {
                ApplyMsg::Command { index, term, command } => {
                    self.apply_command(index, term, command).await
                }
                ApplyMsg::Snapshot { index, term, data } => {
                    self.install_snapshot(index, term, &data).await
                }
            }
        }

        let mut st = self.state.lock().await;
        st.shutting_down = true;
        let abandoned = st.pending.abandon_all();
        info!(abandoned, last_applied = st.machine.last_applied(), "apply loop stopped");
    }

    async fn apply_command(&self, index: LogIndex, term: Term, command: Command) {
        {
            let mut st = self.state.lock().await;
            if index <= st.machine.last_applied() {
                debug!(index, term, "skipping already applied entry");
                return;
            }
            let applied = st.machine.apply(index, &command);
            debug!(
                index,
                term,
                client_id = command.client_id,
                seq = command.seq,
                kind = ?command.kind,
                key = %command.key,
                duplicate = !matches!(applied, Applied::Executed(_)),
                "applied"
            );
            st.pending.resolve(index, &command, applied.reply());
        }
        self.maybe_snapshot().await;
    }

    async fn maybe_snapshot(&self) {
        let Some(max) = self.max_raft_state else {
            return;
        };
        if self.log.state_size().await < max {
            return;
        }
        let (index, encoded) = {
            let st = self.state.lock().await;
            let image = st.machine.image();
            (image.last_applied, self.codec.encode(&image))
        };
        let data = match encoded {
            Ok(data) => data,
            Err(e) => {
                error!(index, error = %e, "failed to encode snapshot");
                return;
            }
        };
        let bytes = data.len();
        match self.log.snapshot(index, data).await {
            Ok(true) => info!(index, bytes, "snapshot taken"),
            Ok(false) => debug!(index, "snapshot already covers index"),
            Err(e) => warn!(index, error = %e, "log refused snapshot"),
        }
    }

    async fn install_snapshot(&self, index: LogIndex, term: Term, data: &[u8]) {
        let mut st = self.state.lock().await;
        if index <= st.machine.last_applied() {
            debug!(index, term, "ignoring snapshot behind applied state");
            return;
        }
        let image = match self.codec.decode(data) {
            Ok(image) => image,
            Err(e) => {
                error!(index, term, error = %e, "snapshot cannot be decoded");
                panic!("snapshot at index {index} cannot be decoded: {e}");
            }
        };
        let keys = image.data.len();
        let clients = image.sessions.len();
        st.machine.restore(image);
        let superseded = st.pending.supersede_through(index);
        info!(index, term, keys, clients, superseded, "snapshot installed");
    }
}
