use std::collections::{BTreeMap, HashMap};

use tokio::sync::oneshot;
use tracing::warn;

use rkv_types::{ClientId, Command, LogIndex, Reply, SeqNo, Term};

/// How a pending commit was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Applied(Reply),
    /// A different command occupied the expected index, or the entry was
    /// folded into a snapshot before its handler saw it.
    Superseded,
    ShuttingDown,
}

struct PendingCommit {
    client_id: ClientId,
    seq: SeqNo,
    term: Term,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    seq: SeqNo,
    index: LogIndex,
    term: Term,
}

/// Log index → handlers waiting for that index to be applied, plus the last
/// proposed-but-unapplied operation of each client so retries can wait on it
/// instead of proposing again.
///
/// Lives behind the replica's state lock. Every resolution is a oneshot send,
/// so nothing here ever waits on a handler.
#[derive(Default)]
pub(crate) struct PendingRegistry {
    entries: BTreeMap<LogIndex, PendingCommit>,
    in_flight: HashMap<ClientId, InFlight>,
}

impl PendingRegistry {
    /// Register a waiter for a command just proposed at `index`.
    ///
    /// An existing entry there with a different identity belongs to a
    /// proposal the log has since discarded; its waiters are told so.
    pub(crate) fn register(
        &mut self,
        index: LogIndex,
        client_id: ClientId,
        seq: SeqNo,
        term: Term,
    ) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        match self.entries.get_mut(&index) {
            Some(entry) if entry.client_id == client_id && entry.seq == seq => {
                entry.term = term;
                entry.waiters.push(tx);
            }
            _ => {
                if let Some(old) = self.entries.insert(
                    index,
                    PendingCommit { client_id, seq, term, waiters: vec![tx] },
                ) {
                    warn!(index, client_id = old.client_id, seq = old.seq, "pending entry displaced");
                    notify(old.waiters, Outcome::Superseded);
                }
            }
        }
        self.in_flight.insert(client_id, InFlight { seq, index, term });
        rx
    }

    /// Wait on an earlier proposal of the same operation when it can still
    /// commit: proposed in the current term at an index not yet applied.
    pub(crate) fn join(
        &mut self,
        client_id: ClientId,
        seq: SeqNo,
        current_term: Term,
        last_applied: LogIndex,
    ) -> Option<(LogIndex, Term, oneshot::Receiver<Outcome>)> {
        let flight = *self.in_flight.get(&client_id)?;
        if flight.seq != seq || flight.term != current_term || flight.index <= last_applied {
            return None;
        }
        if let Some(entry) = self.entries.get(&flight.index) {
            if entry.client_id != client_id || entry.seq != seq {
                return None;
            }
        }
        Some((flight.index, flight.term, self.register(flight.index, client_id, seq, flight.term)))
    }

    /// Resolve the entry at `index` now that `command` was applied there.
    ///
    /// `reply` is the reply for `command`, or `None` when none is cached for
    /// it. Returns the number of handlers woken.
    pub(crate) fn resolve(
        &mut self,
        index: LogIndex,
        command: &Command,
        reply: Option<&Reply>,
    ) -> usize {
        if let Some(flight) = self.in_flight.get(&command.client_id) {
            if flight.seq <= command.seq {
                self.in_flight.remove(&command.client_id);
            }
        }
        let Some(entry) = self.entries.remove(&index) else {
            return 0;
        };
        let outcome = match reply {
            Some(reply) if command.is_same_op(entry.client_id, entry.seq) => {
                Outcome::Applied(reply.clone())
            }
            _ => {
                warn!(
                    index,
                    client_id = entry.client_id,
                    seq = entry.seq,
                    proposed_term = entry.term,
                    applied_client = command.client_id,
                    applied_seq = command.seq,
                    "pending entry superseded"
                );
                Outcome::Superseded
            }
        };
        notify(entry.waiters, outcome)
    }

    /// Drop waiters whose handlers stopped listening; forget the entry once
    /// nobody is left. The in-flight record stays so a retry can rejoin.
    pub(crate) fn release(&mut self, index: LogIndex) {
        if let Some(entry) = self.entries.get_mut(&index) {
            entry.waiters.retain(|tx| !tx.is_closed());
            if entry.waiters.is_empty() {
                self.entries.remove(&index);
            }
        }
    }

    /// Everything at or below `index` is covered by an installed snapshot.
    pub(crate) fn supersede_through(&mut self, index: LogIndex) -> usize {
        let rest = self.entries.split_off(&(index + 1));
        let covered = std::mem::replace(&mut self.entries, rest);
        self.in_flight.retain(|_, f| f.index > index);
        covered.into_values().map(|e| notify(e.waiters, Outcome::Superseded)).sum()
    }

    pub(crate) fn abandon_all(&mut self) -> usize {
        self.in_flight.clear();
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|e| notify(e.waiters, Outcome::ShuttingDown))
            .sum()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Fulfilment is a no-op for handlers that already gave up.
fn notify(waiters: Vec<oneshot::Sender<Outcome>>, outcome: Outcome) -> usize {
    waiters.into_iter().map(|tx| tx.send(outcome.clone()).is_ok()).filter(|ok| *ok).count()
}
