use std::collections::BTreeMap;

use rkv_types::{ClientId, Command, LogIndex, OpKind, Reply, SeqNo};

use crate::types::{Session, StateImage};

/// What happened when a committed command reached the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// First time this operation was applied.
    Executed(Reply),
    /// Same operation as the client's last applied one; the cached reply is
    /// returned and the store is untouched.
    Duplicate(Reply),
    /// Older than the client's last applied operation. No reply is cached for
    /// it any more.
    Stale,
}

impl Applied {
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Applied::Executed(r) | Applied::Duplicate(r) => Some(r),
            Applied::Stale => None,
        }
    }
}

/// The key/value map plus the client session table.
///
/// Not internally synchronised: the replica keeps it behind the same lock as
/// its pending-commit registry, and only the apply loop mutates it.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: BTreeMap<String, String>,
    sessions: BTreeMap<ClientId, Session>,
    last_applied: LogIndex,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn session(&self, client_id: ClientId) -> Option<&Session> {
        self.sessions.get(&client_id)
    }

    /// Cached reply for `(client_id, seq)` if that is the client's last
    /// applied operation.
    pub fn cached_reply(&self, client_id: ClientId, seq: SeqNo) -> Option<Reply> {
        self.sessions
            .get(&client_id)
            .filter(|s| s.last_seq == seq)
            .map(|s| s.reply.clone())
    }

    /// Apply a committed command at `index`.
    ///
    /// A command whose sequence number is not newer than the client's session
    /// is never re-executed. `last_applied` advances either way.
    pub fn apply(&mut self, index: LogIndex, cmd: &Command) -> Applied {
        self.last_applied = self.last_applied.max(index);

        if let Some(session) = self.sessions.get(&cmd.client_id) {
            if cmd.seq == session.last_seq {
                return Applied::Duplicate(session.reply.clone());
            }
            if cmd.seq < session.last_seq {
                return Applied::Stale;
            }
        }

        let reply = match cmd.kind {
            OpKind::Get => match self.data.get(&cmd.key) {
                Some(v) => Reply::Value(v.clone()),
                None => Reply::KeyNotFound,
            },
            OpKind::Put => {
                self.data.insert(cmd.key.clone(), cmd.value.clone());
                Reply::Done
            }
            OpKind::Append => {
                self.data.entry(cmd.key.clone()).or_default().push_str(&cmd.value);
                Reply::Done
            }
        };

        self.sessions
            .insert(cmd.client_id, Session { last_seq: cmd.seq, reply: reply.clone() });
        Applied::Executed(reply)
    }

    pub fn image(&self) -> StateImage {
        StateImage {
            last_applied: self.last_applied,
            data: self.data.clone(),
            sessions: self.sessions.clone(),
        }
    }

    /// Replace the whole state with a snapshot image.
    pub fn restore(&mut self, image: StateImage) {
        self.data = image.data;
        self.sessions = image.sessions;
        self.last_applied = image.last_applied;
    }
}
