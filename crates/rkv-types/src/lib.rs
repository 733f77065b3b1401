pub type ClientId = u64;
pub type SeqNo = u64;
pub type LogIndex = u64;
pub type Term = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OpKind {
    Get,
    Put,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Put,
    Append,
}

impl From<WriteMode> for OpKind {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::Put => OpKind::Put,
            WriteMode::Append => OpKind::Append,
        }
    }
}

/// One client operation as proposed through the command log.
///
/// `(client_id, seq)` identifies the operation across retries; a command only
/// becomes authoritative once the log reports it committed at an index.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Command {
    pub kind: OpKind,
    pub client_id: ClientId,
    pub seq: SeqNo,
    pub key: String,
    /// Empty for `Get`.
    pub value: String,
}

impl Command {
    pub fn get(client_id: ClientId, seq: SeqNo, key: impl Into<String>) -> Self {
        Command { kind: OpKind::Get, client_id, seq, key: key.into(), value: String::new() }
    }

    pub fn put(
        client_id: ClientId,
        seq: SeqNo,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::write(WriteMode::Put, client_id, seq, key, value)
    }

    pub fn append(
        client_id: ClientId,
        seq: SeqNo,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::write(WriteMode::Append, client_id, seq, key, value)
    }

    pub fn write(
        mode: WriteMode,
        client_id: ClientId,
        seq: SeqNo,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Command { kind: mode.into(), client_id, seq, key: key.into(), value: value.into() }
    }

    pub fn is_same_op(&self, client_id: ClientId, seq: SeqNo) -> bool {
        self.client_id == client_id && self.seq == seq
    }
}

/// Result of applying a command. Cached per client for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Reply {
    /// Put or Append completed.
    Done,
    Value(String),
    KeyNotFound,
}

impl Reply {
    pub fn into_value(self) -> Option<String> {
        match self {
            Reply::Value(v) => Some(v),
            Reply::Done | Reply::KeyNotFound => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("operation timed out before commit")]
    Timeout,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl KvError {
    pub fn not_leader() -> Self {
        KvError::NotLeader { leader: None }
    }

    /// Whether the client should resend the same operation, possibly to
    /// another server.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::NotLeader { .. } | KvError::Timeout)
    }
}
