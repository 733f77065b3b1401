use rkv_types::LogIndex;

/// `log` keyspace: big-endian index, so lexicographic order = numeric order.
pub fn log_key(index: LogIndex) -> [u8; 8] {
    index.to_be_bytes()
}

pub fn index_from_log_key(key: &[u8]) -> Option<LogIndex> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(LogIndex::from_be_bytes(bytes))
}

/// `meta` keyspace labels.
pub const META_HARD_STATE: &str = "hard_state";
pub const META_LAST_PURGED: &str = "last_purged";
pub const META_SNAPSHOT: &str = "snapshot";
