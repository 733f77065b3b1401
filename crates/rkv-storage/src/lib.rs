pub mod codec;
pub mod fjall;
pub mod keys;
pub mod machine;
pub mod mem;
pub mod traits;
pub mod types;

pub use codec::{BincodeCodec, SnapshotCodec};
pub use machine::{Applied, KvStateMachine};
pub use traits::LogStorage;
pub use types::{HardState, LogEntry, LogState, Session, SnapshotBlob, StateImage};
