use rkv_types::KvError;

use crate::types::StateImage;

pub(crate) fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, KvError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| KvError::Storage(e.to_string()))
}

pub(crate) fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, KvError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| KvError::Storage(e.to_string()))
}

/// Turns a [`StateImage`] into the opaque bytes the command log stores, and
/// back. Injected into the replica so the snapshot format is swappable.
pub trait SnapshotCodec: Send + Sync + 'static {
    fn encode(&self, image: &StateImage) -> Result<Vec<u8>, KvError>;
    fn decode(&self, bytes: &[u8]) -> Result<StateImage, KvError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl SnapshotCodec for BincodeCodec {
    fn encode(&self, image: &StateImage) -> Result<Vec<u8>, KvError> {
        encode(image)
    }

    fn decode(&self, bytes: &[u8]) -> Result<StateImage, KvError> {
        decode(bytes)
    }
}
