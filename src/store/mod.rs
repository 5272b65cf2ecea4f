//! Storage substrate shared by the ledger, identity index, and history.
//!
//! # Backends
//!
//! - [`InMemoryBackend`](crate::store::memory::InMemoryBackend) -- `DashMap`
//!   backed, for tests and single-process deployments.
//! - [`RedisBackend`](crate::store::redis::RedisBackend) -- Redis hashes with
//!   Lua CAS scripts. Available behind the `redis` feature flag.

pub mod backend;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use backend::{StorageBackend, StorageError, VersionedRecord};

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        message: format!("failed to serialize: {e}"),
    })
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, data: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(data).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        message: format!("failed to deserialize: {e}"),
    })
}
