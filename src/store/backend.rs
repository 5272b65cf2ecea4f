//! Low-level key-value storage backend trait and supporting types.
//!
//! The [`StorageBackend`] trait is the substrate shared by the credit ledger,
//! the identity index, and the task history store. It exposes five
//! operations: [`get`](StorageBackend::get), [`put_if_absent`](StorageBackend::put_if_absent),
//! [`put_if_version`](StorageBackend::put_if_version),
//! [`delete`](StorageBackend::delete), and
//! [`list_by_prefix`](StorageBackend::list_by_prefix).
//!
//! Domain logic (balance checks, reconciliation markers, serialization) does
//! **not** belong here. Backends are dumb KV stores; the ledger and history
//! stores build their guarantees on top of the versioned writes.
//!
//! # Key Structure
//!
//! Keys are composite strings `{namespace}:{id}` built with [`make_key`].
//! History keys nest a length-prefixed user and the task handle:
//! `history:{user_len}:{user}:{task_handle}`.
//!
//! # Versioning
//!
//! Each stored record carries a monotonic `u64` version starting at 1,
//! incremented on every successful write. [`put_if_version`](StorageBackend::put_if_version)
//! is the compare-and-swap primitive that serializes concurrent
//! read-modify-write cycles on a single key without a shared lock.

use async_trait::async_trait;
use thiserror::Error;

/// A stored record paired with its monotonic version number.
///
/// # Examples
///
/// ```
/// use credit_gate::store::backend::VersionedRecord;
///
/// let record = VersionedRecord {
///     data: b"{}".to_vec(),
///     version: 1,
/// };
/// assert_eq!(record.version, 1);
/// ```
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    /// The serialized record bytes (JSON).
    pub data: Vec<u8>,

    /// Monotonic version number. Starts at 1, increments on each
    /// successful write.
    pub version: u64,
}

/// Errors that can occur during raw storage operations.
///
/// # Examples
///
/// ```
/// use credit_gate::store::backend::StorageError;
///
/// let err = StorageError::VersionConflict {
///     key: "users:admin".to_string(),
///     expected: 2,
///     actual: 3,
/// };
/// assert!(err.to_string().contains("expected 2"));
/// ```
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested key was not found.
    #[error("key not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A [`put_if_absent`](StorageBackend::put_if_absent) call found the
    /// key already present.
    #[error("key already exists: {key}")]
    AlreadyExists {
        /// The existing key.
        key: String,
    },

    /// A [`put_if_version`](StorageBackend::put_if_version) call failed
    /// because the stored version does not match.
    #[error("version conflict on key {key}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The key where the conflict occurred.
        key: String,
        /// The version the caller expected.
        expected: u64,
        /// The version found in storage.
        actual: u64,
    },

    /// A stored record could not be (de)serialized.
    #[error("corrupt record at {key}: {message}")]
    Corrupt {
        /// The offending key.
        key: String,
        /// Parser detail.
        message: String,
    },

    /// An I/O or backend-specific error (network failure, timeout).
    #[error("backend error: {message}")]
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Key-value storage backend with versioned writes.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; every request handler shares one
/// backend through an `Arc`.
///
/// # No Domain Logic
///
/// Backends never interpret the bytes they store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a record by key.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if no record exists for the key.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Creates a record at version 1, failing if the key already exists.
    ///
    /// # Errors
    ///
    /// - [`StorageError::AlreadyExists`] if the key is taken.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Stores a record only if the current version matches `expected_version`.
    ///
    /// On success the version is incremented and returned.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if no record exists for the key.
    /// - [`StorageError::VersionConflict`] on a version mismatch.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Deletes a record. Returns `true` if the key existed.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O failures.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Lists all records whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O failures.
    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError>;
}

/// Constructs a storage key from a namespace and an identifier.
///
/// ```
/// use credit_gate::store::backend::make_key;
///
/// assert_eq!(make_key("users", "admin"), "users:admin");
/// ```
pub fn make_key(namespace: &str, id: &str) -> String {
    format!("{namespace}:{id}")
}

/// Constructs a prefix matching every key in a namespace.
///
/// ```
/// use credit_gate::store::backend::make_prefix;
///
/// assert_eq!(make_prefix("users"), "users:");
/// ```
pub fn make_prefix(namespace: &str) -> String {
    format!("{namespace}:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display() {
        let err = StorageError::NotFound {
            key: "users:ghost".to_string(),
        };
        assert_eq!(err.to_string(), "key not found: users:ghost");

        let err = StorageError::AlreadyExists {
            key: "users:admin".to_string(),
        };
        assert_eq!(err.to_string(), "key already exists: users:admin");
    }

    #[test]
    fn backend_error_exposes_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = StorageError::Backend {
            message: "db failed".to_string(),
            source: Some(Box::new(inner)),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("timed out"));
    }

    #[test]
    fn prefix_matches_key() {
        let key = make_key("history", "test_user:task-1");
        assert!(key.starts_with(&make_prefix("history")));
    }
}
