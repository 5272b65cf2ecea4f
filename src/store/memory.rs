//! In-memory storage backend.
//!
//! [`InMemoryBackend`] stores `(bytes, version)` pairs in a [`DashMap`].
//! Versioned writes take the shard write lock for the key only, so writers
//! on different keys never contend on a shared lock.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};

/// Thread-safe in-memory storage backend.
///
/// # Examples
///
/// ```
/// use credit_gate::store::memory::InMemoryBackend;
///
/// let backend = InMemoryBackend::new();
/// assert!(backend.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: DashMap<String, (Vec<u8>, u64)>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let entry = self.data.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        let (data, version) = entry.value();
        Ok(VersionedRecord {
            data: data.clone(),
            version: *version,
        })
    }

    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        match self.data.entry(key.to_string()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists {
                key: key.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert((data.to_vec(), 1));
                Ok(1)
            },
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let mut entry = self
            .data
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        let current_version = entry.value().1;
        if current_version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current_version,
            });
        }
        let new_version = current_version + 1;
        *entry.value_mut() = (data.to_vec(), new_version);
        Ok(new_version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| {
                let (data, version) = entry.value();
                (
                    entry.key().clone(),
                    VersionedRecord {
                        data: data.clone(),
                        version: *version,
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_if_absent_rejects_existing_key() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.put_if_absent("users:a", b"1").await.unwrap(), 1);
        let err = backend.put_if_absent("users:a", b"2").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert_eq!(backend.get("users:a").await.unwrap().data, b"1");
    }

    #[tokio::test]
    async fn put_if_version_increments_and_detects_conflicts() {
        let backend = InMemoryBackend::new();
        backend.put_if_absent("k", b"v1").await.unwrap();
        assert_eq!(backend.put_if_version("k", b"v2", 1).await.unwrap(), 2);

        match backend.put_if_version("k", b"v3", 1).await.unwrap_err() {
            StorageError::VersionConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            },
            other => panic!("expected VersionConflict, got: {other}"),
        }
        assert_eq!(backend.get("k").await.unwrap().data, b"v2");
    }

    #[tokio::test]
    async fn put_if_version_on_missing_key_is_not_found() {
        let backend = InMemoryBackend::new();
        let err = backend.put_if_version("missing", b"x", 1).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_and_delete() {
        let backend = InMemoryBackend::new();
        backend.put_if_absent("users:a", b"1").await.unwrap();
        backend.put_if_absent("users:b", b"2").await.unwrap();
        backend.put_if_absent("history:a:t1", b"3").await.unwrap();

        let mut keys: Vec<String> = backend
            .list_by_prefix("users:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["users:a", "users:b"]);

        assert!(backend.delete("users:a").await.unwrap());
        assert!(!backend.delete("users:a").await.unwrap());
        assert_eq!(backend.len(), 2);
    }
}
