//! Task history: which user admitted which task, at what cost.
//!
//! One [`TaskHistoryRecord`] is written per admitted task and read back at
//! reconciliation time as the source of truth for the charge. The record's
//! `reconciled_at` marker is claimed with compare-and-swap before a deferred
//! deduction, so however many pollers race on a succeeded task, exactly one
//! of them wins the right to deduct.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::store::backend::{make_key, StorageBackend, StorageError};
use crate::store::{decode, encode};
use crate::types::{TaskHandle, TaskHistoryRecord, UserId};

const HISTORY: &str = "history";

/// Errors from history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// No record for this `(user, task)` pair.
    #[error("no history record for user {user}, task {handle}")]
    NotFound {
        /// The user the lookup was scoped to.
        user: UserId,
        /// The task handle.
        handle: TaskHandle,
    },

    /// A record for this `(user, task)` pair already exists.
    #[error("history record already exists for user {user}, task {handle}")]
    Duplicate {
        /// The user.
        user: UserId,
        /// The task handle.
        handle: TaskHandle,
    },

    /// The reconciliation marker could not be updated after repeated races.
    #[error("marker update for task {handle} abandoned after {attempts} attempts")]
    Contention {
        /// The contended task.
        handle: TaskHandle,
        /// Attempts made.
        attempts: usize,
    },

    /// The underlying store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Durable per-task admission records.
#[async_trait]
pub trait TaskHistoryStore: Send + Sync {
    /// Appends one immutable record. Durable when this returns `Ok`.
    ///
    /// # Errors
    ///
    /// [`HistoryError::Duplicate`] if the pair was already recorded.
    async fn record(&self, record: &TaskHistoryRecord) -> Result<(), HistoryError>;

    /// Reads the record for `(user, handle)`.
    ///
    /// # Errors
    ///
    /// [`HistoryError::NotFound`] if the task was never admitted for this
    /// user.
    async fn lookup(
        &self,
        user: &UserId,
        handle: &TaskHandle,
    ) -> Result<TaskHistoryRecord, HistoryError>;

    /// Sets the reconciliation marker if it is unset.
    ///
    /// Returns the claimed record when this call set the marker, `None` if
    /// it was already set.
    async fn claim_reconciliation(
        &self,
        user: &UserId,
        handle: &TaskHandle,
    ) -> Result<Option<TaskHistoryRecord>, HistoryError>;

    /// Clears the reconciliation marker after a failed deduction so a later
    /// poll can retry.
    async fn release_reconciliation(
        &self,
        user: &UserId,
        handle: &TaskHandle,
    ) -> Result<(), HistoryError>;
}

/// History store over a [`StorageBackend`], keyed
/// `history:{user_len}:{user}:{task_handle}`.
///
/// The length prefix keeps keys unambiguous when a user name or an opaque
/// task handle contains `:`.
#[derive(Debug)]
pub struct KvTaskHistoryStore<B: StorageBackend> {
    backend: Arc<B>,
    max_cas_retries: usize,
}

impl<B: StorageBackend> KvTaskHistoryStore<B> {
    /// Creates a history store over a shared backend.
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            max_cas_retries: crate::ledger::DEFAULT_MAX_CAS_RETRIES,
        }
    }

    /// Sets the CAS retry budget (minimum 1).
    pub fn with_max_cas_retries(mut self, retries: usize) -> Self {
        self.max_cas_retries = retries.max(1);
        self
    }

    fn key(user: &UserId, handle: &TaskHandle) -> String {
        make_key(HISTORY, &format!("{}:{user}:{handle}", user.as_str().len()))
    }

    async fn load(
        &self,
        user: &UserId,
        handle: &TaskHandle,
    ) -> Result<(TaskHistoryRecord, u64), HistoryError> {
        let key = Self::key(user, handle);
        match self.backend.get(&key).await {
            Ok(versioned) => Ok((decode(&key, &versioned.data)?, versioned.version)),
            Err(StorageError::NotFound { .. }) => Err(HistoryError::NotFound {
                user: user.clone(),
                handle: handle.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrites the marker with CAS. `apply` returns `None` when no write is
    /// needed.
    async fn update_marker<F>(
        &self,
        user: &UserId,
        handle: &TaskHandle,
        apply: F,
    ) -> Result<Option<TaskHistoryRecord>, HistoryError>
    where
        F: Fn(&TaskHistoryRecord) -> Option<TaskHistoryRecord> + Send + Sync,
    {
        let key = Self::key(user, handle);
        for _ in 0..self.max_cas_retries {
            let (current, version) = self.load(user, handle).await?;
            let Some(updated) = apply(&current) else {
                return Ok(None);
            };
            match self
                .backend
                .put_if_version(&key, &encode(&key, &updated)?, version)
                .await
            {
                Ok(_) => return Ok(Some(updated)),
                Err(StorageError::VersionConflict { .. }) => tokio::task::yield_now().await,
                Err(e) => return Err(e.into()),
            }
        }
        Err(HistoryError::Contention {
            handle: handle.clone(),
            attempts: self.max_cas_retries,
        })
    }
}

#[async_trait]
impl<B: StorageBackend> TaskHistoryStore for KvTaskHistoryStore<B> {
    async fn record(&self, record: &TaskHistoryRecord) -> Result<(), HistoryError> {
        let key = Self::key(&record.user_name, &record.task_id);
        match self.backend.put_if_absent(&key, &encode(&key, record)?).await {
            Ok(_) => Ok(()),
            Err(StorageError::AlreadyExists { .. }) => Err(HistoryError::Duplicate {
                user: record.user_name.clone(),
                handle: record.task_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup(
        &self,
        user: &UserId,
        handle: &TaskHandle,
    ) -> Result<TaskHistoryRecord, HistoryError> {
        Ok(self.load(user, handle).await?.0)
    }

    async fn claim_reconciliation(
        &self,
        user: &UserId,
        handle: &TaskHandle,
    ) -> Result<Option<TaskHistoryRecord>, HistoryError> {
        self.update_marker(user, handle, |current| {
            if current.is_reconciled() {
                return None;
            }
            let mut claimed = current.clone();
            claimed.reconciled_at = Some(Utc::now());
            Some(claimed)
        })
        .await
    }

    async fn release_reconciliation(
        &self,
        user: &UserId,
        handle: &TaskHandle,
    ) -> Result<(), HistoryError> {
        self.update_marker(user, handle, |current| {
            current.is_reconciled().then(|| {
                let mut released = current.clone();
                released.reconciled_at = None;
                released
            })
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBackend;
    use crate::types::DeductionPolicy;

    fn store() -> KvTaskHistoryStore<InMemoryBackend> {
        KvTaskHistoryStore::new(Arc::new(InMemoryBackend::new()))
    }

    fn fair_record(user: &str, handle: &str, cost: u64) -> TaskHistoryRecord {
        TaskHistoryRecord::new(
            UserId::new(user),
            TaskHandle::new(handle),
            cost,
            DeductionPolicy::Fair,
        )
    }

    #[tokio::test]
    async fn record_then_lookup() {
        let store = store();
        store.record(&fair_record("test_user", "task-1", 5)).await.unwrap();

        let found = store
            .lookup(&UserId::new("test_user"), &TaskHandle::new("task-1"))
            .await
            .unwrap();
        assert_eq!(found.cost, 5);
        assert_eq!(found.policy, DeductionPolicy::Fair);
        assert!(!found.is_reconciled());
    }

    #[tokio::test]
    async fn lookup_is_scoped_to_user() {
        let store = store();
        store.record(&fair_record("alice", "task-1", 5)).await.unwrap();
        let err = store
            .lookup(&UserId::new("mallory"), &TaskHandle::new("task-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn record_is_write_once() {
        let store = store();
        store.record(&fair_record("u", "task-1", 5)).await.unwrap();
        let err = store.record(&fair_record("u", "task-1", 7)).await.unwrap_err();
        assert!(matches!(err, HistoryError::Duplicate { .. }));
        let found = store
            .lookup(&UserId::new("u"), &TaskHandle::new("task-1"))
            .await
            .unwrap();
        assert_eq!(found.cost, 5);
    }

    #[tokio::test]
    async fn claim_is_granted_once_and_release_reopens_it() {
        let store = store();
        let (user, handle) = (UserId::new("u"), TaskHandle::new("task-1"));
        store.record(&fair_record("u", "task-1", 5)).await.unwrap();

        let claimed = store.claim_reconciliation(&user, &handle).await.unwrap();
        assert!(claimed.unwrap().is_reconciled());
        assert!(store.claim_reconciliation(&user, &handle).await.unwrap().is_none());

        store.release_reconciliation(&user, &handle).await.unwrap();
        assert!(store.claim_reconciliation(&user, &handle).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(store());
        store.record(&fair_record("u", "task-1", 5)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .claim_reconciliation(&UserId::new("u"), &TaskHandle::new("task-1"))
                    .await
                    .unwrap()
                    .is_some()
            }));
        }
        let winners = count_winners(handles).await;
        assert_eq!(winners, 1);
    }

    async fn count_winners(handles: Vec<tokio::task::JoinHandle<bool>>) -> usize {
        let mut count = 0;
        for handle in handles {
            if handle.await.unwrap() {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn separators_in_names_do_not_collide() {
        let store = store();
        store.record(&fair_record("a:b", "c", 3)).await.unwrap();
        store.record(&fair_record("a", "b:c", 7)).await.unwrap();

        let first = store
            .lookup(&UserId::new("a:b"), &TaskHandle::new("c"))
            .await
            .unwrap();
        let second = store
            .lookup(&UserId::new("a"), &TaskHandle::new("b:c"))
            .await
            .unwrap();
        assert_eq!(first.cost, 3);
        assert_eq!(second.cost, 7);
        assert!(matches!(
            store.lookup(&UserId::new("a:b"), &TaskHandle::new("b:c")).await,
            Err(HistoryError::NotFound { .. })
        ));
    }
}
