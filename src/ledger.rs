//! Credit ledger: the system of record for user balances.
//!
//! [`CreditLedger`] exposes the atomic balance operations the admission
//! engine relies on. [`IdentityStore`] is the credential lookup the
//! [`IdentityResolver`](crate::identity::IdentityResolver) falls back to on a
//! cache miss. [`KvCreditLedger`] implements both on any
//! [`StorageBackend`].
//!
//! # Atomicity
//!
//! Every balance mutation is a read-modify-write guarded by
//! [`put_if_version`](StorageBackend::put_if_version). Within one ledger,
//! writers for the same user queue on a per-user lock, so the CAS only
//! conflicts when another process shares the backend. A losing writer backs
//! off, re-reads and re-applies its change, so concurrent deductions for one
//! user linearize and the pre-check always runs against the balance it
//! commits over. Different users live under different keys and never contend.
//!
//! # Key Layout
//!
//! | Key | Value |
//! |-----|-------|
//! | `users:{name}` | [`UserRecord`] JSON |
//! | `credentials:{api_key}` | owning user name (JSON string) |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::store::backend::{make_key, make_prefix, StorageBackend, StorageError};
use crate::store::{decode, encode};
use crate::types::{Credential, UserCredits, UserId, UserRecord};

const USERS: &str = "users";
const CREDENTIALS: &str = "credentials";

/// Default number of compare-and-swap attempts before giving up.
pub const DEFAULT_MAX_CAS_RETRIES: usize = 64;

/// Upper bound on the sleep between conflicting CAS attempts.
const MAX_CAS_BACKOFF: Duration = Duration::from_millis(50);

fn cas_backoff(attempt: usize) -> Duration {
    let shift = u32::try_from(attempt.min(6)).unwrap_or(6);
    Duration::from_millis(1u64 << shift).min(MAX_CAS_BACKOFF)
}

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The balance cannot cover the requested deduction. Nothing changed.
    #[error("insufficient credits for {user}: balance {balance}, requested {requested}")]
    InsufficientCredits {
        /// The user whose balance was checked.
        user: UserId,
        /// Balance at the time of the check.
        balance: u64,
        /// Amount that was requested.
        requested: u64,
    },

    /// No such user.
    #[error("user not found: {user}")]
    NotFound {
        /// The missing user.
        user: UserId,
    },

    /// A user with this name or credential already exists.
    #[error("duplicate user: {user}")]
    Duplicate {
        /// The conflicting user name.
        user: UserId,
    },

    /// The CAS loop lost too many races in a row.
    #[error("balance update for {user} abandoned after {attempts} conflicting attempts")]
    Contention {
        /// The contended user.
        user: UserId,
        /// Attempts made.
        attempts: usize,
    },

    /// The underlying store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Atomic balance operations.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Reads the authoritative balance.
    async fn balance(&self, user: &UserId) -> Result<u64, LedgerError>;

    /// Deducts `amount` if the balance covers it and returns the new balance.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InsufficientCredits`] if `balance < amount`; the
    ///   balance is left untouched.
    /// - [`LedgerError::NotFound`] if the user does not exist.
    async fn try_deduct(&self, user: &UserId, amount: u64) -> Result<u64, LedgerError>;

    /// Overwrites the balance (administrative).
    async fn set(&self, user: &UserId, new_balance: u64) -> Result<UserCredits, LedgerError>;

    /// Adds `delta` (possibly negative) to the balance.
    ///
    /// A negative delta larger than the balance is rejected with
    /// [`LedgerError::InsufficientCredits`]; balances never go below zero.
    async fn increment(&self, user: &UserId, delta: i64) -> Result<UserCredits, LedgerError>;
}

/// Credential lookup against the system of record.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Returns the user owning `credential`, if any.
    async fn find_by_credential(
        &self,
        credential: &Credential,
    ) -> Result<Option<UserRecord>, StorageError>;

    /// Returns every user name, sorted.
    async fn list_users(&self) -> Result<Vec<UserId>, StorageError>;
}

/// Ledger and identity store over a [`StorageBackend`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use credit_gate::ledger::{CreditLedger, KvCreditLedger};
/// use credit_gate::store::memory::InMemoryBackend;
/// use credit_gate::types::UserId;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let ledger = KvCreditLedger::new(Arc::new(InMemoryBackend::new()));
/// ledger.create_user("test_user", "key-1", 10).await.unwrap();
/// assert_eq!(ledger.try_deduct(&UserId::new("test_user"), 10).await.unwrap(), 0);
/// # }
/// ```
#[derive(Debug)]
pub struct KvCreditLedger<B: StorageBackend> {
    backend: Arc<B>,
    max_cas_retries: usize,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl<B: StorageBackend> KvCreditLedger<B> {
    /// Creates a ledger over a shared backend.
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
            locks: DashMap::new(),
        }
    }

    /// Sets the CAS retry budget (minimum 1).
    ///
    /// The budget only applies to conflicts with writers outside this ledger.
    pub fn with_max_cas_retries(mut self, retries: usize) -> Self {
        self.max_cas_retries = retries.max(1);
        self
    }

    /// Returns the shared backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Provisions a user.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Duplicate`] if the name or the credential is taken.
    pub async fn create_user(
        &self,
        name: impl Into<UserId>,
        api_key: impl Into<Credential>,
        credits: u64,
    ) -> Result<UserRecord, LedgerError> {
        let record = UserRecord {
            name: name.into(),
            api_key: api_key.into(),
            credits,
        };
        let user_key = make_key(USERS, record.name.as_str());
        let credential_key = make_key(CREDENTIALS, record.api_key.expose());

        match self
            .backend
            .put_if_absent(&user_key, &encode(&user_key, &record)?)
            .await
        {
            Ok(_) => {},
            Err(StorageError::AlreadyExists { .. }) => {
                return Err(LedgerError::Duplicate { user: record.name });
            },
            Err(e) => return Err(e.into()),
        }

        match self
            .backend
            .put_if_absent(&credential_key, &encode(&credential_key, &record.name)?)
            .await
        {
            Ok(_) => Ok(record),
            Err(err) => {
                // Roll back the user row so the name can be reused.
                if let Err(cleanup) = self.backend.delete(&user_key).await {
                    tracing::error!(
                        user = %record.name,
                        error = %cleanup,
                        "failed to roll back user row after credential conflict"
                    );
                }
                match err {
                    StorageError::AlreadyExists { .. } => {
                        Err(LedgerError::Duplicate { user: record.name })
                    },
                    other => Err(other.into()),
                }
            },
        }
    }

    async fn load(&self, user: &UserId) -> Result<(UserRecord, u64), LedgerError> {
        let key = make_key(USERS, user.as_str());
        match self.backend.get(&key).await {
            Ok(versioned) => Ok((decode(&key, &versioned.data)?, versioned.version)),
            Err(StorageError::NotFound { .. }) => Err(LedgerError::NotFound { user: user.clone() }),
            Err(e) => Err(e.into()),
        }
    }

    fn user_lock(&self, user: &UserId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(user.clone()).or_default().value())
    }

    /// Applies `update` to the balance under compare-and-swap, retrying on
    /// version conflicts. `update` sees the freshly read balance each time.
    async fn update_balance<F>(&self, user: &UserId, update: F) -> Result<u64, LedgerError>
    where
        F: Fn(u64) -> Result<u64, LedgerError> + Send + Sync,
    {
        let lock = self.user_lock(user);
        let _serialized = lock.lock().await;

        let key = make_key(USERS, user.as_str());
        for attempt in 1..=self.max_cas_retries {
            let (mut record, version) = self.load(user).await?;
            let new_balance = update(record.credits)?;
            record.credits = new_balance;

            match self
                .backend
                .put_if_version(&key, &encode(&key, &record)?, version)
                .await
            {
                Ok(_) => return Ok(new_balance),
                Err(StorageError::VersionConflict { .. }) => {
                    tracing::trace!(user = %user, attempt, "balance CAS conflict, retrying");
                    if attempt < self.max_cas_retries {
                        tokio::time::sleep(cas_backoff(attempt)).await;
                    }
                },
                Err(StorageError::NotFound { .. }) => {
                    return Err(LedgerError::NotFound { user: user.clone() });
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(LedgerError::Contention {
            user: user.clone(),
            attempts: self.max_cas_retries,
        })
    }
}

#[async_trait]
impl<B: StorageBackend> CreditLedger for KvCreditLedger<B> {
    async fn balance(&self, user: &UserId) -> Result<u64, LedgerError> {
        Ok(self.load(user).await?.0.credits)
    }

    async fn try_deduct(&self, user: &UserId, amount: u64) -> Result<u64, LedgerError> {
        self.update_balance(user, |balance| {
            balance
                .checked_sub(amount)
                .ok_or_else(|| LedgerError::InsufficientCredits {
                    user: user.clone(),
                    balance,
                    requested: amount,
                })
        })
        .await
    }

    async fn set(&self, user: &UserId, new_balance: u64) -> Result<UserCredits, LedgerError> {
        let credits = self.update_balance(user, |_| Ok(new_balance)).await?;
        Ok(UserCredits {
            name: user.clone(),
            credits,
        })
    }

    async fn increment(&self, user: &UserId, delta: i64) -> Result<UserCredits, LedgerError> {
        let credits = self
            .update_balance(user, |balance| {
                if delta >= 0 {
                    Ok(balance.saturating_add(delta.unsigned_abs()))
                } else {
                    balance.checked_sub(delta.unsigned_abs()).ok_or_else(|| {
                        LedgerError::InsufficientCredits {
                            user: user.clone(),
                            balance,
                            requested: delta.unsigned_abs(),
                        }
                    })
                }
            })
            .await?;
        Ok(UserCredits {
            name: user.clone(),
            credits,
        })
    }
}

#[async_trait]
impl<B: StorageBackend> IdentityStore for KvCreditLedger<B> {
    async fn find_by_credential(
        &self,
        credential: &Credential,
    ) -> Result<Option<UserRecord>, StorageError> {
        let credential_key = make_key(CREDENTIALS, credential.expose());
        let name: UserId = match self.backend.get(&credential_key).await {
            Ok(versioned) => decode(&credential_key, &versioned.data)?,
            Err(StorageError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let user_key = make_key(USERS, name.as_str());
        let record: UserRecord = match self.backend.get(&user_key).await {
            Ok(versioned) => decode(&user_key, &versioned.data)?,
            Err(StorageError::NotFound { .. }) => {
                tracing::warn!(user = %name, "credential index points at a missing user");
                return Ok(None);
            },
            Err(e) => return Err(e),
        };

        if record.api_key != *credential {
            tracing::warn!(
                user = %name,
                credential = %credential,
                "stale credential index entry (returning no match)"
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn list_users(&self) -> Result<Vec<UserId>, StorageError> {
        let mut names = self
            .backend
            .list_by_prefix(&make_prefix(USERS))
            .await?
            .into_iter()
            .map(|(key, versioned)| decode::<UserRecord>(&key, &versioned.data).map(|r| r.name))
            .collect::<Result<Vec<_>, _>>()?;
        names.sort();
        Ok(names)
    }
}
