//! Core domain and wire types.
//!
//! The financial record ([`UserRecord`]) and its cacheable projection
//! ([`CachedIdentity`]) are distinct types: the projection has no balance
//! field, so a cache hit can never be mistaken for credit data.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable, unique user identity key (the user's name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identity key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque bearer credential (API key).
///
/// `Debug` and `Display` only reveal the first three characters.
///
/// ```
/// use credit_gate::types::Credential;
///
/// let key = Credential::new("550e8400-e29b-41d4-a716-446655440000");
/// assert_eq!(key.to_string(), "550...");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Wraps a raw credential string.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Returns the raw secret. Never log this value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns the log-safe prefix of the credential.
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(3).collect();
        format!("{prefix}...")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.redacted()).finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl From<&str> for Credential {
    fn from(secret: &str) -> Self {
        Self::new(secret)
    }
}

impl From<String> for Credential {
    fn from(secret: String) -> Self {
        Self(secret)
    }
}

/// The system-of-record user row, owned by the credit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Identity key.
    pub name: UserId,
    /// Credential secret.
    pub api_key: Credential,
    /// Current credit balance.
    pub credits: u64,
}

impl UserRecord {
    /// Projects the non-financial fields for caching.
    pub fn identity(&self) -> CachedIdentity {
        CachedIdentity {
            name: self.name.clone(),
            api_key: self.api_key.clone(),
        }
    }
}

/// Denormalized, cacheable projection of a [`UserRecord`].
///
/// Structurally excludes the balance. Any code that needs credits must ask
/// the [`CreditLedger`](crate::ledger::CreditLedger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedIdentity {
    /// Identity key.
    pub name: UserId,
    /// Credential secret.
    pub api_key: Credential,
}

/// Opaque task identifier issued by the task gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    /// Wraps a gateway-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskHandle {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Task lifecycle state as observed through the gateway.
///
/// ```text
/// Submitted (implicit) -> Pending | Running -> Succeeded | Failed
/// ```
///
/// `Succeeded` and `Failed` are terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Queued, not yet picked up by a worker (or not yet visible).
    Pending,
    /// A worker is executing the task.
    Running,
    /// Completed successfully (terminal).
    Succeeded,
    /// Completed with an error (terminal).
    Failed,
}

impl TaskState {
    /// Returns `true` for `Succeeded` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Opaque unit of billable work handed to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Registered task name, e.g. `"worker.add"`.
    pub name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

impl TaskPayload {
    /// Creates a payload for the named task.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// When credits are deducted for an admitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionPolicy {
    /// Deduct at submission, before the work runs.
    #[default]
    Eager,
    /// Deduct once a successful completion has been observed.
    Fair,
}

impl fmt::Display for DeductionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eager => write!(f, "eager"),
            Self::Fair => write!(f, "fair"),
        }
    }
}

/// One admitted task, written once at admission.
///
/// `reconciled_at` is the only mutable field: it is claimed (set) before a
/// deferred deduction and guarantees at most one deduction per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHistoryRecord {
    /// Submitting user.
    pub user_name: UserId,
    /// Gateway handle.
    pub task_id: TaskHandle,
    /// Charge for the task.
    pub cost: u64,
    /// Policy used at admission.
    pub policy: DeductionPolicy,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// When the deferred deduction was applied, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl TaskHistoryRecord {
    /// Creates an unreconciled record stamped with the current time.
    pub fn new(
        user_name: UserId,
        task_id: TaskHandle,
        cost: u64,
        policy: DeductionPolicy,
    ) -> Self {
        Self {
            user_name,
            task_id,
            cost,
            policy,
            created_at: Utc::now(),
            reconciled_at: None,
        }
    }

    /// Returns `true` once the deferred deduction has been claimed.
    pub fn is_reconciled(&self) -> bool {
        self.reconciled_at.is_some()
    }
}

/// Response to a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSubmitted {
    /// Handle for later polling.
    pub task_id: TaskHandle,
}

/// State (and result, when succeeded) of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    /// The polled task.
    pub task_id: TaskHandle,
    /// Current state.
    pub state: TaskState,
    /// Result value, present iff `state` is `Succeeded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// A user's balance as reported to administrators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredits {
    /// User name.
    pub name: UserId,
    /// Balance.
    pub credits: u64,
}

/// Public user listing entry (name only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    /// User name.
    pub name: UserId,
}
