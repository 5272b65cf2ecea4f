//! Admission and reconciliation.
//!
//! [`AdmissionEngine`] decides whether a task may run given the caller's
//! balance, dispatches it, and settles the ledger once a successful outcome
//! is observed. Collaborators are injected at construction and the engine
//! keeps no per-request state of its own.
//!
//! # Policies
//!
//! Under [`DeductionPolicy::Eager`] the charge is taken with an atomic
//! `try_deduct` before dispatch. Under [`DeductionPolicy::Fair`] admission
//! only checks the ledger balance, and the charge is applied by the first
//! [`fair_poll`](AdmissionEngine::fair_poll) that observes the task
//! succeeded. The policy is stored on each task's history record, so a task
//! is only ever charged the way it was admitted.
//!
//! # Partial failures
//!
//! If dispatch or tracking fails after an eager deduction the user stays
//! charged. The engine logs the event at `error` level and returns
//! [`GateError::DispatchFailed`] or [`GateError::TrackingFailed`] with
//! `charged: true`; no refund is attempted. Under the fair policy the same
//! errors carry `charged: false`.

use std::future::Future;
use std::sync::Arc;

use crate::config::{Capability, GateConfig};
use crate::error::GateError;
use crate::gateway::{GatewayError, TaskGateway, TaskReport};
use crate::history::{HistoryError, KvTaskHistoryStore, TaskHistoryStore};
use crate::identity::{IdentityCache, IdentityResolver};
use crate::ledger::{CreditLedger, KvCreditLedger};
use crate::store::backend::StorageBackend;
use crate::types::{
    CachedIdentity, Credential, DeductionPolicy, TaskHandle, TaskHistoryRecord, TaskPayload,
    TaskState, TaskStatusResponse, TaskSubmitted, UserCredits, UserId, UserSummary,
};

const ADMIN_ONLY: &str = "Only admin users can update credits.";

/// Credit-gated task admission.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use credit_gate::config::GateConfig;
/// use credit_gate::engine::AdmissionEngine;
/// use credit_gate::gateway::{AddHandler, LocalGateway};
/// use credit_gate::identity::InMemoryIdentityCache;
/// use credit_gate::ledger::KvCreditLedger;
/// use credit_gate::store::memory::InMemoryBackend;
/// use credit_gate::types::{Credential, TaskPayload};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let backend = Arc::new(InMemoryBackend::new());
/// KvCreditLedger::new(Arc::clone(&backend))
///     .create_user("test_user1", "550e8400", 500)
///     .await
///     .unwrap();
///
/// let engine = AdmissionEngine::with_kv_backend(
///     backend,
///     Arc::new(InMemoryIdentityCache::new()),
///     Arc::new(LocalGateway::new().with_handler(AddHandler)),
///     GateConfig::default(),
/// );
/// let submitted = engine
///     .submit(
///         &Credential::new("550e8400"),
///         TaskPayload::new("worker.add", vec![json!(3), json!(5)]),
///     )
///     .await
///     .unwrap();
/// assert!(!submitted.task_id.as_str().is_empty());
/// # }
/// ```
#[derive(Clone)]
pub struct AdmissionEngine {
    ledger: Arc<dyn CreditLedger>,
    history: Arc<dyn TaskHistoryStore>,
    gateway: Arc<dyn TaskGateway>,
    resolver: Arc<IdentityResolver>,
    config: GateConfig,
}

impl std::fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("resolver", &self.resolver)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AdmissionEngine {
    /// Creates an engine from its collaborators with the default
    /// configuration.
    pub fn new(
        ledger: Arc<dyn CreditLedger>,
        history: Arc<dyn TaskHistoryStore>,
        gateway: Arc<dyn TaskGateway>,
        resolver: Arc<IdentityResolver>,
    ) -> Self {
        Self {
            ledger,
            history,
            gateway,
            resolver,
            config: GateConfig::default(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    /// Wires ledger, identity store and history over one storage backend,
    /// applying the cache and retry settings from `config`.
    pub fn with_kv_backend<B: StorageBackend + 'static>(
        backend: Arc<B>,
        cache: Arc<dyn IdentityCache>,
        gateway: Arc<dyn TaskGateway>,
        config: GateConfig,
    ) -> Self {
        let ledger = Arc::new(
            KvCreditLedger::new(Arc::clone(&backend)).with_max_cas_retries(config.max_cas_retries),
        );
        let history =
            Arc::new(KvTaskHistoryStore::new(backend).with_max_cas_retries(config.max_cas_retries));
        let resolver = IdentityResolver::new(ledger.clone(), cache)
            .with_region(config.cache_region.clone())
            .with_ttl(config.cache_ttl());
        Self::new(ledger, history, gateway, Arc::new(resolver)).with_config(config)
    }

    /// The active configuration.
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Admits and dispatches a task for the credential's owner.
    ///
    /// # Errors
    ///
    /// - [`GateError::Unauthorized`] for an unknown credential.
    /// - [`GateError::InsufficientCredits`] if the balance cannot cover the
    ///   task cost. Nothing is charged, dispatched or recorded.
    /// - [`GateError::DispatchFailed`] if the gateway fails or times out;
    ///   `charged` tells whether an eager deduction already happened.
    /// - [`GateError::TrackingFailed`] if the task was dispatched but its
    ///   history record could not be written.
    pub async fn submit(
        &self,
        credential: &Credential,
        payload: TaskPayload,
    ) -> Result<TaskSubmitted, GateError> {
        self.require(Capability::Submit)?;
        let user = self.resolver.resolve(credential).await?;
        let cost = self.config.task_cost;
        let policy = self.config.policy;

        self.admit(&user.name, cost, policy).await?;
        let charged = policy == DeductionPolicy::Eager;

        let handle = match self.call_gateway(self.gateway.submit(payload)).await {
            Ok(handle) => handle,
            Err((timed_out, message)) => {
                if charged {
                    tracing::error!(
                        user = %user.name,
                        cost,
                        %policy,
                        timed_out,
                        error = %message,
                        "task dispatch failed after deduction; user remains charged"
                    );
                } else {
                    tracing::warn!(
                        user = %user.name,
                        %policy,
                        timed_out,
                        error = %message,
                        "task dispatch failed"
                    );
                }
                return Err(GateError::DispatchFailed {
                    user: user.name,
                    charged,
                    timed_out,
                    message,
                });
            },
        };

        let record = TaskHistoryRecord::new(user.name.clone(), handle.clone(), cost, policy);
        if let Err(e) = self.history.record(&record).await {
            tracing::error!(
                user = %user.name,
                task_handle = %handle,
                cost,
                %policy,
                charged,
                error = %e,
                "task dispatched but history record not written"
            );
            return Err(GateError::TrackingFailed {
                user: user.name,
                handle,
                charged,
                message: e.to_string(),
            });
        }

        tracing::info!(user = %user.name, task_handle = %handle, cost, %policy, "task admitted");
        Ok(TaskSubmitted { task_id: handle })
    }

    /// Reports a task's state without touching the ledger.
    ///
    /// Under the eager policy this is a plain read-through. Under the fair
    /// policy the result is withheld, since only
    /// [`fair_poll`](Self::fair_poll) settles the deferred charge.
    ///
    /// # Errors
    ///
    /// [`GateError::PollFailed`] if the gateway fails or times out. Safe to
    /// retry.
    pub async fn poll(&self, handle: &TaskHandle) -> Result<TaskStatusResponse, GateError> {
        self.require(Capability::Poll)?;
        let report = self.poll_gateway(handle).await?;
        let mut response = status(handle, report);
        if self.config.policy == DeductionPolicy::Fair && response.result.take().is_some() {
            tracing::debug!(task_handle = %handle, "result withheld until settled by fair_poll");
        }
        Ok(response)
    }

    /// Reports a task's state and, once it has succeeded, applies the
    /// deferred charge for a task admitted under the fair policy.
    ///
    /// The charge is applied at most once per task however often this is
    /// called. Reconciliation problems are logged and never fail the poll,
    /// but the result is only returned once the task is paid for: a task the
    /// caller does not own, or whose charge could not be applied yet, reports
    /// its state without a result.
    ///
    /// # Errors
    ///
    /// [`GateError::Unauthorized`] for an unknown credential and
    /// [`GateError::PollFailed`] if the gateway fails or times out.
    pub async fn fair_poll(
        &self,
        credential: &Credential,
        handle: &TaskHandle,
    ) -> Result<TaskStatusResponse, GateError> {
        self.require(Capability::FairPoll)?;
        let user = self.resolver.resolve(credential).await?;
        let report = self.poll_gateway(handle).await?;
        let settled = report.state != TaskState::Succeeded
            || self.reconcile(&user.name, handle).await;
        let mut response = status(handle, report);
        if !settled {
            response.result = None;
        }
        Ok(response)
    }

    /// Returns a user's balance. Admin only.
    ///
    /// # Errors
    ///
    /// [`GateError::Forbidden`] for non-admin callers and
    /// [`GateError::NotFound`] for an unknown target.
    pub async fn get_credits(
        &self,
        credential: &Credential,
        target: &UserId,
    ) -> Result<UserCredits, GateError> {
        self.require(Capability::Credits)?;
        self.authorize_admin(credential).await?;
        let credits = self.ledger.balance(target).await?;
        Ok(UserCredits {
            name: target.clone(),
            credits,
        })
    }

    /// Overwrites a user's balance. Admin only.
    ///
    /// # Errors
    ///
    /// [`GateError::Forbidden`] for non-admin callers and
    /// [`GateError::NotFound`] for an unknown target; nothing is mutated in
    /// either case.
    pub async fn set_credits(
        &self,
        credential: &Credential,
        target: &UserId,
        new_balance: u64,
    ) -> Result<UserCredits, GateError> {
        self.require(Capability::Credits)?;
        let admin = self.authorize_admin(credential).await?;
        let updated = self.ledger.set(target, new_balance).await?;
        tracing::info!(
            admin = %admin.name,
            user = %target,
            credits = updated.credits,
            "credits set"
        );
        Ok(updated)
    }

    /// Adds `delta` (which may be negative) to a user's balance. Admin only.
    ///
    /// # Errors
    ///
    /// As [`set_credits`](Self::set_credits), plus
    /// [`GateError::InsufficientCredits`] if a negative `delta` exceeds the
    /// balance.
    pub async fn add_credits(
        &self,
        credential: &Credential,
        target: &UserId,
        delta: i64,
    ) -> Result<UserCredits, GateError> {
        self.require(Capability::Credits)?;
        let admin = self.authorize_admin(credential).await?;
        let updated = self.ledger.increment(target, delta).await?;
        tracing::info!(
            admin = %admin.name,
            user = %target,
            delta,
            credits = updated.credits,
            "credits adjusted"
        );
        Ok(updated)
    }

    /// Lists user names. Keys and balances are never included.
    pub async fn list_users(&self) -> Result<Vec<UserSummary>, GateError> {
        self.require(Capability::Users)?;
        Ok(self
            .resolver
            .store()
            .list_users()
            .await?
            .into_iter()
            .map(|name| UserSummary { name })
            .collect())
    }

    fn require(&self, capability: Capability) -> Result<(), GateError> {
        if self.config.capabilities.is_enabled(capability) {
            return Ok(());
        }
        tracing::warn!(capability = capability.as_str(), "request for disabled capability");
        Err(GateError::ServiceUnavailable {
            capability: capability.as_str(),
        })
    }

    async fn authorize_admin(&self, credential: &Credential) -> Result<CachedIdentity, GateError> {
        let caller = self.resolver.resolve(credential).await?;
        if caller.name != self.config.admin_user {
            tracing::info!(user = %caller.name, "credit operation rejected for non-admin");
            return Err(GateError::Forbidden {
                reason: ADMIN_ONLY.to_string(),
            });
        }
        Ok(caller)
    }

    /// Checks (fair) or takes (eager) the charge for a new task.
    async fn admit(
        &self,
        user: &UserId,
        cost: u64,
        policy: DeductionPolicy,
    ) -> Result<(), GateError> {
        let outcome = match policy {
            DeductionPolicy::Eager => self
                .ledger
                .try_deduct(user, cost)
                .await
                .map_err(GateError::from),
            DeductionPolicy::Fair => match self.ledger.balance(user).await {
                Ok(balance) if balance >= cost => Ok(balance),
                Ok(_) => Err(GateError::InsufficientCredits {
                    user: user.clone(),
                    cost,
                }),
                Err(e) => Err(e.into()),
            },
        };
        match outcome {
            Ok(balance) => {
                tracing::debug!(user = %user, cost, %policy, balance, "admission check passed");
                Ok(())
            },
            Err(e @ GateError::InsufficientCredits { .. }) => {
                tracing::info!(user = %user, cost, %policy, "task rejected: insufficient credits");
                Err(e)
            },
            Err(e) => Err(e),
        }
    }

    async fn poll_gateway(&self, handle: &TaskHandle) -> Result<TaskReport, GateError> {
        self.call_gateway(self.gateway.poll(handle))
            .await
            .map_err(|(timed_out, message)| {
                tracing::warn!(
                    task_handle = %handle,
                    timed_out,
                    error = %message,
                    "task poll failed"
                );
                GateError::PollFailed {
                    handle: handle.clone(),
                    timed_out,
                    message,
                }
            })
    }

    /// Bounds a gateway call by the configured timeout. Errors come back as
    /// `(timed_out, message)`.
    async fn call_gateway<T, F>(&self, call: F) -> Result<T, (bool, String)>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let timeout = self.config.gateway_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err((false, e.to_string())),
            Err(_) => Err((true, format!("no response within {timeout:?}"))),
        }
    }

    /// Applies the deferred charge for a succeeded task at most once.
    /// Returns whether the task is paid for.
    async fn reconcile(&self, user: &UserId, handle: &TaskHandle) -> bool {
        let record = match self.history.lookup(user, handle).await {
            Ok(record) => record,
            Err(HistoryError::NotFound { .. }) => {
                tracing::error!(
                    user = %user,
                    task_handle = %handle,
                    "succeeded task has no history record for this user; not charging"
                );
                return false;
            },
            Err(e) => {
                tracing::error!(
                    user = %user,
                    task_handle = %handle,
                    error = %e,
                    "history lookup failed; charge deferred"
                );
                return false;
            },
        };
        if record.policy != DeductionPolicy::Fair {
            tracing::debug!(
                user = %user,
                task_handle = %handle,
                policy = %record.policy,
                "task was charged at admission"
            );
            return true;
        }
        if record.is_reconciled() {
            return true;
        }

        let claimed = match self.history.claim_reconciliation(user, handle).await {
            Ok(Some(claimed)) => claimed,
            // Another poll holds the marker and is charging.
            Ok(None) => return true,
            Err(e) => {
                tracing::error!(
                    user = %user,
                    task_handle = %handle,
                    error = %e,
                    "could not claim reconciliation; charge deferred"
                );
                return false;
            },
        };

        let delta = i64::try_from(claimed.cost).map_or(i64::MIN, |cost| -cost);
        match self.ledger.increment(user, delta).await {
            Ok(updated) => {
                tracing::info!(
                    user = %user,
                    task_handle = %handle,
                    cost = claimed.cost,
                    balance = updated.credits,
                    "deferred charge applied"
                );
                true
            },
            Err(e) => {
                tracing::error!(
                    user = %user,
                    task_handle = %handle,
                    cost = claimed.cost,
                    error = %e,
                    "deferred charge failed; releasing reconciliation marker"
                );
                if let Err(release) = self.history.release_reconciliation(user, handle).await {
                    tracing::error!(
                        user = %user,
                        task_handle = %handle,
                        error = %release,
                        "reconciliation marker stuck; task will not be charged"
                    );
                }
                false
            },
        }
    }
}

fn status(handle: &TaskHandle, report: TaskReport) -> TaskStatusResponse {
    let result = if report.state == TaskState::Succeeded {
        report.result
    } else {
        None
    };
    TaskStatusResponse {
        task_id: handle.clone(),
        state: report.state,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AddHandler, LocalGateway};
    use crate::identity::InMemoryIdentityCache;
    use crate::store::memory::InMemoryBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const ADMIN_KEY: &str = "123e4567-e89b-12d3-a456-426614174000";
    const USER_KEY: &str = "550e8400-e29b-41d4-a716-446655440000";

    async fn engine(config: GateConfig, balance: u64) -> AdmissionEngine {
        let backend = Arc::new(InMemoryBackend::new());
        let ledger = KvCreditLedger::new(Arc::clone(&backend));
        ledger.create_user("admin", ADMIN_KEY, 1000).await.unwrap();
        ledger.create_user("test_user1", USER_KEY, balance).await.unwrap();
        AdmissionEngine::with_kv_backend(
            backend,
            Arc::new(InMemoryIdentityCache::new()),
            Arc::new(LocalGateway::new().with_handler(AddHandler)),
            config,
        )
    }

    fn add(x: i64, y: i64) -> TaskPayload {
        TaskPayload::new("worker.add", vec![json!(x), json!(y)])
    }

    async fn balance(engine: &AdmissionEngine) -> u64 {
        engine
            .get_credits(&Credential::new(ADMIN_KEY), &UserId::new("test_user1"))
            .await
            .unwrap()
            .credits
    }

    #[tokio::test]
    async fn eager_submit_charges_up_front() {
        let engine = engine(GateConfig::default(), 25).await;
        engine.submit(&Credential::new(USER_KEY), add(1, 2)).await.unwrap();
        assert_eq!(balance(&engine).await, 15);
    }

    #[tokio::test]
    async fn fair_submit_checks_without_charging() {
        let config = GateConfig {
            policy: DeductionPolicy::Fair,
            ..Default::default()
        };
        let engine = engine(config, 10).await;
        engine.submit(&Credential::new(USER_KEY), add(1, 2)).await.unwrap();
        assert_eq!(balance(&engine).await, 10);
    }

    #[tokio::test]
    async fn fair_submit_rejects_when_balance_is_short() {
        let config = GateConfig {
            policy: DeductionPolicy::Fair,
            ..Default::default()
        };
        let engine = engine(config, 9).await;
        let err = engine
            .submit(&Credential::new(USER_KEY), add(1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::InsufficientCredits { cost: 10, .. }));
    }

    #[tokio::test]
    async fn unknown_credential_is_unauthorized() {
        let engine = engine(GateConfig::default(), 10).await;
        let err = engine
            .submit(&Credential::new("nope"), add(1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Unauthorized));
    }

    #[tokio::test]
    async fn admin_only_credit_operations() {
        let engine = engine(GateConfig::default(), 10).await;
        let err = engine
            .set_credits(&Credential::new(USER_KEY), &UserId::new("test_user1"), 999)
            .await
            .unwrap_err();
        assert_eq!(err.public_message(), ADMIN_ONLY);
        assert_eq!(balance(&engine).await, 10);
    }

    #[tokio::test]
    async fn add_credits_tops_up() {
        let engine = engine(GateConfig::default(), 10).await;
        let updated = engine
            .add_credits(&Credential::new(ADMIN_KEY), &UserId::new("test_user1"), 40)
            .await
            .unwrap();
        assert_eq!(updated.credits, 50);
    }

    #[tokio::test]
    async fn list_users_returns_names_only() {
        let engine = engine(GateConfig::default(), 10).await;
        let users = engine.list_users().await.unwrap();
        assert_eq!(
            users,
            vec![
                UserSummary {
                    name: UserId::new("admin")
                },
                UserSummary {
                    name: UserId::new("test_user1")
                },
            ]
        );
    }

    #[test]
    fn status_drops_result_unless_succeeded() {
        let report = TaskReport {
            state: TaskState::Failed,
            result: Some(json!("boom")),
        };
        assert_eq!(status(&TaskHandle::new("t"), report).result, None);
    }
}
