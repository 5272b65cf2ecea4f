//! Shared fixtures: seeded stores and a scriptable task gateway.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use credit_gate::gateway::{GatewayError, TaskGateway, TaskReport};
use credit_gate::identity::InMemoryIdentityCache;
use credit_gate::ledger::{CreditLedger, KvCreditLedger};
use credit_gate::store::backend::{StorageBackend, StorageError, VersionedRecord};
use credit_gate::store::memory::InMemoryBackend;
use credit_gate::{AdmissionEngine, Credential, GateConfig, TaskHandle, TaskPayload, UserId};

pub const ADMIN_KEY: &str = "123e4567-e89b-12d3-a456-426614174000";
pub const USER_KEY: &str = "550e8400-e29b-41d4-a716-446655440000";
pub const OTHER_KEY: &str = "c56a4180-65aa-42ec-a945-5fd21dec0538";

/// Gateway whose task states are driven by the test.
#[derive(Default)]
pub struct ScriptedGateway {
    next_id: AtomicUsize,
    reports: DashMap<TaskHandle, TaskReport>,
    submits: AtomicUsize,
    polls: AtomicUsize,
    fail_submit: AtomicBool,
    fail_poll: AtomicBool,
    submit_delay: Option<Duration>,
    poll_delay: Option<Duration>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = Some(delay);
        self
    }

    pub fn fail_submits(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_polls(&self, fail: bool) {
        self.fail_poll.store(fail, Ordering::SeqCst);
    }

    pub fn set(&self, handle: &TaskHandle, report: TaskReport) {
        self.reports.insert(handle.clone(), report);
    }

    pub fn complete(&self, handle: &TaskHandle, result: Value) {
        self.set(handle, TaskReport::succeeded(result));
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskGateway for ScriptedGateway {
    async fn submit(&self, _payload: TaskPayload) -> Result<TaskHandle, GatewayError> {
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable {
                message: "broker connection refused".to_string(),
            });
        }
        self.submits.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = TaskHandle::new(format!("task-{id}"));
        self.reports.insert(handle.clone(), TaskReport::pending());
        Ok(handle)
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskReport, GatewayError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.poll_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_poll.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable {
                message: "result backend unreachable".to_string(),
            });
        }
        Ok(self
            .reports
            .get(handle)
            .map(|r| r.value().clone())
            .unwrap_or_else(TaskReport::pending))
    }
}

/// In-memory backend that yields to the scheduler after every read, the way
/// a networked store suspends on each round trip.
#[derive(Debug, Default)]
pub struct YieldingBackend(InMemoryBackend);

impl YieldingBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for YieldingBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let record = self.0.get(key).await;
        tokio::task::yield_now().await;
        record
    }

    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        self.0.put_if_absent(key, data).await
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        self.0.put_if_version(key, data, expected_version).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.0.delete(key).await
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        self.0.list_by_prefix(prefix).await
    }
}

/// Seeded stores plus handles for inspecting them.
pub struct Harness {
    pub backend: Arc<InMemoryBackend>,
    pub ledger: Arc<KvCreditLedger<InMemoryBackend>>,
    pub cache: Arc<InMemoryIdentityCache>,
    pub gateway: Arc<ScriptedGateway>,
    pub engine: AdmissionEngine,
}

impl Harness {
    /// Seeds `admin` (1000), `test_user` (`balance`) and `other_user` (100).
    pub async fn new(config: GateConfig, balance: u64) -> Self {
        Self::with_gateway(config, balance, ScriptedGateway::new()).await
    }

    pub async fn with_gateway(config: GateConfig, balance: u64, gateway: ScriptedGateway) -> Self {
        let backend = Arc::new(InMemoryBackend::new());
        let ledger = Arc::new(KvCreditLedger::new(Arc::clone(&backend)));
        ledger.create_user("admin", ADMIN_KEY, 1000).await.unwrap();
        ledger.create_user("test_user", USER_KEY, balance).await.unwrap();
        ledger.create_user("other_user", OTHER_KEY, 100).await.unwrap();

        let cache = Arc::new(InMemoryIdentityCache::new());
        let gateway = Arc::new(gateway);
        let engine = AdmissionEngine::with_kv_backend(
            Arc::clone(&backend),
            cache.clone(),
            gateway.clone(),
            config,
        );
        Self {
            backend,
            ledger,
            cache,
            gateway,
            engine,
        }
    }

    /// A second engine over the same stores with a different configuration.
    pub fn engine_with(&self, config: GateConfig) -> AdmissionEngine {
        AdmissionEngine::with_kv_backend(
            Arc::clone(&self.backend),
            self.cache.clone(),
            self.gateway.clone(),
            config,
        )
    }

    pub async fn balance(&self, user: &str) -> u64 {
        self.ledger.balance(&UserId::new(user)).await.unwrap()
    }
}

pub fn user() -> Credential {
    Credential::new(USER_KEY)
}

pub fn admin() -> Credential {
    Credential::new(ADMIN_KEY)
}

pub fn other() -> Credential {
    Credential::new(OTHER_KEY)
}

pub fn add(x: i64, y: i64) -> TaskPayload {
    TaskPayload::new("worker.add", vec![Value::from(x), Value::from(y)])
}

pub fn config(policy: credit_gate::DeductionPolicy, task_cost: u64) -> GateConfig {
    GateConfig {
        policy,
        task_cost,
        ..Default::default()
    }
}
