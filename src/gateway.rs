//! Boundary to the asynchronous task execution service.
//!
//! The engine only needs two calls: [`TaskGateway::submit`] hands work off
//! and returns a [`TaskHandle`] without waiting for completion, and
//! [`TaskGateway::poll`] reports the current [`TaskReport`] for a handle.
//! Both may be called from any number of concurrent requests.
//!
//! [`LocalGateway`] is an in-process implementation that runs registered
//! [`TaskHandler`]s on spawned tokio tasks. A deployment fronting a real
//! broker implements [`TaskGateway`] over its client instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use crate::types::{TaskHandle, TaskPayload, TaskState};

/// Task name served by [`AddHandler`].
pub const ADD_TASK: &str = "worker.add";

/// Errors from the execution service.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The service could not be reached or refused the call.
    #[error("task gateway unavailable: {message}")]
    Unavailable {
        /// Diagnostic detail.
        message: String,
    },

    /// A handler rejected its arguments or failed while running.
    #[error("task failed: {message}")]
    TaskFailed {
        /// Diagnostic detail.
        message: String,
    },
}

/// Observed state of one task.
///
/// `result` is present iff `state` is [`TaskState::Succeeded`]; the
/// constructors keep it that way.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    /// Current state.
    pub state: TaskState,
    /// Result value of a succeeded task.
    pub result: Option<Value>,
}

impl TaskReport {
    /// A queued task.
    pub fn pending() -> Self {
        Self {
            state: TaskState::Pending,
            result: None,
        }
    }

    /// A task a worker has picked up.
    pub fn running() -> Self {
        Self {
            state: TaskState::Running,
            result: None,
        }
    }

    /// A task that completed with `result`.
    pub fn succeeded(result: Value) -> Self {
        Self {
            state: TaskState::Succeeded,
            result: Some(result),
        }
    }

    /// A task that completed with an error.
    pub fn failed() -> Self {
        Self {
            state: TaskState::Failed,
            result: None,
        }
    }
}

/// Opaque execution service.
#[async_trait]
pub trait TaskGateway: Send + Sync {
    /// Dispatches `payload` and returns its handle. Never waits for the task
    /// to finish.
    async fn submit(&self, payload: TaskPayload) -> Result<TaskHandle, GatewayError>;

    /// Reports the current state of `handle`. Idempotent.
    async fn poll(&self, handle: &TaskHandle) -> Result<TaskReport, GatewayError>;
}

/// A unit of work the [`LocalGateway`] can run.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Registered task name, matched against [`TaskPayload::name`].
    fn name(&self) -> &str;

    /// Runs the task with positional arguments.
    async fn handle(&self, args: Vec<Value>) -> Result<Value, GatewayError>;
}

/// `worker.add`: sums two numbers.
///
/// Integer inputs give an integer result; anything else numeric is summed
/// as `f64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddHandler;

#[async_trait]
impl TaskHandler for AddHandler {
    fn name(&self) -> &str {
        ADD_TASK
    }

    async fn handle(&self, args: Vec<Value>) -> Result<Value, GatewayError> {
        let [x, y] = args.as_slice() else {
            return Err(GatewayError::TaskFailed {
                message: format!("{ADD_TASK} expects 2 arguments, got {}", args.len()),
            });
        };
        if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
            if let Some(sum) = x.checked_add(y) {
                return Ok(Value::from(sum));
            }
        }
        match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Ok(Value::from(x + y)),
            _ => Err(GatewayError::TaskFailed {
                message: format!("{ADD_TASK} expects numbers, got {x} and {y}"),
            }),
        }
    }
}

/// In-process gateway running handlers on the tokio runtime.
///
/// Handles are random UUIDs. Polling a handle this gateway never issued
/// reports `Pending`, the same answer a broker gives for a task that is not
/// visible yet.
///
/// # Examples
///
/// ```
/// use credit_gate::gateway::{AddHandler, LocalGateway, TaskGateway};
/// use credit_gate::types::{TaskPayload, TaskState};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let gateway = LocalGateway::new().with_handler(AddHandler);
/// let handle = gateway
///     .submit(TaskPayload::new("worker.add", vec![json!(3), json!(5)]))
///     .await
///     .unwrap();
/// let report = loop {
///     let report = gateway.poll(&handle).await.unwrap();
///     if report.state.is_terminal() {
///         break report;
///     }
///     tokio::task::yield_now().await;
/// };
/// assert_eq!(report.state, TaskState::Succeeded);
/// assert_eq!(report.result, Some(json!(8)));
/// # }
/// ```
#[derive(Clone, Default)]
pub struct LocalGateway {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    tasks: Arc<DashMap<TaskHandle, TaskReport>>,
}

impl std::fmt::Debug for LocalGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGateway")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl LocalGateway {
    /// Creates a gateway with no handlers registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its [`name`](TaskHandler::name).
    pub fn with_handler(mut self, handler: impl TaskHandler + 'static) -> Self {
        self.handlers
            .insert(handler.name().to_string(), Arc::new(handler));
        self
    }

    fn set(tasks: &DashMap<TaskHandle, TaskReport>, handle: &TaskHandle, report: TaskReport) {
        tasks.insert(handle.clone(), report);
    }
}

#[async_trait]
impl TaskGateway for LocalGateway {
    async fn submit(&self, payload: TaskPayload) -> Result<TaskHandle, GatewayError> {
        let handle = TaskHandle::new(uuid::Uuid::new_v4().to_string());
        Self::set(&self.tasks, &handle, TaskReport::pending());

        let handler = self.handlers.get(&payload.name).cloned();
        let tasks = Arc::clone(&self.tasks);
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let Some(handler) = handler else {
                tracing::warn!(
                    task_handle = %task_handle,
                    task = %payload.name,
                    "no handler registered for task"
                );
                Self::set(&tasks, &task_handle, TaskReport::failed());
                return;
            };
            Self::set(&tasks, &task_handle, TaskReport::running());
            let report = match handler.handle(payload.args).await {
                Ok(result) => TaskReport::succeeded(result),
                Err(e) => {
                    tracing::warn!(task_handle = %task_handle, error = %e, "task failed");
                    TaskReport::failed()
                },
            };
            Self::set(&tasks, &task_handle, report);
        });

        tracing::debug!(task_handle = %handle, "task dispatched");
        Ok(handle)
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskReport, GatewayError> {
        Ok(self
            .tasks
            .get(handle)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(TaskReport::pending))
    }
}
