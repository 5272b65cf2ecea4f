//! Credit-gated task admission and reconciliation.
//!
//! Users hold a prepaid credit balance and pay for each task they submit.
//! This crate is the core that sits between the transport layer and the
//! external worker pool: it resolves bearer credentials, checks and charges
//! balances, dispatches work, and settles the ledger when outcomes are
//! observed.
//!
//! # Overview
//!
//! An [`AdmissionEngine`] is built once at startup from injected
//! collaborators:
//!
//! - a [`CreditLedger`](ledger::CreditLedger), the system of record for
//!   balances with an atomic check-and-deduct;
//! - a [`TaskHistoryStore`](history::TaskHistoryStore) recording who
//!   submitted which task at what cost;
//! - a [`TaskGateway`](gateway::TaskGateway) that dispatches and polls work;
//! - an [`IdentityResolver`](identity::IdentityResolver) with a read-through
//!   cache that never holds balances.
//!
//! Two deduction policies are supported. `eager` charges at submission;
//! `fair` charges once a successful completion is observed, exactly once per
//! task.
//!
//! # Module Organization
//!
//! - [`types`] - Domain and wire types
//! - [`error`] - [`GateError`] with HTTP status mapping
//! - [`store`] - Versioned key-value storage backends
//! - [`ledger`] - Balances and credential lookup
//! - [`history`] - Per-task admission records
//! - [`identity`] - Credential resolution and caching
//! - [`gateway`] - Task execution boundary and the in-process gateway
//! - [`engine`] - Admission and reconciliation
//! - [`config`] - TOML and environment configuration
//!
//! # Feature Flags
//!
//! - `logging` (default) - [`logging::init_logging`] via `tracing-subscriber`
//! - `redis` - Redis storage backend and identity cache
//! - `redis-tests` - runs the Redis tests against `REDIS_URL`

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod history;
pub mod identity;
pub mod ledger;
#[cfg(feature = "logging")]
pub mod logging;
pub mod store;
pub mod types;

// Re-exports for ergonomic access
pub use config::{Capability, CapabilityConfig, ConfigError, GateConfig};
pub use engine::AdmissionEngine;
pub use error::GateError;
pub use types::*;
