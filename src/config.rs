//! Gate configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`credit-gate.toml`)
//! 2. Environment variables (with `CREDIT_GATE_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [credit_gate]
//! policy = "fair"
//! task_cost = 10
//! admin_user = "admin"
//! gateway_timeout_ms = 5000
//! cache_region = "identity"
//! cache_ttl_secs = 300
//!
//! [credit_gate.capabilities]
//! submit = true
//! fair_poll = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::DEFAULT_MAX_CAS_RETRIES;
use crate::types::{DeductionPolicy, UserId};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "credit-gate.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CREDIT_GATE_";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Deduction policy for new admissions.
    pub policy: DeductionPolicy,

    /// Credits charged per task.
    pub task_cost: u64,

    /// The only identity allowed to read or change balances.
    pub admin_user: UserId,

    /// Bound on each gateway `submit`/`poll` call.
    pub gateway_timeout_ms: u64,

    /// Cache region for identity entries.
    pub cache_region: String,

    /// Expiry for identity cache entries. `None` keeps them indefinitely.
    pub cache_ttl_secs: Option<u64>,

    /// Compare-and-swap attempts before a ledger or history write gives up.
    pub max_cas_retries: usize,

    /// Per-operation switches.
    pub capabilities: CapabilityConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            policy: DeductionPolicy::Eager,
            task_cost: 10,
            admin_user: UserId::new("admin"),
            gateway_timeout_ms: 5000,
            cache_region: crate::identity::DEFAULT_REGION.to_string(),
            cache_ttl_secs: None,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
            capabilities: CapabilityConfig::default(),
        }
    }
}

impl GateConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. `credit-gate.toml` in the working directory
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if let Ok(contents) = std::fs::read_to_string(CONFIG_FILE) {
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply environment
    /// overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML content.
    ///
    /// Settings may sit under a `[credit_gate]` table or at the top level.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut table: toml::Table =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let section = match table.remove("credit_gate") {
            Some(section) => section,
            None => toml::Value::Table(table),
        };
        section
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
    }

    /// Apply `CREDIT_GATE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Apply overrides from `lookup`, which maps an unprefixed variable name
    /// (e.g. `TASK_COST`) to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("POLICY") {
            self.policy = match v.to_ascii_lowercase().as_str() {
                "eager" => DeductionPolicy::Eager,
                "fair" => DeductionPolicy::Fair,
                _ => return Err(invalid_env("POLICY", &v)),
            };
        }
        if let Some(v) = lookup("TASK_COST") {
            self.task_cost = parse_env("TASK_COST", &v)?;
        }
        if let Some(v) = lookup("ADMIN_USER") {
            self.admin_user = UserId::new(v);
        }
        if let Some(v) = lookup("GATEWAY_TIMEOUT_MS") {
            self.gateway_timeout_ms = parse_env("GATEWAY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("CACHE_REGION") {
            self.cache_region = v;
        }
        if let Some(v) = lookup("CACHE_TTL_SECS") {
            self.cache_ttl_secs = if v.is_empty() {
                None
            } else {
                Some(parse_env("CACHE_TTL_SECS", &v)?)
            };
        }
        if let Some(v) = lookup("MAX_CAS_RETRIES") {
            self.max_cas_retries = parse_env("MAX_CAS_RETRIES", &v)?;
        }

        for capability in Capability::ALL {
            let name = format!("CAPABILITY_{}", capability.as_str().to_ascii_uppercase());
            if let Some(v) = lookup(&name) {
                self.capabilities.set(capability, parse_env(&name, &v)?);
            }
        }
        Ok(())
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "gateway_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_cas_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_cas_retries must be greater than zero".to_string(),
            ));
        }
        if self.admin_user.as_str().is_empty() {
            return Err(ConfigError::Invalid("admin_user must not be empty".to_string()));
        }
        Ok(())
    }

    /// Gateway call bound as a [`Duration`].
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    /// Identity cache expiry as a [`Duration`].
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid_env(name, value))
}

fn invalid_env(name: &str, value: &str) -> ConfigError {
    ConfigError::Env {
        name: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
    }
}

/// Engine operations that can be switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Task submission.
    Submit,
    /// Read-through polling.
    Poll,
    /// Polling with deferred reconciliation.
    FairPoll,
    /// Balance reads and writes.
    Credits,
    /// User listing.
    Users,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 5] = [
        Self::Submit,
        Self::Poll,
        Self::FairPoll,
        Self::Credits,
        Self::Users,
    ];

    /// Configuration key for this capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Poll => "poll",
            Self::FairPoll => "fair_poll",
            Self::Credits => "credits",
            Self::Users => "users",
        }
    }
}

/// Capability switches. All enabled by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct CapabilityConfig {
    /// Accept task submissions.
    pub submit: bool,

    /// Serve read-through polls.
    pub poll: bool,

    /// Serve reconciling polls.
    pub fair_poll: bool,

    /// Serve balance reads and writes.
    pub credits: bool,

    /// Serve the user listing.
    pub users: bool,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            submit: true,
            poll: true,
            fair_poll: true,
            credits: true,
            users: true,
        }
    }
}

impl CapabilityConfig {
    /// Returns whether `capability` is switched on.
    pub fn is_enabled(&self, capability: Capability) -> bool {
        match capability {
            Capability::Submit => self.submit,
            Capability::Poll => self.poll,
            Capability::FairPoll => self.fair_poll,
            Capability::Credits => self.credits,
            Capability::Users => self.users,
        }
    }

    /// Switches `capability` on or off.
    pub fn set(&mut self, capability: Capability, enabled: bool) {
        match capability {
            Capability::Submit => self.submit = enabled,
            Capability::Poll => self.poll = enabled,
            Capability::FairPoll => self.fair_poll = enabled,
            Capability::Credits => self.credits = enabled,
            Capability::Users => self.users = enabled,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading configuration file.
    #[error("Failed to read config file '{path}': {error}")]
    Io {
        /// Path to the configuration file.
        path: String,
        /// Error message.
        error: String,
    },

    /// Parse error in configuration.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// An environment override could not be parsed.
    #[error("Invalid value for {name}: {value:?}")]
    Env {
        /// Full variable name.
        name: String,
        /// Rejected value.
        value: String,
    },

    /// A setting is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}
