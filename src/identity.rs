//! Credential resolution with a read-through cache.
//!
//! [`IdentityResolver`] maps a bearer [`Credential`] to a [`CachedIdentity`].
//! The cache stores only the non-financial projection of a user, so nothing
//! read from it can stand in for a balance.
//!
//! Cache access is best-effort in both directions: a failing read falls
//! through to the [`IdentityStore`], and a failing write is logged and
//! ignored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::error::GateError;
use crate::ledger::IdentityStore;
use crate::types::{CachedIdentity, Credential};

/// Default cache region for identity entries.
pub const DEFAULT_REGION: &str = "identity";

/// Errors from an [`IdentityCache`].
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache substrate failed.
    #[error("cache backend error: {message}")]
    Backend {
        /// Diagnostic detail.
        message: String,
        /// Underlying error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Region-scoped string cache.
///
/// Writers race benignly: the last write for a `(region, key)` wins.
#[async_trait]
pub trait IdentityCache: Send + Sync {
    /// Returns the cached value, if present and not expired.
    async fn get(&self, region: &str, key: &str) -> Result<Option<String>, CacheError>;

    /// Stores a value. `ttl` of `None` means no expiry.
    async fn set(
        &self,
        region: &str,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;
}

/// In-process cache on a `DashMap`.
#[derive(Debug, Default)]
pub struct InMemoryIdentityCache {
    entries: DashMap<(String, String), (String, Option<Instant>)>,
}

impl InMemoryIdentityCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_expired(expires_at: Option<Instant>) -> bool {
    expires_at.is_some_and(|deadline| Instant::now() >= deadline)
}

#[async_trait]
impl IdentityCache for InMemoryIdentityCache {
    async fn get(&self, region: &str, key: &str) -> Result<Option<String>, CacheError> {
        let lookup = (region.to_string(), key.to_string());
        match self.entries.get(&lookup) {
            None => return Ok(None),
            Some(entry) => {
                let (value, expires_at) = entry.value();
                if !is_expired(*expires_at) {
                    return Ok(Some(value.clone()));
                }
            },
        }
        // Re-checked under the shard lock: a concurrent `set` may have
        // replaced the expired entry since it was read.
        self.entries
            .remove_if(&lookup, |_, (_, expires_at)| is_expired(*expires_at));
        Ok(None)
    }

    async fn set(
        &self,
        region: &str,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert((region.to_string(), key.to_string()), (value, expires_at));
        Ok(())
    }
}

/// Redis-backed cache. Entries live at `{prefix}:cache:{region}:{key}`.
#[cfg(feature = "redis")]
#[derive(Debug, Clone)]
pub struct RedisIdentityCache {
    conn: ::redis::aio::MultiplexedConnection,
    key_prefix: String,
}

#[cfg(feature = "redis")]
impl RedisIdentityCache {
    /// Wraps an existing multiplexed connection.
    pub fn with_connection(conn: ::redis::aio::MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "credit-gate".to_string(),
        }
    }

    /// Sets a custom key prefix (builder pattern).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn cache_key(&self, region: &str, key: &str) -> String {
        format!("{}:cache:{}:{}", self.key_prefix, region, key)
    }
}

#[cfg(feature = "redis")]
fn map_cache_error(err: ::redis::RedisError) -> CacheError {
    CacheError::Backend {
        message: err.to_string(),
        source: Some(Box::new(err)),
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl IdentityCache for RedisIdentityCache {
    async fn get(&self, region: &str, key: &str) -> Result<Option<String>, CacheError> {
        use ::redis::AsyncCommands;

        self.conn
            .clone()
            .get(self.cache_key(region, key))
            .await
            .map_err(map_cache_error)
    }

    async fn set(
        &self,
        region: &str,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        use ::redis::AsyncCommands;

        let cache_key = self.cache_key(region, key);
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(cache_key, value, ttl.as_secs().max(1))
                .await
                .map_err(map_cache_error),
            None => conn
                .set::<_, _, ()>(cache_key, value)
                .await
                .map_err(map_cache_error),
        }
    }
}

/// Resolves credentials to identities, consulting the cache first.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use credit_gate::identity::{IdentityResolver, InMemoryIdentityCache};
/// use credit_gate::ledger::KvCreditLedger;
/// use credit_gate::store::memory::InMemoryBackend;
/// use credit_gate::types::Credential;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let ledger = Arc::new(KvCreditLedger::new(Arc::new(InMemoryBackend::new())));
/// ledger.create_user("admin", "123e4567", 1000).await.unwrap();
///
/// let resolver = IdentityResolver::new(ledger, Arc::new(InMemoryIdentityCache::new()));
/// let who = resolver.resolve(&Credential::new("123e4567")).await.unwrap();
/// assert_eq!(who.name.as_str(), "admin");
/// # }
/// ```
pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    cache: Arc<dyn IdentityCache>,
    region: String,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("region", &self.region)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    /// Creates a resolver over the system of record and a cache, using
    /// [`DEFAULT_REGION`] and no expiry.
    pub fn new(store: Arc<dyn IdentityStore>, cache: Arc<dyn IdentityCache>) -> Self {
        Self {
            store,
            cache,
            region: DEFAULT_REGION.to_string(),
            ttl: None,
        }
    }

    /// Sets the cache region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Sets an expiry for cache entries written by this resolver.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// The system of record behind the cache.
    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Resolves `credential` to its owner.
    ///
    /// # Errors
    ///
    /// [`GateError::Unauthorized`] if no user owns the credential, and
    /// [`GateError::Internal`] if the system of record fails.
    pub async fn resolve(&self, credential: &Credential) -> Result<CachedIdentity, GateError> {
        if let Some(identity) = self.cached(credential).await {
            return Ok(identity);
        }

        let Some(user) = self.store.find_by_credential(credential).await? else {
            tracing::warn!(credential = %credential, "authentication failed for credential");
            return Err(GateError::Unauthorized);
        };

        let identity = user.identity();
        self.populate(credential, &identity).await;
        Ok(identity)
    }

    async fn cached(&self, credential: &Credential) -> Option<CachedIdentity> {
        let raw = match self.cache.get(&self.region, credential.expose()).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(region = %self.region, error = %e, "identity cache read failed");
                return None;
            },
        };
        match serde_json::from_str::<CachedIdentity>(&raw) {
            Ok(identity) => {
                tracing::trace!(user = %identity.name, "identity cache hit");
                Some(identity)
            },
            Err(e) => {
                tracing::warn!(
                    region = %self.region,
                    error = %e,
                    "discarding corrupt identity cache entry"
                );
                None
            },
        }
    }

    async fn populate(&self, credential: &Credential, identity: &CachedIdentity) {
        let raw = match serde_json::to_string(identity) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    user = %identity.name,
                    error = %e,
                    "failed to encode identity for cache"
                );
                return;
            },
        };
        if let Err(e) = self
            .cache
            .set(&self.region, credential.expose(), raw, self.ttl)
            .await
        {
            tracing::warn!(user = %identity.name, error = %e, "identity cache write failed");
        }
    }
}
