//! Redis storage backend.
//!
//! [`RedisBackend`] implements [`StorageBackend`] on Redis hashes. Writes
//! run as Lua scripts (`redis::Script`) so the version check, the hash
//! update, and the namespace index update happen atomically in a single
//! round-trip; concurrent ledger updates for one user therefore serialize
//! on the server without any client-side lock.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:kv:{namespace}:{id}` | Hash | Record storage (`version`, `data`) |
//! | `{prefix}:idx:{namespace}` | Set | Ids present in a namespace |
//!
//! Backend keys arrive as `{namespace}:{id}` (see
//! [`make_key`](crate::store::backend::make_key)); the first colon splits
//! them.

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};

/// Create-only put.
///
/// KEYS[1] = record hash, KEYS[2] = namespace index set. ARGV[1] = data,
/// ARGV[2] = id. Returns 1 on create, 0 if the key exists.
const LUA_PUT_IF_ABSENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'version', '1', 'data', ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
return 1
"#;

/// Conditional put (CAS).
///
/// KEYS[1] = record hash. ARGV[1] = data, ARGV[2] = expected version.
/// Returns {status, value}: 1=success (new version), 0=mismatch (actual
/// version), -1=missing.
const LUA_PUT_IF_VERSION: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
if not current_version then
    return {-1, 0}
end

local actual = tonumber(current_version)
if actual ~= tonumber(ARGV[2]) then
    return {0, actual}
end

local new_version = actual + 1
redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])
return {1, new_version}
"#;

/// Delete hash and index entry.
///
/// KEYS[1] = record hash, KEYS[2] = namespace index set. ARGV[1] = id.
const LUA_DELETE: &str = r#"
local existed = redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
return existed
"#;

/// Redis storage backend.
///
/// Holds a [`MultiplexedConnection`]; clones share one TCP connection.
///
/// # Examples
///
/// ```rust,no_run
/// use credit_gate::store::redis::RedisBackend;
///
/// # async fn example() {
/// let backend = RedisBackend::new("redis://127.0.0.1:6379")
///     .await
///     .unwrap()
///     .with_prefix("credit-gate-test");
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisBackend {
    /// Connects to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the client cannot be created or
    /// the connection cannot be established.
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let client = ::redis::Client::open(url).map_err(|e| StorageError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::with_connection(conn))
    }

    /// Wraps an existing multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
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

    /// Returns a clone of the underlying connection.
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    fn record_key(&self, namespace: &str, id: &str) -> String {
        format!("{}:kv:{}:{}", self.key_prefix, namespace, id)
    }

    fn index_key(&self, namespace: &str) -> String {
        format!("{}:idx:{}", self.key_prefix, namespace)
    }
}

fn split_key(key: &str) -> Result<(&str, &str), StorageError> {
    key.split_once(':').ok_or_else(|| StorageError::Backend {
        message: format!("invalid key format (missing ':'): {key}"),
        source: None,
    })
}

fn split_prefix(prefix: &str) -> Result<&str, StorageError> {
    prefix
        .strip_suffix(':')
        .filter(|namespace| !namespace.contains(':'))
        .ok_or_else(|| StorageError::Backend {
            message: format!("unsupported prefix (expected `{{namespace}}:`): {prefix}"),
            source: None,
        })
}

fn as_utf8(data: &[u8]) -> Result<&str, StorageError> {
    std::str::from_utf8(data).map_err(|e| StorageError::Backend {
        message: format!("data is not valid UTF-8: {e}"),
        source: Some(Box::new(e)),
    })
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> StorageError {
    StorageError::Backend {
        message: format!("Redis error for key {key}: {err}"),
        source: Some(Box::new(err)),
    }
}

fn parse_fields(
    key: &str,
    fields: &HashMap<String, String>,
) -> Result<VersionedRecord, StorageError> {
    let version = fields
        .get("version")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StorageError::Corrupt {
            key: key.to_string(),
            message: "missing or invalid version field".to_string(),
        })?;
    let data = fields.get("data").ok_or_else(|| StorageError::Corrupt {
        key: key.to_string(),
        message: "missing data field".to_string(),
    })?;
    Ok(VersionedRecord {
        data: data.as_bytes().to_vec(),
        version,
    })
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let (namespace, id) = split_key(key)?;
        let fields: HashMap<String, String> = self
            .conn
            .clone()
            .hgetall(self.record_key(namespace, id))
            .await
            .map_err(|e| map_redis_error(e, key))?;

        if fields.is_empty() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        parse_fields(key, &fields)
    }

    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let (namespace, id) = split_key(key)?;
        let created: i64 = Script::new(LUA_PUT_IF_ABSENT)
            .key(self.record_key(namespace, id))
            .key(self.index_key(namespace))
            .arg(as_utf8(data)?)
            .arg(id)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;

        if created == 1 {
            Ok(1)
        } else {
            Err(StorageError::AlreadyExists {
                key: key.to_string(),
            })
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let (namespace, id) = split_key(key)?;
        let (status, value): (i64, i64) = Script::new(LUA_PUT_IF_VERSION)
            .key(self.record_key(namespace, id))
            .arg(as_utf8(data)?)
            .arg(expected_version)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;

        match status {
            1 => Ok(value as u64),
            0 => Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: value as u64,
            }),
            _ => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let (namespace, id) = split_key(key)?;
        let removed: i64 = Script::new(LUA_DELETE)
            .key(self.record_key(namespace, id))
            .key(self.index_key(namespace))
            .arg(id)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(removed == 1)
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let namespace = split_prefix(prefix)?;
        let ids: Vec<String> = self
            .conn
            .clone()
            .smembers(self.index_key(namespace))
            .await
            .map_err(|e| map_redis_error(e, prefix))?;

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let key = format!("{namespace}:{id}");
            let fields: HashMap<String, String> = self
                .conn
                .clone()
                .hgetall(self.record_key(namespace, &id))
                .await
                .map_err(|e| map_redis_error(e, &key))?;
            // Index entries can outlive a concurrently deleted hash.
            if fields.is_empty() {
                continue;
            }
            let record = parse_fields(&key, &fields)?;
            results.push((key, record));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_key_uses_first_colon() {
        assert_eq!(
            split_key("history:test_user:task-1").unwrap(),
            ("history", "test_user:task-1")
        );
        assert!(split_key("nocolon").is_err());
    }

    #[test]
    fn split_prefix_requires_bare_namespace() {
        assert_eq!(split_prefix("users:").unwrap(), "users");
        assert!(split_prefix("users").is_err());
        assert!(split_prefix("history:test_user:").is_err());
    }

    #[test]
    fn parse_fields_reports_corruption() {
        let mut fields = HashMap::new();
        fields.insert("data".to_string(), "{}".to_string());
        assert!(matches!(
            parse_fields("users:a", &fields),
            Err(StorageError::Corrupt { .. })
        ));

        fields.insert("version".to_string(), "3".to_string());
        let record = parse_fields("users:a", &fields).unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.data, b"{}");
    }

    #[cfg(feature = "redis-tests")]
    mod live {
        use super::*;

        async fn backend() -> RedisBackend {
            let url =
                std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
            RedisBackend::new(&url)
                .await
                .unwrap()
                .with_prefix(format!("credit-gate-test-{}", uuid::Uuid::new_v4()))
        }

        #[tokio::test]
        async fn cas_cycle_against_live_redis() {
            let backend = backend().await;
            assert_eq!(backend.put_if_absent("users:a", b"{}").await.unwrap(), 1);
            assert!(backend.put_if_absent("users:a", b"{}").await.is_err());
            assert_eq!(backend.put_if_version("users:a", b"{}", 1).await.unwrap(), 2);
            assert!(matches!(
                backend.put_if_version("users:a", b"{}", 1).await,
                Err(StorageError::VersionConflict { actual: 2, .. })
            ));
            assert_eq!(backend.list_by_prefix("users:").await.unwrap().len(), 1);
            assert!(backend.delete("users:a").await.unwrap());
        }
    }
}
