//! Redis remote store and pub/sub transport.

use super::RemoteStore;
use crate::error::{Error, Result};
use crate::invalidation::{InvalidationTransport, Subscription};
use deadpool_redis::redis::{self, AsyncCommands, Client, Script, Value};
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime, Timeouts};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Pool statistics information.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub connections: u32,
    pub idle_connections: u32,
}

/// Default Redis connection pool size.
/// Formula: (CPU cores × 2) + 1
/// For 8-core systems: 16 connections is optimal
/// Override with REDIS_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: u32 = 16;

/// Default bound on waiting for, creating and recycling a pooled connection.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest PX value accepted; Redis rejects expiries that overflow its clock.
const MAX_PX_MILLIS: u64 = u64::MAX >> 2;

/// Bumps a counter and lifts it to ARGV[1] when the bump falls short.
const INCR_AT_LEAST_SCRIPT: &str = r#"
local v = redis.call("INCR", KEYS[1])
local floor = tonumber(ARGV[1])
if v < floor then
    redis.call("SET", KEYS[1], floor)
    return floor
end
return v
"#;

/// Deletes a lock only while it still holds the caller's token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Configuration for Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
    pub pool_size: u32,
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }
}

impl RedisConfig {
    /// Build Redis connection string.
    pub fn connection_string(&self) -> String {
        if let Some(password) = &self.password {
            if let Some(username) = &self.username {
                format!(
                    "redis://{}:{}@{}:{}/{}",
                    username, password, self.host, self.port, self.database
                )
            } else {
                format!(
                    "redis://default:{}@{}:{}/{}",
                    password, self.host, self.port, self.database
                )
            }
        } else {
            format!("redis://{}:{}/{}", self.host, self.port, self.database)
        }
    }
}

/// Redis backend for both the L2 tier and invalidation pub/sub.
///
/// Commands go through a deadpool connection pool. Every subscription opens
/// its own dedicated pub/sub connection.
///
/// # Example
///
/// ```no_run
/// # use tier_cache::backend::{RedisBackend, RedisConfig, RemoteStore};
/// # use tier_cache::error::Result;
/// # async fn example() -> Result<()> {
/// let backend = RedisBackend::new(RedisConfig::default()).await?;
///
/// backend.set("key", b"value".to_vec(), None).await?;
/// let value = backend.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    client: Client,
}

impl RedisBackend {
    /// Create new Redis backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if pool creation fails or connection cannot be established.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let backend = Self::with_pool_size(
            &config.connection_string(),
            config.pool_size,
            config.connection_timeout,
        )?;
        info!(
            "✓ Redis backend initialized: {}:{}",
            config.host, config.port
        );
        Ok(backend)
    }

    /// Create from connection string directly.
    ///
    /// Pool size is determined by:
    /// 1. `REDIS_POOL_SIZE` environment variable (if set)
    /// 2. `DEFAULT_POOL_SIZE` constant (16)
    ///
    /// # Errors
    /// Returns `Err` if pool creation fails or connection cannot be established.
    pub async fn from_connection_string(conn_str: &str) -> Result<Self> {
        let pool_size = std::env::var("REDIS_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        let backend = Self::with_pool_size(conn_str, pool_size, DEFAULT_CONNECTION_TIMEOUT)?;
        info!(
            "✓ Redis backend initialized from connection string (pool size: {})",
            pool_size
        );
        Ok(backend)
    }

    fn with_pool_size(conn_str: &str, pool_size: u32, timeout: Duration) -> Result<Self> {
        let mut cfg = PoolConfig::from_url(conn_str);
        cfg.pool = Some(pool_config(pool_size, timeout));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::BackendError(format!("Failed to create Redis pool: {}", e)))?;
        let client = Client::open(conn_str)
            .map_err(|e| Error::BackendError(format!("Invalid Redis URL: {}", e)))?;

        Ok(RedisBackend { pool, client })
    }

    /// Get current pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            connections: status.size as u32,
            idle_connections: status.available as u32,
        }
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))
    }
}

/// Pool sizing plus one timeout applied to waiting, connecting and recycling.
fn pool_config(pool_size: u32, timeout: Duration) -> deadpool_redis::PoolConfig {
    let mut timeouts = Timeouts::default();
    timeouts.wait = Some(timeout);
    timeouts.create = Some(timeout);
    timeouts.recycle = Some(timeout);

    let mut pool = deadpool_redis::PoolConfig::new(pool_size as usize);
    pool.timeouts = timeouts;
    pool
}

/// PX argument for a TTL, at least 1ms and clamped to what Redis accepts.
fn px_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_PX_MILLIS)
}

impl RemoteStore for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;

        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| Error::BackendError(format!("Redis GET failed for key {}: {}", key, e)))?;

        if value.is_some() {
            debug!("✓ Redis GET {} -> HIT", key);
        } else {
            debug!("✓ Redis GET {} -> MISS", key);
        }

        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;

        match ttl {
            Some(duration) => {
                // PX keeps sub-second TTLs; EX would round them down to 0.
                let millis = px_millis(duration);
                conn.pset_ex::<_, _, ()>(key, value, millis)
                    .await
                    .map_err(|e| {
                        Error::BackendError(format!("Redis PSETEX failed for key {}: {}", key, e))
                    })?;
                debug!("✓ Redis SET {} (TTL: {}ms)", key, millis);
            }
            None => {
                conn.set::<_, _, ()>(key, value).await.map_err(|e| {
                    Error::BackendError(format!("Redis SET failed for key {}: {}", key, e))
                })?;
                debug!("✓ Redis SET {}", key);
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;

        conn.del::<_, ()>(key)
            .await
            .map_err(|e| Error::BackendError(format!("Redis DEL failed for key {}: {}", key, e)))?;

        debug!("✓ Redis DELETE {}", key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;

        let exists: bool = conn.exists(key).await.map_err(|e| {
            Error::BackendError(format!("Redis EXISTS failed for key {}: {}", key, e))
        })?;

        Ok(exists)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;

        // Per-command error replies come back in place instead of failing
        // the whole batch.
        let mut pipe = redis::pipe();
        pipe.ignore_errors();
        for key in keys {
            pipe.get(key);
        }
        let values: Vec<Value> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis pipelined GET failed: {}", e)))?;

        // Anything but a bulk string (nil, a server error for a wrong-typed
        // key) counts as a miss for that key alone.
        let results: Vec<Option<Vec<u8>>> = values
            .into_iter()
            .map(|value| match value {
                Value::BulkString(bytes) => Some(bytes),
                _ => None,
            })
            .collect();

        debug!("✓ Redis MGET {} keys", keys.len());
        Ok(results)
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let count = entries.len();

        let mut pipe = redis::pipe();
        for (key, value) in entries {
            match ttl {
                Some(duration) => {
                    pipe.pset_ex(key, value, px_millis(duration)).ignore();
                }
                None => {
                    pipe.set(key, value).ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis pipelined SET failed: {}", e)))?;

        debug!("✓ Redis MSET {} keys", count);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection().await?;

        let value: i64 = conn
            .incr(key, 1)
            .await
            .map_err(|e| Error::BackendError(format!("Redis INCR failed for key {}: {}", key, e)))?;

        debug!("✓ Redis INCR {} -> {}", key, value);
        Ok(value)
    }

    async fn incr_at_least(&self, key: &str, floor: i64) -> Result<i64> {
        let mut conn = self.connection().await?;

        let value: i64 = Script::new(INCR_AT_LEAST_SCRIPT)
            .key(key)
            .arg(floor)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis INCR failed for key {}: {}", key, e)))?;

        debug!("✓ Redis INCR {} (floor {}) -> {}", key, floor, value);
        Ok(value)
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.connection().await?;

        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| Error::BackendError(format!("Redis GET failed for key {}: {}", key, e)))?;

        Ok(value.and_then(|s| s.trim().parse::<i64>().ok()))
    }

    async fn try_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(px_millis(lease))
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis SET NX failed for {}: {}", name, e)))?;

        Ok(reply.is_some())
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection().await?;

        let removed: i64 = Script::new(UNLOCK_SCRIPT)
            .key(name)
            .arg(token)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis unlock failed for {}: {}", name, e)))?;

        Ok(removed == 1)
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = self.connection().await?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis PING failed: {}", e)))?;

        Ok(pong == "PONG" || pong.contains("PONG"))
    }
}

impl InvalidationTransport for RedisBackend {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.connection().await?;

        let receivers: i64 = conn.publish(channel, payload).await.map_err(|e| {
            Error::BackendError(format!("Redis PUBLISH failed on {}: {}", channel, e))
        })?;

        debug!("✓ Redis PUBLISH {} -> {} receivers", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            Error::BackendError(format!("Failed to open Redis pub/sub connection: {}", e))
        })?;
        pubsub.subscribe(channel).await.map_err(|e| {
            Error::BackendError(format!("Redis SUBSCRIBE failed on {}: {}", channel, e))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(message) = messages.next().await {
                match message.get_payload::<Vec<u8>>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Unreadable Redis message on {}: {}", name, e),
                }
            }
            warn!("⚠ Redis subscription on {} closed", name);
        });

        info!("✓ Redis SUBSCRIBE {}", channel);
        Ok(Subscription::new(rx, forwarder))
    }
}
