//! Redis cache backend.
//!
//! Values are opaque bytes stored under namespaced keys with a per-key TTL.
//! The connection is established lazily and shared; a transport failure
//! discards it so the next operation redials.

use super::{CacheError, CacheStore};
use crate::config::RedisConfig;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_NAMESPACE: &str = "hermyx:";

/// Builds a [`redis::Client`] from the shared Redis config block. This only
/// parses the connection parameters; no I/O happens until the first command.
pub(crate) fn open_client(config: &RedisConfig) -> Result<redis::Client, redis::RedisError> {
    let (host, port) = match config.address.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(6379)),
        None => (config.address.clone(), 6379),
    };

    redis::Client::open(redis::ConnectionInfo {
        addr: redis::ConnectionAddr::Tcp(host, port),
        redis: redis::RedisConnectionInfo {
            db: config.db.unwrap_or(0),
            password: (!config.password.is_empty()).then(|| config.password.clone()),
            ..Default::default()
        },
    })
}

/// Remote cache store backed by Redis.
pub struct RedisCache {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    namespace: String,
    default_ttl: Duration,
}

impl RedisCache {
    /// Creates the store. Does not connect; the first operation does.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured address cannot be parsed.
    pub fn new(config: &RedisConfig) -> Result<Self, CacheError> {
        let client = open_client(config)?;
        let namespace =
            config.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        Ok(Self {
            client,
            conn: Mutex::new(None),
            namespace,
            default_ttl: config.default_ttl.unwrap_or(Duration::ZERO),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drops the shared connection after a transport failure.
    async fn invalidate(&self) {
        *self.conn.lock().await = None;
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let mut conn = self.connection().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(self.namespaced(key)).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        }

        match cmd.query_async::<()>(&mut conn).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.invalidate().await;
                Err(e.into())
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection().await?;

        match redis::cmd("GET")
            .arg(self.namespaced(key))
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
        {
            Ok(value) => Ok(value),
            Err(e) => {
                self.invalidate().await;
                Err(e.into())
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;

        match redis::cmd("DEL").arg(self.namespaced(key)).query_async::<()>(&mut conn).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.invalidate().await;
                Err(e.into())
            }
        }
    }

    async fn close(&self) -> Result<(), CacheError> {
        debug!("closing redis cache connection");
        self.invalidate().await;
        Ok(())
    }
}
