use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;

use super::{CacheError, CacheStore};

/// Redis-backed cache store. Every call is bounded by `op_timeout`.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisCacheStore {
    pub fn new(conn: ConnectionManager, op_timeout: Duration) -> Self {
        Self { conn, op_timeout }
    }

    /// Opens a managed connection and checks it with PING.
    pub async fn connect(uri: &str, op_timeout: Duration) -> anyhow::Result<Self> {
        let client = redis::Client::open(uri)?;

        tracing::info!("Attempting to connect to Redis...");

        let conn = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 10s"))??;

        let mut ping_conn = conn.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut ping_conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        Ok(Self::new(conn, op_timeout))
    }

    async fn run<T, F>(&self, fut: F) -> Result<T, CacheError>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_redis_error(e)),
            Err(_) => Err(CacheError::Unavailable(format!(
                "redis call exceeded {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }
}

fn map_redis_error(err: redis::RedisError) -> CacheError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        CacheError::Unavailable(err.to_string())
    } else {
        CacheError::Backend(err.to_string())
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        self.run(
            redis::cmd("GET")
                .arg(key)
                .query_async::<Option<Vec<u8>>>(&mut conn),
        )
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        self.run(
            redis::cmd("SETEX")
                .arg(key)
                .arg(ttl.as_secs().max(1))
                .arg(value)
                .query_async::<()>(&mut conn),
        )
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        self.run(redis::cmd("EXISTS").arg(key).query_async::<bool>(&mut conn))
            .await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("DEL").arg(key);
        }
        let counts: Vec<u64> = self.run(pipe.query_async(&mut conn)).await?;
        Ok(counts.into_iter().sum())
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        let mut conn = self.conn.clone();
        self.run(
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async::<(u64, Vec<String>)>(&mut conn),
        )
        .await
    }
}
