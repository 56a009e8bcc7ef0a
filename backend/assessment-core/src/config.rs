use serde::Deserialize;
use std::{env, time::Duration};

use crate::cache::CacheTtl;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub mongo_database: String,
    pub redis_uri: String,
    pub cache: CacheSettings,
    pub attempts: AttemptSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    pub namespace: String,
    pub ttl: TtlSettings,
    /// Bound on a detached cache population write.
    pub populate_timeout_ms: u64,
    pub populate_queue_capacity: usize,
    pub populate_concurrency: usize,
    /// Bound on any single call to the cache store.
    pub operation_timeout_ms: u64,
    /// Keys requested per SCAN step and deleted per pipeline.
    pub scan_batch: usize,
}

/// TTL classes, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TtlSettings {
    pub fast: u64,
    pub assessment: u64,
    pub question: u64,
    pub stats: u64,
    pub exists: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttemptSettings {
    /// Upper bound on attempts handled by one timeout sweep.
    pub sweep_batch_limit: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "assess".to_string(),
            ttl: TtlSettings::default(),
            populate_timeout_ms: 3000,
            populate_queue_capacity: 1024,
            populate_concurrency: 8,
            operation_timeout_ms: 500,
            scan_batch: 500,
        }
    }
}

impl Default for TtlSettings {
    fn default() -> Self {
        Self {
            fast: 30,
            assessment: 600,
            question: 1800,
            stats: 300,
            exists: 120,
        }
    }
}

impl Default for AttemptSettings {
    fn default() -> Self {
        Self {
            sweep_batch_limit: 500,
        }
    }
}

impl CacheSettings {
    pub fn ttl_for(&self, class: CacheTtl) -> Duration {
        let secs = match class {
            CacheTtl::Fast => self.ttl.fast,
            CacheTtl::Assessment => self.ttl.assessment,
            CacheTtl::Question => self.ttl.question,
            CacheTtl::Stats => self.ttl.stats,
            CacheTtl::Exists => self.ttl.exists,
        };
        Duration::from_secs(secs)
    }

    pub fn populate_timeout(&self) -> Duration {
        Duration::from_millis(self.populate_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        let cache = CacheSettings::default();
        let attempts = AttemptSettings::default();

        // config/{env}.toml + APP_ overrides, on top of built-in defaults
        let settings = config::Config::builder()
            .set_default("cache.enabled", cache.enabled)?
            .set_default("cache.namespace", cache.namespace.clone())?
            .set_default("cache.ttl.fast", cache.ttl.fast)?
            .set_default("cache.ttl.assessment", cache.ttl.assessment)?
            .set_default("cache.ttl.question", cache.ttl.question)?
            .set_default("cache.ttl.stats", cache.ttl.stats)?
            .set_default("cache.ttl.exists", cache.ttl.exists)?
            .set_default("cache.populate_timeout_ms", cache.populate_timeout_ms)?
            .set_default(
                "cache.populate_queue_capacity",
                cache.populate_queue_capacity as u64,
            )?
            .set_default("cache.populate_concurrency", cache.populate_concurrency as u64)?
            .set_default("cache.operation_timeout_ms", cache.operation_timeout_ms)?
            .set_default("cache.scan_batch", cache.scan_batch as u64)?
            .set_default(
                "attempts.sweep_batch_limit",
                attempts.sweep_batch_limit as u64,
            )?
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017/?replicaSet=rs0".to_string());

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "assessments".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                format!("redis://{}:{}/0", host, port)
            });

        let cache: CacheSettings = settings.get("cache")?;
        let attempts: AttemptSettings = settings.get("attempts")?;

        let config = Config {
            mongo_uri,
            mongo_database,
            redis_uri,
            cache,
            attempts,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        let ttl = &self.cache.ttl;
        if [ttl.fast, ttl.assessment, ttl.question, ttl.stats, ttl.exists].contains(&0) {
            return Err(config::ConfigError::Message(
                "cache TTL classes must be greater than zero".to_string(),
            ));
        }
        if self.cache.populate_concurrency == 0 || self.cache.populate_queue_capacity == 0 {
            return Err(config::ConfigError::Message(
                "cache population needs a non-zero queue and concurrency".to_string(),
            ));
        }
        if self.cache.scan_batch == 0 {
            return Err(config::ConfigError::Message(
                "cache.scan_batch must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
