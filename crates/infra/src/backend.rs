use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use huddle_domain::idempotency::InMemoryIdempotencyStore;
use huddle_domain::memory_store::InMemoryDocumentStore;
use huddle_domain::ports::idempotency::IdempotencyStore;
use huddle_domain::ports::store::DocumentStore;

use crate::config::AppConfig;
use crate::idempotency::RedisIdempotencyStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataBackend {
    Memory,
}

impl FromStr for DataBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            other => bail!("unsupported data_backend '{other}' (expected: memory)"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdempotencyBackend {
    Memory,
    Redis,
}

impl FromStr for IdempotencyBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => bail!("unsupported idempotency_backend '{other}' (expected: memory, redis)"),
        }
    }
}

#[derive(Clone)]
pub struct Backends {
    pub data_backend: DataBackend,
    pub idempotency_backend: IdempotencyBackend,
    pub documents: Arc<dyn DocumentStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
}

impl Backends {
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let data_backend: DataBackend = config.data_backend.parse()?;
        let idempotency_backend: IdempotencyBackend = config.idempotency_backend.parse()?;

        let documents: Arc<dyn DocumentStore> = match data_backend {
            DataBackend::Memory => Arc::new(InMemoryDocumentStore::new()),
        };

        let idempotency: Arc<dyn IdempotencyStore> = match idempotency_backend {
            IdempotencyBackend::Memory => {
                Arc::new(InMemoryIdempotencyStore::new(config.idempotency_prefix.clone()))
            }
            IdempotencyBackend::Redis => Arc::new(
                RedisIdempotencyStore::connect(&config.redis_url, config.idempotency_prefix.clone())
                    .await
                    .with_context(|| format!("connecting to redis at {}", config.redis_url))?,
            ),
        };

        tracing::info!(
            data_backend = ?data_backend,
            idempotency_backend = ?idempotency_backend,
            "backends ready"
        );
        Ok(Self {
            data_backend,
            idempotency_backend,
            documents,
            idempotency,
        })
    }
}
