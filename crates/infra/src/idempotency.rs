use std::time::Duration;

use huddle_domain::ports::BoxFuture;
use huddle_domain::ports::idempotency::{
    IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyStore, PutOutcome,
};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

const CLAIM_ATTEMPTS: usize = 2;

/// Idempotency records shared across API replicas. Claims use `SET NX PX` so only
/// one replica starts a given request.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self, IdempotencyError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| IdempotencyError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| IdempotencyError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            prefix: prefix.into(),
        })
    }

    fn cache_key(&self, key: &IdempotencyKey) -> String {
        key.cache_key(&self.prefix)
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn encode(record: &IdempotencyRecord) -> Result<String, IdempotencyError> {
    serde_json::to_string(record).map_err(|err| IdempotencyError::Serialization(err.to_string()))
}

fn decode(payload: &str) -> Result<IdempotencyRecord, IdempotencyError> {
    serde_json::from_str(payload).map_err(|err| IdempotencyError::Serialization(err.to_string()))
}

fn store_error(err: redis::RedisError) -> IdempotencyError {
    if err.is_io_error() || err.is_connection_dropped() {
        IdempotencyError::Unavailable(err.to_string())
    } else {
        IdempotencyError::Store(err.to_string())
    }
}

impl IdempotencyStore for RedisIdempotencyStore {
    fn put_if_absent(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let payload = encode(record);
        Box::pin(async move {
            let payload = payload?;
            let mut conn = self.manager.clone();
            // The key may expire between a failed claim and the read; claim again then.
            for _ in 0..CLAIM_ATTEMPTS {
                let claimed: Option<String> = redis::cmd("SET")
                    .arg(&cache_key)
                    .arg(&payload)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms(ttl))
                    .query_async(&mut conn)
                    .await
                    .map_err(store_error)?;
                if claimed.is_some() {
                    return Ok(PutOutcome::Stored);
                }

                let existing: Option<String> = conn.get(&cache_key).await.map_err(store_error)?;
                if let Some(existing) = existing {
                    return Ok(PutOutcome::Existing(decode(&existing)?));
                }
            }
            Err(IdempotencyError::Store(format!(
                "could not claim idempotency key {cache_key}"
            )))
        })
    }

    fn update(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        let payload = encode(record);
        Box::pin(async move {
            let payload = payload?;
            let mut conn = self.manager.clone();
            let _: () = conn
                .pset_ex(&cache_key, payload, ttl_ms(ttl))
                .await
                .map_err(store_error)?;
            Ok(())
        })
    }

    fn remove(&self, key: &IdempotencyKey) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = self.cache_key(key);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: usize = conn.del(&cache_key).await.map_err(store_error)?;
            Ok(())
        })
    }
}
