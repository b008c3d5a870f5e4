use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::ports::BoxFuture;
use crate::ports::idempotency::{
    IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyState, IdempotencyStore,
    PutOutcome, StoredResponse,
};

pub const OP_CREATE_GROUP_CHAT: &str = "create_group_chat";
pub const OP_SEND_MESSAGE: &str = "send_message";
pub const OP_SEND_MESSAGE_REQUEST: &str = "send_message_request";
pub const OP_START_CONVERSATION: &str = "start_conversation";

#[derive(Clone, Debug)]
pub struct IdempotencyConfig {
    pub in_progress_ttl: Duration,
    pub completed_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            in_progress_ttl: Duration::from_secs(60),
            completed_ttl: Duration::from_secs(60 * 60 * 24),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BeginOutcome {
    Started,
    InProgress,
    Replay(StoredResponse),
}

/// Guards the writes that are not idempotent by construction (group chats, messages,
/// message requests) against blind client retries.
#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub async fn begin(&self, key: &IdempotencyKey) -> Result<BeginOutcome, IdempotencyError> {
        match self
            .store
            .put_if_absent(key, &IdempotencyRecord::in_progress(), self.config.in_progress_ttl)
            .await?
        {
            PutOutcome::Stored => Ok(BeginOutcome::Started),
            PutOutcome::Existing(existing) => match existing.state {
                IdempotencyState::InProgress => Ok(BeginOutcome::InProgress),
                IdempotencyState::Completed => existing
                    .response
                    .map(BeginOutcome::Replay)
                    .ok_or_else(|| {
                        IdempotencyError::Store("completed record missing response".into())
                    }),
            },
        }
    }

    pub async fn complete(
        &self,
        key: &IdempotencyKey,
        response: StoredResponse,
    ) -> Result<(), IdempotencyError> {
        self.store
            .update(
                key,
                &IdempotencyRecord::completed(response),
                self.config.completed_ttl,
            )
            .await
    }

    /// Releases a key whose operation failed so the client may retry it.
    pub async fn abandon(&self, key: &IdempotencyKey) -> Result<(), IdempotencyError> {
        self.store.remove(key).await
    }
}

#[derive(Clone, Debug)]
pub struct InMemoryIdempotencyStore {
    prefix: String,
    inner: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

#[derive(Clone, Debug)]
struct MemoryEntry {
    record: IdempotencyRecord,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(record: IdempotencyRecord, ttl: Duration) -> Self {
        Self {
            record,
            expires_at: (!ttl.is_zero()).then(|| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl InMemoryIdempotencyStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn put_if_absent(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, IdempotencyError>> {
        let cache_key = key.cache_key(&self.prefix);
        let record = record.clone();
        Box::pin(async move {
            let mut entries = self.entries();
            if let Some(entry) = entries.get(&cache_key) {
                if !entry.is_expired() {
                    return Ok(PutOutcome::Existing(entry.record.clone()));
                }
            }
            entries.insert(cache_key, MemoryEntry::new(record, ttl));
            Ok(PutOutcome::Stored)
        })
    }

    fn update(
        &self,
        key: &IdempotencyKey,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = key.cache_key(&self.prefix);
        let record = record.clone();
        Box::pin(async move {
            self.entries()
                .insert(cache_key, MemoryEntry::new(record, ttl));
            Ok(())
        })
    }

    fn remove(&self, key: &IdempotencyKey) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let cache_key = key.cache_key(&self.prefix);
        Box::pin(async move {
            self.entries().remove(&cache_key);
            Ok(())
        })
    }
}
