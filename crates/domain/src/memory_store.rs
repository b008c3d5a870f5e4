use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures_util::stream;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};

use crate::ports::BoxFuture;
use crate::ports::store::{
    CommitReceipt, DocPath, Document, DocumentStore, DocumentStream, MAX_BATCH_WRITES,
    Precondition, Query, StoreError, StoreResult, Transaction, Write, WriteKind,
};
use crate::util::now_ms;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
struct StoredDocument {
    data: Value,
    update_time_ms: i64,
}

#[derive(Default)]
struct State {
    documents: BTreeMap<DocPath, StoredDocument>,
    last_commit_ms: i64,
    failing_prefixes: Vec<String>,
}

struct Inner {
    state: RwLock<State>,
    changes: broadcast::Sender<Arc<HashSet<String>>>,
}

impl Inner {
    async fn run_query(&self, query: &Query) -> Vec<Document> {
        let state = self.state.read().await;
        let mut documents: Vec<Document> = state
            .documents
            .iter()
            .filter(|(path, _)| path.collection() == query.collection)
            .map(|(path, stored)| Document {
                path: path.clone(),
                data: stored.data.clone(),
                update_time_ms: stored.update_time_ms,
            })
            .filter(|document| query.matches(document))
            .collect();
        query.sort(&mut documents);
        if let Some(limit) = query.limit {
            documents.truncate(limit);
        }
        documents
    }
}

/// Process-local document store with server-side timestamps, atomic commits and
/// live query subscriptions.
#[derive(Clone)]
pub struct InMemoryDocumentStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                changes,
            }),
        }
    }

    /// Makes every commit that writes under `prefix` fail as unavailable.
    pub async fn fail_writes_under(&self, prefix: impl Into<String>) {
        self.inner
            .state
            .write()
            .await
            .failing_prefixes
            .push(prefix.into());
    }

    pub async fn clear_failures(&self) {
        self.inner.state.write().await.failing_prefixes.clear();
    }

    /// Writes a raw document outside any transaction, bypassing model encoding.
    pub async fn seed(&self, path: DocPath, data: Value) {
        let mut state = self.inner.state.write().await;
        let commit_time_ms = next_commit_time(&mut state);
        let collection = path.collection().to_string();
        state.documents.insert(
            path,
            StoredDocument {
                data,
                update_time_ms: commit_time_ms,
            },
        );
        drop(state);
        let _ = self
            .inner
            .changes
            .send(Arc::new(HashSet::from([collection])));
    }

    pub async fn document_count(&self, collection: &str) -> usize {
        self.inner
            .state
            .read()
            .await
            .documents
            .keys()
            .filter(|path| path.collection() == collection)
            .count()
    }

    async fn apply(&self, transaction: Transaction) -> StoreResult<CommitReceipt> {
        let mut state = self.inner.state.write().await;

        if let Some(write) = transaction.writes.iter().find(|write| {
            let path = write.path.to_string();
            state
                .failing_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
        }) {
            return Err(StoreError::Unavailable(format!(
                "write to {} rejected",
                write.path
            )));
        }

        for precondition in &transaction.preconditions {
            check_precondition(&state.documents, precondition)?;
        }

        let commit_time_ms = state.last_commit_ms.max(now_ms()) + 1;
        let mut staged: BTreeMap<DocPath, Option<Value>> = BTreeMap::new();
        for write in &transaction.writes {
            let current = match staged.get(&write.path) {
                Some(value) => value.clone(),
                None => state
                    .documents
                    .get(&write.path)
                    .map(|stored| stored.data.clone()),
            };
            let next = apply_write(current, write, commit_time_ms)?;
            staged.insert(write.path.clone(), next);
        }

        state.last_commit_ms = commit_time_ms;
        let mut changed = HashSet::new();
        for (path, value) in staged {
            changed.insert(path.collection().to_string());
            match value {
                Some(data) => {
                    state.documents.insert(
                        path,
                        StoredDocument {
                            data,
                            update_time_ms: commit_time_ms,
                        },
                    );
                }
                None => {
                    state.documents.remove(&path);
                }
            }
        }
        drop(state);

        if !changed.is_empty() {
            let _ = self.inner.changes.send(Arc::new(changed));
        }
        Ok(CommitReceipt { commit_time_ms })
    }
}

fn next_commit_time(state: &mut State) -> i64 {
    let commit_time_ms = state.last_commit_ms.max(now_ms()) + 1;
    state.last_commit_ms = commit_time_ms;
    commit_time_ms
}

fn check_precondition(
    documents: &BTreeMap<DocPath, StoredDocument>,
    precondition: &Precondition,
) -> StoreResult<()> {
    let holds = match precondition {
        Precondition::Exists(path) => documents.contains_key(path),
        Precondition::Missing(path) => !documents.contains_key(path),
        Precondition::FieldEquals { path, field, value } => documents
            .get(path)
            .and_then(|stored| field.lookup(&stored.data))
            .is_some_and(|actual| actual == value),
    };
    if holds {
        return Ok(());
    }
    let path = match precondition {
        Precondition::Exists(path)
        | Precondition::Missing(path)
        | Precondition::FieldEquals { path, .. } => path,
    };
    Err(StoreError::PreconditionFailed(path.to_string()))
}

fn apply_write(
    current: Option<Value>,
    write: &Write,
    commit_time_ms: i64,
) -> StoreResult<Option<Value>> {
    let mut data = match &write.kind {
        WriteKind::Set(value) => value.clone(),
        WriteKind::Update(fields) => {
            let mut data =
                current.ok_or_else(|| StoreError::MissingDocument(write.path.to_string()))?;
            for (field, value) in fields {
                field.assign(&mut data, value.clone());
            }
            data
        }
        WriteKind::Increment { field, by } => {
            let mut data =
                current.ok_or_else(|| StoreError::MissingDocument(write.path.to_string()))?;
            let existing = field
                .lookup(&data)
                .and_then(Value::as_i64)
                .unwrap_or_default();
            field.assign(&mut data, Value::from(existing + by));
            data
        }
        WriteKind::Delete => return Ok(None),
    };
    for field in &write.server_timestamps {
        field.assign(&mut data, Value::from(commit_time_ms));
    }
    Ok(Some(data))
}

struct Subscription {
    inner: Arc<Inner>,
    query: Query,
    receiver: broadcast::Receiver<Arc<HashSet<String>>>,
    pending: Option<Vec<Document>>,
    last: Option<Vec<Document>>,
}

impl DocumentStore for InMemoryDocumentStore {
    fn get(&self, path: &DocPath) -> BoxFuture<'_, StoreResult<Option<Document>>> {
        let path = path.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let state = inner.state.read().await;
            Ok(state.documents.get(&path).map(|stored| Document {
                path: path.clone(),
                data: stored.data.clone(),
                update_time_ms: stored.update_time_ms,
            }))
        })
    }

    fn query(&self, query: &Query) -> BoxFuture<'_, StoreResult<Vec<Document>>> {
        let query = query.clone();
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.run_query(&query).await) })
    }

    fn subscribe(&self, query: &Query) -> BoxFuture<'_, StoreResult<DocumentStream>> {
        let query = query.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            // Subscribe before the first read so no commit falls in between.
            let receiver = inner.changes.subscribe();
            let initial = inner.run_query(&query).await;
            let subscription = Subscription {
                inner,
                query,
                receiver,
                pending: Some(initial),
                last: None,
            };
            let snapshots = stream::unfold(subscription, |mut sub| async move {
                loop {
                    if let Some(snapshot) = sub.pending.take() {
                        if sub.last.as_ref() != Some(&snapshot) {
                            sub.last = Some(snapshot.clone());
                            return Some((snapshot, sub));
                        }
                    }
                    match sub.receiver.recv().await {
                        Ok(changed) => {
                            if changed.contains(&sub.query.collection) {
                                sub.pending = Some(sub.inner.run_query(&sub.query).await);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "subscription lagged; re-running query");
                            sub.pending = Some(sub.inner.run_query(&sub.query).await);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(Box::pin(snapshots) as DocumentStream)
        })
    }

    fn commit(&self, transaction: Transaction) -> BoxFuture<'_, StoreResult<CommitReceipt>> {
        Box::pin(async move { self.apply(transaction).await })
    }

    fn batch_write(&self, writes: Vec<Write>) -> BoxFuture<'_, StoreResult<CommitReceipt>> {
        Box::pin(async move {
            if writes.len() > MAX_BATCH_WRITES {
                return Err(StoreError::BatchTooLarge {
                    size: writes.len(),
                    limit: MAX_BATCH_WRITES,
                });
            }
            self.apply(Transaction {
                preconditions: Vec::new(),
                writes,
            })
            .await
        })
    }
}
