use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::{BoxFuture, BoxStream};

/// Upper bound on operations in one atomic batch, mirroring the backend limit.
pub const MAX_BATCH_WRITES: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    collection: String,
    id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn child_collection(&self, name: &str) -> String {
        format!("{}/{}/{name}", self.collection, self.id)
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Path to a (possibly nested) field. Segments are kept apart so map keys
/// such as user ids never need escaping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new(field: impl Into<String>) -> Self {
        Self(vec![field.into()])
    }

    pub fn child(mut self, segment: impl Into<String>) -> Self {
        self.0.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn lookup<'a>(&self, data: &'a Value) -> Option<&'a Value> {
        self.0
            .iter()
            .try_fold(data, |current, segment| current.get(segment.as_str()))
    }

    /// Sets the field, creating intermediate objects as needed.
    pub fn assign(&self, data: &mut Value, value: Value) {
        let Some((last, parents)) = self.0.split_last() else {
            return;
        };
        let mut current = data;
        for segment in parents {
            if !current.is_object() {
                *current = Value::Object(Default::default());
            }
            let Value::Object(map) = current else {
                return;
            };
            current = map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Default::default()));
        }
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        if let Value::Object(map) = current {
            map.insert(last.clone(), value);
        }
    }
}

impl From<&str> for FieldPath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub path: DocPath,
    pub data: Value,
    pub update_time_ms: i64,
}

impl Document {
    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|err| StoreError::InvalidDocument {
            path: self.path.to_string(),
            reason: err.to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Gt,
    ArrayContains,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub field: FieldPath,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, data: &Value) -> bool {
        let Some(actual) = self.field.lookup(data) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Lt => compare_values(Some(actual), Some(&self.value)) == Ordering::Less,
            FilterOp::Gt => compare_values(Some(actual), Some(&self.value)) == Ordering::Greater,
            FilterOp::ArrayContains => actual
                .as_array()
                .is_some_and(|items| items.contains(&self.value)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: FieldPath,
    pub descending: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<FieldPath>, op: FilterOp, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value,
        });
        self
    }

    pub fn filter_eq(self, field: impl Into<FieldPath>, value: Value) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn order_by(mut self, field: impl Into<FieldPath>) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<FieldPath>) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        document.path.collection() == self.collection
            && self.filters.iter().all(|filter| filter.matches(&document.data))
    }

    /// Sorts per `order_by`, breaking ties on document id.
    pub fn sort(&self, documents: &mut [Document]) {
        documents.sort_by(|a, b| {
            for order in &self.order_by {
                let ordering =
                    compare_values(order.field.lookup(&a.data), order.field.lookup(&b.data));
                let ordering = if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.id().cmp(b.id())
        });
    }
}

fn value_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Total order over field values: missing/null, bools, numbers, strings, arrays, objects.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            let a = a.as_f64().unwrap_or_default();
            let b = b.as_f64().unwrap_or_default();
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        _ => value_rank(a).cmp(&value_rank(b)),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteKind {
    /// Replaces the whole document.
    Set(Value),
    /// Assigns fields on an existing document.
    Update(Vec<(FieldPath, Value)>),
    /// Atomically adds `by` to a numeric field of an existing document.
    Increment { field: FieldPath, by: i64 },
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Write {
    pub path: DocPath,
    pub kind: WriteKind,
    /// Fields resolved to the commit's server time.
    pub server_timestamps: Vec<FieldPath>,
}

impl Write {
    pub fn set<T: Serialize>(path: DocPath, value: &T) -> StoreResult<Self> {
        let data = serde_json::to_value(value)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        Ok(Self {
            path,
            kind: WriteKind::Set(data),
            server_timestamps: Vec::new(),
        })
    }

    pub fn update(path: DocPath, fields: Vec<(FieldPath, Value)>) -> Self {
        Self {
            path,
            kind: WriteKind::Update(fields),
            server_timestamps: Vec::new(),
        }
    }

    pub fn increment(path: DocPath, field: impl Into<FieldPath>, by: i64) -> Self {
        Self {
            path,
            kind: WriteKind::Increment {
                field: field.into(),
                by,
            },
            server_timestamps: Vec::new(),
        }
    }

    pub fn delete(path: DocPath) -> Self {
        Self {
            path,
            kind: WriteKind::Delete,
            server_timestamps: Vec::new(),
        }
    }

    pub fn with_server_timestamp(mut self, field: impl Into<FieldPath>) -> Self {
        self.server_timestamps.push(field.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    Exists(DocPath),
    Missing(DocPath),
    FieldEquals {
        path: DocPath,
        field: FieldPath,
        value: Value,
    },
}

/// Atomic unit: every precondition holds and every write lands, or nothing does.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transaction {
    pub preconditions: Vec<Precondition>,
    pub writes: Vec<Write>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_exists(mut self, path: DocPath) -> Self {
        self.preconditions.push(Precondition::Exists(path));
        self
    }

    pub fn require_missing(mut self, path: DocPath) -> Self {
        self.preconditions.push(Precondition::Missing(path));
        self
    }

    pub fn require_field(
        mut self,
        path: DocPath,
        field: impl Into<FieldPath>,
        value: Value,
    ) -> Self {
        self.preconditions.push(Precondition::FieldEquals {
            path,
            field: field.into(),
            value,
        });
        self
    }

    pub fn write(mut self, write: Write) -> Self {
        self.writes.push(write);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitReceipt {
    pub commit_time_ms: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("precondition failed on {0}")]
    PreconditionFailed(String),
    #[error("document {0} does not exist")]
    MissingDocument(String),
    #[error("batch of {size} writes exceeds limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid document {path}: {reason}")]
    InvalidDocument { path: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Live query results; each item is a full, ordered snapshot.
pub type DocumentStream = BoxStream<Vec<Document>>;

pub trait DocumentStore: Send + Sync {
    fn get(&self, path: &DocPath) -> BoxFuture<'_, StoreResult<Option<Document>>>;

    fn query(&self, query: &Query) -> BoxFuture<'_, StoreResult<Vec<Document>>>;

    fn subscribe(&self, query: &Query) -> BoxFuture<'_, StoreResult<DocumentStream>>;

    fn commit(&self, transaction: Transaction) -> BoxFuture<'_, StoreResult<CommitReceipt>>;

    fn batch_write(&self, writes: Vec<Write>) -> BoxFuture<'_, StoreResult<CommitReceipt>>;
}
