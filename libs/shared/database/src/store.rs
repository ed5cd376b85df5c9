use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;

use shared_models::AppError;

pub type StoreResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Users,
    Notifications,
    Appointments,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Notifications => "notifications",
            Collection::Appointments => "appointments",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==============================================================================
// DOCUMENTS
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self { id: id.into(), data }
    }

    /// Field lookup where `id` resolves to the document id.
    pub fn field(&self, name: &str) -> Option<Value> {
        if name == "id" {
            return Some(Value::String(self.id.clone()));
        }
        self.data.get(name).cloned()
    }

    pub fn into_typed<T: DeserializeOwned>(self) -> StoreResult<T> {
        let mut data = self.data;
        data.insert("id".to_string(), Value::String(self.id));
        Ok(serde_json::from_value(Value::Object(data))?)
    }
}

/// Orders two field values the way the store does: timestamps
/// chronologically, numbers numerically, strings lexicographically.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(left), Value::String(right)) => {
            match (
                DateTime::parse_from_rfc3339(left),
                DateTime::parse_from_rfc3339(right),
            ) {
                (Ok(l), Ok(r)) => Some(l.cmp(&r)),
                _ => Some(left.cmp(right)),
            }
        }
        (Value::Number(left), Value::Number(right)) => left.as_f64()?.partial_cmp(&right.as_f64()?),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || compare_values(a, b) == Some(Ordering::Equal)
}

// ==============================================================================
// QUERIES
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    Gt(String, Value),
    Lt(String, Value),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn is_in<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Filter::Gt(field.to_string(), value.into())
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Filter::Lt(field.to_string(), value.into())
    }

    pub fn field(&self) -> &str {
        match self {
            Filter::Eq(field, _) | Filter::In(field, _) | Filter::Gt(field, _) | Filter::Lt(field, _) => field,
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        let Some(actual) = document.field(self.field()) else {
            return false;
        };
        match self {
            Filter::Eq(_, expected) => values_equal(&actual, expected),
            Filter::In(_, candidates) => candidates.iter().any(|c| values_equal(&actual, c)),
            Filter::Gt(_, bound) => compare_values(&actual, bound) == Some(Ordering::Greater),
            Filter::Lt(_, bound) => compare_values(&actual, bound) == Some(Ordering::Less),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: Collection,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(document))
    }

    /// Filters, orders and truncates `documents`. Ties on the order field are
    /// broken by document id in the same direction.
    pub fn apply(&self, documents: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut selected: Vec<Document> = documents.into_iter().filter(|d| self.matches(d)).collect();

        if let Some(order) = &self.order_by {
            selected.sort_by(|a, b| {
                let by_field = match (a.field(&order.field), b.field(&order.field)) {
                    (Some(l), Some(r)) => compare_values(&l, &r).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                let ordering = by_field.then_with(|| a.id.cmp(&b.id));
                match order.direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

// ==============================================================================
// WRITES
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    /// Replaced by the store's own clock when the write lands.
    ServerTimestamp,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields {
    entries: BTreeMap<String, FieldValue>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn server_timestamp(mut self, field: &str) -> Self {
        self.entries.insert(field.to_string(), FieldValue::ServerTimestamp);
        self
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.entries.insert(field.to_string(), FieldValue::Value(value.into()));
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.entries.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-level fields of a serializable struct. The `id` field is dropped,
    /// ids are assigned by the store.
    pub fn from_serializable<T: Serialize>(value: &T) -> StoreResult<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => {
                let mut fields = Fields::new();
                for (key, value) in map {
                    if key != "id" {
                        fields.insert(&key, value);
                    }
                }
                Ok(fields)
            }
            other => Err(AppError::Serialization(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }

    pub fn resolve(self, now: DateTime<Utc>) -> Map<String, Value> {
        self.entries
            .into_iter()
            .map(|(key, value)| {
                let resolved = match value {
                    FieldValue::Value(v) => v,
                    FieldValue::ServerTimestamp => {
                        serde_json::to_value(now).unwrap_or(Value::Null)
                    }
                };
                (key, resolved)
            })
            .collect()
    }
}

// ==============================================================================
// SUBSCRIPTIONS
// ==============================================================================

pub type Snapshot = StoreResult<Vec<Document>>;

/// Live result set of a query. Every item is the complete current result.
/// Dropping the subscription releases the listener.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Snapshot>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<Snapshot>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            receiver,
            release: Some(Box::new(release)),
        }
    }

    pub async fn next_snapshot(&mut self) -> Option<Snapshot> {
        self.receiver.recv().await
    }

    /// A snapshot that is already queued, without waiting.
    pub fn try_next_snapshot(&mut self) -> Option<Snapshot> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Contract of the remote document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>>;

    async fn subscribe(&self, query: Query) -> StoreResult<Subscription>;

    async fn create(&self, collection: Collection, fields: Fields) -> StoreResult<String>;

    async fn update(&self, collection: Collection, id: &str, fields: Fields) -> StoreResult<()>;

    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Document>>;
}
