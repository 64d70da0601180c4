pub mod memory;

use crate::errors::SyncResult;
use crate::models::Table;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueryFilter {
    Eq { field: String, value: Value },
    In { field: String, values: Vec<Value> },
}

impl QueryFilter {
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Self::Eq { field, value } => row.get(field) == Some(value),
            Self::In { field, values } => row
                .get(field)
                .map(|actual| values.contains(actual))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOrder {
    pub column: String,
    pub ascending: bool,
}

impl Default for QueryOrder {
    fn default() -> Self {
        Self {
            column: "updated_at".to_string(),
            ascending: false,
        }
    }
}

// Deletes carry the old row; only its key is meaningful.
#[derive(Debug, Clone, PartialEq)]
pub enum RawChangeEvent {
    Inserted(Value),
    Updated(Value),
    Deleted(Value),
}

type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

pub struct Subscription {
    id: String,
    table: Table,
    release: Option<ReleaseFn>,
}

impl Subscription {
    pub fn new(table: Table, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            table,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(release) = self.release.take() {
            tracing::debug!(subscription_id = %self.id, table = self.table.as_str(), "releasing change feed");
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("released", &self.release.is_none())
            .finish()
    }
}

#[derive(Debug)]
pub struct ChangeFeed {
    pub subscription: Subscription,
    pub events: mpsc::Receiver<RawChangeEvent>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn query(&self, table: Table, filters: &[QueryFilter], order: &QueryOrder) -> SyncResult<Vec<Value>>;

    async fn insert(&self, table: Table, row: Value) -> SyncResult<Value>;

    async fn update(&self, table: Table, key: &str, patch: Value) -> SyncResult<()>;

    async fn delete(&self, table: Table, key: &str) -> SyncResult<()>;

    async fn subscribe(&self, table: Table, buffer: usize) -> SyncResult<ChangeFeed>;
}
