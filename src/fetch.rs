use crate::backend::{Backend, QueryOrder};
use crate::collection::Collection;
use crate::errors::{SyncError, SyncResult};
use crate::models::{parse_record, Record};
use crate::scope::{Scope, ScopeState};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

#[derive(Clone)]
pub struct FetchController {
    backend: Arc<dyn Backend>,
    timeout_ms: u64,
    order: QueryOrder,
}

impl FetchController {
    pub fn new(backend: Arc<dyn Backend>, timeout_ms: u64) -> Self {
        Self {
            backend,
            timeout_ms,
            order: QueryOrder::default(),
        }
    }

    pub fn with_order(mut self, order: QueryOrder) -> Self {
        self.order = order;
        self
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub async fn load<R: Record>(&self, scope: &ScopeState) -> SyncResult<Collection<R>> {
        let scope = scope.resolved()?;
        let filters = scope.filters::<R>();
        let query = self.backend.query(R::TABLE, &filters, &self.order);

        let rows = match timeout(Duration::from_millis(self.timeout_ms), query).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    table = R::TABLE.as_str(),
                    timeout_ms = self.timeout_ms,
                    "scoped query timed out"
                );
                return Err(SyncError::timed_out(
                    format!("query {}", R::TABLE.as_str()),
                    self.timeout_ms,
                ));
            }
        };

        let collection = parse_records::<R>(&rows, scope);
        tracing::debug!(
            table = R::TABLE.as_str(),
            fetched = rows.len(),
            kept = collection.len(),
            "loaded snapshot"
        );
        Ok(collection)
    }
}

pub fn parse_records<R: Record>(rows: &[Value], scope: &Scope) -> Collection<R> {
    let mut collection = Collection::new();
    for raw in rows {
        match parse_record::<R>(raw) {
            Ok(record) if scope.admits(&record) => {
                collection.upsert(record);
            }
            Ok(record) => {
                tracing::debug!(table = R::TABLE.as_str(), key = %record.key(), "row outside viewer scope dropped");
            }
            Err(error) => {
                tracing::warn!(table = R::TABLE.as_str(), error = %error, "dropping malformed record");
            }
        }
    }
    collection
}
