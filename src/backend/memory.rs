use super::{Backend, ChangeFeed, QueryFilter, QueryOrder, RawChangeEvent, Subscription};
use crate::errors::{SyncError, SyncResult};
use crate::models::{merge_json, raw_key, Table, KEY_FIELD};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug)]
struct Subscriber {
    table: Table,
    sender: mpsc::Sender<RawChangeEvent>,
}

#[derive(Debug)]
struct MemoryState {
    tables: HashMap<Table, BTreeMap<String, Value>>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber_id: u64,
    failing_writes: usize,
    failing_queries: usize,
    hang_queries: bool,
    hang_writes: bool,
    query_delay: Option<Duration>,
    write_delay: Option<Duration>,
    echo_writes: bool,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            subscribers: HashMap::new(),
            next_subscriber_id: 0,
            failing_writes: 0,
            failing_queries: 0,
            hang_queries: false,
            hang_writes: false,
            query_delay: None,
            write_delay: None,
            echo_writes: true,
        }
    }
}

impl MemoryState {
    fn broadcast(&mut self, table: Table, event: RawChangeEvent) {
        self.subscribers.retain(|id, subscriber| {
            if subscriber.table != table {
                return true;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(subscriber_id = id, table = table.as_str(), "change feed full, event dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn take_write_failure(&mut self) -> bool {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Transport("memory backend mutex poisoned".to_string()))
    }

    pub fn seed(&self, table: Table, rows: Vec<Value>) -> SyncResult<()> {
        let mut state = self.lock()?;
        let stored = state.tables.entry(table).or_default();
        for row in rows {
            let key = raw_key(&row)
                .ok_or_else(|| SyncError::MalformedRecord(format!("seed row for {} has no key", table.as_str())))?
                .to_string();
            stored.insert(key, row);
        }
        Ok(())
    }

    pub fn rows(&self, table: Table) -> SyncResult<Vec<Value>> {
        let state = self.lock()?;
        Ok(state
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    pub fn row(&self, table: Table, key: &str) -> SyncResult<Option<Value>> {
        let state = self.lock()?;
        Ok(state.tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    pub fn subscriber_count(&self, table: Table) -> SyncResult<usize> {
        let state = self.lock()?;
        Ok(state
            .subscribers
            .values()
            .filter(|subscriber| subscriber.table == table && !subscriber.sender.is_closed())
            .count())
    }

    pub fn fail_next_writes(&self, count: usize) -> SyncResult<()> {
        self.lock()?.failing_writes = count;
        Ok(())
    }

    pub fn fail_next_queries(&self, count: usize) -> SyncResult<()> {
        self.lock()?.failing_queries = count;
        Ok(())
    }

    pub fn set_hang_queries(&self, hang: bool) -> SyncResult<()> {
        self.lock()?.hang_queries = hang;
        Ok(())
    }

    pub fn set_hang_writes(&self, hang: bool) -> SyncResult<()> {
        self.lock()?.hang_writes = hang;
        Ok(())
    }

    // Rows are read when the query starts and returned after `delay`, so the
    // result can be stale by the time the caller sees it.
    pub fn set_query_delay(&self, delay: Option<Duration>) -> SyncResult<()> {
        self.lock()?.query_delay = delay;
        Ok(())
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) -> SyncResult<()> {
        self.lock()?.write_delay = delay;
        Ok(())
    }

    // When disabled, writes succeed without reaching the change feed,
    // modelling events lost by the transport.
    pub fn set_echo_writes(&self, echo: bool) -> SyncResult<()> {
        self.lock()?.echo_writes = echo;
        Ok(())
    }

    pub fn emit(&self, table: Table, event: RawChangeEvent) -> SyncResult<()> {
        self.lock()?.broadcast(table, event);
        Ok(())
    }

    pub fn remote_upsert(&self, table: Table, row: Value) -> SyncResult<()> {
        let key = raw_key(&row)
            .ok_or_else(|| SyncError::MalformedRecord(format!("remote row for {} has no key", table.as_str())))?
            .to_string();
        let mut state = self.lock()?;
        let previous = state.tables.entry(table).or_default().insert(key, row.clone());
        let event = if previous.is_some() {
            RawChangeEvent::Updated(row)
        } else {
            RawChangeEvent::Inserted(row)
        };
        state.broadcast(table, event);
        Ok(())
    }

    pub fn remote_delete(&self, table: Table, key: &str) -> SyncResult<()> {
        let mut state = self.lock()?;
        let removed = state.tables.entry(table).or_default().remove(key);
        if let Some(old) = removed {
            state.broadcast(table, RawChangeEvent::Deleted(old));
        }
        Ok(())
    }

    async fn before_write(&self, operation: &str, table: Table) -> SyncResult<()> {
        let (hang, delay) = {
            let state = self.lock()?;
            (state.hang_writes, state.write_delay)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.lock()?.take_write_failure() {
            return Err(SyncError::Transport(format!(
                "{} on {} rejected by backend",
                operation,
                table.as_str()
            )));
        }
        Ok(())
    }
}

fn compare_column(a: &Value, b: &Value, column: &str) -> Ordering {
    match (a.get(column), b.get(column)) {
        (Some(Value::Number(left)), Some(Value::Number(right))) => left
            .as_f64()
            .partial_cmp(&right.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(left)), Some(Value::String(right))) => left.cmp(right),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn query(&self, table: Table, filters: &[QueryFilter], order: &QueryOrder) -> SyncResult<Vec<Value>> {
        let (hang, delay) = {
            let mut state = self.lock()?;
            if state.failing_queries > 0 {
                state.failing_queries -= 1;
                return Err(SyncError::Transport(format!(
                    "query on {} failed: connection reset",
                    table.as_str()
                )));
            }
            (state.hang_queries, state.query_delay)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut rows = {
            let state = self.lock()?;
            state
                .tables
                .get(&table)
                .map(|rows| {
                    rows.values()
                        .filter(|row| filters.iter().all(|filter| filter.matches(row)))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        rows.sort_by(|a, b| {
            let ordering = compare_column(a, b, &order.column);
            if order.ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, row: Value) -> SyncResult<Value> {
        self.before_write("insert", table).await?;

        let Value::Object(mut map) = row else {
            return Err(SyncError::Transport(format!(
                "insert on {} expects an object row",
                table.as_str()
            )));
        };
        let key = Uuid::new_v4().to_string();
        let now = Value::String(Utc::now().to_rfc3339());
        map.insert(KEY_FIELD.to_string(), Value::String(key.clone()));
        map.entry("created_at".to_string()).or_insert_with(|| now.clone());
        map.insert("updated_at".to_string(), now);
        let stored = Value::Object(map);

        let mut state = self.lock()?;
        state.tables.entry(table).or_default().insert(key, stored.clone());
        if state.echo_writes {
            state.broadcast(table, RawChangeEvent::Inserted(stored.clone()));
        }
        Ok(stored)
    }

    async fn update(&self, table: Table, key: &str, patch: Value) -> SyncResult<()> {
        self.before_write("update", table).await?;

        let mut state = self.lock()?;
        let Some(row) = state.tables.entry(table).or_default().get_mut(key) else {
            return Err(SyncError::Transport(format!(
                "update on {}: row '{}' does not exist",
                table.as_str(),
                key
            )));
        };
        merge_json(row, patch);
        if let Value::Object(map) = row {
            map.insert(KEY_FIELD.to_string(), Value::String(key.to_string()));
            map.insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        }
        let updated = row.clone();
        if state.echo_writes {
            state.broadcast(table, RawChangeEvent::Updated(updated));
        }
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str) -> SyncResult<()> {
        self.before_write("delete", table).await?;

        let mut state = self.lock()?;
        let removed = state.tables.entry(table).or_default().remove(key);
        if let (Some(old), true) = (removed, state.echo_writes) {
            state.broadcast(table, RawChangeEvent::Deleted(old));
        }
        Ok(())
    }

    async fn subscribe(&self, table: Table, buffer: usize) -> SyncResult<ChangeFeed> {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let id = {
            let mut state = self.lock()?;
            let id = state.next_subscriber_id;
            state.next_subscriber_id += 1;
            state.subscribers.insert(id, Subscriber { table, sender });
            id
        };

        let state = Arc::downgrade(&self.state);
        let subscription = Subscription::new(table, move || {
            if let Some(state) = state.upgrade() {
                if let Ok(mut state) = state.lock() {
                    state.subscribers.remove(&id);
                }
            }
        });

        Ok(ChangeFeed {
            subscription,
            events: receiver,
        })
    }
}
