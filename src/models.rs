use crate::errors::{SyncError, SyncResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;

pub const KEY_FIELD: &str = "id";

// Columns the backend fills in on insert.
const SERVER_ASSIGNED: [&str; 3] = [KEY_FIELD, "created_at", "updated_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Tasks,
    Payments,
    Clients,
    Notifications,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Payments => "payments",
            Self::Clients => "clients",
            Self::Notifications => "notifications",
        }
    }
}

pub trait Record:
    Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const TABLE: Table;
    const OWNER_FIELD: &'static str = "client_id";
    const STATUS_FIELD: Option<&'static str> = None;

    fn key(&self) -> &str;
    fn set_key(&mut self, key: String);
    fn updated_at(&self) -> DateTime<Utc>;
    fn owner_client_id(&self) -> Option<&str>;

    fn status(&self) -> Option<&str> {
        None
    }

    fn matches_text(&self, _needle: &str) -> bool {
        false
    }
}

pub fn raw_key(raw: &Value) -> Option<&str> {
    raw.get(KEY_FIELD)
        .and_then(Value::as_str)
        .filter(|key| !key.trim().is_empty())
}

pub fn parse_record<R: Record>(raw: &Value) -> SyncResult<R> {
    let Some(key) = raw_key(raw) else {
        return Err(SyncError::MalformedRecord(format!(
            "{} row is missing '{}'",
            R::TABLE.as_str(),
            KEY_FIELD
        )));
    };

    serde_json::from_value::<R>(raw.clone()).map_err(|error| {
        SyncError::MalformedRecord(format!("{} row '{}': {}", R::TABLE.as_str(), key, error))
    })
}

pub fn draft_row<R: Record>(record: &R) -> SyncResult<Value> {
    let mut row = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut row {
        for column in SERVER_ASSIGNED {
            map.remove(column);
        }
    }
    Ok(row)
}

pub fn merge_json(target: &mut Value, update: Value) {
    match (target, update) {
        (Value::Object(target_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

fn contains_lowercase(haystack: Option<&str>, needle: &str) -> bool {
    haystack
        .map(|value| value.to_lowercase().contains(needle))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    Progress,
    Review,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Progress => "progress",
            Self::Review => "review",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Record for TaskRecord {
    const TABLE: Table = Table::Tasks;
    const STATUS_FIELD: Option<&'static str> = Some("status");

    fn key(&self) -> &str {
        &self.id
    }

    fn set_key(&mut self, key: String) {
        self.id = key;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn owner_client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    fn status(&self) -> Option<&str> {
        Some(self.status.as_str())
    }

    fn matches_text(&self, needle: &str) -> bool {
        contains_lowercase(Some(&self.title), needle)
            || contains_lowercase(self.description.as_deref(), needle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        }
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub status: PaymentStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Record for PaymentRecord {
    const TABLE: Table = Table::Payments;
    const STATUS_FIELD: Option<&'static str> = Some("status");

    fn key(&self) -> &str {
        &self.id
    }

    fn set_key(&mut self, key: String) {
        self.id = key;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn owner_client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    fn status(&self) -> Option<&str> {
        Some(self.status.as_str())
    }

    fn matches_text(&self, needle: &str) -> bool {
        contains_lowercase(self.invoice_number.as_deref(), needle)
            || contains_lowercase(self.description.as_deref(), needle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    #[default]
    Active,
    Inactive,
}

impl ClientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub status: ClientStatus,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Record for ClientRecord {
    const TABLE: Table = Table::Clients;
    // A client owns its own row.
    const OWNER_FIELD: &'static str = "id";
    const STATUS_FIELD: Option<&'static str> = Some("status");

    fn key(&self) -> &str {
        &self.id
    }

    fn set_key(&mut self, key: String) {
        self.id = key;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn owner_client_id(&self) -> Option<&str> {
        Some(&self.id)
    }

    fn status(&self) -> Option<&str> {
        Some(self.status.as_str())
    }

    fn matches_text(&self, needle: &str) -> bool {
        contains_lowercase(Some(&self.name), needle)
            || contains_lowercase(self.email.as_deref(), needle)
            || contains_lowercase(self.company.as_deref(), needle)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Record for NotificationRecord {
    const TABLE: Table = Table::Notifications;

    fn key(&self) -> &str {
        &self.id
    }

    fn set_key(&mut self, key: String) {
        self.id = key;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn owner_client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    fn matches_text(&self, needle: &str) -> bool {
        contains_lowercase(Some(&self.title), needle)
            || contains_lowercase(self.message.as_deref(), needle)
    }
}

pub fn unread_count(notifications: &[NotificationRecord]) -> usize {
    notifications.iter().filter(|notification| !notification.read).count()
}
