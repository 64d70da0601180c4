use crate::backend::QueryFilter;
use crate::errors::{SyncError, SyncResult};
use crate::models::Record;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewerRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewer {
    pub user_id: String,
    pub role: ViewerRole,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    client_id: Option<String>,
    allowed_statuses: Option<BTreeSet<String>>,
}

impl Scope {
    pub fn admin() -> Self {
        Self {
            client_id: None,
            allowed_statuses: None,
        }
    }

    pub fn client(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            allowed_statuses: None,
        }
    }

    pub fn for_viewer(viewer: &Viewer) -> SyncResult<Self> {
        match viewer.role {
            ViewerRole::Admin => Ok(Self::admin()),
            ViewerRole::Member => match viewer.client_id.as_deref().map(str::trim) {
                Some(client_id) if !client_id.is_empty() => Ok(Self::client(client_id)),
                _ => Err(SyncError::ScopeUnresolved(format!(
                    "viewer {} has no assigned client",
                    viewer.user_id
                ))),
            },
        }
    }

    pub fn with_status_allow_list<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_statuses = Some(statuses.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_admin(&self) -> bool {
        self.client_id.is_none()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn admits<R: Record>(&self, record: &R) -> bool {
        let Some(client_id) = self.client_id.as_deref() else {
            return true;
        };
        if record.owner_client_id() != Some(client_id) {
            return false;
        }
        match (self.allowed_statuses.as_ref(), record.status()) {
            (Some(allowed), Some(status)) => allowed.contains(status),
            _ => true,
        }
    }

    pub fn filters<R: Record>(&self) -> Vec<QueryFilter> {
        let Some(client_id) = self.client_id.as_deref() else {
            return Vec::new();
        };

        let mut filters = vec![QueryFilter::Eq {
            field: R::OWNER_FIELD.to_string(),
            value: serde_json::Value::String(client_id.to_string()),
        }];
        if let (Some(allowed), Some(field)) = (self.allowed_statuses.as_ref(), R::STATUS_FIELD) {
            filters.push(QueryFilter::In {
                field: field.to_string(),
                values: allowed
                    .iter()
                    .map(|status| serde_json::Value::String(status.clone()))
                    .collect(),
            });
        }
        filters
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScopeState {
    #[default]
    Unresolved,
    Resolved(Scope),
}

impl ScopeState {
    pub fn resolved(&self) -> SyncResult<&Scope> {
        match self {
            Self::Resolved(scope) => Ok(scope),
            Self::Unresolved => Err(SyncError::ScopeUnresolved(
                "viewer identity is not known yet".to_string(),
            )),
        }
    }
}

impl From<Scope> for ScopeState {
    fn from(value: Scope) -> Self {
        Self::Resolved(value)
    }
}
