use crate::collection::Collection;
use crate::errors::{SyncError, SyncResult};
use crate::models::{merge_json, Record, KEY_FIELD};
use crate::scope::Scope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Pending,
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation<R: Record> {
    pub request_id: String,
    pub key: String,
    pub kind: MutationKind,
    pub optimistic: Option<R>,
    pub prior: Option<R>,
    pub patch: Option<Value>,
    pub state: PendingState,
    pub issued_at: DateTime<Utc>,
}

impl<R: Record> PendingMutation<R> {
    fn new(key: String, kind: MutationKind, optimistic: Option<R>, prior: Option<R>, patch: Option<Value>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            key,
            kind,
            optimistic,
            prior,
            patch,
            state: PendingState::Pending,
            issued_at: Utc::now(),
        }
    }
}

pub fn apply_patch<R: Record>(record: &R, patch: &Value) -> SyncResult<R> {
    if !patch.is_object() {
        return Err(SyncError::InvalidPatch(format!(
            "patch for {} '{}' must be an object",
            R::TABLE.as_str(),
            record.key()
        )));
    }

    let mut value = serde_json::to_value(record)
        .map_err(|error| SyncError::InvalidPatch(error.to_string()))?;
    merge_json(&mut value, patch.clone());
    if let Value::Object(map) = &mut value {
        map.insert(KEY_FIELD.to_string(), Value::String(record.key().to_string()));
    }

    serde_json::from_value::<R>(value).map_err(|error| {
        SyncError::InvalidPatch(format!("{} '{}': {}", R::TABLE.as_str(), record.key(), error))
    })
}

fn sanitize_patch(mut patch: Value) -> Value {
    if let Value::Object(map) = &mut patch {
        map.remove(KEY_FIELD);
    }
    patch
}

#[derive(Debug)]
pub struct MutationTracker<R: Record> {
    pending: HashMap<String, PendingMutation<R>>,
    key_prefix: String,
}

impl<R: Record> MutationTracker<R> {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            pending: HashMap::new(),
            key_prefix: key_prefix.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&PendingMutation<R>> {
        self.pending.get(key)
    }

    pub fn is_provisional(&self, key: &str) -> bool {
        key.starts_with(&self.key_prefix)
    }

    fn ensure_idle(&self, key: &str) -> SyncResult<()> {
        if let Some(existing) = self.pending.get(key) {
            tracing::debug!(
                table = R::TABLE.as_str(),
                key = %key,
                in_flight = existing.kind.as_str(),
                "rejecting concurrent mutation"
            );
            return Err(SyncError::MutationInProgress(key.to_string()));
        }
        Ok(())
    }

    pub fn begin_create(&mut self, mut draft: R, collection: &mut Collection<R>, scope: &Scope) -> PendingMutation<R> {
        let key = format!("{}{}", self.key_prefix, Uuid::new_v4());
        draft.set_key(key.clone());
        if scope.admits(&draft) {
            collection.upsert(draft.clone());
        }

        let mutation = PendingMutation::new(key.clone(), MutationKind::Create, Some(draft), None, None);
        self.pending.insert(key, mutation.clone());
        mutation
    }

    pub fn begin_update(
        &mut self,
        key: &str,
        patch: Value,
        collection: &mut Collection<R>,
        scope: &Scope,
    ) -> SyncResult<PendingMutation<R>> {
        self.ensure_idle(key)?;
        let prior = collection
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("{} '{}'", R::TABLE.as_str(), key)))?;
        let patch = sanitize_patch(patch);
        let optimistic = apply_patch(&prior, &patch)?;

        if scope.admits(&optimistic) {
            collection.upsert(optimistic.clone());
        } else {
            collection.remove(key);
        }

        let mutation = PendingMutation::new(
            key.to_string(),
            MutationKind::Update,
            Some(optimistic),
            Some(prior),
            Some(patch),
        );
        self.pending.insert(key.to_string(), mutation.clone());
        Ok(mutation)
    }

    pub fn begin_delete(&mut self, key: &str, collection: &mut Collection<R>) -> SyncResult<PendingMutation<R>> {
        self.ensure_idle(key)?;
        let prior = collection
            .remove(key)
            .ok_or_else(|| SyncError::NotFound(format!("{} '{}'", R::TABLE.as_str(), key)))?;

        let mutation = PendingMutation::new(key.to_string(), MutationKind::Delete, None, Some(prior), None);
        self.pending.insert(key.to_string(), mutation.clone());
        Ok(mutation)
    }

    pub fn observe_event(&mut self, key: &str) -> bool {
        match self.pending.get_mut(key) {
            Some(mutation) if mutation.state == PendingState::Pending => {
                mutation.state = PendingState::Superseded;
                tracing::debug!(
                    table = R::TABLE.as_str(),
                    key = %key,
                    kind = mutation.kind.as_str(),
                    "pending mutation superseded by change event"
                );
                true
            }
            _ => false,
        }
    }

    pub fn complete_success(
        &mut self,
        key: &str,
        authoritative: Option<R>,
        collection: &mut Collection<R>,
    ) -> Option<PendingMutation<R>> {
        let mutation = self.pending.remove(key)?;
        if mutation.kind == MutationKind::Create {
            match authoritative {
                Some(record) => collection.rekey(key, record),
                None => {
                    collection.remove(key);
                }
            }
        }
        Some(mutation)
    }

    /// Backend rejected the write: undo the optimistic change.
    ///
    /// A superseded update or delete is left alone, the change event already
    /// carried the backend's state for that key.
    pub fn complete_failure(&mut self, key: &str, collection: &mut Collection<R>) -> Option<PendingMutation<R>> {
        let mutation = self.pending.remove(key)?;
        match (mutation.kind, mutation.state) {
            (MutationKind::Create, _) => {
                collection.remove(key);
            }
            (_, PendingState::Superseded) => {}
            (MutationKind::Update, PendingState::Pending) | (MutationKind::Delete, PendingState::Pending) => {
                if let Some(prior) = mutation.prior.clone() {
                    collection.upsert(prior);
                }
            }
        }
        tracing::warn!(
            table = R::TABLE.as_str(),
            key = %key,
            kind = mutation.kind.as_str(),
            "rolled back optimistic mutation"
        );
        Some(mutation)
    }

    pub fn overlay(&self, collection: &mut Collection<R>, scope: &Scope) {
        for mutation in self.pending.values() {
            if mutation.state != PendingState::Pending {
                continue;
            }
            match mutation.kind {
                MutationKind::Create => {
                    if let Some(draft) = mutation.optimistic.as_ref().filter(|draft| scope.admits(*draft)) {
                        collection.upsert(draft.clone());
                    }
                }
                MutationKind::Update => {
                    let (Some(current), Some(patch)) = (collection.get(&mutation.key), mutation.patch.as_ref()) else {
                        continue;
                    };
                    match apply_patch(current, patch) {
                        Ok(patched) if scope.admits(&patched) => {
                            collection.upsert(patched);
                        }
                        Ok(_) => {
                            collection.remove(&mutation.key);
                        }
                        Err(error) => {
                            tracing::warn!(key = %mutation.key, error = %error, "pending patch no longer applies");
                        }
                    }
                }
                MutationKind::Delete => {
                    collection.remove(&mutation.key);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
