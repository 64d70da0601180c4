use crate::backend::RawChangeEvent;
use crate::collection::Collection;
use crate::errors::{SyncError, SyncResult};
use crate::models::{parse_record, raw_key, Record};
use crate::scope::Scope;

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<R: Record> {
    Inserted(R),
    Updated(R),
    Deleted(String),
}

impl<R: Record> ChangeEvent<R> {
    pub fn key(&self) -> &str {
        match self {
            Self::Inserted(record) | Self::Updated(record) => record.key(),
            Self::Deleted(key) => key,
        }
    }
}

pub fn decode_event<R: Record>(raw: RawChangeEvent) -> SyncResult<ChangeEvent<R>> {
    let malformed = |error: SyncError| SyncError::MalformedEvent(error.to_string());
    match raw {
        RawChangeEvent::Inserted(row) => parse_record::<R>(&row).map(ChangeEvent::Inserted).map_err(malformed),
        RawChangeEvent::Updated(row) => parse_record::<R>(&row).map(ChangeEvent::Updated).map_err(malformed),
        RawChangeEvent::Deleted(old) => raw_key(&old)
            .map(|key| ChangeEvent::Deleted(key.to_string()))
            .ok_or_else(|| {
                SyncError::MalformedEvent(format!("{} delete event has no key", R::TABLE.as_str()))
            }),
    }
}

/// Folds one change event into a collection.
///
/// Upserts overwrite unconditionally: the transport gives no causal order,
/// so the most recently received event wins until the next refetch. A record
/// that no longer passes `scope` is removed.
pub fn apply<R: Record>(event: ChangeEvent<R>, mut into: Collection<R>, scope: &Scope) -> Collection<R> {
    match event {
        ChangeEvent::Inserted(record) | ChangeEvent::Updated(record) => {
            if scope.admits(&record) {
                into.upsert(record);
            } else if into.remove(record.key()).is_some() {
                tracing::debug!(table = R::TABLE.as_str(), key = %record.key(), "record left viewer scope");
            }
        }
        ChangeEvent::Deleted(key) => {
            into.remove(&key);
        }
    }
    into
}

pub fn apply_raw<R: Record>(raw: RawChangeEvent, into: Collection<R>, scope: &Scope) -> Collection<R> {
    match decode_event::<R>(raw) {
        Ok(event) => apply(event, into, scope),
        Err(error) => {
            tracing::warn!(table = R::TABLE.as_str(), error = %error, "dropping malformed change event");
            into
        }
    }
}
