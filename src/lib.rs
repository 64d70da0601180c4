pub mod backend;
pub mod collection;
pub mod errors;
pub mod fetch;
pub mod merge;
pub mod models;
pub mod projection;
pub mod scope;
pub mod settings;
pub mod tracker;
pub mod view;

pub use crate::backend::memory::MemoryBackend;
pub use crate::backend::{Backend, ChangeFeed, QueryFilter, QueryOrder, RawChangeEvent, Subscription};
pub use crate::collection::Collection;
pub use crate::errors::{SyncError, SyncResult};
pub use crate::fetch::FetchController;
pub use crate::merge::ChangeEvent;
pub use crate::models::{
    ClientRecord, ClientStatus, NotificationRecord, PaymentRecord, PaymentStatus, Record, Table, TaskPriority,
    TaskRecord, TaskStatus,
};
pub use crate::projection::{ListQuery, PageResponse, PaymentSummary};
pub use crate::scope::{Scope, ScopeState, Viewer, ViewerRole};
pub use crate::settings::SyncSettings;
pub use crate::tracker::{MutationKind, MutationTracker, PendingMutation, PendingState};
pub use crate::view::{MutationTicket, SyncedView};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub fn init_tracing(log_dir: &Path, default_filter: &str) -> SyncResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| SyncError::Config(error.to_string()))
}
