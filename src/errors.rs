use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("SCOPE_UNRESOLVED: {0}")]
    ScopeUnresolved(String),
    #[error("TRANSPORT: {0}")]
    Transport(String),
    #[error("TIMED_OUT: {operation} exceeded {timeout_ms}ms")]
    OperationTimedOut { operation: String, timeout_ms: u64 },
    #[error("MUTATION_IN_PROGRESS: {0}")]
    MutationInProgress(String),
    #[error("MALFORMED_RECORD: {0}")]
    MalformedRecord(String),
    #[error("MALFORMED_EVENT: {0}")]
    MalformedEvent(String),
    #[error("INVALID_PATCH: {0}")]
    InvalidPatch(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("DETACHED: view is not attached")]
    Detached,
    #[error("CONFIG: {0}")]
    Config(String),
}

impl SyncError {
    pub fn timed_out(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::OperationTimedOut {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::OperationTimedOut { .. })
    }

    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::MalformedRecord(_) | Self::MalformedEvent(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(value: std::io::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::MalformedRecord(value.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
