use crate::errors::{SyncError, SyncResult};
use crate::models::merge_json;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const MIN_TIMEOUT_MS: u64 = 1;
const MAX_TIMEOUT_MS: u64 = 600_000;
const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub fetch_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub provisional_key_prefix: String,
    pub event_buffer: usize,
    pub default_page_size: u32,
    pub log_filter: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            provisional_key_prefix: "local-".to_string(),
            event_buffer: 256,
            default_page_size: 10,
            log_filter: "info".to_string(),
        }
    }
}

impl SyncSettings {
    pub fn from_yaml_str(raw: &str) -> SyncResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> SyncResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "settings file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn apply_overrides(&self, update: serde_json::Value) -> SyncResult<Self> {
        let mut merged = serde_json::to_value(self).map_err(|error| SyncError::Config(error.to_string()))?;
        merge_json(&mut merged, update);
        let settings: Self =
            serde_json::from_value(merged).map_err(|error| SyncError::Config(error.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> SyncResult<()> {
        for (name, value) in [
            ("fetchTimeoutMs", self.fetch_timeout_ms),
            ("writeTimeoutMs", self.write_timeout_ms),
        ] {
            if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&value) {
                return Err(SyncError::Config(format!(
                    "{} must be between {} and {} (got {})",
                    name, MIN_TIMEOUT_MS, MAX_TIMEOUT_MS, value
                )));
            }
        }
        if self.provisional_key_prefix.trim().is_empty() {
            return Err(SyncError::Config("provisionalKeyPrefix cannot be empty".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::Config("eventBuffer must be at least 1".to_string()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.default_page_size) {
            return Err(SyncError::Config(format!(
                "defaultPageSize must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }
}
