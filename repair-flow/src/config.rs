use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::{
    error::{FlowError, Result},
    reconcile::ReconcileConfig,
    upload::UploadPolicy,
};

/// Runtime knobs for a booking flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub reconcile: ReconcileConfig,
    pub upload: UploadPolicy,
}

impl FlowConfig {
    /// Defaults overridden by `REPAIR_FLOW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("REPAIR_FLOW_DEBOUNCE_MS")? {
            config.reconcile.debounce = Duration::from_millis(ms);
        }
        if let Some(capacity) = env_parse::<usize>("REPAIR_FLOW_HISTORY")? {
            config.reconcile.history_capacity = capacity;
        }
        if let Some(ms) = env_parse::<u64>("REPAIR_FLOW_REQUEST_TIMEOUT_MS")? {
            config.reconcile.request_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = env_parse::<u64>("REPAIR_FLOW_MAX_UPLOAD_BYTES")? {
            config.upload.max_file_bytes = bytes;
        }
        if let Some(max) = env_parse::<usize>("REPAIR_FLOW_MAX_QUEUE")? {
            config.upload.max_queue = max;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconcile.history_capacity == 0 {
            return Err(FlowError::Config(
                "trend history capacity must be at least 1".into(),
            ));
        }
        if self.reconcile.request_timeout.is_zero() {
            return Err(FlowError::Config("request timeout must be non-zero".into()));
        }
        if self.upload.max_queue == 0 {
            return Err(FlowError::Config("upload queue size must be at least 1".into()));
        }
        if self.upload.allowed_types.is_empty() {
            return Err(FlowError::Config("upload allow-list must not be empty".into()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| FlowError::Config(format!("{} has an invalid value '{}': {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}
