use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Validation(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ManifestConfig {
    /// Upper bound on pending trip-panel messages.
    pub max_queued_messages: usize,
    /// Number of dispatches whose reconciled stop list is kept in memory.
    pub stop_cache_capacity: usize,
    /// Quiet period before aggregated stop-removal notifications go out.
    pub removal_notification_debounce_ms: u64,
    /// Slack after an arrival ETA before the driver is reported late.
    pub late_notification_grace_ms: u64,
    /// Dwell time at a stop after which a detention warning is raised.
    pub detention_threshold_ms: u64,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            max_queued_messages: 50,
            stop_cache_capacity: 16,
            removal_notification_debounce_ms: 5_000,
            late_notification_grace_ms: 5 * 60 * 1000,
            detention_threshold_ms: 2 * 60 * 60 * 1000,
        }
    }
}

impl ManifestConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queued_messages == 0 {
            return Err(ConfigError::Validation(
                "max_queued_messages must be > 0".into(),
            ));
        }
        if self.stop_cache_capacity == 0 {
            return Err(ConfigError::Validation(
                "stop_cache_capacity must be > 0".into(),
            ));
        }
        if self.detention_threshold_ms < 60_000 {
            return Err(ConfigError::Validation(
                "detention_threshold_ms should be at least 60000ms".into(),
            ));
        }
        Ok(())
    }
}
