//! Runtime configuration.
//!
//! A [`RuntimeConfig`] tunes the hooks registry owned by a
//! [`Runtime`](crate::reactive::Runtime). It can be built in code or loaded
//! from JSON; missing fields take their defaults.

use serde::{Deserialize, Serialize};

use crate::error::{SignalError, SignalResult};

/// Tunables for a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of signal-creation events buffered while no create
    /// hook is installed. The oldest events are dropped beyond this.
    pub create_queue_capacity: usize,

    /// Emit a trace event whenever a superseded computation is discarded.
    pub trace_aborted: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            create_queue_capacity: 256,
            trace_aborted: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from a JSON document.
    pub fn from_json(source: &str) -> SignalResult<Self> {
        serde_json::from_str(source).map_err(|e| SignalError::Config(e.to_string()))
    }

    /// Serialize the configuration to JSON.
    pub fn to_json(&self) -> SignalResult<String> {
        serde_json::to_string(self).map_err(|e| SignalError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = RuntimeConfig::from_json(r#"{ "create_queue_capacity": 8 }"#).unwrap();
        assert_eq!(config.create_queue_capacity, 8);
        assert!(config.trace_aborted);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let error = RuntimeConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(error, SignalError::Config(_)));
    }

    #[test]
    fn config_survives_json() {
        let config = RuntimeConfig {
            create_queue_capacity: 3,
            trace_aborted: false,
        };
        let parsed = RuntimeConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
