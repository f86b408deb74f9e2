// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Tunables for descriptors built by [`crate::create_authentic_data_with_config`].

use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthflowConfig {
    /// Chunks buffered between an accept-stream writer and the task
    /// verifying it. A full buffer suspends the writer.
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,

    /// Read buffer used when piping a fetched source into an accept-stream.
    #[serde(default = "default_pump_chunk_size")]
    pub pump_chunk_size: usize,

    /// Upper bound on how long the fetch callback may take to produce a
    /// byte source. `None` leaves the callback's own contract in charge.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: Option<u64>,
}

fn default_sink_capacity() -> usize {
    16
}

fn default_pump_chunk_size() -> usize {
    64 * 1024
}

fn default_fetch_timeout_ms() -> Option<u64> {
    Some(5000)
}

impl Default for AuthflowConfig {
    fn default() -> Self {
        Self {
            sink_capacity: default_sink_capacity(),
            pump_chunk_size: default_pump_chunk_size(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl AuthflowConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut config: AuthflowConfig = serde_yaml_ng::from_str(text)?;
        config.sink_capacity = config.sink_capacity.max(1);
        config.pump_chunk_size = config.pump_chunk_size.max(1);
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthflowError;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = AuthflowConfig::from_yaml("sink_capacity: 4\n").unwrap();
        assert_eq!(config.sink_capacity, 4);
        assert_eq!(config.pump_chunk_size, 64 * 1024);
        assert_eq!(config.fetch_timeout_ms, Some(5000));
    }

    #[test]
    fn test_timeout_can_be_disabled() {
        let config = AuthflowConfig::from_yaml("fetch_timeout_ms: null\n").unwrap();
        assert_eq!(config.fetch_timeout_ms, None);
    }

    #[test]
    fn test_zero_sizes_are_clamped() {
        let config = AuthflowConfig::from_yaml("sink_capacity: 0\npump_chunk_size: 0\n").unwrap();
        assert_eq!(config.sink_capacity, 1);
        assert_eq!(config.pump_chunk_size, 1);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = AuthflowConfig {
            sink_capacity: 2,
            pump_chunk_size: 512,
            fetch_timeout_ms: None,
        };
        let yaml = config.to_yaml().unwrap();
        assert_eq!(AuthflowConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_bad_yaml_is_config_error() {
        assert!(matches!(
            AuthflowConfig::from_yaml("sink_capacity: [1, 2]"),
            Err(AuthflowError::Config(_))
        ));
    }
}
