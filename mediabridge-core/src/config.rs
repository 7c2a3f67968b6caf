//! Bridge settings snapshot
//!
//! Settings are supplied by the surrounding client as JSON. There are no
//! built-in defaults: every value is read from the snapshot and validated
//! before a bridge is built from it.

use crate::backoff::BackoffPolicy;
use crate::media::AudioProcessing;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Settings errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Settings could not be parsed
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    /// Settings file could not be read
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    /// A value is out of range
    #[error("Invalid setting {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// ICE server acquisition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceSettings {
    /// Endpoint returning STUN/TURN descriptors
    pub endpoint: String,
    /// Hard bound on one fetch
    pub fetch_timeout_ms: u64,
    /// Reflection server used when the fetch fails
    pub fallback_stun_address: String,
}

impl IceSettings {
    /// Fetch timeout as a duration
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Reconnection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectSettings {
    /// Smallest retry delay
    pub base_interval_ms: u64,
    /// Largest retry delay
    pub max_interval_ms: u64,
    /// Multiplier applied to the previous delay
    pub growth_factor: f64,
    /// Connection attempts before giving up
    pub max_attempts: u32,
}

impl ReconnectSettings {
    /// Backoff policy described by these settings
    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_interval_ms),
            Duration::from_millis(self.max_interval_ms),
            self.growth_factor,
        )
    }
}

/// Sender track enforcement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementSettings {
    /// Delay of the safety-net pass after a committed track replacement
    pub safety_net_delay_ms: u64,
}

impl EnforcementSettings {
    /// Safety-net delay as a duration
    #[must_use]
    pub fn safety_net_delay(&self) -> Duration {
        Duration::from_millis(self.safety_net_delay_ms)
    }
}

/// Complete settings snapshot for the bridges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    /// Default audio processing constraints
    pub media: AudioProcessing,
    /// ICE server acquisition
    pub ice: IceSettings,
    /// Reconnection backoff
    pub reconnect: ReconnectSettings,
    /// Sender track enforcement
    pub enforcement: EnforcementSettings,
    /// Whether the audio bridge may drop to listen-only without leaving the session
    pub transparent_listen_only: bool,
}

impl BridgeSettings {
    /// Parse and validate settings from a JSON document
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed or a value is out of range
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read, parse and validate settings from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is malformed, or a value is out of range
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check every value is usable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.ice.endpoint.trim().is_empty() {
            return Err(invalid("ice.endpoint", "must not be empty"));
        }
        if self.ice.fetch_timeout_ms == 0 {
            return Err(invalid("ice.fetchTimeoutMs", "must be positive"));
        }
        if self.ice.fallback_stun_address.trim().is_empty() {
            return Err(invalid("ice.fallbackStunAddress", "must not be empty"));
        }

        let reconnect = &self.reconnect;
        if reconnect.base_interval_ms == 0 {
            return Err(invalid("reconnect.baseIntervalMs", "must be positive"));
        }
        if reconnect.max_interval_ms < reconnect.base_interval_ms {
            return Err(invalid(
                "reconnect.maxIntervalMs",
                format!(
                    "{} is below baseIntervalMs {}",
                    reconnect.max_interval_ms, reconnect.base_interval_ms
                ),
            ));
        }
        if !reconnect.growth_factor.is_finite() || reconnect.growth_factor < 1.0 {
            return Err(invalid(
                "reconnect.growthFactor",
                format!("{} must be a finite value >= 1.0", reconnect.growth_factor),
            ));
        }
        if reconnect.max_attempts == 0 {
            return Err(invalid("reconnect.maxAttempts", "must be at least 1"));
        }

        if self.enforcement.safety_net_delay_ms == 0 {
            return Err(invalid("enforcement.safetyNetDelayMs", "must be positive"));
        }

        Ok(())
    }
}
