//! Bridge Settings
//!
//! Tunables for the transport and the coordinator. Loadable from TOML or
//! JSON; every field has a default so partial files are fine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest MTU accepted (IPv6 minimum link MTU)
pub const MIN_MTU: usize = 1280;

/// Largest MTU accepted
pub const MAX_MTU: usize = 65535;

/// Bridge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Transport keepalive interval (seconds)
    pub keepalive_secs: u64,
    /// Size of the first datagram sent by the transport
    pub initial_packet_size: u16,
    /// Delay between transport reconnect attempts (milliseconds)
    pub reconnect_delay_ms: u64,
    /// Delay before the heuristic "connected" notification (milliseconds)
    pub connect_grace_ms: u64,
    /// MTU used when the host passes none
    pub default_mtu: usize,
    /// Capacity of the host -> tunnel packet queue
    pub inbound_queue_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            keepalive_secs: 30,
            initial_packet_size: 1242,
            reconnect_delay_ms: 1000,
            connect_grace_ms: 3000,
            default_mtu: 1280,
            inbound_queue_capacity: 256,
        }
    }
}

impl BridgeSettings {
    /// Load from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SettingsError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self =
            toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from a JSON string
    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        let settings: Self =
            serde_json::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), SettingsError> {
        validate_mtu(self.default_mtu)?;
        if self.inbound_queue_capacity == 0 {
            return Err(SettingsError::ZeroQueueCapacity);
        }
        if self.keepalive_secs == 0 {
            return Err(SettingsError::ZeroKeepalive);
        }
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }
}

/// Check an MTU against the accepted range
pub fn validate_mtu(mtu: usize) -> Result<(), SettingsError> {
    if (MIN_MTU..=MAX_MTU).contains(&mtu) {
        Ok(())
    } else {
        Err(SettingsError::InvalidMtu(mtu))
    }
}

/// Settings errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid MTU {0} (expected {MIN_MTU}..={MAX_MTU})")]
    InvalidMtu(usize),

    #[error("inbound queue capacity must be non-zero")]
    ZeroQueueCapacity,

    #[error("keepalive interval must be non-zero")]
    ZeroKeepalive,
}
