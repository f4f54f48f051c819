//! Connection Options
//!
//! User-adjustable knobs for the next tunnel run: TLS server name,
//! per-family endpoint overrides and the address-family preference.
//! Independent of the persisted profile.

use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use tracing::info;

/// Default SNI, chosen for censorship circumvention
pub const DEFAULT_SNI: &str = "www.visa.cn";

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Snapshot of all connection options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// TLS server name. Empty means "use the transport's protocol default".
    pub sni: String,
    /// IPv4 endpoint override. Empty means "use profile default".
    pub endpoint_v4: String,
    /// IPv6 endpoint override. Empty means "use profile default".
    pub endpoint_v6: String,
    /// Connect over IPv6 instead of IPv4
    pub prefer_ipv6: bool,
}

impl ConnectionOptions {
    /// Override for the given family
    pub fn endpoint(&self, family: AddressFamily) -> &str {
        match family {
            AddressFamily::V4 => &self.endpoint_v4,
            AddressFamily::V6 => &self.endpoint_v6,
        }
    }

    /// Family the next run will connect over
    pub fn family(&self) -> AddressFamily {
        if self.prefer_ipv6 {
            AddressFamily::V6
        } else {
            AddressFamily::V4
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            sni: DEFAULT_SNI.to_string(),
            endpoint_v4: String::new(),
            endpoint_v6: String::new(),
            prefer_ipv6: false,
        }
    }
}

/// Thread-safe holder for [`ConnectionOptions`]
///
/// Every read returns a whole snapshot and every write replaces fields
/// under the same lock, so a concurrent `start` never sees a half-applied
/// change.
#[derive(Debug, Default)]
pub struct OptionsStore {
    inner: RwLock<ConnectionOptions>,
}

impl OptionsStore {
    /// Create a store holding the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from a previously persisted snapshot
    pub fn with_options(options: ConnectionOptions) -> Self {
        Self {
            inner: RwLock::new(options),
        }
    }

    /// Consistent snapshot of all fields
    pub fn get(&self) -> ConnectionOptions {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply several changes as one atomic update
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ConnectionOptions),
    {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Replace the whole option set
    pub fn replace(&self, options: ConnectionOptions) {
        self.update(|current| *current = options);
    }

    /// Set the TLS server name (empty = protocol default)
    pub fn set_sni(&self, sni: impl Into<String>) {
        let sni = sni.into();
        info!("SNI set to: {}", sni);
        self.update(|o| o.sni = sni);
    }

    /// Set the endpoint override for one address family (empty = profile default)
    pub fn set_endpoint(&self, family: AddressFamily, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        info!("{} endpoint override set to: {:?}", family, endpoint);
        self.update(|o| match family {
            AddressFamily::V4 => o.endpoint_v4 = endpoint,
            AddressFamily::V6 => o.endpoint_v6 = endpoint,
        });
    }

    /// Choose the address family for the next run
    pub fn set_prefer_ipv6(&self, prefer: bool) {
        info!("Prefer IPv6: {}", prefer);
        self.update(|o| o.prefer_ipv6 = prefer);
    }

    /// Reset every field to its default
    pub fn reset_to_defaults(&self) {
        self.replace(ConnectionOptions::default());
        info!("Connection options reset to defaults");
    }
}
