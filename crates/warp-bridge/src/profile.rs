//! Tunnel Profile
//!
//! Account and key material obtained once via registration. Stored as a
//! JSON document; the coordinator only needs `load` and read access to the
//! fields below.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Persisted profile record
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Client private key (base64, DER encoded)
    pub private_key: String,
    /// Default IPv4 endpoint of the concentrator (no port)
    pub endpoint_v4: String,
    /// Default IPv6 endpoint of the concentrator (no brackets, no port)
    pub endpoint_v6: String,
    /// Concentrator public key (PEM)
    pub endpoint_pub_key: String,
    /// Account license
    #[serde(default)]
    pub license: String,
    /// Device identifier assigned at registration
    #[serde(default)]
    pub id: String,
    /// API access token
    #[serde(default)]
    pub access_token: String,
    /// Assigned tunnel IPv4 address
    #[serde(default)]
    pub ipv4: String,
    /// Assigned tunnel IPv6 address
    #[serde(default)]
    pub ipv6: String,
}

/// Key material handed to the transport
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Decoded client private key
    pub private_key: Vec<u8>,
    /// Concentrator public key, as stored
    pub peer_public_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("private_key", &"[redacted]")
            .field("peer_public_key", &self.peer_public_key)
            .finish()
    }
}

impl Profile {
    /// Load and validate a profile from a JSON file
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProfileError::NotFound(path.display().to_string())
            } else {
                ProfileError::Io(e.to_string())
            }
        })?;
        let profile = Self::from_json(&content)?;
        debug!("Loaded profile from {}", path.display());
        Ok(profile)
    }

    /// Parse and validate a profile from a JSON string
    pub fn from_json(content: &str) -> Result<Self, ProfileError> {
        let profile: Self =
            serde_json::from_str(content).map_err(|e| ProfileError::Parse(e.to_string()))?;
        profile.validate()?;
        Ok(profile)
    }

    /// Write the profile as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ProfileError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ProfileError::Io(e.to_string()))?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ProfileError::Parse(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ProfileError::Io(e.to_string()))?;
        debug!("Saved profile to {}", path.display());
        Ok(())
    }

    /// Check that the key material is usable
    pub fn validate(&self) -> Result<(), ProfileError> {
        self.credentials().map(|_| ())
    }

    /// Decode the key material
    pub fn credentials(&self) -> Result<Credentials, ProfileError> {
        if self.private_key.trim().is_empty() {
            return Err(ProfileError::MissingField("private_key"));
        }
        let private_key = BASE64
            .decode(self.private_key.trim())
            .map_err(|_| ProfileError::InvalidPrivateKey)?;
        if private_key.is_empty() {
            return Err(ProfileError::InvalidPrivateKey);
        }

        if self.endpoint_pub_key.trim().is_empty() {
            return Err(ProfileError::MissingField("endpoint_pub_key"));
        }

        Ok(Credentials {
            private_key,
            peer_public_key: self.endpoint_pub_key.clone(),
        })
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("id", &self.id)
            .field("endpoint_v4", &self.endpoint_v4)
            .field("endpoint_v6", &self.endpoint_v6)
            .field("ipv4", &self.ipv4)
            .field("ipv6", &self.ipv6)
            .finish_non_exhaustive()
    }
}

/// Profile errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("profile not found at {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid private key (expected base64)")]
    InvalidPrivateKey,
}
