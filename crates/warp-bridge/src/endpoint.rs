//! Endpoint Resolution
//!
//! Picks the concentrator address for a run. A custom override wins over
//! the profile default; the address family comes from the options.

use crate::options::{AddressFamily, ConnectionOptions};
use crate::profile::Profile;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use tracing::info;

/// Port used when an address carries none
pub const DEFAULT_PORT: u16 = 443;

/// Network endpoint (IP + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address
    pub addr: IpAddr,
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Convert to SocketAddr
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Address family of this endpoint
    pub fn family(&self) -> AddressFamily {
        match self.addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Parse `ip`, `ip:port`, `[ipv6]` or `[ipv6]:port`
    ///
    /// Hostnames are rejected; name resolution is left to the host.
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        let s = s.trim();
        let invalid = |reason: &str| EndpointError::Invalid {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid("missing closing bracket for IPv6 address"))?;
            let addr: IpAddr = host.parse().map_err(|_| invalid("not an IP address"))?;
            if !addr.is_ipv6() {
                return Err(invalid("brackets are only valid around IPv6 addresses"));
            }
            let port = match tail {
                "" => DEFAULT_PORT,
                _ => {
                    let port = tail
                        .strip_prefix(':')
                        .ok_or_else(|| invalid("unexpected characters after bracket"))?;
                    parse_port(port).ok_or_else(|| invalid("invalid port"))?
                }
            };
            return Ok(Self::new(addr, port));
        }

        // A bare IPv6 literal contains colons but never a port
        if let Ok(addr) = s.parse::<IpAddr>() {
            return Ok(Self::new(addr, DEFAULT_PORT));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| invalid("not an IP address"))?;
        let addr: IpAddr = host.parse().map_err(|_| invalid("not an IP address"))?;
        let port = parse_port(port).ok_or_else(|| invalid("invalid port"))?;
        Ok(Self::new(addr, port))
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// Resolve the endpoint for the next run
///
/// 1. IPv4 preferred: the v4 override if set, else the profile's v4 default.
/// 2. IPv6 preferred: the v6 override if set, else the profile's v6 default.
pub fn resolve(options: &ConnectionOptions, profile: &Profile) -> Result<Endpoint, EndpointError> {
    let family = options.family();
    let custom = options.endpoint(family).trim();

    let (value, endpoint, source) = if !custom.is_empty() {
        (custom, Endpoint::parse(custom)?, "custom")
    } else {
        let default = match family {
            AddressFamily::V4 => profile.endpoint_v4.trim(),
            AddressFamily::V6 => profile.endpoint_v6.trim(),
        };
        if default.is_empty() {
            return Err(EndpointError::Missing(family));
        }
        (default, profile_default(default)?, "default")
    };

    if endpoint.family() != family {
        return Err(EndpointError::FamilyMismatch {
            value: value.to_string(),
            family,
        });
    }

    info!("Using {} endpoint: {}", source, endpoint);
    Ok(endpoint)
}

/// The profile's IPv4 default, formatted with the default port
pub fn default_endpoint(profile: &Profile) -> Option<Endpoint> {
    profile_default(&profile.endpoint_v4)
        .ok()
        .filter(|e| e.family() == AddressFamily::V4)
}

/// Profile defaults always use [`DEFAULT_PORT`]; a port stored with the
/// address is ignored.
fn profile_default(value: &str) -> Result<Endpoint, EndpointError> {
    let addr = match value.trim().parse::<IpAddr>() {
        Ok(addr) => addr,
        Err(_) => Endpoint::parse(value)?.addr,
    };
    Ok(Endpoint::new(addr, DEFAULT_PORT))
}

/// Endpoint resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("no {0} endpoint configured (override and profile default are both empty)")]
    Missing(AddressFamily),

    #[error("invalid endpoint '{value}': {reason}")]
    Invalid { value: String, reason: String },

    #[error("endpoint '{value}' is not an {family} address")]
    FamilyMismatch {
        value: String,
        family: AddressFamily,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::tests::sample_profile;

    fn profile_with(v4: &str, v6: &str) -> Profile {
        Profile {
            endpoint_v4: v4.into(),
            endpoint_v6: v6.into(),
            ..sample_profile()
        }
    }

    #[test]
    fn test_v4_override_wins() {
        let options = ConnectionOptions {
            endpoint_v4: "1.2.3.4".into(),
            ..Default::default()
        };
        let ep = resolve(&options, &profile_with("5.6.7.8", "")).unwrap();
        assert_eq!(ep.to_string(), "1.2.3.4:443");
    }

    #[test]
    fn test_v4_profile_default() {
        let ep = resolve(&ConnectionOptions::default(), &profile_with("5.6.7.8", "")).unwrap();
        assert_eq!(ep.to_string(), "5.6.7.8:443");
    }

    #[test]
    fn test_v6_profile_default() {
        let options = ConnectionOptions {
            prefer_ipv6: true,
            endpoint_v4: "1.2.3.4".into(),
            ..Default::default()
        };
        let ep = resolve(&options, &profile_with("5.6.7.8", "2606:4700::1")).unwrap();
        assert_eq!(ep.to_string(), "[2606:4700::1]:443");
        assert_eq!(ep.port, DEFAULT_PORT);
    }

    #[test]
    fn test_v6_override_with_port() {
        let options = ConnectionOptions {
            prefer_ipv6: true,
            endpoint_v6: "[2606:4700:103::]:1701".into(),
            ..Default::default()
        };
        let ep = resolve(&options, &profile_with("5.6.7.8", "2606:4700::1")).unwrap();
        assert_eq!(ep.to_string(), "[2606:4700:103::]:1701");
    }

    #[test]
    fn test_missing_everywhere() {
        let options = ConnectionOptions {
            prefer_ipv6: true,
            ..Default::default()
        };
        let err = resolve(&options, &profile_with("5.6.7.8", "")).unwrap_err();
        assert_eq!(err, EndpointError::Missing(AddressFamily::V6));
    }

    #[test]
    fn test_family_mismatch() {
        let options = ConnectionOptions {
            endpoint_v4: "2606:4700::1".into(),
            ..Default::default()
        };
        let err = resolve(&options, &profile_with("5.6.7.8", "")).unwrap_err();
        assert!(matches!(err, EndpointError::FamilyMismatch { .. }));
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            Endpoint::parse("162.159.198.2:1701").unwrap().to_string(),
            "162.159.198.2:1701"
        );
        assert_eq!(
            Endpoint::parse("[2606:4700:103::]").unwrap().to_string(),
            "[2606:4700:103::]:443"
        );
        assert_eq!(
            Endpoint::parse("2606:4700:103::").unwrap().to_string(),
            "[2606:4700:103::]:443"
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "engage.example.com",
            "[2606:4700::1",
            "1.2.3.4:http",
            "1.2.3.4:0",
            "[1.2.3.4]:443",
            "[2606:4700::1]x",
        ] {
            assert!(Endpoint::parse(bad).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn test_profile_default_port_is_fixed() {
        let ep = resolve(&ConnectionOptions::default(), &profile_with("5.6.7.8:1701", "")).unwrap();
        assert_eq!(ep.to_string(), "5.6.7.8:443");

        let options = ConnectionOptions {
            prefer_ipv6: true,
            ..Default::default()
        };
        let ep = resolve(&options, &profile_with("", "[2606:4700::1]:2408")).unwrap();
        assert_eq!(ep.to_string(), "[2606:4700::1]:443");

        let ep = default_endpoint(&profile_with("5.6.7.8:1701", "")).unwrap();
        assert_eq!(ep.to_string(), "5.6.7.8:443");
    }

    #[test]
    fn test_default_endpoint() {
        let ep = default_endpoint(&profile_with("5.6.7.8", "")).unwrap();
        assert_eq!(ep.to_string(), "5.6.7.8:443");
        assert!(default_endpoint(&profile_with("", "")).is_none());
    }
}
