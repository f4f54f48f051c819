//! Transport Seams
//!
//! The secure transport and the registration handshake live outside this
//! crate. This module defines what the coordinator hands them and what it
//! expects back.

use crate::device::TunDevice;
use crate::endpoint::Endpoint;
use crate::profile::{Credentials, Profile};
use crate::settings::BridgeSettings;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Fixed parameters for one tunnel run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelParams {
    /// Keepalive interval
    pub keepalive: Duration,
    /// Size of the first datagram
    pub initial_packet_size: u16,
    /// Delay between reconnect attempts of the underlying stream
    pub reconnect_delay: Duration,
    /// Interface MTU
    pub mtu: usize,
}

impl TunnelParams {
    pub fn from_settings(settings: &BridgeSettings, mtu: usize) -> Self {
        Self {
            keepalive: settings.keepalive(),
            initial_packet_size: settings.initial_packet_size,
            reconnect_delay: settings.reconnect_delay(),
            mtu,
        }
    }
}

/// Everything the transport needs to reach the concentrator
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Resolved concentrator address
    pub endpoint: Endpoint,
    /// TLS server name
    pub sni: String,
    /// Key material from the profile
    pub credentials: Credentials,
    /// Run parameters
    pub params: TunnelParams,
}

/// The transport's view of its run
#[derive(Debug)]
pub struct TunnelLink {
    cancel: CancellationToken,
    connected: Mutex<Option<oneshot::Sender<()>>>,
}

impl TunnelLink {
    pub(crate) fn new(cancel: CancellationToken) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                cancel,
                connected: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Cancellation handle for this run
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Shorthand for `cancel_token().is_cancelled()`
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report that the handshake completed. Only the first call counts.
    pub fn mark_connected(&self) {
        let tx = self
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

/// Secure transport driving the tunnel
pub trait Transport: Send + Sync + 'static {
    /// TLS and key state built before the run starts
    type Prepared: Send + 'static;

    /// Server name used when no SNI override is set
    fn default_sni(&self) -> &str;

    /// Whether [`TunnelLink::mark_connected`] is called on handshake
    /// completion. When `false` the coordinator falls back to a fixed delay.
    fn reports_handshake(&self) -> bool {
        false
    }

    /// Validate key material and build TLS state. Runs on the caller's
    /// thread; failures abort the start.
    fn prepare(&self, session: &SessionConfig) -> anyhow::Result<Self::Prepared>;

    /// Keep the tunnel up until cancelled or the network gives out.
    ///
    /// Blocks for the whole run on a dedicated thread. Reconnection of the
    /// underlying stream is the routine's own business.
    fn maintain(
        &self,
        session: SessionConfig,
        prepared: Self::Prepared,
        device: Arc<TunDevice>,
        link: TunnelLink,
    ) -> anyhow::Result<()>;
}

/// Account registration service
pub trait Registrar: Send + Sync {
    /// Create an account, enroll a fresh key pair and return the profile
    fn register(&self, device_label: &str) -> anyhow::Result<Profile>;
}
