//! Control Surface
//!
//! Flat, string-returning entry points for the host binding layer. Every
//! failure comes back as a descriptive message (empty string = success);
//! nothing here panics across the boundary.

use crate::device::{PacketSink, TunHandle};
use crate::endpoint;
use crate::manager::{InboundMode, TunnelManager, TunnelObserver, TunnelRequest, panic_message};
use crate::options::AddressFamily;
use crate::profile::Profile;
use crate::settings::BridgeSettings;
use crate::transport::{Registrar, Transport};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{error, info};

/// Library version reported to the host
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-android");

/// Host-facing bridge: tunnel manager plus registration
pub struct TunnelBridge<T: Transport, R: Registrar> {
    manager: TunnelManager<T>,
    registrar: R,
}

impl<T: Transport, R: Registrar> TunnelBridge<T, R> {
    pub fn new(runtime: Handle, transport: T, registrar: R, settings: BridgeSettings) -> Self {
        Self {
            manager: TunnelManager::new(runtime, transport, settings),
            registrar,
        }
    }

    /// Underlying manager
    pub fn manager(&self) -> &TunnelManager<T> {
        &self.manager
    }

    /// Register a new account and save its profile at `profile_path`.
    ///
    /// Does nothing if a valid profile is already there.
    pub fn register(&self, profile_path: &str, device_label: &str) -> String {
        let path = Path::new(profile_path);
        if Profile::load(path).is_ok() {
            info!("Profile already present at {}", profile_path);
            return String::new();
        }

        let registered =
            panic::catch_unwind(AssertUnwindSafe(|| self.registrar.register(device_label)))
                .unwrap_or_else(|payload| {
                    Err(anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref())))
                });
        let profile = match registered {
            Ok(profile) => profile,
            Err(e) => return failure(format!("Registration failed: {:#}", e)),
        };

        if let Err(e) = profile.validate() {
            return failure(format!("Registration returned an invalid profile: {}", e));
        }
        if let Err(e) = profile.save(path) {
            return failure(format!("Failed to save config: {}", e));
        }

        info!("Registered device, profile saved to {}", profile_path);
        String::new()
    }

    /// Whether a valid profile exists
    pub fn is_registered(&self, profile_path: &str) -> bool {
        Profile::load(Path::new(profile_path)).is_ok()
    }

    /// Tunnel IPv4 address assigned at registration (empty on load failure)
    pub fn assigned_ipv4(&self, profile_path: &str) -> String {
        Profile::load(Path::new(profile_path))
            .map(|p| p.ipv4)
            .unwrap_or_default()
    }

    /// Tunnel IPv6 address assigned at registration (empty on load failure)
    pub fn assigned_ipv6(&self, profile_path: &str) -> String {
        Profile::load(Path::new(profile_path))
            .map(|p| p.ipv6)
            .unwrap_or_default()
    }

    /// The profile's default IPv4 endpoint as `addr:443` (empty on failure)
    pub fn default_endpoint(&self, profile_path: &str) -> String {
        Profile::load(Path::new(profile_path))
            .ok()
            .and_then(|p| endpoint::default_endpoint(&p))
            .map(|e| e.to_string())
            .unwrap_or_default()
    }

    /// Start the tunnel; the transport reads inbound packets from `handle`.
    ///
    /// `mtu` of 0 selects the configured default. Returns an empty string
    /// on success.
    pub fn start_tunnel(
        &self,
        profile_path: &str,
        handle: TunHandle,
        mtu: i32,
        sink: Option<Arc<dyn PacketSink>>,
        observer: Option<Arc<dyn TunnelObserver>>,
    ) -> String {
        self.start_with(profile_path, handle, mtu, sink, observer, InboundMode::Device)
    }

    /// Start the tunnel; the host feeds inbound packets via [`input_packet`](Self::input_packet).
    pub fn start_tunnel_queued(
        &self,
        profile_path: &str,
        handle: TunHandle,
        mtu: i32,
        sink: Option<Arc<dyn PacketSink>>,
        observer: Option<Arc<dyn TunnelObserver>>,
    ) -> String {
        self.start_with(profile_path, handle, mtu, sink, observer, InboundMode::Queue)
    }

    /// Start with the default MTU, reading and writing the descriptor directly
    pub fn start_tunnel_with_fd(
        &self,
        profile_path: &str,
        handle: TunHandle,
        observer: Option<Arc<dyn TunnelObserver>>,
    ) -> String {
        self.start_tunnel(profile_path, handle, 0, None, observer)
    }

    fn start_with(
        &self,
        profile_path: &str,
        handle: TunHandle,
        mtu: i32,
        sink: Option<Arc<dyn PacketSink>>,
        observer: Option<Arc<dyn TunnelObserver>>,
        inbound: InboundMode,
    ) -> String {
        let Ok(mtu) = usize::try_from(mtu) else {
            return failure(format!("Invalid MTU {}", mtu));
        };

        let mut request = TunnelRequest::new(profile_path, handle, mtu).with_inbound(inbound);
        request.sink = sink;
        request.observer = observer;

        match self.manager.start(request) {
            Ok(()) => String::new(),
            Err(e) => e.to_string(),
        }
    }

    /// Hand one host-read packet to the tunnel; dropped if the queue is full
    pub fn input_packet(&self, packet: &[u8]) {
        self.manager.input_packet(packet);
    }

    /// Initiate teardown; no-op when idle
    pub fn stop_tunnel(&self) {
        self.manager.stop();
    }

    pub fn is_running(&self) -> bool {
        self.manager.is_running()
    }

    pub fn version(&self) -> String {
        VERSION.to_string()
    }

    /// Current SNI (empty = transport default)
    pub fn sni(&self) -> String {
        self.manager.options().get().sni
    }

    pub fn set_sni(&self, sni: &str) {
        self.manager.options().set_sni(sni);
    }

    /// IPv4 endpoint override (empty = profile default)
    pub fn endpoint_v4(&self) -> String {
        self.manager.options().get().endpoint_v4
    }

    pub fn set_endpoint_v4(&self, endpoint: &str) {
        self.manager.options().set_endpoint(AddressFamily::V4, endpoint);
    }

    /// IPv6 endpoint override (empty = profile default)
    pub fn endpoint_v6(&self) -> String {
        self.manager.options().get().endpoint_v6
    }

    pub fn set_endpoint_v6(&self, endpoint: &str) {
        self.manager.options().set_endpoint(AddressFamily::V6, endpoint);
    }

    pub fn prefer_ipv6(&self) -> bool {
        self.manager.options().get().prefer_ipv6
    }

    pub fn set_prefer_ipv6(&self, prefer: bool) {
        self.manager.options().set_prefer_ipv6(prefer);
    }

    pub fn reset_connection_options(&self) {
        self.manager.options().reset_to_defaults();
    }
}

fn failure(message: String) -> String {
    error!("{}", message);
    message
}
