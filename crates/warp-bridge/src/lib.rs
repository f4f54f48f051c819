//! warp-bridge - MASQUE Tunnel Bridge for Android
//!
//! Embeddable control layer between an Android VpnService host and a
//! userspace MASQUE transport. The host owns the TUN descriptor; this crate
//! owns the tunnel's lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Android Host                          │
//! │  VpnService ── TUN fd ──┐        ▲ on_connected / ...     │
//! └─────────────────────────│────────│───────────────────────┘
//!                           ▼        │
//! ┌──────────────────────────────────────────────────────────┐
//! │  TunnelBridge (strings in, strings out)                   │
//! │        │                                                  │
//! │        ▼                                                  │
//! │  TunnelManager ──▶ OptionsStore ──▶ Endpoint resolver     │
//! │        │                                                  │
//! │        ▼ spawn_blocking                                   │
//! │  Transport::maintain ◀──▶ TunDevice (fd / sink / queue)   │
//! └────────│─────────────────────────────────────────────────┘
//!          ▼ QUIC / HTTP3
//!   ┌───────────────────┐
//!   │ MASQUE Concentrator│
//!   └───────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - At most one run at a time; a second start is rejected
//! - Every run ends in exactly one `on_disconnected`
//! - `on_connected` never follows `on_disconnected` for the same run
//! - A failed start leaves the TUN descriptor with the caller

#[cfg(not(unix))]
compile_error!("warp-bridge only supports unix targets");

mod bridge;
mod device;
mod endpoint;
pub mod logging;
mod manager;
mod options;
mod profile;
mod settings;
mod transport;

pub use bridge::{TunnelBridge, VERSION};
pub use device::{PacketQueue, PacketSink, TunDevice, TunHandle};
pub use endpoint::{DEFAULT_PORT, Endpoint, EndpointError, default_endpoint, resolve};
pub use manager::{
    InboundMode, TunnelError, TunnelManager, TunnelObserver, TunnelPhase, TunnelRequest,
};
pub use options::{AddressFamily, ConnectionOptions, DEFAULT_SNI, OptionsStore};
pub use profile::{Credentials, Profile, ProfileError};
pub use settings::{BridgeSettings, MAX_MTU, MIN_MTU, SettingsError, validate_mtu};
pub use transport::{Registrar, SessionConfig, Transport, TunnelLink, TunnelParams};
pub use tokio_util::sync::CancellationToken;
