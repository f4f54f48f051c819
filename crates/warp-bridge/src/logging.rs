//! Logging bootstrap

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<bool> = OnceLock::new();

/// Install the global fmt subscriber.
///
/// `RUST_LOG` overrides `default_filter` (e.g. `"warp_bridge=debug"`). Only
/// the first call does anything; returns whether a subscriber from this
/// crate is installed.
pub fn init(default_filter: &str) -> bool {
    *INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        tracing_subscriber::fmt()
            .compact()
            .with_target(false)
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    })
}
