//! Tracing setup for binaries and tests embedding a bridge.

use tracing_subscriber::EnvFilter;

use crate::config::BridgeConfig;

/// Installs a global fmt subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the bridge logs at `debug` when the
/// config's debug toggle is on and at `warn` when it is off. Returns false if
/// a global subscriber was already installed.
pub fn init(config: &BridgeConfig) -> bool {
    let fallback = if config.debug { "exobridge=debug" } else { "exobridge=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
