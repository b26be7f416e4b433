//! Service initialization

use tokio::task::JoinHandle;
use tracing::info;

use crate::{service::Relay, Config};

/// Services owned by the composition root
pub struct RelayServices {
    /// Event dispatcher shared by every connection
    pub relay: Relay,
    /// Periodic stale-session sweep; abort on shutdown
    pub sweeper: JoinHandle<()>,
}

/// Build the relay and start its background tasks.
///
/// Must be called from within a Tokio runtime.
#[must_use]
pub fn init_services(config: &Config) -> RelayServices {
    info!("Initializing relay services...");

    let relay = Relay::new(config.relay.clone());
    let sweeper = relay.calls().start_sweeper();

    info!(
        call_timeout_seconds = config.relay.call_timeout_seconds,
        sweep_interval_seconds = config.relay.sweep_interval_seconds,
        "Relay services initialized"
    );

    RelayServices { relay, sweeper }
}
