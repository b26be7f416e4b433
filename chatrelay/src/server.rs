//! Server lifecycle management
//!
//! Starts the HTTP/WebSocket server, waits for a shutdown signal or an
//! unexpected stop, then drains open connections and stops background tasks.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use chatrelay_api::{create_router, AppState};
use chatrelay_core::{bootstrap::RelayServices, Config};

/// Relay server - owns the services for its whole lifetime
pub struct RelayServer {
    config: Config,
    services: RelayServices,
}

impl RelayServer {
    pub const fn new(config: Config, services: RelayServices) -> Self {
        Self { config, services }
    }

    /// Start the server and wait for shutdown
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting chatrelay server...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let http_handle = self.start_http_server(shutdown_rx).await?;

        info!("Server started successfully");

        tokio::select! {
            _ = http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);
        self.shutdown().await;

        Ok(())
    }

    async fn shutdown(self) {
        info!("Shutting down chatrelay server...");

        // 1. Ask open WebSocket connections to close and wait for them to go
        let drain_timeout = Duration::from_secs(10);
        let drain_poll_interval = Duration::from_millis(250);
        let presence = self.services.relay.presence();
        let active = presence.close_all();
        if active > 0 {
            info!(
                "Waiting up to {}s for {} active connection(s) to drain...",
                drain_timeout.as_secs(),
                active
            );
            let deadline = tokio::time::Instant::now() + drain_timeout;
            loop {
                let remaining = presence.connection_count();
                if remaining == 0 {
                    info!("All connections drained");
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(
                        "Drain timeout reached with {} connection(s) still active, proceeding with shutdown",
                        remaining
                    );
                    break;
                }
                tokio::time::sleep(drain_poll_interval).await;
            }
        }

        // 2. Stop the stale session sweep
        self.services.sweeper.abort();

        let sessions = self.services.relay.calls().session_count();
        if sessions > 0 {
            info!("Dropping {} in-flight call session(s)", sessions);
        }

        info!("chatrelay server shut down complete");
    }

    /// Bind and serve the HTTP router on its own task
    async fn start_http_server(&self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_addr: std::net::SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;

        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;

        info!("HTTP server listening on {}", http_addr);

        let state = AppState::new(self.services.relay.clone(), self.config.clone());
        let http_router = create_router(state);

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, http_router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
