// Module: http
// WebSocket relay endpoint plus read-only status routes

pub mod error;
pub mod status;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use chatrelay_core::{service::Relay, Config};

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub config: Arc<Config>,
}

impl AppState {
    #[must_use]
    pub fn new(relay: Relay, config: Config) -> Self {
        Self {
            relay,
            config: Arc::new(config),
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .merge(status::create_status_router());

    // Apply layers before state
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    router.with_state(state)
}
