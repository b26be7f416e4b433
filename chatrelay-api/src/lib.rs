// chatrelay API library
//
// HTTP and WebSocket surface of the chatrelay signaling relay

pub mod http;

// Re-export commonly used types
pub use http::{create_router, AppState};
