//! Bootstrap module for initializing the relay
//!
//! This module handles:
//! - Configuration loading
//! - Relay construction and background task startup

pub mod config;
pub mod services;

pub use config::load_config;
pub use services::{init_services, RelayServices};
