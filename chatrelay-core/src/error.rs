use thiserror::Error;

use crate::models::call::{
    CallStatus, StatusKind, MSG_CALL_NOT_FOUND, MSG_INVALID_REQUEST, MSG_NOT_REGISTERED,
    MSG_ROOM_IN_USE, MSG_USER_OFFLINE,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: CallStatus, event: &'static str },

    #[error("Recipient offline: {0}")]
    Offline(String),

    #[error("Connection has not registered a user")]
    NotRegistered,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Text for the `callStatusChange{type: error}` sent back to the client.
    ///
    /// Always one of the localized constants; the detail stays in `Display`
    /// for logs.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Offline(_) => MSG_USER_OFFLINE.to_string(),
            Self::NotFound(_) | Self::InvalidTransition { .. } => MSG_CALL_NOT_FOUND.to_string(),
            Self::AlreadyExists(_) => MSG_ROOM_IN_USE.to_string(),
            Self::NotRegistered => MSG_NOT_REGISTERED.to_string(),
            Self::InvalidInput(_) => MSG_INVALID_REQUEST.to_string(),
            Self::Serialization(_) | Self::Internal(_) => {
                StatusKind::Error.default_message().to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
