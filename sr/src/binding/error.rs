//! Binding handshake failures

use thiserror::Error;

/// Why a binding attempt failed
///
/// Every variant maps to a message shown to the person holding the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("Binding token not found")]
    TokenNotFound,

    #[error("Binding token expired")]
    TokenExpired,

    #[error("Binding token already used")]
    TokenAlreadyUsed,

    #[error("Destination already bound to a different user")]
    Conflict,

    #[error("Device or user already bound to destination {0}")]
    AlreadyBoundElsewhere(String),

    #[error("Destination not found: {0}")]
    DestinationNotFound(String),

    #[error("Could not read binding code: {0}")]
    Unreadable(String),

    #[error("Binding failed: {0}")]
    Failed(String),
}

impl BindingError {
    /// Text delivered downstream for this failure
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::TokenNotFound => "Invalid binding code. Refresh the page and scan the new code.",
            Self::TokenExpired => "This binding code has expired. Refresh the page and scan the new code.",
            Self::TokenAlreadyUsed => "This binding code was already used. Refresh the page and scan the new code.",
            Self::Conflict => "This destination is already bound to another user. Unbind it first and try again.",
            Self::AlreadyBoundElsewhere(_) => {
                "This device is already bound to another destination. Unbind it first and try again."
            }
            Self::DestinationNotFound(_) | Self::Failed(_) => "Binding failed. Please try again later.",
            Self::Unreadable(_) => "Could not read the binding code. Point the camera at the code and try again.",
        }
    }
}
