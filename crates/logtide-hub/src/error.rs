//! Error types for the hub crate

use thiserror::Error;

/// Errors that can occur when talking to the hub
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The hub actor has stopped
    #[error("hub is closed")]
    Closed,
}

/// Result type for hub operations
pub type Result<T> = std::result::Result<T, HubError>;
