//! Error types for log ingestion

use std::io;
use std::time::Duration;

use thiserror::Error;

use logtide_hub::HubError;

/// Errors that can occur while querying or following a log source
#[derive(Error, Debug)]
pub enum LogError {
    /// The source process could not be started or exited with an error
    #[error("log source unavailable: `{command}`: {detail}")]
    SourceUnavailable { command: String, detail: String },

    /// The follow pipe failed mid-stream
    #[error("log stream interrupted: {0}")]
    StreamInterrupted(#[source] io::Error),

    /// The source process did not finish in time
    #[error("log source timed out after {}s", .after.as_secs_f32())]
    Timeout { after: Duration },

    /// The caller cancelled a bounded request
    #[error("log request cancelled")]
    Cancelled,

    /// Unit name rejected before reaching the source
    #[error("invalid unit name: {0:?}")]
    InvalidUnit(String),

    /// Search text could not be compiled
    #[error("invalid search pattern: {0}")]
    Filter(#[from] regex::Error),

    /// Delivery hub for a live tail is gone
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl LogError {
    pub(crate) fn unavailable(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            command: command.into(),
            detail: detail.into(),
        }
    }
}

/// Result type for log operations
pub type Result<T> = std::result::Result<T, LogError>;
