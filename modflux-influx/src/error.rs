//! Sink error classification.

use thiserror::Error;

/// Errors returned by a sink write.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink refused the batch; retrying the same request will not help.
    #[error("Sink rejected write (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// The sink could not be reached or is temporarily overloaded.
    #[error("Sink unavailable: {reason}")]
    Unavailable { status: Option<u16>, reason: String },

    /// The sink client could not be built from its configuration.
    #[error("Invalid sink configuration: {0}")]
    Config(String),
}

impl SinkError {
    /// Whether the writer should retry the batch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable { .. })
    }

    /// HTTP status associated with the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SinkError::Rejected { status, .. } => Some(*status),
            SinkError::Unavailable { status, .. } => *status,
            SinkError::Config(_) => None,
        }
    }
}
