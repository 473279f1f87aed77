//! Discovery error taxonomy.

use thiserror::Error;

/// Result alias for discovery operations.
pub type DiscoveryResult<T> = std::result::Result<T, DiscoveryError>;

/// Errors produced by the discovery subsystem.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The submitted scan configuration is unusable.
    #[error("invalid scan config: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },

    /// No job with the given id.
    #[error("unknown scan job: {id}")]
    UnknownJob {
        /// The id that missed.
        id: String,
    },

    /// The job is already in a terminal state.
    #[error("scan job {id} is already {status}")]
    JobFinished {
        /// Job id.
        id: String,
        /// Terminal status it reached.
        status: String,
    },

    /// A probe target could not be characterized.
    #[error("probe failed: {message}")]
    Probe {
        /// Failure detail.
        message: String,
    },

    /// HTTP plumbing failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DiscoveryError {
    /// Invalid-config constructor.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Probe-failure constructor.
    pub fn probe(message: impl Into<String>) -> Self {
        Self::Probe {
            message: message.into(),
        }
    }
}
