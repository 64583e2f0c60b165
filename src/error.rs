//! Error types for the control loop and its collaborators.

use thiserror::Error;

/// Failures while waiting for or capturing the page surface.
#[derive(Debug, Error)]
pub enum PerceptionError {
    #[error("no page surface is attached")]
    SurfaceUnavailable,

    #[error("page surface is not laid out (size {width}x{height})")]
    NotLaidOut { width: f64, height: f64 },

    #[error("page is still loading: {url}")]
    StillLoading { url: String },

    #[error("page is not ready (state '{ready_state}'): {url}")]
    NotReady { url: String, ready_state: String },

    #[error("failed to capture page image: {0}")]
    Capture(String),

    #[error("failed to encode page image: {0}")]
    Encode(String),
}

/// Errors raised inside one iteration of the run loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no API key configured (credential '{key}')")]
    MissingCredential { key: String },

    #[error(transparent)]
    Perception(#[from] PerceptionError),

    #[error("decision engine is rate limited or unavailable (HTTP {status} after {attempts} attempts)")]
    RateLimited { status: u16, attempts: u32 },

    #[error("decision engine rejected the request (HTTP {status}): {message}")]
    Status { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed decision engine reply: {0}")]
    MalformedReply(String),

    #[error("cancelled")]
    Cancelled,
}

/// How the run loop reacts to an [`AgentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// End the run and return to idle.
    Abort,
    /// Suspend the run; the caller decides when to continue.
    Pause,
    /// Log and move on to the next iteration.
    Skip,
    /// Stop quietly, no error is reported.
    Cancelled,
}

impl AgentError {
    pub fn disposition(&self) -> Disposition {
        match self {
            AgentError::MissingCredential { .. }
            | AgentError::Perception(_)
            | AgentError::Status { .. } => Disposition::Abort,
            AgentError::RateLimited { .. } => Disposition::Pause,
            AgentError::Network(_) | AgentError::MalformedReply(_) => Disposition::Skip,
            AgentError::Cancelled => Disposition::Cancelled,
        }
    }

    /// HTTP statuses worth another attempt.
    pub fn is_retryable_status(status: u16) -> bool {
        status == 429 || (500..=599).contains(&status)
    }
}
