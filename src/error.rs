//! Error types for rlm-engine.

use thiserror::Error;

/// Result type alias using rlm-engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The session manager is at its live-session capacity
    #[error("Session capacity exhausted (max {max_sessions})")]
    CapacityExhausted { max_sessions: usize },

    /// The referenced session does not exist (or was already destroyed)
    #[error("No such session: {session_id}")]
    NoSuchSession { session_id: String },

    /// A non-blocking execute found the session occupied
    #[error("Session is busy: {session_id}")]
    SessionBusy { session_id: String },

    /// The transport to the execution plane failed
    #[error("Execution transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Sandbox subprocess communication error
    #[error("Sandbox communication error: {0}")]
    Sandbox(String),

    /// Submitted code exceeds the sandbox source-length cap
    #[error("Code length {len} exceeds cap of {max} bytes")]
    CodeTooLarge { len: usize, max: usize },

    /// Model provider asked us to back off
    #[error("Model rate limited: {0}")]
    RateLimited(String),

    /// Transient network failure talking to the model provider
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The model provider rejected the request as malformed
    #[error("Invalid model request: {0}")]
    InvalidRequest(String),

    /// Credentials were rejected; fatal to the process
    #[error("Model authentication failed: {0}")]
    Authentication(String),

    /// Retries exhausted against the model provider
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// A sub-reasoner invocation failed
    #[error("Sub-reasoner failed: {0}")]
    SubFailed(String),

    /// The task was cancelled cooperatively
    #[error("Task cancelled")]
    Cancelled,

    /// The end-to-end task deadline elapsed
    #[error("Task timed out after {duration_ms}ms")]
    TaskTimeout { duration_ms: u64 },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transport-unavailable error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportUnavailable(message.into())
    }

    /// Create a sandbox communication error.
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox(message.into())
    }

    /// Create a no-such-session error.
    pub fn no_such_session(session_id: impl Into<String>) -> Self {
        Self::NoSuchSession {
            session_id: session_id.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether a model call that failed with this error may be retried
    /// with backoff.
    pub fn is_retryable_model_error(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::TransientNetwork(_))
    }

    /// Whether this error is fatal to the whole process rather than to a
    /// single invocation.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}
