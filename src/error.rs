//! Error types for the parley turn engine.
//!
//! Each variant carries a stable error code (SCREAMING_SNAKE_CASE) that is
//! included in the Display output and accessible via [`ParleyError::code()`].

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// A recognition, generation or synthesis call failed transiently.
    pub const TRANSIENT_CAPABILITY: &str = "TRANSIENT_CAPABILITY";

    /// Unknown agent or tool reference, or an invalid registry.
    pub const CONFIGURATION: &str = "CONFIGURATION";

    /// The operation was cancelled (barge-in or shutdown).
    pub const CANCELLED: &str = "CANCELLED";

    /// A bounded queue was at capacity and an item was dropped.
    pub const OVERFLOW: &str = "OVERFLOW";

    /// The durable session store could not be read or written.
    pub const PERSISTENCE: &str = "PERSISTENCE";

    /// A channel between execution contexts closed unexpectedly.
    pub const CHANNEL: &str = "CHANNEL";

    /// An unrecoverable failure that ends the session.
    pub const FATAL: &str = "FATAL";

    /// Filesystem I/O failure.
    pub const IO: &str = "IO";

    /// Encoding or decoding of persisted data failed.
    pub const SERIALIZATION: &str = "SERIALIZATION";
}

/// Errors produced by the turn engine.
///
/// The Display impl formats as `[CODE] message`.
#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    /// Recognition/generation/synthesis hiccup. Retried within the turn.
    #[error("[{}] {}", error_codes::TRANSIENT_CAPABILITY, .0)]
    TransientCapability(String),

    /// Unknown agent/tool reference. The turn fails, the current agent stays.
    #[error("[{}] {}", error_codes::CONFIGURATION, .0)]
    Configuration(String),

    /// Expected outcome of barge-in. Never logged as a failure.
    #[error("[{}] {}", error_codes::CANCELLED, .0)]
    Cancelled(String),

    /// Queue at capacity; the item was dropped per policy.
    #[error("[{}] {}", error_codes::OVERFLOW, .0)]
    Overflow(String),

    /// Durable store unreachable. Retried later.
    #[error("[{}] {}", error_codes::PERSISTENCE, .0)]
    Persistence(String),

    /// Channel send/receive error.
    #[error("[{}] {}", error_codes::CHANNEL, .0)]
    Channel(String),

    /// Session-ending failure (e.g. recognition exhausted its re-init budget).
    #[error("[{}] {}", error_codes::FATAL, .0)]
    Fatal(String),

    /// I/O error.
    #[error("[{}] {}", error_codes::IO, .0)]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("[{}] {}", error_codes::SERIALIZATION, .0)]
    Serialization(String),
}

impl ParleyError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientCapability(_) => error_codes::TRANSIENT_CAPABILITY,
            Self::Configuration(_) => error_codes::CONFIGURATION,
            Self::Cancelled(_) => error_codes::CANCELLED,
            Self::Overflow(_) => error_codes::OVERFLOW,
            Self::Persistence(_) => error_codes::PERSISTENCE,
            Self::Channel(_) => error_codes::CHANNEL,
            Self::Fatal(_) => error_codes::FATAL,
            Self::Io(_) => error_codes::IO,
            Self::Serialization(_) => error_codes::SERIALIZATION,
        }
    }

    /// Returns true if this error represents a transient failure that can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientCapability(_))
    }

    /// Returns true if this error is the expected result of a cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ParleyError>;
