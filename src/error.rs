//! Error types for the synchronization pipeline.
//!
//! Every fault below the single connection attempt is fatal to the running
//! session: once a handshake step is missed, snapshot consistency can no
//! longer be guaranteed, so the pipeline tears down instead of degrading
//! silently. [`ClientError::is_retryable`] tells callers which failures are
//! worth a fresh connection attempt (with their own backoff policy) and which
//! indicate misuse or an incompatible host.

use thiserror::Error;

#[cfg(windows)]
use windows_core as win_core;

/// Result type alias for pipeline operations.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Boxed error type carried out of consumer callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for client and driver operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    #[error("failed to connect to game host: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Every discovery-table record was either empty or already claimed.
    #[error("no open game found: all host slots are empty or connected")]
    NoOpenGame,

    #[error("protocol version mismatch: host reported {found}, supported: {supported:?}")]
    Version { supported: &'static [i32], found: i32 },

    /// A fixed-capacity snapshot array is full. This is caller misuse, not a
    /// transient condition.
    #[error("snapshot {kind} array is full ({cap} entries max)")]
    Capacity { kind: &'static str, cap: usize },

    /// I/O failure on the handshake channel mid-session. Fatal; the session
    /// cannot recover once a round trip is lost.
    #[error("handshake channel failure during {op}")]
    Channel {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The consumer callback returned an error or panicked. Unwinds both the
    /// producer and consumer loops and surfaces from [`Driver::run`].
    ///
    /// [`Driver::run`]: crate::Driver::run
    #[error("consumer callback failed on frame {frame}")]
    Consumer {
        frame: i32,
        #[source]
        source: BoxError,
    },

    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Windows API error: {operation}")]
    #[cfg(windows)]
    Platform {
        operation: String,
        #[source]
        source: win_core::Error,
    },
}

impl ClientError {
    /// Whether a fresh connection attempt may succeed where this one failed.
    ///
    /// Retry itself is a caller concern; nothing inside the crate loops on a
    /// failed operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connection { .. } => true,
            ClientError::NoOpenGame => true,
            ClientError::Version { .. } => false,
            ClientError::Capacity { .. } => false,
            ClientError::Channel { .. } => false,
            ClientError::Consumer { .. } => false,
            ClientError::Configuration { .. } => false,
            #[cfg(windows)]
            ClientError::Platform { .. } => true,
        }
    }

    /// Helper constructor for connection failures.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        ClientError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection failures with an underlying cause.
    pub fn connection_failed_with_source(reason: impl Into<String>, source: BoxError) -> Self {
        ClientError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for handshake channel failures.
    pub fn channel(op: &'static str, source: std::io::Error) -> Self {
        ClientError::Channel { op, source }
    }

    /// Helper constructor for configuration errors.
    pub fn configuration(reason: impl Into<String>) -> Self {
        ClientError::Configuration { reason: reason.into() }
    }

    /// Helper constructor for Windows API errors.
    #[cfg(windows)]
    pub fn platform(operation: impl Into<String>, source: win_core::Error) -> Self {
        ClientError::Platform { operation: operation.into(), source }
    }
}
