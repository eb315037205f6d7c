//! Error types for the relay.
//!
//! Only structural failures are represented here. Per-packet problems
//! (bad secret, unmapped port, malformed header) are drops, not errors.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error type used for error chaining across module boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Relay errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RelayError {
    /// Virtual interface creation or I/O failed.
    #[error("Interface error: {0}")]
    Interface(#[source] ErrorContext),

    /// Transport could not be started or was lost.
    #[error("Transport error: {0}")]
    Transport(#[source] ErrorContext),

    /// Network I/O error.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// IP address assignment error.
    #[error("IP assignment error: {0}")]
    IpAssignment(String),

    /// Packet processing is not running (or the interface has failed).
    #[error("Processing stopped: {0}")]
    ProcessingStopped(String),
}

impl RelayError {
    /// Create an interface error with preserved source.
    pub fn interface_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Interface(ErrorContext::with_source(message, source))
    }

    /// Create a transport error with context only.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(ErrorContext::new(message))
    }

    /// Create a configuration error with context only.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ErrorContext::new(message))
    }

    /// Create a configuration error with preserved source.
    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Config(ErrorContext::with_source(message, source))
    }

    /// Returns true if this error can be recovered by restarting the transport.
    ///
    /// **Recoverable:** `Transport`, `Network`.
    ///
    /// **Fatal to the relay loop:** `Interface` (the tun device is gone),
    /// `Config`, `IpAssignment`, `ProcessingStopped`.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RelayError::Transport(_) | RelayError::Network(_))
    }
}

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
