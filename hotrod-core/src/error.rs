//! Error types for Hot Rod operations.

use std::io;
use thiserror::Error;

/// The main error type for Hot Rod operations.
#[derive(Debug, Error)]
pub enum HotRodError {
    /// Connection-related errors (connect refused, reset, broken pipe).
    #[error("connection error: {0}")]
    Connection(String),

    /// The byte stream can no longer be trusted (bad magic, runaway VInt).
    ///
    /// The connection that produced it must be closed and never reused.
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// A well-formed frame that this client cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error status.
    #[error("server error (status {status:#04x}): {message}")]
    Server {
        /// Raw status byte.
        status: u8,
        /// Message sent by the server.
        message: String,
    },

    /// The server is rebalancing or suspects the node that owns the key.
    #[error("stale topology (status {status:#04x}): {message}")]
    TopologyStale {
        /// Raw status byte.
        status: u8,
        /// Message sent by the server.
        message: String,
    },

    /// The call deadline expired.
    #[error("timeout error: {0}")]
    Timeout(String),

    /// Every allowed attempt failed with a recoverable error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made, including the first one.
        attempts: u32,
        /// The error from the final attempt.
        last: Box<HotRodError>,
    },

    /// Configuration errors (invalid settings).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The client or one of its components has been shut down.
    #[error("client closed: {0}")]
    Closed(String),

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HotRodError {
    /// Whether the dispatcher may retry the call on another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HotRodError::Connection(_)
                | HotRodError::Io(_)
                | HotRodError::ProtocolDesync(_)
                | HotRodError::TopologyStale { .. }
        )
    }

    /// Whether the connection that produced this error must be closed.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            HotRodError::Connection(_) | HotRodError::Io(_) | HotRodError::ProtocolDesync(_)
        )
    }

    /// Returns the most specific cause, unwrapping `RetriesExhausted`.
    pub fn root_cause(&self) -> &HotRodError {
        match self {
            HotRodError::RetriesExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }

    /// Produces an owned copy suitable for fanning out to several waiters.
    ///
    /// `io::Error` is not `Clone`, so I/O failures are flattened into
    /// `Connection` while every other variant keeps its kind.
    pub fn duplicate(&self) -> HotRodError {
        match self {
            HotRodError::Connection(m) => HotRodError::Connection(m.clone()),
            HotRodError::ProtocolDesync(m) => HotRodError::ProtocolDesync(m.clone()),
            HotRodError::Protocol(m) => HotRodError::Protocol(m.clone()),
            HotRodError::Server { status, message } => HotRodError::Server {
                status: *status,
                message: message.clone(),
            },
            HotRodError::TopologyStale { status, message } => HotRodError::TopologyStale {
                status: *status,
                message: message.clone(),
            },
            HotRodError::Timeout(m) => HotRodError::Timeout(m.clone()),
            HotRodError::RetriesExhausted { attempts, last } => HotRodError::RetriesExhausted {
                attempts: *attempts,
                last: Box::new(last.duplicate()),
            },
            HotRodError::Configuration(m) => HotRodError::Configuration(m.clone()),
            HotRodError::Closed(m) => HotRodError::Closed(m.clone()),
            HotRodError::Io(e) => HotRodError::Connection(e.to_string()),
        }
    }
}

/// A specialized `Result` type for Hot Rod operations.
pub type Result<T> = std::result::Result<T, HotRodError>;
