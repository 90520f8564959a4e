//! Error types for realmbus.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use realmbus::{Client, Result};
//!
//! async fn example(client: &Client) -> Result<()> {
//!     let info = client.call("user/info", serde_json::Value::Null).await?;
//!     println!("{info}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Remote | [`Error::Remote`], [`Error::EmptyResponse`] |
//! | Handler | [`Error::Handler`] |
//! | Transport | [`Error::Transport`], [`Error::ConnectionClosed`], [`Error::Disconnected`], [`Error::RequestTimeout`], [`Error::ConnectionTimeout`], [`Error::TooManyPending`] |
//! | Routing | [`Error::Sealed`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::MessageId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Remote Errors
    // ========================================================================
    /// The remote handler answered with a non-zero response code.
    ///
    /// Displays exactly the remote `message`, so a handler failing with
    /// `"boom"` surfaces as `"boom"` on the calling side.
    #[error("{message}")]
    Remote {
        /// Response code (never 0).
        code: i64,
        /// Human-readable message from the response envelope.
        message: String,
    },

    /// The remote answered successfully but with a falsy payload.
    ///
    /// Returned by [`Client::call_throw`](crate::Client::call_throw).
    #[error("Empty response for {action}")]
    EmptyResponse {
        /// The action that returned nothing.
        action: String,
    },

    // ========================================================================
    // Handler Errors
    // ========================================================================
    /// Error raised inside an action handler or middleware.
    ///
    /// Converted into `{code: -1, message}` at the server boundary.
    #[error("{message}")]
    Handler {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Native transport failure (remote end missing, port closed).
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the native failure.
        message: String,
    },

    /// The transport shut down while a request was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The virtual connection was already disconnected.
    #[error("Connection {message_id} is disconnected")]
    Disconnected {
        /// The connection's correlation id.
        message_id: MessageId,
    },

    /// No response arrived within the configured timeout.
    #[error("Request {action} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The action that timed out.
        action: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// No peer connected to a listener in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The realm's pending-request cap was reached.
    #[error("Too many pending requests: {pending}/{max}")]
    TooManyPending {
        /// Requests currently awaiting a response.
        pending: usize,
        /// Configured maximum.
        max: usize,
    },

    // ========================================================================
    // Routing Errors
    // ========================================================================
    /// A handler was registered after the server started.
    #[error("Server already started, cannot register {action}")]
    Sealed {
        /// The rejected action.
        action: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<WsError>),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a remote error from a response envelope.
    #[inline]
    pub fn remote(code: i64, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    /// Creates an empty response error.
    #[inline]
    pub fn empty_response(action: impl Into<String>) -> Self {
        Self::EmptyResponse {
            action: action.into(),
        }
    }

    /// Creates a handler error.
    #[inline]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a disconnected error.
    #[inline]
    pub fn disconnected(message_id: MessageId) -> Self {
        Self::Disconnected { message_id }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(action: impl Into<String>, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            action: action.into(),
            timeout_ms,
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a sealed registry error.
    #[inline]
    pub fn sealed(action: impl Into<String>) -> Self {
        Self::Sealed {
            action: action.into(),
        }
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

// ============================================================================
// Error Accessors
// ============================================================================

impl Error {
    /// Returns the text carried in the `message` field of an error response.
    ///
    /// Handler and remote errors yield their raw message; everything else
    /// falls back to the `Display` rendering.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Remote { message, .. } | Self::Handler { message } => message.clone(),
            other => other.to_string(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. } | Self::ConnectionTimeout { .. }
        )
    }

    /// Returns `true` if the error was reported by the remote realm.
    #[inline]
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. } | Self::EmptyResponse { .. })
    }

    /// Returns `true` if this is a transport or connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::ConnectionClosed
                | Self::Disconnected { .. }
                | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
