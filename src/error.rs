//! Error types for the session layer.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use resumable_session::{Result, Payload};
//!
//! fn greet(session: &SessionHandle) -> Result<()> {
//!     session.send(Payload::text("hello"))?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Protocol | [`Error::Sequence`], [`Error::MalformedRequest`], [`Error::MessageTooLarge`] |
//! | Session | [`Error::SessionNotFound`], [`Error::SessionInProgress`], [`Error::NoSession`], [`Error::SessionClosed`] |
//! | Resource | [`Error::BacklogOverflow`] |
//! | Connection | [`Error::ConnectionClosed`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::Url`] |
//!
//! None of these cross the protocol boundary: each binding translates them
//! into a wire-level error reply or a silent session teardown.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::SessionId;

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
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when a property value is missing, unparsable or out of range.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Client-supplied sequence number does not match the expected one.
    ///
    /// Recoverable: answered with an error reply, no state is changed.
    #[error("Sequence error: expected {expected}, received {received}")]
    Sequence {
        /// Sequence number the session expected next.
        expected: u64,
        /// Sequence number the client actually sent.
        received: u64,
    },

    /// Request could not be framed or parsed.
    #[error("Malformed request: {message}")]
    MalformedRequest {
        /// Description of the framing problem.
        message: String,
    },

    /// Inbound message exceeds the framing limit.
    #[error("Input too large (limit {limit} bytes)")]
    MessageTooLarge {
        /// Maximum accepted size in bytes.
        limit: usize,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Request names a session id that is not registered.
    #[error("No such session: {session_id}")]
    SessionNotFound {
        /// The session id as presented by the client.
        session_id: String,
    },

    /// Session (or connection) is already bound and cannot be started or resumed.
    #[error("Session in progress")]
    SessionInProgress,

    /// Connection carries no session.
    #[error("No session on connection")]
    NoSession,

    /// Session has been closed.
    #[error("Session closed: {session_id}")]
    SessionClosed {
        /// The closed session.
        session_id: SessionId,
    },

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// Retransmission buffer exceeded its byte limit.
    ///
    /// Fatal to the offending session only.
    #[error("Backlog overflow: {backlog} bytes queued, limit {limit}")]
    BacklogOverflow {
        /// Bytes currently queued.
        backlog: usize,
        /// Configured limit.
        limit: usize,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// The session task or connection is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a sequence error.
    #[inline]
    pub fn sequence(expected: u64, received: u64) -> Self {
        Self::Sequence { expected, received }
    }

    /// Creates a malformed request error.
    #[inline]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: message.into(),
        }
    }

    /// Creates a session not found error.
    #[inline]
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Creates a session closed error.
    #[inline]
    pub fn session_closed(session_id: SessionId) -> Self {
        Self::SessionClosed { session_id }
    }

    /// Creates a backlog overflow error.
    #[inline]
    pub fn backlog_overflow(backlog: usize, limit: usize) -> Self {
        Self::BacklogOverflow { backlog, limit }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a sequence error.
    #[inline]
    #[must_use]
    pub fn is_sequence_error(&self) -> bool {
        matches!(self, Self::Sequence { .. })
    }

    /// Returns `true` if the error concerns session lookup or binding.
    #[inline]
    #[must_use]
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound { .. }
                | Self::SessionInProgress
                | Self::NoSession
                | Self::SessionClosed { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors are answered on the wire and leave the session
    /// untouched; the client may retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Sequence { .. }
                | Self::SessionNotFound { .. }
                | Self::SessionInProgress
                | Self::NoSession
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
