//! Message payloads carried over a session.
//!
//! Outbound traffic is an explicit [`Payload`] variant chosen at the call
//! site; inbound bodies are unpacked into [`serde_json::Value`]s according to
//! the listener's [`MessageFormat`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::Serialize;
use serde_json::{Deserializer, Value};
use tracing::warn;

use crate::error::Result;

// ============================================================================
// Payload
// ============================================================================

/// A server-to-client message.
///
/// | Variant | RTCP rendering | HTTP rendering |
/// |---------|----------------|----------------|
/// | `Text` | verbatim | JSON string literal |
/// | `Encoded` | verbatim | verbatim |
///
/// RTCP ends a message at the first empty line, so whitespace-only lines
/// are left out of the RTCP rendering. Text that must keep them should be
/// sent as an encoded JSON string instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Plain text.
    Text(String),
    /// Already-encoded JSON.
    Encoded(String),
}

impl Payload {
    /// Creates a text payload.
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Encodes any serializable value as a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::Encoded(serde_json::to_string(value)?))
    }

    /// Returns the payload text as stored.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(text) | Self::Encoded(text) => text,
        }
    }

    /// Size in bytes, as counted against a retransmission backlog.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_str().len()
    }

    /// Returns `true` if the payload is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }

    /// Renders the payload as a JSON value fragment.
    #[must_use]
    pub fn to_json_fragment(&self) -> String {
        match self {
            Self::Text(text) => Value::String(text.clone()).to_string(),
            Self::Encoded(json) => json.clone(),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Encoded(value.to_string())
    }
}

// ============================================================================
// MessageFormat
// ============================================================================

/// How inbound message bodies are split into individual messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageFormat {
    /// Body holds one or more concatenated JSON values.
    #[default]
    Json,
    /// Body is a single text message.
    Text,
}

impl MessageFormat {
    /// Unpacks a message body.
    ///
    /// With [`MessageFormat::Json`] a syntax error ends unpacking: values
    /// parsed before it are kept, the rest of the body is dropped.
    #[must_use]
    pub fn unpack(self, body: &str) -> Vec<Value> {
        match self {
            Self::Text => vec![Value::String(body.to_owned())],
            Self::Json => {
                let mut messages = Vec::new();
                for value in Deserializer::from_str(body).into_iter::<Value>() {
                    match value {
                        Ok(value) => messages.push(value),
                        Err(e) => {
                            warn!(error = %e, "Syntax error in JSON message");
                            break;
                        }
                    }
                }
                messages
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
