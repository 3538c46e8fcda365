//! Routed HTTP requests.
//!
//! hyper owns the wire format. This module reduces a hyper request to what
//! the session task needs: the session URI, the body text and whether the
//! connection ends after the reply.

// ============================================================================
// Imports
// ============================================================================

use std::error::Error as StdError;
use std::fmt;

use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::Version;
use hyper::body::Body;
use hyper::header::{CONNECTION, CONTENT_TYPE, HeaderMap};

use crate::error::{Error, Result};

use super::uri::SessionUri;

// ============================================================================
// Constants
// ============================================================================

/// Largest request body accepted, in bytes.
pub const MAX_REQUEST_LENGTH: usize = 1 << 20;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

// ============================================================================
// HttpRequest
// ============================================================================

/// A session request, as posted to the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// What the request asks for.
    pub route: SessionUri,
    /// Request body; URL-decoded when sent as a form.
    pub body: String,
    /// `true` if the connection must be closed after the reply.
    pub non_persistent: bool,
}

impl HttpRequest {
    /// Creates a persistent request with an empty body.
    #[inline]
    #[must_use]
    pub fn new(route: SessionUri) -> Self {
        Self {
            route,
            body: String::new(),
            non_persistent: false,
        }
    }

    /// Sets the body.
    #[inline]
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.route)
    }
}

// ============================================================================
// Request Inspection
// ============================================================================

/// Returns `true` if the connection must close after this request.
///
/// That is the case for `Connection: close`, and for HTTP/1.0 unless the
/// client asked for keep-alive.
#[must_use]
pub fn is_non_persistent(version: Version, headers: &HeaderMap) -> bool {
    let tokens: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect();

    tokens.iter().any(|t| t == "close")
        || (version == Version::HTTP_10 && !tokens.iter().any(|t| t == "keep-alive"))
}

/// Returns `true` if the body is form-encoded.
#[must_use]
pub fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().starts_with(FORM_CONTENT_TYPE))
}

/// Reads a whole request body, at most [`MAX_REQUEST_LENGTH`] bytes.
///
/// Form bodies are URL-decoded.
///
/// # Errors
///
/// - [`Error::MessageTooLarge`] if the body exceeds the limit
/// - [`Error::MalformedRequest`] if the body cannot be read
pub async fn read_body<B>(headers: &HeaderMap, body: B) -> Result<String>
where
    B: Body,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let collected = Limited::new(body, MAX_REQUEST_LENGTH)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                Error::MessageTooLarge {
                    limit: MAX_REQUEST_LENGTH,
                }
            } else {
                Error::malformed(format!("unreadable body: {e}"))
            }
        })?;

    let body = String::from_utf8_lossy(&collected.to_bytes()).into_owned();
    Ok(if is_form(headers) {
        form_decode(&body)
    } else {
        body
    })
}

/// Decodes a form-encoded string, `+` included.
pub(crate) fn form_decode(text: &str) -> String {
    let spaced = text.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

// ============================================================================
// Tests
// ============================================================================
