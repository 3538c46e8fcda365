//! HTTP reply bodies and responses.
//!
//! Bodies are small JSON objects:
//!
//! | Reply | Body |
//! |-------|------|
//! | connect | `{"sessionid":"<id>"}` |
//! | select | `{"seqnum":N,"msgs":[…]}` (`N` is `-1` for the close marker) |
//! | xmit | `{"seqnum":N}` |
//! | error | `{"error":"<tag>"}` |
//! | disconnect | `{"status":"disconnected"}` |
//! | bad URL | `{"error":"badURL","uri":"…"}` (status 404) |

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS, CACHE_CONTROL, CONTENT_TYPE,
    HeaderMap, HeaderValue, ORIGIN,
};
use hyper::{Response, StatusCode};
use serde_json::json;

use crate::identifiers::SessionId;
use crate::message::Payload;

use super::request::form_decode;

// ============================================================================
// Constants
// ============================================================================

/// Error tag: batch out of sequence.
pub const SEQUENCE_ERROR: &str = "sequenceError";

/// Error tag: unknown session id.
pub const SESSION_ID_ERROR: &str = "sessionIDError";

/// Sequence number carried by the close marker.
pub const CLOSE_SEQNUM: i64 = -1;

// ============================================================================
// Bodies
// ============================================================================

/// Reply to `connect`.
#[must_use]
pub fn connect_body(session: SessionId) -> String {
    json!({ "sessionid": session.to_string() }).to_string()
}

/// Reply to `select`: a batch of messages.
#[must_use]
pub fn select_body(seqnum: i64, messages: &[Payload]) -> String {
    let msgs: Vec<String> = messages.iter().map(Payload::to_json_fragment).collect();
    format!("{{\"seqnum\":{seqnum},\"msgs\":[{}]}}", msgs.join(","))
}

/// Reply to `xmit`.
#[must_use]
pub fn xmit_body(seqnum: u64) -> String {
    json!({ "seqnum": seqnum }).to_string()
}

/// Error reply.
#[must_use]
pub fn error_body(tag: &str) -> String {
    json!({ "error": tag }).to_string()
}

/// Reply to `disconnect`.
#[must_use]
pub fn disconnect_body() -> String {
    json!({ "status": "disconnected" }).to_string()
}

/// Reply to an unrecognized URI.
#[must_use]
pub fn bad_url_body(uri: &str) -> String {
    json!({ "error": "badURL", "uri": uri }).to_string()
}

// ============================================================================
// Responses
// ============================================================================

/// A complete response with a fixed-size body.
pub type HttpResponse = Response<Full<Bytes>>;

/// A `200 OK` response carrying `body`.
#[must_use]
pub fn ok_response(body: impl Into<Bytes>) -> HttpResponse {
    response(StatusCode::OK, body.into())
}

/// A `404 Not Found` response carrying `body`.
#[must_use]
pub fn not_found_response(body: impl Into<Bytes>) -> HttpResponse {
    response(StatusCode::NOT_FOUND, body.into())
}

fn response(status: StatusCode, body: Bytes) -> HttpResponse {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=UTF-8"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// CORS pre-flight reply, echoing the request's origin and headers.
#[must_use]
pub fn options_response(request: &HeaderMap) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    let headers = response.headers_mut();
    headers.insert(
        ACCESS_CONTROL_ALLOW_ORIGIN,
        request
            .get(ORIGIN)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("*")),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        request
            .get(ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("Content-Type")),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}

// ============================================================================
// Request Bodies
// ============================================================================

/// Strips the form field name some browsers wrap a posted body in.
///
/// A body `name=<value>` is percent-decoded when `<value>` starts with `%`,
/// and loses its `name=` prefix only if a `{` follows the `=`. Anything
/// else, bare JSON strings and arrays included, passes through untouched.
#[must_use]
pub fn extract_post_body(body: &str) -> Cow<'_, str> {
    let Some(eq) = body.find('=') else {
        return Cow::Borrowed(body);
    };
    if body[eq + 1..].starts_with('%') {
        let decoded = form_decode(body);
        return Cow::Owned(strip_field_name(&decoded, eq).to_owned());
    }
    Cow::Borrowed(strip_field_name(body, eq))
}

fn strip_field_name(body: &str, eq: usize) -> &str {
    match body.find('{') {
        Some(brace) if brace > eq => body.get(eq + 1..).unwrap_or(body),
        _ => body,
    }
}

// ============================================================================
// Tests
// ============================================================================
