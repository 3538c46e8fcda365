//! RTCP wire framing.
//!
//! Requests are newline-terminated lines. A message request is a header line
//! `<clientSendSeq> <clientRecvSeq>` followed by a block of lines ended by an
//! empty line; the block is unpacked into messages according to the
//! listener's [`MessageFormat`].
//!
//! # Replies
//!
//! | Reply | Form |
//! |-------|------|
//! | start | `start <sessionID>\n` |
//! | resume | `resume <sessionID> <clientSendSeq>\n` |
//! | ack | `ack <clientSendSeq>\n` |
//! | error | `error <tag>\n` |
//! | message | `<serverSendSeq> <clientSendSeq>\n<payload>\n\n` |

// ============================================================================
// Imports
// ============================================================================

use tracing::warn;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::message::{MessageFormat, Payload};
use crate::transport::RequestDecoder;

use super::request::{RequestLine, RtcpRequest};

// ============================================================================
// Constants
// ============================================================================

/// Largest request line or message block accepted, in bytes.
pub const MAX_MESSAGE_LENGTH: usize = 1 << 20;

/// Error tag: message out of sequence.
pub const SEQUENCE_ERROR: &str = "sequenceError";

/// Error tag: request needs a session and the connection has none.
pub const NO_SESSION: &str = "noSession";

/// Error tag: resume named an unknown session.
pub const NO_SUCH_SESSION: &str = "noSuchSession";

/// Error tag: start or resume while a session is already in progress.
pub const SESSION_IN_PROGRESS: &str = "sessionInProgress";

// ============================================================================
// Replies
// ============================================================================

/// `start <sessionID>`
#[inline]
#[must_use]
pub fn start_reply(session: SessionId) -> String {
    format!("start {session}\n")
}

/// `resume <sessionID> <clientSendSeq>`
#[inline]
#[must_use]
pub fn resume_reply(session: SessionId, client_send_seq: u64) -> String {
    format!("resume {session} {client_send_seq}\n")
}

/// `ack <clientSendSeq>`
#[inline]
#[must_use]
pub fn ack_reply(client_send_seq: u64) -> String {
    format!("ack {client_send_seq}\n")
}

/// `error <tag>`
#[inline]
#[must_use]
pub fn error_reply(tag: &str) -> String {
    format!("error {tag}\n")
}

/// A numbered message followed by an empty line.
///
/// Whitespace-only lines of the payload are left out, since one would end
/// the message block early.
#[must_use]
pub fn message_reply(server_send_seq: u64, client_send_seq: u64, payload: &Payload) -> String {
    let mut reply = format!("{server_send_seq} {client_send_seq}\n");
    for line in payload.as_str().lines().filter(|line| !line.trim().is_empty()) {
        reply.push_str(line);
        reply.push('\n');
    }
    reply.push('\n');
    reply
}

/// Maps a session error to the tag reported to the client.
#[must_use]
pub fn error_tag(error: &Error) -> &'static str {
    match error {
        Error::Sequence { .. } => SEQUENCE_ERROR,
        Error::SessionNotFound { .. } => NO_SUCH_SESSION,
        Error::SessionInProgress => SESSION_IN_PROGRESS,
        _ => NO_SESSION,
    }
}

// ============================================================================
// RtcpDecoder
// ============================================================================

/// Two-stage request decoder: request lines, then message blocks.
#[derive(Debug)]
pub struct RtcpDecoder {
    /// How message blocks are unpacked.
    format: MessageFormat,
    /// Header of the message block being read, if any.
    header: Option<(u64, u64)>,
    /// Message block lines read so far.
    block: String,
}

impl RtcpDecoder {
    /// Creates a decoder for the given message format.
    #[must_use]
    pub fn new(format: MessageFormat) -> Self {
        Self {
            format,
            header: None,
            block: String::new(),
        }
    }

    /// Returns `true` while a message block is being read.
    #[inline]
    #[must_use]
    pub fn in_message_block(&self) -> bool {
        self.header.is_some()
    }

    /// Completes the message block being read.
    fn finish_block(&mut self, client_send_seq: u64, client_recv_seq: u64) -> RtcpRequest {
        self.header = None;
        let block = std::mem::take(&mut self.block);
        let messages = self.format.unpack(&block);
        if messages.is_empty() {
            warn!(client_send_seq, "Message block held no valid message");
            return RtcpRequest::error("invalid message block");
        }
        RtcpRequest::Message {
            client_send_seq,
            client_recv_seq,
            messages,
        }
    }
}

impl RequestDecoder for RtcpDecoder {
    type Request = RtcpRequest;

    fn decode(&mut self, buffer: &mut Vec<u8>) -> Result<Option<RtcpRequest>> {
        while let Some(line) = take_line(buffer)? {
            match self.header {
                None => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match RtcpRequest::parse_line(&line) {
                        RequestLine::Complete(request) => return Ok(Some(request)),
                        RequestLine::MessageHeader {
                            client_send_seq,
                            client_recv_seq,
                        } => self.header = Some((client_send_seq, client_recv_seq)),
                    }
                }
                Some((client_send_seq, client_recv_seq)) => {
                    if line.trim().is_empty() {
                        if self.block.is_empty() {
                            continue;
                        }
                        return Ok(Some(self.finish_block(client_send_seq, client_recv_seq)));
                    }
                    if self.block.len() + line.len() + 1 > MAX_MESSAGE_LENGTH {
                        return Err(Error::MessageTooLarge {
                            limit: MAX_MESSAGE_LENGTH,
                        });
                    }
                    if !self.block.is_empty() {
                        self.block.push('\n');
                    }
                    self.block.push_str(&line);
                }
            }
        }
        Ok(None)
    }
}

/// Removes one line from the front of `buffer`, without its terminator.
fn take_line(buffer: &mut Vec<u8>) -> Result<Option<String>> {
    let Some(end) = buffer.iter().position(|&b| b == b'\n') else {
        if buffer.len() > MAX_MESSAGE_LENGTH {
            return Err(Error::MessageTooLarge {
                limit: MAX_MESSAGE_LENGTH,
            });
        }
        return Ok(None);
    };

    let mut line: Vec<u8> = buffer.drain(..=end).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

// ============================================================================
// Tests
// ============================================================================
