//! RTCP client requests.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

// ============================================================================
// Constants
// ============================================================================

/// Separator between request line fields.
static FIELD_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(" +").unwrap_or_else(|_| unreachable!("static pattern is valid"))
});

// ============================================================================
// RtcpRequest
// ============================================================================

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpRequest {
    /// `start`: begin a new session.
    Start,

    /// `resume <sessionID> <clientRecvSeq>`: rebind after a disconnect.
    Resume {
        /// Session id as sent by the client.
        session_id: String,
        /// Last server message the client received.
        client_recv_seq: u64,
    },

    /// `ack <clientRecvSeq>`: acknowledge server messages.
    Ack {
        /// Last server message the client received.
        client_recv_seq: u64,
    },

    /// `<clientSendSeq> <clientRecvSeq>` followed by a message block.
    Message {
        /// Client batch number.
        client_send_seq: u64,
        /// Last server message the client received.
        client_recv_seq: u64,
        /// Messages unpacked from the block.
        messages: Vec<Value>,
    },

    /// `end [<clientRecvSeq>]`: terminate the session.
    End {
        /// Last server message the client received, if given.
        client_recv_seq: Option<u64>,
    },

    /// A client-reported error, or a request that could not be parsed.
    Error {
        /// What went wrong.
        message: String,
    },
}

/// Result of parsing a request line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RequestLine {
    /// The line is a whole request.
    Complete(RtcpRequest),
    /// The line opens a message block.
    MessageHeader {
        client_send_seq: u64,
        client_recv_seq: u64,
    },
}

impl RtcpRequest {
    /// Builds an error request.
    #[inline]
    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Parses one request line.
    ///
    /// Malformed lines become [`RtcpRequest::Error`].
    pub(crate) fn parse_line(line: &str) -> RequestLine {
        let fields: Vec<&str> = FIELD_SEPARATOR.split(line.trim()).collect();
        let seq = |i: usize| fields.get(i).and_then(|f| f.parse::<u64>().ok());

        let request = match fields[0] {
            "start" if fields.len() == 1 => Self::Start,
            "start" => Self::error("invalid start request"),

            "resume" => match (fields.len(), seq(2)) {
                (3, Some(client_recv_seq)) => Self::Resume {
                    session_id: fields[1].to_owned(),
                    client_recv_seq,
                },
                _ => Self::error("invalid resume request"),
            },

            "ack" => match (fields.len(), seq(1)) {
                (2, Some(client_recv_seq)) => Self::Ack { client_recv_seq },
                _ => Self::error("invalid ack request"),
            },

            "end" => match (fields.len(), seq(1)) {
                (1, _) => Self::End {
                    client_recv_seq: None,
                },
                (2, Some(client_recv_seq)) => Self::End {
                    client_recv_seq: Some(client_recv_seq),
                },
                _ => Self::error("invalid end request"),
            },

            "error" if fields.len() == 2 => {
                Self::error(format!("client reported error: {}", fields[1]))
            }
            "error" => Self::error("invalid error request"),

            verb => match (verb.parse::<u64>(), fields.len(), seq(1)) {
                (Ok(client_send_seq), 2, Some(client_recv_seq)) => {
                    return RequestLine::MessageHeader {
                        client_send_seq,
                        client_recv_seq,
                    };
                }
                (Ok(_), _, _) => Self::error("invalid message request"),
                (Err(_), _, _) => Self::error(format!("invalid RTCP verb {verb}")),
            },
        };

        RequestLine::Complete(request)
    }
}

impl fmt::Display for RtcpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Resume {
                session_id,
                client_recv_seq,
            } => write!(f, "resume {session_id} {client_recv_seq}"),
            Self::Ack { client_recv_seq } => write!(f, "ack {client_recv_seq}"),
            Self::Message {
                client_send_seq,
                client_recv_seq,
                messages,
            } => write!(
                f,
                "msg {client_send_seq} {client_recv_seq} ({} messages)",
                messages.len()
            ),
            Self::End {
                client_recv_seq: Some(seq),
            } => write!(f, "end {seq}"),
            Self::End {
                client_recv_seq: None,
            } => f.write_str("end"),
            Self::Error { message } => write!(f, "error {message}"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(line: &str) -> RtcpRequest {
        match RtcpRequest::parse_line(line) {
            RequestLine::Complete(request) => request,
            other => panic!("expected a complete request, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_simple_verbs() {
        assert_eq!(complete("start"), RtcpRequest::Start);
        assert_eq!(
            complete("resume 1234   7"),
            RtcpRequest::Resume {
                session_id: "1234".to_owned(),
                client_recv_seq: 7
            }
        );
        assert_eq!(complete("ack 3"), RtcpRequest::Ack { client_recv_seq: 3 });
    }

    #[test]
    fn test_end_with_or_without_seq() {
        assert_eq!(
            complete("end"),
            RtcpRequest::End {
                client_recv_seq: None
            }
        );
        assert_eq!(
            complete("end 4"),
            RtcpRequest::End {
                client_recv_seq: Some(4)
            }
        );
        assert!(matches!(complete("end x"), RtcpRequest::Error { .. }));
    }

    #[test]
    fn test_message_header() {
        assert_eq!(
            RtcpRequest::parse_line("1 0"),
            RequestLine::MessageHeader {
                client_send_seq: 1,
                client_recv_seq: 0
            }
        );
    }

    #[test]
    fn test_malformed_lines_become_errors() {
        assert_eq!(complete("start now"), RtcpRequest::error("invalid start request"));
        assert_eq!(complete("ack"), RtcpRequest::error("invalid ack request"));
        assert_eq!(complete("resume 12"), RtcpRequest::error("invalid resume request"));
        assert_eq!(complete("1 x"), RtcpRequest::error("invalid message request"));
        assert_eq!(complete("hello"), RtcpRequest::error("invalid RTCP verb hello"));
        assert_eq!(complete("-1 0"), RtcpRequest::error("invalid RTCP verb -1"));
    }

    #[test]
    fn test_client_error_report() {
        assert_eq!(
            complete("error oops"),
            RtcpRequest::error("client reported error: oops")
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(RtcpRequest::Ack { client_recv_seq: 2 }.to_string(), "ack 2");
        assert_eq!(
            RtcpRequest::End {
                client_recv_seq: None
            }
            .to_string(),
            "end"
        );
    }
}
