//! RTCP: resumable sessions over plain TCP.
//!
//! A line-oriented protocol in which the client starts a session, exchanges
//! numbered message blocks with acknowledgements, and after losing its TCP
//! connection resumes the session on a new one. Unacknowledged server
//! messages are replayed on resume.
//!
//! # Exchange
//!
//! ```text
//!  client                              server
//!    │ start                             │
//!    │ ────────────────────────────────► │
//!    │                       start 1234  │
//!    │ ◄──────────────────────────────── │
//!    │ 1 0 / "hello" / <empty>           │
//!    │ ────────────────────────────────► │  handler.process_message("hello")
//!    │               1 1 / world / <empty>
//!    │ ◄──────────────────────────────── │  handle.send("world")
//!    │ ack 1                             │
//!    │ ────────────────────────────────► │
//!    ╳ connection lost                   │  grace period starts
//!    │ resume 1234 1                     │
//!    │ ────────────────────────────────► │
//!    │                     resume 1234 1 │  followed by replay
//!    │ ◄──────────────────────────────── │
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `request` | Decoded client requests |
//! | `framer` | Request decoding and reply rendering |
//! | `session` | Retransmission policy and session operations |
//! | `binding` | Request dispatch inside the session task |

// ============================================================================
// Submodules
// ============================================================================

/// Request dispatch inside the session task.
mod binding;

/// Request decoding and reply rendering.
pub mod framer;

/// Decoded client requests.
pub mod request;

/// Retransmission policy and session operations.
pub mod session;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::net::ToSocketAddrs;

use crate::config::RtcpConfig;
use crate::error::Result;
use crate::handler::MessageHandlerFactory;
use crate::session::ReliabilityPolicy;
use crate::transport::{DecodingAcceptor, Server};

use binding::RtcpBinding;

// ============================================================================
// Re-exports
// ============================================================================

pub use framer::RtcpDecoder;
pub use request::RtcpRequest;
pub use session::{PendingMessage, Retransmit, RtcpSession};

// ============================================================================
// Listener
// ============================================================================

/// Starts an RTCP listener.
///
/// # Arguments
///
/// * `addr` - Address to bind (port 0 for a random port)
/// * `config` - Timeouts, backlog limit and message format
/// * `factory` - Supplies a handler for each new session
///
/// # Errors
///
/// Returns [`Error::Io`](crate::Error::Io) if the address cannot be bound.
pub async fn listen<A, F>(addr: A, config: RtcpConfig, factory: F) -> Result<Server>
where
    A: ToSocketAddrs,
    F: MessageHandlerFactory,
{
    let factory: Arc<dyn MessageHandlerFactory> = Arc::new(factory);
    let format = config.message_format;
    Server::start(
        addr,
        Retransmit::PROTOCOL,
        DecodingAcceptor::new(move || RtcpDecoder::new(format), config.startup_timeout()),
        move |commands| RtcpBinding::new(config, factory, commands),
    )
    .await
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::time::timeout;

    use crate::handler::{MessageHandler, SessionHandle};
    use crate::message::Payload;
    use crate::test_support::init_tracing;

    const WAIT: Duration = Duration::from_secs(5);

    struct Echo(SessionHandle);

    impl MessageHandler for Echo {
        fn process_message(&mut self, message: Value) {
            let _ = self.0.send(Payload::from(message));
        }
    }

    async fn echo_server(config: RtcpConfig) -> Server {
        init_tracing();
        listen("127.0.0.1:0", config, |session| {
            Box::new(Echo(session)) as Box<dyn MessageHandler>
        })
        .await
        .expect("listen")
    }

    async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> String {
        let mut line = String::new();
        timeout(WAIT, reader.read_line(&mut line))
            .await
            .expect("reply in time")
            .expect("read");
        line
    }

    #[tokio::test]
    async fn test_start_message_echo() {
        let server = echo_server(RtcpConfig::default()).await;
        let stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"start\n").await.expect("write");
        let reply = read_line(&mut reader).await;
        assert!(reply.starts_with("start "), "unexpected reply {reply:?}");

        write.write_all(b"1 0\n\"hello\"\n\n").await.expect("write");
        assert_eq!(read_line(&mut reader).await, "1 1\n");
        assert_eq!(read_line(&mut reader).await, "\"hello\"\n");
        assert_eq!(read_line(&mut reader).await, "\n");

        server.shutdown();
    }

    #[tokio::test]
    async fn test_resume_replays_on_new_connection() {
        let server = echo_server(RtcpConfig::default()).await;

        let stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        write.write_all(b"start\n").await.expect("write");
        let reply = read_line(&mut reader).await;
        let id = reply.trim_end().trim_start_matches("start ").to_owned();

        write.write_all(b"1 0\n\"one\"\n\n").await.expect("write");
        assert_eq!(read_line(&mut reader).await, "1 1\n");
        drop(reader);
        drop(write);

        let stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        // The old connection's death may still be in flight.
        let mut resumed = String::new();
        for _ in 0..50 {
            write
                .write_all(format!("resume {id} 0\n").as_bytes())
                .await
                .expect("write");
            resumed = read_line(&mut reader).await;
            if resumed.starts_with("resume") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(resumed, format!("resume {id} 1\n"));
        assert_eq!(read_line(&mut reader).await, "1 1\n");
        assert_eq!(read_line(&mut reader).await, "\"one\"\n");

        server.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_verb_keeps_connection() {
        let server = echo_server(RtcpConfig::default()).await;
        let stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"bogus\nack 0\n").await.expect("write");
        assert_eq!(read_line(&mut reader).await, "error noSession\n");

        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let server = echo_server(RtcpConfig::default()).await;
        let stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        write.write_all(b"start\n").await.expect("write");
        read_line(&mut reader).await;

        server.shutdown();
        assert_eq!(read_line(&mut reader).await, "");
        assert_eq!(server.protocol(), "RTCP");
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections_without_session() {
        let server = echo_server(RtcpConfig::default()).await;
        let stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"error hello\nack 0\n").await.expect("write");
        assert_eq!(read_line(&mut reader).await, "error noSession\n");

        server.shutdown();
        let mut rest = Vec::new();
        timeout(WAIT, reader.read_to_end(&mut rest))
            .await
            .expect("closed in time")
            .expect("read");
        assert!(rest.is_empty());
    }
}
