//! Per-socket event loop.
//!
//! Each accepted socket is driven by one tokio task that handles:
//!
//! - Incoming bytes, decoded into requests and posted to the session task
//! - Outgoing bytes and close commands queued by sessions
//! - The startup deadline for connections that never send a request

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::identifiers::ConnectionId;

use super::{Acceptor, Connection, ConnectionEvent, RequestDecoder, SharedConnection};

// ============================================================================
// Constants
// ============================================================================

/// Size of a single socket read.
const READ_CHUNK_SIZE: usize = 8 * 1024;

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Write bytes to the socket.
    Send(Vec<u8>),
    /// Flush and close the socket.
    Close,
}

// ============================================================================
// TcpConnection
// ============================================================================

/// A TCP socket driven by its own event loop task.
///
/// # Thread Safety
///
/// `TcpConnection` is `Send + Sync`; [`Connection::send`] and
/// [`Connection::close`] only post to the event loop.
pub struct TcpConnection {
    /// Connection id.
    id: ConnectionId,
    /// Remote address.
    peer: SocketAddr,
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
}

impl TcpConnection {
    /// Wraps an accepted socket and spawns its event loop.
    ///
    /// # Arguments
    ///
    /// * `stream` - The accepted socket
    /// * `peer` - Remote address, for logging
    /// * `decoder` - Request decoder for this connection
    /// * `events` - Where requests and the final death notice are posted
    /// * `startup_timeout` - Time allowed before the first complete request
    pub(crate) fn spawn<D: RequestDecoder>(
        stream: TcpStream,
        peer: SocketAddr,
        decoder: D,
        events: mpsc::UnboundedSender<ConnectionEvent<D::Request>>,
        startup_timeout: Duration,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            peer,
            command_tx,
        });

        debug!(connection = %connection.id, %peer, "TCP connection accepted");

        let _ = events.send(ConnectionEvent::Opened {
            connection: connection.clone(),
        });

        tokio::spawn(Self::run_event_loop(
            Arc::clone(&connection),
            stream,
            decoder,
            command_rx,
            events,
            startup_timeout,
        ));

        connection
    }

    /// Returns the remote address.
    #[inline]
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Event loop that handles socket I/O.
    async fn run_event_loop<D: RequestDecoder>(
        connection: Arc<Self>,
        stream: TcpStream,
        mut decoder: D,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        events: mpsc::UnboundedSender<ConnectionEvent<D::Request>>,
        startup_timeout: Duration,
    ) {
        let shared: SharedConnection = connection.clone();
        let (mut reader, mut writer) = stream.into_split();
        let mut buffer = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        let startup_deadline = time::sleep_until(Instant::now() + startup_timeout);
        tokio::pin!(startup_deadline);
        let mut started = false;

        let reason = loop {
            tokio::select! {
                // Incoming bytes from the peer
                read = reader.read(&mut chunk) => {
                    match read {
                        Ok(0) => {
                            trace!(connection = %connection.id, "Peer closed the stream");
                            break "connection closed by peer".to_owned();
                        }
                        Ok(n) => {
                            buffer.extend_from_slice(&chunk[..n]);
                            match Self::drain_requests(&shared, &mut decoder, &mut buffer, &events) {
                                Ok(0) => {}
                                Ok(_) => started = true,
                                Err(e) => {
                                    warn!(connection = %connection.id, error = %e, "Undecodable input");
                                    let _ = writer.shutdown().await;
                                    break e.to_string();
                                }
                            }
                        }
                        Err(e) => {
                            debug!(connection = %connection.id, error = %e, "Socket read failed");
                            break e.to_string();
                        }
                    }
                }

                // Commands from sessions
                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send(bytes)) => {
                            if let Err(e) = Self::write(&mut writer, &bytes).await {
                                debug!(connection = %connection.id, error = %e, "Socket write failed");
                                break e.to_string();
                            }
                        }

                        Some(ConnectionCommand::Close) => {
                            trace!(connection = %connection.id, "Close command received");
                            let _ = writer.shutdown().await;
                            break "connection closed locally".to_owned();
                        }

                        None => break "command channel closed".to_owned(),
                    }
                }

                // Nothing useful arrived in time
                () = &mut startup_deadline, if !started => {
                    debug!(connection = %connection.id, "Startup timeout, closing connection");
                    let _ = writer.shutdown().await;
                    break "startup timeout".to_owned();
                }
            }
        };

        let _ = events.send(ConnectionEvent::Died {
            connection: shared,
            reason,
        });

        debug!(connection = %connection.id, "Event loop terminated");
    }

    /// Decodes and posts every complete request in `buffer`.
    fn drain_requests<D: RequestDecoder>(
        shared: &SharedConnection,
        decoder: &mut D,
        buffer: &mut Vec<u8>,
        events: &mpsc::UnboundedSender<ConnectionEvent<D::Request>>,
    ) -> Result<usize> {
        let mut count = 0;
        while let Some(request) = decoder.decode(buffer)? {
            count += 1;
            let _ = events.send(ConnectionEvent::Request {
                connection: Arc::clone(shared),
                request,
            });
        }
        Ok(count)
    }

    /// Writes one outgoing chunk.
    async fn write(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
        writer.write_all(bytes).await?;
        writer.flush().await
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, bytes: Vec<u8>) {
        let _ = self.command_tx.send(ConnectionCommand::Send(bytes));
    }

    fn close(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Close);
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.peer)
    }
}

// ============================================================================
// DecodingAcceptor
// ============================================================================

/// Drives each accepted socket with a [`TcpConnection`] and a fresh decoder.
pub(crate) struct DecodingAcceptor<M> {
    make_decoder: M,
    startup_timeout: Duration,
}

impl<M> DecodingAcceptor<M> {
    /// Creates an acceptor.
    ///
    /// # Arguments
    ///
    /// * `make_decoder` - Creates a request decoder per connection
    /// * `startup_timeout` - Time a new connection gets to send a request
    pub(crate) fn new(make_decoder: M, startup_timeout: Duration) -> Self {
        Self {
            make_decoder,
            startup_timeout,
        }
    }
}

impl<D, M> Acceptor for DecodingAcceptor<M>
where
    D: RequestDecoder,
    M: Fn() -> D + Send + 'static,
{
    type Request = D::Request;

    fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        events: mpsc::UnboundedSender<ConnectionEvent<D::Request>>,
    ) {
        TcpConnection::spawn(
            stream,
            peer,
            (self.make_decoder)(),
            events,
            self.startup_timeout,
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    use crate::error::Error;

    /// Splits input into `\n`-terminated lines.
    struct LineDecoder;

    impl RequestDecoder for LineDecoder {
        type Request = String;

        fn decode(&mut self, buffer: &mut Vec<u8>) -> Result<Option<String>> {
            let Some(end) = buffer.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let line: Vec<u8> = buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line[..end]).into_owned();
            if line == "boom" {
                return Err(Error::malformed("boom"));
            }
            Ok(Some(line))
        }
    }

    async fn connected_pair(
        startup_timeout: Duration,
    ) -> (
        TcpStream,
        Arc<TcpConnection>,
        mpsc::UnboundedReceiver<ConnectionEvent<String>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (stream, peer) = listener.accept().await.expect("accept");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = TcpConnection::spawn(stream, peer, LineDecoder, tx, startup_timeout);
        match rx.recv().await.expect("event") {
            ConnectionEvent::Opened { connection: c } => assert_eq!(c.id(), connection.id()),
            other => panic!("unexpected event: {other:?}"),
        }
        (client, connection, rx)
    }

    #[tokio::test]
    async fn test_requests_are_posted_in_order() {
        let (mut client, connection, mut events) =
            connected_pair(Duration::from_secs(30)).await;

        client.write_all(b"one\ntwo\nthr").await.expect("write");
        client.write_all(b"ee\n").await.expect("write");

        for expected in ["one", "two", "three"] {
            match events.recv().await.expect("event") {
                ConnectionEvent::Request { connection: c, request } => {
                    assert_eq!(request, expected);
                    assert_eq!(c.id(), connection.id());
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_then_close_delivers_bytes() {
        let (mut client, connection, mut events) =
            connected_pair(Duration::from_secs(30)).await;

        connection.send(b"hello\n".to_vec());
        connection.close();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.expect("read");
        assert_eq!(received, b"hello\n");

        match events.recv().await.expect("event") {
            ConnectionEvent::Died { reason, .. } => {
                assert_eq!(reason, "connection closed locally");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_reports_death() {
        let (client, _connection, mut events) = connected_pair(Duration::from_secs(30)).await;
        drop(client);

        match events.recv().await.expect("event") {
            ConnectionEvent::Died { reason, .. } => {
                assert_eq!(reason, "connection closed by peer");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_startup_timeout_closes_idle_connection() {
        let (mut client, _connection, mut events) =
            connected_pair(Duration::from_millis(50)).await;

        match events.recv().await.expect("event") {
            ConnectionEvent::Died { reason, .. } => assert_eq!(reason, "startup timeout"),
            other => panic!("unexpected event: {other:?}"),
        }

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.expect("read");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_decode_error_is_fatal() {
        let (mut client, _connection, mut events) =
            connected_pair(Duration::from_secs(30)).await;

        client.write_all(b"boom\n").await.expect("write");

        match events.recv().await.expect("event") {
            ConnectionEvent::Died { reason, .. } => {
                assert_eq!(reason, "Malformed request: boom");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
