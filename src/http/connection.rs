//! hyper-driven HTTP connections.
//!
//! Each accepted socket is served by hyper's HTTP/1 connection on its own
//! task. The service answers what needs no session state on the spot:
//!
//! - `OPTIONS` gets the CORS pre-flight reply
//! - Unrecognized URIs get `404` with a `badURL` body
//! - Other methods than `GET`/`POST`/`OPTIONS` close the connection
//!
//! Session requests are posted to the session task, and the service waits
//! for the reply. A held-open `select` is simply a reply not yet sent.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::transport::{Acceptor, Connection, ConnectionEvent};

use super::framer::{self, HttpResponse};
use super::request::{self, HttpRequest};
use super::uri::SessionUri;

type Events = mpsc::UnboundedSender<ConnectionEvent<HttpRequest>>;

// ============================================================================
// Constants
// ============================================================================

/// Longest wait for an answered request to be written after a close.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How the driver loop ended.
enum Ending {
    /// hyper finished on its own.
    Finished,
    /// Closed locally; a reply already sent still goes out.
    Graceful,
    /// Dropped outright.
    Abort,
}

// ============================================================================
// HttpConnection
// ============================================================================

/// An HTTP/1 connection served by hyper.
///
/// [`Connection::send`] answers the request currently waiting on the
/// session task; the bytes become the body of a `200 OK`.
pub struct HttpConnection {
    /// Connection id.
    id: ConnectionId,
    /// Remote address.
    peer: SocketAddr,
    /// Reply slot of the request waiting on the session task.
    pending: Mutex<Option<oneshot::Sender<Bytes>>>,
    /// Set once the first request arrived.
    started: AtomicBool,
    /// Wakes the driver task to close the connection.
    close_signal: Notify,
}

impl HttpConnection {
    /// Spawns the driver task for an accepted socket.
    ///
    /// # Arguments
    ///
    /// * `stream` - The accepted socket
    /// * `peer` - Remote address, for logging
    /// * `root` - Normalized, lower-case root prefix
    /// * `events` - Where requests and the final death notice are posted
    /// * `startup_timeout` - Time allowed before the first request
    pub(crate) fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        root: Arc<str>,
        events: Events,
        startup_timeout: Duration,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            peer,
            pending: Mutex::new(None),
            started: AtomicBool::new(false),
            close_signal: Notify::new(),
        });

        debug!(connection = %connection.id, %peer, "HTTP connection accepted");

        let _ = events.send(ConnectionEvent::Opened {
            connection: connection.clone(),
        });

        tokio::spawn(Self::serve(
            Arc::clone(&connection),
            stream,
            root,
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

    /// Runs hyper on the socket until it closes.
    async fn serve(
        connection: Arc<Self>,
        stream: TcpStream,
        root: Arc<str>,
        events: Events,
        startup_timeout: Duration,
    ) {
        let service = {
            let connection = Arc::clone(&connection);
            let events = events.clone();
            service_fn(move |request| {
                Self::handle(
                    Arc::clone(&connection),
                    Arc::clone(&root),
                    events.clone(),
                    request,
                )
            })
        };

        let served = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        tokio::pin!(served);
        let startup_deadline = time::sleep(startup_timeout);
        tokio::pin!(startup_deadline);
        let mut deadline_passed = false;

        let (reason, ending) = loop {
            tokio::select! {
                result = served.as_mut() => {
                    let reason = match result {
                        Ok(()) => "connection closed by peer".to_owned(),
                        Err(e) => {
                            debug!(connection = %connection.id, error = %e, "HTTP connection failed");
                            e.to_string()
                        }
                    };
                    break (reason, Ending::Finished);
                }

                () = connection.close_signal.notified() => {
                    trace!(connection = %connection.id, "Close requested");
                    break ("connection closed locally".to_owned(), Ending::Graceful);
                }

                () = &mut startup_deadline, if !deadline_passed => {
                    deadline_passed = true;
                    if !connection.started.load(Ordering::Acquire) {
                        debug!(connection = %connection.id, "Startup timeout, closing connection");
                        break ("startup timeout".to_owned(), Ending::Abort);
                    }
                }
            }
        };

        if let Ending::Graceful = ending {
            // An unanswered request fails; an answered one is still written.
            connection.pending.lock().take();
            served.as_mut().graceful_shutdown();
            match time::timeout(CLOSE_GRACE, served).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    trace!(connection = %connection.id, error = %e, "Connection ended with error");
                }
                Err(_) => debug!(connection = %connection.id, "Close grace expired"),
            }
        }

        let _ = events.send(ConnectionEvent::Died {
            connection: connection.clone(),
            reason,
        });

        debug!(connection = %connection.id, "HTTP connection terminated");
    }

    /// Serves one request.
    ///
    /// An error makes hyper drop the connection without a reply.
    async fn handle(
        connection: Arc<Self>,
        root: Arc<str>,
        events: Events,
        request: Request<Incoming>,
    ) -> Result<HttpResponse> {
        connection.started.store(true, Ordering::Release);

        let method = request.method().clone();
        let target = request.uri().to_string().to_ascii_lowercase();
        trace!(connection = %connection.id, %method, uri = %target, "Request");

        if method == Method::OPTIONS {
            return Ok(framer::options_response(request.headers()));
        }
        if method != Method::GET && method != Method::POST {
            warn!(connection = %connection.id, %method, "Unsupported method");
            return Err(Error::malformed(format!("unsupported method {method}")));
        }

        let route = match SessionUri::parse(&target, &root) {
            Some(SessionUri::Xmit { .. }) if method != Method::POST => None,
            route => route,
        };
        let Some(route) = route else {
            info!(connection = %connection.id, uri = %target, "Bad URL");
            return Ok(framer::not_found_response(framer::bad_url_body(&target)));
        };

        let non_persistent = request::is_non_persistent(request.version(), request.headers());
        let (parts, body) = request.into_parts();
        let body = request::read_body(&parts.headers, body).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        *connection.pending.lock() = Some(reply_tx);

        let posted = events.send(ConnectionEvent::Request {
            connection: connection.clone(),
            request: HttpRequest {
                route,
                body,
                non_persistent,
            },
        });
        if posted.is_err() {
            connection.pending.lock().take();
            return Err(Error::ConnectionClosed);
        }

        let reply = reply_rx.await.map_err(|_| Error::ConnectionClosed)?;
        Ok(framer::ok_response(reply))
    }
}

impl Connection for HttpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, bytes: Vec<u8>) {
        match self.pending.lock().take() {
            Some(reply) => {
                let _ = reply.send(Bytes::from(bytes));
            }
            None => debug!(connection = %self.id, "No request awaiting a reply, dropped"),
        }
    }

    fn close(&self) {
        self.close_signal.notify_one();
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// HttpAcceptor
// ============================================================================

/// Serves each accepted socket with an [`HttpConnection`].
pub(crate) struct HttpAcceptor {
    root: Arc<str>,
    startup_timeout: Duration,
}

impl HttpAcceptor {
    /// Creates an acceptor for URIs under `root`.
    pub(crate) fn new(root: &str, startup_timeout: Duration) -> Self {
        Self {
            root: Arc::from(root.to_ascii_lowercase()),
            startup_timeout,
        }
    }
}

impl Acceptor for HttpAcceptor {
    type Request = HttpRequest;

    fn accept(&self, stream: TcpStream, peer: SocketAddr, events: Events) {
        HttpConnection::spawn(
            stream,
            peer,
            Arc::clone(&self.root),
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

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::identifiers::SessionId;
    use crate::transport::SharedConnection;

    const WAIT: Duration = Duration::from_secs(5);

    async fn connected_pair(
        startup_timeout: Duration,
    ) -> (
        TcpStream,
        Arc<HttpConnection>,
        mpsc::UnboundedReceiver<ConnectionEvent<HttpRequest>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (stream, peer) = listener.accept().await.expect("accept");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = HttpConnection::spawn(stream, peer, Arc::from("/"), tx, startup_timeout);
        match rx.recv().await.expect("event") {
            ConnectionEvent::Opened { connection: c } => assert_eq!(c.id(), connection.id()),
            other => panic!("unexpected event: {other:?}"),
        }
        (client, connection, rx)
    }

    async fn read_all(client: &mut TcpStream) -> String {
        let mut response = Vec::new();
        tokio::time::timeout(WAIT, client.read_to_end(&mut response))
            .await
            .expect("closed in time")
            .expect("read");
        String::from_utf8_lossy(&response).into_owned()
    }

    async fn next_request(
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent<HttpRequest>>,
    ) -> (SharedConnection, HttpRequest) {
        match events.recv().await.expect("event") {
            ConnectionEvent::Request { connection, request } => (connection, request),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_request_is_answered_through_send() {
        let (mut client, _connection, mut events) = connected_pair(WAIT).await;
        client
            .write_all(b"GET /Select/9/1 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");

        let (connection, request) = next_request(&mut events).await;
        assert_eq!(
            request.route,
            SessionUri::Select {
                session: SessionId::from_u64(9),
                seq: 1
            }
        );
        assert!(request.non_persistent);

        connection.send(br#"{"seqnum":2,"msgs":[]}"#.to_vec());
        let response = read_all(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.to_ascii_lowercase().contains("content-length: 22\r\n"));
        assert!(response.ends_with(r#"{"seqnum":2,"msgs":[]}"#));
    }

    #[tokio::test]
    async fn test_chunked_form_body() {
        let (mut client, _connection, mut events) = connected_pair(WAIT).await;
        client
            .write_all(
                b"POST /xmit/3/1 HTTP/1.1\r\nHost: x\r\n\
                  Content-Type: application/x-www-form-urlencoded\r\n\
                  Transfer-Encoding: chunked\r\n\r\n\
                  6\r\nm=%7B%\r\n8\r\n22a%22:1\r\n3\r\n%7D\r\n0\r\n\r\n",
            )
            .await
            .expect("write");

        let (_, request) = next_request(&mut events).await;
        assert_eq!(request.body, r#"m={"a":1}"#);
        assert!(!request.non_persistent);
    }

    #[tokio::test]
    async fn test_bad_url_and_preflight_answered_locally() {
        let (mut client, _connection, mut events) = connected_pair(WAIT).await;
        client
            .write_all(
                b"GET /xmit/3/1 HTTP/1.1\r\nHost: x\r\n\r\n\
                  OPTIONS /xmit/3/1 HTTP/1.1\r\nHost: x\r\nOrigin: http://a.example\r\nConnection: close\r\n\r\n",
            )
            .await
            .expect("write");

        let response = read_all(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains(r#""error":"badURL""#));
        assert!(response.contains("access-control-allow-origin: http://a.example"));
        assert!(response.contains("access-control-allow-methods: GET, POST, OPTIONS"));

        match events.recv().await.expect("event") {
            ConnectionEvent::Died { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsupported_method_closes_connection() {
        let (mut client, _connection, mut events) = connected_pair(WAIT).await;
        client
            .write_all(b"DELETE /connect HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .expect("write");

        let response = read_all(&mut client).await;
        assert!(!response.contains("200 OK"));
        assert!(matches!(
            events.recv().await.expect("event"),
            ConnectionEvent::Died { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_drops_waiting_request() {
        let (mut client, connection, mut events) = connected_pair(WAIT).await;
        client
            .write_all(b"GET /select/9/1 HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .expect("write");
        next_request(&mut events).await;

        connection.close();
        let response = read_all(&mut client).await;
        assert!(response.is_empty());

        match events.recv().await.expect("event") {
            ConnectionEvent::Died { reason, .. } => assert_eq!(reason, "connection closed locally"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_then_close_delivers_reply() {
        let (mut client, connection, mut events) = connected_pair(WAIT).await;
        client
            .write_all(b"GET /disconnect/9 HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .expect("write");
        next_request(&mut events).await;

        connection.send(br#"{"status":"disconnected"}"#.to_vec());
        connection.close();
        let response = read_all(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with(r#"{"status":"disconnected"}"#));
    }

    #[tokio::test]
    async fn test_startup_timeout_closes_idle_connection() {
        let (mut client, _connection, mut events) =
            connected_pair(Duration::from_millis(50)).await;

        match events.recv().await.expect("event") {
            ConnectionEvent::Died { reason, .. } => assert_eq!(reason, "startup timeout"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(read_all(&mut client).await.is_empty());
    }
}
