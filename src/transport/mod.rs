//! TCP transport layer.
//!
//! This module owns raw sockets: it accepts TCP connections, turns bytes
//! into protocol requests and writes replies back. It knows nothing about
//! sessions; everything it observes is posted to the listener's session task.
//!
//! How a socket is driven is up to the protocol's [`Acceptor`]: RTCP uses a
//! [`TcpConnection`] with a [`RequestDecoder`], HTTP hands the socket to
//! hyper.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   accept   ┌────────────────┐  ConnectionEvent  ┌──────────────┐
//!  │ TcpListener  │──────────► │ TcpConnection  │─────────────────► │ session task │
//!  │ (accept loop)│            │ (event loop)   │ ◄──────────────── │  (Binding)   │
//!  └──────────────┘            └────────────────┘  send / close     └──────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `Server::start` binds the listener and spawns the accept loop
//! 2. Each accepted socket is handed to the [`Acceptor`], which spawns its
//!    driver task and posts [`ConnectionEvent::Opened`]
//! 3. Decoded requests are posted as [`ConnectionEvent::Request`]
//! 4. A connection that sends nothing before its startup deadline is closed
//! 5. On EOF, error or close, [`ConnectionEvent::Died`] is posted once
//! 6. On shutdown the session task closes every connection still open
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Per-socket event loop |
//! | `server` | Listener, accept loop and session task |

// ============================================================================
// Submodules
// ============================================================================

/// Per-socket event loop.
pub mod connection;

/// Listener, accept loop and session task.
pub mod server;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::identifiers::ConnectionId;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::TcpConnection;
pub(crate) use connection::DecodingAcceptor;
pub use server::Server;

// ============================================================================
// Connection
// ============================================================================

/// A transport endpoint a session can write to.
///
/// Both operations are non-blocking: bytes are queued for the connection's
/// own event loop.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Returns the connection id.
    fn id(&self) -> ConnectionId;

    /// Queues bytes for sending. Ignored once the connection is closed.
    fn send(&self, bytes: Vec<u8>);

    /// Closes the connection after previously queued bytes are written.
    fn close(&self);
}

/// Shared handle to a connection.
pub type SharedConnection = Arc<dyn Connection>;

// ============================================================================
// ConnectionEvent
// ============================================================================

/// What a connection reports to the session task.
#[derive(Debug)]
pub enum ConnectionEvent<R> {
    /// A socket was accepted.
    Opened {
        /// The new connection.
        connection: SharedConnection,
    },

    /// A complete request was decoded.
    Request {
        /// The connection the request arrived on.
        connection: SharedConnection,
        /// The decoded request.
        request: R,
    },

    /// The connection is gone.
    Died {
        /// The connection that died.
        connection: SharedConnection,
        /// Why it died.
        reason: String,
    },
}

// ============================================================================
// RequestDecoder
// ============================================================================

/// Incremental decoder from raw bytes to protocol requests.
pub trait RequestDecoder: Send + 'static {
    /// The request type produced.
    type Request: Send + 'static;

    /// Decodes one request from the front of `buffer`.
    ///
    /// Consumed bytes are removed from `buffer`. Returns `Ok(None)` if more
    /// input is needed.
    ///
    /// # Errors
    ///
    /// An error is fatal to the connection.
    fn decode(&mut self, buffer: &mut Vec<u8>) -> Result<Option<Self::Request>>;
}

// ============================================================================
// Acceptor
// ============================================================================

/// Drives accepted sockets for one protocol.
pub(crate) trait Acceptor: Send + 'static {
    /// The request type posted to the session task.
    type Request: Send + 'static;

    /// Spawns the driver task for `stream`.
    ///
    /// The driver posts [`ConnectionEvent::Opened`] first and
    /// [`ConnectionEvent::Died`] last.
    fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        events: mpsc::UnboundedSender<ConnectionEvent<Self::Request>>,
    );
}
