//! Listener, accept loop and session task.
//!
//! A [`Server`] owns three kinds of task:
//!
//! 1. The accept loop, handing each socket to the protocol's [`Acceptor`]
//! 2. One driver task per connection
//! 3. The session task, the only place session state is touched
//!
//! The session task drains two channels: connection events and session
//! commands (application sends and timer ticks). A protocol plugs in by
//! implementing [`Binding`]. The session task also keeps every open
//! connection, so shutdown closes those that never joined a session.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::identifiers::ConnectionId;
use crate::session::SessionCommand;

use super::{Acceptor, ConnectionEvent, SharedConnection};

// ============================================================================
// Binding
// ============================================================================

/// Protocol logic run inside the session task.
pub(crate) trait Binding: Send + 'static {
    /// Decoded request type.
    type Request: Send + 'static;

    /// Handles one decoded request.
    fn handle_request(&mut self, connection: SharedConnection, request: Self::Request);

    /// Handles the death of a connection.
    fn connection_died(&mut self, connection: SharedConnection, reason: &str);

    /// Handles an application command or timer tick.
    fn handle_command(&mut self, command: SessionCommand);

    /// Closes every session.
    fn shutdown(&mut self);
}

// ============================================================================
// Server
// ============================================================================

/// A running session listener.
///
/// Dropping the server shuts it down.
///
/// # Example
///
/// ```ignore
/// let server = http::listen("127.0.0.1:0", HttpConfig::default(), factory).await?;
/// println!("listening on {}", server.local_addr());
/// server.shutdown();
/// ```
pub struct Server {
    /// Protocol name, for logging.
    protocol: &'static str,
    /// Bound address.
    local_addr: SocketAddr,
    /// Accept loop and session task.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Tells the session task to close every session.
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Server {
    /// Binds a listener and starts the accept loop and the session task.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address to bind (port 0 for a random port)
    /// * `protocol` - Protocol name, for logging
    /// * `acceptor` - Drives each accepted socket
    /// * `make_binding` - Creates the binding, given the command sender
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if binding fails.
    pub(crate) async fn start<A, C, B, F>(
        addr: A,
        protocol: &'static str,
        acceptor: C,
        make_binding: F,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
        C: Acceptor,
        B: Binding<Request = C::Request>,
        F: FnOnce(mpsc::UnboundedSender<SessionCommand>) -> B,
    {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        debug!(protocol, port = local_addr.port(), "Listener bound");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let binding = make_binding(command_tx);

        let accept = tokio::spawn(Self::accept_loop(listener, protocol, acceptor, event_tx));
        let sessions = tokio::spawn(Self::run_session_task(
            binding, protocol, event_rx, command_rx, stop_rx,
        ));

        info!(protocol, %local_addr, "Listener started");

        Ok(Self {
            protocol,
            local_addr,
            tasks: Mutex::new(vec![accept, sessions]),
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the protocol name (`"RTCP"` or `"HTTP"`).
    #[inline]
    #[must_use]
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// Stops accepting connections, closes every session and every
    /// connection still open.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        let Some(stop_tx) = self.stop_tx.lock().take() else {
            return;
        };

        info!(protocol = self.protocol, "Listener shutting down");

        let mut tasks = self.tasks.lock();
        // The accept loop goes first; the session task exits on its own.
        if !tasks.is_empty() {
            tasks.remove(0).abort();
        }
        let _ = stop_tx.send(());
    }

    /// Background task that accepts new connections.
    async fn accept_loop<C: Acceptor>(
        listener: TcpListener,
        protocol: &'static str,
        acceptor: C,
        events: mpsc::UnboundedSender<ConnectionEvent<C::Request>>,
    ) {
        debug!(protocol, "Accept loop started");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => acceptor.accept(stream, peer, events.clone()),
                Err(e) => {
                    error!(protocol, error = %e, "Accept failed");
                }
            }
        }
    }

    /// The serialized execution context for every session of this listener.
    async fn run_session_task<B: Binding>(
        mut binding: B,
        protocol: &'static str,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent<B::Request>>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut stop: oneshot::Receiver<()>,
    ) {
        debug!(protocol, "Session task started");

        let mut live: FxHashMap<ConnectionId, SharedConnection> = FxHashMap::default();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!(protocol, "Event channel closed");
                        break;
                    };
                    Self::dispatch_event(&mut binding, &mut live, event);
                }

                Some(command) = commands.recv() => {
                    binding.handle_command(command);
                }

                _ = &mut stop => {
                    debug!(protocol, "Stop signal received");
                    break;
                }
            }
        }

        // Sockets accepted before the stop signal still need closing.
        while let Ok(event) = events.try_recv() {
            match event {
                ConnectionEvent::Opened { connection } => {
                    live.insert(connection.id(), connection);
                }
                ConnectionEvent::Died { connection, .. } => {
                    live.remove(&connection.id());
                }
                ConnectionEvent::Request { .. } => {}
            }
        }

        binding.shutdown();

        debug!(protocol, open = live.len(), "Closing open connections");
        for connection in live.into_values() {
            connection.close();
        }

        debug!(protocol, "Session task terminated");
    }

    /// Routes one connection event to the binding.
    fn dispatch_event<B: Binding>(
        binding: &mut B,
        live: &mut FxHashMap<ConnectionId, SharedConnection>,
        event: ConnectionEvent<B::Request>,
    ) {
        match event {
            ConnectionEvent::Opened { connection } => {
                live.insert(connection.id(), connection);
            }
            ConnectionEvent::Request {
                connection,
                request,
            } => {
                binding.handle_request(connection, request);
            }
            ConnectionEvent::Died { connection, reason } => {
                live.remove(&connection.id());
                binding.connection_died(connection, &reason);
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("protocol", &self.protocol)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}
