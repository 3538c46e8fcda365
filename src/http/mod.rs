//! HTTP long-poll sessions.
//!
//! For clients that can only speak HTTP. A session is created with
//! `connect`; the client then keeps one `select` poll outstanding to receive
//! server messages and posts its own messages with `xmit`. Both directions
//! carry their own sequence numbers so duplicated or reordered requests are
//! detected and answered with `sequenceError`.
//!
//! Unlike RTCP nothing is retransmitted: a message is gone once it was
//! written to a poll.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | hyper-driven connections |
//! | `request` | Routed requests |
//! | `uri` | Session URI routing |
//! | `framer` | Reply bodies and responses |
//! | `session` | Long-poll policy and session operations |
//! | `binding` | Request dispatch inside the session task |

// ============================================================================
// Submodules
// ============================================================================

/// Request dispatch inside the session task.
mod binding;

/// hyper-driven connections.
pub mod connection;

/// Reply bodies and responses.
pub mod framer;

/// Routed requests.
pub mod request;

/// Long-poll policy and session operations.
pub mod session;

/// Session URI routing.
pub mod uri;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::net::ToSocketAddrs;

use crate::config::HttpConfig;
use crate::error::Result;
use crate::handler::MessageHandlerFactory;
use crate::session::ReliabilityPolicy;
use crate::transport::Server;

use binding::HttpBinding;
use connection::HttpAcceptor;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::HttpConnection;
pub use request::HttpRequest;
pub use session::{BestEffort, HttpSession, SelectOutcome};
pub use uri::SessionUri;

// ============================================================================
// Listener
// ============================================================================

/// Starts an HTTP long-poll listener.
///
/// # Arguments
///
/// * `addr` - Address to bind (port 0 for a random port)
/// * `config` - Timeouts, root URI and message format
/// * `factory` - Supplies a handler for each new session
///
/// # Errors
///
/// Returns [`Error::Io`](crate::Error::Io) if the address cannot be bound.
pub async fn listen<A, F>(addr: A, config: HttpConfig, factory: F) -> Result<Server>
where
    A: ToSocketAddrs,
    F: MessageHandlerFactory,
{
    let factory: Arc<dyn MessageHandlerFactory> = Arc::new(factory);
    Server::start(
        addr,
        BestEffort::PROTOCOL,
        HttpAcceptor::new(&config.root_prefix(), config.startup_timeout()),
        move |commands| HttpBinding::new(config, factory, commands),
    )
    .await
}

// ============================================================================
// Tests
// ============================================================================
