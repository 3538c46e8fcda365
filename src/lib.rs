//! Resumable sessions - message sessions that outlive their connections.
//!
//! This library keeps a long-lived, ordered message session between a server
//! and a client across transient network failures. Two wire protocols are
//! offered over the same session core:
//!
//! - **RTCP**: a line protocol over plain TCP with acknowledgements,
//!   retransmission and resume on a new connection
//! - **HTTP**: long-polling for clients that can only speak HTTP, with
//!   best-effort delivery
//!
//! # Architecture
//!
//! Each listener runs one session task that owns its registry and every
//! session in it. Connection event loops, timers and application handles
//! never touch session state; they post events to that task.
//!
//! - A [`Session`](session::Session) holds sequence counters, activity
//!   tracking and the application's [`MessageHandler`]
//! - A [`ReliabilityPolicy`](session::ReliabilityPolicy) supplies what the
//!   protocols do differently: retransmission, queueing, grace periods
//! - The [`SessionRegistry`](session::SessionRegistry) maps session ids and
//!   connections to sessions
//!
//! # Quick Start
//!
//! ```no_run
//! use resumable_session::{MessageHandler, RtcpConfig, SessionHandle, Payload, rtcp};
//! use serde_json::Value;
//!
//! struct Echo(SessionHandle);
//!
//! impl MessageHandler for Echo {
//!     fn process_message(&mut self, message: Value) {
//!         let _ = self.0.send(Payload::from(message));
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> resumable_session::Result<()> {
//!     let server = rtcp::listen("127.0.0.1:7000", RtcpConfig::default(), |session| {
//!         Box::new(Echo(session)) as Box<dyn MessageHandler>
//!     })
//!     .await?;
//!
//!     println!("listening on {}", server.local_addr());
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Property files and listener configuration |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`handler`] | Application-facing traits and [`SessionHandle`] |
//! | [`http`] | HTTP long-poll protocol |
//! | [`identifiers`] | Session and connection ids |
//! | [`message`] | Outbound payloads and inbound unpacking |
//! | [`rtcp`] | RTCP line protocol |
//! | [`session`] | Session core, policies and registry |
//! | [`timer`] | One-shot and periodic timers |
//! | [`transport`] | TCP listener and connections (internal) |

// ============================================================================
// Modules
// ============================================================================

/// Property files and listener configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Application-facing traits and the session handle.
pub mod handler;

/// HTTP long-poll protocol.
pub mod http;

/// Type-safe identifiers for sessions and connections.
pub mod identifiers;

/// Outbound payloads and inbound message unpacking.
pub mod message;

/// RTCP line protocol.
pub mod rtcp;

/// Session core, reliability policies and the registry.
pub mod session;

/// One-shot and periodic timers.
pub mod timer;

/// TCP listener and connections.
///
/// Internal module; exposed for the [`Server`] handle.
pub mod transport;

#[cfg(test)]
mod test_support;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{HttpConfig, Properties, RtcpConfig};

// Error types
pub use error::{Error, Result};

// Application surface
pub use handler::{MessageHandler, MessageHandlerFactory, SessionHandle};

// Identifier types
pub use identifiers::{ConnectionId, SessionId};

// Messages
pub use message::{MessageFormat, Payload};

// Sessions
pub use session::{Delivery, SessionState};

// Server handle
pub use transport::Server;
