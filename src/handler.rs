//! Application-facing session surface.
//!
//! An application plugs into a listener with a [`MessageHandlerFactory`]. The
//! factory is asked for one [`MessageHandler`] per session and hands it a
//! [`SessionHandle`] for talking back.
//!
//! # Example
//!
//! ```ignore
//! struct Echo(SessionHandle);
//!
//! impl MessageHandler for Echo {
//!     fn process_message(&mut self, message: Value) {
//!         let _ = self.0.send(Payload::from(message));
//!     }
//! }
//!
//! let server = rtcp::listen("127.0.0.1:0", RtcpConfig::default(), |session| {
//!     Box::new(Echo(session)) as Box<dyn MessageHandler>
//! })
//! .await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::message::Payload;
use crate::session::SessionCommand;

// ============================================================================
// Traits
// ============================================================================

/// Receives the messages of one session.
///
/// Called from the listener's session task; implementations must not block.
pub trait MessageHandler: Send {
    /// Handles one message sent by the client.
    fn process_message(&mut self, message: Value);

    /// Called exactly once when the session closes.
    fn connection_died(&mut self, reason: &str) {
        let _ = reason;
    }
}

/// Supplies a [`MessageHandler`] for each new session.
pub trait MessageHandlerFactory: Send + Sync + 'static {
    /// Creates the handler for a freshly started session.
    fn provide_handler(&self, session: SessionHandle) -> Box<dyn MessageHandler>;
}

impl<F> MessageHandlerFactory for F
where
    F: Fn(SessionHandle) -> Box<dyn MessageHandler> + Send + Sync + 'static,
{
    fn provide_handler(&self, session: SessionHandle) -> Box<dyn MessageHandler> {
        self(session)
    }
}

// ============================================================================
// SessionHandle
// ============================================================================

/// Cloneable handle for acting on a session from application code.
///
/// Every call posts a command to the listener's session task and returns
/// immediately.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, commands: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { id, commands }
    }

    /// Returns the session id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Sends a message to the client.
    ///
    /// Messages sent after the session closed are dropped silently.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the listener is shut down.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        self.post(SessionCommand::Send {
            session: self.id,
            payload: payload.into(),
        })
    }

    /// Serializes `value` as JSON and sends it to the client.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if serialization fails
    /// - [`Error::ConnectionClosed`] if the listener is shut down
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let payload = Payload::json(value)?;
        self.send(payload)
    }

    /// Closes the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the listener is shut down.
    pub fn close(&self) -> Result<()> {
        self.post(SessionCommand::Close { session: self.id })
    }

    /// Switches the session between normal and debug timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the listener is shut down.
    pub fn set_debug_mode(&self, enabled: bool) -> Result<()> {
        self.post(SessionCommand::SetDebugMode {
            session: self.id,
            enabled,
        })
    }

    fn post(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::ConnectionClosed)
    }
}

// ============================================================================
// Tests
// ============================================================================
