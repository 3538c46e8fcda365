//! HTTP request dispatch inside the session task.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HttpConfig;
use crate::handler::MessageHandlerFactory;
use crate::identifiers::SessionId;
use crate::session::{SessionCommand, SessionRegistry, TimerKind};
use crate::transport::SharedConnection;
use crate::transport::server::Binding;

use super::framer;
use super::request::HttpRequest;
use super::session::{BestEffort, SelectOutcome};
use super::uri::SessionUri;

// ============================================================================
// HttpBinding
// ============================================================================

/// Maps HTTP requests onto sessions.
pub(crate) struct HttpBinding {
    registry: SessionRegistry<BestEffort>,
    config: HttpConfig,
}

impl HttpBinding {
    pub(crate) fn new(
        config: HttpConfig,
        factory: Arc<dyn MessageHandlerFactory>,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(factory, commands),
            config,
        }
    }

    fn reply(connection: &SharedConnection, body: String) {
        debug!(connection = %connection.id(), %body, "<|");
        connection.send(body.into_bytes());
    }

    /// Replies `sessionIDError` unless the session exists.
    fn require_session(&self, connection: &SharedConnection, session: SessionId) -> bool {
        if self.registry.get(session).is_some() {
            return true;
        }
        warn!(connection = %connection.id(), session_id = %session, "Unknown session");
        Self::reply(connection, framer::error_body(framer::SESSION_ID_ERROR));
        false
    }

    /// Dispatches a routed request. Returns `true` if a reply was written.
    fn dispatch(&mut self, connection: &SharedConnection, request: &HttpRequest) -> bool {
        if let Some(session) = request.route.session() {
            if !self.require_session(connection, session) {
                return true;
            }
            if self.registry.associate(session, Arc::clone(connection)).is_err() {
                return false;
            }
        }

        match request.route {
            SessionUri::Connect => self.do_connect(connection),
            SessionUri::Select { session, seq } => {
                self.do_select(connection, session, seq, request.non_persistent)
            }
            SessionUri::Xmit { session, seq } => {
                self.do_xmit(connection, session, seq, &request.body)
            }
            SessionUri::Disconnect { session } => self.do_disconnect(connection, session),
        }
    }

    fn do_connect(&mut self, connection: &SharedConnection) -> bool {
        let id = self
            .registry
            .create(Arc::clone(connection), BestEffort::new(&self.config));
        info!(session_id = %id, connection = %connection.id(), "HTTP session started");
        Self::reply(connection, framer::connect_body(id));
        true
    }

    fn do_select(
        &mut self,
        connection: &SharedConnection,
        session: SessionId,
        seq: u64,
        non_persistent: bool,
    ) -> bool {
        let outcome = self.registry.update(session, |s| {
            s.select(Arc::clone(connection), seq, non_persistent)
        });
        outcome == Some(SelectOutcome::Replied)
    }

    fn do_xmit(
        &mut self,
        connection: &SharedConnection,
        session: SessionId,
        seq: u64,
        body: &str,
    ) -> bool {
        self.registry
            .update(session, |s| s.xmit(connection, seq, body))
            .unwrap_or(false)
    }

    fn do_disconnect(&mut self, connection: &SharedConnection, session: SessionId) -> bool {
        self.registry.update(session, |s| {
            s.note_activity();
            Self::reply(connection, framer::disconnect_body());
            s.close("session disconnected by client");
        });
        true
    }
}

impl Binding for HttpBinding {
    type Request = HttpRequest;

    fn handle_request(&mut self, connection: SharedConnection, request: HttpRequest) {
        debug!(connection = %connection.id(), %request, "|>");

        if self.dispatch(&connection, &request) && request.non_persistent {
            connection.close();
        }
    }

    fn connection_died(&mut self, connection: SharedConnection, reason: &str) {
        if let Some(id) = self.registry.dissociate(connection.id()) {
            debug!(session_id = %id, connection = %connection.id(), reason, "Connection closed");
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send { session, payload } => {
                if self.registry.update(session, |s| s.send(payload)).is_none() {
                    debug!(session_id = %session, "Message for closed session dropped");
                }
            }
            SessionCommand::Close { session } => {
                self.registry
                    .update(session, |s| s.close("session closed by server"));
            }
            SessionCommand::SetDebugMode { session, enabled } => {
                self.registry.update(session, |s| s.set_debug_mode(enabled));
            }
            SessionCommand::Tick { session, timer } => {
                self.registry.update(session, |s| match timer {
                    TimerKind::Select => s.select_tick(),
                    TimerKind::Inactivity => s.inactivity_tick(),
                    TimerKind::Disconnected { .. } => {}
                });
            }
        }
    }

    fn shutdown(&mut self) {
        self.registry.close_all("server shutting down");
    }
}

// ============================================================================
// Tests
// ============================================================================
