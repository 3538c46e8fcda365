//! Per-listener session table.
//!
//! The registry maps session ids and connections to sessions and keeps the
//! connection-to-session mapping exclusive: a connection is detached from
//! its previous session before it is attached to a new one.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::handler::MessageHandlerFactory;
use crate::identifiers::{ConnectionId, SessionId};
use crate::transport::SharedConnection;

use super::{ReliabilityPolicy, Session, SessionCommand, SessionState};

// ============================================================================
// SessionRegistry
// ============================================================================

/// All live sessions of one listener.
///
/// Owned by the listener's session task; not shared across threads.
pub struct SessionRegistry<P: ReliabilityPolicy> {
    /// Sessions by id.
    sessions: FxHashMap<SessionId, Session<P>>,
    /// Owning session of each associated connection.
    by_connection: FxHashMap<ConnectionId, SessionId>,
    /// Application handler factory.
    factory: Arc<dyn MessageHandlerFactory>,
    /// Sender into the owning session task.
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl<P: ReliabilityPolicy> SessionRegistry<P> {
    /// Creates an empty registry.
    pub(crate) fn new(
        factory: Arc<dyn MessageHandlerFactory>,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            sessions: FxHashMap::default(),
            by_connection: FxHashMap::default(),
            factory,
            commands,
        }
    }

    /// Number of sessions.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if there are no sessions.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Looks up a session by id.
    #[inline]
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<&Session<P>> {
        self.sessions.get(&id)
    }

    /// Looks up a session by id, mutably.
    #[inline]
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session<P>> {
        self.sessions.get_mut(&id)
    }

    /// Returns the session a connection is associated with.
    #[inline]
    #[must_use]
    pub fn session_for(&self, connection: ConnectionId) -> Option<SessionId> {
        self.by_connection.get(&connection).copied()
    }

    /// Looks up a session by the id text a client presented.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the id is malformed or unknown.
    pub fn lookup(&self, id: &str) -> Result<SessionId> {
        let id: SessionId = id.parse()?;
        if self.sessions.contains_key(&id) {
            Ok(id)
        } else {
            Err(Error::session_not_found(id.to_string()))
        }
    }

    /// Draws a fresh id not used by any current session.
    fn allocate_id(&self) -> SessionId {
        loop {
            let id = SessionId::generate();
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Creates a session and binds `connection` to it.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn create(&mut self, connection: SharedConnection, policy: P) -> SessionId {
        let id = self.allocate_id();
        let session = Session::new(id, policy, self.factory.as_ref(), self.commands.clone());
        self.sessions.insert(id, session);
        self.bind(id, connection);
        id
    }

    /// Rebinds `connection` to the session named by `id`.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionInProgress`] if the connection already carries a
    ///   session or the named session is live
    /// - [`Error::SessionNotFound`] if no such session exists
    pub(crate) fn resume(&mut self, id: &str, connection: SharedConnection) -> Result<SessionId> {
        if self.by_connection.contains_key(&connection.id()) {
            return Err(Error::SessionInProgress);
        }
        let id = self.lookup(id)?;
        if self
            .sessions
            .get(&id)
            .is_some_and(|s| s.state() == SessionState::Live)
        {
            return Err(Error::SessionInProgress);
        }
        self.associate(id, connection)?;
        Ok(id)
    }

    /// Associates `connection` with the session named by `id`.
    ///
    /// The connection is first detached from any other session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if no such session exists.
    pub(crate) fn associate(&mut self, id: SessionId, connection: SharedConnection) -> Result<()> {
        if !self.sessions.contains_key(&id) {
            return Err(Error::session_not_found(id.to_string()));
        }
        self.bind(id, connection);
        Ok(())
    }

    fn bind(&mut self, id: SessionId, connection: SharedConnection) {
        let connection_id = connection.id();
        if let Some(previous) = self.by_connection.insert(connection_id, id)
            && previous != id
            && let Some(session) = self.sessions.get_mut(&previous)
        {
            debug!(connection = %connection_id, from = %previous, to = %id, "Connection moved");
            session.detach_connection(connection_id);
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.attach_connection(connection);
        }
    }

    /// Removes `connection` from whatever session it is associated with.
    ///
    /// Returns that session's id.
    pub(crate) fn dissociate(&mut self, connection: ConnectionId) -> Option<SessionId> {
        let id = self.by_connection.remove(&connection)?;
        if let Some(session) = self.sessions.get_mut(&id) {
            session.detach_connection(connection);
        }
        Some(id)
    }

    /// Runs `f` on a session, then drops the session if it closed.
    ///
    /// Returns `None` if there is no such session.
    pub(crate) fn update<R>(&mut self, id: SessionId, f: impl FnOnce(&mut Session<P>) -> R) -> Option<R> {
        let session = self.sessions.get_mut(&id)?;
        let result = f(session);
        if session.is_closing() {
            self.remove(id);
        }
        Some(result)
    }

    /// Removes a session from all maps.
    pub(crate) fn remove(&mut self, id: SessionId) -> Option<Session<P>> {
        let session = self.sessions.remove(&id)?;
        self.by_connection.retain(|_, owner| *owner != id);
        debug!(session_id = %id, remaining = self.sessions.len(), "Session removed");
        Some(session)
    }

    /// Closes and removes every session.
    pub(crate) fn close_all(&mut self, reason: &str) {
        let count = self.sessions.len();
        for (_, mut session) in self.sessions.drain() {
            session.close(reason);
        }
        self.by_connection.clear();
        if count > 0 {
            info!(protocol = P::PROTOCOL, count, "Closed all sessions");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
