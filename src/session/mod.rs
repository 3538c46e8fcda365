//! Resumable session core.
//!
//! A [`Session`] is the long-lived virtual connection that survives transport
//! churn. Its bookkeeping (sequence counters, activity tracking, the set of
//! connections it has used, the application handler) lives in
//! [`SessionCore`] and is shared by every protocol. What differs between
//! protocols (retransmission, queueing, what happens when the connection
//! goes away) is supplied by a [`ReliabilityPolicy`].
//!
//! # State Machine
//!
//! ```text
//!  Starting ──attach──► Live ──lose connection──► DETACHED_STATE
//!                        ▲                              │
//!                        └──────────attach──────────────┘
//!  any ──close──► Closed (absorbing)
//! ```
//!
//! `DETACHED_STATE` is [`SessionState::Disconnected`] for RTCP and
//! [`SessionState::Live`] for HTTP, where losing a request is routine.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `registry` | Session lookup by id and by connection |

// ============================================================================
// Submodules
// ============================================================================

/// Session lookup by id and by connection.
pub mod registry;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::handler::{MessageHandler, MessageHandlerFactory, SessionHandle};
use crate::identifiers::{ConnectionId, SessionId};
use crate::message::Payload;
use crate::timer::Clock;
use crate::transport::SharedConnection;

// ============================================================================
// Re-exports
// ============================================================================

pub use registry::SessionRegistry;

// ============================================================================
// SessionState
// ============================================================================

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, never bound to a connection.
    Starting,
    /// Bound to a connection.
    Live,
    /// Lost its connection, within the grace period.
    Disconnected,
    /// Closed. Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Live => "live",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// SessionCommand
// ============================================================================

/// Work posted into a listener's session task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Application message for the client.
    Send {
        session: SessionId,
        payload: Payload,
    },
    /// Application-requested close.
    Close { session: SessionId },
    /// Switch timeouts between normal and debug values.
    SetDebugMode { session: SessionId, enabled: bool },
    /// A session timer fired.
    Tick { session: SessionId, timer: TimerKind },
}

/// Which session timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Periodic inactivity check.
    Inactivity,
    /// Periodic select-timeout check (HTTP).
    Select,
    /// One-shot disconnected grace expiry (RTCP).
    ///
    /// `epoch` identifies the disconnection that armed it, so a stale tick
    /// from an earlier disconnection is ignored.
    Disconnected { epoch: u64 },
}

// ============================================================================
// Delivery
// ============================================================================

/// Outcome of [`Session::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to a connection.
    Sent,
    /// Held until a connection or poll is available.
    Queued,
    /// Discarded because the session is closing.
    Dropped,
    /// Accepted, but the retransmission backlog is now over its limit.
    Overflow,
}

// ============================================================================
// ReliabilityPolicy
// ============================================================================

/// Protocol-specific delivery semantics plugged into a [`Session`].
pub trait ReliabilityPolicy: Send + 'static {
    /// Protocol name, for logging.
    const PROTOCOL: &'static str;

    /// State of a session that was bound once and currently is not.
    const DETACHED_STATE: SessionState;

    /// Starts the periodic clocks for a new session.
    ///
    /// Periods are fixed here; later debug mode changes do not alter them.
    fn start_clocks(&self, core: &SessionCore) -> Vec<Clock>;

    /// Called before `connection` becomes the bound connection.
    fn on_attach(&mut self, core: &mut SessionCore, connection: &SharedConnection);

    /// Called after `connection` was removed from the session.
    ///
    /// `was_bound` is `true` if it was the bound connection.
    fn on_detach(&mut self, core: &mut SessionCore, connection: ConnectionId, was_bound: bool);

    /// Hands an outbound message to the protocol.
    fn transmit(&mut self, core: &mut SessionCore, payload: Payload) -> Delivery;

    /// Drops retained messages with a sequence number `<= acked`.
    ///
    /// Returns how many were dropped.
    fn discard_acknowledged(&mut self, acked: u64) -> usize;

    /// Applies normal or debug timeout values.
    fn apply_debug_mode(&mut self, core: &mut SessionCore, enabled: bool);

    /// Releases protocol resources when the session closes.
    fn shutdown(&mut self, core: &mut SessionCore);
}

// ============================================================================
// SessionCore
// ============================================================================

/// Protocol-independent session state.
pub struct SessionCore {
    /// Session id.
    pub(crate) id: SessionId,
    /// Client-to-server batches accepted so far.
    pub(crate) client_send_seq: u64,
    /// Server-to-client sequence counter.
    pub(crate) server_send_seq: u64,
    /// The connection replies currently go to.
    pub(crate) bound: Option<SharedConnection>,
    /// Every connection associated and not yet lost.
    pub(crate) connections: FxHashMap<ConnectionId, SharedConnection>,
    /// Set by the first attach.
    pub(crate) ever_bound: bool,
    /// Last client activity.
    pub(crate) last_activity: Instant,
    /// Idle time after which the session closes.
    pub(crate) inactivity_timeout: Duration,
    /// Debug timeouts in effect.
    pub(crate) debug_mode: bool,
    /// Set once, by close.
    pub(crate) closing: bool,
    /// Application handler.
    handler: Box<dyn MessageHandler>,
    /// Periodic clocks, stopped on close.
    clocks: Vec<Clock>,
    /// Sender into the owning session task.
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionCore {
    /// Returns the session id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Number of client batches accepted.
    #[inline]
    #[must_use]
    pub fn client_send_seq(&self) -> u64 {
        self.client_send_seq
    }

    /// Server-to-client sequence counter.
    #[inline]
    #[must_use]
    pub fn server_send_seq(&self) -> u64 {
        self.server_send_seq
    }

    /// Returns `true` once the session started closing.
    #[inline]
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Returns `true` if debug timeouts are in effect.
    #[inline]
    #[must_use]
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Current inactivity timeout.
    #[inline]
    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    /// Time since the last client activity.
    #[inline]
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Id of the bound connection, if any.
    #[inline]
    #[must_use]
    pub fn bound_connection(&self) -> Option<ConnectionId> {
        self.bound.as_ref().map(|c| c.id())
    }

    /// Records client activity. No effect once closing.
    pub(crate) fn note_activity(&mut self) {
        if !self.closing {
            self.last_activity = Instant::now();
        }
    }

    /// Writes raw bytes to the bound connection, if there is one.
    pub(crate) fn send_bound(&self, bytes: Vec<u8>) -> bool {
        match &self.bound {
            Some(connection) => {
                connection.send(bytes);
                true
            }
            None => false,
        }
    }

    /// Closes every known connection except `keep`.
    pub(crate) fn close_connections(&mut self, keep: Option<ConnectionId>) {
        let mut closed = FxHashMap::default();
        if let Some(bound) = self.bound.take() {
            closed.insert(bound.id(), bound);
        }
        closed.extend(self.connections.drain());
        for (id, connection) in closed {
            if Some(id) != keep {
                connection.close();
            }
        }
    }

    /// Builds a timer callback that posts a tick for this session.
    pub(crate) fn ticker(&self, timer: TimerKind) -> impl FnMut() + Send + 'static {
        let commands = self.commands.clone();
        let session = self.id;
        move || {
            let _ = commands.send(SessionCommand::Tick { session, timer });
        }
    }
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCore")
            .field("id", &self.id)
            .field("client_send_seq", &self.client_send_seq)
            .field("server_send_seq", &self.server_send_seq)
            .field("bound", &self.bound_connection())
            .field("connections", &self.connections.len())
            .field("closing", &self.closing)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Session
// ============================================================================

/// A resumable session with protocol semantics `P`.
pub struct Session<P> {
    pub(crate) core: SessionCore,
    pub(crate) policy: P,
}

impl<P: ReliabilityPolicy> Session<P> {
    /// Creates a session in [`SessionState::Starting`].
    ///
    /// Asks `factory` for the application handler and starts the policy's
    /// clocks. Must be called from within a tokio runtime.
    pub(crate) fn new(
        id: SessionId,
        mut policy: P,
        factory: &dyn MessageHandlerFactory,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        let handler = factory.provide_handler(SessionHandle::new(id, commands.clone()));
        let mut core = SessionCore {
            id,
            client_send_seq: 0,
            server_send_seq: 0,
            bound: None,
            connections: FxHashMap::default(),
            ever_bound: false,
            last_activity: Instant::now(),
            inactivity_timeout: Duration::ZERO,
            debug_mode: false,
            closing: false,
            handler,
            clocks: Vec::new(),
            commands,
        };
        policy.apply_debug_mode(&mut core, false);
        core.clocks = policy.start_clocks(&core);

        info!(session_id = %id, protocol = P::PROTOCOL, "Session created");

        Self { core, policy }
    }

    /// Returns the session id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.core.id
    }

    /// Returns the protocol-independent state.
    #[inline]
    #[must_use]
    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    /// Returns the protocol policy.
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Returns `true` once the session started closing.
    #[inline]
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.core.closing
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.core.closing {
            SessionState::Closed
        } else if self.core.bound.is_some() {
            SessionState::Live
        } else if self.core.ever_bound {
            P::DETACHED_STATE
        } else {
            SessionState::Starting
        }
    }

    /// Records client activity.
    pub fn note_activity(&mut self) {
        self.core.note_activity();
    }

    /// Makes `connection` the bound connection.
    ///
    /// Re-attaching the already bound connection is a no-op.
    pub(crate) fn attach_connection(&mut self, connection: SharedConnection) {
        if self.core.bound_connection() == Some(connection.id()) {
            return;
        }
        self.policy.on_attach(&mut self.core, &connection);
        debug!(
            session_id = %self.core.id,
            connection = %connection.id(),
            protocol = P::PROTOCOL,
            "Connection attached"
        );
        self.core
            .connections
            .insert(connection.id(), Arc::clone(&connection));
        self.core.bound = Some(connection);
        self.core.ever_bound = true;
    }

    /// Removes `connection` from the session.
    ///
    /// Returns `true` if the session knew the connection.
    pub(crate) fn detach_connection(&mut self, connection: ConnectionId) -> bool {
        let known = self.core.connections.remove(&connection).is_some();
        let was_bound = self.core.bound_connection() == Some(connection);
        if was_bound {
            self.core.bound = None;
        }
        if known || was_bound {
            debug!(
                session_id = %self.core.id,
                %connection,
                was_bound,
                "Connection detached"
            );
            self.policy.on_detach(&mut self.core, connection, was_bound);
        }
        known || was_bound
    }

    /// Accepts one client batch.
    ///
    /// `seq` must be exactly one past the number of batches accepted so far.
    /// On success, messages retained up to `ack` are discarded, every
    /// message is passed to the handler in order, and the batch counter
    /// advances by one however many messages the batch held.
    ///
    /// # Errors
    ///
    /// - [`Error::Sequence`] if `seq` is out of order; nothing changes
    /// - [`Error::SessionClosed`] if the session is closing
    pub fn receive_batch(&mut self, seq: u64, ack: Option<u64>, messages: Vec<Value>) -> Result<usize> {
        let expected = self.core.client_send_seq + 1;
        if seq != expected {
            warn!(
                session_id = %self.core.id,
                protocol = P::PROTOCOL,
                expected,
                received = seq,
                "Client sequence mismatch"
            );
            return Err(Error::sequence(expected, seq));
        }
        if self.core.closing {
            return Err(Error::session_closed(self.core.id));
        }

        if let Some(ack) = ack {
            self.policy.discard_acknowledged(ack);
        }
        let count = messages.len();
        for message in messages {
            debug!(session_id = %self.core.id, %message, "->");
            self.core.handler.process_message(message);
        }
        self.core.client_send_seq += 1;
        Ok(count)
    }

    /// Sends a message to the client.
    ///
    /// A [`Delivery::Overflow`] closes the session after the message went out.
    pub fn send(&mut self, payload: impl Into<Payload>) -> Delivery {
        let delivery = self.policy.transmit(&mut self.core, payload.into());
        if delivery == Delivery::Overflow {
            self.close("backlog limit exceeded");
        }
        delivery
    }

    /// Closes the session.
    ///
    /// Stops all clocks, releases the policy's resources, closes
    /// connections and notifies the handler once. Returns `false` if the
    /// session was already closed.
    pub fn close(&mut self, reason: &str) -> bool {
        if self.core.closing {
            return false;
        }
        self.core.closing = true;
        self.core.clocks.clear();
        self.policy.shutdown(&mut self.core);
        self.core.handler.connection_died(reason);

        info!(session_id = %self.core.id, protocol = P::PROTOCOL, reason, "Session closed");
        true
    }

    /// Switches between normal and debug timeouts.
    pub fn set_debug_mode(&mut self, enabled: bool) {
        self.core.debug_mode = enabled;
        self.policy.apply_debug_mode(&mut self.core, enabled);
        debug!(session_id = %self.core.id, enabled, "Debug mode set");
    }
}

impl<P: ReliabilityPolicy + fmt::Debug> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("core", &self.core)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<P: ReliabilityPolicy> fmt::Display for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.core.bound_connection() {
            Some(connection) => write!(f, "{}({},{})", P::PROTOCOL, self.core.id, connection),
            None => write!(f, "{}({},*)", P::PROTOCOL, self.core.id),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::config::{HttpConfig, RtcpConfig};
    use crate::http::BestEffort;
    use crate::rtcp::Retransmit;
    use crate::test_support::{Recorder, RecordingConnection};
    use crate::transport::Connection;

    fn rtcp_session(recorder: &Recorder) -> Session<Retransmit> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Session::new(
            SessionId::from_u64(1),
            Retransmit::new(&RtcpConfig::default()),
            recorder,
            tx,
        )
    }

    fn http_session(recorder: &Recorder) -> Session<BestEffort> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Session::new(
            SessionId::from_u64(2),
            BestEffort::new(&HttpConfig::default()),
            recorder,
            tx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions_rtcp() {
        let recorder = Recorder::default();
        let mut session = rtcp_session(&recorder);
        assert_eq!(session.state(), SessionState::Starting);

        let connection = RecordingConnection::shared();
        session.attach_connection(connection.clone());
        assert_eq!(session.state(), SessionState::Live);

        assert!(session.detach_connection(connection.id()));
        assert_eq!(session.state(), SessionState::Disconnected);

        session.close("test");
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_session_stays_live_without_connection() {
        let recorder = Recorder::default();
        let mut session = http_session(&recorder);
        let connection = RecordingConnection::shared();
        session.attach_connection(connection.clone());
        session.detach_connection(connection.id());
        assert_eq!(session.state(), SessionState::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_mismatch_changes_nothing() {
        let recorder = Recorder::default();
        let mut session = rtcp_session(&recorder);
        session.attach_connection(RecordingConnection::shared());
        session.send(Payload::text("kept"));

        let err = session
            .receive_batch(2, Some(1), vec![json!("dropped")])
            .unwrap_err();
        assert!(matches!(err, Error::Sequence { expected: 1, received: 2 }));
        assert_eq!(session.core().client_send_seq(), 0);
        assert!(recorder.messages().is_empty());
        assert_eq!(session.policy().queue_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_advances_counter_once() {
        let recorder = Recorder::default();
        let mut session = rtcp_session(&recorder);

        let delivered = session
            .receive_batch(1, None, vec![json!(1), json!(2), json!(3)])
            .expect("batch");
        assert_eq!(delivered, 3);
        assert_eq!(session.core().client_send_seq(), 1);
        assert_eq!(recorder.messages(), vec![json!(1), json!(2), json!(3)]);

        session.receive_batch(2, None, vec![json!(4)]).expect("batch");
        assert_eq!(session.core().client_send_seq(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let recorder = Recorder::default();
        let mut session = rtcp_session(&recorder);
        let connection = RecordingConnection::shared();
        session.attach_connection(connection.clone());

        assert!(session.close("first"));
        assert!(!session.close("second"));
        assert_eq!(recorder.deaths(), vec!["first".to_owned()]);
        assert!(connection.is_closed());
        assert_eq!(session.send(Payload::text("late")), Delivery::Dropped);
        assert!(connection.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_rejects_batches() {
        let recorder = Recorder::default();
        let mut session = http_session(&recorder);
        session.close("done");
        let err = session.receive_batch(1, None, vec![json!("x")]).unwrap_err();
        assert!(matches!(err, Error::SessionClosed { .. }));
        assert!(recorder.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debug_mode_switches_timeouts_not_clocks() {
        let recorder = Recorder::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = RtcpConfig::default()
            .with_inactivity_timeout(Duration::from_secs(10))
            .with_debug_inactivity_timeout(Duration::from_secs(1000));
        let mut session = Session::new(
            SessionId::from_u64(3),
            Retransmit::new(&config),
            &recorder,
            tx,
        );
        let period = session.core.clocks[0].period();

        session.set_debug_mode(true);
        assert_eq!(session.core().inactivity_timeout(), Duration::from_secs(1000));
        assert_eq!(session.core.clocks[0].period(), period);
        assert_eq!(period, Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_shows_binding() {
        let recorder = Recorder::default();
        let mut session = rtcp_session(&recorder);
        assert_eq!(session.to_string(), "RTCP(1,*)");
        let connection = RecordingConnection::shared();
        let id = connection.id();
        session.attach_connection(connection);
        assert_eq!(session.to_string(), format!("RTCP(1,{id})"));
    }
}
