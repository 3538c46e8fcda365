//! HTTP reliability: best-effort delivery over long polls.
//!
//! Server messages wait in a queue until the client polls with a `select`;
//! a poll that finds the queue empty is held open until a message arrives or
//! the select timeout passes. Nothing is retained after it is written, so a
//! lost reply is lost for good.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::HttpConfig;
use crate::identifiers::ConnectionId;
use crate::message::Payload;
use crate::session::{Delivery, ReliabilityPolicy, Session, SessionCore, SessionState, TimerKind};
use crate::timer::{self, Clock};
use crate::transport::SharedConnection;

use super::framer;

/// An HTTP session.
pub type HttpSession = Session<BestEffort>;

// ============================================================================
// SelectOutcome
// ============================================================================

/// What [`Session::select`] did with a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    /// A reply was written.
    Replied,
    /// The poll is held open.
    Waiting,
    /// The connection was closed without a reply.
    Dropped,
}

// ============================================================================
// BestEffort
// ============================================================================

/// Queue-and-poll policy used by HTTP sessions.
#[derive(Debug)]
pub struct BestEffort {
    /// Messages waiting for a poll.
    queue: VecDeque<Payload>,
    /// Held-open poll, if any.
    downstream: Option<SharedConnection>,
    /// Close the held-open poll's connection after replying.
    non_persistent: bool,
    /// When the held-open poll arrived.
    select_wait_start: Option<Instant>,
    /// Select timeout currently in effect.
    select_timeout: Duration,
    /// Listener configuration.
    config: HttpConfig,
}

impl BestEffort {
    /// Creates the policy for one session.
    #[must_use]
    pub fn new(config: &HttpConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            downstream: None,
            non_persistent: false,
            select_wait_start: None,
            select_timeout: config.select_timeout(false),
            config: config.clone(),
        }
    }

    /// Number of messages waiting for a poll.
    #[inline]
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` while a poll is held open.
    #[inline]
    #[must_use]
    pub fn is_select_waiting(&self) -> bool {
        self.downstream.is_some()
    }

    /// Select timeout currently in effect.
    #[inline]
    #[must_use]
    pub fn select_timeout(&self) -> Duration {
        self.select_timeout
    }

    /// Writes one batch to `connection` and advances the select counter.
    fn write_batch(
        core: &mut SessionCore,
        connection: &SharedConnection,
        messages: &[Payload],
        close_marker: bool,
    ) {
        core.server_send_seq += 1;
        let seqnum = if close_marker {
            framer::CLOSE_SEQNUM
        } else {
            i64::try_from(core.server_send_seq + 1).unwrap_or(i64::MAX)
        };
        debug!(
            session_id = %core.id,
            seqnum,
            count = messages.len(),
            connection = %connection.id(),
            "<- batch"
        );
        connection.send(framer::select_body(seqnum, messages).into_bytes());
    }

    /// Answers the held-open poll, if there is one.
    fn answer_downstream(
        &mut self,
        core: &mut SessionCore,
        messages: &[Payload],
        close_marker: bool,
    ) -> bool {
        let Some(downstream) = self.downstream.take() else {
            return false;
        };
        Self::write_batch(core, &downstream, messages, close_marker);
        if self.non_persistent {
            downstream.close();
        }
        self.non_persistent = false;
        self.select_wait_start = None;
        core.note_activity();
        true
    }
}

impl ReliabilityPolicy for BestEffort {
    const PROTOCOL: &'static str = "HTTP";
    const DETACHED_STATE: SessionState = SessionState::Live;

    fn start_clocks(&self, core: &SessionCore) -> Vec<Clock> {
        vec![
            timer::every(self.config.select_tick_period(), core.ticker(TimerKind::Select)),
            timer::every(
                self.config.inactivity_tick_period(),
                core.ticker(TimerKind::Inactivity),
            ),
        ]
    }

    fn on_attach(&mut self, _core: &mut SessionCore, _connection: &SharedConnection) {}

    fn on_detach(&mut self, core: &mut SessionCore, connection: ConnectionId, _was_bound: bool) {
        if self.downstream.as_ref().is_some_and(|d| d.id() == connection) {
            self.downstream = None;
            self.non_persistent = false;
            self.select_wait_start = None;
            core.note_activity();
            info!(session_id = %core.id, %connection, "Lost pending select");
        }
    }

    fn transmit(&mut self, core: &mut SessionCore, payload: Payload) -> Delivery {
        if core.closing {
            return Delivery::Dropped;
        }
        if self.answer_downstream(core, std::slice::from_ref(&payload), false) {
            Delivery::Sent
        } else {
            trace!(session_id = %core.id, payload = %payload, "Queued for next select");
            self.queue.push_back(payload);
            Delivery::Queued
        }
    }

    fn discard_acknowledged(&mut self, _acked: u64) -> usize {
        0
    }

    fn apply_debug_mode(&mut self, core: &mut SessionCore, enabled: bool) {
        core.inactivity_timeout = self.config.session_timeout(enabled);
        self.select_timeout = self.config.select_timeout(enabled);
    }

    fn shutdown(&mut self, core: &mut SessionCore) {
        let keep = self.downstream.as_ref().map(|d| d.id());
        core.close_connections(keep);
        self.select_wait_start = None;
        if self.downstream.is_some() {
            self.non_persistent = true;
            self.answer_downstream(core, &[], true);
        }
    }
}

// ============================================================================
// HTTP Session Operations
// ============================================================================

impl Session<BestEffort> {
    /// Handles a `select` poll expecting batch `seq`.
    ///
    /// Queued messages go out at once as one batch. With nothing queued the
    /// poll is held open until a message arrives or the select timeout
    /// passes.
    pub fn select(
        &mut self,
        connection: SharedConnection,
        seq: u64,
        non_persistent: bool,
    ) -> SelectOutcome {
        self.core.note_activity();

        let expected = self.core.server_send_seq + 1;
        if seq != expected {
            warn!(session_id = %self.core.id, expected, received = seq, "Select out of sequence");
            connection.send(framer::error_body(framer::SEQUENCE_ERROR).into_bytes());
            return SelectOutcome::Replied;
        }

        if !self.policy.queue.is_empty() {
            let messages: Vec<Payload> = self.policy.queue.drain(..).collect();
            if self
                .policy
                .downstream
                .as_ref()
                .is_some_and(|d| d.id() == connection.id())
            {
                self.policy.downstream = None;
            }
            BestEffort::write_batch(&mut self.core, &connection, &messages, false);
            return SelectOutcome::Replied;
        }

        if self.core.closing {
            connection.close();
            return SelectOutcome::Dropped;
        }

        if let Some(previous) = self.policy.downstream.take()
            && previous.id() != connection.id()
        {
            debug!(session_id = %self.core.id, previous = %previous.id(), "Select superseded");
            previous.close();
        }
        self.policy.downstream = Some(connection);
        self.policy.non_persistent = non_persistent;
        self.policy.select_wait_start = Some(Instant::now());
        SelectOutcome::Waiting
    }

    /// Handles an `xmit` carrying client batch `seq`.
    ///
    /// Returns `true` if a reply was written.
    pub fn xmit(&mut self, connection: &SharedConnection, seq: u64, body: &str) -> bool {
        if self.core.closing {
            connection.close();
            return false;
        }
        self.core.note_activity();

        let format = self.policy.config.message_format;
        let messages = format.unpack(&framer::extract_post_body(body));
        let reply = match self.receive_batch(seq, None, messages) {
            Ok(_) => framer::xmit_body(self.core.client_send_seq + 1),
            Err(e) => {
                debug!(session_id = %self.core.id, error = %e, "xmit rejected");
                framer::error_body(framer::SEQUENCE_ERROR)
            }
        };
        connection.send(reply.into_bytes());
        true
    }

    /// Periodic select check: answers a poll held longer than the select
    /// timeout with an empty batch.
    pub(crate) fn select_tick(&mut self) {
        let Some(start) = self.policy.select_wait_start else {
            return;
        };
        if start.elapsed() > self.policy.select_timeout {
            trace!(session_id = %self.core.id, "Select timed out");
            self.policy.select_wait_start = None;
            self.core.note_activity();
            self.policy.answer_downstream(&mut self.core, &[], false);
        }
    }

    /// Periodic inactivity check: closes a session nobody is polling.
    pub(crate) fn inactivity_tick(&mut self) {
        if self.core.closing || self.policy.select_wait_start.is_some() {
            return;
        }
        let idle = self.core.idle_time();
        if idle > self.core.inactivity_timeout {
            info!(session_id = %self.core.id, ?idle, "Session inactive, closing");
            self.close("session timeout");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
