//! RTCP reliability: retransmission queue, acks, replay and grace period.
//!
//! Every outbound message is numbered and retained until the client
//! acknowledges it. When the bound connection dies the session waits for a
//! `resume` during the disconnected grace period and then replays whatever
//! is still unacknowledged, with the original sequence numbers.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::RtcpConfig;
use crate::identifiers::ConnectionId;
use crate::message::Payload;
use crate::session::{Delivery, ReliabilityPolicy, Session, SessionCore, SessionState, TimerKind};
use crate::timer::{self, Clock, Timeout};
use crate::transport::SharedConnection;

use super::framer;

/// An RTCP session.
pub type RtcpSession = Session<Retransmit>;

// ============================================================================
// PendingMessage
// ============================================================================

/// An outbound message awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Server-assigned sequence number.
    pub seq: u64,
    /// The message.
    pub payload: Payload,
}

// ============================================================================
// Retransmit
// ============================================================================

/// Full-retransmission policy used by RTCP sessions.
#[derive(Debug)]
pub struct Retransmit {
    /// Unacknowledged messages, ascending by sequence number.
    queue: VecDeque<PendingMessage>,
    /// Sum of payload sizes in `queue`.
    backlog_bytes: usize,
    /// Backlog size that closes the session.
    backlog_limit: usize,
    /// Grace period currently in effect.
    disconnected_timeout: Duration,
    /// Pending grace timer, while disconnected.
    grace: Option<Timeout>,
    /// Counts disconnections, to discard stale grace ticks.
    epoch: u64,
    /// Listener configuration.
    config: RtcpConfig,
}

impl Retransmit {
    /// Creates the policy for one session.
    #[must_use]
    pub fn new(config: &RtcpConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            backlog_bytes: 0,
            backlog_limit: config.backlog_limit,
            disconnected_timeout: config.disconnected_timeout(false),
            grace: None,
            epoch: 0,
            config: config.clone(),
        }
    }

    /// Number of unacknowledged messages.
    #[inline]
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Total size of unacknowledged messages in bytes.
    #[inline]
    #[must_use]
    pub fn backlog_bytes(&self) -> usize {
        self.backlog_bytes
    }

    /// Unacknowledged messages, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PendingMessage> {
        self.queue.iter()
    }

    /// Grace period currently in effect.
    #[inline]
    #[must_use]
    pub fn disconnected_timeout(&self) -> Duration {
        self.disconnected_timeout
    }

    /// Returns `true` while a grace timer is armed.
    #[inline]
    #[must_use]
    pub fn grace_pending(&self) -> bool {
        self.grace.as_ref().is_some_and(Timeout::is_pending)
    }

    fn cancel_grace(&mut self) {
        if let Some(mut grace) = self.grace.take() {
            grace.cancel();
        }
    }
}

impl ReliabilityPolicy for Retransmit {
    const PROTOCOL: &'static str = "RTCP";
    const DETACHED_STATE: SessionState = SessionState::Disconnected;

    fn start_clocks(&self, core: &SessionCore) -> Vec<Clock> {
        vec![timer::every(
            self.config.inactivity_tick_period(),
            core.ticker(TimerKind::Inactivity),
        )]
    }

    fn on_attach(&mut self, core: &mut SessionCore, connection: &SharedConnection) {
        self.cancel_grace();
        if let Some(previous) = core.bound.take() {
            debug!(
                session_id = %core.id,
                previous = %previous.id(),
                next = %connection.id(),
                "Replacing bound connection"
            );
            core.connections.remove(&previous.id());
            previous.close();
        }
    }

    fn on_detach(&mut self, core: &mut SessionCore, connection: ConnectionId, was_bound: bool) {
        if !was_bound || core.closing {
            return;
        }
        core.note_activity();
        self.epoch += 1;
        let epoch = self.epoch;
        self.grace = Some(timer::after(
            self.disconnected_timeout,
            core.ticker(TimerKind::Disconnected { epoch }),
        ));
        info!(
            session_id = %core.id,
            %connection,
            grace = ?self.disconnected_timeout,
            "Lost connection, awaiting resume"
        );
    }

    fn transmit(&mut self, core: &mut SessionCore, payload: Payload) -> Delivery {
        if core.closing {
            return Delivery::Dropped;
        }

        core.server_send_seq += 1;
        let seq = core.server_send_seq;
        let frame = framer::message_reply(seq, core.client_send_seq, &payload);
        debug!(session_id = %core.id, seq, payload = %payload, "<-");

        self.backlog_bytes += payload.len();
        self.queue.push_back(PendingMessage { seq, payload });
        let sent = core.send_bound(frame.into_bytes());

        if self.backlog_bytes > self.backlog_limit {
            warn!(
                session_id = %core.id,
                backlog = self.backlog_bytes,
                limit = self.backlog_limit,
                "Backlog limit exceeded"
            );
            Delivery::Overflow
        } else if sent {
            Delivery::Sent
        } else {
            Delivery::Queued
        }
    }

    fn discard_acknowledged(&mut self, acked: u64) -> usize {
        let mut discarded = 0;
        while let Some(front) = self.queue.front()
            && front.seq <= acked
        {
            if let Some(message) = self.queue.pop_front() {
                self.backlog_bytes -= message.payload.len();
                discarded += 1;
            }
        }
        discarded
    }

    fn apply_debug_mode(&mut self, core: &mut SessionCore, enabled: bool) {
        core.inactivity_timeout = self.config.inactivity_timeout(enabled);
        self.disconnected_timeout = self.config.disconnected_timeout(enabled);
    }

    fn shutdown(&mut self, core: &mut SessionCore) {
        self.cancel_grace();
        core.close_connections(None);
    }
}

// ============================================================================
// RTCP Session Operations
// ============================================================================

impl Session<Retransmit> {
    /// Handles a client `ack`.
    ///
    /// Discards acknowledged messages. If the client had been silent for
    /// more than a quarter of the inactivity timeout, answers with an `ack`
    /// of its own so the client sees the server is alive.
    pub fn client_ack(&mut self, client_recv_seq: u64) {
        let idle = self.core.idle_time();
        self.core.note_activity();
        let discarded = self.policy.discard_acknowledged(client_recv_seq);
        trace!(session_id = %self.core.id, client_recv_seq, discarded, "Client ack");

        if idle > self.core.inactivity_timeout / 4 {
            self.send_control(framer::ack_reply(self.core.client_send_seq));
        }
    }

    /// Retransmits unacknowledged messages after a resume.
    ///
    /// Messages up to `client_recv_seq` are discarded first. The rest go out
    /// in order with their original sequence numbers. Returns how many were
    /// sent.
    pub fn replay_unacknowledged(&mut self, client_recv_seq: u64) -> usize {
        self.policy.discard_acknowledged(client_recv_seq);
        let client_send_seq = self.core.client_send_seq;
        let mut replayed = 0;
        for message in &self.policy.queue {
            let frame = framer::message_reply(message.seq, client_send_seq, &message.payload);
            if !self.core.send_bound(frame.into_bytes()) {
                break;
            }
            replayed += 1;
        }
        if replayed > 0 {
            info!(session_id = %self.core.id, replayed, "Replayed unacknowledged messages");
        }
        replayed
    }

    /// Periodic inactivity check.
    ///
    /// Closes the session after a full timeout of silence; after half of
    /// one, sends an `ack` to provoke client traffic.
    pub(crate) fn inactivity_tick(&mut self) {
        if self.core.closing {
            return;
        }
        let idle = self.core.idle_time();
        let limit = self.core.inactivity_timeout;
        if idle > limit {
            info!(session_id = %self.core.id, ?idle, "Session inactive, closing");
            self.close("session timeout");
        } else if idle > limit / 2 {
            debug!(session_id = %self.core.id, ?idle, "Session idle, sending ack");
            self.send_control(framer::ack_reply(self.core.client_send_seq));
        }
    }

    /// Grace timer expiry for the disconnection numbered `epoch`.
    pub(crate) fn disconnected_timeout_expired(&mut self, epoch: u64) {
        if epoch != self.policy.epoch || self.core.closing || self.core.bound.is_some() {
            return;
        }
        info!(session_id = %self.core.id, "No resume within grace period, closing");
        self.close("disconnected session timeout");
    }

    /// Writes a control line to the bound connection only.
    ///
    /// Control lines are not numbered and never retransmitted.
    pub fn send_control(&mut self, line: String) -> bool {
        if self.core.closing {
            return false;
        }
        self.core.send_bound(line.into_bytes())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::identifiers::SessionId;
    use crate::session::SessionCommand;
    use crate::test_support::{Recorder, RecordingConnection};
    use crate::transport::Connection;

    fn session_with(
        config: &RtcpConfig,
        recorder: &Recorder,
    ) -> (RtcpSession, mpsc::UnboundedReceiver<SessionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(SessionId::from_u64(7), Retransmit::new(config), recorder, tx);
        (session, rx)
    }

    async fn next_grace_tick(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> u64 {
        loop {
            match rx.recv().await {
                Some(SessionCommand::Tick {
                    timer: TimerKind::Disconnected { epoch },
                    ..
                }) => return epoch,
                Some(_) => continue,
                None => panic!("command channel closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_message_send_ack() {
        let recorder = Recorder::default();
        let (mut session, _rx) = session_with(&RtcpConfig::default(), &recorder);
        let connection = RecordingConnection::shared();
        session.attach_connection(connection.clone());

        session
            .receive_batch(1, Some(0), vec![json!("hello")])
            .expect("batch");
        assert_eq!(recorder.messages(), vec![json!("hello")]);
        assert_eq!(session.core().client_send_seq(), 1);

        assert_eq!(session.send(Payload::text("world")), Delivery::Sent);
        assert_eq!(connection.transcript(), "1 1\nworld\n\n");
        assert_eq!(session.policy().queue_len(), 1);

        session.client_ack(1);
        assert_eq!(session.policy().queue_len(), 0);
        assert_eq!(session.policy().backlog_bytes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_queue_while_disconnected() {
        let recorder = Recorder::default();
        let (mut session, _rx) = session_with(&RtcpConfig::default(), &recorder);
        let connection = RecordingConnection::shared();
        session.attach_connection(connection.clone());
        session.detach_connection(connection.id());

        assert_eq!(session.send(Payload::text("a")), Delivery::Queued);
        assert_eq!(session.send(Payload::text("bb")), Delivery::Queued);
        assert_eq!(session.policy().backlog_bytes(), 3);
        assert!(connection.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_after_resume_keeps_sequence_numbers() {
        let recorder = Recorder::default();
        let (mut session, _rx) = session_with(&RtcpConfig::default(), &recorder);
        let first = RecordingConnection::shared();
        session.attach_connection(first.clone());
        session.receive_batch(1, None, vec![json!("x")]).expect("batch");
        for text in ["one", "two", "three"] {
            session.send(Payload::text(text));
        }
        session.detach_connection(first.id());

        let second = RecordingConnection::shared();
        session.attach_connection(second.clone());
        let replayed = session.replay_unacknowledged(1);

        assert_eq!(replayed, 2);
        assert_eq!(second.transcript(), "2 1\ntwo\n\n3 1\nthree\n\n");
        assert_eq!(session.core().client_send_seq(), 1);
        let seqs: Vec<u64> = session.policy().pending().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_replaces_bound_connection() {
        let recorder = Recorder::default();
        let (mut session, _rx) = session_with(&RtcpConfig::default(), &recorder);
        let first = RecordingConnection::shared();
        let second = RecordingConnection::shared();
        session.attach_connection(first.clone());
        session.attach_connection(second.clone());

        assert!(first.is_closed());
        assert_eq!(session.core().bound_connection(), Some(second.id()));
        assert!(!session.core().connections.contains_key(&first.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_overflow_closes_after_delivery() {
        let recorder = Recorder::default();
        let config = RtcpConfig::default().with_backlog_limit(8);
        let (mut session, _rx) = session_with(&config, &recorder);
        let connection = RecordingConnection::shared();
        session.attach_connection(connection.clone());

        assert_eq!(session.send(Payload::text("12345")), Delivery::Sent);
        assert_eq!(session.send(Payload::text("6789")), Delivery::Overflow);

        assert!(session.is_closing());
        assert_eq!(connection.sent().len(), 2);
        assert!(connection.is_closed());
        assert_eq!(recorder.deaths(), vec!["backlog limit exceeded".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_after_quiet_period_is_answered() {
        let recorder = Recorder::default();
        let config = RtcpConfig::default().with_inactivity_timeout(Duration::from_secs(40));
        let (mut session, _rx) = session_with(&config, &recorder);
        let connection = RecordingConnection::shared();
        session.attach_connection(connection.clone());

        session.client_ack(0);
        assert!(connection.sent().is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        session.client_ack(0);
        assert_eq!(connection.sent(), vec!["ack 0\n".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_tick() {
        let recorder = Recorder::default();
        let config = RtcpConfig::default().with_inactivity_timeout(Duration::from_secs(20));
        let (mut session, _rx) = session_with(&config, &recorder);
        let connection = RecordingConnection::shared();
        session.attach_connection(connection.clone());

        tokio::time::advance(Duration::from_secs(5)).await;
        session.inactivity_tick();
        assert!(connection.sent().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        session.inactivity_tick();
        assert_eq!(connection.sent(), vec!["ack 0\n".to_owned()]);

        tokio::time::advance(Duration::from_secs(10)).await;
        session.inactivity_tick();
        assert!(session.is_closing());
        assert_eq!(recorder.deaths(), vec!["session timeout".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_grace_period_expires() {
        let recorder = Recorder::default();
        let config = RtcpConfig::default().with_disconnected_timeout(Duration::from_secs(5));
        let (mut session, mut rx) = session_with(&config, &recorder);
        let connection = RecordingConnection::shared();
        session.attach_connection(connection.clone());

        session.detach_connection(connection.id());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.policy().grace_pending());

        let epoch = next_grace_tick(&mut rx).await;
        session.disconnected_timeout_expired(epoch);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            recorder.deaths(),
            vec!["disconnected session timeout".to_owned()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_cancels_grace_period() {
        let recorder = Recorder::default();
        let (mut session, _rx) = session_with(&RtcpConfig::default(), &recorder);
        let first = RecordingConnection::shared();
        session.attach_connection(first.clone());
        session.detach_connection(first.id());
        let stale = session.policy.epoch;

        session.attach_connection(RecordingConnection::shared());
        assert!(!session.policy().grace_pending());

        session.disconnected_timeout_expired(stale);
        assert_eq!(session.state(), SessionState::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debug_mode_switches_grace_period() {
        let recorder = Recorder::default();
        let config = RtcpConfig::default()
            .with_disconnected_timeout(Duration::from_secs(30))
            .with_debug_disconnected_timeout(Duration::from_secs(300));
        let (mut session, _rx) = session_with(&config, &recorder);
        session.set_debug_mode(true);
        assert_eq!(session.policy().disconnected_timeout(), Duration::from_secs(300));
        session.set_debug_mode(false);
        assert_eq!(session.policy().disconnected_timeout(), Duration::from_secs(30));
    }

    fn with_runtime<R>(f: impl FnOnce() -> R) -> R {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        let _guard = runtime.enter();
        f()
    }

    proptest! {
        #[test]
        fn test_sequence_numbers_are_dense(sizes in prop::collection::vec(0usize..64, 1..40)) {
            with_runtime(|| {
                let recorder = Recorder::default();
                let config = RtcpConfig::default().with_backlog_limit(usize::MAX);
                let (mut session, _rx) = session_with(&config, &recorder);
                for size in &sizes {
                    session.send(Payload::text("x".repeat(*size)));
                }
                let seqs: Vec<u64> = session.policy().pending().map(|m| m.seq).collect();
                let expected: Vec<u64> = (1..=sizes.len() as u64).collect();
                prop_assert_eq!(seqs, expected);
                Ok(())
            })?;
        }

        #[test]
        fn test_discard_keeps_exact_backlog(
            sizes in prop::collection::vec(0usize..64, 0..40),
            acked in 0u64..50,
        ) {
            with_runtime(|| {
                let recorder = Recorder::default();
                let config = RtcpConfig::default().with_backlog_limit(usize::MAX);
                let (mut session, _rx) = session_with(&config, &recorder);
                for size in &sizes {
                    session.send(Payload::text("x".repeat(*size)));
                }
                let total: usize = sizes.iter().sum();
                prop_assert_eq!(session.policy().backlog_bytes(), total);

                let discarded = session.policy.discard_acknowledged(acked);
                let expected_discarded = sizes.len().min(acked as usize);
                prop_assert_eq!(discarded, expected_discarded);
                prop_assert!(session.policy().pending().all(|m| m.seq > acked));
                let remaining: usize = sizes[expected_discarded..].iter().sum();
                prop_assert_eq!(session.policy().backlog_bytes(), remaining);
                Ok(())
            })?;
        }

        #[test]
        fn test_overflow_closes_exactly_when_limit_passed(
            sizes in prop::collection::vec(1usize..32, 1..30),
            limit in 1usize..256,
        ) {
            with_runtime(|| {
                let recorder = Recorder::default();
                let config = RtcpConfig::default().with_backlog_limit(limit);
                let (mut session, _rx) = session_with(&config, &recorder);
                let mut total = 0;
                for size in &sizes {
                    let delivery = session.send(Payload::text("x".repeat(*size)));
                    if total > limit {
                        prop_assert_eq!(delivery, Delivery::Dropped);
                        continue;
                    }
                    total += size;
                    if total > limit {
                        prop_assert_eq!(delivery, Delivery::Overflow);
                        prop_assert!(session.is_closing());
                    } else {
                        prop_assert_eq!(delivery, Delivery::Queued);
                        prop_assert_eq!(session.policy().backlog_bytes(), total);
                    }
                }
                Ok(())
            })?;
        }
    }
}
