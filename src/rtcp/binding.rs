//! RTCP request dispatch inside the session task.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RtcpConfig;
use crate::handler::MessageHandlerFactory;
use crate::session::{SessionCommand, SessionRegistry, TimerKind};
use crate::transport::SharedConnection;
use crate::transport::server::Binding;

use super::framer;
use super::request::RtcpRequest;
use super::session::Retransmit;

// ============================================================================
// RtcpBinding
// ============================================================================

/// Maps RTCP requests onto sessions.
pub(crate) struct RtcpBinding {
    registry: SessionRegistry<Retransmit>,
    config: RtcpConfig,
}

impl RtcpBinding {
    pub(crate) fn new(
        config: RtcpConfig,
        factory: Arc<dyn MessageHandlerFactory>,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(factory, commands),
            config,
        }
    }

    /// Writes a reply directly to a connection.
    fn reply(connection: &SharedConnection, line: String) {
        debug!(connection = %connection.id(), reply = line.trim_end(), "<|");
        connection.send(line.into_bytes());
    }

    fn do_start(&mut self, connection: SharedConnection) {
        if self.registry.session_for(connection.id()).is_some() {
            warn!(connection = %connection.id(), "start on connection with a session");
            Self::reply(&connection, framer::error_reply(framer::SESSION_IN_PROGRESS));
            return;
        }
        let id = self
            .registry
            .create(Arc::clone(&connection), Retransmit::new(&self.config));
        info!(session_id = %id, connection = %connection.id(), "RTCP session started");
        Self::reply(&connection, framer::start_reply(id));
    }

    fn do_resume(&mut self, connection: SharedConnection, session_id: &str, client_recv_seq: u64) {
        match self.registry.resume(session_id, Arc::clone(&connection)) {
            Ok(id) => {
                info!(session_id = %id, connection = %connection.id(), "RTCP session resumed");
                self.registry.update(id, |session| {
                    Self::reply(
                        &connection,
                        framer::resume_reply(id, session.core().client_send_seq()),
                    );
                    session.replay_unacknowledged(client_recv_seq);
                });
            }
            Err(e) => {
                warn!(connection = %connection.id(), session_id, error = %e, "Resume refused");
                Self::reply(&connection, framer::error_reply(framer::error_tag(&e)));
            }
        }
    }

    fn do_ack(&mut self, connection: SharedConnection, client_recv_seq: u64) {
        match self.registry.session_for(connection.id()) {
            Some(id) => {
                self.registry
                    .update(id, |session| session.client_ack(client_recv_seq));
            }
            None => {
                warn!(connection = %connection.id(), "ack without a session");
                Self::reply(&connection, framer::error_reply(framer::NO_SESSION));
            }
        }
    }

    fn do_message(
        &mut self,
        connection: SharedConnection,
        client_send_seq: u64,
        client_recv_seq: u64,
        messages: Vec<Value>,
    ) {
        let Some(id) = self.registry.session_for(connection.id()) else {
            warn!(connection = %connection.id(), "Message without a session");
            Self::reply(&connection, framer::error_reply(framer::NO_SESSION));
            return;
        };
        self.registry.update(id, |session| {
            session.note_activity();
            if let Err(e) = session.receive_batch(client_send_seq, Some(client_recv_seq), messages)
                && e.is_sequence_error()
            {
                session.send_control(framer::error_reply(framer::SEQUENCE_ERROR));
            }
        });
    }

    fn do_end(&mut self, connection: SharedConnection) {
        match self.registry.session_for(connection.id()) {
            Some(id) => {
                self.registry
                    .update(id, |session| session.close("session ended by client"));
            }
            None => {
                warn!(connection = %connection.id(), "end without a session");
            }
        }
    }
}

impl Binding for RtcpBinding {
    type Request = RtcpRequest;

    fn handle_request(&mut self, connection: SharedConnection, request: RtcpRequest) {
        debug!(connection = %connection.id(), %request, "|>");

        match request {
            RtcpRequest::Start => self.do_start(connection),
            RtcpRequest::Resume {
                session_id,
                client_recv_seq,
            } => self.do_resume(connection, &session_id, client_recv_seq),
            RtcpRequest::Ack { client_recv_seq } => self.do_ack(connection, client_recv_seq),
            RtcpRequest::Message {
                client_send_seq,
                client_recv_seq,
                messages,
            } => self.do_message(connection, client_send_seq, client_recv_seq, messages),
            RtcpRequest::End { .. } => self.do_end(connection),
            RtcpRequest::Error { message } => {
                warn!(connection = %connection.id(), message, "RTCP error request");
            }
        }
    }

    fn connection_died(&mut self, connection: SharedConnection, reason: &str) {
        match self.registry.dissociate(connection.id()) {
            Some(id) => {
                info!(session_id = %id, connection = %connection.id(), reason, "Connection lost");
            }
            None => {
                debug!(connection = %connection.id(), reason, "Connection without session closed");
            }
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
                    TimerKind::Inactivity => s.inactivity_tick(),
                    TimerKind::Disconnected { epoch } => s.disconnected_timeout_expired(epoch),
                    TimerKind::Select => {}
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

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::identifiers::SessionId;
    use crate::message::Payload;
    use crate::test_support::{Recorder, RecordingConnection};
    use crate::transport::Connection;

    fn binding() -> (RtcpBinding, Recorder, mpsc::UnboundedReceiver<SessionCommand>) {
        binding_with(RtcpConfig::default())
    }

    fn binding_with(
        config: RtcpConfig,
    ) -> (RtcpBinding, Recorder, mpsc::UnboundedReceiver<SessionCommand>) {
        let recorder = Recorder::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let binding = RtcpBinding::new(config, Arc::new(recorder.clone()), tx);
        (binding, recorder, rx)
    }

    fn started(binding: &mut RtcpBinding, connection: &Arc<RecordingConnection>) -> SessionId {
        binding.handle_request(connection.clone(), RtcpRequest::Start);
        let reply = connection.transcript();
        connection.clear();
        reply
            .trim_end()
            .strip_prefix("start ")
            .and_then(|id| id.parse().ok())
            .expect("start reply")
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_in_progress() {
        let (mut binding, _, _rx) = binding();
        let connection = RecordingConnection::shared();
        started(&mut binding, &connection);

        binding.handle_request(connection.clone(), RtcpRequest::Start);
        assert_eq!(connection.transcript(), "error sessionInProgress\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_without_session() {
        let (mut binding, _, _rx) = binding();
        let connection = RecordingConnection::shared();

        binding.handle_request(connection.clone(), RtcpRequest::Ack { client_recv_seq: 0 });
        binding.handle_request(
            connection.clone(),
            RtcpRequest::Message {
                client_send_seq: 1,
                client_recv_seq: 0,
                messages: vec![json!(1)],
            },
        );
        binding.handle_request(connection.clone(), RtcpRequest::End { client_recv_seq: None });
        binding.handle_request(
            connection.clone(),
            RtcpRequest::Resume {
                session_id: "99".to_owned(),
                client_recv_seq: 0,
            },
        );

        assert_eq!(
            connection.sent(),
            vec![
                "error noSession\n".to_owned(),
                "error noSession\n".to_owned(),
                "error noSuchSession\n".to_owned(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_message() {
        let (mut binding, recorder, _rx) = binding();
        let connection = RecordingConnection::shared();
        started(&mut binding, &connection);

        binding.handle_request(
            connection.clone(),
            RtcpRequest::Message {
                client_send_seq: 2,
                client_recv_seq: 0,
                messages: vec![json!("late")],
            },
        );
        assert_eq!(connection.transcript(), "error sequenceError\n");
        assert!(recorder.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_replays_on_new_connection() {
        let (mut binding, _, _rx) = binding();
        let first = RecordingConnection::shared();
        let id = started(&mut binding, &first);

        binding.handle_command(SessionCommand::Send {
            session: id,
            payload: Payload::text("a"),
        });
        binding.handle_command(SessionCommand::Send {
            session: id,
            payload: Payload::text("b"),
        });
        binding.connection_died(first.clone(), "reset");

        let second = RecordingConnection::shared();
        binding.handle_request(
            second.clone(),
            RtcpRequest::Resume {
                session_id: id.to_string(),
                client_recv_seq: 1,
            },
        );
        assert_eq!(second.transcript(), format!("resume {id} 0\n2 0\nb\n\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflowed_session_is_gone() {
        let (mut binding, recorder, _rx) = binding_with(RtcpConfig::default().with_backlog_limit(8));
        let first = RecordingConnection::shared();
        let id = started(&mut binding, &first);

        for text in ["12345", "6789"] {
            binding.handle_command(SessionCommand::Send {
                session: id,
                payload: Payload::text(text),
            });
        }
        assert!(first.is_closed());
        assert_eq!(recorder.deaths(), vec!["backlog limit exceeded".to_owned()]);
        assert!(binding.registry.get(id).is_none());
        assert_eq!(binding.registry.session_for(first.id()), None);

        let second = RecordingConnection::shared();
        binding.handle_request(
            second.clone(),
            RtcpRequest::Resume {
                session_id: id.to_string(),
                client_recv_seq: 0,
            },
        );
        assert_eq!(second.transcript(), "error noSuchSession\n");

        binding.handle_request(second.clone(), RtcpRequest::Ack { client_recv_seq: 1 });
        assert_eq!(second.sent().last().map(String::as_str), Some("error noSession\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_closes_session() {
        let (mut binding, recorder, _rx) = binding();
        let connection = RecordingConnection::shared();
        let id = started(&mut binding, &connection);

        binding.handle_request(connection.clone(), RtcpRequest::End { client_recv_seq: None });
        assert!(connection.is_closed());
        assert_eq!(recorder.deaths(), vec!["session ended by client".to_owned()]);
        assert!(binding.registry.get(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let (mut binding, recorder, _rx) = binding();
        let connection = RecordingConnection::shared();
        started(&mut binding, &connection);

        binding.shutdown();
        assert!(connection.is_closed());
        assert_eq!(recorder.deaths().len(), 1);
        assert!(binding.registry.is_empty());
    }
}
