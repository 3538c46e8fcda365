//! In-memory doubles for session tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::handler::{MessageHandler, MessageHandlerFactory, SessionHandle};
use crate::identifiers::ConnectionId;
use crate::transport::Connection;

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// RecordingConnection
// ============================================================================

/// Connection that keeps everything sent to it.
#[derive(Debug)]
pub(crate) struct RecordingConnection {
    id: ConnectionId,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl RecordingConnection {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Everything sent so far, one entry per send.
    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Everything sent so far, concatenated.
    pub(crate) fn transcript(&self) -> String {
        self.sent.lock().concat()
    }

    /// Forgets what was sent so far.
    pub(crate) fn clear(&self) {
        self.sent.lock().clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, bytes: Vec<u8>) {
        if !self.is_closed() {
            self.sent
                .lock()
                .push(String::from_utf8_lossy(&bytes).into_owned());
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// Handler factory whose handlers log into one shared place.
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder {
    messages: Arc<Mutex<Vec<Value>>>,
    deaths: Arc<Mutex<Vec<String>>>,
    handles: Arc<Mutex<Vec<SessionHandle>>>,
}

impl Recorder {
    pub(crate) fn messages(&self) -> Vec<Value> {
        self.messages.lock().clone()
    }

    pub(crate) fn deaths(&self) -> Vec<String> {
        self.deaths.lock().clone()
    }

    /// Handle of the `n`th session created, in creation order.
    pub(crate) fn handle(&self, n: usize) -> Option<SessionHandle> {
        self.handles.lock().get(n).cloned()
    }
}

struct RecordingHandler {
    messages: Arc<Mutex<Vec<Value>>>,
    deaths: Arc<Mutex<Vec<String>>>,
}

impl MessageHandler for RecordingHandler {
    fn process_message(&mut self, message: Value) {
        self.messages.lock().push(message);
    }

    fn connection_died(&mut self, reason: &str) {
        self.deaths.lock().push(reason.to_owned());
    }
}

impl MessageHandlerFactory for Recorder {
    fn provide_handler(&self, session: SessionHandle) -> Box<dyn MessageHandler> {
        self.handles.lock().push(session);
        Box::new(RecordingHandler {
            messages: Arc::clone(&self.messages),
            deaths: Arc::clone(&self.deaths),
        })
    }
}
