use async_trait::async_trait;
use call_engine::signaling::{MessageHandler, SignalType, SignalingEnvelope, SignalingPort};
use call_engine::SignalingError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// In-memory signaling server shared by every engine in a test.
///
/// Envelopes addressed to a registered engine are handed to its handler
/// right away; envelopes for unknown ids are recorded and dropped, which
/// makes those ids behave like peers that never answer.
#[derive(Default)]
pub struct SignalingHub {
    handlers: Mutex<HashMap<String, MessageHandler>>,
    /// Every envelope that was accepted for delivery
    log: Mutex<Vec<SignalingEnvelope>>,
    /// Destinations whose sends fail
    unreachable: Mutex<HashSet<String>>,
}

impl SignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Signaling port for the engine with id `local_id`
    pub fn port(self: &Arc<Self>, local_id: &str) -> Arc<MockSignaling> {
        Arc::new(MockSignaling {
            local_id: local_id.to_string(),
            hub: Arc::clone(self),
        })
    }

    pub fn set_unreachable(&self, id: &str, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    /// Delivers an envelope as if a remote participant had sent it
    pub fn inject(&self, envelope: SignalingEnvelope) {
        let handler = self.handlers.lock().get(&envelope.to).cloned();
        if let Some(handler) = handler {
            handler(envelope);
        }
    }

    /// Envelopes sent from `from` to `to`, oldest first
    pub fn sent_between(&self, from: &str, to: &str) -> Vec<SignalingEnvelope> {
        self.log
            .lock()
            .iter()
            .filter(|e| e.from == from && e.to == to)
            .cloned()
            .collect()
    }

    pub fn types_between(&self, from: &str, to: &str) -> Vec<SignalType> {
        self.sent_between(from, to)
            .iter()
            .map(|e| e.signal_type())
            .collect()
    }

    pub fn count(&self, from: &str, to: &str, signal_type: SignalType) -> usize {
        self.types_between(from, to)
            .into_iter()
            .filter(|t| *t == signal_type)
            .count()
    }

    pub fn count_from(&self, from: &str, signal_type: SignalType) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|e| e.from == from && e.signal_type() == signal_type)
            .count()
    }
}

/// `SignalingPort` of one engine, backed by the shared hub
pub struct MockSignaling {
    local_id: String,
    hub: Arc<SignalingHub>,
}

#[async_trait]
impl SignalingPort for MockSignaling {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        if self.hub.unreachable.lock().contains(&envelope.to) {
            return Err(SignalingError::SendFailed(format!(
                "{} is unreachable",
                envelope.to
            )));
        }
        self.hub.log.lock().push(envelope.clone());
        self.hub.inject(envelope);
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        self.hub
            .handlers
            .lock()
            .insert(self.local_id.clone(), handler);
    }
}
