//! Event bus consumed by the UI layer
//!
//! Events are queued and dispatched in emission order to every registered
//! observer. An emission from inside a handler is appended to the queue
//! and delivered after the current event has reached all observers. A
//! panicking handler is logged and skipped; the remaining handlers still
//! receive the event.
//!
//! Every event is mirrored onto a `tokio::sync::broadcast` channel for
//! async consumers.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{CallEngineError, ErrorKind};
use crate::media::{DeviceList, TrackKind};
use crate::session::{MediaKind, Participant, ParticipantId, Session, SessionId, SessionKind};

// ============================================================================
// EVENTS
// ============================================================================

/// Events emitted by the call engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CallEvent {
    SessionInitiated(Session),
    SessionJoined(Session),
    /// Roster or connection quality changed
    SessionUpdated(Session),
    SessionEnded {
        session_id: SessionId,
    },
    ParticipantAdded(Participant),
    ParticipantRemoved {
        participant_id: ParticipantId,
    },
    ScreenShareStarted {
        participant_id: ParticipantId,
    },
    ScreenShareStopped {
        participant_id: ParticipantId,
    },
    RecordingStarted {
        session_id: SessionId,
    },
    RecordingStopped {
        session_id: SessionId,
    },
    MediaDevicesUpdated(DeviceList),
    RemoteStreamAdded {
        participant_id: ParticipantId,
        stream_id: String,
        track_kind: TrackKind,
    },
    /// Offer for an unknown session while idle
    IncomingCall {
        session_id: SessionId,
        from: ParticipantId,
        kind: SessionKind,
        media_kind: MediaKind,
    },
    /// The caller withdrew before the invitation was answered
    IncomingCallCancelled {
        session_id: SessionId,
        from: ParticipantId,
    },
    Error {
        kind: ErrorKind,
        detail: String,
    },
}

impl CallEvent {
    pub fn error(err: &CallEngineError) -> Self {
        CallEvent::Error {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

// ============================================================================
// EVENT BUS
// ============================================================================

pub type EventHandler = Arc<dyn Fn(&CallEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<CallEvent>,
    draining: bool,
}

pub struct EventBus {
    handlers: RwLock<Vec<(SubscriptionId, EventHandler)>>,
    queue: Mutex<DispatchQueue>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            handlers: RwLock::new(Vec::new()),
            queue: Mutex::new(DispatchQueue::default()),
            next_id: AtomicU64::new(1),
            event_tx,
        }
    }

    /// Registers a synchronous observer
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Receiver for async consumers
    pub fn subscribe_channel(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        {
            let mut queue = self.queue.lock();
            queue.pending.push_back(event);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        loop {
            let next = {
                let mut queue = self.queue.lock();
                match queue.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.dispatch(&next);
            let _ = self.event_tx.send(next);
        }
    }

    pub fn emit_error(&self, err: &CallEngineError) {
        self.emit(CallEvent::error(err));
    }

    fn dispatch(&self, event: &CallEvent) {
        // Snapshot so handlers may (un)subscribe while being called
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!("Event handler panicked while handling {:?}", event);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}
