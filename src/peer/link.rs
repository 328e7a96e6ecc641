//! Peer link - one negotiated connection to one remote participant
//!
//! Negotiation rules:
//! - one local offer in flight at a time; a second offer waits until the
//!   first is answered or times out
//! - remote ICE candidates are queued until a remote description is set
//! - on offer collision the participant with the lexicographically lower
//!   id rolls back and answers, then re-offers its own changes
//! - signaling for the link leaves in order (offer before its candidates)

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, OwnedMutexGuard};

use super::transport::{
    PeerTransport, PeerTransportFactory, SessionDescription, TransportEvent, TransportState,
};
use crate::config::RetryPolicy;
use crate::error::CallEngineError;
use crate::media::{AttachGuard, MediaHandle, TrackId, TrackKind};
use crate::session::{
    ConnectionQuality, MediaKind, ParticipantId, SessionContext, SessionId, SessionKind,
};
use crate::signaling::{
    send_with_retry, AnswerPayload, IceCandidate, OfferPayload, SignalMessage, SignalingEnvelope,
    SignalingPort,
};

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Renegotiating,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Reported to the owner of the link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Negotiated {
        participant_id: ParticipantId,
    },
    QualityChanged {
        participant_id: ParticipantId,
        quality: ConnectionQuality,
    },
    RemoteTrack {
        participant_id: ParticipantId,
        track_id: String,
        stream_id: String,
        kind: TrackKind,
    },
    Failed {
        participant_id: ParticipantId,
        error: CallEngineError,
    },
}

/// Session-wide settings shared by every link of a session
pub struct LinkContext {
    pub local_id: ParticipantId,
    pub session_id: SessionId,
    pub session_kind: SessionKind,
    pub media_kind: MediaKind,
    pub context: Option<SessionContext>,
    /// Advertised in offers so invitees can complete the mesh
    pub roster: RwLock<Vec<ParticipantId>>,
    pub signaling: Arc<dyn SignalingPort>,
    pub retry: RetryPolicy,
    pub negotiation_timeout: Duration,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

impl std::fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkContext")
            .field("local_id", &self.local_id)
            .field("session_id", &self.session_id)
            .field("session_kind", &self.session_kind)
            .field("media_kind", &self.media_kind)
            .finish()
    }
}

struct LinkInner {
    state: LinkState,
    negotiation: NegotiationState,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    attached: HashMap<TrackId, AttachGuard>,
    /// Held from sending an offer until its answer or timeout
    offer_guard: Option<OwnedMutexGuard<()>>,
    offer_generation: u64,
    renegotiation_pending: bool,
    quality: ConnectionQuality,
}

// ============================================================================
// PEER LINK
// ============================================================================

pub struct PeerLink {
    participant_id: ParticipantId,
    ctx: Arc<LinkContext>,
    transport: Arc<dyn PeerTransport>,
    inner: Mutex<LinkInner>,
    offer_lock: Arc<AsyncMutex<()>>,
    signal_lock: AsyncMutex<()>,
    inbox: mpsc::UnboundedSender<SignalMessage>,
    closed: watch::Sender<bool>,
}

impl PeerLink {
    /// Creates the transport and starts the link's driver task
    pub async fn connect(
        participant_id: impl Into<ParticipantId>,
        ctx: Arc<LinkContext>,
        factory: &dyn PeerTransportFactory,
    ) -> Result<Arc<Self>, CallEngineError> {
        let participant_id = participant_id.into();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = factory.create(&participant_id, transport_tx).await?;

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (closed, closed_rx) = watch::channel(false);

        let link = Arc::new(Self {
            participant_id,
            ctx,
            transport,
            inner: Mutex::new(LinkInner {
                state: LinkState::Idle,
                negotiation: NegotiationState::Stable,
                remote_description_set: false,
                pending_candidates: Vec::new(),
                attached: HashMap::new(),
                offer_guard: None,
                offer_generation: 0,
                renegotiation_pending: false,
                quality: ConnectionQuality::Connecting,
            }),
            offer_lock: Arc::new(AsyncMutex::new(())),
            signal_lock: AsyncMutex::new(()),
            inbox,
            closed,
        });

        tokio::spawn(Self::drive(
            Arc::downgrade(&link),
            inbox_rx,
            transport_rx,
            closed_rx,
        ));

        Ok(link)
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.inner.lock().negotiation
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.inner.lock().quality
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    /// Number of local tracks currently sent on this link
    pub fn attached_tracks(&self) -> usize {
        self.inner.lock().attached.len()
    }

    /// Queues a negotiation message for the driver task
    pub fn deliver(&self, message: SignalMessage) {
        if self.inbox.send(message).is_err() {
            tracing::debug!("Link to {} is gone, dropping message", self.participant_id);
        }
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    /// Sends a new offer. Waits while another local offer is unanswered.
    pub async fn create_offer(self: &Arc<Self>) -> Result<(), CallEngineError> {
        let offer_guard = self
            .until_closed(Arc::clone(&self.offer_lock).lock_owned())
            .await?;
        let _signal = self.until_closed(self.signal_lock.lock()).await?;

        {
            let mut inner = self.inner.lock();
            inner.state = match inner.state {
                LinkState::Idle => LinkState::Offering,
                LinkState::Connected => LinkState::Renegotiating,
                LinkState::Closed => return Err(CallEngineError::Cancelled),
                other => {
                    return Err(CallEngineError::InvalidState(format!(
                        "cannot offer to {} while {:?}",
                        self.participant_id, other
                    )))
                }
            };
            inner.renegotiation_pending = false;
        }

        tracing::debug!("Creating offer for {}", self.participant_id);
        let offer = match self.until_closed(self.transport.create_offer()).await? {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(e.into()).await),
        };

        let generation = {
            let mut inner = self.inner.lock();
            if inner.state == LinkState::Closed {
                return Err(CallEngineError::Cancelled);
            }
            inner.negotiation = NegotiationState::HaveLocalOffer;
            if inner.state == LinkState::Offering {
                inner.state = LinkState::AwaitingAnswer;
            }
            inner.offer_generation += 1;
            inner.offer_guard = Some(offer_guard);
            inner.offer_generation
        };

        let payload = OfferPayload {
            sdp: offer.sdp,
            session_kind: self.ctx.session_kind,
            media_kind: self.ctx.media_kind,
            participants: self.ctx.roster.read().clone(),
            context: self.ctx.context.clone(),
        };
        self.send(SignalMessage::Offer(payload)).await?;
        self.arm_answer_timeout(generation);
        Ok(())
    }

    /// Applies a remote offer and answers it, resolving collisions
    pub async fn apply_remote_offer(self: &Arc<Self>, sdp: String) -> Result<(), CallEngineError> {
        let _signal = self.until_closed(self.signal_lock.lock()).await?;

        let collision = {
            let mut inner = self.inner.lock();
            match inner.state {
                LinkState::Closed => return Err(CallEngineError::Cancelled),
                _ if inner.negotiation == NegotiationState::HaveLocalOffer => true,
                LinkState::Idle => {
                    inner.state = LinkState::Answering;
                    false
                }
                LinkState::Connected => {
                    inner.state = LinkState::Renegotiating;
                    false
                }
                other => {
                    return Err(CallEngineError::InvalidState(format!(
                        "unexpected offer from {} while {:?}",
                        self.participant_id, other
                    )))
                }
            }
        };

        if collision {
            if !self.yields_on_collision() {
                tracing::debug!(
                    "Offer collision with {}: keeping local offer",
                    self.participant_id
                );
                return Ok(());
            }

            tracing::debug!(
                "Offer collision with {}: rolling back local offer",
                self.participant_id
            );
            if let Err(e) = self.transport.rollback().await {
                return Err(self.fail(e.into()).await);
            }

            let released = {
                let mut inner = self.inner.lock();
                inner.negotiation = NegotiationState::Stable;
                inner.offer_generation += 1;
                inner.renegotiation_pending = true;
                if inner.state == LinkState::AwaitingAnswer {
                    inner.state = LinkState::Answering;
                }
                inner.offer_guard.take()
            };
            drop(released);
        }

        self.inner.lock().negotiation = NegotiationState::HaveRemoteOffer;

        if let Err(e) = self
            .transport
            .set_remote_description(SessionDescription::offer(sdp))
            .await
        {
            return Err(self.fail(e.into()).await);
        }
        self.flush_pending_candidates().await;

        let answer = match self.transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(e.into()).await),
        };
        self.send(SignalMessage::Answer(AnswerPayload { sdp: answer.sdp }))
            .await?;

        self.mark_negotiated();
        Ok(())
    }

    /// Applies the answer to our outstanding offer; stale answers are ignored
    pub async fn apply_remote_answer(
        self: &Arc<Self>,
        sdp: String,
    ) -> Result<(), CallEngineError> {
        {
            let inner = self.inner.lock();
            if inner.state == LinkState::Closed {
                return Err(CallEngineError::Cancelled);
            }
            if inner.negotiation != NegotiationState::HaveLocalOffer {
                tracing::debug!("Ignoring unexpected answer from {}", self.participant_id);
                return Ok(());
            }
        }

        if let Err(e) = self
            .transport
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            return Err(self.fail(e.into()).await);
        }
        self.flush_pending_candidates().await;

        self.mark_negotiated();
        Ok(())
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        {
            let mut inner = self.inner.lock();
            if inner.state == LinkState::Closed {
                return;
            }
            if !inner.remote_description_set {
                inner.pending_candidates.push(candidate);
                return;
            }
        }

        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            tracing::warn!("Rejected candidate from {}: {}", self.participant_id, e);
        }
    }

    /// Offers again if connected; otherwise after the current exchange
    pub async fn renegotiate(self: &Arc<Self>) {
        let ready = {
            let mut inner = self.inner.lock();
            match inner.state {
                LinkState::Connected => true,
                // The first offer or answer carries the tracks
                LinkState::Idle | LinkState::Closed => false,
                _ => {
                    inner.renegotiation_pending = true;
                    false
                }
            }
        };

        if ready {
            if let Err(e) = self.create_offer().await {
                tracing::debug!("Renegotiation with {} failed: {}", self.participant_id, e);
            }
        }
    }

    // ========================================================================
    // TRACKS
    // ========================================================================

    /// Sends every track of `handle`; renegotiates if already connected
    pub async fn attach(self: &Arc<Self>, handle: &MediaHandle) -> Result<(), CallEngineError> {
        let mut added = false;

        for track in handle.tracks() {
            if self.inner.lock().attached.contains_key(track.id()) {
                continue;
            }
            let guard = handle.attach().ok_or_else(|| {
                CallEngineError::InvalidState(format!("media {} already released", handle.id()))
            })?;
            self.transport.add_track(track).await?;

            let mut inner = self.inner.lock();
            if inner.state == LinkState::Closed {
                return Err(CallEngineError::Cancelled);
            }
            inner.attached.insert(track.id().to_string(), guard);
            added = true;
        }

        if added {
            self.renegotiate().await;
        }
        Ok(())
    }

    /// Stops sending `handle`'s tracks; renegotiates if already connected
    pub async fn detach(self: &Arc<Self>, handle: &MediaHandle) {
        let mut removed = Vec::new();

        for track in handle.tracks() {
            let guard = self.inner.lock().attached.remove(track.id());
            if let Some(guard) = guard {
                if let Err(e) = self.transport.remove_track(track.id()).await {
                    tracing::warn!("Removing track from link {} failed: {}", self.participant_id, e);
                }
                removed.push(guard);
            }
        }

        if removed.is_empty() {
            return;
        }
        drop(removed);
        self.renegotiate().await;
    }

    // ========================================================================
    // QUALITY
    // ========================================================================

    /// Polls transport stats and maps round-trip time to a quality
    pub async fn refresh_quality(&self) -> ConnectionQuality {
        if self.state() != LinkState::Connected {
            return self.quality();
        }
        if let Some(rtt) = self.transport.stats().await.and_then(|s| s.round_trip_time) {
            self.set_quality(ConnectionQuality::from_round_trip(rtt));
        }
        self.quality()
    }

    fn set_quality(&self, quality: ConnectionQuality) {
        {
            let mut inner = self.inner.lock();
            if inner.state == LinkState::Closed || inner.quality == quality {
                return;
            }
            inner.quality = quality;
        }
        self.emit(LinkEvent::QualityChanged {
            participant_id: self.participant_id.clone(),
            quality,
        });
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Closes the link without reporting a failure. Idempotent.
    pub async fn close(&self) {
        if self.shutdown() {
            tracing::debug!("Closing link to {}", self.participant_id);
            self.transport.close().await;
        }
    }

    /// Closes the link and reports `error`; returns it for propagation.
    /// Transport errors are reported as a failure of this link.
    pub async fn fail(&self, error: CallEngineError) -> CallEngineError {
        let error = match error {
            CallEngineError::Transport(e) => CallEngineError::PeerLinkFailed {
                participant_id: self.participant_id.clone(),
                reason: e.to_string(),
            },
            other => other,
        };
        if self.shutdown() {
            tracing::warn!("Peer link to {} failed: {}", self.participant_id, error);
            self.emit(LinkEvent::QualityChanged {
                participant_id: self.participant_id.clone(),
                quality: ConnectionQuality::Poor,
            });
            self.emit(LinkEvent::Failed {
                participant_id: self.participant_id.clone(),
                error: error.clone(),
            });
            self.transport.close().await;
        }
        error
    }

    /// Marks the link closed; false if it already was
    fn shutdown(&self) -> bool {
        let (attached, offer_guard) = {
            let mut inner = self.inner.lock();
            if inner.state == LinkState::Closed {
                return false;
            }
            inner.state = LinkState::Closed;
            inner.quality = ConnectionQuality::Poor;
            inner.pending_candidates.clear();
            (std::mem::take(&mut inner.attached), inner.offer_guard.take())
        };
        self.closed.send_replace(true);
        drop(offer_guard);
        // May stop capture if the media was already released
        drop(attached);
        true
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn drive(
        link: Weak<Self>,
        mut inbox: mpsc::UnboundedReceiver<SignalMessage>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut closed: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = closed.changed() => break,
                Some(message) = inbox.recv() => {
                    let Some(this) = link.upgrade() else { break };
                    this.handle_signal(message).await;
                }
                Some(event) = transport_events.recv() => {
                    let Some(this) = link.upgrade() else { break };
                    this.handle_transport_event(event).await;
                }
                else => break,
            }
        }
    }

    async fn handle_signal(self: &Arc<Self>, message: SignalMessage) {
        let result = match message {
            SignalMessage::Offer(payload) => self.apply_remote_offer(payload.sdp).await,
            SignalMessage::Answer(payload) => self.apply_remote_answer(payload.sdp).await,
            SignalMessage::IceCandidate(candidate) => {
                self.add_ice_candidate(candidate).await;
                Ok(())
            }
            other => {
                tracing::debug!(
                    "Link to {} ignores {:?}",
                    self.participant_id,
                    other.signal_type()
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::debug!("Signal from {} not applied: {}", self.participant_id, e);
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let Ok(_signal) = self.until_closed(self.signal_lock.lock()).await else {
                    return;
                };
                let _ = self.send(SignalMessage::IceCandidate(candidate)).await;
            }
            TransportEvent::StateChanged(TransportState::Connected) => {
                if matches!(
                    self.quality(),
                    ConnectionQuality::Connecting | ConnectionQuality::Poor
                ) {
                    self.set_quality(ConnectionQuality::Good);
                }
            }
            TransportEvent::StateChanged(TransportState::Disconnected) => {
                self.set_quality(ConnectionQuality::Poor);
            }
            TransportEvent::StateChanged(TransportState::Failed) => {
                self.fail(CallEngineError::PeerLinkFailed {
                    participant_id: self.participant_id.clone(),
                    reason: "ICE connection failed".to_string(),
                })
                .await;
            }
            TransportEvent::StateChanged(_) => {}
            TransportEvent::RemoteTrack {
                track_id,
                stream_id,
                kind,
            } => {
                self.emit(LinkEvent::RemoteTrack {
                    participant_id: self.participant_id.clone(),
                    track_id,
                    stream_id,
                    kind,
                });
            }
        }
    }

    /// Caller must hold `signal_lock`
    async fn send(&self, message: SignalMessage) -> Result<(), CallEngineError> {
        let envelope = SignalingEnvelope::new(
            &self.ctx.local_id,
            &self.participant_id,
            &self.ctx.session_id,
            message,
        );
        let sent = self
            .until_closed(send_with_retry(
                self.ctx.signaling.as_ref(),
                envelope,
                &self.ctx.retry,
            ))
            .await?;

        match sent {
            Ok(()) => Ok(()),
            Err(e) => {
                let error = CallEngineError::PeerLinkFailed {
                    participant_id: self.participant_id.clone(),
                    reason: format!("signaling failed: {e}"),
                };
                Err(self.fail(error).await)
            }
        }
    }

    fn mark_negotiated(self: &Arc<Self>) {
        let (pending, now_good) = {
            let mut inner = self.inner.lock();
            if inner.state == LinkState::Closed {
                return;
            }
            inner.state = LinkState::Connected;
            inner.negotiation = NegotiationState::Stable;
            inner.offer_guard = None;
            let now_good = inner.quality == ConnectionQuality::Connecting;
            if now_good {
                inner.quality = ConnectionQuality::Good;
            }
            (std::mem::take(&mut inner.renegotiation_pending), now_good)
        };

        tracing::info!("Negotiated with {}", self.participant_id);
        self.emit(LinkEvent::Negotiated {
            participant_id: self.participant_id.clone(),
        });
        if now_good {
            self.emit(LinkEvent::QualityChanged {
                participant_id: self.participant_id.clone(),
                quality: ConnectionQuality::Good,
            });
        }

        if pending {
            let link = Arc::clone(self);
            tokio::spawn(async move { link.renegotiate().await });
        }
    }

    async fn flush_pending_candidates(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            inner.remote_description_set = true;
            std::mem::take(&mut inner.pending_candidates)
        };
        if !pending.is_empty() {
            tracing::debug!(
                "Applying {} queued candidates from {}",
                pending.len(),
                self.participant_id
            );
        }
        for candidate in pending {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                tracing::warn!("Rejected candidate from {}: {}", self.participant_id, e);
            }
        }
    }

    fn arm_answer_timeout(self: &Arc<Self>, generation: u64) {
        let link = Arc::downgrade(self);
        let timeout = self.ctx.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(link) = link.upgrade() else { return };

            let expired = {
                let inner = link.inner.lock();
                inner.offer_generation == generation
                    && inner.negotiation == NegotiationState::HaveLocalOffer
                    && inner.state != LinkState::Closed
            };
            if expired {
                link.fail(CallEngineError::NegotiationTimeout {
                    participant_id: link.participant_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
                .await;
            }
        });
    }

    /// Fails the link if the remote never offers within the timeout.
    /// Used where the other side is expected to offer, e.g. after `join`.
    pub fn expect_remote_offer(self: &Arc<Self>) {
        let link = Arc::downgrade(self);
        let timeout = self.ctx.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(link) = link.upgrade() else { return };

            if link.state() == LinkState::Idle {
                link.fail(CallEngineError::NegotiationTimeout {
                    participant_id: link.participant_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
                .await;
            }
        });
    }

    /// Lower id rolls back
    fn yields_on_collision(&self) -> bool {
        self.ctx.local_id < self.participant_id
    }

    async fn until_closed<F: Future>(&self, fut: F) -> Result<F::Output, CallEngineError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(CallEngineError::Cancelled);
        }
        tokio::select! {
            out = fut => Ok(out),
            _ = closed.changed() => Err(CallEngineError::Cancelled),
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.ctx.events.send(event);
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PeerLink")
            .field("participant_id", &self.participant_id)
            .field("state", &inner.state)
            .field("negotiation", &inner.negotiation)
            .field("quality", &inner.quality)
            .field("attached", &inner.attached.len())
            .finish()
    }
}
