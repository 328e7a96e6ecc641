//! Call session manager
//!
//! Top-level state machine (`Idle -> Initiating -> Active -> Ending -> Idle`).
//! Owns the roster and one `PeerLink` per remote participant, routes
//! inbound signaling and reports everything through the `EventBus`.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::EngineConfig;
use crate::error::{CallEngineError, ErrorKind, MediaError, SignalingError};
use crate::events::{CallEvent, EventBus};
use crate::media::{
    DeviceList, MediaBackend, MediaHandle, MediaNotice, MediaSourceManager, ScreenShareOptions,
    TrackKind,
};
use crate::peer::{LinkContext, LinkEvent, LinkState, PeerLink, PeerTransportFactory};
use crate::session::{
    ConnectionQuality, LocalParticipant, MediaKind, Participant, ParticipantId, Session,
    SessionContext, SessionId, SessionKind,
};
use crate::signaling::{
    send_with_retry, IceCandidate, JoinPayload, OfferPayload, ParticipantRemovedPayload,
    RejectPayload, SignalMessage, SignalingEnvelope, SignalingPort,
};

/// Ended session ids remembered so late messages for them are dropped
const RECENT_SESSIONS: usize = 16;

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Initiating,
    Active(SessionKind),
    Ending,
}

/// Offer for a session we are not part of yet
#[derive(Debug, Clone)]
struct Invitation {
    from: ParticipantId,
    offer: OfferPayload,
    early_candidates: Vec<IceCandidate>,
    /// When the latest offer arrived; the inviter gives up after the timeout
    received: Instant,
}

struct Core {
    state: CallState,
    /// Bumped whenever a session begins or ends; in-flight work compares it
    epoch: u64,
    session: Option<Session>,
    links: HashMap<ParticipantId, Arc<PeerLink>>,
    link_ctx: Option<Arc<LinkContext>>,
    /// Participants whose first offer is still owned by an API call
    pending: HashSet<ParticipantId>,
    invitations: HashMap<SessionId, Invitation>,
    recent_sessions: VecDeque<SessionId>,
}

impl Core {
    fn new() -> Self {
        Self {
            state: CallState::Idle,
            epoch: 0,
            session: None,
            links: HashMap::new(),
            link_ctx: None,
            pending: HashSet::new(),
            invitations: HashMap::new(),
            recent_sessions: VecDeque::new(),
        }
    }

    fn sync_roster(&self) {
        if let (Some(session), Some(ctx)) = (&self.session, &self.link_ctx) {
            *ctx.roster.write() = session.participants.iter().map(|p| p.id.clone()).collect();
        }
    }

    fn live_link(&self, id: &str) -> Option<Arc<PeerLink>> {
        self.links.get(id).filter(|l| !l.is_closed()).cloned()
    }

    fn remember_ended(&mut self, session_id: SessionId) {
        if self.recent_sessions.len() == RECENT_SESSIONS {
            self.recent_sessions.pop_front();
        }
        self.recent_sessions.push_back(session_id);
    }
}

enum Route {
    Link(Arc<PeerLink>),
    Session,
    Foreign,
    Done,
}

enum Admission {
    Existing(Arc<PeerLink>),
    Open {
        epoch: u64,
        ctx: Arc<LinkContext>,
        added: Option<Participant>,
    },
    Full,
    Refused,
}

struct EngineInner {
    config: EngineConfig,
    local: LocalParticipant,
    media: MediaSourceManager,
    transports: Arc<dyn PeerTransportFactory>,
    signaling: Arc<dyn SignalingPort>,
    events: EventBus,
    core: Mutex<Core>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

// ============================================================================
// CALL SESSION MANAGER
// ============================================================================

/// One call engine instance; cheap to clone
#[derive(Clone)]
pub struct CallSessionManager {
    inner: Arc<EngineInner>,
}

impl CallSessionManager {
    pub fn new(
        config: EngineConfig,
        local: LocalParticipant,
        media: Arc<dyn MediaBackend>,
        transports: Arc<dyn PeerTransportFactory>,
        signaling: Arc<dyn SignalingPort>,
    ) -> Result<Self, CallEngineError> {
        config.validate()?;
        if local.id.is_empty() {
            return Err(CallEngineError::InvalidArgument(
                "local participant id is empty".to_string(),
            ));
        }

        let events = EventBus::new(config.event_channel_capacity);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                local,
                media: MediaSourceManager::new(media),
                transports,
                signaling,
                events,
                core: Mutex::new(Core::new()),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    fn upgrade(inner: &Weak<EngineInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// Registers the signaling handler and spawns the background tasks.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), CallEngineError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(CallEngineError::InvalidState(
                "engine already started".to_string(),
            ));
        }

        let mut tasks = Vec::new();

        // Signaling ingress is processed in arrival order by one task
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
        self.inner.signaling.on_message(Arc::new(move |envelope| {
            let _ = signal_tx.send(envelope);
        }));
        let engine = Arc::downgrade(&self.inner);
        tasks.push(tokio::spawn(async move {
            while let Some(envelope) = signal_rx.recv().await {
                let Some(engine) = Self::upgrade(&engine) else {
                    break;
                };
                engine.handle_signal(envelope).await;
            }
        }));

        if let Some(mut notices) = self.inner.media.take_notices() {
            let engine = Arc::downgrade(&self.inner);
            tasks.push(tokio::spawn(async move {
                while let Some(notice) = notices.recv().await {
                    let Some(engine) = Self::upgrade(&engine) else {
                        break;
                    };
                    engine.handle_media_notice(notice).await;
                }
            }));
        }

        if let Some(interval) = self.inner.config.quality_poll_interval {
            let engine = Arc::downgrade(&self.inner);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let Some(engine) = Self::upgrade(&engine) else {
                        break;
                    };
                    engine.refresh_connection_quality().await;
                }
            }));
        }

        self.inner.tasks.lock().extend(tasks);

        self.inner.media.watch_devices();
        if let Err(e) = self.refresh_devices() {
            tracing::warn!("Initial device enumeration failed: {}", e);
        }

        tracing::info!("Call engine started for {}", self.inner.local.id);
        Ok(())
    }

    /// Ends any call and stops the background tasks
    pub async fn dispose(&self) {
        let _ = self.end_call().await;
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.core.lock().invitations.clear();
        tracing::info!("Call engine disposed for {}", self.inner.local.id);
    }

    // ========================================================================
    // SNAPSHOTS
    // ========================================================================

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn local(&self) -> &LocalParticipant {
        &self.inner.local
    }

    pub fn state(&self) -> CallState {
        self.inner.core.lock().state
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.core.lock().session.clone()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner
            .core
            .lock()
            .session
            .as_ref()
            .map(|s| s.participants.clone())
            .unwrap_or_default()
    }

    pub fn link_state(&self, participant_id: &str) -> Option<LinkState> {
        self.inner
            .core
            .lock()
            .links
            .get(participant_id)
            .map(|l| l.state())
    }

    /// Number of peer links the current session holds
    pub fn link_count(&self) -> usize {
        self.inner.core.lock().links.len()
    }

    /// Sessions with an unanswered invitation
    pub fn incoming_calls(&self) -> Vec<SessionId> {
        self.inner.core.lock().invitations.keys().cloned().collect()
    }

    pub fn devices(&self) -> DeviceList {
        self.inner.media.devices()
    }

    pub fn local_media(&self) -> Option<MediaHandle> {
        self.inner.media.local_media()
    }

    pub fn screen_media(&self) -> Option<MediaHandle> {
        self.inner.media.screen_media()
    }

    // ========================================================================
    // OUTGOING CALLS
    // ========================================================================

    /// Starts a 1:1 call and sends the offer
    pub async fn initiate_call(
        &self,
        participant_id: impl Into<ParticipantId>,
        media_kind: MediaKind,
    ) -> Result<Session, CallEngineError> {
        let targets = vec![participant_id.into()];
        let result = self
            .initiate(SessionKind::Direct, targets, media_kind, None)
            .await;
        self.report(result)
    }

    /// Starts a group call; peers that cannot be reached stay in the roster
    /// with `poor` quality
    pub async fn initiate_group_call(
        &self,
        participant_ids: Vec<ParticipantId>,
        media_kind: MediaKind,
        context: Option<SessionContext>,
    ) -> Result<Session, CallEngineError> {
        let result = self
            .initiate(SessionKind::Group, participant_ids, media_kind, context)
            .await;
        self.report(result)
    }

    async fn initiate(
        &self,
        kind: SessionKind,
        targets: Vec<ParticipantId>,
        media_kind: MediaKind,
        context: Option<SessionContext>,
    ) -> Result<Session, CallEngineError> {
        if targets.is_empty() {
            return Err(CallEngineError::InvalidArgument(
                "no participants to call".to_string(),
            ));
        }
        if kind == SessionKind::Direct && targets.len() != 1 {
            return Err(CallEngineError::InvalidArgument(
                "a direct call has exactly one remote participant".to_string(),
            ));
        }
        if targets.iter().any(|id| *id == self.inner.local.id) {
            return Err(CallEngineError::InvalidArgument(
                "cannot call yourself".to_string(),
            ));
        }

        let local = &self.inner.local;
        let mut session = Session::new(
            uuid::Uuid::new_v4().to_string(),
            kind,
            media_kind,
            local.id.clone(),
            local.as_participant(media_kind),
            self.inner.config.max_participants,
        );
        session.context = context;
        for id in &targets {
            session.add_participant(Participant::remote(id.clone()))?;
        }

        let (epoch, ctx) = self.begin_session(session)?;
        tracing::info!(
            "Initiating {:?} {} call {} with {:?}",
            kind,
            media_kind,
            ctx.session_id,
            targets
        );

        match self.establish_outgoing(epoch, &ctx, &targets).await {
            Ok(session) => Ok(session),
            Err(e) => {
                // Every offer failed; nobody to say goodbye to
                self.teardown(Some(epoch), false).await;
                Err(e)
            }
        }
    }

    async fn establish_outgoing(
        &self,
        epoch: u64,
        ctx: &Arc<LinkContext>,
        targets: &[ParticipantId],
    ) -> Result<Session, CallEngineError> {
        let handle = self.acquire_local(epoch, ctx.media_kind).await?;
        let media = [handle];

        let outcomes = join_all(
            targets
                .iter()
                .map(|id| self.offer_to(epoch, ctx, id, &media)),
        )
        .await;
        self.check_epoch(epoch)?;

        let failures: Vec<(ParticipantId, CallEngineError)> = targets
            .iter()
            .cloned()
            .zip(outcomes)
            .filter_map(|(id, outcome)| outcome.err().map(|e| (id, e)))
            .collect();

        if failures.len() == targets.len() {
            let (id, error) = failures
                .into_iter()
                .next()
                .ok_or(CallEngineError::Cancelled)?;
            tracing::error!("Could not reach {}: {}", id, error);
            return Err(error);
        }

        let session = {
            let mut core = self.inner.core.lock();
            if core.epoch != epoch {
                return Err(CallEngineError::Cancelled);
            }
            let Some(session) = core.session.as_mut() else {
                return Err(CallEngineError::Cancelled);
            };
            for (id, _) in &failures {
                session.set_quality(id, ConnectionQuality::Poor);
            }
            let session = session.clone();
            core.state = CallState::Active(session.kind);
            session
        };

        tracing::info!(
            "Call {} active ({} of {} peers reached)",
            session.id,
            targets.len() - failures.len(),
            targets.len()
        );
        self.inner
            .events
            .emit(CallEvent::SessionInitiated(session.clone()));
        for (id, error) in &failures {
            tracing::warn!("Participant {} unreachable: {}", id, error);
            self.inner.events.emit_error(error);
        }
        Ok(session)
    }

    // ========================================================================
    // INCOMING CALLS
    // ========================================================================

    /// Answers a pending invitation
    pub async fn accept_call(&self, session_id: &str) -> Result<Session, CallEngineError> {
        let result = self.accept(session_id).await;
        self.report(result)
    }

    /// Declines a pending invitation
    pub async fn reject_call(&self, session_id: &str) -> Result<(), CallEngineError> {
        let result = self.decline(session_id).await;
        self.report(result)
    }

    async fn accept(&self, session_id: &str) -> Result<Session, CallEngineError> {
        let invitation = self
            .inner
            .core
            .lock()
            .invitations
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                CallEngineError::InvalidArgument(format!("no invitation for session {session_id}"))
            })?;

        let offer = &invitation.offer;
        let local = &self.inner.local;
        let mut session = Session::new(
            session_id.to_string(),
            offer.session_kind,
            offer.media_kind,
            invitation.from.clone(),
            local.as_participant(offer.media_kind),
            self.inner.config.max_participants,
        );
        session.context = offer.context.clone();
        session.add_participant(Participant::remote(invitation.from.clone()))?;
        if offer.session_kind == SessionKind::Group {
            for id in &offer.participants {
                if *id == local.id || session.contains(id) {
                    continue;
                }
                if let Err(e) = session.add_participant(Participant::remote(id.clone())) {
                    tracing::warn!("Skipping {} from invitation roster: {}", id, e);
                }
            }
        }
        let others = remote_ids(&session, &local.id)
            .into_iter()
            .filter(|id| *id != invitation.from)
            .collect::<Vec<_>>();

        let (epoch, ctx) = self.begin_session(session)?;
        tracing::info!("Accepting call {} from {}", session_id, invitation.from);

        match self
            .establish_incoming(epoch, &ctx, &invitation.from, &others)
            .await
        {
            Ok(session) => Ok(session),
            Err(e) => {
                self.teardown(Some(epoch), true).await;
                Err(e)
            }
        }
    }

    async fn establish_incoming(
        &self,
        epoch: u64,
        ctx: &Arc<LinkContext>,
        inviter: &str,
        others: &[ParticipantId],
    ) -> Result<Session, CallEngineError> {
        let handle = self.acquire_local(epoch, ctx.media_kind).await?;
        let media = [handle];

        let link = self.open_link(epoch, ctx, inviter, &media).await?;

        // Candidates that raced ahead of the link were parked on the invitation
        let invitation = self
            .inner
            .core
            .lock()
            .invitations
            .remove(&ctx.session_id)
            .ok_or(CallEngineError::Cancelled)?;
        for candidate in invitation.early_candidates {
            link.add_ice_candidate(candidate).await;
        }
        link.apply_remote_offer(invitation.offer.sdp).await?;

        self.connect_mesh(epoch, ctx, others, &media).await?;
        self.activate(epoch, CallEvent::SessionJoined)
    }

    async fn decline(&self, session_id: &str) -> Result<(), CallEngineError> {
        let invitation = self
            .inner
            .core
            .lock()
            .invitations
            .remove(session_id)
            .ok_or_else(|| {
                CallEngineError::InvalidArgument(format!("no invitation for session {session_id}"))
            })?;

        tracing::info!("Rejecting call {} from {}", session_id, invitation.from);
        let envelope = SignalingEnvelope::new(
            &self.inner.local.id,
            &invitation.from,
            session_id,
            SignalMessage::Reject(RejectPayload {
                reason: Some("declined".to_string()),
            }),
        );
        send_with_retry(
            self.inner.signaling.as_ref(),
            envelope,
            &self.inner.config.signaling_retry,
        )
        .await?;
        Ok(())
    }

    // ========================================================================
    // JOINING
    // ========================================================================

    /// Joins a running group session; members offer to us once they see
    /// our `join`
    pub async fn join_group_call(
        &self,
        session_id: &str,
        host_id: &str,
        known_participants: Vec<ParticipantId>,
        media_kind: MediaKind,
    ) -> Result<Session, CallEngineError> {
        let pending_invite = self
            .inner
            .core
            .lock()
            .invitations
            .get(session_id)
            .is_some_and(|inv| inv.from == host_id);
        if pending_invite {
            return self.accept_call(session_id).await;
        }

        let result = self
            .join(session_id, host_id, known_participants, media_kind)
            .await;
        self.report(result)
    }

    async fn join(
        &self,
        session_id: &str,
        host_id: &str,
        known_participants: Vec<ParticipantId>,
        media_kind: MediaKind,
    ) -> Result<Session, CallEngineError> {
        let local = &self.inner.local;
        if host_id == local.id {
            return Err(CallEngineError::InvalidArgument(
                "cannot join a session hosted by yourself".to_string(),
            ));
        }

        let mut session = Session::new(
            session_id.to_string(),
            SessionKind::Group,
            media_kind,
            host_id.to_string(),
            local.as_participant(media_kind),
            self.inner.config.max_participants,
        );
        session.add_participant(Participant::remote(host_id))?;
        for id in known_participants {
            if id == local.id || session.contains(&id) {
                continue;
            }
            session.add_participant(Participant::remote(id))?;
        }
        let remotes = remote_ids(&session, &local.id);

        let (epoch, ctx) = self.begin_session(session)?;
        tracing::info!("Joining group call {} hosted by {}", session_id, host_id);

        let joined = async {
            let handle = self.acquire_local(epoch, media_kind).await?;
            self.connect_mesh(epoch, &ctx, &remotes, &[handle]).await?;
            self.activate(epoch, CallEvent::SessionJoined)
        }
        .await;

        match joined {
            Ok(session) => Ok(session),
            Err(e) => {
                self.teardown(Some(epoch), true).await;
                Err(e)
            }
        }
    }

    /// Opens idle links to `peers` and announces ourselves with `join`
    async fn connect_mesh(
        &self,
        epoch: u64,
        ctx: &Arc<LinkContext>,
        peers: &[ParticipantId],
        media: &[MediaHandle],
    ) -> Result<(), CallEngineError> {
        if peers.is_empty() {
            return Ok(());
        }

        let opened = join_all(peers.iter().map(|id| self.open_link(epoch, ctx, id, media))).await;
        self.check_epoch(epoch)?;

        let mut reachable = Vec::new();
        for (id, outcome) in peers.iter().zip(opened) {
            match outcome {
                Ok(link) => reachable.push(link),
                Err(CallEngineError::Cancelled) => {}
                Err(e) => {
                    tracing::warn!("No link to {}: {}", id, e);
                    self.mark_unreachable(epoch, id, &e).await;
                }
            }
        }

        let join = SignalMessage::Join(JoinPayload {
            display_name: self.inner.local.display_name.clone(),
        });
        let targets: Vec<ParticipantId> = reachable
            .iter()
            .map(|link| link.participant_id().to_string())
            .collect();
        let failed = self.broadcast(&ctx.session_id, &targets, join).await;

        for link in reachable {
            let id = link.participant_id();
            match failed.iter().find(|(to, _)| to == id) {
                Some((_, e)) => {
                    let error = CallEngineError::PeerLinkFailed {
                        participant_id: id.to_string(),
                        reason: format!("join not delivered: {e}"),
                    };
                    self.mark_unreachable(epoch, id, &error).await;
                }
                // Members offer once they see our join
                None => link.expect_remote_offer(),
            }
        }
        Ok(())
    }

    // ========================================================================
    // ROSTER
    // ========================================================================

    /// Invites one more participant into the active group call
    pub async fn add_participant(
        &self,
        participant_id: impl Into<ParticipantId>,
    ) -> Result<(), CallEngineError> {
        let result = self.invite(participant_id.into()).await;
        self.report(result)
    }

    /// Drops a participant from the active group call and tells the others
    pub async fn remove_participant(&self, participant_id: &str) -> Result<(), CallEngineError> {
        let result = self.expel(participant_id).await;
        self.report(result)
    }

    async fn invite(&self, participant_id: ParticipantId) -> Result<(), CallEngineError> {
        let (epoch, ctx) = {
            let mut core = self.inner.core.lock();
            let epoch = group_epoch(&core)?;
            if participant_id == self.inner.local.id {
                return Err(CallEngineError::InvalidArgument(
                    "cannot add yourself".to_string(),
                ));
            }
            let ctx = core.link_ctx.clone().ok_or(CallEngineError::NotInCall)?;
            let session = core.session.as_mut().ok_or(CallEngineError::NotInCall)?;
            session.add_participant(Participant::remote(participant_id.clone()))?;
            core.sync_roster();
            (epoch, ctx)
        };

        tracing::info!("Adding {} to call {}", participant_id, ctx.session_id);
        let media = self.session_media();
        match self.offer_to(epoch, &ctx, &participant_id, &media).await {
            Ok(()) => {
                let snapshot = {
                    let core = self.inner.core.lock();
                    core.session.as_ref().and_then(|s| {
                        s.participant(&participant_id)
                            .cloned()
                            .map(|p| (p, s.clone()))
                    })
                };
                if let Some((participant, session)) = snapshot {
                    self.inner
                        .events
                        .emit(CallEvent::ParticipantAdded(participant));
                    self.inner.events.emit(CallEvent::SessionUpdated(session));
                }
                Ok(())
            }
            Err(e) => {
                let mut core = self.inner.core.lock();
                if core.epoch == epoch {
                    if let Some(session) = core.session.as_mut() {
                        session.remove_participant(&participant_id);
                    }
                    core.sync_roster();
                }
                Err(e)
            }
        }
    }

    async fn expel(&self, participant_id: &str) -> Result<(), CallEngineError> {
        let (session_id, remaining) = {
            let core = self.inner.core.lock();
            group_epoch(&core)?;
            if participant_id == self.inner.local.id {
                return Err(CallEngineError::InvalidArgument(
                    "use end_call to leave the session".to_string(),
                ));
            }
            let Some(session) = core.session.as_ref() else {
                return Err(CallEngineError::NotInCall);
            };
            if !session.contains(participant_id) {
                return Err(CallEngineError::InvalidArgument(format!(
                    "{participant_id} is not in the session"
                )));
            }
            (session.id.clone(), remote_ids(session, &self.inner.local.id))
        };

        tracing::info!("Removing {} from call {}", participant_id, session_id);
        self.drop_participant(participant_id).await;

        // The removed participant is told too, so it ends its side
        let removed = SignalMessage::ParticipantRemoved(ParticipantRemovedPayload {
            participant_id: participant_id.to_string(),
        });
        self.broadcast(&session_id, &remaining, removed).await;
        Ok(())
    }

    async fn drop_participant(&self, participant_id: &str) {
        let (link, snapshot) = {
            let mut core = self.inner.core.lock();
            let link = core.links.remove(participant_id);
            core.pending.remove(participant_id);
            let removed = core
                .session
                .as_mut()
                .and_then(|s| s.remove_participant(participant_id));
            core.sync_roster();
            let snapshot = removed.and(core.session.clone());
            (link, snapshot)
        };

        if let Some(link) = link {
            link.close().await;
        }
        if let Some(session) = snapshot {
            self.inner.events.emit(CallEvent::ParticipantRemoved {
                participant_id: participant_id.to_string(),
            });
            self.inner.events.emit(CallEvent::SessionUpdated(session));
        }
    }

    // ========================================================================
    // SCREEN SHARE
    // ========================================================================

    /// Captures the screen and sends it on every link
    pub async fn start_screen_share(
        &self,
        options: ScreenShareOptions,
    ) -> Result<(), CallEngineError> {
        let result = self.share_screen(options).await;
        self.report(result)
    }

    pub async fn stop_screen_share(&self) -> Result<(), CallEngineError> {
        let result = self.unshare_screen().await;
        self.report(result)
    }

    async fn share_screen(&self, options: ScreenShareOptions) -> Result<(), CallEngineError> {
        let epoch = active_epoch(&self.inner.core.lock())?;

        let handle = self
            .inner
            .media
            .acquire_screen_media(options)
            .await
            .map_err(CallEngineError::ScreenShareDenied)?;
        if self.check_epoch(epoch).is_err() {
            self.inner.media.release_media(&handle);
            return Err(CallEngineError::Cancelled);
        }

        let links = self.live_links();
        let attached = join_all(links.iter().map(|link| link.attach(&handle))).await;
        for (link, outcome) in links.iter().zip(attached) {
            if let Err(e) = outcome {
                tracing::warn!(
                    "Screen share not sent to {}: {}",
                    link.participant_id(),
                    e
                );
            }
        }

        let Some((session_id, remotes, snapshot)) = self.set_local_sharing(epoch, true) else {
            return Err(CallEngineError::Cancelled);
        };
        tracing::info!("Screen share started in call {}", session_id);
        self.broadcast(&session_id, &remotes, SignalMessage::ScreenShareStarted)
            .await;
        self.inner.events.emit(CallEvent::ScreenShareStarted {
            participant_id: self.inner.local.id.clone(),
        });
        self.inner.events.emit(CallEvent::SessionUpdated(snapshot));
        Ok(())
    }

    async fn unshare_screen(&self) -> Result<(), CallEngineError> {
        let epoch = active_epoch(&self.inner.core.lock())?;
        let Some(handle) = self.inner.media.screen_media() else {
            return Ok(());
        };

        let links = self.live_links();
        join_all(links.iter().map(|link| link.detach(&handle))).await;
        self.inner.media.release_media(&handle);

        let Some((session_id, remotes, snapshot)) = self.set_local_sharing(epoch, false) else {
            return Ok(());
        };
        tracing::info!("Screen share stopped in call {}", session_id);
        self.broadcast(&session_id, &remotes, SignalMessage::ScreenShareStopped)
            .await;
        self.inner.events.emit(CallEvent::ScreenShareStopped {
            participant_id: self.inner.local.id.clone(),
        });
        self.inner.events.emit(CallEvent::SessionUpdated(snapshot));
        Ok(())
    }

    /// Flips the local flag; `None` if the session moved on or nothing changed
    fn set_local_sharing(
        &self,
        epoch: u64,
        sharing: bool,
    ) -> Option<(SessionId, Vec<ParticipantId>, Session)> {
        let mut core = self.inner.core.lock();
        if core.epoch != epoch {
            return None;
        }
        let session = core.session.as_mut()?;
        let local = session.participant_mut(&self.inner.local.id)?;
        if local.is_screen_sharing == sharing {
            return None;
        }
        local.is_screen_sharing = sharing;
        Some((
            session.id.clone(),
            remote_ids(session, &self.inner.local.id),
            session.clone(),
        ))
    }

    // ========================================================================
    // TOGGLES
    // ========================================================================

    /// Mutes or unmutes the microphone; returns the new enabled state
    pub fn toggle_audio(&self) -> Result<bool, CallEngineError> {
        let result = self.toggle(TrackKind::Audio);
        self.report(result)
    }

    /// Turns the camera on or off; returns the new enabled state
    pub fn toggle_video(&self) -> Result<bool, CallEngineError> {
        let result = self.toggle(TrackKind::Video);
        self.report(result)
    }

    fn toggle(&self, kind: TrackKind) -> Result<bool, CallEngineError> {
        active_epoch(&self.inner.core.lock())?;
        let handle = self
            .inner
            .media
            .local_media()
            .ok_or_else(|| CallEngineError::InvalidState("no local media".to_string()))?;

        let toggled = self.inner.media.toggle_track(&handle, kind);

        let (enabled, snapshot) = {
            let mut core = self.inner.core.lock();
            let Some(session) = core.session.as_mut() else {
                return Err(CallEngineError::NotInCall);
            };
            let Some(local) = session.participant_mut(&self.inner.local.id) else {
                return Err(CallEngineError::NotInCall);
            };
            let flag = match kind {
                TrackKind::Audio => &mut local.is_audio_enabled,
                TrackKind::Video => &mut local.is_video_enabled,
            };
            match toggled {
                Some(enabled) => {
                    *flag = enabled;
                    (enabled, Some(session.clone()))
                }
                // No such track: nothing to flip
                None => (*flag, None),
            }
        };

        if let Some(session) = snapshot {
            self.inner.events.emit(CallEvent::SessionUpdated(session));
        }
        Ok(enabled)
    }

    // ========================================================================
    // RECORDING
    // ========================================================================

    pub fn start_recording(&self) -> Result<(), CallEngineError> {
        let result = self.set_recording(true);
        self.report(result)
    }

    pub fn stop_recording(&self) -> Result<(), CallEngineError> {
        let result = self.set_recording(false);
        self.report(result)
    }

    fn set_recording(&self, recording: bool) -> Result<(), CallEngineError> {
        let snapshot = {
            let mut core = self.inner.core.lock();
            active_epoch(&core)?;
            let Some(session) = core.session.as_mut() else {
                return Err(CallEngineError::NotInCall);
            };
            if session.is_recording == recording {
                return Ok(());
            }
            session.is_recording = recording;
            session.clone()
        };

        let session_id = snapshot.id.clone();
        self.inner.events.emit(if recording {
            CallEvent::RecordingStarted { session_id }
        } else {
            CallEvent::RecordingStopped { session_id }
        });
        self.inner.events.emit(CallEvent::SessionUpdated(snapshot));
        Ok(())
    }

    // ========================================================================
    // ENDING
    // ========================================================================

    /// Closes every link, releases all media and returns to idle.
    /// Safe to call repeatedly.
    pub async fn end_call(&self) -> Result<(), CallEngineError> {
        self.finish(true).await;
        Ok(())
    }

    async fn finish(&self, farewell: bool) {
        if let Some(session) = self.teardown(None, farewell).await {
            tracing::info!("Call {} ended", session.id);
            self.inner
                .events
                .emit(CallEvent::SessionEnded { session_id: session.id });
        }
    }

    /// Tears the session down; with `only_epoch`, only if it is still that
    /// session. Returns the session that was torn down.
    async fn teardown(&self, only_epoch: Option<u64>, farewell: bool) -> Option<Session> {
        let (session, links) = {
            let mut core = self.inner.core.lock();
            if matches!(core.state, CallState::Idle | CallState::Ending) {
                return None;
            }
            if only_epoch.is_some_and(|epoch| epoch != core.epoch) {
                return None;
            }
            core.state = CallState::Ending;
            core.epoch += 1;
            core.link_ctx = None;
            core.pending.clear();
            let session = core.session.take();
            if let Some(session) = &session {
                core.remember_ended(session.id.clone());
            }
            let links: Vec<Arc<PeerLink>> = core.links.drain().map(|(_, link)| link).collect();
            (session, links)
        };

        join_all(links.iter().map(|link| link.close())).await;

        if farewell {
            if let Some(session) = &session {
                let remotes = remote_ids(session, &self.inner.local.id);
                self.broadcast(&session.id, &remotes, SignalMessage::Leave)
                    .await;
            }
        }

        self.inner.media.release_all();
        self.inner.core.lock().state = CallState::Idle;
        session
    }

    // ========================================================================
    // QUALITY & DEVICES
    // ========================================================================

    /// Polls every link's stats and updates the roster
    pub async fn refresh_connection_quality(&self) {
        let links = self.live_links();
        if links.is_empty() {
            return;
        }

        let qualities = join_all(links.iter().map(|link| async move {
            (link.participant_id().to_string(), link.refresh_quality().await)
        }))
        .await;

        let snapshot = {
            let mut core = self.inner.core.lock();
            let active = matches!(core.state, CallState::Active(_));
            let Some(session) = core.session.as_mut() else {
                return;
            };
            let mut changed = false;
            for (id, quality) in &qualities {
                changed |= session.set_quality(id, *quality);
            }
            (changed && active).then(|| session.clone())
        };

        if let Some(session) = snapshot {
            self.inner.events.emit(CallEvent::SessionUpdated(session));
        }
    }

    /// Re-enumerates devices and announces changes
    pub fn refresh_devices(&self) -> Result<DeviceList, CallEngineError> {
        let (devices, changed) = self
            .inner
            .media
            .refresh_devices()
            .map_err(CallEngineError::MediaAcquisitionFailed)?;
        if changed {
            tracing::debug!(
                "Devices: {} inputs, {} outputs, {} cameras",
                devices.audio_inputs.len(),
                devices.audio_outputs.len(),
                devices.video_inputs.len()
            );
            self.inner
                .events
                .emit(CallEvent::MediaDevicesUpdated(devices.clone()));
        }
        Ok(devices)
    }

    async fn handle_media_notice(&self, notice: MediaNotice) {
        match notice {
            MediaNotice::TrackEnded {
                handle_id,
                track_id,
            } => {
                if self
                    .inner
                    .media
                    .screen_media()
                    .is_some_and(|h| h.id() == handle_id)
                {
                    tracing::info!("Screen capture ended from the OS");
                    let _ = self.stop_screen_share().await;
                } else if self
                    .inner
                    .media
                    .local_media()
                    .is_some_and(|h| h.id() == handle_id)
                {
                    tracing::warn!("Local track {} ended", track_id);
                    self.inner
                        .events
                        .emit_error(&CallEngineError::MediaAcquisitionFailed(
                            MediaError::NoDevice(format!("capture track {track_id} ended")),
                        ));
                }
            }
            MediaNotice::DevicesChanged => {
                if let Err(e) = self.refresh_devices() {
                    tracing::warn!("Device refresh failed: {}", e);
                }
            }
        }
    }

    // ========================================================================
    // SIGNALING INGRESS
    // ========================================================================

    async fn handle_signal(&self, envelope: SignalingEnvelope) {
        if envelope.to != self.inner.local.id {
            tracing::debug!("Dropping envelope addressed to {}", envelope.to);
            return;
        }
        tracing::debug!(
            "Signal {:?} from {} for session {}",
            envelope.signal_type(),
            envelope.from,
            envelope.session_id
        );

        let route = self.route(&envelope);
        match route {
            Route::Link(link) => link.deliver(envelope.message),
            Route::Session => self.handle_session_signal(envelope).await,
            Route::Foreign => self.handle_foreign_signal(envelope).await,
            Route::Done => {}
        }
    }

    fn route(&self, envelope: &SignalingEnvelope) -> Route {
        let mut core = self.inner.core.lock();

        let in_session = core
            .session
            .as_ref()
            .is_some_and(|s| s.id == envelope.session_id);
        if in_session && envelope.message.is_negotiation() {
            if let Some(link) = core.live_link(&envelope.from) {
                return Route::Link(link);
            }
        }

        let withdrawn = match core.invitations.get_mut(&envelope.session_id) {
            Some(invitation) if invitation.from == envelope.from => match &envelope.message {
                SignalMessage::Offer(offer) => {
                    invitation.offer = offer.clone();
                    invitation.early_candidates.clear();
                    invitation.received = Instant::now();
                    self.expire_invitation(envelope.session_id.clone(), invitation.received);
                    return Route::Done;
                }
                SignalMessage::IceCandidate(candidate) => {
                    invitation.early_candidates.push(candidate.clone());
                    return Route::Done;
                }
                SignalMessage::Leave | SignalMessage::Reject(_) => true,
                _ => false,
            },
            _ => false,
        };
        if withdrawn {
            core.invitations.remove(&envelope.session_id);
            drop(core);
            tracing::info!(
                "Invitation {} withdrawn by {}",
                envelope.session_id,
                envelope.from
            );
            self.inner.events.emit(CallEvent::IncomingCallCancelled {
                session_id: envelope.session_id.clone(),
                from: envelope.from.clone(),
            });
            return Route::Done;
        }

        if in_session {
            Route::Session
        } else if core.recent_sessions.contains(&envelope.session_id) {
            tracing::debug!(
                "Ignoring {:?} for ended session {}",
                envelope.signal_type(),
                envelope.session_id
            );
            Route::Done
        } else {
            Route::Foreign
        }
    }

    /// Messages for the active session that no link consumed
    async fn handle_session_signal(&self, envelope: SignalingEnvelope) {
        let SignalingEnvelope {
            from,
            session_id,
            message,
            ..
        } = envelope;

        match message {
            SignalMessage::Offer(offer) => {
                if let Some(link) = self.admit(&from, None).await {
                    link.deliver(SignalMessage::Offer(offer));
                }
            }
            SignalMessage::Join(join) => self.handle_join(&from, join).await,
            SignalMessage::ParticipantRemoved(removed) => {
                if removed.participant_id == self.inner.local.id {
                    tracing::info!("Removed from call {} by {}", session_id, from);
                    self.finish(false).await;
                } else {
                    self.drop_participant(&removed.participant_id).await;
                }
            }
            SignalMessage::ScreenShareStarted => self.set_remote_sharing(&from, true),
            SignalMessage::ScreenShareStopped => self.set_remote_sharing(&from, false),
            SignalMessage::Leave | SignalMessage::Reject(_) => {
                let direct = self
                    .inner
                    .core
                    .lock()
                    .session
                    .as_ref()
                    .is_some_and(|s| s.kind == SessionKind::Direct);
                tracing::info!("{} left call {}", from, session_id);
                if direct {
                    self.finish(false).await;
                } else {
                    self.drop_participant(&from).await;
                }
            }
            SignalMessage::Answer(_) | SignalMessage::IceCandidate(_) => {
                tracing::debug!("No link to {}, dropping negotiation message", from);
            }
        }
    }

    /// Messages for sessions we are not in
    async fn handle_foreign_signal(&self, envelope: SignalingEnvelope) {
        let SignalMessage::Offer(offer) = envelope.message else {
            tracing::debug!(
                "Ignoring message from {} for inactive session {}",
                envelope.from,
                envelope.session_id
            );
            return;
        };

        let idle = {
            let mut core = self.inner.core.lock();
            if core.state != CallState::Idle {
                false
            } else if core.invitations.contains_key(&envelope.session_id) {
                // Someone else offering for the same session; first inviter wins
                return;
            } else {
                let received = Instant::now();
                core.invitations.insert(
                    envelope.session_id.clone(),
                    Invitation {
                        from: envelope.from.clone(),
                        offer: offer.clone(),
                        early_candidates: Vec::new(),
                        received,
                    },
                );
                self.expire_invitation(envelope.session_id.clone(), received);
                true
            }
        };

        if idle {
            tracing::info!(
                "Incoming {:?} call {} from {}",
                offer.session_kind,
                envelope.session_id,
                envelope.from
            );
            self.inner.events.emit(CallEvent::IncomingCall {
                session_id: envelope.session_id,
                from: envelope.from,
                kind: offer.session_kind,
                media_kind: offer.media_kind,
            });
        } else {
            tracing::info!("Busy, rejecting call {} from {}", envelope.session_id, envelope.from);
            let reject = SignalingEnvelope::new(
                &self.inner.local.id,
                &envelope.from,
                &envelope.session_id,
                SignalMessage::Reject(RejectPayload {
                    reason: Some("busy".to_string()),
                }),
            );
            if let Err(e) = send_with_retry(
                self.inner.signaling.as_ref(),
                reject,
                &self.inner.config.signaling_retry,
            )
            .await
            {
                tracing::warn!("Could not reject {}: {}", envelope.from, e);
            }
        }
    }

    /// Withdraws the invitation once its offer would have timed out on the
    /// inviter's side, unless a newer offer arrived or we are accepting it
    fn expire_invitation(&self, session_id: SessionId, received: Instant) {
        let engine = Arc::downgrade(&self.inner);
        let deadline = received + self.inner.config.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(engine) = Self::upgrade(&engine) else {
                return;
            };

            let expired = {
                let mut core = engine.inner.core.lock();
                let stale = core.state == CallState::Idle
                    && core
                        .invitations
                        .get(&session_id)
                        .is_some_and(|inv| inv.received == received);
                if stale {
                    core.invitations.remove(&session_id)
                } else {
                    None
                }
            };

            if let Some(invitation) = expired {
                tracing::info!(
                    "Invitation {} from {} expired",
                    session_id,
                    invitation.from
                );
                engine.inner.events.emit(CallEvent::IncomingCallCancelled {
                    session_id,
                    from: invitation.from,
                });
            }
        });
    }

    async fn handle_join(&self, from: &str, join: JoinPayload) {
        let Some(link) = self.admit(from, Some(join.display_name)).await else {
            return;
        };
        if link.state() != LinkState::Idle {
            tracing::debug!("{} re-joined, link already {:?}", from, link.state());
            return;
        }
        // The joiner answers; members offer
        tokio::spawn(async move {
            if let Err(e) = link.create_offer().await {
                tracing::debug!("Offer to {} failed: {}", link.participant_id(), e);
            }
        });
    }

    /// Finds or creates the link for a group member that contacted us
    async fn admit(&self, from: &str, display_name: Option<String>) -> Option<Arc<PeerLink>> {
        let admission = {
            let mut core = self.inner.core.lock();
            admission_for(&mut core, from, display_name, &self.inner.local.id)
        };

        match admission {
            Admission::Existing(link) => Some(link),
            Admission::Refused => {
                tracing::debug!("Not admitting {} into this session", from);
                None
            }
            Admission::Full => {
                tracing::warn!("Session full, turning {} away", from);
                let session_id = self.session().map(|s| s.id).unwrap_or_default();
                let reject = SignalMessage::Reject(RejectPayload {
                    reason: Some("session full".to_string()),
                });
                self.broadcast(&session_id, &[from.to_string()], reject)
                    .await;
                None
            }
            Admission::Open { epoch, ctx, added } => {
                if let Some(participant) = added {
                    tracing::info!("{} joined call {}", participant.id, ctx.session_id);
                    self.inner
                        .events
                        .emit(CallEvent::ParticipantAdded(participant));
                    if let Some(session) = self.session() {
                        self.inner.events.emit(CallEvent::SessionUpdated(session));
                    }
                }
                match self
                    .open_link(epoch, &ctx, from, &self.session_media())
                    .await
                {
                    Ok(link) => Some(link),
                    Err(CallEngineError::Cancelled) => None,
                    Err(e) => {
                        tracing::warn!("No link to {}: {}", from, e);
                        self.mark_unreachable(epoch, from, &e).await;
                        None
                    }
                }
            }
        }
    }

    fn set_remote_sharing(&self, from: &str, sharing: bool) {
        let snapshot = {
            let mut core = self.inner.core.lock();
            let Some(session) = core.session.as_mut() else {
                return;
            };
            let Some(participant) = session.participant_mut(from) else {
                return;
            };
            if participant.is_screen_sharing == sharing {
                return;
            }
            participant.is_screen_sharing = sharing;
            session.clone()
        };

        let participant_id = from.to_string();
        self.inner.events.emit(if sharing {
            CallEvent::ScreenShareStarted { participant_id }
        } else {
            CallEvent::ScreenShareStopped { participant_id }
        });
        self.inner.events.emit(CallEvent::SessionUpdated(snapshot));
    }

    // ========================================================================
    // LINK EVENTS
    // ========================================================================

    fn spawn_link_events(&self, epoch: u64, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        let engine = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(engine) = Self::upgrade(&engine) else {
                    break;
                };
                engine.handle_link_event(epoch, event);
            }
        });
    }

    fn handle_link_event(&self, epoch: u64, event: LinkEvent) {
        match event {
            LinkEvent::Negotiated { participant_id } => {
                tracing::debug!("Link to {} negotiated", participant_id);
            }
            LinkEvent::QualityChanged {
                participant_id,
                quality,
            } => {
                let snapshot = {
                    let mut core = self.inner.core.lock();
                    if core.epoch != epoch {
                        return;
                    }
                    let announce = matches!(core.state, CallState::Active(_))
                        && !core.pending.contains(&participant_id);
                    let Some(session) = core.session.as_mut() else {
                        return;
                    };
                    let changed = session.set_quality(&participant_id, quality);
                    (changed && announce).then(|| session.clone())
                };
                if let Some(session) = snapshot {
                    self.inner.events.emit(CallEvent::SessionUpdated(session));
                }
            }
            LinkEvent::RemoteTrack {
                participant_id,
                stream_id,
                kind,
                ..
            } => {
                if self.inner.core.lock().epoch != epoch {
                    return;
                }
                self.inner.events.emit(CallEvent::RemoteStreamAdded {
                    participant_id,
                    stream_id,
                    track_kind: kind,
                });
            }
            LinkEvent::Failed {
                participant_id,
                error,
            } => {
                let snapshot = {
                    let mut core = self.inner.core.lock();
                    if core.epoch != epoch {
                        return;
                    }
                    let changed = core
                        .session
                        .as_mut()
                        .is_some_and(|s| s.set_quality(&participant_id, ConnectionQuality::Poor));
                    // Initial offers report their own failures
                    if core.pending.contains(&participant_id) {
                        return;
                    }
                    let closed = core
                        .links
                        .get(&participant_id)
                        .is_some_and(|link| link.is_closed());
                    if !closed {
                        return;
                    }
                    core.links.remove(&participant_id);
                    if changed {
                        core.session.clone()
                    } else {
                        None
                    }
                };

                tracing::warn!("Participant {} degraded: {}", participant_id, error);
                self.inner.events.emit_error(&error);
                if let Some(session) = snapshot {
                    self.inner.events.emit(CallEvent::SessionUpdated(session));
                }
            }
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn begin_session(
        &self,
        session: Session,
    ) -> Result<(u64, Arc<LinkContext>), CallEngineError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (epoch, ctx) = {
            let mut core = self.inner.core.lock();
            if core.state != CallState::Idle {
                return Err(CallEngineError::AlreadyInCall);
            }

            let ctx = Arc::new(LinkContext {
                local_id: self.inner.local.id.clone(),
                session_id: session.id.clone(),
                session_kind: session.kind,
                media_kind: session.media_kind,
                context: session.context.clone(),
                roster: RwLock::new(Vec::new()),
                signaling: Arc::clone(&self.inner.signaling),
                retry: self.inner.config.signaling_retry.clone(),
                negotiation_timeout: self.inner.config.negotiation_timeout,
                events: events_tx,
            });

            core.epoch += 1;
            core.state = CallState::Initiating;
            core.session = Some(session);
            core.links.clear();
            core.pending.clear();
            core.link_ctx = Some(Arc::clone(&ctx));
            core.sync_roster();
            (core.epoch, ctx)
        };

        self.spawn_link_events(epoch, events_rx);
        Ok((epoch, ctx))
    }

    /// Moves an initiating session to active and announces it
    fn activate(
        &self,
        epoch: u64,
        announce: fn(Session) -> CallEvent,
    ) -> Result<Session, CallEngineError> {
        let session = {
            let mut core = self.inner.core.lock();
            if core.epoch != epoch {
                return Err(CallEngineError::Cancelled);
            }
            let Some(session) = core.session.clone() else {
                return Err(CallEngineError::Cancelled);
            };
            core.state = CallState::Active(session.kind);
            session
        };
        tracing::info!("Call {} active", session.id);
        self.inner.events.emit(announce(session.clone()));
        Ok(session)
    }

    async fn acquire_local(
        &self,
        epoch: u64,
        media_kind: MediaKind,
    ) -> Result<MediaHandle, CallEngineError> {
        let handle = self
            .inner
            .media
            .acquire_local_media(media_kind.wants_video())
            .await
            .map_err(CallEngineError::MediaAcquisitionFailed)?;

        if self.check_epoch(epoch).is_err() {
            self.inner.media.release_media(&handle);
            return Err(CallEngineError::Cancelled);
        }
        Ok(handle)
    }

    /// Creates, registers and offers on a link; failures stay with the caller
    async fn offer_to(
        &self,
        epoch: u64,
        ctx: &Arc<LinkContext>,
        participant_id: &str,
        media: &[MediaHandle],
    ) -> Result<(), CallEngineError> {
        self.inner
            .core
            .lock()
            .pending
            .insert(participant_id.to_string());

        let outcome = match self.open_link(epoch, ctx, participant_id, media).await {
            Ok(link) => {
                let offered = link.create_offer().await;
                if offered.is_err() {
                    self.forget_link(&link).await;
                }
                offered
            }
            Err(e) => Err(e),
        };

        self.inner.core.lock().pending.remove(participant_id);
        outcome
    }

    async fn open_link(
        &self,
        epoch: u64,
        ctx: &Arc<LinkContext>,
        participant_id: &str,
        media: &[MediaHandle],
    ) -> Result<Arc<PeerLink>, CallEngineError> {
        let link = PeerLink::connect(
            participant_id,
            Arc::clone(ctx),
            self.inner.transports.as_ref(),
        )
        .await?;

        let registered = {
            let mut core = self.inner.core.lock();
            if core.epoch != epoch {
                Err(CallEngineError::Cancelled)
            } else if core.live_link(participant_id).is_some() {
                Err(CallEngineError::InvalidState(format!(
                    "link to {participant_id} already exists"
                )))
            } else {
                core.links
                    .insert(participant_id.to_string(), Arc::clone(&link));
                Ok(())
            }
        };
        if let Err(e) = registered {
            link.close().await;
            return Err(e);
        }

        for handle in media {
            if let Err(e) = link.attach(handle).await {
                self.forget_link(&link).await;
                return Err(e);
            }
        }
        Ok(link)
    }

    async fn forget_link(&self, link: &Arc<PeerLink>) {
        {
            let mut core = self.inner.core.lock();
            if core
                .links
                .get(link.participant_id())
                .is_some_and(|l| Arc::ptr_eq(l, link))
            {
                core.links.remove(link.participant_id());
            }
        }
        link.close().await;
    }

    /// Marks a participant poor, drops its link and reports `error`
    async fn mark_unreachable(&self, epoch: u64, participant_id: &str, error: &CallEngineError) {
        let (link, snapshot) = {
            let mut core = self.inner.core.lock();
            if core.epoch != epoch {
                return;
            }
            let link = core.links.remove(participant_id);
            let changed = core
                .session
                .as_mut()
                .is_some_and(|s| s.set_quality(participant_id, ConnectionQuality::Poor));
            let announce = changed && matches!(core.state, CallState::Active(_));
            (link, announce.then(|| core.session.clone()).flatten())
        };

        if let Some(link) = link {
            link.close().await;
        }
        self.inner.events.emit_error(error);
        if let Some(session) = snapshot {
            self.inner.events.emit(CallEvent::SessionUpdated(session));
        }
    }

    fn check_epoch(&self, epoch: u64) -> Result<(), CallEngineError> {
        if self.inner.core.lock().epoch == epoch {
            Ok(())
        } else {
            Err(CallEngineError::Cancelled)
        }
    }

    fn live_links(&self) -> Vec<Arc<PeerLink>> {
        self.inner
            .core
            .lock()
            .links
            .values()
            .filter(|l| !l.is_closed())
            .cloned()
            .collect()
    }

    /// Local capture plus the screen share, if one is running
    fn session_media(&self) -> Vec<MediaHandle> {
        self.inner
            .media
            .local_media()
            .into_iter()
            .chain(self.inner.media.screen_media())
            .collect()
    }

    /// Best-effort send to several participants; returns who was unreachable
    async fn broadcast(
        &self,
        session_id: &str,
        targets: &[ParticipantId],
        message: SignalMessage,
    ) -> Vec<(ParticipantId, SignalingError)> {
        let sends = targets.iter().map(|to| {
            let envelope =
                SignalingEnvelope::new(&self.inner.local.id, to, session_id, message.clone());
            async move {
                let sent = send_with_retry(
                    self.inner.signaling.as_ref(),
                    envelope,
                    &self.inner.config.signaling_retry,
                )
                .await;
                (to, sent)
            }
        });

        let mut failed = Vec::new();
        for (to, sent) in join_all(sends).await {
            if let Err(e) = sent {
                tracing::warn!("{:?} to {} not delivered: {}", message.signal_type(), to, e);
                failed.push((to.clone(), e));
            }
        }
        failed
    }

    /// Emits failures on the bus before handing them back
    fn report<T>(&self, result: Result<T, CallEngineError>) -> Result<T, CallEngineError> {
        if let Err(e) = &result {
            match e.kind() {
                ErrorKind::MediaAcquisitionFailed => tracing::error!("Call failed: {}", e),
                _ => tracing::warn!("Call operation failed: {}", e),
            }
            self.inner.events.emit_error(e);
        }
        result
    }
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("CallSessionManager")
            .field("local", &self.inner.local.id)
            .field("state", &core.state)
            .field("session", &core.session.as_ref().map(|s| &s.id))
            .field("links", &core.links.len())
            .finish()
    }
}

fn remote_ids(session: &Session, local_id: &str) -> Vec<ParticipantId> {
    session
        .participants
        .iter()
        .filter(|p| p.id != local_id)
        .map(|p| p.id.clone())
        .collect()
}

fn active_epoch(core: &Core) -> Result<u64, CallEngineError> {
    match core.state {
        CallState::Active(_) => Ok(core.epoch),
        CallState::Idle | CallState::Ending => Err(CallEngineError::NotInCall),
        CallState::Initiating => Err(CallEngineError::InvalidState(
            "call is still being set up".to_string(),
        )),
    }
}

fn group_epoch(core: &Core) -> Result<u64, CallEngineError> {
    match core.state {
        CallState::Active(SessionKind::Group) => Ok(core.epoch),
        CallState::Active(SessionKind::Direct) => Err(CallEngineError::InvalidState(
            "not a group call".to_string(),
        )),
        _ => active_epoch(core),
    }
}

fn admission_for(
    core: &mut Core,
    from: &str,
    display_name: Option<String>,
    local_id: &str,
) -> Admission {
    if from == local_id || core.state != CallState::Active(SessionKind::Group) {
        return Admission::Refused;
    }
    if let Some(link) = core.live_link(from) {
        return Admission::Existing(link);
    }
    let Some(ctx) = core.link_ctx.clone() else {
        return Admission::Refused;
    };
    let epoch = core.epoch;
    let Some(session) = core.session.as_mut() else {
        return Admission::Refused;
    };

    if let Some(existing) = session.participant_mut(from) {
        if let Some(name) = display_name {
            existing.display_name = name;
        }
        return Admission::Open {
            epoch,
            ctx,
            added: None,
        };
    }
    if session.is_full() {
        return Admission::Full;
    }

    let mut participant = Participant::remote(from);
    if let Some(name) = display_name {
        participant.display_name = name;
    }
    if session.add_participant(participant.clone()).is_err() {
        return Admission::Full;
    }
    core.sync_roster();
    Admission::Open {
        epoch,
        ctx,
        added: Some(participant),
    }
}
