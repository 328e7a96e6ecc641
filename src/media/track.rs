//! Media tracks and the handles that group them
//!
//! A `MediaHandle` is shared by reference with every peer link that sends
//! its tracks. Links hold an `AttachGuard`; the capture hardware is only
//! stopped once the handle has been released by the `MediaSourceManager`
//! and the last guard is gone.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::backend::{CaptureSource, CapturedTrack};

pub type TrackId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// What a handle captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlePurpose {
    /// Camera and microphone
    User,
    /// Screen capture
    Display,
}

// ============================================================================
// MEDIA TRACK
// ============================================================================

pub struct MediaTrack {
    id: TrackId,
    kind: TrackKind,
    label: String,
    stream_id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    source: Arc<dyn CaptureSource>,
}

impl MediaTrack {
    pub(crate) fn new(stream_id: &str, captured: CapturedTrack) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: captured.kind,
            label: captured.label,
            stream_id: stream_id.to_string(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            source: captured.source,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Captured samples waiting to be encoded, if the source buffers any
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        self.source.read_frame()
    }

    pub fn level(&self) -> f32 {
        self.source.level()
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        self.source.set_enabled(enabled);
    }

    pub(crate) fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.source.stop();
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// MEDIA HANDLE
// ============================================================================

#[derive(Debug, Default)]
struct Usage {
    attachments: usize,
    release_requested: bool,
}

struct HandleInner {
    id: String,
    purpose: HandlePurpose,
    tracks: Vec<Arc<MediaTrack>>,
    usage: Mutex<Usage>,
}

#[derive(Clone)]
pub struct MediaHandle {
    inner: Arc<HandleInner>,
}

impl MediaHandle {
    pub(crate) fn new(purpose: HandlePurpose, captured: Vec<CapturedTrack>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let tracks = captured
            .into_iter()
            .map(|c| Arc::new(MediaTrack::new(&id, c)))
            .collect();
        Self {
            inner: Arc::new(HandleInner {
                id,
                purpose,
                tracks,
                usage: Mutex::new(Usage::default()),
            }),
        }
    }

    /// Doubles as the stream id of every track in the handle
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn purpose(&self) -> HandlePurpose {
        self.inner.purpose
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.inner.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        self.inner.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn attachments(&self) -> usize {
        self.inner.usage.lock().attachments
    }

    pub fn is_released(&self) -> bool {
        self.inner.usage.lock().release_requested
    }

    /// Every track has stopped capturing
    pub fn is_stopped(&self) -> bool {
        self.inner.tracks.iter().all(|t| t.is_stopped())
    }

    pub fn same_as(&self, other: &MediaHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers a user of the tracks; `None` once the handle is released
    pub fn attach(&self) -> Option<AttachGuard> {
        let mut usage = self.inner.usage.lock();
        if usage.release_requested {
            return None;
        }
        usage.attachments += 1;
        Some(AttachGuard {
            handle: self.clone(),
        })
    }

    /// Marks the handle released; capture stops now or when the last
    /// attachment is dropped
    pub(crate) fn release(&self) {
        let stop_now = {
            let mut usage = self.inner.usage.lock();
            usage.release_requested = true;
            usage.attachments == 0
        };
        if stop_now {
            self.stop_tracks();
        }
    }

    fn detach(&self) {
        let stop_now = {
            let mut usage = self.inner.usage.lock();
            usage.attachments = usage.attachments.saturating_sub(1);
            usage.release_requested && usage.attachments == 0
        };
        if stop_now {
            self.stop_tracks();
        }
    }

    fn stop_tracks(&self) {
        for track in &self.inner.tracks {
            track.stop();
        }
        tracing::debug!("Media handle {} stopped", self.inner.id);
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.inner.id)
            .field("purpose", &self.inner.purpose)
            .field("tracks", &self.inner.tracks)
            .field("usage", &*self.inner.usage.lock())
            .finish()
    }
}

/// Keeps a handle's capture alive while a peer link sends its tracks
pub struct AttachGuard {
    handle: MediaHandle,
}

impl AttachGuard {
    pub fn handle(&self) -> &MediaHandle {
        &self.handle
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.handle.detach();
    }
}

impl fmt::Debug for AttachGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttachGuard").field(&self.handle.id()).finish()
    }
}
