//! Media source manager
//!
//! Owns the local (camera + microphone) and screen capture handles for
//! one engine. Peer links borrow the handles; only this manager releases
//! them.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::backend::{
    CapturedTrack, DeviceChangeNotifier, DeviceList, MediaBackend, MediaConstraints, MediaNotice,
    ScreenShareOptions,
};
use super::track::{HandlePurpose, MediaHandle, TrackKind};
use crate::error::MediaError;

enum ScreenSlot {
    Empty,
    Acquiring,
    Active(MediaHandle),
}

pub struct MediaSourceManager {
    backend: Arc<dyn MediaBackend>,
    local: Mutex<Option<MediaHandle>>,
    screen: Mutex<ScreenSlot>,
    devices: Mutex<DeviceList>,
    notice_tx: mpsc::UnboundedSender<MediaNotice>,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaNotice>>>,
}

impl MediaSourceManager {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            local: Mutex::new(None),
            screen: Mutex::new(ScreenSlot::Empty),
            devices: Mutex::new(DeviceList::default()),
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
        }
    }

    /// Receiver for track-ended and device-change notices; only the first
    /// caller gets it
    pub fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<MediaNotice>> {
        self.notice_rx.lock().take()
    }

    /// Hooks the backend's OS device-change signal up to the notice channel
    pub fn watch_devices(&self) {
        self.backend
            .watch_devices(DeviceChangeNotifier::new(self.notice_tx.clone()));
    }

    pub fn local_media(&self) -> Option<MediaHandle> {
        self.local.lock().clone()
    }

    pub fn screen_media(&self) -> Option<MediaHandle> {
        match &*self.screen.lock() {
            ScreenSlot::Active(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Opens microphone and, if requested, camera. Not retried on failure.
    pub async fn acquire_local_media(&self, want_video: bool) -> Result<MediaHandle, MediaError> {
        let constraints = MediaConstraints::for_call(want_video);
        tracing::info!("Acquiring local media (video: {})", want_video);

        let captured = self.backend.open_user_media(&constraints).await.map_err(|e| {
            tracing::error!("Local media acquisition failed: {}", e);
            e
        })?;

        if !captured.iter().any(|t| t.kind == TrackKind::Audio) {
            stop_captured(&captured);
            return Err(MediaError::NoDevice("microphone".to_string()));
        }
        if want_video && !captured.iter().any(|t| t.kind == TrackKind::Video) {
            stop_captured(&captured);
            return Err(MediaError::NoDevice("camera".to_string()));
        }

        let handle = self.build_handle(HandlePurpose::User, captured);
        if let Some(previous) = self.local.lock().replace(handle.clone()) {
            previous.release();
        }
        Ok(handle)
    }

    /// At most one screen capture exists per engine
    pub async fn acquire_screen_media(
        &self,
        options: ScreenShareOptions,
    ) -> Result<MediaHandle, MediaError> {
        {
            let mut slot = self.screen.lock();
            if !matches!(*slot, ScreenSlot::Empty) {
                return Err(MediaError::ScreenShareActive);
            }
            *slot = ScreenSlot::Acquiring;
        }

        let _reset = AcquiringReset(&self.screen);

        tracing::info!("Acquiring screen media: {:?}", options);
        match self.backend.open_display_media(&options).await {
            Ok(captured) if !captured.is_empty() => {
                let handle = self.build_handle(HandlePurpose::Display, captured);
                *self.screen.lock() = ScreenSlot::Active(handle.clone());
                Ok(handle)
            }
            Ok(_) => Err(MediaError::ScreenShareCancelled),
            Err(e) => {
                tracing::warn!("Screen media acquisition failed: {}", e);
                Err(e)
            }
        }
    }

    /// Idempotent
    pub fn release_media(&self, handle: &MediaHandle) {
        {
            let mut local = self.local.lock();
            if local.as_ref().is_some_and(|h| h.same_as(handle)) {
                *local = None;
            }
        }
        {
            let mut screen = self.screen.lock();
            if matches!(&*screen, ScreenSlot::Active(h) if h.same_as(handle)) {
                *screen = ScreenSlot::Empty;
            }
        }
        if !handle.is_released() {
            tracing::debug!("Releasing media handle {}", handle.id());
        }
        handle.release();
    }

    pub fn release_all(&self) {
        if let Some(handle) = self.local_media() {
            self.release_media(&handle);
        }
        if let Some(handle) = self.screen_media() {
            self.release_media(&handle);
        }
    }

    /// Flips `enabled` on the handle's track of `kind`; `None` if absent
    pub fn toggle_track(&self, handle: &MediaHandle, kind: TrackKind) -> Option<bool> {
        let track = handle.track(kind)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!("{} track {} enabled: {}", kind, track.id(), enabled);
        Some(enabled)
    }

    pub fn devices(&self) -> DeviceList {
        self.devices.lock().clone()
    }

    /// Re-enumerates devices; the flag says whether the list changed
    pub fn refresh_devices(&self) -> Result<(DeviceList, bool), MediaError> {
        let current = self.backend.enumerate_devices()?;
        let mut devices = self.devices.lock();
        let changed = *devices != current;
        *devices = current.clone();
        Ok((current, changed))
    }

    fn build_handle(&self, purpose: HandlePurpose, mut captured: Vec<CapturedTrack>) -> MediaHandle {
        let ended: Vec<(usize, oneshot::Receiver<()>)> = captured
            .iter_mut()
            .enumerate()
            .filter_map(|(i, t)| t.ended.take().map(|rx| (i, rx)))
            .collect();

        let handle = MediaHandle::new(purpose, captured);

        for (index, ended_rx) in ended {
            let Some(track) = handle.tracks().get(index) else {
                continue;
            };
            let handle_id = handle.id().to_string();
            let track_id = track.id().to_string();
            let notice_tx = self.notice_tx.clone();
            tokio::spawn(async move {
                if ended_rx.await.is_ok() {
                    tracing::info!("Track {} ended by capture source", track_id);
                    let _ = notice_tx.send(MediaNotice::TrackEnded {
                        handle_id,
                        track_id,
                    });
                }
            });
        }

        handle
    }
}

/// Frees the screen slot if acquisition fails or is dropped midway
struct AcquiringReset<'a>(&'a Mutex<ScreenSlot>);

impl Drop for AcquiringReset<'_> {
    fn drop(&mut self) {
        let mut slot = self.0.lock();
        if matches!(*slot, ScreenSlot::Acquiring) {
            *slot = ScreenSlot::Empty;
        }
    }
}

fn stop_captured(captured: &[CapturedTrack]) {
    for track in captured {
        track.source.stop();
    }
}

impl std::fmt::Debug for MediaSourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSourceManager")
            .field("local", &self.local_media())
            .field("screen", &self.screen_media())
            .finish()
    }
}
