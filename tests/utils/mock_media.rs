use async_trait::async_trait;
use call_engine::media::{
    CaptureSource, CapturedTrack, DeviceChangeNotifier, DeviceInfo, DeviceList, MediaBackend,
    MediaConstraints, ScreenShareOptions, TrackKind,
};
use call_engine::MediaError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// Capture source that only remembers its flags
#[derive(Debug)]
pub struct MockSource {
    pub kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockSource {
    fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl CaptureSource for MockSource {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Media backend with scriptable permissions and device lists
#[derive(Default)]
pub struct MockMediaBackend {
    deny_user_media: AtomicBool,
    deny_screen: AtomicBool,
    /// While set, `open_user_media` waits for a notification
    hold: Mutex<Option<Arc<Notify>>>,
    sources: Mutex<Vec<Arc<MockSource>>>,
    /// "Stop sharing" buttons of the screen captures handed out so far
    screen_stops: Mutex<Vec<oneshot::Sender<()>>>,
    /// Ends the microphone captures handed out so far
    mic_stops: Mutex<Vec<oneshot::Sender<()>>>,
    devices: Mutex<DeviceList>,
    notifier: Mutex<Option<DeviceChangeNotifier>>,
}

impl MockMediaBackend {
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        *backend.devices.lock() = DeviceList {
            audio_inputs: vec![device("mic-1", "Built-in Microphone", true)],
            audio_outputs: vec![device("spk-1", "Built-in Speakers", true)],
            video_inputs: vec![device("cam-1", "FaceTime Camera", true)],
        };
        Arc::new(backend)
    }

    pub fn deny_user_media(&self, deny: bool) {
        self.deny_user_media.store(deny, Ordering::SeqCst);
    }

    pub fn deny_screen(&self, deny: bool) {
        self.deny_screen.store(deny, Ordering::SeqCst);
    }

    /// Blocks user media acquisition until the returned `Notify` fires
    pub fn hold_user_media(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.hold.lock() = Some(Arc::clone(&notify));
        notify
    }

    pub fn sources(&self) -> Vec<Arc<MockSource>> {
        self.sources.lock().clone()
    }

    pub fn source(&self, kind: TrackKind) -> Option<Arc<MockSource>> {
        self.sources.lock().iter().find(|s| s.kind == kind).cloned()
    }

    /// Every capture opened so far has been stopped
    pub fn all_stopped(&self) -> bool {
        self.sources.lock().iter().all(|s| s.is_stopped())
    }

    /// Simulates the OS "stop sharing" control for the latest capture
    pub fn end_screen_capture(&self) {
        if let Some(stop) = self.screen_stops.lock().pop() {
            let _ = stop.send(());
        }
    }

    /// Simulates the microphone disappearing under the latest capture
    pub fn end_user_capture(&self) {
        if let Some(stop) = self.mic_stops.lock().pop() {
            let _ = stop.send(());
        }
    }

    /// Replaces the device list and fires the OS change signal
    pub fn plug_in(&self, device_info: DeviceInfo) {
        self.devices.lock().audio_inputs.push(device_info);
        if let Some(notifier) = self.notifier.lock().as_ref() {
            let _ = notifier.notify();
        }
    }

    fn open(&self, kind: TrackKind, label: &str) -> CapturedTrack {
        let source = MockSource::new(kind);
        self.sources.lock().push(Arc::clone(&source));
        CapturedTrack::new(kind, label, source)
    }
}

pub fn device(id: &str, name: &str, is_default: bool) -> DeviceInfo {
    DeviceInfo {
        id: id.to_string(),
        name: name.to_string(),
        is_default,
    }
}

#[async_trait]
impl MediaBackend for MockMediaBackend {
    async fn open_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<CapturedTrack>, MediaError> {
        let hold = self.hold.lock().take();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        if self.deny_user_media.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("microphone".to_string()));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        self.mic_stops.lock().push(stop_tx);
        let mut tracks = vec![self
            .open(TrackKind::Audio, "Built-in Microphone")
            .with_ended_signal(stop_rx)];
        if constraints.video.is_some() {
            tracks.push(self.open(TrackKind::Video, "FaceTime Camera"));
        }
        Ok(tracks)
    }

    async fn open_display_media(
        &self,
        _options: &ScreenShareOptions,
    ) -> Result<Vec<CapturedTrack>, MediaError> {
        if self.deny_screen.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("screen".to_string()));
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        self.screen_stops.lock().push(stop_tx);
        Ok(vec![self
            .open(TrackKind::Video, "Entire Screen")
            .with_ended_signal(stop_rx)])
    }

    fn enumerate_devices(&self) -> Result<DeviceList, MediaError> {
        Ok(self.devices.lock().clone())
    }

    fn watch_devices(&self, notifier: DeviceChangeNotifier) {
        *self.notifier.lock() = Some(notifier);
    }
}
