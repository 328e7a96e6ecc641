//! Capture backend abstraction
//!
//! The engine never talks to capture hardware directly. A `MediaBackend`
//! opens devices and hands back `CapturedTrack`s; the platform shell
//! supplies the implementation (see `SystemMediaBackend` for the cpal one).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::track::{TrackId, TrackKind};
use crate::error::MediaError;

// ============================================================================
// CONSTRAINTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn for_call(want_video: bool) -> Self {
        Self {
            audio: AudioConstraints::default(),
            video: want_video.then(VideoConstraints::default),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorMode {
    #[default]
    Always,
    Motion,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    #[default]
    Monitor,
    Window,
    Browser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenShareOptions {
    pub include_audio: bool,
    pub cursor: CursorMode,
    pub surface: SurfaceKind,
}

// ============================================================================
// DEVICES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceList {
    pub audio_inputs: Vec<DeviceInfo>,
    pub audio_outputs: Vec<DeviceInfo>,
    pub video_inputs: Vec<DeviceInfo>,
}

// ============================================================================
// CAPTURE
// ============================================================================

/// A running capture of one device
pub trait CaptureSource: Send + Sync {
    /// Gates capture without releasing the device
    fn set_enabled(&self, enabled: bool);

    /// Stops the hardware capture; called at most once
    fn stop(&self);

    fn read_frame(&self) -> Option<Vec<f32>> {
        None
    }

    fn level(&self) -> f32 {
        0.0
    }
}

pub struct CapturedTrack {
    pub kind: TrackKind,
    pub label: String,
    pub source: Arc<dyn CaptureSource>,
    /// Fires when capture ends outside the engine (e.g. OS "stop sharing")
    pub ended: Option<oneshot::Receiver<()>>,
}

impl CapturedTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>, source: Arc<dyn CaptureSource>) -> Self {
        Self {
            kind,
            label: label.into(),
            source,
            ended: None,
        }
    }

    pub fn with_ended_signal(mut self, ended: oneshot::Receiver<()>) -> Self {
        self.ended = Some(ended);
        self
    }
}

// ============================================================================
// NOTICES
// ============================================================================

/// Out-of-band notifications from capture to the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaNotice {
    TrackEnded {
        handle_id: String,
        track_id: TrackId,
    },
    DevicesChanged,
}

/// Lets a backend report OS device-change signals
#[derive(Debug, Clone)]
pub struct DeviceChangeNotifier {
    tx: mpsc::UnboundedSender<MediaNotice>,
}

impl DeviceChangeNotifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<MediaNotice>) -> Self {
        Self { tx }
    }

    /// The engine stopped listening; watchers should exit
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Fails once nobody listens any more
    pub fn notify(&self) -> Result<(), MediaError> {
        self.tx
            .send(MediaNotice::DevicesChanged)
            .map_err(|_| MediaError::Capture("media notice channel closed".to_string()))
    }
}

// ============================================================================
// BACKEND
// ============================================================================

#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Opens microphone (and camera when `constraints.video` is set)
    async fn open_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<CapturedTrack>, MediaError>;

    /// Shows the OS picker and captures the chosen surface
    async fn open_display_media(
        &self,
        options: &ScreenShareOptions,
    ) -> Result<Vec<CapturedTrack>, MediaError>;

    fn enumerate_devices(&self) -> Result<DeviceList, MediaError>;

    /// Starts forwarding OS device-change signals; default is none
    fn watch_devices(&self, _notifier: DeviceChangeNotifier) {}
}
