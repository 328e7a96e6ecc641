//! Media Module - local capture and screen sharing
//!
//! This module manages:
//! - Camera/microphone and screen capture handles
//! - Track enable/disable toggles
//! - Device enumeration and change notification

mod audio;
mod backend;
mod manager;
mod track;

pub use audio::{MicrophoneCapture, SystemMediaBackend, FRAME_SIZE, SAMPLE_RATE};
pub use backend::{
    AudioConstraints, CaptureSource, CapturedTrack, CursorMode, DeviceChangeNotifier, DeviceInfo,
    DeviceList, MediaBackend, MediaConstraints, MediaNotice, ScreenShareOptions, SurfaceKind,
    VideoConstraints,
};
pub use manager::MediaSourceManager;
pub use track::{AttachGuard, HandlePurpose, MediaHandle, MediaTrack, TrackId, TrackKind};
