//! System media backend - microphone capture and device enumeration
//!
//! Uses cpal for cross-platform audio input. Camera and screen capture
//! need a platform backend; this one reports them as unavailable.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::backend::{
    AudioConstraints, CaptureSource, CapturedTrack, DeviceChangeNotifier, DeviceInfo, DeviceList,
    MediaBackend, MediaConstraints, ScreenShareOptions,
};
use super::track::TrackKind;
use crate::error::MediaError;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample rate handed to the encoder (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// 20ms @ 48kHz
pub const FRAME_SIZE: usize = 960;

const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// MICROPHONE CAPTURE
// ============================================================================

/// Running capture of one input device
pub struct MicrophoneCapture {
    stream: Mutex<Option<Stream>>,
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,
    enabled: Arc<AtomicBool>,
    input_level: Arc<Mutex<f32>>,
}

// SAFETY (Send): cpal streams are not Send on every platform. The stream
// is only created, paused and dropped behind the mutex and never touched
// from the audio callback.
unsafe impl Send for MicrophoneCapture {}
// SAFETY (Sync): `&self` methods reach the stream only through the
// `parking_lot::Mutex`, so no two threads use it at once. The other fields
// are an atomic and `Arc<Mutex<_>>`s, which are Sync on their own.
unsafe impl Sync for MicrophoneCapture {}

impl MicrophoneCapture {
    pub fn start(device: &Device, constraints: &AudioConstraints) -> Result<Self, MediaError> {
        let config = find_best_input_config(device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels ({:?})",
            config.sample_rate.0,
            config.channels,
            constraints
        );

        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let enabled = Arc::new(AtomicBool::new(true));
        let input_level = Arc::new(Mutex::new(0.0));

        let buffer = Arc::clone(&capture_buffer);
        let gate = Arc::clone(&enabled);
        let level = Arc::clone(&input_level);
        let source_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    *level.lock() = rms_level(data);

                    if !gate.load(Ordering::Relaxed) {
                        return;
                    }

                    let mono = downmix(data, channels);
                    let samples = resample_linear(&mono, source_sample_rate, SAMPLE_RATE);

                    let mut buffer = buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    MediaError::NoDevice("microphone disconnected".to_string())
                }
                cpal::BuildStreamError::BackendSpecific { err } => {
                    MediaError::PermissionDenied(err.description)
                }
                other => MediaError::Capture(other.to_string()),
            })?;

        stream
            .play()
            .map_err(|e| MediaError::Capture(e.to_string()))?;

        Ok(Self {
            stream: Mutex::new(Some(stream)),
            capture_buffer,
            enabled,
            input_level,
        })
    }
}

impl CaptureSource for MicrophoneCapture {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn stop(&self) {
        // Dropping the stream releases the device
        if self.stream.lock().take().is_some() {
            tracing::info!("Audio capture stopped");
        }
    }

    fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }

    fn level(&self) -> f32 {
        *self.input_level.lock()
    }
}

/// RMS level clamped to 0.0 - 1.0
pub fn rms_level(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32)
        .sqrt()
        .min(1.0)
}

/// Averages interleaved channels into mono
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Simple linear resampling
pub fn resample_linear(data: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || data.is_empty() {
        return data.to_vec();
    }
    let ratio = to_rate as f32 / from_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::Capture(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Priority: 48kHz > anything else, F32 > other formats
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.clone().with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.clone().with_max_sample_rate().into());
        }
    }

    Err(MediaError::Capture(
        "No f32 input configuration available".to_string(),
    ))
}

// ============================================================================
// SYSTEM BACKEND
// ============================================================================

/// Default backend built on the host's audio stack
#[derive(Debug, Default)]
pub struct SystemMediaBackend;

impl SystemMediaBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaBackend for SystemMediaBackend {
    async fn open_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<CapturedTrack>, MediaError> {
        if constraints.video.is_some() {
            return Err(MediaError::NoDevice(
                "camera capture needs a platform media backend".to_string(),
            ));
        }

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| MediaError::NoDevice("microphone".to_string()))?;
        let label = device.name().unwrap_or_else(|_| "microphone".to_string());

        let capture = MicrophoneCapture::start(&device, &constraints.audio)?;
        Ok(vec![CapturedTrack::new(
            TrackKind::Audio,
            label,
            Arc::new(capture),
        )])
    }

    async fn open_display_media(
        &self,
        _options: &ScreenShareOptions,
    ) -> Result<Vec<CapturedTrack>, MediaError> {
        Err(MediaError::Unsupported(
            "screen capture needs a platform media backend".to_string(),
        ))
    }

    fn enumerate_devices(&self) -> Result<DeviceList, MediaError> {
        let host = cpal::default_host();

        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let audio_inputs = host
            .input_devices()
            .map_err(|e| MediaError::Capture(e.to_string()))?
            .filter_map(|d| d.name().ok())
            .map(|name| device_info(name, default_input.as_ref()))
            .collect();

        let audio_outputs = host
            .output_devices()
            .map_err(|e| MediaError::Capture(e.to_string()))?
            .filter_map(|d| d.name().ok())
            .map(|name| device_info(name, default_output.as_ref()))
            .collect();

        Ok(DeviceList {
            audio_inputs,
            audio_outputs,
            video_inputs: Vec::new(),
        })
    }

    /// cpal has no hot-plug callback, so the list is polled
    fn watch_devices(&self, notifier: DeviceChangeNotifier) {
        let backend = SystemMediaBackend::new();
        let spawned = std::thread::Builder::new()
            .name("device-watch".to_string())
            .spawn(move || {
                poll_devices(&notifier, DEVICE_POLL_INTERVAL, || {
                    backend.enumerate_devices().ok()
                });
                tracing::debug!("Device watcher stopped");
            });
        if let Err(e) = spawned {
            tracing::warn!("Could not start device watcher: {}", e);
        }
    }
}

/// Notifies on every change of `enumerate`'s result until the engine stops
/// listening
fn poll_devices<F>(notifier: &DeviceChangeNotifier, interval: Duration, mut enumerate: F)
where
    F: FnMut() -> Option<DeviceList>,
{
    let mut last = enumerate();
    while !notifier.is_closed() {
        std::thread::sleep(interval);
        if notifier.is_closed() {
            break;
        }
        let current = enumerate();
        if current != last {
            last = current;
            if notifier.notify().is_err() {
                break;
            }
        }
    }
}

fn device_info(name: String, default_name: Option<&String>) -> DeviceInfo {
    DeviceInfo {
        id: name.clone(),
        is_default: default_name == Some(&name),
        name,
    }
}
