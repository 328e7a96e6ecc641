//! Error types for the call engine
//!
//! Each layer has its own enum; `CallEngineError` wraps them and maps
//! every failure onto an `ErrorKind` so observers can tell "this call
//! cannot start" apart from "one participant dropped".

use serde::Serialize;
use thiserror::Error;

// ============================================================================
// ERROR KIND
// ============================================================================

/// Coarse error classification carried by `CallEvent::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    MediaAcquisitionFailed,
    ScreenShareDenied,
    SignalingSendFailed,
    NegotiationTimeout,
    PeerLinkFailed,
    SessionFull,
    AlreadyInCall,
    NotInCall,
    InvalidState,
    InvalidArgument,
    Cancelled,
    Transport,
}

impl ErrorKind {
    /// Whether the error is scoped to a single peer link
    pub fn is_link_scoped(self) -> bool {
        matches!(
            self,
            ErrorKind::SignalingSendFailed
                | ErrorKind::NegotiationTimeout
                | ErrorKind::PeerLinkFailed
                | ErrorKind::Transport
        )
    }
}

// ============================================================================
// LAYER ERRORS
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No capture device: {0}")]
    NoDevice(String),

    #[error("Screen share already active")]
    ScreenShareActive,

    #[error("Screen share cancelled by user")]
    ScreenShareCancelled,

    #[error("Screen capture unsupported: {0}")]
    Unsupported(String),

    #[error("Capture failed: {0}")]
    Capture(String),
}

impl MediaError {
    fn kind(&self) -> ErrorKind {
        match self {
            MediaError::ScreenShareActive
            | MediaError::ScreenShareCancelled
            | MediaError::Unsupported(_) => ErrorKind::ScreenShareDenied,
            _ => ErrorKind::MediaAcquisitionFailed,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl SignalingError {
    /// Transient errors are retried with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SignalingError::SendFailed(_) | SignalingError::NotConnected
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Transport closed")]
    Closed,
}

// ============================================================================
// ENGINE ERROR
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallEngineError {
    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(MediaError),

    #[error("Screen share denied: {0}")]
    ScreenShareDenied(MediaError),

    #[error("Signaling send failed: {0}")]
    SignalingSendFailed(#[from] SignalingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No answer from {participant_id} within {timeout_ms} ms")]
    NegotiationTimeout {
        participant_id: String,
        timeout_ms: u64,
    },

    #[error("Peer link to {participant_id} failed: {reason}")]
    PeerLinkFailed {
        participant_id: String,
        reason: String,
    },

    #[error("Session is full ({max} participants)")]
    SessionFull { max: usize },

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NotInCall,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<MediaError> for CallEngineError {
    fn from(err: MediaError) -> Self {
        match err.kind() {
            ErrorKind::ScreenShareDenied => CallEngineError::ScreenShareDenied(err),
            _ => CallEngineError::MediaAcquisitionFailed(err),
        }
    }
}

impl CallEngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallEngineError::MediaAcquisitionFailed(_) => ErrorKind::MediaAcquisitionFailed,
            CallEngineError::ScreenShareDenied(_) => ErrorKind::ScreenShareDenied,
            CallEngineError::SignalingSendFailed(_) => ErrorKind::SignalingSendFailed,
            CallEngineError::Transport(_) => ErrorKind::Transport,
            CallEngineError::NegotiationTimeout { .. } => ErrorKind::NegotiationTimeout,
            CallEngineError::PeerLinkFailed { .. } => ErrorKind::PeerLinkFailed,
            CallEngineError::SessionFull { .. } => ErrorKind::SessionFull,
            CallEngineError::AlreadyInCall => ErrorKind::AlreadyInCall,
            CallEngineError::NotInCall => ErrorKind::NotInCall,
            CallEngineError::InvalidState(_) => ErrorKind::InvalidState,
            CallEngineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CallEngineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}
