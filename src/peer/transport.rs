//! Peer transport abstraction
//!
//! A `PeerTransport` is one peer connection: SDP generation, ICE and track
//! plumbing. Everything above it (state machine, signaling, glare) lives in
//! `PeerLink`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack {
        track_id: String,
        stream_id: String,
        kind: TrackKind,
    },
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStats {
    /// Round-trip time of the selected candidate pair
    pub round_trip_time: Option<Duration>,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates an offer and applies it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Creates an answer and applies it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Discards a pending local offer
    async fn rollback(&self) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    async fn remove_track(&self, track_id: &str) -> Result<(), TransportError>;

    async fn stats(&self) -> Option<LinkStats>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        participant_id: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
