//! WebRTC peer transport
//!
//! `PeerTransport` on top of the `webrtc` crate. Audio is sent as Opus,
//! camera and screen video as VP8.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::transport::{
    LinkStats, PeerTransport, PeerTransportFactory, SdpKind, SessionDescription, TransportEvent,
    TransportEvents, TransportState,
};
use crate::config::EngineConfig;
use crate::error::TransportError;
use crate::media::{MediaTrack, TrackKind, SAMPLE_RATE};
use crate::signaling::IceCandidate;

const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// FACTORY
// ============================================================================

/// Creates one `RTCPeerConnection` per remote participant
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ice_servers: config.rtc_ice_servers(),
        }
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(webrtc_error)?;

        // RTCP reports, NACK, TWCC
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(webrtc_error)?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        participant_id: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let pc = self.create_peer_connection().await?;
        setup_peer_connection_handlers(&pc, participant_id, events);
        Ok(Arc::new(RtcPeerTransport {
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

fn setup_peer_connection_handlers(
    pc: &RTCPeerConnection,
    participant_id: &str,
    events: TransportEvents,
) {
    let peer = participant_id.to_string();
    let state_tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state ({}): {:?}", peer, s);

        let state = match s {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                TransportState::New
            }
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
        };
        let _ = state_tx.send(TransportEvent::StateChanged(state));

        Box::pin(async {})
    }));

    let candidate_tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // None marks the end of gathering
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    let _ = candidate_tx.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => tracing::warn!("Cannot serialize local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let track_tx = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        tracing::info!("Received track: {:?}", track.codec());
        let _ = track_tx.send(TransportEvent::RemoteTrack {
            track_id: track.id(),
            stream_id: track.stream_id(),
            kind,
        });
        Box::pin(async {})
    }));
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

impl RtcPeerTransport {
    fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
        match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(webrtc_error)
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(webrtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        if self.senders.lock().contains_key(track.id()) {
            return Ok(());
        }

        let local = Arc::new(TrackLocalStaticSample::new(
            Self::codec_for(track.kind()),
            track.id().to_string(),
            track.stream_id().to_string(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_error)?;

        // Incoming RTCP must be drained for the interceptors to work
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().insert(track.id().to_string(), sender);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), TransportError> {
        let sender = self.senders.lock().remove(track_id);
        match sender {
            Some(sender) => self.pc.remove_track(&sender).await.map_err(webrtc_error),
            None => Ok(()),
        }
    }

    async fn stats(&self) -> Option<LinkStats> {
        let report = self.pc.get_stats().await;
        let round_trip_time = report.reports.values().find_map(|stat| match stat {
            StatsReportType::CandidatePair(pair)
                if pair.nominated && pair.current_round_trip_time > 0.0 =>
            {
                Some(Duration::from_secs_f64(pair.current_round_trip_time))
            }
            _ => None,
        });
        Some(LinkStats { round_trip_time })
    }

    async fn close(&self) {
        self.senders.lock().clear();
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Error closing peer connection: {}", e);
        }
    }
}

fn webrtc_error(e: webrtc::Error) -> TransportError {
    TransportError::WebRTC(e.to_string())
}
