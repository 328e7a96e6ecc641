//! Call Engine - real-time call sessions over P2P links
//!
//! A headless engine for one-to-one and mesh group calls:
//! - WebRTC peer links with glare-safe offer/answer negotiation
//! - Pluggable signaling (WebSocket implementation included)
//! - Camera, microphone and screen capture through a media backend
//! - An event bus the UI layer observes

pub mod call_engine;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use call_engine::{CallSessionManager, CallState};
pub use config::{EngineConfig, IceServerConfig, RetryPolicy};
pub use error::{CallEngineError, ErrorKind, MediaError, SignalingError, TransportError};
pub use events::{CallEvent, EventBus, SubscriptionId};
pub use media::{MediaBackend, MediaHandle, MediaSourceManager, ScreenShareOptions, SystemMediaBackend};
pub use peer::{PeerLink, PeerTransportFactory, RtcTransportFactory};
pub use session::{
    ConnectionQuality, LocalParticipant, MediaKind, Participant, ParticipantId, Session,
    SessionContext, SessionId, SessionKind,
};
pub use signaling::{SignalingEnvelope, SignalingPort, WebSocketSignaling};

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"call_engine=debug"`). Does nothing if a
/// global subscriber is already set.
pub fn init_tracing(default_directive: &str) {
    let mut filter = EnvFilter::from_default_env();
    for directive in [default_directive, "webrtc=warn"] {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring log directive {:?}: {}", directive, e),
        }
    }

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Call engine logging initialized");
    }
}
