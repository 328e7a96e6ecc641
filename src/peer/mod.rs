//! Peer Module - one negotiated connection per remote participant
//!
//! - `transport`: the connection abstraction the links drive
//! - `rtc`: WebRTC implementation of it
//! - `link`: offer/answer state machine, ICE queueing, glare handling

mod link;
mod rtc;
mod transport;

pub use link::{LinkContext, LinkEvent, LinkState, NegotiationState, PeerLink};
pub use rtc::{RtcPeerTransport, RtcTransportFactory};
pub use transport::{
    LinkStats, PeerTransport, PeerTransportFactory, SdpKind, SessionDescription, TransportEvent,
    TransportEvents, TransportState,
};
