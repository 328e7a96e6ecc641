//! Signaling Module - session description and ICE exchange
//!
//! This module defines:
//! - The wire envelope shared with every remote participant
//! - The abstract `SignalingPort` the engine sends through
//! - A WebSocket implementation of that port
//!

mod messages;
mod port;
mod websocket;

pub use messages::*;
pub use port::{send_with_retry, MessageHandler, SignalingPort};
pub use websocket::WebSocketSignaling;
