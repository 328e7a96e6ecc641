//! Signaling wire messages
//!
//! Every message travels in the same envelope:
//! `{ from, to, sessionId, type, payload }`. The typed `SignalMessage`
//! is converted to and from that shape at the serde boundary.

use serde::{Deserialize, Serialize};

use crate::error::SignalingError;
use crate::session::{MediaKind, ParticipantId, SessionContext, SessionId, SessionKind};

// ============================================================================
// PAYLOADS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub sdp: String,
    pub session_kind: SessionKind,
    pub media_kind: MediaKind,
    /// Roster known to the offerer, so an invitee can join the mesh
    #[serde(default)]
    pub participants: Vec<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<SessionContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRemovedPayload {
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RejectPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ============================================================================
// MESSAGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    Join,
    ParticipantRemoved,
    ScreenShareStarted,
    ScreenShareStopped,
    Leave,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(IceCandidate),
    Join(JoinPayload),
    ParticipantRemoved(ParticipantRemovedPayload),
    ScreenShareStarted,
    ScreenShareStopped,
    Leave,
    Reject(RejectPayload),
}

impl SignalMessage {
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalMessage::Offer(_) => SignalType::Offer,
            SignalMessage::Answer(_) => SignalType::Answer,
            SignalMessage::IceCandidate(_) => SignalType::IceCandidate,
            SignalMessage::Join(_) => SignalType::Join,
            SignalMessage::ParticipantRemoved(_) => SignalType::ParticipantRemoved,
            SignalMessage::ScreenShareStarted => SignalType::ScreenShareStarted,
            SignalMessage::ScreenShareStopped => SignalType::ScreenShareStopped,
            SignalMessage::Leave => SignalType::Leave,
            SignalMessage::Reject(_) => SignalType::Reject,
        }
    }

    /// Negotiation traffic belongs to a single peer link
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalMessage::Offer(_) | SignalMessage::Answer(_) | SignalMessage::IceCandidate(_)
        )
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireEnvelope", try_from = "WireEnvelope")]
pub struct SignalingEnvelope {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub session_id: SessionId,
    pub message: SignalMessage,
}

impl SignalingEnvelope {
    pub fn new(
        from: impl Into<ParticipantId>,
        to: impl Into<ParticipantId>,
        session_id: impl Into<SessionId>,
        message: SignalMessage,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            session_id: session_id.into(),
            message,
        }
    }

    pub fn signal_type(&self) -> SignalType {
        self.message.signal_type()
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    from: ParticipantId,
    to: ParticipantId,
    session_id: SessionId,
    #[serde(rename = "type")]
    signal_type: SignalType,
    #[serde(default)]
    payload: serde_json::Value,
}

impl From<SignalingEnvelope> for WireEnvelope {
    fn from(envelope: SignalingEnvelope) -> Self {
        let signal_type = envelope.message.signal_type();
        let payload = match envelope.message {
            SignalMessage::Offer(p) => serde_json::to_value(p),
            SignalMessage::Answer(p) => serde_json::to_value(p),
            SignalMessage::IceCandidate(p) => serde_json::to_value(p),
            SignalMessage::Join(p) => serde_json::to_value(p),
            SignalMessage::ParticipantRemoved(p) => serde_json::to_value(p),
            SignalMessage::Reject(p) => serde_json::to_value(p),
            SignalMessage::ScreenShareStarted
            | SignalMessage::ScreenShareStopped
            | SignalMessage::Leave => Ok(serde_json::Value::Null),
        }
        .unwrap_or(serde_json::Value::Null);

        Self {
            from: envelope.from,
            to: envelope.to,
            session_id: envelope.session_id,
            signal_type,
            payload,
        }
    }
}

impl TryFrom<WireEnvelope> for SignalingEnvelope {
    type Error = serde_json::Error;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let payload = wire.payload;
        let message = match wire.signal_type {
            SignalType::Offer => SignalMessage::Offer(serde_json::from_value(payload)?),
            SignalType::Answer => SignalMessage::Answer(serde_json::from_value(payload)?),
            SignalType::IceCandidate => {
                SignalMessage::IceCandidate(serde_json::from_value(payload)?)
            }
            SignalType::Join => SignalMessage::Join(serde_json::from_value(payload)?),
            SignalType::ParticipantRemoved => {
                SignalMessage::ParticipantRemoved(serde_json::from_value(payload)?)
            }
            SignalType::ScreenShareStarted => SignalMessage::ScreenShareStarted,
            SignalType::ScreenShareStopped => SignalMessage::ScreenShareStopped,
            SignalType::Leave => SignalMessage::Leave,
            SignalType::Reject => {
                if payload.is_null() {
                    SignalMessage::Reject(RejectPayload::default())
                } else {
                    SignalMessage::Reject(serde_json::from_value(payload)?)
                }
            }
        };

        Ok(Self {
            from: wire.from,
            to: wire.to,
            session_id: wire.session_id,
            message,
        })
    }
}
