//! Session data model: participants, roster and session metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::CallEngineError;

/// Opaque peer identifier
pub type ParticipantId = String;

/// Session identifier shared by every participant of a call
pub type SessionId = String;

// ============================================================================
// CONNECTION QUALITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Connecting,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    /// Maps the selected candidate pair round-trip time onto a quality bucket
    pub fn from_round_trip(rtt: Duration) -> Self {
        match rtt.as_millis() {
            0..=149 => ConnectionQuality::Excellent,
            150..=299 => ConnectionQuality::Good,
            300..=599 => ConnectionQuality::Fair,
            _ => ConnectionQuality::Poor,
        }
    }
}

// ============================================================================
// PARTICIPANT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub is_audio_enabled: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub connection_quality: ConnectionQuality,
}

impl Participant {
    /// A remote participant that has not finished negotiating yet
    pub fn remote(id: impl Into<ParticipantId>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            is_audio_enabled: true,
            is_video_enabled: false,
            is_screen_sharing: false,
            connection_quality: ConnectionQuality::Connecting,
        }
    }
}

/// Identity of the engine's own user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalParticipant {
    pub id: ParticipantId,
    pub display_name: String,
}

impl LocalParticipant {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    pub(crate) fn as_participant(&self, media_kind: MediaKind) -> Participant {
        Participant {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            is_audio_enabled: true,
            is_video_enabled: media_kind.wants_video(),
            is_screen_sharing: false,
            connection_quality: ConnectionQuality::Excellent,
        }
    }
}

// ============================================================================
// SESSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaKind {
    Audio,
    Video,
    ScreenShare,
}

impl MediaKind {
    pub fn wants_video(self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::ScreenShare => write!(f, "screen-share"),
        }
    }
}

/// Correlates a session with a higher-level collaboration channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub element_id: String,
    pub element_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub kind: SessionKind,
    pub media_kind: MediaKind,
    pub start_time: DateTime<Utc>,
    pub host_id: ParticipantId,
    pub max_participants: usize,
    pub is_recording: bool,
    /// Ordered, unique by id; always contains the local participant
    pub participants: Vec<Participant>,
    pub context: Option<SessionContext>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        kind: SessionKind,
        media_kind: MediaKind,
        host_id: ParticipantId,
        local: Participant,
        max_participants: usize,
    ) -> Self {
        let max_participants = match kind {
            SessionKind::Direct => 2,
            SessionKind::Group => max_participants.max(2),
        };
        Self {
            id,
            kind,
            media_kind,
            start_time: Utc::now(),
            host_id,
            max_participants,
            is_recording: false,
            participants: vec![local],
            context: None,
        }
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub(crate) fn participant_mut(&mut self, id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participant(id).is_some()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants
    }

    /// Appends a participant, refusing duplicates and overflow
    pub(crate) fn add_participant(&mut self, participant: Participant) -> Result<(), CallEngineError> {
        if self.contains(&participant.id) {
            return Err(CallEngineError::InvalidArgument(format!(
                "participant {} already in session",
                participant.id
            )));
        }
        if self.is_full() {
            return Err(CallEngineError::SessionFull {
                max: self.max_participants,
            });
        }
        self.participants.push(participant);
        Ok(())
    }

    pub(crate) fn remove_participant(&mut self, id: &str) -> Option<Participant> {
        let index = self.participants.iter().position(|p| p.id == id)?;
        Some(self.participants.remove(index))
    }

    /// Updates a participant's quality; returns whether it changed
    pub(crate) fn set_quality(&mut self, id: &str, quality: ConnectionQuality) -> bool {
        match self.participant_mut(id) {
            Some(p) if p.connection_quality != quality => {
                p.connection_quality = quality;
                true
            }
            _ => false,
        }
    }
}
