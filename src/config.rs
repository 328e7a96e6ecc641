//! Engine configuration
//!
//! Defaults are usable as-is; `from_env` overlays the `CALL_ENGINE_*`
//! variables the desktop shell exports.

use crate::error::CallEngineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Group calls hold at most this many participants, local included
pub const DEFAULT_MAX_PARTICIPANTS: usize = 10;

/// Offers without an answer are abandoned after this long
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// ICE SERVERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(server: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        }
    }
}

/// Standard STUN server list
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Exponential backoff for signaling sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based; the first attempt has none)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_participants: usize,
    #[serde(with = "millis")]
    pub negotiation_timeout: Duration,
    pub signaling_retry: RetryPolicy,
    pub ice_servers: Vec<IceServerConfig>,
    #[serde(with = "opt_millis")]
    pub quality_poll_interval: Option<Duration>,
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            signaling_retry: RetryPolicy::default(),
            ice_servers: default_ice_servers(),
            quality_poll_interval: Some(Duration::from_secs(5)),
            event_channel_capacity: 100,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `CALL_ENGINE_*` environment variables
    pub fn from_env() -> Result<Self, CallEngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, CallEngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("CALL_ENGINE_MAX_PARTICIPANTS") {
            config.max_participants = parse_number("CALL_ENGINE_MAX_PARTICIPANTS", &value)?;
        }
        if let Some(value) = lookup("CALL_ENGINE_NEGOTIATION_TIMEOUT_SECS") {
            let secs: u64 = parse_number("CALL_ENGINE_NEGOTIATION_TIMEOUT_SECS", &value)?;
            config.negotiation_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = lookup("CALL_ENGINE_SIGNALING_RETRIES") {
            config.signaling_retry.max_attempts =
                parse_number("CALL_ENGINE_SIGNALING_RETRIES", &value)?;
        }
        if let Some(url) = lookup("CALL_ENGINE_TURN_URL") {
            config.ice_servers.push(IceServerConfig {
                urls: vec![url],
                username: lookup("CALL_ENGINE_TURN_USERNAME").unwrap_or_default(),
                credential: lookup("CALL_ENGINE_TURN_CREDENTIAL").unwrap_or_default(),
            });
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CallEngineError> {
        if self.max_participants < 2 {
            return Err(CallEngineError::InvalidArgument(format!(
                "max_participants must be at least 2, got {}",
                self.max_participants
            )));
        }
        if self.negotiation_timeout.is_zero() {
            return Err(CallEngineError::InvalidArgument(
                "negotiation_timeout must be non-zero".to_string(),
            ));
        }
        if self.signaling_retry.max_attempts == 0 {
            return Err(CallEngineError::InvalidArgument(
                "signaling_retry.max_attempts must be non-zero".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(CallEngineError::InvalidArgument(
                "event_channel_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Adds a TURN server next to the STUN defaults
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
        self
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(RTCIceServer::from).collect()
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, CallEngineError> {
    value
        .trim()
        .parse()
        .map_err(|_| CallEngineError::InvalidArgument(format!("{key}: not a number: {value}")))
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
