//! Media session types and data structures

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Create a new random stream ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(pub Uuid);

impl TrackId {
    /// Create a new random track ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media carried by a track or sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone or other audio capture
    Audio,
    /// Camera or screen capture
    Video,
}

/// Ready state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackReadyState {
    /// The track is producing media
    Live,
    /// The track was stopped and can never produce media again
    Ended,
}

/// Which transport a bridge publishes over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BridgeKind {
    /// Microphone audio bridge
    Audio,
    /// Screen share bridge
    ScreenShare,
}

impl std::fmt::Display for BridgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::ScreenShare => write!(f, "screenshare"),
        }
    }
}

/// Live session status of a bridge
///
/// Transitions are reported through [`crate::events::BridgeEvent::CallStateChanged`],
/// never polled by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallState {
    /// Session established
    Started,
    /// Session closed by the local user
    Ended,
    /// Session could not be established or was lost for good
    Failed,
    /// Waiting to retry a failed connection attempt
    Reconnecting,
    /// Remote playback was blocked by the platform's autoplay policy
    AutoplayBlocked,
    /// A local outbound track is attached and being sent
    AudioPublished,
}

impl CallState {
    /// Whether the session is considered up in this state
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Started | Self::AudioPublished | Self::AutoplayBlocked
        )
    }
}

/// Read-only session/auth context supplied by the surrounding client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    /// Session token used to authorize ICE and media requests
    pub session_token: String,
    /// Internal user identifier
    pub user_id: String,
    /// Display name of the user
    pub user_name: String,
    /// Voice conference the user is joining
    pub voice_conference_id: String,
}

impl SessionContext {
    /// Create a new session context
    pub fn new(
        session_token: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        voice_conference_id: impl Into<String>,
    ) -> Self {
        Self {
            session_token: session_token.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            voice_conference_id: voice_conference_id.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(StreamId::new(), StreamId::new());
        assert_ne!(TrackId::new(), TrackId::new());
    }

    #[test]
    fn test_call_state_liveness() {
        assert!(CallState::Started.is_live());
        assert!(CallState::AudioPublished.is_live());
        assert!(CallState::AutoplayBlocked.is_live());
        assert!(!CallState::Reconnecting.is_live());
        assert!(!CallState::Failed.is_live());
        assert!(!CallState::Ended.is_live());
    }

    #[test]
    fn test_call_state_serialization() {
        let json = serde_json::to_string(&CallState::AutoplayBlocked).unwrap();
        assert_eq!(json, "\"autoplayBlocked\"");
        let json = serde_json::to_string(&CallState::AudioPublished).unwrap();
        assert_eq!(json, "\"audioPublished\"");
    }

    #[test]
    fn test_session_context_camel_case() {
        let ctx = SessionContext::new("tok", "u1", "Alice", "72013");
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["sessionToken"], "tok");
        assert_eq!(json["voiceConferenceId"], "72013");
    }
}
