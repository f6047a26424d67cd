use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{CallError, ErrorKind};
use crate::peer::state::CallState;

/// Роль в звонке: кто создаёт offer, а кто answer
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Ментор всегда инициатор, ученик отвечает
impl FromStr for Role {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initiator" | "mentor" => Ok(Role::Initiator),
            "responder" | "learner" => Ok(Role::Responder),
            other => Err(CallError::Config(format!("unknown role {other:?}"))),
        }
    }
}

/// ICE кандидат в формате `RTCIceCandidate.toJSON()` браузера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Описание сессии (SDP) без привязки к конкретному бэкенду
#[derive(Debug, Clone, PartialEq, Eq)]
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Удалённый трек, пришедший через `on_track`
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// Сам трек webrtc; отсутствует у тестовых бэкендов
    pub handle: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Состояние peer connection, как его видит машина состояний
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(st: RTCPeerConnectionState) -> Self {
        match st {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// Событие от наблюдателей peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(ConnectionState),
    GraceExpired,
}

/// Событие с номером поколения соединения, которое его породило.
/// Всё, что пришло от уже закрытого соединения, отбрасывается.
#[derive(Debug, Clone)]
pub struct PeerNotice {
    pub generation: u64,
    pub event: PeerEvent,
}

/// События звонка для UI
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    Error { kind: ErrorKind, message: String },
    RemoteTrack(RemoteTrack),
    SessionCompleted,
    ConnectionProblem,
    ConnectionRecovered,
    ConnectionFailed,
    AudioToggled(bool),
    VideoToggled(bool),
    ScreenShareToggled(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_from_participant_names() {
        assert_eq!("mentor".parse::<Role>().unwrap(), Role::Initiator);
        assert_eq!("Learner".parse::<Role>().unwrap(), Role::Responder);
        assert_eq!("responder".parse::<Role>().unwrap(), Role::Responder);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());

        let back: IceCandidate = serde_json::from_str(
            r#"{"candidate":"candidate:x","sdpMid":null,"sdpMLineIndex":1,"usernameFragment":"abcd"}"#,
        )
        .unwrap();
        assert_eq!(back.sdp_mid, None);
        assert_eq!(back.sdp_mline_index, Some(1));
        assert_eq!(back.username_fragment.as_deref(), Some("abcd"));
    }
}
