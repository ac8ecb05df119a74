//! Wire format for signaling messages.
//!
//! The bus delivers these at-least-once with no ordering guarantee across
//! message types; everything here must tolerate duplicates.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub user_id: Uuid,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Current room membership, sent to a joiner. The joiner initiates
    /// toward every member listed here.
    MemberRoster { members: Vec<MemberInfo> },
    MemberJoined { member: MemberInfo },
    MemberLeft { user_id: Uuid },
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u32>,
    },
    SpeakingChanged { speaking: bool },
    MuteChanged { muted: bool },
    CameraChanged { enabled: bool },
    /// Ask the other side to tear down its connection object and send a
    /// fresh offer. Used by the retry path; both sides must agree who the
    /// offering party is, so a retry is never local-only.
    ReconnectRequest,
}

impl SignalPayload {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::MemberRoster { .. } => "member-roster",
            SignalPayload::MemberJoined { .. } => "member-joined",
            SignalPayload::MemberLeft { .. } => "member-left",
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
            SignalPayload::SpeakingChanged { .. } => "speaking-changed",
            SignalPayload::MuteChanged { .. } => "mute-changed",
            SignalPayload::CameraChanged { .. } => "camera-changed",
            SignalPayload::ReconnectRequest => "reconnect-request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_round_trip_as_tagged_json() {
        let payload = SignalPayload::IceCandidate {
            candidate: "candidate:0 1 UDP 2122252543 192.0.2.1 54400 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        let back: SignalPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn kind_matches_wire_tag() {
        let payload = SignalPayload::ReconnectRequest;
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], payload.kind());
    }
}
