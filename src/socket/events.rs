//! Wire events exchanged over the signaling channel.
//!
//! Every frame is one JSON object `{event, data}`. SDP and ICE payloads stay
//! opaque [`serde_json::Value`]s here; only the identifiers used for routing
//! are typed. The reserved names [`EV_CONNECT`] / [`EV_DISCONNECT`] are never
//! sent on the wire: the channel raises them locally on transport state
//! changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EV_CONNECT: &str = "connect";
pub const EV_DISCONNECT: &str = "disconnect";

pub const EV_JOIN_ROOM: &str = "join-room";
pub const EV_OFFER: &str = "offer";
pub const EV_ANSWER: &str = "answer";
pub const EV_ICE_CANDIDATE: &str = "ice-candidate";
pub const EV_USER_JOINED: &str = "user-joined";
pub const EV_AGENT_MESSAGE: &str = "agent-message";
pub const EV_CALL_ENDED_BY_AGENT: &str = "call-ended-by-agent";
pub const EV_PING: &str = "ping";

/// One frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Which side of the call a channel participant is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Customer,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub connection_id: String,
    pub user_type: UserRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub offer: Value,
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub answer: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinedPayload {
    pub user_type: UserRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessagePayload {
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEndedPayload {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub connection_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = EventFrame::new(
            EV_JOIN_ROOM,
            serde_json::to_value(JoinRoomPayload {
                connection_id: "CONN-1".to_string(),
                user_type: UserRole::Customer,
            })
            .unwrap(),
        );
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains("\"connectionId\":\"CONN-1\""));
        assert!(encoded.contains("\"userType\":\"customer\""));

        let decoded: EventFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.event, EV_JOIN_ROOM);
    }

    #[test]
    fn test_frame_without_data_defaults_to_null() {
        let decoded: EventFrame = serde_json::from_str(r#"{"event":"user-joined"}"#).unwrap();
        assert_eq!(decoded.event, EV_USER_JOINED);
        assert!(decoded.data.is_null());
    }

    #[test]
    fn test_agent_role_parses() {
        let payload: UserJoinedPayload = serde_json::from_str(r#"{"userType":"agent"}"#).unwrap();
        assert_eq!(payload.user_type, UserRole::Agent);
    }
}
