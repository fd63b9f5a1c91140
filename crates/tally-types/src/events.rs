use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::models::{SessionId, SessionView, Template, UserId};

/// What a client asks the core to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ActionPayload {
    Vote { value: String },
    Reveal,
    Reset,
    TemplateUpdate { template: Template },
    Heartbeat,
    Leave,
}

impl ActionPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Vote { .. } => "vote",
            Self::Reveal => "reveal",
            Self::Reset => "reset",
            Self::TemplateUpdate { .. } => "template_update",
            Self::Heartbeat => "heartbeat",
            Self::Leave => "leave",
        }
    }
}

/// Inbound action envelope, identical on every transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAction {
    pub session_id: SessionId,
    pub user_id: UserId,
    #[serde(flatten)]
    pub payload: ActionPayload,
    /// Push-channel connection this action arrived alongside, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<Uuid>,
}

impl ClientAction {
    pub fn new(session_id: impl Into<SessionId>, user_id: impl Into<UserId>, payload: ActionPayload) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            payload,
            connection_id: None,
        }
    }
}

/// Events pushed from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// First event on every push channel.
    Connected {
        connection_id: Uuid,
        session: SessionView,
    },

    /// Full snapshot after any accepted mutation.
    SessionUpdate { session: SessionView },

    HeartbeatAck { timestamp: DateTime<Utc> },

    /// The session record is gone; clients should stop.
    SessionExpired { session_id: SessionId },

    Error { code: ErrorCode, message: String },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::SessionUpdate { .. } => "session_update",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
            Self::SessionExpired { .. } => "session_expired",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// The snapshot carried by this event, if any.
    pub fn session(&self) -> Option<&SessionView> {
        match self {
            Self::Connected { session, .. } | Self::SessionUpdate { session } => Some(session),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wire_format_is_flat() {
        let action = ClientAction::new("s1", "u1", ActionPayload::Vote { value: "5".into() });
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "vote");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["data"]["value"], "5");

        let parsed: ClientAction = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, action);
    }

    #[test]
    fn data_less_actions_parse() {
        let parsed: ClientAction =
            serde_json::from_str(r#"{"type":"reveal","sessionId":"s1","userId":"h"}"#).unwrap();
        assert_eq!(parsed.payload, ActionPayload::Reveal);
        assert_eq!(parsed.connection_id, None);
    }

    #[test]
    fn error_event_uses_snake_case_code() {
        let event = ServerEvent::error(ErrorCode::PoolFull, "session has 50 sockets");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["code"], "pool_full");
    }

    #[test]
    fn expired_event_fields_are_camel_case() {
        let event = ServerEvent::SessionExpired { session_id: "s9".into() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["data"]["sessionId"], "s9");
    }
}
