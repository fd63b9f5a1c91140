use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::models::{Role, SessionId, SessionView, Template, UserId};

// -- Sessions --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub name: String,
    #[serde(default)]
    pub template: Option<Template>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub session: SessionView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionRequest {
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionResponse {
    pub user_id: UserId,
    pub session: SessionView,
}

/// Viewer identity for snapshot reads and push-channel upgrades.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerQuery {
    #[serde(default)]
    pub user_id: Option<UserId>,
}

// -- Actions --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    /// `None` when the action ended the session.
    pub session: Option<SessionView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

// -- Stats --

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub sessions: usize,
    pub connections: usize,
    pub sessions_with_connections: usize,
    pub disconnects_total: u64,
    pub broadcast_failures_total: u64,
    pub average_quality: f64,
}
