//! Request and response types for the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::permission::DecisionKind;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session listing / lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub machine: String,
    pub bypass_permissions: bool,
    pub restricted: bool,
    /// `"active"` or `"idle"`.
    pub activity: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HostSessions {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize)]
pub struct MachineSessions {
    pub id: String,
    pub session_count: usize,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub local: HostSessions,
    pub machines: Vec<MachineSessions>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub worktree: bool,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub bypass_permissions: bool,
    #[serde(default)]
    pub restricted: bool,
    /// Extra role context written alongside the requested roles.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub success: bool,
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub machine: String,
}

#[derive(Debug, Deserialize)]
pub struct ForkRequest {
    pub target: String,
}

#[derive(Debug, Deserialize)]
pub struct SpawnSiblingRequest {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SpawnSiblingResponse {
    pub success: bool,
    pub pane: u32,
}

#[derive(Debug, Deserialize)]
pub struct CheckPathQuery {
    pub path: String,
    #[serde(default)]
    pub machine: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckPathResponse {
    pub is_git: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CheckBranchesQuery {
    pub path: String,
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Serialize)]
pub struct CheckBranchesResponse {
    pub existing: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MachineInfo {
    pub id: String,
    pub ssh: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Room control
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct SayRequest {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub option_number: Option<String>,
    #[serde(default)]
    pub custom: bool,
}

#[derive(Debug, Deserialize)]
pub struct PermissionHookRequest {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PermissionRespondRequest {
    pub decision: DecisionKind,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    pub text: String,
}
