//! Permission-hook rendezvous.
//!
//! The agent's pre-tool hook POSTs a permission request and blocks on the
//! response. The broker parks that request on a oneshot channel until a
//! browser answers, a policy resolves it, or the deadline passes. One pending
//! request per room; a second concurrent request is a `Conflict`.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::error::{PortalError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionKind {
    Allow,
    Deny,
    AskEscalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            decision: DecisionKind::Allow,
            message: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            decision: DecisionKind::Deny,
            message: Some(message.into()),
        }
    }
}

/// The pending request as seen by browsers.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionRequest {
    pub id: Uuid,
    pub tool: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

struct PendingEntry {
    id: Uuid,
    tx: oneshot::Sender<Decision>,
}

/// Correlates hook POSTs with browser decisions, one slot per room.
pub struct PermissionBroker {
    pending: Mutex<HashMap<String, PendingEntry>>,
    deadline: Duration,
}

impl PermissionBroker {
    pub fn new(deadline: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            deadline,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Park a request. Fails with `Conflict` while another is pending.
    pub async fn register(
        &self,
        room: &str,
        request: &PermissionRequest,
    ) -> Result<oneshot::Receiver<Decision>> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(room) {
            return Err(PortalError::Conflict(format!(
                "a permission request is already pending for '{}'",
                room
            )));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            room.to_string(),
            PendingEntry {
                id: request.id,
                tx,
            },
        );
        Ok(rx)
    }

    /// Resolve the room's pending request with a browser decision.
    pub async fn respond(&self, room: &str, decision: Decision) -> Result<()> {
        let entry = {
            let mut pending = self.pending.lock().await;
            pending.remove(room)
        };
        match entry {
            Some(entry) => {
                // The hook side may have timed out concurrently; that race is benign.
                let _ = entry.tx.send(decision);
                Ok(())
            }
            None => Err(PortalError::NotFound(format!(
                "no pending permission request for '{}'",
                room
            ))),
        }
    }

    /// Remove the entry after a deadline fired, but only if it is still the
    /// same request (a later request must not be clobbered).
    pub async fn expire(&self, room: &str, id: Uuid) -> bool {
        let mut pending = self.pending.lock().await;
        if pending.get(room).map(|e| e.id) == Some(id) {
            pending.remove(room);
            true
        } else {
            false
        }
    }

    /// Resolve any pending request with deny; used on room destruction.
    pub async fn cancel_room(&self, room: &str) {
        let entry = {
            let mut pending = self.pending.lock().await;
            pending.remove(room)
        };
        if let Some(entry) = entry {
            let _ = entry.tx.send(Decision::deny("session closed"));
        }
    }

    pub async fn has_pending(&self, room: &str) -> bool {
        self.pending.lock().await.contains_key(room)
    }
}

fn say_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^(say|remote-say) "[^"]*"$"#).unwrap())
}

/// Built-in policy for restricted mode. Never surfaces to browsers.
pub fn policy_decide(tool: &str, input: &Value) -> Decision {
    match tool {
        "AskUserQuestion" => Decision::allow(),
        "Bash" => {
            let command = input
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if say_re().is_match(command.trim()) {
                Decision::allow()
            } else {
                Decision::deny("restricted")
            }
        }
        _ => Decision::deny("restricted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(tool: &str) -> PermissionRequest {
        PermissionRequest {
            id: Uuid::new_v4(),
            tool: tool.to_string(),
            input: json!({}),
            message: None,
        }
    }

    #[test]
    fn policy_allows_questions() {
        assert_eq!(
            policy_decide("AskUserQuestion", &json!({})).decision,
            DecisionKind::Allow
        );
    }

    #[test]
    fn policy_allows_quoted_say_only() {
        let allow = |cmd: &str| policy_decide("Bash", &json!({ "command": cmd })).decision;
        assert_eq!(allow(r#"say "hi""#), DecisionKind::Allow);
        assert_eq!(allow(r#"remote-say "all done""#), DecisionKind::Allow);
        assert_eq!(allow(r#"say "hi"; rm -rf /"#), DecisionKind::Deny);
        assert_eq!(allow(r#"say "a" "b""#), DecisionKind::Deny);
        assert_eq!(allow("ls"), DecisionKind::Deny);
    }

    #[test]
    fn policy_denies_everything_else() {
        let d = policy_decide("Edit", &json!({"file_path": "/x"}));
        assert_eq!(d.decision, DecisionKind::Deny);
        assert_eq!(d.message.as_deref(), Some("restricted"));
    }

    #[test]
    fn decision_wire_shape() {
        let d = Decision {
            decision: DecisionKind::AskEscalate,
            message: None,
        };
        assert_eq!(
            serde_json::to_value(&d).unwrap(),
            json!({"decision": "ask-escalate"})
        );
    }

    #[tokio::test]
    async fn second_request_conflicts() {
        let broker = PermissionBroker::new(Duration::from_secs(300));
        let _rx = broker.register("api", &request("Edit")).await.unwrap();
        let err = broker.register("api", &request("Bash")).await.unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[tokio::test]
    async fn respond_resolves_the_waiter() {
        let broker = PermissionBroker::new(Duration::from_secs(300));
        let rx = broker.register("api", &request("Edit")).await.unwrap();
        broker.respond("api", Decision::allow()).await.unwrap();
        let decision = rx.await.unwrap();
        assert_eq!(decision.decision, DecisionKind::Allow);
        assert!(!broker.has_pending("api").await);
    }

    #[tokio::test]
    async fn respond_without_pending_is_not_found() {
        let broker = PermissionBroker::new(Duration::from_secs(300));
        let err = broker
            .respond("api", Decision::allow())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn expire_only_removes_matching_id() {
        let broker = PermissionBroker::new(Duration::from_secs(300));
        let req = request("Edit");
        let _rx = broker.register("api", &req).await.unwrap();
        assert!(!broker.expire("api", Uuid::new_v4()).await);
        assert!(broker.expire("api", req.id).await);
        assert!(!broker.has_pending("api").await);
    }

    #[tokio::test]
    async fn cancel_room_denies_waiter() {
        let broker = PermissionBroker::new(Duration::from_secs(300));
        let rx = broker.register("api", &request("Edit")).await.unwrap();
        broker.cancel_room("api").await;
        let decision = rx.await.unwrap();
        assert_eq!(decision.decision, DecisionKind::Deny);
    }
}
