//! Append-only audit log, one JSON object per line.
//!
//! Records orchestrator verbs and permission decisions. Best-effort: a write
//! failure is logged and dropped, never surfaced to the caller.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    SessionCreated {
        session: String,
        path: String,
        machine: String,
    },
    SessionKilled {
        session: String,
    },
    SessionForked {
        source: String,
        target: String,
    },
    SessionRecreated {
        session: String,
    },
    PaneSpawned {
        session: String,
        pane: u32,
    },
    PermissionDecision {
        session: String,
        tool: String,
        decision: String,
        by_policy: bool,
    },
}

#[derive(Serialize)]
struct AuditLine<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn record(&self, event: AuditEvent) {
        let line = AuditLine {
            ts: Utc::now(),
            event: &event,
        };
        let mut serialized = match serde_json::to_string(&line) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("audit serialization failed: {}", e);
                return;
            }
        };
        serialized.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await;
        match result {
            Ok(mut file) => {
                if let Err(e) = file.write_all(serialized.as_bytes()).await {
                    tracing::warn!("audit write failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("audit open failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        log.record(AuditEvent::SessionKilled {
            session: "api".to_string(),
        })
        .await;
        log.record(AuditEvent::PermissionDecision {
            session: "api".to_string(),
            tool: "Edit".to_string(),
            decision: "deny".to_string(),
            by_policy: true,
        })
        .await;

        let contents = tokio::fs::read_to_string(dir.path().join("audit.log"))
            .await
            .unwrap();
        let lines: Vec<&str> = contents.trim().lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "session_killed");
        assert_eq!(first["session"], "api");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["decision"], "deny");
        assert!(second["ts"].is_string());
    }
}
