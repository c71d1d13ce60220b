//! Thin adapter over the tmux terminal multiplexer.
//!
//! All operations are parameterized by host and go through the
//! [`HostExecutor`], so the same code drives local and remote multiplexers.
//! Pane 0 of every session is the orchestrating agent; panes 1+ are workers.
//!
//! `send_keys` implements the keystroke-with-pause contract: text is split on
//! embedded newlines, each segment is delivered literally, and an Enter
//! follows after a short pause so the foreground program sees the segment
//! before the submit.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::error::{PortalError, Result};
use crate::host::{HostExecutor, HostId, PtyHandle};

/// Pause between a literal segment and its Enter.
const SEGMENT_PAUSE: Duration = Duration::from_millis(80);
/// Pause after each key group in the multi-argument form.
const KEY_GROUP_PAUSE: Duration = Duration::from_millis(120);
/// Poll cadence while waiting for a graceful exit.
const EXIT_POLL: Duration = Duration::from_millis(300);

/// One session as reported by the multiplexer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub name: String,
    pub windows: u32,
}

/// Metadata for a single pane.
#[derive(Debug, Clone, Serialize)]
pub struct PaneInfo {
    pub cwd: String,
    pub command: String,
    pub cols: u16,
    pub rows: u16,
}

pub struct MuxAdapter {
    exec: Arc<HostExecutor>,
    graceful_exit: Duration,
}

fn tmux(args: &[&str]) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push("tmux".to_string());
    argv.extend(args.iter().map(|s| s.to_string()));
    argv
}

/// Map a failed tmux invocation to the adapter failure model.
fn map_failure(what: &str, stderr: &str) -> PortalError {
    let lower = stderr.to_lowercase();
    if lower.contains("can't find session")
        || lower.contains("session not found")
        || lower.contains("can't find pane")
        || lower.contains("no server running")
    {
        PortalError::NotFound(what.to_string())
    } else if lower.contains("duplicate session") {
        PortalError::AlreadyExists(what.to_string())
    } else {
        PortalError::Internal(format!("tmux {}: {}", what, stderr.trim()))
    }
}

impl MuxAdapter {
    pub fn new(exec: Arc<HostExecutor>, config: &Config) -> Self {
        Self {
            exec,
            graceful_exit: config.timeouts.graceful_exit(),
        }
    }

    async fn invoke(&self, host: &HostId, what: &str, args: &[&str]) -> Result<String> {
        let out = self.exec.run(host, &tmux(args), None).await?;
        if !out.success() {
            return Err(map_failure(what, &out.stderr));
        }
        Ok(out.stdout_str())
    }

    /// Create a detached session running `initial_command` in `cwd`.
    pub async fn new_session(
        &self,
        host: &HostId,
        id: &str,
        cwd: &str,
        initial_command: &str,
    ) -> Result<()> {
        self.invoke(
            host,
            id,
            &[
                "new-session",
                "-d",
                "-s",
                id,
                "-c",
                cwd,
                initial_command,
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn has_session(&self, host: &HostId, id: &str) -> Result<bool> {
        let out = self
            .exec
            .run(host, &tmux(&["has-session", "-t", &exact_target(id)]), None)
            .await?;
        Ok(out.success())
    }

    /// Ask the foreground program to exit, then kill the session if it is
    /// still around after the graceful window.
    pub async fn kill_session(&self, host: &HostId, id: &str) -> Result<()> {
        if !self.has_session(host, id).await? {
            return Err(PortalError::NotFound(id.to_string()));
        }

        // Graceful: the agent understands a literal `/exit`.
        let _ = self.send_keys(host, id, "/exit").await;

        let deadline = tokio::time::Instant::now() + self.graceful_exit;
        loop {
            if !self.has_session(host, id).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }

        tracing::debug!("session '{}' ignored /exit, killing", id);
        self.invoke(host, id, &["kill-session", "-t", &exact_target(id)])
            .await?;
        Ok(())
    }

    /// Deliver text to the foreground program, one line at a time.
    pub async fn send_keys(&self, host: &HostId, id: &str, text: &str) -> Result<()> {
        for segment in text.split('\n') {
            if !segment.is_empty() {
                let target = exact_target(id);
                self.invoke(host, id, &["send-keys", "-t", &target, "-l", "--", segment])
                    .await?;
            }
            tokio::time::sleep(SEGMENT_PAUSE).await;
            self.press_enter(host, id).await?;
        }
        Ok(())
    }

    /// Multi-argument key-group form: each group is delivered literally,
    /// followed by a pause and no Enter. Composes one submission out of
    /// several pieces (e.g. a menu selection followed by typed text); the
    /// caller presses Enter when the submission is complete.
    pub async fn send_key_groups(&self, host: &HostId, id: &str, groups: &[String]) -> Result<()> {
        let target = exact_target(id);
        for group in groups {
            if !group.is_empty() {
                self.invoke(
                    host,
                    id,
                    &["send-keys", "-t", &target, "-l", "--", group.as_str()],
                )
                .await?;
            }
            tokio::time::sleep(KEY_GROUP_PAUSE).await;
        }
        Ok(())
    }

    /// Press Enter in the pane.
    pub async fn press_enter(&self, host: &HostId, id: &str) -> Result<()> {
        let target = exact_target(id);
        self.invoke(host, id, &["send-keys", "-t", &target, "Enter"])
            .await?;
        Ok(())
    }

    /// Last `lines` lines of pane text (pane 0).
    pub async fn capture_pane(&self, host: &HostId, id: &str, lines: usize) -> Result<String> {
        let start = format!("-{}", lines);
        self.invoke(
            host,
            id,
            &["capture-pane", "-p", "-t", &exact_target(id), "-S", &start],
        )
        .await
    }

    pub async fn list_sessions(&self, host: &HostId) -> Result<Vec<SessionEntry>> {
        let out = self
            .exec
            .run(
                host,
                &tmux(&[
                    "list-sessions",
                    "-F",
                    "#{session_name}\t#{session_windows}",
                ]),
                None,
            )
            .await?;
        if !out.success() {
            // No server yet means no sessions, not an error.
            if out.stderr.to_lowercase().contains("no server running") {
                return Ok(Vec::new());
            }
            return Err(map_failure("list-sessions", &out.stderr));
        }
        Ok(parse_session_list(&out.stdout_str()))
    }

    pub async fn pane_info(&self, host: &HostId, id: &str, pane: u32) -> Result<PaneInfo> {
        let target = format!("{}.{}", exact_target(id), pane);
        let text = self
            .invoke(
                host,
                id,
                &[
                    "display-message",
                    "-p",
                    "-t",
                    &target,
                    "#{pane_current_path}\t#{pane_current_command}\t#{pane_width}\t#{pane_height}",
                ],
            )
            .await?;
        parse_pane_info(&text).ok_or_else(|| {
            PortalError::Internal(format!("unparseable pane info for '{}': {}", id, text.trim()))
        })
    }

    /// Pane indexes and their foreground commands.
    pub async fn list_panes(&self, host: &HostId, id: &str) -> Result<Vec<(u32, String)>> {
        let text = self
            .invoke(
                host,
                id,
                &[
                    "list-panes",
                    "-t",
                    &exact_target(id),
                    "-F",
                    "#{pane_index}\t#{pane_current_command}",
                ],
            )
            .await?;
        Ok(text
            .lines()
            .filter_map(|line| {
                let (idx, cmd) = line.split_once('\t')?;
                Some((idx.trim().parse().ok()?, cmd.trim().to_string()))
            })
            .collect())
    }

    /// Split a new pane running `cmd`; returns the new pane index.
    pub async fn spawn_pane(&self, host: &HostId, id: &str, cmd: &str) -> Result<u32> {
        let text = self
            .invoke(
                host,
                id,
                &[
                    "split-window",
                    "-d",
                    "-t",
                    &exact_target(id),
                    "-P",
                    "-F",
                    "#{pane_index}",
                    cmd,
                ],
            )
            .await?;
        text.trim()
            .parse()
            .map_err(|_| PortalError::Internal(format!("unexpected pane index '{}'", text.trim())))
    }

    pub async fn kill_pane(&self, host: &HostId, id: &str, index: u32) -> Result<()> {
        if index == 0 {
            return Err(PortalError::Conflict(
                "pane 0 is the orchestrator and cannot be killed".to_string(),
            ));
        }
        let target = format!("{}.{}", exact_target(id), index);
        self.invoke(host, id, &["kill-pane", "-t", &target]).await?;
        Ok(())
    }

    /// Raw byte-duplex attached to the session, for browser terminal mode.
    pub async fn attach_pty(
        &self,
        host: &HostId,
        id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<PtyHandle> {
        if !self.has_session(host, id).await? {
            return Err(PortalError::NotFound(id.to_string()));
        }
        let argv = tmux(&["attach-session", "-t", &exact_target(id)]);
        self.exec.attach_pty(host, &argv, cols, rows).await
    }
}

/// tmux treats `-t name` as a prefix match; `=name` pins it exact.
fn exact_target(id: &str) -> String {
    format!("={}", id)
}

fn parse_session_list(text: &str) -> Vec<SessionEntry> {
    text.lines()
        .filter_map(|line| {
            let (name, windows) = line.split_once('\t')?;
            Some(SessionEntry {
                name: name.to_string(),
                windows: windows.trim().parse().unwrap_or(1),
            })
        })
        .collect()
}

fn parse_pane_info(text: &str) -> Option<PaneInfo> {
    let mut parts = text.trim_end().split('\t');
    let cwd = parts.next()?.to_string();
    let command = parts.next()?.to_string();
    let cols = parts.next()?.trim().parse().ok()?;
    let rows = parts.next()?.trim().parse().ok()?;
    Some(PaneInfo {
        cwd,
        command,
        cols,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_mapping() {
        assert_eq!(
            map_failure("api", "can't find session: api").kind(),
            "NotFound"
        );
        assert_eq!(
            map_failure("api", "duplicate session: api").kind(),
            "AlreadyExists"
        );
        assert_eq!(
            map_failure("api", "something else entirely").kind(),
            "Internal"
        );
    }

    #[test]
    fn session_list_parsing() {
        let parsed = parse_session_list("api\t2\nweb/feat\t1\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "api");
        assert_eq!(parsed[0].windows, 2);
        assert_eq!(parsed[1].name, "web/feat");
    }

    #[test]
    fn pane_info_parsing() {
        let info = parse_pane_info("/home/u/projects/api\tclaude\t181\t44\n").unwrap();
        assert_eq!(info.cwd, "/home/u/projects/api");
        assert_eq!(info.command, "claude");
        assert_eq!(info.cols, 181);
        assert_eq!(info.rows, 44);
        assert!(parse_pane_info("garbage").is_none());
    }

    #[test]
    fn exact_target_pins_name() {
        assert_eq!(exact_target("api"), "=api");
    }
}
