//! Per-room output pump.
//!
//! One background task per room tails the multiplexer pane, diffs each
//! snapshot against the previous one, and publishes `output` frames plus
//! activity edges through the hub. The pump also scans the pane for the
//! structured question block and installs new questions on the room.
//!
//! Pump failures never propagate to callers: transient capture errors back
//! off and retry, a vanished session deletes the room and ends the pump.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::PortalError;
use crate::hub::RoomHub;
use crate::mux::MuxAdapter;
use crate::question::parse_question;
use crate::registry::{RoomId, SessionRegistry};

const BACKOFF_START: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Start the pump for a room unless one is already running.
pub async fn start(
    room: RoomId,
    hub: Arc<RoomHub>,
    registry: Arc<SessionRegistry>,
    mux: Arc<MuxAdapter>,
    config: Arc<Config>,
) {
    let key = room.canonical();
    let channel = hub.channel(&key).await;
    let token = CancellationToken::new();
    if !channel.install_pump(token.clone()).await {
        return;
    }
    tokio::spawn(run(room, hub, registry, mux, config, token));
}

async fn run(
    room: RoomId,
    hub: Arc<RoomHub>,
    registry: Arc<SessionRegistry>,
    mux: Arc<MuxAdapter>,
    config: Arc<Config>,
    token: CancellationToken,
) {
    let key = room.canonical();
    let session = room.session_name();
    let interval = Duration::from_millis(config.pump.interval_ms);
    let mut last_snapshot = String::new();
    let mut backoff = BACKOFF_START;

    tracing::debug!("output pump for '{}' started", key);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let snapshot = match mux
            .capture_pane(&room.host, &session, config.pump.capture_lines)
            .await
        {
            Ok(text) => {
                backoff = BACKOFF_START;
                text
            }
            Err(PortalError::NotFound(_)) => {
                tracing::info!("session '{}' gone, stopping pump", key);
                let _ = registry.delete(&key).await;
                break;
            }
            Err(e) => {
                tracing::debug!("capture of '{}' failed: {}, backing off", key, e);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        };

        if snapshot == last_snapshot {
            continue;
        }

        let frame = bounded_diff(&last_snapshot, &snapshot, config.pump.max_frame_bytes);
        if !frame.is_empty() {
            hub.publish_output(&key, frame).await;
        } else {
            hub.touch_activity(&key).await;
        }

        scan_for_question(&hub, &key, &snapshot).await;
        last_snapshot = snapshot;
    }

    tracing::debug!("output pump for '{}' stopped", key);
}

async fn scan_for_question(hub: &RoomHub, key: &str, snapshot: &str) {
    let Some(question) = parse_question(snapshot) else {
        return;
    };
    let channel = hub.channel(key).await;
    let is_new = match channel.current_question().await {
        Some(current) => !current.same_prompt(&question),
        None => true,
    };
    if is_new {
        tracing::info!("question detected in '{}': {}", key, question.question);
        channel.set_question(question).await;
    }
}

/// The appended suffix when the new snapshot extends the old one; otherwise
/// the tail of the new snapshot. Never more than `max` bytes, and always on
/// a char boundary.
fn bounded_diff(old: &str, new: &str, max: usize) -> String {
    let prefix = common_prefix_len(old, new);
    // A pure append diffs to the suffix; a redraw (short shared prefix)
    // resends the pane tail instead.
    let diff = if prefix == old.len() {
        &new[prefix..]
    } else {
        new
    };
    tail_on_boundary(diff, max).to_string()
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    let bytes = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .take_while(|(x, y)| x == y)
        .count();
    // Walk back to a char boundary.
    let mut len = bytes;
    while len > 0 && !a.is_char_boundary(len) {
        len -= 1;
    }
    len
}

fn tail_on_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_produces_suffix() {
        assert_eq!(bounded_diff("hello\n", "hello\nworld\n", 10_240), "world\n");
    }

    #[test]
    fn redraw_resends_tail() {
        // The pane scrolled: old content is not a prefix of the new.
        let old = "line1\nline2\n";
        let new = "line2\nline3\n";
        assert_eq!(bounded_diff(old, new, 10_240), new);
    }

    #[test]
    fn oversized_diff_is_bounded_to_tail() {
        let old = "";
        let new = "x".repeat(20_000);
        let diff = bounded_diff(old, &new, 10_240);
        assert_eq!(diff.len(), 10_240);
    }

    #[test]
    fn bound_respects_char_boundaries() {
        let new = "é".repeat(6000); // 2 bytes each
        let diff = bounded_diff("", &new, 10_001);
        assert!(diff.len() <= 10_001);
        assert!(diff.chars().all(|c| c == 'é'));
    }

    #[test]
    fn identical_snapshots_diff_empty() {
        assert_eq!(bounded_diff("same", "same", 10_240), "");
    }

    #[test]
    fn prefix_len_is_char_safe() {
        // "héll" is 5 bytes (é is 2).
        assert_eq!(common_prefix_len("héllo", "héllp"), 5);
        assert_eq!(common_prefix_len("abc", "abc"), 3);
        assert_eq!(common_prefix_len("", "abc"), 0);
    }
}
