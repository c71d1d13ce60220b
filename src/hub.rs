//! Per-room state and WebSocket fan-out.
//!
//! Each room owns: the set of connected browser sockets, the single-talker
//! lock, the pending question, the pending permission request, and the
//! activity timestamp. Outbound frames go through an ordered queue with a
//! single consumer per room, so every subscriber sees frames in broadcast
//! order. Slow subscribers get a small per-frame budget and are dropped
//! after repeated overruns rather than stalling the room.
//!
//! A portal-wide dashboard channel mirrors `session_activity` edges for the
//! session list UI.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::host::HostExecutor;
use crate::permission::PermissionRequest;
use crate::question::{Question, QuestionOption};
use crate::registry::SessionRegistry;

/// Budget for handing one frame to one subscriber's outbound buffer.
const SEND_BUDGET: Duration = Duration::from_millis(50);
/// Consecutive budget overruns before a subscriber is dropped.
const MAX_OVERRUNS: u32 = 3;
/// Outbound buffer per subscriber, in frames.
const SUBSCRIBER_BUFFER: usize = 256;
/// Idle detection tick.
const ACTIVITY_TICK: Duration = Duration::from_secs(1);

/// Messages sent to room subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Output {
        data: String,
    },
    Activity,
    SessionActivity {
        session: String,
        active: bool,
    },
    TtsStart {
        text: String,
    },
    Audio {
        data: String,
    },
    Question {
        header: String,
        question: String,
        options: Vec<QuestionOption>,
    },
    QuestionAnswered,
    PermissionRequest {
        tool: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    PermissionResolved,
    SessionLocked,
    SessionUnlocked,
}

/// Messages received from room subscribers.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RecordingStarted,
    RecordingStopped,
}

fn encode(msg: &ServerMessage) -> Arc<String> {
    // ServerMessage serialization cannot fail: no maps with non-string keys.
    Arc::new(serde_json::to_string(msg).unwrap_or_default())
}

struct SubscriberHandle {
    tx: mpsc::Sender<Arc<String>>,
    overruns: u32,
}

struct TalkerLock {
    holder: Uuid,
    acquired: Instant,
}

struct ChannelState {
    subscribers: HashMap<Uuid, SubscriberHandle>,
    lock: Option<TalkerLock>,
    question: Option<Question>,
    question_gen: u64,
    permission: Option<PermissionRequest>,
    last_activity: Instant,
    active: bool,
}

/// One room's live state and fan-out queue.
pub struct RoomChannel {
    pub room: String,
    state: Mutex<ChannelState>,
    queue_tx: mpsc::UnboundedSender<Arc<String>>,
    pump_token: Mutex<Option<CancellationToken>>,
    token: CancellationToken,
    lock_ttl: Duration,
    question_expiry: Duration,
}

impl RoomChannel {
    fn new(room: String, lock_ttl: Duration, question_expiry: Duration) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Arc<String>>();
        let channel = Arc::new(Self {
            room,
            state: Mutex::new(ChannelState {
                subscribers: HashMap::new(),
                lock: None,
                question: None,
                question_gen: 0,
                permission: None,
                last_activity: Instant::now(),
                active: false,
            }),
            queue_tx,
            pump_token: Mutex::new(None),
            token: CancellationToken::new(),
            lock_ttl,
            question_expiry,
        });

        // Single consumer: dispatches each frame to every subscriber in
        // queue order.
        let consumer = Arc::clone(&channel);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = consumer.token.cancelled() => break,
                    frame = queue_rx.recv() => match frame {
                        Some(f) => f,
                        None => break,
                    },
                };
                consumer.dispatch(frame).await;
            }
        });

        channel
    }

    async fn dispatch(&self, frame: Arc<String>) {
        let mut state = self.state.lock().await;
        let mut dropped = Vec::new();
        for (id, sub) in state.subscribers.iter_mut() {
            let delivered =
                tokio::time::timeout(SEND_BUDGET, sub.tx.send(Arc::clone(&frame))).await;
            match delivered {
                Ok(Ok(())) => sub.overruns = 0,
                Ok(Err(_)) => dropped.push(*id),
                Err(_) => {
                    sub.overruns += 1;
                    if sub.overruns >= MAX_OVERRUNS {
                        dropped.push(*id);
                    }
                }
            }
        }
        for id in dropped {
            tracing::warn!("dropping slow subscriber {} from '{}'", id, self.room);
            state.subscribers.remove(&id);
        }
    }

    /// Register a browser socket; returns its id and the frame stream.
    pub async fn subscribe(&self) -> (Uuid, mpsc::Receiver<Arc<String>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut state = self.state.lock().await;
        state
            .subscribers
            .insert(id, SubscriberHandle { tx, overruns: 0 });
        tracing::debug!("subscriber {} joined '{}'", id, self.room);
        (id, rx)
    }

    /// Remove a subscriber; releases its talker lock if held.
    pub async fn unsubscribe(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        state.subscribers.remove(&id);
        if state.lock.as_ref().map(|l| l.holder) == Some(id) {
            state.lock = None;
            drop(state);
            self.broadcast(&ServerMessage::SessionUnlocked);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    /// Enqueue a frame for every subscriber.
    pub fn broadcast(&self, msg: &ServerMessage) {
        let _ = self.queue_tx.send(encode(msg));
    }

    /// Cooperative single-talker lock with an idle TTL.
    pub async fn try_lock(&self, holder: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let free = match &state.lock {
            None => true,
            Some(lock) => {
                lock.holder == holder || now.duration_since(lock.acquired) > self.lock_ttl
            }
        };
        if free {
            state.lock = Some(TalkerLock {
                holder,
                acquired: now,
            });
            drop(state);
            self.broadcast(&ServerMessage::SessionLocked);
        }
        free
    }

    pub async fn unlock(&self, holder: Uuid) -> bool {
        let mut state = self.state.lock().await;
        if state.lock.as_ref().map(|l| l.holder) == Some(holder) {
            state.lock = None;
            drop(state);
            self.broadcast(&ServerMessage::SessionUnlocked);
            true
        } else {
            false
        }
    }

    /// Install a new pending question, superseding any prior one, and start
    /// its expiry timer.
    pub async fn set_question(self: &Arc<Self>, question: Question) {
        let generation = {
            let mut state = self.state.lock().await;
            state.question = Some(question.clone());
            state.question_gen += 1;
            state.question_gen
        };
        self.broadcast(&ServerMessage::Question {
            header: question.header,
            question: question.question,
            options: question.options,
        });

        let channel = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = channel.token.cancelled() => {}
                _ = tokio::time::sleep(channel.question_expiry) => {
                    let mut state = channel.state.lock().await;
                    if state.question_gen == generation {
                        state.question = None;
                        tracing::debug!("question in '{}' expired", channel.room);
                    }
                }
            }
        });
    }

    pub async fn current_question(&self) -> Option<Question> {
        self.state.lock().await.question.clone()
    }

    /// Clear the question slot and announce the answer.
    pub async fn take_question(&self) -> Option<Question> {
        let taken = {
            let mut state = self.state.lock().await;
            state.question_gen += 1;
            state.question.take()
        };
        if taken.is_some() {
            self.broadcast(&ServerMessage::QuestionAnswered);
        }
        taken
    }

    pub async fn set_permission(&self, request: PermissionRequest) {
        let mut state = self.state.lock().await;
        state.permission = Some(request.clone());
        drop(state);
        self.broadcast(&ServerMessage::PermissionRequest {
            tool: request.tool,
            input: request.input,
            message: request.message,
        });
    }

    pub async fn resolve_permission(&self) {
        let mut state = self.state.lock().await;
        state.permission = None;
        drop(state);
        self.broadcast(&ServerMessage::PermissionResolved);
    }

    pub async fn current_permission(&self) -> Option<PermissionRequest> {
        self.state.lock().await.permission.clone()
    }

    /// Bump the activity timestamp; returns true on the idle→active edge.
    pub async fn touch_activity(&self) -> bool {
        let mut state = self.state.lock().await;
        let was_active = state.active;
        state.active = true;
        state.last_activity = Instant::now();
        !was_active
    }

    /// Flip to idle when quiet; returns true on the active→idle edge.
    async fn check_idle(&self, idle_after: Duration) -> bool {
        let mut state = self.state.lock().await;
        if state.active && state.last_activity.elapsed() > idle_after {
            state.active = false;
            true
        } else {
            false
        }
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    /// Record the pump for this room. Returns false when one already runs.
    pub async fn install_pump(&self, token: CancellationToken) -> bool {
        let mut guard = self.pump_token.lock().await;
        match guard.as_ref() {
            Some(existing) if !existing.is_cancelled() => false,
            _ => {
                *guard = Some(token);
                true
            }
        }
    }

    pub async fn pump_running(&self) -> bool {
        self.pump_token
            .lock()
            .await
            .as_ref()
            .map(|t| !t.is_cancelled())
            .unwrap_or(false)
    }

    /// Tear the room down: stop the pump and disconnect all subscribers.
    async fn shutdown(&self) {
        if let Some(token) = self.pump_token.lock().await.take() {
            token.cancel();
        }
        self.token.cancel();
        let mut state = self.state.lock().await;
        state.subscribers.clear();
        state.question = None;
        state.permission = None;
        state.lock = None;
    }
}

/// The multi-room hub.
pub struct RoomHub {
    rooms: RwLock<HashMap<String, Arc<RoomChannel>>>,
    dashboard: Arc<RoomChannel>,
    registry: Arc<SessionRegistry>,
    exec: Arc<HostExecutor>,
    config: Arc<Config>,
}

impl RoomHub {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        exec: Arc<HostExecutor>,
    ) -> Arc<Self> {
        let dashboard = RoomChannel::new(
            "dashboard".to_string(),
            config.timeouts.lock_ttl(),
            config.timeouts.question_expiry(),
        );
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            dashboard,
            registry,
            exec,
            config,
        })
    }

    /// The per-room channel, created on first use.
    pub async fn channel(&self, room: &str) -> Arc<RoomChannel> {
        {
            let rooms = self.rooms.read().await;
            if let Some(channel) = rooms.get(room) {
                return Arc::clone(channel);
            }
        }
        let mut rooms = self.rooms.write().await;
        let channel = rooms.entry(room.to_string()).or_insert_with(|| {
            RoomChannel::new(
                room.to_string(),
                self.config.timeouts.lock_ttl(),
                self.config.timeouts.question_expiry(),
            )
        });
        Arc::clone(channel)
    }

    pub async fn existing(&self, room: &str) -> Option<Arc<RoomChannel>> {
        self.rooms.read().await.get(room).cloned()
    }

    pub fn dashboard(&self) -> Arc<RoomChannel> {
        Arc::clone(&self.dashboard)
    }

    /// Remove a room's channel and tear it down.
    pub async fn remove(&self, room: &str) {
        let channel = {
            let mut rooms = self.rooms.write().await;
            rooms.remove(room)
        };
        if let Some(channel) = channel {
            channel.shutdown().await;
            tracing::info!("room '{}' torn down", room);
        }
    }

    /// Publish pane output and register the activity edge.
    pub async fn publish_output(&self, room: &str, data: String) {
        let channel = self.channel(room).await;
        channel.broadcast(&ServerMessage::Output { data });
        channel.broadcast(&ServerMessage::Activity);
        self.touch_activity(room).await;
    }

    /// Bump activity; on the idle→active edge announce it on the room and
    /// dashboard sockets.
    pub async fn touch_activity(&self, room: &str) {
        let channel = self.channel(room).await;
        if channel.touch_activity().await {
            let msg = ServerMessage::SessionActivity {
                session: room.to_string(),
                active: true,
            };
            channel.broadcast(&msg);
            self.dashboard.broadcast(&msg);
        }
    }

    /// "active" / "idle" for listings.
    pub async fn activity_state(&self, room: &str) -> &'static str {
        match self.existing(room).await {
            Some(channel) if channel.is_active().await => "active",
            _ => "idle",
        }
    }

    /// 1s idle-detection tick across all rooms.
    pub async fn run_activity_loop(self: Arc<Self>, token: CancellationToken) {
        let idle_after = self.config.timeouts.idle_after();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(ACTIVITY_TICK) => {}
            }
            let channels: Vec<Arc<RoomChannel>> =
                self.rooms.read().await.values().cloned().collect();
            for channel in channels {
                if channel.check_idle(idle_after).await {
                    let msg = ServerMessage::SessionActivity {
                        session: channel.room.clone(),
                        active: false,
                    };
                    channel.broadcast(&msg);
                    self.dashboard.broadcast(&msg);
                    self.notify_parent(&channel.room).await;
                }
            }
        }
    }

    /// Hierarchical idle notification: invoke the configured notify command
    /// toward the parent room, if any.
    async fn notify_parent(&self, room: &str) {
        let Some(notify) = self.config.notify_command.clone() else {
            return;
        };
        let Some(parent) = self
            .registry
            .get(room)
            .await
            .and_then(|r| r.parent.clone())
        else {
            return;
        };
        let mut argv = notify;
        argv.push(parent.clone());
        argv.push(format!("{} is idle", room));
        match self.exec.run(&crate::host::HostId::Local, &argv, None).await {
            Ok(out) if !out.success() => {
                tracing::warn!("parent notify for '{}' exited {}", room, out.exit)
            }
            Err(e) => tracing::warn!("parent notify for '{}' failed: {}", room, e),
            _ => {}
        }
    }

    /// Close every room with a going-away frame stream teardown. Used at
    /// shutdown.
    pub async fn shutdown_all(&self) {
        let channels: Vec<Arc<RoomChannel>> =
            self.rooms.write().await.drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.shutdown().await;
        }
        self.dashboard.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel() -> Arc<RoomChannel> {
        RoomChannel::new(
            "api".to_string(),
            Duration::from_secs(15),
            Duration::from_secs(600),
        )
    }

    async fn next_json(rx: &mut mpsc::Receiver<Arc<String>>) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within 1s")
            .expect("stream open");
        serde_json::from_str(&frame).unwrap()
    }

    #[test]
    fn server_message_wire_shapes() {
        let output = encode(&ServerMessage::Output {
            data: "hi".to_string(),
        });
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&output).unwrap(),
            serde_json::json!({"type": "output", "data": "hi"})
        );
        let activity = encode(&ServerMessage::SessionActivity {
            session: "api".to_string(),
            active: true,
        });
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&activity).unwrap(),
            serde_json::json!({"type": "session_activity", "session": "api", "active": true})
        );
        let answered = encode(&ServerMessage::QuestionAnswered);
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&answered).unwrap(),
            serde_json::json!({"type": "question_answered"})
        );
    }

    #[test]
    fn client_message_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"recording_started"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::RecordingStarted));
    }

    #[tokio::test]
    async fn frames_arrive_in_broadcast_order() {
        let channel = test_channel();
        let (_id, mut rx) = channel.subscribe().await;
        for i in 0..20 {
            channel.broadcast(&ServerMessage::Output {
                data: format!("line {}", i),
            });
        }
        for i in 0..20 {
            let frame = next_json(&mut rx).await;
            assert_eq!(frame["data"], format!("line {}", i));
        }
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_set() {
        let channel = test_channel();
        let (id, _rx) = channel.subscribe().await;
        assert_eq!(channel.subscriber_count().await, 1);
        channel.unsubscribe(id).await;
        assert_eq!(channel.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn talker_lock_is_exclusive() {
        let channel = test_channel();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(channel.try_lock(a).await);
        assert!(!channel.try_lock(b).await);
        // Re-acquire by the holder is fine.
        assert!(channel.try_lock(a).await);
        assert!(channel.unlock(a).await);
        assert!(channel.try_lock(b).await);
    }

    #[tokio::test]
    async fn unlock_by_non_holder_is_refused() {
        let channel = test_channel();
        let a = Uuid::new_v4();
        assert!(channel.try_lock(a).await);
        assert!(!channel.unlock(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn disconnect_releases_lock() {
        let channel = test_channel();
        let (id, _rx) = channel.subscribe().await;
        assert!(channel.try_lock(id).await);
        channel.unsubscribe(id).await;
        assert!(channel.try_lock(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn new_question_supersedes_previous() {
        let channel = test_channel();
        let q1 = crate::question::parse_question("☐ A\n\nFirst?\n\n1. x\n").unwrap();
        let q2 = crate::question::parse_question("☐ B\n\nSecond?\n\n1. y\n").unwrap();
        channel.set_question(q1).await;
        channel.set_question(q2.clone()).await;
        let current = channel.current_question().await.unwrap();
        assert!(current.same_prompt(&q2));
        // Answering clears the slot.
        assert!(channel.take_question().await.is_some());
        assert!(channel.current_question().await.is_none());
        assert!(channel.take_question().await.is_none());
    }

    #[tokio::test]
    async fn permission_slot_round_trip() {
        let channel = test_channel();
        let (_id, mut rx) = channel.subscribe().await;
        channel
            .set_permission(PermissionRequest {
                id: Uuid::new_v4(),
                tool: "Edit".to_string(),
                input: serde_json::json!({"file_path": "/x"}),
                message: None,
            })
            .await;
        let frame = next_json(&mut rx).await;
        assert_eq!(frame["type"], "permission_request");
        assert_eq!(frame["tool"], "Edit");
        channel.resolve_permission().await;
        let frame = next_json(&mut rx).await;
        assert_eq!(frame["type"], "permission_resolved");
        assert!(channel.current_permission().await.is_none());
    }

    #[tokio::test]
    async fn activity_edges() {
        let channel = test_channel();
        // First touch is an edge; the second is not.
        assert!(channel.touch_activity().await);
        assert!(!channel.touch_activity().await);
        // Not yet idle with a generous threshold.
        assert!(!channel.check_idle(Duration::from_secs(60)).await);
        // Instantly idle with a zero threshold.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(channel.check_idle(Duration::from_millis(1)).await);
        assert!(!channel.check_idle(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn pump_slot_is_single_occupancy() {
        let channel = test_channel();
        let t1 = CancellationToken::new();
        assert!(channel.install_pump(t1.clone()).await);
        assert!(!channel.install_pump(CancellationToken::new()).await);
        assert!(channel.pump_running().await);
        // A cancelled pump frees the slot.
        t1.cancel();
        assert!(channel.install_pump(CancellationToken::new()).await);
    }
}
