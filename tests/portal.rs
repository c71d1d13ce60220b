//! Cross-module portal invariants that don't need tmux or a network:
//! fan-out ordering, subscriber bookkeeping, pending-slot uniqueness,
//! permission deadlines, and registry delete races.

use std::sync::Arc;
use std::time::Duration;

use agentwire::config::Config;
use agentwire::host::HostExecutor;
use agentwire::hub::{RoomHub, ServerMessage};
use agentwire::mux::MuxAdapter;
use agentwire::permission::{Decision, DecisionKind, PermissionBroker, PermissionRequest};
use agentwire::question::parse_question;
use agentwire::registry::{Room, RoomId, RoomSettings, SessionRegistry};

struct Fixture {
    registry: Arc<SessionRegistry>,
    hub: Arc<RoomHub>,
    _state_dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let state_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.state_dir = state_dir.path().to_path_buf();
    let config = Arc::new(config);
    let exec = Arc::new(HostExecutor::new(Arc::clone(&config)));
    let mux = Arc::new(MuxAdapter::new(Arc::clone(&exec), &config));
    let registry = Arc::new(SessionRegistry::new(Arc::clone(&config), mux).await);
    let hub = RoomHub::new(config, Arc::clone(&registry), exec);
    Fixture {
        registry,
        hub,
        _state_dir: state_dir,
    }
}

fn room(name: &str) -> Room {
    Room::discovered(
        RoomId::parse(name).unwrap(),
        std::path::PathBuf::from("/tmp"),
        &RoomSettings::default(),
    )
}

async fn recv_json(
    rx: &mut tokio::sync::mpsc::Receiver<Arc<String>>,
) -> serde_json::Value {
    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("frame within 2s")
        .expect("stream open");
    serde_json::from_str(&frame).unwrap()
}

#[tokio::test]
async fn fanout_preserves_broadcast_order_per_subscriber() {
    let fx = fixture().await;
    let channel = fx.hub.channel("api").await;
    let (_a, mut rx_a) = channel.subscribe().await;
    let (_b, mut rx_b) = channel.subscribe().await;

    for i in 0..50 {
        channel.broadcast(&ServerMessage::Output {
            data: format!("{}", i),
        });
    }

    for i in 0..50 {
        assert_eq!(recv_json(&mut rx_a).await["data"], format!("{}", i));
        assert_eq!(recv_json(&mut rx_b).await["data"], format!("{}", i));
    }
}

#[tokio::test]
async fn subscriber_set_tracks_connects_and_disconnects() {
    let fx = fixture().await;
    let channel = fx.hub.channel("api").await;
    let (a, _rx_a) = channel.subscribe().await;
    let (b, _rx_b) = channel.subscribe().await;
    assert_eq!(channel.subscriber_count().await, 2);

    channel.unsubscribe(a).await;
    assert_eq!(channel.subscriber_count().await, 1);
    channel.unsubscribe(b).await;
    assert_eq!(channel.subscriber_count().await, 0);
    // Idempotent on unknown ids.
    channel.unsubscribe(a).await;
    assert_eq!(channel.subscriber_count().await, 0);
}

#[tokio::test]
async fn question_slot_holds_at_most_one() {
    let fx = fixture().await;
    let channel = fx.hub.channel("api").await;

    let q1 = parse_question("☐ A\n\nFirst?\n\n1. x\n").unwrap();
    let q2 = parse_question("☐ B\n\nSecond?\n\n1. y\n2. z\n").unwrap();
    channel.set_question(q1).await;
    channel.set_question(q2.clone()).await;

    let current = channel.current_question().await.unwrap();
    assert!(current.same_prompt(&q2));
    assert!(channel.take_question().await.is_some());
    assert!(channel.take_question().await.is_none());
}

#[tokio::test]
async fn permission_slot_conflicts_and_deadline_denies() {
    let broker = PermissionBroker::new(Duration::from_millis(50));
    let request = PermissionRequest {
        id: uuid::Uuid::new_v4(),
        tool: "Edit".to_string(),
        input: serde_json::json!({"file_path": "/x"}),
        message: None,
    };
    let rx = broker.register("api", &request).await.unwrap();

    // Second request in the slot is a conflict (one pending per room).
    let second = PermissionRequest {
        id: uuid::Uuid::new_v4(),
        tool: "Bash".to_string(),
        input: serde_json::json!({}),
        message: None,
    };
    assert_eq!(
        broker.register("api", &second).await.unwrap_err().kind(),
        "Conflict"
    );

    // Nobody answers: the deadline resolves to deny, exactly as the hook
    // endpoint does it.
    let decision = match tokio::time::timeout(broker.deadline(), rx).await {
        Ok(Ok(decision)) => decision,
        Ok(Err(_)) => Decision::deny("session closed"),
        Err(_) => {
            assert!(broker.expire("api", request.id).await);
            Decision::deny("timeout")
        }
    };
    assert_eq!(decision.decision, DecisionKind::Deny);
    assert_eq!(decision.message.as_deref(), Some("timeout"));
    assert!(!broker.has_pending("api").await);

    // The slot is free again afterwards.
    assert!(broker.register("api", &second).await.is_ok());
}

#[tokio::test]
async fn concurrent_deletes_have_exactly_one_winner() {
    let fx = fixture().await;
    fx.registry.put(room("api")).await;

    let r1 = Arc::clone(&fx.registry);
    let r2 = Arc::clone(&fx.registry);
    let (a, b) = tokio::join!(
        tokio::spawn(async move { r1.delete("api").await }),
        tokio::spawn(async move { r2.delete("api").await }),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert!(
        a.is_ok() ^ b.is_ok(),
        "exactly one delete should win: {:?} / {:?}",
        a.as_ref().map(|_| ()),
        b.as_ref().map(|_| ())
    );
    let loser = if a.is_ok() { b } else { a };
    assert_eq!(loser.unwrap_err().kind(), "NotFound");
    assert!(fx.registry.get("api").await.is_none());
}

#[tokio::test]
async fn room_gone_tears_down_hub_state() {
    let fx = fixture().await;
    fx.registry.put(room("api")).await;
    let channel = fx.hub.channel("api").await;
    let (_id, mut rx) = channel.subscribe().await;

    fx.registry.delete("api").await.unwrap();
    fx.hub.remove("api").await;

    // Subscriber stream ends once the room is torn down.
    let end = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
    assert_eq!(end.expect("closed in time"), None);
}

#[test]
fn question_wire_shape_matches_the_contract() {
    let pane = "☐ Pick one\n\nWhich file?\n\n❯ 1. src/a.py\n   the first file\n❯ 2. src/b.py\n";
    let q = parse_question(pane).unwrap();
    let msg = ServerMessage::Question {
        header: q.header,
        question: q.question,
        options: q.options,
    };
    assert_eq!(
        serde_json::to_value(&msg).unwrap(),
        serde_json::json!({
            "type": "question",
            "header": "Pick one",
            "question": "Which file?",
            "options": [
                {"number": "1", "label": "src/a.py", "description": "the first file"},
                {"number": "2", "label": "src/b.py", "description": ""}
            ]
        })
    );
}

#[tokio::test]
async fn listing_state_reflects_activity() {
    let fx = fixture().await;
    fx.registry.put(room("api")).await;
    assert_eq!(fx.hub.activity_state("api").await, "idle");
    fx.hub.touch_activity("api").await;
    assert_eq!(fx.hub.activity_state("api").await, "active");
}
