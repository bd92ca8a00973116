use super::*;
use crate::frame::Status;
use crate::shape::{Geometry, ShapeKind};
use crate::state::test_helpers::test_app_state;
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;

struct TestClient {
    client_id: Uuid,
    user_id: UserId,
    canvas: Option<Uuid>,
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl TestClient {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self { client_id: Uuid::new_v4(), user_id: Uuid::new_v4(), canvas: None, tx, rx }
    }

    async fn send(&mut self, state: &AppState, req: &Frame) -> Frame {
        let text = serde_json::to_string(req).unwrap();
        let mut replies =
            process_inbound_text(state, &mut self.canvas, self.client_id, self.user_id, &self.tx, &text).await;
        assert_eq!(replies.len(), 1, "expected exactly one reply");
        replies.remove(0)
    }

    async fn join(&mut self, state: &AppState, canvas_id: Uuid) -> Frame {
        let req = Frame::request("canvas:join", Data::new()).with_canvas_id(canvas_id);
        self.send(state, &req).await
    }
}

async fn recv_peer(rx: &mut mpsc::Receiver<Frame>, syscall: &str) -> Frame {
    loop {
        let frame = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timed out waiting for peer frame")
            .expect("channel closed");
        if frame.syscall == syscall {
            return frame;
        }
    }
}

fn assert_nothing_queued(rx: &mut mpsc::Receiver<Frame>) {
    assert!(rx.try_recv().is_err(), "unexpected queued frame");
}

fn rect_json(created_by: UserId) -> Value {
    json!(Shape::new(ShapeKind::Rectangle, Geometry::new(0.0, 0.0, 20.0, 20.0), created_by))
}

async fn create(client: &mut TestClient, state: &AppState) -> Shape {
    let req = Frame::request("shape:create", Data::new()).with_data("shape", rect_json(client.user_id));
    let reply = client.send(state, &req).await;
    assert_eq!(reply.status, Status::Done);
    serde_json::from_value(reply.data["shape"].clone()).unwrap()
}

#[tokio::test]
async fn join_replies_with_client_id_and_shapes() {
    let state = test_app_state();
    let canvas_id = Uuid::new_v4();
    let mut alice = TestClient::new();

    let reply = alice.join(&state, canvas_id).await;
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data["client_id"], json!(alice.client_id));
    assert_eq!(reply.data["shapes"], json!([]));
    assert_eq!(alice.canvas, Some(canvas_id));
}

#[tokio::test]
async fn join_accepts_canvas_id_in_data() {
    let state = test_app_state();
    let canvas_id = Uuid::new_v4();
    let mut alice = TestClient::new();

    let req = Frame::request("canvas:join", Data::new()).with_data("canvas_id", canvas_id.to_string());
    let reply = alice.send(&state, &req).await;
    assert_eq!(reply.status, Status::Done);
    assert_eq!(alice.canvas, Some(canvas_id));
}

#[tokio::test]
async fn join_without_canvas_is_bad_request() {
    let state = test_app_state();
    let mut alice = TestClient::new();
    let reply = alice.send(&state, &Frame::request("canvas:join", Data::new())).await;
    assert_eq!(reply.error_code(), Some("E_BAD_REQUEST"));
}

#[tokio::test]
async fn peers_are_told_about_joins() {
    let state = test_app_state();
    let canvas_id = Uuid::new_v4();
    let mut alice = TestClient::new();
    let mut bob = TestClient::new();
    alice.join(&state, canvas_id).await;
    bob.join(&state, canvas_id).await;

    let notice = recv_peer(&mut alice.rx, "canvas:join").await;
    assert_eq!(notice.status, Status::Request);
    assert_eq!(notice.data["user_id"], json!(bob.user_id));
    assert_nothing_queued(&mut bob.rx);
}

#[tokio::test]
async fn shape_ops_require_join() {
    let state = test_app_state();
    let mut alice = TestClient::new();
    let reply = alice.send(&state, &Frame::request("shape:list", Data::new())).await;
    assert_eq!(reply.status, Status::Error);
    assert_eq!(reply.error_code(), Some("E_NOT_JOINED"));
}

#[tokio::test]
async fn unknown_prefix_and_bad_json_are_errors() {
    let state = test_app_state();
    let mut alice = TestClient::new();

    let req = Frame::request("canvas:nope", Data::new());
    let reply = alice.send(&state, &req).await;
    assert_eq!(reply.status, Status::Error);
    assert_eq!(reply.error_code(), Some("E_BAD_REQUEST"));
    assert_eq!(reply.parent_id, Some(req.id));

    let replies = process_inbound_text(&state, &mut alice.canvas, alice.client_id, alice.user_id, &alice.tx, "{nope").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].syscall, "gateway:error");
}

#[tokio::test]
async fn create_is_broadcast_to_peers_without_parent() {
    let state = test_app_state();
    let canvas_id = Uuid::new_v4();
    let mut alice = TestClient::new();
    let mut bob = TestClient::new();
    alice.join(&state, canvas_id).await;
    bob.join(&state, canvas_id).await;

    let shape = create(&mut alice, &state).await;
    assert_eq!(shape.created_by, alice.user_id);

    let peer = recv_peer(&mut bob.rx, "shape:create").await;
    assert!(peer.parent_id.is_none());
    assert_eq!(peer.from.as_deref(), Some(alice.user_id.to_string().as_str()));
    assert_eq!(peer.data["shape"]["id"], json!(shape.id));

    let listed = bob.send(&state, &Frame::request("shape:list", Data::new())).await;
    assert_eq!(listed.data["shapes"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn lock_contention_reports_holder() {
    let state = test_app_state();
    let canvas_id = Uuid::new_v4();
    let mut alice = TestClient::new();
    let mut bob = TestClient::new();
    alice.join(&state, canvas_id).await;
    bob.join(&state, canvas_id).await;
    let shape = create(&mut alice, &state).await;

    let lock = Frame::request("shape:lock", Data::new()).with_data("id", shape.id.to_string());
    let granted = alice.send(&state, &lock).await;
    assert_eq!(granted.data["granted"], json!(true));

    let peer = recv_peer(&mut bob.rx, "shape:lock").await;
    assert_eq!(peer.data["shape"]["lockedBy"], json!(alice.user_id));

    let refused = bob.send(&state, &lock).await;
    assert_eq!(refused.status, Status::Done);
    assert_eq!(refused.data["granted"], json!(false));
    assert_eq!(refused.data["holder"], json!(alice.user_id));

    let update = Frame::request("shape:update", Data::new())
        .with_data("id", shape.id.to_string())
        .with_data("patch", json!(ShapePatch::position(50.0, 50.0)));
    let blocked = bob.send(&state, &update).await;
    assert_eq!(blocked.error_code(), Some("E_SHAPE_LOCKED"));
}

#[tokio::test]
async fn unlock_by_non_holder_is_a_reply_only() {
    let state = test_app_state();
    let canvas_id = Uuid::new_v4();
    let mut alice = TestClient::new();
    let mut bob = TestClient::new();
    alice.join(&state, canvas_id).await;
    bob.join(&state, canvas_id).await;
    let shape = create(&mut alice, &state).await;
    let id = shape.id.to_string();
    alice
        .send(&state, &Frame::request("shape:lock", Data::new()).with_data("id", id.clone()))
        .await;
    while alice.rx.try_recv().is_ok() {}
    while bob.rx.try_recv().is_ok() {}

    let reply = bob
        .send(&state, &Frame::request("shape:unlock", Data::new()).with_data("id", id.clone()))
        .await;
    assert_eq!(reply.data["released"], json!(false));
    assert_nothing_queued(&mut alice.rx);

    let reply = alice
        .send(&state, &Frame::request("shape:unlock", Data::new()).with_data("id", id))
        .await;
    assert_eq!(reply.data["released"], json!(true));
    recv_peer(&mut bob.rx, "shape:unlock").await;
}

#[tokio::test]
async fn delete_of_missing_shape_is_not_broadcast() {
    let state = test_app_state();
    let canvas_id = Uuid::new_v4();
    let mut alice = TestClient::new();
    let mut bob = TestClient::new();
    alice.join(&state, canvas_id).await;
    bob.join(&state, canvas_id).await;
    while alice.rx.try_recv().is_ok() {}

    let req = Frame::request("shape:delete", Data::new()).with_data("id", Uuid::new_v4().to_string());
    let reply = bob.send(&state, &req).await;
    assert_eq!(reply.data["deleted"], json!(false));
    assert_nothing_queued(&mut alice.rx);
}

#[tokio::test]
async fn ephemeral_set_reaches_peers_but_not_sender() {
    let state = test_app_state();
    let canvas_id = Uuid::new_v4();
    let mut alice = TestClient::new();
    let mut bob = TestClient::new();
    alice.join(&state, canvas_id).await;
    bob.join(&state, canvas_id).await;
    while alice.rx.try_recv().is_ok() {}

    let set = Frame::request("ephemeral:set", Data::new())
        .with_data("namespace", "positions")
        .with_data("key", "k1")
        .with_data("value", json!({"x": 4}))
        .with_data("remove_on_disconnect", true);
    let reply = bob.send(&state, &set).await;
    assert_eq!(reply.status, Status::Done);

    let peer = recv_peer(&mut alice.rx, "ephemeral:set").await;
    assert_eq!(peer.data["key"], json!("k1"));
    assert_eq!(peer.data["value"], json!({"x": 4}));
    assert_nothing_queued(&mut bob.rx);

    let snap = Frame::request("ephemeral:snapshot", Data::new()).with_data("namespace", "positions");
    let reply = alice.send(&state, &snap).await;
    assert_eq!(reply.data["entries"]["k1"], json!({"x": 4}));
}

#[tokio::test]
async fn part_clears_disconnect_keys_and_notifies_peers() {
    let state = test_app_state();
    let canvas_id = Uuid::new_v4();
    let mut alice = TestClient::new();
    let mut bob = TestClient::new();
    alice.join(&state, canvas_id).await;
    bob.join(&state, canvas_id).await;

    let set = Frame::request("ephemeral:set", Data::new())
        .with_data("namespace", "presence")
        .with_data("key", bob.user_id.to_string())
        .with_data("value", json!({"online": true}))
        .with_data("remove_on_disconnect", true);
    bob.send(&state, &set).await;
    while alice.rx.try_recv().is_ok() {}

    let reply = bob.send(&state, &Frame::request("canvas:part", Data::new())).await;
    assert_eq!(reply.status, Status::Done);
    assert!(bob.canvas.is_none());

    recv_peer(&mut alice.rx, "canvas:part").await;
    let removed = recv_peer(&mut alice.rx, "ephemeral:delete").await;
    assert_eq!(removed.data["key"], json!(bob.user_id.to_string()));
}
