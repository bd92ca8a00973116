use super::*;
use crate::ephemeral::{POSITIONS, PRESENCE};
use crate::shape::{Geometry, ShapeKind};
use crate::state::test_helpers;
use crate::store::LockGrant;

fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

async fn join(state: &AppState, canvas_id: Uuid, user_id: UserId) -> (Uuid, mpsc::Receiver<Frame>) {
    let client_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(64);
    join_canvas(state, canvas_id, client_id, user_id, tx).await.unwrap();
    (client_id, rx)
}

#[tokio::test]
async fn join_creates_canvas_and_returns_shapes() {
    let state = test_helpers::test_app_state();
    let canvas_id = Uuid::new_v4();
    let user = Uuid::new_v4();

    let (tx, _rx) = mpsc::channel(8);
    let shapes = join_canvas(&state, canvas_id, Uuid::new_v4(), user, tx).await.unwrap();
    assert!(shapes.is_empty());

    let (store, _) = state.backends(canvas_id).await.unwrap();
    store
        .create(Shape::new(ShapeKind::Circle, Geometry::new(0.0, 0.0, 5.0, 5.0), user))
        .await
        .unwrap();

    let (tx, _rx2) = mpsc::channel(8);
    let shapes = join_canvas(&state, canvas_id, Uuid::new_v4(), user, tx).await.unwrap();
    assert_eq!(shapes.len(), 1);
    assert_eq!(state.canvases.read().await[&canvas_id].clients.len(), 2);
}

#[tokio::test]
async fn part_removes_ephemeral_keys_and_releases_locks() {
    let state = test_helpers::test_app_state();
    let canvas_id = Uuid::new_v4();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let (alice_client, _alice_rx) = join(&state, canvas_id, alice).await;
    let (_bob_client, mut bob_rx) = join(&state, canvas_id, bob).await;

    let (store, hub) = state.backends(canvas_id).await.unwrap();
    let shape = store
        .create(Shape::new(ShapeKind::Rectangle, Geometry::new(0.0, 0.0, 5.0, 5.0), alice))
        .await
        .unwrap();
    assert!(matches!(store.acquire_lock(shape.id, alice).await.unwrap(), LockGrant::Granted(_)));
    hub.set_as(alice_client, POSITIONS, &shape.id.to_string(), json!({"x": 1}), true);
    hub.set_as(alice_client, PRESENCE, &alice.to_string(), json!({}), true);
    hub.set_as(alice_client, "notes", "pinned", json!("stays"), false);

    let cleanup = part_canvas(&state, canvas_id, alice_client).await;
    assert_eq!(cleanup.removed_keys.len(), 2);
    assert_eq!(cleanup.released.len(), 1);

    assert!(hub.snapshot(POSITIONS).is_empty());
    assert!(hub.snapshot(PRESENCE).is_empty());
    assert_eq!(hub.snapshot("notes").len(), 1);
    assert!(!store.get(shape.id).await.unwrap().unwrap().is_locked());

    let frames = drain(&mut bob_rx);
    assert_eq!(frames.iter().filter(|f| f.syscall == "ephemeral:delete").count(), 2);
    let unlock = frames.iter().find(|f| f.syscall == "shape:unlock").unwrap();
    assert!(unlock.parent_id.is_none());
    let released: Shape = serde_json::from_value(unlock.data["shape"].clone()).unwrap();
    assert_eq!(released.id, shape.id);
    assert!(released.locked_by.is_none());
}

#[tokio::test]
async fn locks_survive_while_same_user_has_another_connection() {
    let state = test_helpers::test_app_state();
    let canvas_id = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let (first, _rx1) = join(&state, canvas_id, alice).await;
    let (_second, _rx2) = join(&state, canvas_id, alice).await;

    let (store, _) = state.backends(canvas_id).await.unwrap();
    let shape = store
        .create(Shape::new(ShapeKind::Rectangle, Geometry::default(), alice))
        .await
        .unwrap();
    store.acquire_lock(shape.id, alice).await.unwrap();

    let cleanup = part_canvas(&state, canvas_id, first).await;
    assert!(cleanup.released.is_empty());
    assert!(store.get(shape.id).await.unwrap().unwrap().is_locked_by(alice));
}

#[tokio::test]
async fn last_part_evicts_canvas_without_pool() {
    let state = test_helpers::test_app_state();
    let canvas_id = Uuid::new_v4();
    let (client, _rx) = join(&state, canvas_id, Uuid::new_v4()).await;

    part_canvas(&state, canvas_id, client).await;
    assert!(state.backends(canvas_id).await.is_none());

    // Unknown canvas or client is a no-op.
    let cleanup = part_canvas(&state, canvas_id, client).await;
    assert!(cleanup.removed_keys.is_empty() && cleanup.released.is_empty());
}

#[tokio::test]
async fn broadcast_skips_excluded_client() {
    let state = test_helpers::test_app_state();
    let canvas_id = Uuid::new_v4();
    let (a, mut a_rx) = join(&state, canvas_id, Uuid::new_v4()).await;
    let (_b, mut b_rx) = join(&state, canvas_id, Uuid::new_v4()).await;

    let frame = Frame::request("shape:update", Data::new()).with_canvas_id(canvas_id);
    broadcast(&state, canvas_id, &frame, Some(a)).await;

    assert!(drain(&mut a_rx).is_empty());
    assert_eq!(drain(&mut b_rx).len(), 1);
}

#[test]
fn relay_error_codes() {
    let id = Uuid::new_v4();
    assert_eq!(RelayError::NotJoined.error_code(), "E_NOT_JOINED");
    assert_eq!(
        RelayError::LockedByOther { shape_id: id, holder: Uuid::new_v4() }.error_code(),
        "E_SHAPE_LOCKED"
    );
    assert_eq!(RelayError::from(StoreError::NotFound(id)).error_code(), "E_SHAPE_NOT_FOUND");
    assert!(RelayError::from(StoreError::Unavailable("down".into())).retryable());
    assert!(!RelayError::BadRequest("x".into()).retryable());
}
