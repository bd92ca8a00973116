//! End-to-end: engine sessions talking through a live relay on loopback.

use std::sync::Arc;
use std::time::Duration;

use canvas_sync::config::{ServerConfig, SyncConfig};
use canvas_sync::engine::{AcquireOutcome, CanvasSession, SessionIdentity};
use canvas_sync::ephemeral::EphemeralStore;
use canvas_sync::net::RemoteCanvas;
use canvas_sync::routes;
use canvas_sync::shape::{Geometry, Point, ShapeKind, ShapePatch};
use canvas_sync::state::AppState;
use canvas_sync::store::{LockGrant, ShapeStore, StoreError};
use uuid::Uuid;

async fn spawn_relay() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = routes::app(AppState::new(None, ServerConfig::default()));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/api/ws")
}

async fn remote(url: &str, canvas_id: Uuid) -> Arc<RemoteCanvas> {
    Arc::new(
        RemoteCanvas::connect(url, canvas_id, Uuid::new_v4(), &SyncConfig::default())
            .await
            .unwrap(),
    )
}

async fn session(remote: &Arc<RemoteCanvas>, name: &str) -> CanvasSession {
    let store: Arc<dyn ShapeStore> = remote.clone();
    let ephemeral: Arc<dyn EphemeralStore> = remote.clone();
    CanvasSession::open(store, ephemeral, SessionIdentity::new(remote.user_id(), name), SyncConfig::default())
        .await
        .unwrap()
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn upgrade_requires_user_id() {
    let url = spawn_relay().await;
    assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
}

#[tokio::test]
async fn two_sessions_collaborate_through_relay() {
    let url = spawn_relay().await;
    let canvas_id = Uuid::new_v4();
    let alice_remote = remote(&url, canvas_id).await;
    let bob_remote = remote(&url, canvas_id).await;
    let mut alice = session(&alice_remote, "Alice").await;
    let mut bob = session(&bob_remote, "Bob").await;

    eventually("both users online", || bob.online_users().len() == 2).await;

    // Creation fans out.
    let shape = alice
        .create_shape(ShapeKind::Rectangle, Geometry::new(10.0, 10.0, 40.0, 40.0))
        .await
        .unwrap();
    eventually("bob mirrors the new shape", || bob.shape(shape.id).is_some()).await;

    // Exclusive lock.
    assert!(alice.select(shape.id).await.is_acquired());
    let refused = bob.select(shape.id).await;
    assert!(
        matches!(refused, AcquireOutcome::AlreadyLocked { holder } if holder == alice.user_id()),
        "{refused:?}"
    );

    // Drag positions reach bob through the ephemeral channel.
    alice.begin_drag(shape.id).await.unwrap();
    assert!(alice.drag_to(shape.id, 30.0, 30.0).await.unwrap().written);
    eventually("bob sees the remote drag", || {
        bob.render_frame()
            .iter()
            .any(|item| item.shape.id == shape.id && item.smoothed_position == Some(Point::new(30.0, 30.0)))
    })
    .await;

    // Commit, then release.
    let commit = alice.end_drag(shape.id).await.unwrap();
    assert!(commit.is_complete());
    assert_eq!(alice.deselect().await, 1);
    eventually("bob sees the committed, unlocked shape", || {
        bob.shape(shape.id)
            .is_some_and(|s| s.geometry.x == 30.0 && !s.is_locked())
    })
    .await;

    // Now bob can take it.
    assert!(bob.select(shape.id).await.is_acquired());

    alice.teardown().await;
    eventually("alice leaves the roster", || bob.online_users().len() == 1).await;
    bob.teardown().await;
}

#[tokio::test]
async fn relay_refuses_edits_to_shapes_locked_by_others() {
    let url = spawn_relay().await;
    let canvas_id = Uuid::new_v4();
    let alice = remote(&url, canvas_id).await;
    let bob = remote(&url, canvas_id).await;

    let shape = ShapeStore::create(
        alice.as_ref(),
        canvas_sync::shape::Shape::new(ShapeKind::Circle, Geometry::new(0.0, 0.0, 5.0, 5.0), alice.user_id()),
    )
    .await
    .unwrap();
    assert!(matches!(
        alice.acquire_lock(shape.id, alice.user_id()).await.unwrap(),
        LockGrant::Granted(_)
    ));
    assert!(matches!(
        bob.acquire_lock(shape.id, bob.user_id()).await.unwrap(),
        LockGrant::Held { holder } if holder == alice.user_id()
    ));

    let err = bob
        .update(shape.id, &ShapePatch::position(9.0, 9.0), bob.user_id())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Rejected { ref code, .. } if code == "E_SHAPE_LOCKED"), "{err:?}");

    let err = bob.set_selection(shape.id, bob.user_id(), true).await.unwrap_err();
    assert!(matches!(err, StoreError::NotLockHolder { .. }), "{err:?}");

    let missing = Uuid::new_v4();
    assert!(matches!(
        alice.acquire_lock(missing, alice.user_id()).await,
        Err(StoreError::NotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn dropped_connection_releases_locks_and_ephemeral_keys() {
    let url = spawn_relay().await;
    let canvas_id = Uuid::new_v4();
    let alice = remote(&url, canvas_id).await;
    let bob = remote(&url, canvas_id).await;

    let shape = ShapeStore::create(
        alice.as_ref(),
        canvas_sync::shape::Shape::new(ShapeKind::Rectangle, Geometry::default(), alice.user_id()),
    )
    .await
    .unwrap();
    alice.acquire_lock(shape.id, alice.user_id()).await.unwrap();
    alice
        .set_with_disconnect_removal("positions", &shape.id.to_string(), serde_json::json!({"x": 1}))
        .await
        .unwrap();
    assert_eq!(bob.snapshot("positions").await.unwrap().len(), 1);

    alice.close();
    assert!(alice.is_closed());

    let mut released = false;
    for _ in 0..100 {
        let current = ShapeStore::get(bob.as_ref(), shape.id).await.unwrap().unwrap();
        if !current.is_locked() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "lock survived disconnect");
    assert!(bob.snapshot("positions").await.unwrap().is_empty());

    // Requests on a closed client fail fast as unavailable.
    assert!(matches!(
        ShapeStore::list(alice.as_ref()).await,
        Err(StoreError::Unavailable(_))
    ));
}
