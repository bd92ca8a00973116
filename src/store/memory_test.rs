use super::*;
use crate::shape::{Geometry, ShapeKind};
use uuid::Uuid;

fn rect(created_by: UserId) -> Shape {
    Shape::new(ShapeKind::Rectangle, Geometry::new(0.0, 0.0, 40.0, 30.0), created_by)
}

async fn seeded() -> (MemoryShapeStore, Shape) {
    let store = MemoryShapeStore::new();
    let shape = store.create(rect(Uuid::new_v4())).await.unwrap();
    (store, shape)
}

// =============================================================================
// create / update / delete
// =============================================================================

#[tokio::test]
async fn create_assigns_increasing_z_index() {
    let store = MemoryShapeStore::new();
    let user = Uuid::new_v4();
    let a = store.create(rect(user)).await.unwrap();
    let b = store.create(rect(user)).await.unwrap();
    assert_eq!(a.z_index, 0);
    assert_eq!(b.z_index, 1);
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn create_same_id_is_upsert_keeping_lock() {
    let (store, shape) = seeded().await;
    let holder = Uuid::new_v4();
    store.acquire_lock(shape.id, holder).await.unwrap();

    let mut replay = shape.clone();
    replay.geometry.x = 99.0;
    replay.locked_by = None;
    let stored = store.create(replay).await.unwrap();

    assert_eq!(store.len().await, 1);
    assert_eq!(stored.locked_by, Some(holder));
    assert!((stored.geometry.x - 99.0).abs() < f64::EPSILON);
    assert_eq!(stored.z_index, shape.z_index);
}

#[tokio::test]
async fn upsert_credits_the_acting_user_not_the_author() {
    let (store, shape) = seeded().await;
    let editor = Uuid::new_v4();

    let mut replay = rect(editor);
    replay.id = shape.id;
    let stored = store.create(replay).await.unwrap();

    assert_eq!(stored.created_by, shape.created_by);
    assert_eq!(stored.last_modified_by, editor);
    assert_eq!(stored.version, shape.version + 1);
}

#[tokio::test]
async fn update_stamps_audit_fields_and_version() {
    let (store, shape) = seeded().await;
    let editor = Uuid::new_v4();
    let updated = store
        .update(shape.id, &ShapePatch::position(5.0, 6.0), editor)
        .await
        .unwrap();
    assert_eq!(updated.last_modified_by, editor);
    assert_eq!(updated.version, shape.version + 1);
    assert!(updated.last_modified_at >= shape.last_modified_at);
}

#[tokio::test]
async fn update_missing_shape_is_not_found() {
    let store = MemoryShapeStore::new();
    let err = store
        .update(Uuid::new_v4(), &ShapePatch::position(1.0, 1.0), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn rejected_patch_leaves_shape_untouched() {
    let (store, shape) = seeded().await;
    let patch = ShapePatch { kind: Some(ShapeKind::Circle), ..ShapePatch::default() };
    let err = store.update(shape.id, &patch, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidPatch(_)));
    assert_eq!(store.get(shape.id).await.unwrap(), Some(shape));
}

#[tokio::test]
async fn delete_twice_is_noop() {
    let (store, shape) = seeded().await;
    assert!(store.delete(shape.id).await.unwrap());
    assert!(!store.delete(shape.id).await.unwrap());
    assert!(store.is_empty().await);
}

// =============================================================================
// locks
// =============================================================================

#[tokio::test]
async fn acquire_lock_is_compare_and_swap() {
    let (store, shape) = seeded().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let first = store.acquire_lock(shape.id, alice).await.unwrap();
    assert!(matches!(first, LockGrant::Granted(ref s) if s.locked_by == Some(alice)));

    let second = store.acquire_lock(shape.id, bob).await.unwrap();
    assert_eq!(second, LockGrant::Held { holder: alice });

    // Re-acquiring your own lock succeeds without a write.
    let again = store.acquire_lock(shape.id, alice).await.unwrap();
    assert!(matches!(again, LockGrant::Granted(_)));
}

#[tokio::test]
async fn concurrent_acquires_grant_exactly_one() {
    let (store, shape) = seeded().await;
    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.acquire_lock(shape.id, Uuid::new_v4()).await }));
    }

    let mut granted = 0;
    for handle in handles {
        if matches!(handle.await.unwrap().unwrap(), LockGrant::Granted(_)) {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
}

#[tokio::test]
async fn release_by_non_holder_is_ignored() {
    let (store, shape) = seeded().await;
    let alice = Uuid::new_v4();
    store.acquire_lock(shape.id, alice).await.unwrap();

    assert!(store.release_lock(shape.id, Uuid::new_v4()).await.unwrap().is_none());
    let current = store.get(shape.id).await.unwrap().unwrap();
    assert_eq!(current.locked_by, Some(alice));
}

#[tokio::test]
async fn release_transitions_once_and_clears_selection() {
    let (store, shape) = seeded().await;
    let alice = Uuid::new_v4();
    store.acquire_lock(shape.id, alice).await.unwrap();
    store.set_selection(shape.id, alice, true).await.unwrap();

    let released = store.release_lock(shape.id, alice).await.unwrap().unwrap();
    assert!(!released.is_locked());
    assert!(!released.is_selected());
    assert!(store.release_lock(shape.id, alice).await.unwrap().is_none());
}

#[tokio::test]
async fn selecting_requires_lock() {
    let (store, shape) = seeded().await;
    let err = store
        .set_selection(shape.id, Uuid::new_v4(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotLockHolder { holder: None, .. }));
}

#[tokio::test]
async fn locked_by_lists_holder_shapes() {
    let store = MemoryShapeStore::new();
    let alice = Uuid::new_v4();
    let a = store.create(rect(alice)).await.unwrap();
    let b = store.create(rect(alice)).await.unwrap();
    store.acquire_lock(a.id, alice).await.unwrap();
    store.acquire_lock(b.id, Uuid::new_v4()).await.unwrap();

    assert_eq!(store.locked_by(alice).await, vec![a.id]);
}

// =============================================================================
// events
// =============================================================================

#[tokio::test]
async fn subscribers_see_every_commit() {
    let store = MemoryShapeStore::new();
    let mut rx = store.subscribe();
    let user = Uuid::new_v4();

    let shape = store.create(rect(user)).await.unwrap();
    store.acquire_lock(shape.id, user).await.unwrap();
    store.delete(shape.id).await.unwrap();

    assert!(matches!(rx.recv().await.unwrap(), ShapeEvent::Upserted(s) if s.id == shape.id));
    assert!(matches!(rx.recv().await.unwrap(), ShapeEvent::Upserted(s) if s.locked_by == Some(user)));
    assert_eq!(rx.recv().await.unwrap(), ShapeEvent::Deleted(shape.id));
}

// =============================================================================
// persistence bookkeeping
// =============================================================================

#[tokio::test]
async fn ack_keeps_dirty_when_version_moved() {
    let (store, shape) = seeded().await;
    let snapshot = store.dirty_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    let versions: Vec<_> = snapshot.iter().map(|s| (s.id, s.version)).collect();

    store
        .update(shape.id, &ShapePatch::position(1.0, 1.0), Uuid::new_v4())
        .await
        .unwrap();
    store.ack_flushed(&versions).await;
    assert!(store.has_dirty().await);

    let versions: Vec<_> = store
        .dirty_snapshot()
        .await
        .iter()
        .map(|s| (s.id, s.version))
        .collect();
    store.ack_flushed(&versions).await;
    assert!(!store.has_dirty().await);
}

#[tokio::test]
async fn hydrate_replaces_document_and_resumes_z_order() {
    let store = MemoryShapeStore::new();
    let mut persisted = rect(Uuid::new_v4());
    persisted.z_index = 7;
    store.hydrate(vec![persisted.clone()]).await;

    assert!(!store.has_dirty().await);
    assert_eq!(store.get(persisted.id).await.unwrap(), Some(persisted));
    let next = store.create(rect(Uuid::new_v4())).await.unwrap();
    assert_eq!(next.z_index, 8);
}
