//! Shape service: relay-side shape operations on a live canvas.
//!
//! DESIGN
//! ======
//! Thin layer over the canvas's `MemoryShapeStore` that adds what the relay
//! enforces on behalf of every client: content writes (create-over-existing,
//! update, delete) are refused while another user holds the shape's lock,
//! new shapes are attributed to the authenticated user, and deletes are
//! written through to Postgres immediately.

use tracing::{debug, error};
use uuid::Uuid;

use super::canvas::RelayError;
use super::persistence;
use crate::shape::{Shape, ShapeId, ShapePatch, UserId};
use crate::state::AppState;
use crate::store::{LockGrant, MemoryShapeStore, ShapeStore};

async fn live_store(state: &AppState, canvas_id: Uuid) -> Result<MemoryShapeStore, RelayError> {
    state
        .backends(canvas_id)
        .await
        .map(|(store, _)| store)
        .ok_or(RelayError::NotJoined)
}

/// Current shape, refused if someone other than `user_id` holds it.
async fn editable(store: &MemoryShapeStore, id: ShapeId, user_id: UserId) -> Result<Option<Shape>, RelayError> {
    let current = store.get(id).await?;
    if let Some(holder) = current
        .as_ref()
        .and_then(|s| s.locked_by)
        .filter(|holder| *holder != user_id)
    {
        return Err(RelayError::LockedByOther { shape_id: id, holder });
    }
    Ok(current)
}

/// # Errors
///
/// `NotJoined` when the canvas is not live.
pub async fn list_shapes(state: &AppState, canvas_id: Uuid) -> Result<Vec<Shape>, RelayError> {
    let store = live_store(state, canvas_id).await?;
    let mut shapes = store.list().await?;
    shapes.sort_by(|a, b| a.z_index.cmp(&b.z_index).then(a.id.cmp(&b.id)));
    Ok(shapes)
}

/// # Errors
///
/// `NotJoined` when the canvas is not live.
pub async fn get_shape(state: &AppState, canvas_id: Uuid, id: ShapeId) -> Result<Option<Shape>, RelayError> {
    let store = live_store(state, canvas_id).await?;
    Ok(store.get(id).await?)
}

/// Upsert a shape by id.
///
/// # Errors
///
/// `LockedByOther` when replacing a shape someone else holds.
pub async fn create_shape(state: &AppState, canvas_id: Uuid, user_id: UserId, mut shape: Shape) -> Result<Shape, RelayError> {
    let store = live_store(state, canvas_id).await?;
    match editable(&store, shape.id, user_id).await? {
        Some(existing) => shape.created_by = existing.created_by,
        None => shape.created_by = user_id,
    }
    shape.last_modified_by = user_id;
    let created = store.create(shape).await?;
    debug!(%canvas_id, shape_id = %created.id, kind = created.kind.type_name(), "shape created");
    Ok(created)
}

/// # Errors
///
/// `LockedByOther`, `NotFound`, or an invalid patch.
pub async fn update_shape(
    state: &AppState,
    canvas_id: Uuid,
    user_id: UserId,
    id: ShapeId,
    patch: &ShapePatch,
) -> Result<Shape, RelayError> {
    let store = live_store(state, canvas_id).await?;
    editable(&store, id, user_id).await?;
    Ok(store.update(id, patch, user_id).await?)
}

/// Delete a shape. Returns `false` when it was already gone.
///
/// # Errors
///
/// `LockedByOther` when someone else holds the shape.
pub async fn delete_shape(state: &AppState, canvas_id: Uuid, user_id: UserId, id: ShapeId) -> Result<bool, RelayError> {
    let store = live_store(state, canvas_id).await?;
    editable(&store, id, user_id).await?;
    let deleted = store.delete(id).await?;

    if let Some(pool) = &state.pool
        && let Err(e) = persistence::delete_shape(pool, id).await
    {
        error!(error = %e, %canvas_id, shape_id = %id, "shape delete write-through failed");
    }
    Ok(deleted)
}

/// # Errors
///
/// `NotFound` when the shape does not exist.
pub async fn lock_shape(state: &AppState, canvas_id: Uuid, user_id: UserId, id: ShapeId) -> Result<LockGrant, RelayError> {
    let store = live_store(state, canvas_id).await?;
    Ok(store.acquire_lock(id, user_id).await?)
}

/// # Errors
///
/// `NotJoined` when the canvas is not live.
pub async fn unlock_shape(
    state: &AppState,
    canvas_id: Uuid,
    user_id: UserId,
    id: ShapeId,
) -> Result<Option<Shape>, RelayError> {
    let store = live_store(state, canvas_id).await?;
    Ok(store.release_lock(id, user_id).await?)
}

/// # Errors
///
/// `NotLockHolder` when selecting without the lock; `NotFound`.
pub async fn select_shape(
    state: &AppState,
    canvas_id: Uuid,
    user_id: UserId,
    id: ShapeId,
    selected: bool,
) -> Result<Shape, RelayError> {
    let store = live_store(state, canvas_id).await?;
    Ok(store.set_selection(id, user_id, selected).await?)
}
