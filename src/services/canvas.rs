//! Canvas service: join/part, broadcast, and connection cleanup.
//!
//! DESIGN
//! ======
//! A canvas is hydrated from Postgres (when configured) on first join and
//! kept in memory while any client is connected. Leaving a canvas runs the
//! connection's cleanup: its disconnect-scoped ephemeral keys are removed
//! and, unless the same user is still connected elsewhere, every lock the
//! user holds is released. Peers are told about both through ordinary
//! `ephemeral:delete` / `shape:unlock` frames.
//!
//! ERROR HANDLING
//! ==============
//! On last-client part, dirty shapes are flushed before eviction. If that
//! flush fails the canvas stays in memory with its dirty flags intact so the
//! persistence task can retry.

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::persistence;
use crate::frame::{Data, EphemeralOp, ErrorCode, Frame, ShapeOp, Syscall};
use crate::shape::{Shape, ShapeId, UserId};
use crate::state::{AppState, CanvasState, ConnectedClient};
use crate::store::{ShapeStore, StoreError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("must join a canvas first")]
    NotJoined,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("shape {shape_id} is locked by {holder}")]
    LockedByOther { shape_id: ShapeId, holder: UserId },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotJoined => "E_NOT_JOINED",
            Self::BadRequest(_) => "E_BAD_REQUEST",
            Self::LockedByOther { .. } => "E_SHAPE_LOCKED",
            Self::Store(e) => e.error_code(),
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            Self::Database(_) => true,
            _ => false,
        }
    }
}

/// What a departing connection left behind, already broadcast to peers.
#[derive(Debug, Default)]
pub struct PartCleanup {
    pub removed_keys: Vec<(String, String)>,
    pub released: Vec<Shape>,
}

// =============================================================================
// JOIN / PART
// =============================================================================

/// Join a canvas, hydrating it if it is not live yet. Returns the current
/// shape list.
///
/// # Errors
///
/// Returns a database error if hydration fails.
pub async fn join_canvas(
    state: &AppState,
    canvas_id: Uuid,
    client_id: Uuid,
    user_id: UserId,
    tx: mpsc::Sender<Frame>,
) -> Result<Vec<Shape>, RelayError> {
    let live = state.canvases.read().await.contains_key(&canvas_id);

    // Fetch the persisted snapshot outside the lock; applied only if the
    // canvas is still not live once we hold it.
    let snapshot = match (&state.pool, live) {
        (Some(pool), false) => Some(persistence::load_shapes(pool, canvas_id).await?),
        _ => None,
    };

    let store = {
        let mut canvases = state.canvases.write().await;
        let fresh = !canvases.contains_key(&canvas_id);
        let canvas = canvases.entry(canvas_id).or_insert_with(CanvasState::new);

        if fresh && let Some(shapes) = snapshot {
            // EDGE: nobody is connected, so persisted lock markers are stale.
            let shapes: Vec<Shape> = shapes.iter().map(Shape::released).collect();
            info!(%canvas_id, count = shapes.len(), "hydrated canvas from database");
            canvas.store.hydrate(shapes).await;
        }

        canvas
            .clients
            .insert(client_id, ConnectedClient { user_id, tx });
        info!(%canvas_id, %client_id, %user_id, clients = canvas.clients.len(), "client joined canvas");
        canvas.store.clone()
    };

    Ok(store.list().await?)
}

/// Leave a canvas: run the connection's cleanup, notify peers, and evict
/// the canvas once the last client is gone and nothing is left to flush.
pub async fn part_canvas(state: &AppState, canvas_id: Uuid, client_id: Uuid) -> PartCleanup {
    let (user_id, store, hub, user_still_here) = {
        let mut canvases = state.canvases.write().await;
        let Some(canvas) = canvases.get_mut(&canvas_id) else {
            return PartCleanup::default();
        };
        let Some(client) = canvas.clients.remove(&client_id) else {
            return PartCleanup::default();
        };
        info!(%canvas_id, %client_id, remaining = canvas.clients.len(), "client left canvas");
        let still_here = canvas.user_has_other_client(client.user_id, client_id);
        (client.user_id, canvas.store.clone(), canvas.hub.clone(), still_here)
    };

    // PHASE: DISCONNECT CLEANUP
    // WHY: a dropped client must not leave drag ghosts, presence, or locks.
    let mut cleanup = PartCleanup { removed_keys: hub.disconnect(client_id), released: Vec::new() };
    if !user_still_here {
        cleanup.released = release_user_locks(&store, user_id).await;
    }

    for (namespace, key) in &cleanup.removed_keys {
        let frame = Frame::request(Syscall::Ephemeral(EphemeralOp::Delete), Data::new())
            .with_canvas_id(canvas_id)
            .with_from(user_id.to_string())
            .with_data("namespace", namespace.as_str())
            .with_data("key", key.as_str());
        broadcast(state, canvas_id, &frame, None).await;
    }
    for shape in &cleanup.released {
        let frame = Frame::request(Syscall::Shape(ShapeOp::Unlock), Data::new())
            .with_canvas_id(canvas_id)
            .with_from(user_id.to_string())
            .with_data("shape", json!(shape));
        broadcast(state, canvas_id, &frame, None).await;
    }

    evict_if_idle(state, canvas_id).await;
    cleanup
}

async fn release_user_locks(store: &crate::store::MemoryShapeStore, user_id: UserId) -> Vec<Shape> {
    let mut released = Vec::new();
    for shape_id in store.locked_by(user_id).await {
        match store.release_lock(shape_id, user_id).await {
            Ok(Some(shape)) => released.push(shape),
            Ok(None) => {}
            Err(e) => warn!(error = %e, %shape_id, %user_id, "failed to release lock on disconnect"),
        }
    }
    if !released.is_empty() {
        info!(%user_id, count = released.len(), "released locks of departed user");
    }
    released
}

async fn evict_if_idle(state: &AppState, canvas_id: Uuid) {
    let store = {
        let mut canvases = state.canvases.write().await;
        let Some(canvas) = canvases.get(&canvas_id) else {
            return;
        };
        if !canvas.clients.is_empty() {
            return;
        }

        // PHASE: HANDLE CLEAN EVICTION FAST PATH
        // WHY: avoid unnecessary I/O when the canvas has no pending mutations.
        if state.pool.is_none() || !canvas.store.has_dirty().await {
            canvases.remove(&canvas_id);
            info!(%canvas_id, "evicted canvas from memory");
            return;
        }
        canvas.store.clone()
    };

    let Some(pool) = &state.pool else {
        return;
    };

    // PHASE: FINAL FLUSH OUTSIDE THE LOCK
    // WHY: keep dirty flags until the write has actually succeeded.
    if let Err(e) = persistence::flush_store(pool, canvas_id, &store).await {
        error!(error = %e, %canvas_id, "final flush failed; canvas retained for retry");
        return;
    }

    let mut canvases = state.canvases.write().await;
    let Some(canvas) = canvases.get(&canvas_id) else {
        return;
    };
    if !canvas.clients.is_empty() {
        return;
    }
    if canvas.store.has_dirty().await {
        warn!(%canvas_id, "retaining canvas after final flush because newer dirty shapes exist");
    } else {
        canvases.remove(&canvas_id);
        info!(%canvas_id, "evicted canvas from memory");
    }
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Broadcast a frame to all clients on a canvas, optionally excluding one.
pub async fn broadcast(state: &AppState, canvas_id: Uuid, frame: &Frame, exclude: Option<Uuid>) {
    let canvases = state.canvases.read().await;
    let Some(canvas) = canvases.get(&canvas_id) else {
        return;
    };

    for (client_id, client) in &canvas.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        // Best-effort: if a client's channel is full, skip it.
        if client.tx.try_send(frame.clone()).is_err() {
            warn!(%canvas_id, %client_id, syscall = %frame.syscall, "dropping frame for slow client");
        }
    }
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
