//! Persistence service: background flush of dirty shapes.
//!
//! DESIGN
//! ======
//! Live canvases keep their shapes in memory. A background task wakes every
//! `SHAPE_FLUSH_INTERVAL_MS`, snapshots each canvas's dirty shapes with their
//! versions, upserts them as JSON rows, then acks the versions back to the
//! store. Deletes bypass the queue and are written through immediately by
//! the shape handlers.
//!
//! ERROR HANDLING
//! ==============
//! Dirty flags are cleared only after successful writes, and only for shapes
//! whose version did not move during the write. Repeated upserts are
//! acceptable; silent data loss is not.

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::shape::{Shape, ShapeId};
use crate::state::AppState;
use crate::store::{MemoryShapeStore, ShapeStore};

/// Spawn the background persistence task. Returns `None` without a pool.
#[must_use]
pub fn spawn_persistence_task(state: AppState) -> Option<JoinHandle<()>> {
    let pool = state.pool.clone()?;
    let interval = state.config.shape_flush_interval;
    info!(flush_interval_ms = interval.as_millis(), "shape persistence flush configured");
    Some(tokio::spawn(async move {
        loop {
            flush_all_dirty(&state, &pool).await;
            tokio::time::sleep(interval).await;
        }
    }))
}

async fn flush_all_dirty(state: &AppState, pool: &PgPool) {
    // PHASE: SNAPSHOT LIVE STORES
    // WHY: collect store handles under the lock, then perform I/O lock-free.
    let stores: Vec<(Uuid, MemoryShapeStore)> = {
        let canvases = state.canvases.read().await;
        canvases
            .iter()
            .map(|(canvas_id, canvas)| (*canvas_id, canvas.store.clone()))
            .collect()
    };

    for (canvas_id, store) in stores {
        if let Err(e) = flush_store(pool, canvas_id, &store).await {
            error!(error = %e, %canvas_id, "persistence flush failed");
        }
    }
}

/// Flush one store's dirty shapes and ack what was written.
///
/// # Errors
///
/// Returns the database error; dirty flags are left untouched.
pub async fn flush_store(pool: &PgPool, canvas_id: Uuid, store: &MemoryShapeStore) -> Result<(), sqlx::Error> {
    let shapes = store.dirty_snapshot().await;
    if shapes.is_empty() {
        return Ok(());
    }
    let versions: Vec<(ShapeId, i64)> = shapes.iter().map(|s| (s.id, s.version)).collect();

    flush_shapes(pool, canvas_id, &shapes).await?;
    store.ack_flushed(&versions).await;

    // EDGE: a shape deleted while its upsert was in flight must not come back.
    for (shape_id, _) in &versions {
        if matches!(store.get(*shape_id).await, Ok(None)) {
            delete_shape(pool, *shape_id).await?;
        }
    }
    Ok(())
}

// =============================================================================
// ROWS
// =============================================================================

/// Load every persisted shape of a canvas. Rows that no longer decode are
/// skipped.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn load_shapes(pool: &PgPool, canvas_id: Uuid) -> Result<Vec<Shape>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (Uuid, serde_json::Value)>("SELECT id, body FROM canvas_shapes WHERE canvas_id = $1")
        .bind(canvas_id)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(id, body)| match serde_json::from_value::<Shape>(body) {
            Ok(shape) => Some(shape),
            Err(e) => {
                warn!(error = %e, shape_id = %id, %canvas_id, "skipping undecodable shape row");
                None
            }
        })
        .collect())
}

/// Upsert shapes. Older versions never overwrite newer rows.
///
/// # Errors
///
/// Returns a database error if any write fails; the batch is transactional.
pub async fn flush_shapes(pool: &PgPool, canvas_id: Uuid, shapes: &[Shape]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for shape in shapes {
        let body = encode_body(shape)?;
        sqlx::query(
            "INSERT INTO canvas_shapes (id, canvas_id, body, version, updated_at) \
             VALUES ($1, $2, $3, $4, now()) \
             ON CONFLICT (id) DO UPDATE SET \
                 body = EXCLUDED.body, version = EXCLUDED.version, updated_at = now() \
             WHERE canvas_shapes.version <= EXCLUDED.version",
        )
        .bind(shape.id)
        .bind(canvas_id)
        .bind(&body)
        .bind(shape.version)
        .execute(tx.as_mut())
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// JSON row body. An unencodable shape fails the batch, so its dirty flag
/// stays set instead of a `null` body overwriting the stored row.
fn encode_body<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, sqlx::Error> {
    serde_json::to_value(value).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

/// Delete a shape row. Missing rows are fine.
///
/// # Errors
///
/// Returns a database error if the delete fails.
pub async fn delete_shape(pool: &PgPool, shape_id: ShapeId) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM canvas_shapes WHERE id = $1")
        .bind(shape_id)
        .execute(pool)
        .await?;
    Ok(())
}
