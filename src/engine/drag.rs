//! Drag Coordinator: ephemeral position broadcast during a drag, durable
//! commit on release.
//!
//! DESIGN
//! ======
//! While a shape is dragged, positions go only to the ephemeral channel.
//! Writes are throttled by pointer velocity: fast movement uses the base
//! interval, slow movement twice that, since slow motion interpolates well
//! on the receiving side. Every sample also re-arms a debounced "settled"
//! write so the final resting position always reaches peers even when the
//! throttle swallowed the last sample.
//!
//! Releasing the drag cancels the debounce first, then clears the ephemeral
//! entries, then commits final positions to the shape store. The lock is
//! kept; releasing it is the Lock Manager's job.
//!
//! Group drags apply the primary shape's delta to every co-dragged shape.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::SyncConfig;
use crate::engine::smoother::RemoteMotionSmoother;
use crate::ephemeral::{self, EphemeralPosition, EphemeralStore, POSITIONS};
use crate::frame::{ErrorCode, now_ms};
use crate::shape::{Point, Shape, ShapeId, ShapePatch, UserId};
use crate::store::{ShapeStore, StoreError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DragError {
    #[error("shape {0} is not locked by the local user")]
    NotLockHolder(ShapeId),
    #[error("shape not found: {0}")]
    Missing(ShapeId),
    #[error("no drag in progress for shape {0}")]
    NotDragging(ShapeId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for DragError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotLockHolder(_) => "E_NOT_LOCK_HOLDER",
            Self::Missing(_) => "E_SHAPE_NOT_FOUND",
            Self::NotDragging(_) => "E_NOT_DRAGGING",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.retryable())
    }
}

/// Result of one `update_position` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragSample {
    /// Pointer speed since the previous sample, px/ms.
    pub velocity: f64,
    /// Whether the immediate (throttled) write fired.
    pub written: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommittedMove {
    pub before: Shape,
    pub after: Shape,
}

/// Outcome of `end_drag`.
#[derive(Debug, Default)]
pub struct DragCommit {
    pub moves: Vec<CommittedMove>,
    pub failed: Vec<(ShapeId, StoreError)>,
}

impl DragCommit {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ActiveDrag {
    primary: ShapeId,
    /// Store snapshots at drag start; primary first.
    before: Vec<Shape>,
    latest: Vec<EphemeralPosition>,
    last_sample: Option<(Point, Instant)>,
    last_write: Option<Instant>,
    settle: Option<JoinHandle<()>>,
}

impl ActiveDrag {
    fn shape_ids(&self) -> impl Iterator<Item = ShapeId> + '_ {
        self.before.iter().map(|s| s.id)
    }
}

// =============================================================================
// COORDINATOR
// =============================================================================

pub struct DragCoordinator {
    store: Arc<dyn ShapeStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    smoother: Arc<Mutex<RemoteMotionSmoother>>,
    user_id: UserId,
    config: SyncConfig,
    active: Option<ActiveDrag>,
}

impl DragCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn ShapeStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        smoother: Arc<Mutex<RemoteMotionSmoother>>,
        user_id: UserId,
        config: SyncConfig,
    ) -> Self {
        Self { store, ephemeral, smoother, user_id, config, active: None }
    }

    /// Write interval for a given pointer velocity.
    #[must_use]
    pub fn throttle_for(&self, velocity: f64) -> Duration {
        if velocity >= self.config.drag_fast_velocity {
            self.config.drag_throttle
        } else {
            self.config.drag_throttle * 2
        }
    }

    #[must_use]
    pub fn is_dragging(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub fn dragging(&self) -> Vec<ShapeId> {
        self.active
            .as_ref()
            .map(|a| a.shape_ids().collect())
            .unwrap_or_default()
    }

    /// Latest local drag position for `shape_id`, if it is being dragged.
    #[must_use]
    pub fn local_position(&self, shape_id: ShapeId) -> Option<Point> {
        self.active
            .as_ref()?
            .latest
            .iter()
            .find(|p| p.shape_id == shape_id)
            .map(EphemeralPosition::point)
    }

    /// Begin dragging a single shape.
    ///
    /// # Errors
    ///
    /// `NotLockHolder` unless the local user holds the shape's lock.
    pub async fn start_drag(&mut self, shape_id: ShapeId) -> Result<(), DragError> {
        self.start_group_drag(shape_id, &[]).await
    }

    /// Begin dragging `primary`, carrying `companions` along by the same
    /// delta. Companions not locked by the local user are left behind.
    ///
    /// # Errors
    ///
    /// `Missing` or `NotLockHolder` for the primary shape; store failures.
    pub async fn start_group_drag(&mut self, primary: ShapeId, companions: &[ShapeId]) -> Result<(), DragError> {
        if self.active.is_some() {
            warn!(%primary, "drag: starting while another drag is active; cancelling it");
            self.cancel_drag().await;
        }

        let lead = self.store.get(primary).await?.ok_or(DragError::Missing(primary))?;
        if !lead.is_locked_by(self.user_id) {
            return Err(DragError::NotLockHolder(primary));
        }

        let mut seen = HashSet::from([primary]);
        let mut before = vec![lead];
        for &id in companions {
            if !seen.insert(id) {
                continue;
            }
            match self.store.get(id).await? {
                Some(shape) if shape.is_locked_by(self.user_id) => before.push(shape),
                _ => debug!(shape_id = %id, "drag: companion not held, skipping"),
            }
        }

        {
            let mut smoother = self.smoother.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for shape in &before {
                smoother.forget(shape.id);
            }
        }

        debug!(%primary, count = before.len(), "drag: started");
        self.active = Some(ActiveDrag {
            primary,
            before,
            latest: Vec::new(),
            last_sample: None,
            last_write: None,
            settle: None,
        });
        Ok(())
    }

    /// Record a pointer sample for the primary shape.
    ///
    /// # Errors
    ///
    /// `NotDragging` when `shape_id` is not the active drag's primary shape.
    /// Ephemeral write failures are logged, never returned.
    pub async fn update_position(&mut self, shape_id: ShapeId, x: f64, y: f64) -> Result<DragSample, DragError> {
        let now = Instant::now();
        let fast_velocity = self.config.drag_fast_velocity;
        let base_throttle = self.config.drag_throttle;
        let debounce = self.config.drag_debounce;

        let active = self
            .active
            .as_mut()
            .filter(|a| a.primary == shape_id)
            .ok_or(DragError::NotDragging(shape_id))?;

        let point = Point::new(x, y);
        let velocity = match active.last_sample {
            Some((prev, at)) => {
                let dt_ms = now.duration_since(at).as_secs_f64() * 1000.0;
                prev.distance(point) / dt_ms.max(1.0)
            }
            None => 0.0,
        };
        active.last_sample = Some((point, now));

        let origin = active.before[0].position();
        let (dx, dy) = (x - origin.x, y - origin.y);
        let stamp = now_ms();
        active.latest = active
            .before
            .iter()
            .map(|s| EphemeralPosition {
                shape_id: s.id,
                x: s.geometry.x + dx,
                y: s.geometry.y + dy,
                updated_by: self.user_id,
                timestamp: stamp,
            })
            .collect();

        let interval = if velocity >= fast_velocity { base_throttle } else { base_throttle * 2 };
        let written = active
            .last_write
            .is_none_or(|at| now.duration_since(at) >= interval);
        if written {
            active.last_write = Some(now);
            write_positions(self.ephemeral.as_ref(), &active.latest).await;
        }

        // Re-arm the settled write with the newest positions.
        if let Some(pending) = active.settle.take() {
            pending.abort();
        }
        let ephemeral = Arc::clone(&self.ephemeral);
        let mut settled = active.latest.clone();
        active.settle = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let stamp = now_ms();
            for pos in &mut settled {
                pos.timestamp = stamp;
            }
            write_positions(ephemeral.as_ref(), &settled).await;
        }));

        Ok(DragSample { velocity, written })
    }

    /// Finish the drag: cancel the settled write, clear ephemeral entries,
    /// then commit final positions. Keeps the lock.
    ///
    /// # Errors
    ///
    /// `NotDragging` when `shape_id` is not the active drag's primary shape.
    /// Per-shape commit failures are reported in `DragCommit::failed`.
    pub async fn end_drag(&mut self, shape_id: ShapeId) -> Result<DragCommit, DragError> {
        let Some(mut active) = self.active.take_if(|a| a.primary == shape_id) else {
            return Err(DragError::NotDragging(shape_id));
        };

        cancel_settle(&mut active).await;
        self.clear_positions(&active).await;

        let mut commit = DragCommit::default();
        for (before, pos) in active.before.into_iter().zip(active.latest) {
            let patch = ShapePatch::position(pos.x, pos.y);
            match self.store.update(before.id, &patch, self.user_id).await {
                Ok(after) => commit.moves.push(CommittedMove { before, after }),
                Err(e) => {
                    error!(error = %e, shape_id = %before.id, "drag: commit failed");
                    commit.failed.push((before.id, e));
                }
            }
        }

        debug!(%shape_id, moved = commit.moves.len(), failed = commit.failed.len(), "drag: ended");
        Ok(commit)
    }

    /// Abandon the active drag without committing. Returns whether a drag
    /// was active.
    pub async fn cancel_drag(&mut self) -> bool {
        let Some(mut active) = self.active.take() else {
            return false;
        };
        cancel_settle(&mut active).await;
        self.clear_positions(&active).await;
        debug!(shape_id = %active.primary, "drag: cancelled");
        true
    }

    async fn clear_positions(&self, active: &ActiveDrag) {
        for id in active.shape_ids() {
            if let Err(e) = self.ephemeral.delete(POSITIONS, &id.to_string()).await {
                warn!(error = %e, shape_id = %id, "drag: failed to clear ephemeral position");
            }
        }
    }
}

async fn cancel_settle(active: &mut ActiveDrag) {
    if let Some(pending) = active.settle.take() {
        pending.abort();
        // Wait out an in-flight write so it cannot land after the clear.
        let _ = pending.await;
    }
}

async fn write_positions(store: &dyn EphemeralStore, positions: &[EphemeralPosition]) {
    for pos in positions {
        if let Err(e) = ephemeral::write_position(store, pos).await {
            warn!(error = %e, shape_id = %pos.shape_id, "drag: ephemeral write failed");
        }
    }
}

#[cfg(test)]
#[path = "drag_test.rs"]
mod tests;
