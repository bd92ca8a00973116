//! Canvas Session: one user's live connection to one canvas.
//!
//! ARCHITECTURE
//! ============
//! The session wires the engine components to a shared pair of backends and
//! keeps a local mirror of the shape list and the drag positions, fed by
//! event pumps and by write-through of the session's own commits. Rendering
//! reads only the mirror.
//!
//! LIFECYCLE
//! =========
//! `open` subscribes, snapshots, joins presence and starts the pumps.
//! `teardown` runs the shutdown in a fixed order: active drag cancelled,
//! locks released, presence left, pumps stopped. The ephemeral connection
//! itself closes when the last handle to it is dropped.
//!
//! ERROR HANDLING
//! ==============
//! Retryable store failures flip the offline indicator; the next successful
//! store call clears it. Optimistic mirror state is kept until the next
//! authoritative event.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::Subscription;
use super::drag::{DragCommit, DragCoordinator, DragError, DragSample};
use super::history::{HistoryManager, HistoryOperation, Reversal};
use super::lock::{AcquireOutcome, LockManager, ReleaseReason};
use super::presence::{PresenceRecord, PresenceRegistry};
use super::smoother::RemoteMotionSmoother;
use crate::config::SyncConfig;
use crate::ephemeral::{self, EphemeralError, EphemeralEvent, EphemeralPosition, EphemeralStore, POSITIONS, ReceivedPosition};
use crate::frame::{ErrorCode, now_ms};
use crate::shape::{Geometry, Point, Shape, ShapeId, ShapeKind, ShapePatch, UserId};
use crate::store::{ShapeEvent, ShapeStore, StoreError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ephemeral(#[from] EphemeralError),
    #[error(transparent)]
    Drag(#[from] DragError),
    #[error("shape {shape_id} is locked by {holder}")]
    LockedByOther { shape_id: ShapeId, holder: UserId },
    #[error("shape not found: {0}")]
    NotFound(ShapeId),
    #[error("session is closed")]
    Closed,
}

impl ErrorCode for CanvasError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
            Self::Ephemeral(e) => e.error_code(),
            Self::Drag(e) => e.error_code(),
            Self::LockedByOther { .. } => "E_SHAPE_LOCKED",
            Self::NotFound(_) => "E_SHAPE_NOT_FOUND",
            Self::Closed => "E_SESSION_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            Self::Ephemeral(e) => e.retryable(),
            Self::Drag(e) => e.retryable(),
            _ => false,
        }
    }
}

/// Who the local user is.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub display_name: String,
    /// `None` picks from the cursor palette.
    pub cursor_color: Option<String>,
}

impl SessionIdentity {
    #[must_use]
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self { user_id, display_name: display_name.into(), cursor_color: None }
    }
}

/// One shape as the renderer should draw it this frame.
///
/// `shape` already carries the local user's in-flight drag position.
/// `smoothed_position`, when set, overrides the position for a shape being
/// dragged by someone else.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderItem {
    pub shape: Shape,
    pub is_locked: bool,
    pub is_selected_by_other: bool,
    pub smoothed_position: Option<Point>,
}

#[derive(Default)]
struct Mirror {
    shapes: HashMap<ShapeId, Shape>,
    positions: HashMap<ShapeId, ReceivedPosition>,
}

/// Stamp freshly read positions with the local arrival time.
fn arrived_now(positions: HashMap<ShapeId, EphemeralPosition>) -> HashMap<ShapeId, ReceivedPosition> {
    let now = now_ms();
    positions
        .into_iter()
        .map(|(id, pos)| (id, ReceivedPosition::new(pos, now)))
        .collect()
}

impl Mirror {
    fn upsert(&mut self, shape: &Shape) {
        let newer = self
            .shapes
            .get(&shape.id)
            .is_none_or(|current| shape.version >= current.version);
        if newer {
            self.shapes.insert(shape.id, shape.clone());
        }
    }

    /// Drop positions nothing has refreshed within `stale_ms`.
    fn purge_stale(&mut self, now_ms: i64, stale_ms: i64) {
        self.positions.retain(|shape_id, held| {
            let fresh = !held.is_stale_at(now_ms, stale_ms);
            if !fresh {
                debug!(%shape_id, updated_by = %held.position.updated_by, "session: purging stale drag position");
            }
            fresh
        });
    }

    fn apply(&mut self, event: ShapeEvent) {
        match event {
            ShapeEvent::Upserted(shape) => self.upsert(&shape),
            ShapeEvent::Deleted(id) => {
                self.shapes.remove(&id);
                self.positions.remove(&id);
            }
        }
    }
}

type SharedMirror = Arc<RwLock<Mirror>>;

fn write_mirror(mirror: &SharedMirror) -> std::sync::RwLockWriteGuard<'_, Mirror> {
    mirror.write().unwrap_or_else(PoisonError::into_inner)
}

fn read_mirror(mirror: &SharedMirror) -> std::sync::RwLockReadGuard<'_, Mirror> {
    mirror.read().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// SESSION
// =============================================================================

pub struct CanvasSession {
    user_id: UserId,
    store: Arc<dyn ShapeStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    locks: LockManager,
    drag: DragCoordinator,
    smoother: Arc<Mutex<RemoteMotionSmoother>>,
    presence: PresenceRegistry,
    history: HistoryManager,
    mirror: SharedMirror,
    stale_ms: i64,
    offline: Arc<AtomicBool>,
    pumps: Vec<Subscription>,
    closed: bool,
}

impl CanvasSession {
    /// Connect `identity` to a canvas.
    ///
    /// # Errors
    ///
    /// Fails when the initial snapshot or the presence join fails.
    pub async fn open(
        store: Arc<dyn ShapeStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        identity: SessionIdentity,
        config: SyncConfig,
    ) -> Result<Self, CanvasError> {
        let user_id = identity.user_id;

        // PHASE: SUBSCRIBE BEFORE SNAPSHOT
        // WHY: events committed between the two would otherwise be lost.
        let shape_rx = store.subscribe();
        let position_rx = ephemeral.subscribe();

        let mirror: SharedMirror = Arc::new(RwLock::new(Mirror {
            shapes: store.list().await?.into_iter().map(|s| (s.id, s)).collect(),
            positions: arrived_now(ephemeral::positions(ephemeral.as_ref()).await?),
        }));

        let presence = PresenceRegistry::new(Arc::clone(&ephemeral), &config);
        let mut pumps = vec![presence.watch_roster()];
        presence
            .join(user_id, &identity.display_name, identity.cursor_color.as_deref())
            .await?;
        pumps.push(presence.spawn_heartbeat());
        pumps.push(Subscription::spawn(pump_shapes(Arc::clone(&store), shape_rx, Arc::clone(&mirror))));
        pumps.push(Subscription::spawn(pump_positions(
            Arc::clone(&ephemeral),
            position_rx,
            Arc::clone(&mirror),
        )));

        let smoother = Arc::new(Mutex::new(RemoteMotionSmoother::new(&config)));
        let drag = DragCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&ephemeral),
            Arc::clone(&smoother),
            user_id,
            config,
        );

        info!(%user_id, display_name = %identity.display_name, "session: opened");
        Ok(Self {
            user_id,
            locks: LockManager::new(Arc::clone(&store), user_id),
            store,
            ephemeral,
            drag,
            smoother,
            presence,
            history: HistoryManager::new(config.history_capacity),
            mirror,
            stale_ms: config.ephemeral_stale_ms,
            offline: Arc::new(AtomicBool::new(false)),
            pumps,
            closed: false,
        })
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// True after a retryable store failure, until the next success.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    #[must_use]
    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    #[must_use]
    pub fn online_users(&self) -> Vec<PresenceRecord> {
        self.presence.online()
    }

    /// Collaborators to draw cursors for.
    #[must_use]
    pub fn others(&self) -> Vec<PresenceRecord> {
        self.presence.others()
    }

    /// Mirrored shape, if known.
    #[must_use]
    pub fn shape(&self, id: ShapeId) -> Option<Shape> {
        read_mirror(&self.mirror).shapes.get(&id).cloned()
    }

    #[must_use]
    pub fn is_dragging(&self) -> bool {
        self.drag.is_dragging()
    }

    // -------------------------------------------------------------------------
    // Shape mutations
    // -------------------------------------------------------------------------

    /// Create a shape authored by the local user.
    ///
    /// # Errors
    ///
    /// Store failures; `Closed` after teardown.
    pub async fn create_shape(&mut self, kind: ShapeKind, geometry: Geometry) -> Result<Shape, CanvasError> {
        self.ensure_open()?;
        let shape = Shape::new(kind, geometry, self.user_id);
        let created = self.track(self.store.create(shape).await)?;
        write_mirror(&self.mirror).upsert(&created);
        self.history
            .record(HistoryOperation::created(created.clone(), self.user_id));
        debug!(shape_id = %created.id, kind = created.kind.type_name(), "session: created shape");
        Ok(created)
    }

    /// Apply a content patch. Refused while another user holds the lock.
    ///
    /// # Errors
    ///
    /// `NotFound`, `LockedByOther`, store failures.
    pub async fn update_shape(&mut self, id: ShapeId, patch: &ShapePatch) -> Result<Shape, CanvasError> {
        self.ensure_open()?;
        let before = self.fetch_editable(id).await?;
        let after = self.track(self.store.update(id, patch, self.user_id).await)?;
        write_mirror(&self.mirror).upsert(&after);
        self.history
            .record(HistoryOperation::updated(before, after.clone(), self.user_id));
        Ok(after)
    }

    /// Delete a shape. Returns `false` when it was already gone.
    ///
    /// # Errors
    ///
    /// `LockedByOther`, store failures.
    pub async fn delete_shape(&mut self, id: ShapeId) -> Result<bool, CanvasError> {
        self.ensure_open()?;
        let before = match self.fetch_editable(id).await {
            Ok(shape) => shape,
            Err(CanvasError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if self.drag.dragging().contains(&id) {
            self.drag.cancel_drag().await;
        }
        if !self.track(self.store.delete(id).await)? {
            return Ok(false);
        }
        write_mirror(&self.mirror).apply(ShapeEvent::Deleted(id));
        self.history
            .record(HistoryOperation::deleted(before, self.user_id));
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------------

    /// Make `id` the single selection (release others, lock, select).
    pub async fn select(&mut self, id: ShapeId) -> AcquireOutcome {
        if self.closed {
            return AcquireOutcome::Failed(StoreError::Unavailable("session is closed".into()));
        }
        if self.drag.is_dragging() && !self.drag.dragging().contains(&id) {
            self.drag.cancel_drag().await;
        }
        let outcome = self.locks.select(id).await;
        self.note_outcome(&outcome);
        outcome
    }

    /// Add `id` to the selection.
    pub async fn extend_selection(&mut self, id: ShapeId) -> AcquireOutcome {
        if self.closed {
            return AcquireOutcome::Failed(StoreError::Unavailable("session is closed".into()));
        }
        let outcome = self.locks.extend_selection(id).await;
        self.note_outcome(&outcome);
        outcome
    }

    /// Clear the selection and release its locks.
    pub async fn deselect(&mut self) -> usize {
        self.release_all(ReleaseReason::Deselect).await
    }

    // -------------------------------------------------------------------------
    // Drag
    // -------------------------------------------------------------------------

    /// Start dragging `id`, carrying the rest of the local selection along.
    ///
    /// # Errors
    ///
    /// `NotLockHolder` unless `id` is locked by the local user.
    pub async fn begin_drag(&mut self, id: ShapeId) -> Result<(), CanvasError> {
        self.ensure_open()?;
        let selected = self.track(self.locks.selected().await)?;
        let companions: Vec<ShapeId> = selected
            .into_iter()
            .map(|s| s.id)
            .filter(|sid| *sid != id)
            .collect();
        self.drag.start_group_drag(id, &companions).await?;
        Ok(())
    }

    /// Pointer moved during a drag.
    ///
    /// # Errors
    ///
    /// `NotDragging` when `id` is not the dragged shape.
    pub async fn drag_to(&mut self, id: ShapeId, x: f64, y: f64) -> Result<DragSample, CanvasError> {
        Ok(self.drag.update_position(id, x, y).await?)
    }

    /// Release the pointer: clear ephemeral entries, commit, record history.
    ///
    /// # Errors
    ///
    /// `NotDragging` when `id` is not the dragged shape. Per-shape commit
    /// failures come back in `DragCommit::failed`.
    pub async fn end_drag(&mut self, id: ShapeId) -> Result<DragCommit, CanvasError> {
        let commit = self.drag.end_drag(id).await?;
        {
            let mut mirror = write_mirror(&self.mirror);
            for mv in &commit.moves {
                mirror.upsert(&mv.after);
            }
        }
        for mv in &commit.moves {
            self.history
                .record(HistoryOperation::updated(mv.before.clone(), mv.after.clone(), self.user_id));
        }
        if commit.failed.iter().any(|(_, e)| e.retryable()) {
            self.set_offline(true);
        } else if !commit.moves.is_empty() {
            self.set_offline(false);
        }
        Ok(commit)
    }

    /// Abandon the active drag without committing.
    pub async fn cancel_drag(&mut self) -> bool {
        self.drag.cancel_drag().await
    }

    // -------------------------------------------------------------------------
    // Undo
    // -------------------------------------------------------------------------

    /// Undo is offered only with exactly one shape selected by the local
    /// user and a recorded operation on it.
    pub async fn can_undo(&self) -> bool {
        match self.single_selection().await {
            Some(shape_id) => self.history.can_undo(self.user_id, shape_id),
            None => false,
        }
    }

    /// Undo the newest local operation on the single selected shape.
    ///
    /// # Errors
    ///
    /// Store failures while applying the reversal; the operation is put back
    /// so the undo can be retried.
    pub async fn undo(&mut self) -> Result<Option<HistoryOperation>, CanvasError> {
        self.ensure_open()?;
        let Some(shape_id) = self.single_selection().await else {
            return Ok(None);
        };
        let Some(op) = self.history.undo(self.user_id, shape_id) else {
            return Ok(None);
        };

        let Some(reversal) = op.reversal() else {
            warn!(%shape_id, "session: history entry has no reversible snapshot");
            return Ok(Some(op));
        };
        if let Err(e) = self.apply_reversal(reversal).await {
            self.history.record(op);
            return Err(e);
        }
        info!(%shape_id, kind = ?op.kind, "session: undo applied");
        Ok(Some(op))
    }

    /// Execute a reversal against the store. A restore whose target is gone
    /// is logged and skipped.
    ///
    /// # Errors
    ///
    /// `LockedByOther` when restoring a shape someone else holds; store
    /// failures.
    pub async fn apply_reversal(&mut self, reversal: Reversal) -> Result<(), CanvasError> {
        self.ensure_open()?;
        match reversal {
            Reversal::Delete(id) => {
                if self.drag.dragging().contains(&id) {
                    self.drag.cancel_drag().await;
                }
                if self.track(self.store.delete(id).await)? {
                    write_mirror(&self.mirror).apply(ShapeEvent::Deleted(id));
                }
            }
            Reversal::Recreate(shape) => {
                let mut shape = shape.released();
                shape.last_modified_by = self.user_id;
                let created = self.track(self.store.create(shape).await)?;
                write_mirror(&self.mirror).upsert(&created);
            }
            Reversal::Restore(shape) => {
                let current = match self.fetch_editable(shape.id).await {
                    Ok(current) => current,
                    Err(CanvasError::NotFound(id)) => {
                        warn!(shape_id = %id, "session: undo target no longer exists");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                let restored = self
                    .track(
                        self.store
                            .update(current.id, &ShapePatch::restore(&shape), self.user_id)
                            .await,
                    )?;
                write_mirror(&self.mirror).upsert(&restored);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lifecycle hooks
    // -------------------------------------------------------------------------

    /// Tool changed away from selection.
    pub async fn switch_tool(&mut self) -> usize {
        self.release_all(ReleaseReason::ToolSwitch).await
    }

    /// Tab went to the background.
    pub async fn tab_hidden(&mut self) -> usize {
        self.release_all(ReleaseReason::TabHidden).await
    }

    /// Tab became visible again: refresh presence.
    ///
    /// # Errors
    ///
    /// Presence write failure.
    pub async fn tab_visible(&self) -> Result<bool, CanvasError> {
        Ok(self.presence.visibility_regained().await?)
    }

    /// Transport came back: refresh presence and resync the mirror.
    ///
    /// # Errors
    ///
    /// Presence write or snapshot failures.
    pub async fn reconnected(&mut self) -> Result<(), CanvasError> {
        self.ensure_open()?;
        self.presence.reconnected().await?;
        let shapes = self.track(self.store.list().await)?;
        let positions = ephemeral::positions(self.ephemeral.as_ref()).await?;
        let mut mirror = write_mirror(&self.mirror);
        mirror.shapes = shapes.into_iter().map(|s| (s.id, s)).collect();
        mirror.positions = arrived_now(positions);
        Ok(())
    }

    /// Local cursor moved.
    ///
    /// # Errors
    ///
    /// Presence write failure.
    pub async fn update_cursor(&self, x: f64, y: f64) -> Result<bool, CanvasError> {
        Ok(self.presence.update_cursor(x, y).await?)
    }

    /// Sign out: release locks under the sign-out reason, then tear down.
    /// Returns how many locks transitioned.
    pub async fn sign_out(&mut self) -> usize {
        let released = self.release_all(ReleaseReason::SignOut).await;
        self.teardown().await;
        released
    }

    /// Ordered shutdown. Idempotent.
    pub async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.drag.cancel_drag().await;
        self.locks.release_all(ReleaseReason::Teardown).await;
        if let Err(e) = self.presence.leave().await {
            warn!(error = %e, user_id = %self.user_id, "session: presence leave failed");
        }
        self.pumps.clear();
        info!(user_id = %self.user_id, "session: torn down");
    }

    // -------------------------------------------------------------------------
    // Rendering
    // -------------------------------------------------------------------------

    /// Shapes to draw this tick, in z order.
    #[must_use]
    pub fn render_frame(&self) -> Vec<RenderItem> {
        self.render_frame_at(now_ms())
    }

    /// `render_frame` with an explicit local clock reading. Drag positions
    /// that went silent are purged from the mirror here.
    #[must_use]
    pub fn render_frame_at(&self, now_ms: i64) -> Vec<RenderItem> {
        let mut mirror = write_mirror(&self.mirror);
        mirror.purge_stale(now_ms, self.stale_ms);
        let mut smoother = self.smoother.lock().unwrap_or_else(PoisonError::into_inner);

        let live: HashSet<ShapeId> = mirror.shapes.keys().copied().collect();
        smoother.retain_live(&live);

        let mut items: Vec<RenderItem> = mirror
            .shapes
            .values()
            .map(|stored| {
                let mut shape = stored.clone();
                // Ephemeral positions only mean something while the shape is locked.
                let smoothed_position = if shape.is_locked_by_other(self.user_id) {
                    smoother.smooth_at(now_ms, shape.id, shape.position(), mirror.positions.get(&shape.id), self.user_id)
                } else {
                    smoother.forget(shape.id);
                    None
                };
                if let Some(local) = self.drag.local_position(shape.id) {
                    shape.geometry.x = local.x;
                    shape.geometry.y = local.y;
                }
                RenderItem {
                    is_locked: shape.is_locked(),
                    is_selected_by_other: shape.is_selected_by_other(self.user_id),
                    smoothed_position,
                    shape,
                }
            })
            .collect();
        items.sort_by(|a, b| {
            a.shape
                .z_index
                .cmp(&b.shape.z_index)
                .then(a.shape.id.cmp(&b.shape.id))
        });
        items
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn ensure_open(&self) -> Result<(), CanvasError> {
        if self.closed {
            return Err(CanvasError::Closed);
        }
        Ok(())
    }

    fn set_offline(&self, offline: bool) {
        let was = self.offline.swap(offline, Ordering::AcqRel);
        if was != offline {
            if offline {
                warn!(user_id = %self.user_id, "session: store unreachable, working offline");
            } else {
                info!(user_id = %self.user_id, "session: store reachable again");
            }
        }
    }

    fn track<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        match &result {
            Ok(_) => self.set_offline(false),
            Err(e) if e.retryable() => self.set_offline(true),
            Err(_) => {}
        }
        result
    }

    fn note_outcome(&self, outcome: &AcquireOutcome) {
        match outcome {
            AcquireOutcome::Acquired(shape) => {
                self.set_offline(false);
                write_mirror(&self.mirror).upsert(shape);
            }
            AcquireOutcome::Failed(e) if e.retryable() => self.set_offline(true),
            _ => {}
        }
    }

    async fn release_all(&mut self, reason: ReleaseReason) -> usize {
        self.drag.cancel_drag().await;
        self.locks.release_all(reason).await
    }

    async fn fetch_editable(&self, id: ShapeId) -> Result<Shape, CanvasError> {
        let shape = self
            .track(self.store.get(id).await)?
            .ok_or(CanvasError::NotFound(id))?;
        if let Some(holder) = shape.locked_by.filter(|holder| *holder != self.user_id) {
            return Err(CanvasError::LockedByOther { shape_id: id, holder });
        }
        Ok(shape)
    }

    async fn single_selection(&self) -> Option<ShapeId> {
        match self.track(self.locks.selected().await) {
            Ok(selected) if selected.len() == 1 => Some(selected[0].id),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "session: cannot read selection");
                None
            }
        }
    }
}

// =============================================================================
// PUMPS
// =============================================================================

async fn pump_shapes(store: Arc<dyn ShapeStore>, mut rx: broadcast::Receiver<ShapeEvent>, mirror: SharedMirror) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                write_mirror(&mirror).apply(event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "session: shape events lagged, resyncing");
                match store.list().await {
                    Ok(shapes) => {
                        write_mirror(&mirror).shapes = shapes.into_iter().map(|s| (s.id, s)).collect();
                    }
                    Err(e) => warn!(error = %e, "session: shape resync failed"),
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn pump_positions(
    ephemeral: Arc<dyn EphemeralStore>,
    mut rx: broadcast::Receiver<EphemeralEvent>,
    mirror: SharedMirror,
) {
    loop {
        match rx.recv().await {
            Ok(EphemeralEvent::Set { namespace, value, .. }) if namespace == POSITIONS => {
                match serde_json::from_value::<EphemeralPosition>(value) {
                    Ok(pos) => {
                        write_mirror(&mirror)
                            .positions
                            .insert(pos.shape_id, ReceivedPosition::new(pos, now_ms()));
                    }
                    Err(e) => debug!(error = %e, "session: ignoring malformed position"),
                }
            }
            Ok(EphemeralEvent::Removed { namespace, key }) if namespace == POSITIONS => {
                if let Ok(id) = key.parse::<ShapeId>() {
                    write_mirror(&mirror).positions.remove(&id);
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "session: position events lagged, resyncing");
                match ephemeral::positions(ephemeral.as_ref()).await {
                    Ok(positions) => {
                        write_mirror(&mirror).positions = arrived_now(positions);
                    }
                    Err(e) => warn!(error = %e, "session: position resync failed"),
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
