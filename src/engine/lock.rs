//! Lock Manager: advisory per-shape locks and selection.
//!
//! DESIGN
//! ======
//! A lock is the shape's `locked_by` marker in the shape store. Acquisition
//! goes through the store's compare-and-swap primitive, so two users racing
//! for the same shape get exactly one grant. Release is holder-checked and
//! returns whether the lock actually transitioned, so a sweep over several
//! release triggers (deselect, tool switch, tab hide, teardown) clears each
//! lock exactly once.
//!
//! Selection rides on the lock: it is set only after a successful
//! acquisition and cleared in the same write that releases the lock.
//!
//! ERROR HANDLING
//! ==============
//! Store failures never escape as panics or errors from the sweep paths; they
//! are logged and surfaced as `AcquireOutcome::Failed` or a smaller release
//! count.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::shape::{Shape, ShapeId, UserId};
use crate::store::{LockGrant, ShapeStore, StoreError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug)]
pub enum AcquireOutcome {
    /// Lock held by the caller. For `select`, the selection is set too.
    Acquired(Shape),
    /// Another user holds the lock; nothing changed.
    AlreadyLocked { holder: UserId },
    /// Shape does not exist.
    Missing,
    /// Store failure; treated as not acquired.
    Failed(StoreError),
}

impl AcquireOutcome {
    #[must_use]
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    #[must_use]
    pub fn shape(&self) -> Option<&Shape> {
        match self {
            Self::Acquired(shape) => Some(shape),
            _ => None,
        }
    }
}

/// What triggered a release. Logged only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Deselect,
    Reselect,
    ToolSwitch,
    SignOut,
    TabHidden,
    Teardown,
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Deselect => "deselect",
            Self::Reselect => "reselect",
            Self::ToolSwitch => "tool_switch",
            Self::SignOut => "sign_out",
            Self::TabHidden => "tab_hidden",
            Self::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Lock and selection operations for one local user.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn ShapeStore>,
    user_id: UserId,
}

impl LockManager {
    #[must_use]
    pub fn new(store: Arc<dyn ShapeStore>, user_id: UserId) -> Self {
        Self { store, user_id }
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Try to take the lock on `shape_id` for the local user.
    pub async fn acquire(&self, shape_id: ShapeId) -> AcquireOutcome {
        match self.store.acquire_lock(shape_id, self.user_id).await {
            Ok(LockGrant::Granted(shape)) => {
                debug!(%shape_id, user_id = %self.user_id, "lock: acquired");
                AcquireOutcome::Acquired(shape)
            }
            Ok(LockGrant::Held { holder }) => {
                debug!(%shape_id, %holder, "lock: contended");
                AcquireOutcome::AlreadyLocked { holder }
            }
            Err(StoreError::NotFound(_)) => AcquireOutcome::Missing,
            Err(e) => {
                warn!(error = %e, %shape_id, "lock: acquire failed");
                AcquireOutcome::Failed(e)
            }
        }
    }

    /// Release the local user's lock on `shape_id`. Returns `true` only when
    /// the lock transitioned to unlocked.
    pub async fn release(&self, shape_id: ShapeId, reason: ReleaseReason) -> bool {
        match self.store.release_lock(shape_id, self.user_id).await {
            Ok(Some(_)) => {
                debug!(%shape_id, %reason, "lock: released");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, %shape_id, %reason, "lock: release failed");
                false
            }
        }
    }

    /// Release every lock held by `user_id`. Returns how many transitioned.
    /// Used for the local user and for cleaning up after a departed peer.
    pub async fn release_all_for(&self, user_id: UserId, reason: ReleaseReason) -> usize {
        let held = match self.held_by(user_id).await {
            Ok(held) => held,
            Err(e) => {
                warn!(error = %e, %user_id, %reason, "lock: cannot list held locks");
                return 0;
            }
        };

        let mut released = 0;
        for shape_id in held {
            match self.store.release_lock(shape_id, user_id).await {
                Ok(Some(_)) => released += 1,
                Ok(None) => {}
                Err(e) => warn!(error = %e, %shape_id, %reason, "lock: release failed"),
            }
        }
        if released > 0 {
            info!(%user_id, %reason, released, "lock: released all");
        }
        released
    }

    /// Release every lock the local user holds.
    pub async fn release_all(&self, reason: ReleaseReason) -> usize {
        self.release_all_for(self.user_id, reason).await
    }

    /// Make `shape_id` the single selection: release other held locks, then
    /// acquire this one, then set the selection marker.
    pub async fn select(&self, shape_id: ShapeId) -> AcquireOutcome {
        match self.held_by(self.user_id).await {
            Ok(held) => {
                for other in held.into_iter().filter(|id| *id != shape_id) {
                    self.release(other, ReleaseReason::Reselect).await;
                }
            }
            Err(e) => {
                warn!(error = %e, %shape_id, "lock: cannot list held locks before select");
                return AcquireOutcome::Failed(e);
            }
        }
        self.extend_selection(shape_id).await
    }

    /// Add `shape_id` to the selection without releasing anything else.
    pub async fn extend_selection(&self, shape_id: ShapeId) -> AcquireOutcome {
        let outcome = self.acquire(shape_id).await;
        if !outcome.is_acquired() {
            return outcome;
        }

        match self.store.set_selection(shape_id, self.user_id, true).await {
            Ok(shape) => AcquireOutcome::Acquired(shape),
            Err(StoreError::NotFound(_)) => AcquireOutcome::Missing,
            Err(e) => {
                // EDGE: lock raced away or write failed; do not leave a bare lock.
                warn!(error = %e, %shape_id, "lock: select failed after acquire");
                self.release(shape_id, ReleaseReason::Reselect).await;
                AcquireOutcome::Failed(e)
            }
        }
    }

    /// Clear the whole local selection. Returns how many locks transitioned.
    pub async fn deselect(&self) -> usize {
        self.release_all(ReleaseReason::Deselect).await
    }

    /// Shapes currently selected by the local user.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn selected(&self) -> Result<Vec<Shape>, StoreError> {
        let shapes = self.store.list().await?;
        Ok(shapes
            .into_iter()
            .filter(|s| s.selected_by == Some(self.user_id))
            .collect())
    }

    async fn held_by(&self, user_id: UserId) -> Result<Vec<ShapeId>, StoreError> {
        let shapes = self.store.list().await?;
        Ok(shapes
            .into_iter()
            .filter(|s| s.is_locked_by(user_id))
            .map(|s| s.id)
            .collect())
    }
}

#[cfg(test)]
#[path = "lock_test.rs"]
mod tests;
