//! Client-side coordination engine.
//!
//! ARCHITECTURE
//! ============
//! Each component owns its own state and talks to the backends only through
//! the `ShapeStore` / `EphemeralStore` traits:
//!
//! - `lock`      advisory per-shape locks and the single-selector marker
//! - `drag`      throttled ephemeral drag writes, commit on release
//! - `smoother`  interpolation of other users' drags
//! - `presence`  online roster, cursors, heartbeats
//! - `history`   bounded per-user undo log
//! - `session`   composes the above for one user on one canvas
//!
//! Background work (event pumps, heartbeats, trailing writes) runs in tokio
//! tasks owned through `Subscription` handles, so dropping the owner stops
//! the work.

pub mod drag;
pub mod history;
pub mod lock;
pub mod presence;
pub mod session;
pub mod smoother;

use std::future::Future;

use tokio::task::JoinHandle;

pub use drag::{DragCommit, DragCoordinator, DragError, DragSample};
pub use history::{HistoryManager, HistoryOperation, OperationKind, Reversal};
pub use lock::{AcquireOutcome, LockManager, ReleaseReason};
pub use presence::{PresenceRecord, PresenceRegistry};
pub use session::{CanvasError, CanvasSession, RenderItem, SessionIdentity};
pub use smoother::RemoteMotionSmoother;

/// Owned background task. Aborted when dropped.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self { handle: tokio::spawn(fut) }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::Arc;

    use uuid::Uuid;

    use crate::ephemeral::{EphemeralStore, MemoryEphemeralHub};
    use crate::shape::{Geometry, Shape, ShapeKind, UserId};
    use crate::store::{MemoryShapeStore, ShapeStore};

    /// Shared backends for one canvas.
    pub struct Backends {
        pub store: Arc<MemoryShapeStore>,
        pub hub: MemoryEphemeralHub,
    }

    impl Backends {
        pub fn new() -> Self {
            Self { store: Arc::new(MemoryShapeStore::new()), hub: MemoryEphemeralHub::new() }
        }

        pub fn shape_store(&self) -> Arc<dyn ShapeStore> {
            self.store.clone()
        }

        pub fn connect(&self) -> Arc<dyn EphemeralStore> {
            Arc::new(self.hub.connect())
        }

        pub async fn seed_shape(&self, x: f64, y: f64) -> Shape {
            self.seed_shape_by(Uuid::new_v4(), x, y).await
        }

        pub async fn seed_shape_by(&self, created_by: UserId, x: f64, y: f64) -> Shape {
            let shape = Shape::new(ShapeKind::Rectangle, Geometry::new(x, y, 100.0, 80.0), created_by);
            self.store.create(shape).await.unwrap()
        }
    }
}
