//! Shape Store: the persistent document holding the canonical shape list.
//!
//! DESIGN
//! ======
//! `ShapeStore` is the boundary to the durable document backend. Content
//! writes are last-write-wins; the lock primitives are atomic per shape so
//! two clients can never both be granted the same lock. Every committed
//! change is pushed to subscribers as a `ShapeEvent`.
//!
//! Implementations: `MemoryShapeStore` (in-process, also the relay's live
//! state) and `net::RemoteCanvas` (relay client).

pub mod memory;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::shape::{PatchError, Shape, ShapeId, ShapePatch, UserId};

pub use memory::MemoryShapeStore;

// =============================================================================
// TYPES
// =============================================================================

/// Push notification for a committed document change.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeEvent {
    Upserted(Shape),
    Deleted(ShapeId),
}

impl ShapeEvent {
    #[must_use]
    pub fn shape_id(&self) -> ShapeId {
        match self {
            Self::Upserted(shape) => shape.id,
            Self::Deleted(id) => *id,
        }
    }
}

/// Result of an atomic lock acquisition.
#[derive(Debug, Clone, PartialEq)]
pub enum LockGrant {
    /// Lock is now (or already was) held by the caller.
    Granted(Shape),
    /// Another user holds the lock.
    Held { holder: UserId },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("shape not found: {0}")]
    NotFound(ShapeId),
    #[error("shape {shape_id} is not locked by the caller")]
    NotLockHolder { shape_id: ShapeId, holder: Option<UserId> },
    #[error("invalid patch: {0}")]
    InvalidPatch(#[from] PatchError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Refused by a remote backend for a reason with no local variant.
    #[error("rejected by relay ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl crate::frame::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_SHAPE_NOT_FOUND",
            Self::NotLockHolder { .. } => "E_NOT_LOCK_HOLDER",
            Self::InvalidPatch(_) => "E_INVALID_PATCH",
            Self::Unavailable(_) => "E_STORE_UNAVAILABLE",
            Self::Rejected { .. } => "E_STORE_REJECTED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Durable, subscribable shape document for one canvas.
///
/// Writes are safe to replay: `create` upserts by id, and deleting or
/// releasing something already gone is a no-op.
#[async_trait]
pub trait ShapeStore: Send + Sync {
    /// Every shape on the canvas, in no particular order.
    async fn list(&self) -> Result<Vec<Shape>, StoreError>;

    async fn get(&self, id: ShapeId) -> Result<Option<Shape>, StoreError>;

    /// Insert `shape`, or replace the content of an existing shape with the
    /// same id. Lock and selection markers and the original author of an
    /// existing shape survive. `last_modified_by` is taken as given, so the
    /// caller stamps the acting user.
    async fn create(&self, shape: Shape) -> Result<Shape, StoreError>;

    /// Apply `patch`, stamping `last_modified_by` / `last_modified_at` with
    /// the server time.
    async fn update(&self, id: ShapeId, patch: &ShapePatch, by: UserId) -> Result<Shape, StoreError>;

    /// Remove a shape. Returns `false` when it was already gone.
    async fn delete(&self, id: ShapeId) -> Result<bool, StoreError>;

    /// Compare-and-swap on `locked_by`: grants when unlocked or already held
    /// by `user_id`.
    async fn acquire_lock(&self, id: ShapeId, user_id: UserId) -> Result<LockGrant, StoreError>;

    /// Clear the lock (and the holder's selection marker) if `holder` holds
    /// it. Returns the updated shape only when the lock actually transitioned.
    async fn release_lock(&self, id: ShapeId, holder: UserId) -> Result<Option<Shape>, StoreError>;

    /// Set or clear the selection marker. Setting requires holding the lock.
    async fn set_selection(&self, id: ShapeId, user_id: UserId, selected: bool) -> Result<Shape, StoreError>;

    /// Push stream of committed changes.
    fn subscribe(&self) -> broadcast::Receiver<ShapeEvent>;
}
