//! Ephemeral keyed channel: non-durable, high-frequency state.
//!
//! DESIGN
//! ======
//! Values are raw JSON grouped by namespace (`positions`, `presence`). Nothing
//! here is authoritative: consumers treat a missing or stale entry as "fall
//! back to the shape store". Writers that want their keys gone when their
//! connection drops use `set_with_disconnect_removal`.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::shape::{Point, ShapeId, UserId};

pub use memory::{MemoryEphemeral, MemoryEphemeralHub};

/// Namespace for in-flight drag positions, keyed by shape id.
pub const POSITIONS: &str = "positions";

/// Namespace for presence records, keyed by user id.
pub const PRESENCE: &str = "presence";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum EphemeralEvent {
    Set { namespace: String, key: String, value: Value },
    Removed { namespace: String, key: String },
}

impl EphemeralEvent {
    #[must_use]
    pub fn namespace(&self) -> &str {
        match self {
            Self::Set { namespace, .. } | Self::Removed { namespace, .. } => namespace,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Removed { key, .. } => key,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EphemeralError {
    #[error("ephemeral channel unavailable: {0}")]
    Unavailable(String),
    #[error("ephemeral value malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl crate::frame::ErrorCode for EphemeralError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "E_EPHEMERAL_UNAVAILABLE",
            Self::Malformed(_) => "E_EPHEMERAL_MALFORMED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// In-flight drag position for one shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralPosition {
    pub shape_id: ShapeId,
    pub x: f64,
    pub y: f64,
    pub updated_by: UserId,
    /// Writer's wall clock, ms since epoch. Never compared against a
    /// reader's clock; see `ReceivedPosition`.
    pub timestamp: i64,
}

impl EphemeralPosition {
    #[must_use]
    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// A drag position as held by a reader, stamped on arrival with the reader's
/// own clock. Staleness is judged on `received_at` alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceivedPosition {
    pub position: EphemeralPosition,
    pub received_at: i64,
}

impl ReceivedPosition {
    #[must_use]
    pub fn new(position: EphemeralPosition, received_at: i64) -> Self {
        Self { position, received_at }
    }

    /// Nothing arrived for longer than `stale_ms` as of `now_ms`.
    #[must_use]
    pub fn is_stale_at(&self, now_ms: i64, stale_ms: i64) -> bool {
        now_ms - self.received_at > stale_ms
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Low-latency keyed store with push subscription.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), EphemeralError>;

    /// Like `set`, and additionally remove the key when this connection
    /// closes.
    async fn set_with_disconnect_removal(&self, namespace: &str, key: &str, value: Value) -> Result<(), EphemeralError>;

    /// Remove a key. Removing a missing key is a no-op.
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), EphemeralError>;

    async fn snapshot(&self, namespace: &str) -> Result<HashMap<String, Value>, EphemeralError>;

    fn subscribe(&self) -> broadcast::Receiver<EphemeralEvent>;
}

/// Decode every drag position currently in the channel. Malformed entries
/// are skipped.
///
/// # Errors
///
/// Propagates the store's snapshot error.
pub async fn positions(store: &dyn EphemeralStore) -> Result<HashMap<ShapeId, EphemeralPosition>, EphemeralError> {
    let raw = store.snapshot(POSITIONS).await?;
    Ok(raw
        .into_values()
        .filter_map(|value| serde_json::from_value::<EphemeralPosition>(value).ok())
        .map(|pos| (pos.shape_id, pos))
        .collect())
}

/// Write a drag position keyed by its shape id, removed on disconnect.
///
/// # Errors
///
/// Propagates the store's write error.
pub async fn write_position(store: &dyn EphemeralStore, position: &EphemeralPosition) -> Result<(), EphemeralError> {
    let value = serde_json::to_value(position)?;
    store
        .set_with_disconnect_removal(POSITIONS, &position.shape_id.to_string(), value)
        .await
}
