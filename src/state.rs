//! Shared relay state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the optional database pool and a map of live canvases. Each
//! canvas owns an in-memory shape store (which also tracks dirty shapes for
//! debounced persistence), an ephemeral hub, and its connected clients.
//!
//! The store and hub are cheap clones over shared state, so handlers clone
//! them out of the map and drop the canvases lock before awaiting anything.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::ephemeral::MemoryEphemeralHub;
use crate::frame::Frame;
use crate::shape::UserId;
use crate::store::MemoryShapeStore;

// =============================================================================
// CANVAS STATE
// =============================================================================

/// One live WebSocket connection on a canvas.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub user_id: UserId,
    /// Outbound frames for this connection's socket.
    pub tx: mpsc::Sender<Frame>,
}

/// Per-canvas live state. Kept in memory while anyone is connected.
pub struct CanvasState {
    pub store: MemoryShapeStore,
    pub hub: MemoryEphemeralHub,
    /// Connected clients keyed by client id.
    pub clients: HashMap<Uuid, ConnectedClient>,
}

impl CanvasState {
    #[must_use]
    pub fn new() -> Self {
        Self { store: MemoryShapeStore::new(), hub: MemoryEphemeralHub::new(), clients: HashMap::new() }
    }

    /// Whether any other connection on this canvas belongs to `user_id`.
    #[must_use]
    pub fn user_has_other_client(&self, user_id: UserId, client_id: Uuid) -> bool {
        self.clients
            .iter()
            .any(|(id, client)| *id != client_id && client.user_id == user_id)
    }
}

impl Default for CanvasState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state. Clone is required by Axum; every field is
/// Arc-wrapped or cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// `None` runs the relay without durable persistence.
    pub pool: Option<PgPool>,
    pub canvases: Arc<RwLock<HashMap<Uuid, CanvasState>>>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(pool: Option<PgPool>, config: ServerConfig) -> Self {
        Self { pool, canvases: Arc::new(RwLock::new(HashMap::new())), config: Arc::new(config) }
    }

    /// Store and hub handles for a live canvas.
    pub async fn backends(&self, canvas_id: Uuid) -> Option<(MemoryShapeStore, MemoryEphemeralHub)> {
        let canvases = self.canvases.read().await;
        canvases
            .get(&canvas_id)
            .map(|canvas| (canvas.store.clone(), canvas.hub.clone()))
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// In-memory relay state with no database.
    #[must_use]
    pub fn test_app_state() -> AppState {
        AppState::new(None, ServerConfig::default())
    }

    /// Seed an empty live canvas and return its ID.
    pub async fn seed_canvas(state: &AppState) -> Uuid {
        let canvas_id = Uuid::new_v4();
        state.canvases.write().await.insert(canvas_id, CanvasState::new());
        canvas_id
    }
}
