//! In-memory ephemeral hub with per-connection handles.
//!
//! DESIGN
//! ======
//! `MemoryEphemeralHub` holds the shared namespaces. Each client obtains a
//! `MemoryEphemeral` handle via `connect`; keys written through a handle with
//! `set_with_disconnect_removal` are removed when that handle closes (or is
//! dropped), which is how crashed clients stop leaving drag ghosts behind.
//! The relay uses the hub directly and calls `disconnect` from its socket
//! cleanup path.
//!
//! State sits behind a `std::sync::Mutex`: every critical section is a plain
//! map operation with no `.await` inside.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{EphemeralError, EphemeralEvent, EphemeralStore};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

type EntryKey = (String, String);

#[derive(Default)]
struct HubState {
    namespaces: HashMap<String, HashMap<String, Value>>,
    /// Keys each connection asked to have removed on disconnect.
    on_disconnect: HashMap<Uuid, HashSet<EntryKey>>,
}

#[derive(Clone)]
pub struct MemoryEphemeralHub {
    state: Arc<Mutex<HubState>>,
    events: broadcast::Sender<EphemeralEvent>,
}

impl MemoryEphemeralHub {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { state: Arc::new(Mutex::new(HubState::default())), events }
    }

    /// Open a new connection handle.
    #[must_use]
    pub fn connect(&self) -> MemoryEphemeral {
        self.connect_as(Uuid::new_v4())
    }

    /// Open a handle with a caller-chosen connection id.
    #[must_use]
    pub fn connect_as(&self, conn_id: Uuid) -> MemoryEphemeral {
        MemoryEphemeral { hub: self.clone(), conn_id, closed: AtomicBool::new(false) }
    }

    /// Run a connection's disconnect hooks. Returns the keys actually removed.
    pub fn disconnect(&self, conn_id: Uuid) -> Vec<EntryKey> {
        let mut removed = Vec::new();
        {
            let mut state = self.lock();
            let Some(keys) = state.on_disconnect.remove(&conn_id) else {
                return removed;
            };
            for (namespace, key) in keys {
                let gone = state
                    .namespaces
                    .get_mut(&namespace)
                    .and_then(|entries| entries.remove(&key))
                    .is_some();
                if gone {
                    removed.push((namespace, key));
                }
            }
        }

        debug!(%conn_id, count = removed.len(), "ephemeral: disconnect cleanup");
        for (namespace, key) in &removed {
            let _ = self.events.send(EphemeralEvent::Removed { namespace: namespace.clone(), key: key.clone() });
        }
        removed
    }

    /// Write a value as `conn_id`, optionally registering disconnect removal.
    pub fn set_as(&self, conn_id: Uuid, namespace: &str, key: &str, value: Value, remove_on_disconnect: bool) {
        {
            let mut state = self.lock();
            state
                .namespaces
                .entry(namespace.to_owned())
                .or_default()
                .insert(key.to_owned(), value.clone());
            if remove_on_disconnect {
                state
                    .on_disconnect
                    .entry(conn_id)
                    .or_default()
                    .insert((namespace.to_owned(), key.to_owned()));
            }
        }
        let _ = self.events.send(EphemeralEvent::Set {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
            value,
        });
    }

    /// Remove a key on behalf of `conn_id`. Returns whether it existed.
    pub fn delete_as(&self, conn_id: Uuid, namespace: &str, key: &str) -> bool {
        let existed = {
            let mut state = self.lock();
            if let Some(keys) = state.on_disconnect.get_mut(&conn_id) {
                keys.remove(&(namespace.to_owned(), key.to_owned()));
            }
            state
                .namespaces
                .get_mut(namespace)
                .and_then(|entries| entries.remove(key))
                .is_some()
        };
        if existed {
            let _ = self.events.send(EphemeralEvent::Removed {
                namespace: namespace.to_owned(),
                key: key.to_owned(),
            });
        }
        existed
    }

    #[must_use]
    pub fn snapshot(&self, namespace: &str) -> HashMap<String, Value> {
        self.lock().namespaces.get(namespace).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EphemeralEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // A poisoned map is still structurally valid; keep serving.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MemoryEphemeralHub {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CONNECTION HANDLE
// =============================================================================

/// One client's connection to a `MemoryEphemeralHub`.
pub struct MemoryEphemeral {
    hub: MemoryEphemeralHub,
    conn_id: Uuid,
    closed: AtomicBool,
}

impl MemoryEphemeral {
    #[must_use]
    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Simulate a dropped connection: fire disconnect hooks and refuse
    /// further writes. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hub.disconnect(self.conn_id);
    }

    fn ensure_open(&self) -> Result<(), EphemeralError> {
        if self.is_closed() {
            return Err(EphemeralError::Unavailable(format!("connection {} closed", self.conn_id)));
        }
        Ok(())
    }
}

impl Drop for MemoryEphemeral {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeral {
    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), EphemeralError> {
        self.ensure_open()?;
        self.hub.set_as(self.conn_id, namespace, key, value, false);
        Ok(())
    }

    async fn set_with_disconnect_removal(&self, namespace: &str, key: &str, value: Value) -> Result<(), EphemeralError> {
        self.ensure_open()?;
        self.hub.set_as(self.conn_id, namespace, key, value, true);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), EphemeralError> {
        self.ensure_open()?;
        self.hub.delete_as(self.conn_id, namespace, key);
        Ok(())
    }

    async fn snapshot(&self, namespace: &str) -> Result<HashMap<String, Value>, EphemeralError> {
        self.ensure_open()?;
        Ok(self.hub.snapshot(namespace))
    }

    fn subscribe(&self) -> broadcast::Receiver<EphemeralEvent> {
        self.hub.subscribe()
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
