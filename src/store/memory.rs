//! In-memory shape store.
//!
//! DESIGN
//! ======
//! Shapes live in a `HashMap` behind a tokio `RwLock`; every write takes the
//! write lock for its whole check-and-mutate step, which is what makes
//! `acquire_lock` a real compare-and-swap. Each write bumps `version`, marks
//! the shape dirty for debounced persistence, and publishes a `ShapeEvent`.
//!
//! Dirty tracking mirrors the relay's flush protocol: the persistence task
//! snapshots dirty shapes with their versions, writes them, then acks. A
//! shape written again after the snapshot keeps its dirty flag.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

use super::{LockGrant, ShapeEvent, ShapeStore, StoreError};
use crate::frame::now_ms;
use crate::shape::{Shape, ShapeId, ShapePatch, UserId};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Document {
    shapes: HashMap<ShapeId, Shape>,
    /// Shape IDs modified since last flush.
    dirty: HashSet<ShapeId>,
    next_z: i32,
}

#[derive(Clone)]
pub struct MemoryShapeStore {
    doc: Arc<RwLock<Document>>,
    events: broadcast::Sender<ShapeEvent>,
}

impl MemoryShapeStore {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { doc: Arc::new(RwLock::new(Document::default())), events }
    }

    /// Replace the document with a persisted snapshot. Clears dirty flags.
    pub async fn hydrate(&self, shapes: Vec<Shape>) {
        let mut doc = self.doc.write().await;
        doc.next_z = shapes.iter().map(|s| s.z_index + 1).max().unwrap_or(0);
        doc.shapes = shapes.into_iter().map(|s| (s.id, s)).collect();
        doc.dirty.clear();
    }

    /// Clone every dirty shape for flushing.
    pub async fn dirty_snapshot(&self) -> Vec<Shape> {
        let doc = self.doc.read().await;
        doc.dirty
            .iter()
            .filter_map(|id| doc.shapes.get(id).cloned())
            .collect()
    }

    /// Clear dirty flags for shapes whose version is unchanged since flush.
    pub async fn ack_flushed(&self, flushed_versions: &[(ShapeId, i64)]) {
        let mut doc = self.doc.write().await;
        for (shape_id, flushed_version) in flushed_versions {
            // EDGE: keep dirty flag if shape was updated again after snapshot.
            let can_clear = match doc.shapes.get(shape_id) {
                Some(current) => current.version == *flushed_version,
                None => true,
            };
            if can_clear {
                doc.dirty.remove(shape_id);
            }
        }
    }

    pub async fn has_dirty(&self) -> bool {
        !self.doc.read().await.dirty.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.doc.read().await.shapes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.doc.read().await.shapes.is_empty()
    }

    /// Shapes currently locked by `user_id`.
    pub async fn locked_by(&self, user_id: UserId) -> Vec<ShapeId> {
        let doc = self.doc.read().await;
        doc.shapes
            .values()
            .filter(|s| s.is_locked_by(user_id))
            .map(|s| s.id)
            .collect()
    }

    fn publish(&self, event: ShapeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryShapeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn touch(shape: &mut Shape, by: UserId) {
    shape.version += 1;
    shape.last_modified_by = by;
    shape.last_modified_at = now_ms();
}

#[async_trait]
impl ShapeStore for MemoryShapeStore {
    async fn list(&self) -> Result<Vec<Shape>, StoreError> {
        let doc = self.doc.read().await;
        Ok(doc.shapes.values().cloned().collect())
    }

    async fn get(&self, id: ShapeId) -> Result<Option<Shape>, StoreError> {
        let doc = self.doc.read().await;
        Ok(doc.shapes.get(&id).cloned())
    }

    async fn create(&self, mut shape: Shape) -> Result<Shape, StoreError> {
        let mut doc = self.doc.write().await;
        let now = now_ms();
        if let Some(existing) = doc.shapes.get(&shape.id) {
            shape.locked_by = existing.locked_by;
            shape.selected_by = existing.selected_by;
            shape.z_index = existing.z_index;
            shape.created_by = existing.created_by;
            shape.created_at = existing.created_at;
            shape.version = existing.version + 1;
        } else {
            shape.locked_by = None;
            shape.selected_by = None;
            shape.z_index = doc.next_z;
            shape.created_at = now;
            shape.version = 1;
            doc.next_z += 1;
        }
        shape.last_modified_at = now;

        doc.dirty.insert(shape.id);
        doc.shapes.insert(shape.id, shape.clone());
        drop(doc);

        self.publish(ShapeEvent::Upserted(shape.clone()));
        Ok(shape)
    }

    async fn update(&self, id: ShapeId, patch: &ShapePatch, by: UserId) -> Result<Shape, StoreError> {
        let mut doc = self.doc.write().await;
        let shape = doc.shapes.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        // Apply to a scratch copy so a rejected patch leaves no partial write.
        let mut next = shape.clone();
        patch.apply(&mut next)?;
        touch(&mut next, by);
        *shape = next.clone();
        doc.dirty.insert(id);
        drop(doc);

        self.publish(ShapeEvent::Upserted(next.clone()));
        Ok(next)
    }

    async fn delete(&self, id: ShapeId) -> Result<bool, StoreError> {
        let mut doc = self.doc.write().await;
        if doc.shapes.remove(&id).is_none() {
            return Ok(false);
        }
        doc.dirty.remove(&id);
        drop(doc);

        self.publish(ShapeEvent::Deleted(id));
        Ok(true)
    }

    async fn acquire_lock(&self, id: ShapeId, user_id: UserId) -> Result<LockGrant, StoreError> {
        let mut doc = self.doc.write().await;
        let shape = doc.shapes.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        match shape.locked_by {
            Some(holder) if holder != user_id => return Ok(LockGrant::Held { holder }),
            Some(_) => return Ok(LockGrant::Granted(shape.clone())),
            None => {}
        }

        shape.locked_by = Some(user_id);
        touch(shape, user_id);
        let granted = shape.clone();
        doc.dirty.insert(id);
        drop(doc);

        self.publish(ShapeEvent::Upserted(granted.clone()));
        Ok(LockGrant::Granted(granted))
    }

    async fn release_lock(&self, id: ShapeId, holder: UserId) -> Result<Option<Shape>, StoreError> {
        let mut doc = self.doc.write().await;
        let Some(shape) = doc.shapes.get_mut(&id) else {
            return Ok(None);
        };
        if !shape.is_locked_by(holder) {
            return Ok(None);
        }

        shape.locked_by = None;
        if shape.selected_by == Some(holder) {
            shape.selected_by = None;
        }
        touch(shape, holder);
        let released = shape.clone();
        doc.dirty.insert(id);
        drop(doc);

        self.publish(ShapeEvent::Upserted(released.clone()));
        Ok(Some(released))
    }

    async fn set_selection(&self, id: ShapeId, user_id: UserId, selected: bool) -> Result<Shape, StoreError> {
        let mut doc = self.doc.write().await;
        let shape = doc.shapes.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if selected {
            if !shape.is_locked_by(user_id) {
                return Err(StoreError::NotLockHolder { shape_id: id, holder: shape.locked_by });
            }
            if shape.selected_by == Some(user_id) {
                return Ok(shape.clone());
            }
            shape.selected_by = Some(user_id);
        } else {
            if shape.selected_by != Some(user_id) {
                return Ok(shape.clone());
            }
            shape.selected_by = None;
        }
        touch(shape, user_id);
        let updated = shape.clone();
        doc.dirty.insert(id);
        drop(doc);

        self.publish(ShapeEvent::Upserted(updated.clone()));
        Ok(updated)
    }

    fn subscribe(&self) -> broadcast::Receiver<ShapeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
