//! History Manager: bounded log of the local user's committed mutations.
//!
//! DESIGN
//! ======
//! A `VecDeque` ring: `record` pushes to the back and evicts from the front
//! once capacity is reached. `undo` scans from the back for the newest
//! operation matching `(user_id, shape_id)` and removes exactly that entry.
//! There is no redo stack.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::frame::now_ms;
use crate::shape::{Shape, ShapeId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub shape_id: ShapeId,
    /// `None` for creates.
    pub previous_state: Option<Shape>,
    /// `None` for deletes.
    pub new_state: Option<Shape>,
    pub user_id: UserId,
    pub timestamp: i64,
}

/// Store action that undoes one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reversal {
    Delete(ShapeId),
    Recreate(Shape),
    Restore(Shape),
}

impl HistoryOperation {
    #[must_use]
    pub fn created(shape: Shape, user_id: UserId) -> Self {
        Self {
            kind: OperationKind::Create,
            shape_id: shape.id,
            previous_state: None,
            new_state: Some(shape),
            user_id,
            timestamp: now_ms(),
        }
    }

    #[must_use]
    pub fn updated(before: Shape, after: Shape, user_id: UserId) -> Self {
        Self {
            kind: OperationKind::Update,
            shape_id: before.id,
            previous_state: Some(before),
            new_state: Some(after),
            user_id,
            timestamp: now_ms(),
        }
    }

    #[must_use]
    pub fn deleted(before: Shape, user_id: UserId) -> Self {
        Self {
            kind: OperationKind::Delete,
            shape_id: before.id,
            previous_state: Some(before),
            new_state: None,
            user_id,
            timestamp: now_ms(),
        }
    }

    /// The store action that reverses this operation. `None` only for a
    /// malformed record missing its required snapshot.
    #[must_use]
    pub fn reversal(&self) -> Option<Reversal> {
        match self.kind {
            OperationKind::Create => Some(Reversal::Delete(self.shape_id)),
            OperationKind::Delete => self.previous_state.clone().map(Reversal::Recreate),
            OperationKind::Update => self.previous_state.clone().map(Reversal::Restore),
        }
    }
}

#[derive(Debug)]
pub struct HistoryManager {
    ops: VecDeque<HistoryOperation>,
    capacity: usize,
}

impl HistoryManager {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { ops: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn record(&mut self, op: HistoryOperation) {
        while self.ops.len() >= self.capacity {
            self.ops.pop_front();
        }
        self.ops.push_back(op);
    }

    /// Remove and return the newest operation by `user_id` on `shape_id`.
    pub fn undo(&mut self, user_id: UserId, shape_id: ShapeId) -> Option<HistoryOperation> {
        let idx = self
            .ops
            .iter()
            .rposition(|op| op.user_id == user_id && op.shape_id == shape_id)?;
        self.ops.remove(idx)
    }

    #[must_use]
    pub fn can_undo(&self, user_id: UserId, shape_id: ShapeId) -> bool {
        self.ops
            .iter()
            .any(|op| op.user_id == user_id && op.shape_id == shape_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryOperation> {
        self.ops.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
