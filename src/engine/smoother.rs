//! Remote Motion Smoother: interpolates other users' in-flight drags.
//!
//! DESIGN
//! ======
//! One track per shape, keyed by the user currently driving it. Each new
//! target restarts a smoothstep ease from wherever the shape is drawn now,
//! and every animation tick advances the ease by a fixed blend. A drag seen
//! for the first time eases out from the committed position; a change of
//! driver eases out from the point already on screen. Nothing snaps.
//!
//! Tracks are dropped when the ephemeral entry vanishes, goes stale, or
//! turns out to be the local user's own write; the renderer then falls back
//! to the committed shape-store position. Staleness uses the local arrival
//! time, never the writer's clock.

use std::collections::{HashMap, HashSet};

use crate::config::SyncConfig;
use crate::ephemeral::ReceivedPosition;
use crate::frame::now_ms;
use crate::shape::{Point, ShapeId, UserId};

#[derive(Debug, Clone, Copy)]
struct Track {
    updated_by: UserId,
    from: Point,
    target: Point,
    current: Point,
    progress: f64,
}

/// `t²(3 − 2t)`, clamped to `[0, 1]`.
#[must_use]
pub fn smoothstep(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

#[derive(Debug)]
pub struct RemoteMotionSmoother {
    blend: f64,
    stale_ms: i64,
    tracks: HashMap<ShapeId, Track>,
}

impl RemoteMotionSmoother {
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self { blend: config.smoothing_blend, stale_ms: config.ephemeral_stale_ms, tracks: HashMap::new() }
    }

    /// Smoothed draw position for `shape_id` this tick, or `None` when the
    /// committed position should be used. `committed` is where the shape
    /// store has it.
    pub fn smooth(
        &mut self,
        shape_id: ShapeId,
        committed: Point,
        entry: Option<&ReceivedPosition>,
        local_user: UserId,
    ) -> Option<Point> {
        self.smooth_at(now_ms(), shape_id, committed, entry, local_user)
    }

    /// `smooth` with an explicit local clock reading.
    pub fn smooth_at(
        &mut self,
        now_ms: i64,
        shape_id: ShapeId,
        committed: Point,
        entry: Option<&ReceivedPosition>,
        local_user: UserId,
    ) -> Option<Point> {
        let Some(held) = entry else {
            self.forget(shape_id);
            return None;
        };
        let driver = held.position.updated_by;
        if driver == local_user || held.is_stale_at(now_ms, self.stale_ms) {
            self.forget(shape_id);
            return None;
        }

        let start = match self.tracks.get(&shape_id) {
            Some(track) if track.updated_by == driver => None,
            Some(track) => Some(track.current),
            None => Some(committed),
        };
        if let Some(start) = start {
            self.tracks.insert(
                shape_id,
                Track { updated_by: driver, from: start, target: start, current: start, progress: 1.0 },
            );
        }
        let track = self.tracks.get_mut(&shape_id)?;

        let target = held.position.point();
        if track.target != target {
            track.from = track.current;
            track.target = target;
            track.progress = 0.0;
        }
        track.progress = (track.progress + self.blend).min(1.0);
        track.current = if track.progress >= 1.0 {
            track.target
        } else {
            let eased = smoothstep(track.progress);
            Point::new(
                track.from.x + (track.target.x - track.from.x) * eased,
                track.from.y + (track.target.y - track.from.y) * eased,
            )
        };
        Some(track.current)
    }

    pub fn forget(&mut self, shape_id: ShapeId) {
        self.tracks.remove(&shape_id);
    }

    /// Drop tracks for shapes not in `live`.
    pub fn retain_live(&mut self, live: &HashSet<ShapeId>) {
        self.tracks.retain(|id, _| live.contains(id));
    }

    #[must_use]
    pub fn is_tracking(&self, shape_id: ShapeId) -> bool {
        self.tracks.contains_key(&shape_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
#[path = "smoother_test.rs"]
mod tests;
