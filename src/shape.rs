//! Shape data model.
//!
//! DESIGN
//! ======
//! A shape is a shared base record (identity, geometry, style, lock and
//! selection markers, audit fields) plus a `ShapeKind` sum type carrying only
//! the fields its variant needs. Lock and selection are stored as
//! `Option<UserId>` so "locked" and "locked by whom" can never disagree.
//!
//! Content mutations go through `ShapePatch`; lock and selection markers are
//! deliberately absent from the patch and change only through the store's
//! lock primitives.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frame::now_ms;

pub type ShapeId = Uuid;
pub type UserId = Uuid;

// =============================================================================
// GEOMETRY / STYLE
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn distance(self, other: Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation: f64,
}

impl Geometry {
    #[must_use]
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height, rotation: 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Style {
    pub fill: String,
    pub stroke: String,
}

impl Default for Style {
    fn default() -> Self {
        Self { fill: "#FFFFFF".into(), stroke: "#1F2937".into() }
    }
}

// =============================================================================
// KIND
// =============================================================================

/// Variant-specific shape content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ShapeKind {
    Rectangle,
    Circle,
    Text { text: String, font_size: f64 },
    StickyNote { text: String },
    Card { title: String, content: String },
    List { title: String, items: Vec<String> },
}

impl ShapeKind {
    /// Wire name of the variant, matching the serde tag.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Rectangle => "rectangle",
            Self::Circle => "circle",
            Self::Text { .. } => "text",
            Self::StickyNote { .. } => "stickyNote",
            Self::Card { .. } => "card",
            Self::List { .. } => "list",
        }
    }

    #[must_use]
    pub fn same_variant(&self, other: &ShapeKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

// =============================================================================
// SHAPE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    pub id: ShapeId,
    pub kind: ShapeKind,
    pub geometry: Geometry,
    pub style: Style,
    pub z_index: i32,
    pub locked_by: Option<UserId>,
    pub selected_by: Option<UserId>,
    pub created_by: UserId,
    pub created_at: i64,
    pub last_modified_by: UserId,
    pub last_modified_at: i64,
    pub version: i64,
}

impl Shape {
    /// Build a fresh, unlocked shape authored by `created_by`.
    #[must_use]
    pub fn new(kind: ShapeKind, geometry: Geometry, created_by: UserId) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            kind,
            geometry,
            style: Style::default(),
            z_index: 0,
            locked_by: None,
            selected_by: None,
            created_by,
            created_at: now,
            last_modified_by: created_by,
            last_modified_at: now,
            version: 1,
        }
    }

    #[must_use]
    pub fn with_style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    #[must_use]
    pub fn is_selected(&self) -> bool {
        self.selected_by.is_some()
    }

    #[must_use]
    pub fn is_locked_by(&self, user_id: UserId) -> bool {
        self.locked_by == Some(user_id)
    }

    /// Locked by someone other than `user_id`.
    #[must_use]
    pub fn is_locked_by_other(&self, user_id: UserId) -> bool {
        self.locked_by.is_some_and(|holder| holder != user_id)
    }

    /// Selected by someone other than `user_id`.
    #[must_use]
    pub fn is_selected_by_other(&self, user_id: UserId) -> bool {
        self.selected_by.is_some_and(|selector| selector != user_id)
    }

    #[must_use]
    pub fn position(&self) -> Point {
        Point::new(self.geometry.x, self.geometry.y)
    }

    /// Copy of this shape with lock and selection markers cleared.
    #[must_use]
    pub fn released(&self) -> Self {
        let mut shape = self.clone();
        shape.locked_by = None;
        shape.selected_by = None;
        shape
    }
}

// =============================================================================
// PATCH
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("cannot change shape type from {from} to {to}")]
    KindMismatch { from: &'static str, to: &'static str },
    #[error("invalid geometry: {0}")]
    InvalidGeometry(&'static str),
}

/// Partial content update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Style>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ShapeKind>,
}

impl ShapePatch {
    #[must_use]
    pub fn position(x: f64, y: f64) -> Self {
        Self { x: Some(x), y: Some(y), ..Self::default() }
    }

    /// Patch that writes back every content field of `shape`. Used by undo.
    #[must_use]
    pub fn restore(shape: &Shape) -> Self {
        Self {
            x: Some(shape.geometry.x),
            y: Some(shape.geometry.y),
            width: Some(shape.geometry.width),
            height: Some(shape.geometry.height),
            rotation: Some(shape.geometry.rotation),
            style: Some(shape.style.clone()),
            kind: Some(shape.kind.clone()),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply this patch to `shape` in place. Audit fields are the caller's job.
    ///
    /// # Errors
    ///
    /// Returns `KindMismatch` when the patch would change the shape variant,
    /// and `InvalidGeometry` for non-finite or negative dimensions.
    pub fn apply(&self, shape: &mut Shape) -> Result<(), PatchError> {
        if let Some(kind) = &self.kind
            && !shape.kind.same_variant(kind)
        {
            return Err(PatchError::KindMismatch { from: shape.kind.type_name(), to: kind.type_name() });
        }
        for value in [self.x, self.y, self.width, self.height, self.rotation]
            .into_iter()
            .flatten()
        {
            if !value.is_finite() {
                return Err(PatchError::InvalidGeometry("non-finite value"));
            }
        }
        if self.width.is_some_and(|w| w < 0.0) || self.height.is_some_and(|h| h < 0.0) {
            return Err(PatchError::InvalidGeometry("negative dimension"));
        }

        let g = &mut shape.geometry;
        if let Some(x) = self.x {
            g.x = x;
        }
        if let Some(y) = self.y {
            g.y = y;
        }
        if let Some(w) = self.width {
            g.width = w;
        }
        if let Some(h) = self.height {
            g.height = h;
        }
        if let Some(r) = self.rotation {
            g.rotation = r;
        }
        if let Some(style) = &self.style {
            shape.style = style.clone();
        }
        if let Some(kind) = &self.kind {
            shape.kind = kind.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(text: &str) -> Shape {
        Shape::new(
            ShapeKind::StickyNote { text: text.into() },
            Geometry::new(10.0, 20.0, 100.0, 100.0),
            Uuid::new_v4(),
        )
    }

    #[test]
    fn new_shape_is_unlocked_and_unselected() {
        let shape = note("hi");
        assert!(!shape.is_locked());
        assert!(!shape.is_selected());
        assert_eq!(shape.version, 1);
        assert_eq!(shape.created_by, shape.last_modified_by);
    }

    #[test]
    fn lock_helpers_distinguish_self_and_other() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut shape = note("x");
        shape.locked_by = Some(other);
        shape.selected_by = Some(other);
        assert!(shape.is_locked_by_other(me));
        assert!(shape.is_selected_by_other(me));
        assert!(!shape.is_locked_by_other(other));
        assert!(!shape.is_selected_by_other(other));
    }

    #[test]
    fn kind_serializes_with_camel_case_tag() {
        let kind = ShapeKind::StickyNote { text: "a".into() };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "stickyNote");
        assert_eq!(json["text"], "a");

        let text = ShapeKind::Text { text: "t".into(), font_size: 14.0 };
        let json = serde_json::to_value(&text).unwrap();
        assert_eq!(json["fontSize"], 14.0);
    }

    #[test]
    fn shape_json_uses_camel_case_fields() {
        let shape = note("hello");
        let json = serde_json::to_value(&shape).unwrap();
        assert!(json.get("lockedBy").is_some());
        assert!(json.get("lastModifiedAt").is_some());
        let restored: Shape = serde_json::from_value(json).unwrap();
        assert_eq!(restored, shape);
    }

    #[test]
    fn patch_applies_partial_fields() {
        let mut shape = note("x");
        ShapePatch::position(50.0, 60.0).apply(&mut shape).unwrap();
        assert!((shape.geometry.x - 50.0).abs() < f64::EPSILON);
        assert!((shape.geometry.y - 60.0).abs() < f64::EPSILON);
        assert!((shape.geometry.width - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn patch_rejects_variant_change() {
        let mut shape = note("x");
        let patch = ShapePatch { kind: Some(ShapeKind::Circle), ..ShapePatch::default() };
        assert_eq!(
            patch.apply(&mut shape),
            Err(PatchError::KindMismatch { from: "stickyNote", to: "circle" })
        );
        assert_eq!(shape.kind, ShapeKind::StickyNote { text: "x".into() });
    }

    #[test]
    fn patch_rejects_bad_geometry() {
        let mut shape = note("x");
        let patch = ShapePatch { width: Some(-1.0), ..ShapePatch::default() };
        assert!(patch.apply(&mut shape).is_err());
        let patch = ShapePatch { x: Some(f64::NAN), ..ShapePatch::default() };
        assert!(patch.apply(&mut shape).is_err());
    }

    #[test]
    fn restore_patch_round_trips_content() {
        let original = note("before");
        let mut edited = original.clone();
        ShapePatch {
            x: Some(1.0),
            kind: Some(ShapeKind::StickyNote { text: "after".into() }),
            ..ShapePatch::default()
        }
        .apply(&mut edited)
        .unwrap();

        ShapePatch::restore(&original).apply(&mut edited).unwrap();
        assert_eq!(edited.geometry, original.geometry);
        assert_eq!(edited.kind, original.kind);
    }

    #[test]
    fn empty_patch_is_empty() {
        assert!(ShapePatch::default().is_empty());
        assert!(!ShapePatch::position(0.0, 0.0).is_empty());
    }
}
