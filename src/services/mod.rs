//! Relay services used by the websocket route.
//!
//! ARCHITECTURE
//! ============
//! Service modules own canvas lifecycle, shape rules, and persistence so the
//! route handler can stay focused on frame translation.

pub mod canvas;
pub mod persistence;
pub mod shapes;
