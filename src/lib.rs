//! Real-time shared-state coordination for collaborative canvases.
//!
//! The client engine (`engine`) coordinates locks, drags, presence, and undo
//! over two backend traits: the durable `store::ShapeStore` and the
//! low-latency `ephemeral::EphemeralStore`. Both have in-memory backends and
//! a relay-backed one (`net::RemoteCanvas`). The relay itself is an axum
//! WebSocket server (`routes`, `services`) with optional Postgres persistence.

pub mod config;
pub mod db;
pub mod engine;
pub mod ephemeral;
pub mod frame;
pub mod net;
pub mod routes;
pub mod services;
pub mod shape;
pub mod state;
pub mod store;
