//! Relay client transport.
//!
//! `RemoteCanvas` lets a `CanvasSession` run against a relay instead of
//! in-process backends: it implements both store traits over one socket.

pub mod remote;

pub use remote::{RemoteCanvas, RemoteError};
