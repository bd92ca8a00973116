//! Remote canvas: `ShapeStore` + `EphemeralStore` over the relay socket.
//!
//! DESIGN
//! ======
//! One WebSocket per `RemoteCanvas`. A writer task drains an outbound queue
//! into the socket; a reader task routes inbound frames:
//!
//! - frames with a `parent_id` resolve the matching pending request
//! - frames without one are peer fan-out and become `ShapeEvent` /
//!   `EphemeralEvent` on the local broadcast channels
//!
//! The relay never echoes a mutation back to its sender, so successful local
//! writes publish their own events. Subscribers see the same stream a
//! `MemoryShapeStore` would give them.
//!
//! ERROR HANDLING
//! ==============
//! Transport failures, timeouts, and retryable relay errors surface as
//! `Unavailable`, which is what flips a session offline. Relay error codes
//! that have a local variant map onto it; the rest become `Rejected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::engine::Subscription;
use crate::ephemeral::{EphemeralError, EphemeralEvent, EphemeralStore};
use crate::frame::{CanvasOp, Data, EphemeralOp, FieldError, Frame, ShapeOp, Status, Syscall};
use crate::shape::{Shape, ShapeId, ShapePatch, UserId};
use crate::store::{LockGrant, ShapeEvent, ShapeStore, StoreError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("websocket error: {0}")]
    Transport(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("relay connection closed")]
    Closed,
    #[error("timed out waiting for relay reply")]
    Timeout,
    #[error("frame encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("relay error {code}: {message}")]
    Relay { code: String, message: String, retryable: bool },
    #[error("malformed relay reply: {0}")]
    Protocol(String),
}

impl RemoteError {
    fn from_reply(reply: &Frame) -> Self {
        match reply.error_body() {
            Some(body) => Self::Relay { code: body.code, message: body.message, retryable: body.retryable },
            None => Self::Protocol(format!("{} reply is not an error", reply.syscall)),
        }
    }

    /// Translate into the store's error vocabulary. `shape_id` is the shape
    /// the request was about, if any.
    fn into_store(self, shape_id: Option<ShapeId>) -> StoreError {
        match self {
            Self::Relay { code, message, retryable } => match (code.as_str(), shape_id) {
                (_, _) if retryable => StoreError::Unavailable(message),
                ("E_SHAPE_NOT_FOUND", Some(id)) => StoreError::NotFound(id),
                ("E_NOT_LOCK_HOLDER", Some(id)) => StoreError::NotLockHolder { shape_id: id, holder: None },
                _ => StoreError::Rejected { code, message },
            },
            Self::Protocol(message) => StoreError::Rejected { code: "E_PROTOCOL".into(), message },
            other => StoreError::Unavailable(other.to_string()),
        }
    }

    fn into_ephemeral(self) -> EphemeralError {
        match self {
            Self::Encode(e) => EphemeralError::Malformed(e),
            other => EphemeralError::Unavailable(other.to_string()),
        }
    }
}

// =============================================================================
// CLIENT
// =============================================================================

struct Inner {
    canvas_id: Uuid,
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Frame>>>,
    shape_events: broadcast::Sender<ShapeEvent>,
    ephemeral_events: broadcast::Sender<EphemeralEvent>,
    closed: AtomicBool,
    request_timeout: Duration,
}

/// Client side of one relay connection, joined to one canvas.
pub struct RemoteCanvas {
    inner: Arc<Inner>,
    client_id: Uuid,
    user_id: UserId,
    tasks: Mutex<Vec<Subscription>>,
}

impl RemoteCanvas {
    /// Connect to the relay at `ws_url` (e.g. `ws://host/api/ws`) as
    /// `user_id` and join `canvas_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake, welcome, or join fails.
    pub async fn connect(ws_url: &str, canvas_id: Uuid, user_id: UserId, config: &SyncConfig) -> Result<Self, RemoteError> {
        let separator = if ws_url.contains('?') { '&' } else { '?' };
        let url = format!("{ws_url}{separator}user_id={user_id}");
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| RemoteError::Transport(Box::new(e)))?;
        let (write, mut read) = stream.split();

        // PHASE: WAIT FOR WELCOME
        // WHY: the relay assigns our client id before anything else.
        let welcome = tokio::time::timeout(config.request_timeout, next_frame(&mut read))
            .await
            .map_err(|_| RemoteError::Timeout)??;
        let client_id = welcome
            .uuid_field("client_id")
            .ok_or_else(|| RemoteError::Protocol("welcome without client_id".into()))?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            canvas_id,
            outbound,
            pending: Mutex::new(HashMap::new()),
            shape_events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            ephemeral_events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            closed: AtomicBool::new(false),
            request_timeout: config.request_timeout,
        });

        let tasks = vec![
            Subscription::spawn(write_loop(write, outbound_rx)),
            Subscription::spawn(read_loop(Arc::clone(&inner), read)),
        ];
        let remote = Self { inner, client_id, user_id, tasks: Mutex::new(tasks) };

        remote
            .inner
            .request(Syscall::Canvas(CanvasOp::Join), Data::new().with("canvas_id", json!(canvas_id)))
            .await?;
        info!(%canvas_id, %client_id, %user_id, "remote: joined canvas");
        Ok(remote)
    }

    #[must_use]
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn canvas_id(&self) -> Uuid {
        self.inner.canvas_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Drop the socket. The relay runs this connection's disconnect cleanup.
    /// In-flight requests fail with `Closed`. Idempotent.
    pub fn close(&self) {
        self.inner.shut_down();
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    async fn shape_request(&self, op: ShapeOp, data: Data, shape_id: Option<ShapeId>) -> Result<Frame, StoreError> {
        self.inner
            .request(Syscall::Shape(op), data)
            .await
            .map_err(|e| e.into_store(shape_id))
    }

    fn publish_shape(&self, event: ShapeEvent) {
        let _ = self.inner.shape_events.send(event);
    }
}

impl Drop for RemoteCanvas {
    fn drop(&mut self) {
        self.inner.shut_down();
    }
}

impl Inner {
    async fn request(&self, syscall: Syscall, data: Data) -> Result<Frame, RemoteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemoteError::Closed);
        }
        let frame = Frame::request(syscall, data).with_canvas_id(self.canvas_id);
        let text = serde_json::to_string(&frame)?;

        let (tx, rx) = oneshot::channel();
        self.pending().insert(frame.id, tx);
        if self.outbound.send(text).is_err() {
            self.pending().remove(&frame.id);
            return Err(RemoteError::Closed);
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(RemoteError::Closed),
            Err(_) => {
                self.pending().remove(&frame.id);
                warn!(%syscall, id = %frame.id, "remote: request timed out");
                return Err(RemoteError::Timeout);
            }
        };

        if reply.status == Status::Error {
            return Err(RemoteError::from_reply(&reply));
        }
        Ok(reply)
    }

    /// Route one inbound frame.
    fn dispatch(&self, frame: Frame) {
        if let Some(parent_id) = frame.parent_id {
            if let Some(tx) = self.pending().remove(&parent_id) {
                let _ = tx.send(frame);
            } else {
                debug!(%parent_id, syscall = %frame.syscall, "remote: reply for unknown request");
            }
            return;
        }

        match peer_event(&frame) {
            Some(PeerEvent::Shape(event)) => {
                let _ = self.shape_events.send(event);
            }
            Some(PeerEvent::Ephemeral(event)) => {
                let _ = self.ephemeral_events.send(event);
            }
            None => debug!(syscall = %frame.syscall, "remote: ignoring peer frame"),
        }
    }

    fn shut_down(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the senders fails every waiter with `Closed`.
        self.pending().clear();
        info!(canvas_id = %self.canvas_id, "remote: connection closed");
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Frame>>> {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// =============================================================================
// SOCKET TASKS
// =============================================================================

async fn next_frame(read: &mut SplitStream<WsStream>) -> Result<Frame, RemoteError> {
    loop {
        let Some(msg) = read.next().await else {
            return Err(RemoteError::Closed);
        };
        match msg.map_err(|e| RemoteError::Transport(Box::new(e)))? {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).map_err(|e| RemoteError::Protocol(e.to_string()));
            }
            Message::Close(_) => return Err(RemoteError::Closed),
            _ => {}
        }
    }
}

async fn write_loop(mut write: SplitSink<WsStream, Message>, mut outbound: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = outbound.recv().await {
        if let Err(e) = write.send(Message::Text(text.into())).await {
            warn!(error = %e, "remote: socket write failed");
            break;
        }
    }
    let _ = write.close().await;
}

async fn read_loop(inner: Arc<Inner>, mut read: SplitStream<WsStream>) {
    loop {
        match next_frame(&mut read).await {
            Ok(frame) => inner.dispatch(frame),
            Err(RemoteError::Protocol(e)) => warn!(error = %e, "remote: undecodable frame"),
            Err(e) => {
                debug!(error = %e, "remote: read loop ended");
                break;
            }
        }
    }
    inner.shut_down();
}

// =============================================================================
// PEER FRAMES
// =============================================================================

#[derive(Debug, PartialEq)]
enum PeerEvent {
    Shape(ShapeEvent),
    Ephemeral(EphemeralEvent),
}

/// Translate relay fan-out into a store event.
fn peer_event(frame: &Frame) -> Option<PeerEvent> {
    match frame.route().ok()? {
        Syscall::Shape(ShapeOp::Create | ShapeOp::Update | ShapeOp::Lock | ShapeOp::Unlock | ShapeOp::Select) => {
            Some(PeerEvent::Shape(ShapeEvent::Upserted(frame.field("shape").ok()?)))
        }
        Syscall::Shape(ShapeOp::Delete) => Some(PeerEvent::Shape(ShapeEvent::Deleted(frame.field("id").ok()?))),
        Syscall::Ephemeral(EphemeralOp::Set) => Some(PeerEvent::Ephemeral(EphemeralEvent::Set {
            namespace: frame.field("namespace").ok()?,
            key: frame.field("key").ok()?,
            value: frame.data.get("value")?.clone(),
        })),
        Syscall::Ephemeral(EphemeralOp::Delete) => Some(PeerEvent::Ephemeral(EphemeralEvent::Removed {
            namespace: frame.field("namespace").ok()?,
            key: frame.field("key").ok()?,
        })),
        _ => None,
    }
}

fn reply_shape(reply: &Frame) -> Result<Shape, StoreError> {
    reply
        .field("shape")
        .map_err(|e| RemoteError::Protocol(format!("{} reply: {e}", reply.syscall)).into_store(None))
}

fn reply_bool(reply: &Frame, key: &str) -> bool {
    reply.field(key).unwrap_or(false)
}

trait DataExt {
    fn with(self, key: &str, value: Value) -> Self;
}

impl DataExt for Data {
    fn with(mut self, key: &str, value: Value) -> Self {
        self.insert(key.to_owned(), value);
        self
    }
}

// =============================================================================
// SHAPE STORE
// =============================================================================

#[async_trait]
impl ShapeStore for RemoteCanvas {
    async fn list(&self) -> Result<Vec<Shape>, StoreError> {
        let reply = self.shape_request(ShapeOp::List, Data::new(), None).await?;
        match reply.field("shapes") {
            Ok(shapes) => Ok(shapes),
            Err(FieldError::Missing(_)) => Ok(Vec::new()),
            Err(e) => Err(RemoteError::Protocol(e.to_string()).into_store(None)),
        }
    }

    async fn get(&self, id: ShapeId) -> Result<Option<Shape>, StoreError> {
        let reply = self
            .shape_request(ShapeOp::Get, Data::new().with("id", json!(id)), Some(id))
            .await?;
        match reply.field("shape") {
            Ok(shape) => Ok(Some(shape)),
            Err(FieldError::Missing(_)) => Ok(None),
            Err(e) => Err(RemoteError::Protocol(e.to_string()).into_store(Some(id))),
        }
    }

    async fn create(&self, shape: Shape) -> Result<Shape, StoreError> {
        let id = shape.id;
        let reply = self
            .shape_request(ShapeOp::Create, Data::new().with("shape", json!(shape)), Some(id))
            .await?;
        let created = reply_shape(&reply)?;
        self.publish_shape(ShapeEvent::Upserted(created.clone()));
        Ok(created)
    }

    async fn update(&self, id: ShapeId, patch: &ShapePatch, _by: UserId) -> Result<Shape, StoreError> {
        // The relay stamps the connection's user as the modifier.
        let data = Data::new().with("id", json!(id)).with("patch", json!(patch));
        let reply = self.shape_request(ShapeOp::Update, data, Some(id)).await?;
        let updated = reply_shape(&reply)?;
        self.publish_shape(ShapeEvent::Upserted(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, id: ShapeId) -> Result<bool, StoreError> {
        let reply = self
            .shape_request(ShapeOp::Delete, Data::new().with("id", json!(id)), Some(id))
            .await?;
        let deleted = reply_bool(&reply, "deleted");
        if deleted {
            self.publish_shape(ShapeEvent::Deleted(id));
        }
        Ok(deleted)
    }

    async fn acquire_lock(&self, id: ShapeId, _user_id: UserId) -> Result<LockGrant, StoreError> {
        let reply = self
            .shape_request(ShapeOp::Lock, Data::new().with("id", json!(id)), Some(id))
            .await?;
        if reply_bool(&reply, "granted") {
            let shape = reply_shape(&reply)?;
            self.publish_shape(ShapeEvent::Upserted(shape.clone()));
            return Ok(LockGrant::Granted(shape));
        }
        let holder = reply
            .uuid_field("holder")
            .ok_or_else(|| RemoteError::Protocol("refused lock without holder".into()).into_store(Some(id)))?;
        Ok(LockGrant::Held { holder })
    }

    async fn release_lock(&self, id: ShapeId, _holder: UserId) -> Result<Option<Shape>, StoreError> {
        let reply = self
            .shape_request(ShapeOp::Unlock, Data::new().with("id", json!(id)), Some(id))
            .await?;
        if !reply_bool(&reply, "released") {
            return Ok(None);
        }
        let shape = reply_shape(&reply)?;
        self.publish_shape(ShapeEvent::Upserted(shape.clone()));
        Ok(Some(shape))
    }

    async fn set_selection(&self, id: ShapeId, _user_id: UserId, selected: bool) -> Result<Shape, StoreError> {
        let data = Data::new().with("id", json!(id)).with("selected", json!(selected));
        let reply = self.shape_request(ShapeOp::Select, data, Some(id)).await?;
        let shape = reply_shape(&reply)?;
        self.publish_shape(ShapeEvent::Upserted(shape.clone()));
        Ok(shape)
    }

    fn subscribe(&self) -> broadcast::Receiver<ShapeEvent> {
        self.inner.shape_events.subscribe()
    }
}

// =============================================================================
// EPHEMERAL STORE
// =============================================================================

impl RemoteCanvas {
    async fn ephemeral_set(&self, namespace: &str, key: &str, value: Value, remove_on_disconnect: bool) -> Result<(), EphemeralError> {
        let data = Data::new()
            .with("namespace", json!(namespace))
            .with("key", json!(key))
            .with("value", value.clone())
            .with("remove_on_disconnect", json!(remove_on_disconnect));
        self.inner
            .request(Syscall::Ephemeral(EphemeralOp::Set), data)
            .await
            .map_err(RemoteError::into_ephemeral)?;
        let _ = self.inner.ephemeral_events.send(EphemeralEvent::Set {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
            value,
        });
        Ok(())
    }
}

#[async_trait]
impl EphemeralStore for RemoteCanvas {
    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), EphemeralError> {
        self.ephemeral_set(namespace, key, value, false).await
    }

    async fn set_with_disconnect_removal(&self, namespace: &str, key: &str, value: Value) -> Result<(), EphemeralError> {
        self.ephemeral_set(namespace, key, value, true).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), EphemeralError> {
        let data = Data::new()
            .with("namespace", json!(namespace))
            .with("key", json!(key));
        let reply = self
            .inner
            .request(Syscall::Ephemeral(EphemeralOp::Delete), data)
            .await
            .map_err(RemoteError::into_ephemeral)?;
        if reply_bool(&reply, "existed") {
            let _ = self.inner.ephemeral_events.send(EphemeralEvent::Removed {
                namespace: namespace.to_owned(),
                key: key.to_owned(),
            });
        }
        Ok(())
    }

    async fn snapshot(&self, namespace: &str) -> Result<HashMap<String, Value>, EphemeralError> {
        let reply = self
            .inner
            .request(Syscall::Ephemeral(EphemeralOp::Snapshot), Data::new().with("namespace", json!(namespace)))
            .await
            .map_err(RemoteError::into_ephemeral)?;
        match reply.field("entries") {
            Ok(entries) => Ok(entries),
            Err(FieldError::Missing(_)) => Ok(HashMap::new()),
            Err(FieldError::Invalid { source, .. }) => Err(EphemeralError::Malformed(source)),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EphemeralEvent> {
        self.inner.ephemeral_events.subscribe()
    }
}

#[cfg(test)]
#[path = "remote_test.rs"]
mod tests;
