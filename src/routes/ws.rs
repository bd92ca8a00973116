//! WebSocket handler: bidirectional frame relay.
//!
//! DESIGN
//! ======
//! On upgrade, generates a client ID and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Broadcast frames from canvas peers → forward to client
//!
//! Handler functions are pure business logic: they validate, call the
//! services, and return an `Outcome`. The dispatch layer owns all outbound
//! concerns: reply to sender and broadcast to peers.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade (`?user_id=`) → send `session:connected` with `client_id`
//! 2. Client sends `canvas:join`, then `shape:*` / `ephemeral:*` frames
//! 3. Dispatch applies Outcome (reply / broadcast / both)
//! 4. Close → broadcast `canvas:part` → disconnect cleanup

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{CanvasOp, Data, EphemeralOp, FieldError, Frame, GATEWAY_ERROR, SESSION_CONNECTED, ShapeOp, Syscall};
use crate::services;
use crate::services::canvas::RelayError;
use crate::shape::{Shape, ShapePatch, UserId};
use crate::state::AppState;
use crate::store::LockGrant;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what; handlers never send frames directly.
#[derive(Debug)]
enum Outcome {
    /// Done+data to the sender; a copy without `parent_id` to every peer.
    Broadcast(Data),
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
    /// Reply to sender with one payload, broadcast a request to peers.
    ReplyAndBroadcast { reply: Data, broadcast: Data },
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(raw) = params.get("user_id") else {
        return (StatusCode::UNAUTHORIZED, "user_id required").into_response();
    };
    let Ok(user_id) = raw.parse::<UserId>() else {
        return (StatusCode::BAD_REQUEST, "user_id must be a uuid").into_response();
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, user_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user_id: UserId) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for receiving broadcast frames from peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_channel_capacity);

    let welcome = Frame::request(SESSION_CONNECTED, Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("user_id", user_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, %user_id, "ws: client connected");

    let mut current_canvas: Option<Uuid> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut current_canvas, client_id, user_id, &client_tx, &text).await;
                        for frame in replies {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(canvas_id) = current_canvas {
        leave(&state, canvas_id, client_id, user_id).await;
    }
    info!(%client_id, "ws: client disconnected");
}

/// Tell peers, then run the connection's cleanup.
async fn leave(state: &AppState, canvas_id: Uuid, client_id: Uuid, user_id: UserId) {
    let part = Frame::request(Syscall::Canvas(CanvasOp::Part), Data::new())
        .with_canvas_id(canvas_id)
        .with_data("client_id", client_id.to_string())
        .with_data("user_id", user_id.to_string());
    services::canvas::broadcast(state, canvas_id, &part, Some(client_id)).await;
    services::canvas::part_canvas(state, canvas_id, client_id).await;
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Transport concerns stay in `run_ws`, so tests can drive dispatch and peer
/// broadcast end-to-end without a socket.
async fn process_inbound_text(
    state: &AppState,
    current_canvas: &mut Option<Uuid>,
    client_id: Uuid,
    user_id: UserId,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request(GATEWAY_ERROR, Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the connection's user as `from`.
    req.from = Some(user_id.to_string());

    let syscall = match req.route() {
        Ok(syscall) => syscall,
        Err(e) => {
            warn!(%client_id, syscall = %req.syscall, "ws: unknown syscall");
            return vec![req.error_from(&RelayError::BadRequest(e.to_string()))];
        }
    };
    if syscall.is_ephemeral() {
        debug!(%client_id, %syscall, "ws: recv frame");
    } else {
        info!(%client_id, id = %req.id, %syscall, "ws: recv frame");
    }

    let result = match syscall {
        Syscall::Canvas(op) => handle_canvas(state, current_canvas, client_id, user_id, client_tx, op, &req).await,
        Syscall::Shape(op) => handle_shape(state, *current_canvas, user_id, op, &req).await,
        Syscall::Ephemeral(op) => handle_ephemeral(state, *current_canvas, client_id, op, &req).await,
    };

    // Apply outcome; the dispatch layer owns all outbound logic.
    let canvas_id = *current_canvas;
    match result {
        Ok(Outcome::Broadcast(data)) => {
            let sender_frame = req.done_with(data);
            if let Some(cid) = canvas_id {
                let peer_frame = sender_frame.peer_copy(cid, user_id.to_string());
                services::canvas::broadcast(state, cid, &peer_frame, Some(client_id)).await;
            }
            vec![sender_frame]
        }
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::ReplyAndBroadcast { reply, broadcast }) => {
            if let Some(cid) = canvas_id {
                let notif = Frame::request(syscall, broadcast)
                    .with_canvas_id(cid)
                    .with_from(user_id.to_string());
                services::canvas::broadcast(state, cid, &notif, Some(client_id)).await;
            }
            vec![req.done_with(reply)]
        }
        Err(e) => vec![req.error_from(&e)],
    }
}

// =============================================================================
// CANVAS HANDLERS
// =============================================================================

async fn handle_canvas(
    state: &AppState,
    current_canvas: &mut Option<Uuid>,
    client_id: Uuid,
    user_id: UserId,
    client_tx: &mpsc::Sender<Frame>,
    op: CanvasOp,
    req: &Frame,
) -> Result<Outcome, RelayError> {
    match op {
        CanvasOp::Join => {
            let canvas_id = req
                .canvas_id
                .or_else(|| req.uuid_field("canvas_id"))
                .ok_or_else(|| RelayError::BadRequest("canvas_id required".into()))?;

            let shapes = if *current_canvas == Some(canvas_id) {
                services::shapes::list_shapes(state, canvas_id).await?
            } else {
                if let Some(old) = current_canvas.take() {
                    leave(state, old, client_id, user_id).await;
                }
                let shapes = services::canvas::join_canvas(state, canvas_id, client_id, user_id, client_tx.clone()).await?;
                *current_canvas = Some(canvas_id);
                shapes
            };

            let mut reply = Data::new();
            reply.insert("canvas_id".into(), json!(canvas_id));
            reply.insert("client_id".into(), json!(client_id));
            reply.insert("shapes".into(), json!(shapes));

            let mut broadcast = Data::new();
            broadcast.insert("client_id".into(), json!(client_id));
            broadcast.insert("user_id".into(), json!(user_id));

            Ok(Outcome::ReplyAndBroadcast { reply, broadcast })
        }
        CanvasOp::Part => {
            if let Some(old) = current_canvas.take() {
                leave(state, old, client_id, user_id).await;
            }
            Ok(Outcome::Done)
        }
    }
}

// =============================================================================
// SHAPE HANDLERS
// =============================================================================

async fn handle_shape(
    state: &AppState,
    current_canvas: Option<Uuid>,
    user_id: UserId,
    op: ShapeOp,
    req: &Frame,
) -> Result<Outcome, RelayError> {
    let canvas_id = current_canvas.ok_or(RelayError::NotJoined)?;

    match op {
        ShapeOp::List => {
            let shapes = services::shapes::list_shapes(state, canvas_id).await?;
            Ok(Outcome::Reply(data([("shapes", json!(shapes))])))
        }
        ShapeOp::Get => {
            let id = required_uuid(req, "id")?;
            let shape = services::shapes::get_shape(state, canvas_id, id).await?;
            Ok(Outcome::Reply(data([("shape", json!(shape))])))
        }
        ShapeOp::Create => {
            let shape: Shape = required_json(req, "shape")?;
            let created = services::shapes::create_shape(state, canvas_id, user_id, shape).await?;
            Ok(Outcome::Broadcast(data([("shape", json!(created))])))
        }
        ShapeOp::Update => {
            let id = required_uuid(req, "id")?;
            let patch: ShapePatch = required_json(req, "patch")?;
            let updated = services::shapes::update_shape(state, canvas_id, user_id, id, &patch).await?;
            Ok(Outcome::Broadcast(data([("shape", json!(updated))])))
        }
        ShapeOp::Delete => {
            let id = required_uuid(req, "id")?;
            let deleted = services::shapes::delete_shape(state, canvas_id, user_id, id).await?;
            let payload = data([("id", json!(id)), ("deleted", json!(deleted))]);
            // EDGE: deleting a missing shape is a no-op; peers have nothing to learn.
            Ok(if deleted { Outcome::Broadcast(payload) } else { Outcome::Reply(payload) })
        }
        ShapeOp::Lock => {
            let id = required_uuid(req, "id")?;
            match services::shapes::lock_shape(state, canvas_id, user_id, id).await? {
                LockGrant::Granted(shape) => Ok(Outcome::Broadcast(data([("granted", json!(true)), ("shape", json!(shape))]))),
                LockGrant::Held { holder } => Ok(Outcome::Reply(data([("granted", json!(false)), ("holder", json!(holder))]))),
            }
        }
        ShapeOp::Unlock => {
            let id = required_uuid(req, "id")?;
            match services::shapes::unlock_shape(state, canvas_id, user_id, id).await? {
                Some(shape) => Ok(Outcome::Broadcast(data([("released", json!(true)), ("shape", json!(shape))]))),
                None => Ok(Outcome::Reply(data([("released", json!(false))]))),
            }
        }
        ShapeOp::Select => {
            let id = required_uuid(req, "id")?;
            let selected = optional_json(req, "selected")?.unwrap_or(true);
            let shape = services::shapes::select_shape(state, canvas_id, user_id, id, selected).await?;
            Ok(Outcome::Broadcast(data([("shape", json!(shape))])))
        }
    }
}

// =============================================================================
// EPHEMERAL HANDLERS
// =============================================================================

async fn handle_ephemeral(
    state: &AppState,
    current_canvas: Option<Uuid>,
    client_id: Uuid,
    op: EphemeralOp,
    req: &Frame,
) -> Result<Outcome, RelayError> {
    let canvas_id = current_canvas.ok_or(RelayError::NotJoined)?;
    let (_, hub) = state
        .backends(canvas_id)
        .await
        .ok_or(RelayError::NotJoined)?;
    let namespace = required_str(req, "namespace")?;

    match op {
        EphemeralOp::Set => {
            let key = required_str(req, "key")?;
            let value: serde_json::Value = required_json(req, "value")?;
            let remove_on_disconnect = optional_json(req, "remove_on_disconnect")?.unwrap_or(false);
            hub.set_as(client_id, namespace, key, value.clone(), remove_on_disconnect);
            Ok(Outcome::ReplyAndBroadcast {
                reply: Data::new(),
                broadcast: data([("namespace", json!(namespace)), ("key", json!(key)), ("value", value)]),
            })
        }
        EphemeralOp::Delete => {
            let key = required_str(req, "key")?;
            if hub.delete_as(client_id, namespace, key) {
                Ok(Outcome::ReplyAndBroadcast {
                    reply: data([("existed", json!(true))]),
                    broadcast: data([("namespace", json!(namespace)), ("key", json!(key))]),
                })
            } else {
                Ok(Outcome::Reply(data([("existed", json!(false))])))
            }
        }
        EphemeralOp::Snapshot => Ok(Outcome::Reply(data([("entries", json!(hub.snapshot(namespace)))]))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn data<const N: usize>(entries: [(&str, serde_json::Value); N]) -> Data {
    entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
}

fn required_uuid(req: &Frame, key: &str) -> Result<Uuid, RelayError> {
    required_json(req, key)
}

fn required_str<'a>(req: &'a Frame, key: &str) -> Result<&'a str, RelayError> {
    req.data
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| RelayError::BadRequest(format!("{key} required")))
}

fn required_json<T: serde::de::DeserializeOwned>(req: &Frame, key: &str) -> Result<T, RelayError> {
    req.field(key).map_err(|e| RelayError::BadRequest(e.to_string()))
}

fn optional_json<T: serde::de::DeserializeOwned>(req: &Frame, key: &str) -> Result<Option<T>, RelayError> {
    match req.field(key) {
        Ok(value) => Ok(Some(value)),
        Err(FieldError::Missing(_)) => Ok(None),
        Err(e) => Err(RelayError::BadRequest(e.to_string())),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if let Some(body) = frame.error_body() {
        warn!(id = %frame.id, syscall = %frame.syscall, code = %body.code, message = %body.message, "ws: send frame status=Error");
    } else if !frame.route().is_ok_and(Syscall::is_ephemeral) {
        debug!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
