//! Relay wire protocol: the JSON envelope plus the typed syscall vocabulary.
//!
//! ARCHITECTURE
//! ============
//! A relay message is one `Frame`. The envelope is deliberately loose (a
//! `syscall` string and a flat JSON `data` map) so it stays stable on the
//! wire, while everything that reads it goes through typed views:
//!
//! | view            | reads                                     |
//! |-----------------|-------------------------------------------|
//! | `Syscall`       | `syscall`, e.g. `shape:lock`              |
//! | `field::<T>`    | one `data` key, deserialized into `T`     |
//! | `ErrorBody`     | `data` of an error reply                  |
//!
//! Replies point at their request through `parent_id`. Fan-out copies sent to
//! other clients on the canvas (`peer_copy`) carry none, which is how a client
//! tells its own replies from peer traffic.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Sent once by the relay right after the upgrade.
pub const SESSION_CONNECTED: &str = "session:connected";

/// Sent by the relay for text it could not decode as a frame.
pub const GATEWAY_ERROR: &str = "gateway:error";

/// Data key of the retryable flag on error replies.
pub const FRAME_RETRYABLE: &str = "retryable";

const FRAME_CODE: &str = "code";
const FRAME_MESSAGE: &str = "message";

/// Flat key-value payload.
pub type Data = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Request,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Sender's clock, ms since epoch. Informational only.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canvas_id: Option<Uuid>,
    pub from: Option<String>,
    pub syscall: String,
    pub status: Status,
    pub data: Data,
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}

// =============================================================================
// SYSCALLS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanvasOp {
    Join,
    Part,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeOp {
    List,
    Get,
    Create,
    Update,
    Delete,
    Lock,
    Unlock,
    Select,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EphemeralOp {
    Set,
    Delete,
    Snapshot,
}

/// Every syscall a client may send, grouped by the state it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Canvas(CanvasOp),
    Shape(ShapeOp),
    Ephemeral(EphemeralOp),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown syscall: {0}")]
pub struct UnknownSyscall(pub String);

impl Syscall {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canvas(CanvasOp::Join) => "canvas:join",
            Self::Canvas(CanvasOp::Part) => "canvas:part",
            Self::Shape(ShapeOp::List) => "shape:list",
            Self::Shape(ShapeOp::Get) => "shape:get",
            Self::Shape(ShapeOp::Create) => "shape:create",
            Self::Shape(ShapeOp::Update) => "shape:update",
            Self::Shape(ShapeOp::Delete) => "shape:delete",
            Self::Shape(ShapeOp::Lock) => "shape:lock",
            Self::Shape(ShapeOp::Unlock) => "shape:unlock",
            Self::Shape(ShapeOp::Select) => "shape:select",
            Self::Ephemeral(EphemeralOp::Set) => "ephemeral:set",
            Self::Ephemeral(EphemeralOp::Delete) => "ephemeral:delete",
            Self::Ephemeral(EphemeralOp::Snapshot) => "ephemeral:snapshot",
        }
    }

    /// High-frequency traffic that is logged at debug level only.
    #[must_use]
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral(_))
    }
}

impl FromStr for Syscall {
    type Err = UnknownSyscall;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let syscall = match s {
            "canvas:join" => Self::Canvas(CanvasOp::Join),
            "canvas:part" => Self::Canvas(CanvasOp::Part),
            "shape:list" => Self::Shape(ShapeOp::List),
            "shape:get" => Self::Shape(ShapeOp::Get),
            "shape:create" => Self::Shape(ShapeOp::Create),
            "shape:update" => Self::Shape(ShapeOp::Update),
            "shape:delete" => Self::Shape(ShapeOp::Delete),
            "shape:lock" => Self::Shape(ShapeOp::Lock),
            "shape:unlock" => Self::Shape(ShapeOp::Unlock),
            "shape:select" => Self::Shape(ShapeOp::Select),
            "ephemeral:set" => Self::Ephemeral(EphemeralOp::Set),
            "ephemeral:delete" => Self::Ephemeral(EphemeralOp::Delete),
            "ephemeral:snapshot" => Self::Ephemeral(EphemeralOp::Snapshot),
            other => return Err(UnknownSyscall(other.to_owned())),
        };
        Ok(syscall)
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Syscall> for String {
    fn from(syscall: Syscall) -> Self {
        syscall.as_str().to_owned()
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Grepable error code and retryable flag for structured error replies.
pub trait ErrorCode: fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Payload of an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorBody {
    pub fn from_error(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self { code: err.error_code().to_owned(), message: err.to_string(), retryable: err.retryable() }
    }

    fn into_data(self) -> Data {
        Data::from([
            (FRAME_CODE.to_owned(), Value::String(self.code)),
            (FRAME_MESSAGE.to_owned(), Value::String(self.message)),
            (FRAME_RETRYABLE.to_owned(), Value::Bool(self.retryable)),
        ])
    }
}

/// A `data` key that is absent or does not decode.
#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("{0} required")]
    Missing(String),
    #[error("invalid {key}: {source}")]
    Invalid {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl Frame {
    /// A fresh request with no parent.
    pub fn request(syscall: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            canvas_id: None,
            from: None,
            syscall: syscall.into(),
            status: Status::Request,
            data,
        }
    }

    #[must_use]
    pub fn done(&self) -> Self {
        self.reply(Status::Done, Data::new())
    }

    #[must_use]
    pub fn done_with(&self, data: Data) -> Self {
        self.reply(Status::Done, data)
    }

    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        self.reply(Status::Error, ErrorBody::from_error(err).into_data())
    }

    /// The fan-out copy of this frame for other clients on `canvas_id`:
    /// new id, no parent, attributed to `from`.
    #[must_use]
    pub fn peer_copy(&self, canvas_id: Uuid, from: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            canvas_id: Some(canvas_id),
            from: Some(from.into()),
            ..self.clone()
        }
    }

    /// Same syscall and canvas, pointing back at `self`.
    fn reply(&self, status: Status, data: Data) -> Self {
        Self {
            parent_id: Some(self.id),
            canvas_id: self.canvas_id,
            status,
            ..Self::request(self.syscall.clone(), data)
        }
    }

    #[must_use]
    pub fn with_canvas_id(mut self, canvas_id: Uuid) -> Self {
        self.canvas_id = Some(canvas_id);
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// TYPED VIEWS
// =============================================================================

impl Frame {
    /// Parse `syscall` into the relay vocabulary.
    ///
    /// # Errors
    ///
    /// `UnknownSyscall` for anything outside it, including the relay's own
    /// `session:*` and `gateway:*` notices.
    pub fn route(&self) -> Result<Syscall, UnknownSyscall> {
        self.syscall.parse()
    }

    /// Decode one `data` key.
    ///
    /// # Errors
    ///
    /// `Missing` when the key is absent or null, `Invalid` when it does not
    /// decode as `T`.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<T, FieldError> {
        match self.data.get(key) {
            None | Some(Value::Null) => Err(FieldError::Missing(key.to_owned())),
            Some(value) => T::deserialize(value).map_err(|source| FieldError::Invalid { key: key.to_owned(), source }),
        }
    }

    /// `field` for uuids, discarding the reason.
    #[must_use]
    pub fn uuid_field(&self, key: &str) -> Option<Uuid> {
        self.field(key).ok()
    }

    /// The error payload, when this is an error reply.
    #[must_use]
    pub fn error_body(&self) -> Option<ErrorBody> {
        if self.status != Status::Error {
            return None;
        }
        Some(ErrorBody {
            code: self.field(FRAME_CODE).unwrap_or_else(|_| "E_UNKNOWN".to_owned()),
            message: self.field(FRAME_MESSAGE).unwrap_or_default(),
            retryable: self.field(FRAME_RETRYABLE).unwrap_or(false),
        })
    }

    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.data.get(FRAME_CODE).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("relay store offline")]
    struct Offline;

    impl ErrorCode for Offline {
        fn error_code(&self) -> &'static str {
            "E_STORE_UNAVAILABLE"
        }

        fn retryable(&self) -> bool {
            true
        }
    }

    #[test]
    fn every_syscall_parses_back_from_its_name() {
        let all = [
            Syscall::Canvas(CanvasOp::Join),
            Syscall::Canvas(CanvasOp::Part),
            Syscall::Shape(ShapeOp::List),
            Syscall::Shape(ShapeOp::Get),
            Syscall::Shape(ShapeOp::Create),
            Syscall::Shape(ShapeOp::Update),
            Syscall::Shape(ShapeOp::Delete),
            Syscall::Shape(ShapeOp::Lock),
            Syscall::Shape(ShapeOp::Unlock),
            Syscall::Shape(ShapeOp::Select),
            Syscall::Ephemeral(EphemeralOp::Set),
            Syscall::Ephemeral(EphemeralOp::Delete),
            Syscall::Ephemeral(EphemeralOp::Snapshot),
        ];
        for syscall in all {
            assert_eq!(syscall.as_str().parse::<Syscall>(), Ok(syscall));
        }
    }

    #[test]
    fn relay_notices_are_not_routable() {
        for name in [SESSION_CONNECTED, GATEWAY_ERROR, "shape", "shape:", "canvas:nope"] {
            let frame = Frame::request(name, Data::new());
            assert_eq!(frame.route(), Err(UnknownSyscall(name.to_owned())));
        }
    }

    #[test]
    fn reply_points_at_request_and_keeps_canvas() {
        let canvas_id = Uuid::new_v4();
        let req = Frame::request(Syscall::Shape(ShapeOp::Lock), Data::new())
            .with_canvas_id(canvas_id)
            .with_from("someone");
        let done = req.done_with(Data::from([("granted".to_owned(), json!(true))]));

        assert_eq!(done.parent_id, Some(req.id));
        assert_ne!(done.id, req.id);
        assert_eq!(done.canvas_id, Some(canvas_id));
        assert_eq!(done.syscall, "shape:lock");
        assert_eq!(done.status, Status::Done);
        assert!(done.from.is_none());
        assert_eq!(done.data["granted"], json!(true));
    }

    #[test]
    fn peer_copy_drops_parent() {
        let canvas_id = Uuid::new_v4();
        let req = Frame::request("shape:create", Data::new());
        let done = req.done_with(Data::from([("shape".to_owned(), json!({"id": 1}))]));
        let peer = done.peer_copy(canvas_id, "alice");

        assert!(peer.parent_id.is_none());
        assert_ne!(peer.id, done.id);
        assert_eq!(peer.canvas_id, Some(canvas_id));
        assert_eq!(peer.from.as_deref(), Some("alice"));
        assert_eq!(peer.status, Status::Done);
        assert_eq!(peer.data, done.data);
    }

    #[test]
    fn field_distinguishes_missing_from_invalid() {
        let id = Uuid::new_v4();
        let frame = Frame::request("shape:get", Data::new())
            .with_data("id", id.to_string())
            .with_data("bad", 42)
            .with_data("none", Value::Null);

        assert_eq!(frame.field::<Uuid>("id").unwrap(), id);
        assert_eq!(frame.uuid_field("id"), Some(id));
        assert!(matches!(frame.field::<Uuid>("bad"), Err(FieldError::Invalid { .. })));
        assert!(matches!(frame.field::<Uuid>("none"), Err(FieldError::Missing(_))));
        assert_eq!(frame.field::<Uuid>("gone").unwrap_err().to_string(), "gone required");
    }

    #[test]
    fn error_reply_carries_typed_body() {
        let req = Frame::request("shape:update", Data::new());
        let err = req.error_from(&Offline);

        assert_eq!(err.status, Status::Error);
        assert_eq!(err.error_code(), Some("E_STORE_UNAVAILABLE"));
        assert_eq!(
            err.error_body(),
            Some(ErrorBody {
                code: "E_STORE_UNAVAILABLE".into(),
                message: "relay store offline".into(),
                retryable: true,
            })
        );
        assert_eq!(req.done().error_body(), None);
    }

    #[test]
    fn wire_format_is_stable() {
        let canvas_id = Uuid::new_v4();
        let frame = Frame::request(Syscall::Canvas(CanvasOp::Join), Data::new()).with_canvas_id(canvas_id);
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["syscall"], json!("canvas:join"));
        assert_eq!(json["status"], json!("request"));
        assert_eq!(json["canvas_id"], json!(canvas_id));
        assert!(json["parent_id"].is_null());

        let without_canvas = serde_json::to_value(Frame::request("shape:list", Data::new())).unwrap();
        assert!(without_canvas.get("canvas_id").is_none());
    }
}
