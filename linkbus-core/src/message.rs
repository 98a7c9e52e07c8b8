//! Wire vocabulary: reserved names, the inbound payload wrapper, and
//! outbound command message construction.
//!
//! The bus never interprets payload semantics. [`Payload`] is an opaque
//! JSON value plus accessors for the few fields the protocol itself
//! defines: the `type` kind discriminator and the error-reply shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BusError;

// ── Reserved names ───────────────────────────────────────────────

/// Reserved inbound topic carrying command replies.
pub const COMMAND_TOPIC: &str = "command";

/// Separates the topic from the payload on inbound frames. A control
/// character, so it can never occur inside a topic name.
pub const TOPIC_DELIMITER: char = '\0';

/// `type` field of outbound command messages.
pub const TYPE_COMMAND: &str = "command";

/// `type` field of successful command replies.
pub const TYPE_COMMAND_REPLY: &str = "cmd_reply";

/// `type` field of failed command replies (carries `code` and `message`).
pub const TYPE_COMMAND_ERROR: &str = "cmd_error";

// ── Payload ──────────────────────────────────────────────────────

/// A decoded inbound payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Value);

impl Payload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The `type` discriminator, or `""` when absent. Subscription
    /// filtering matches against this value.
    pub fn kind(&self) -> &str {
        self.0.get("type").and_then(Value::as_str).unwrap_or("")
    }

    /// Look up a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// A top-level boolean field, treating absent or non-boolean as `false`.
    pub fn bool_field(&self, field: &str) -> bool {
        self.get(field).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    // ── Error replies ────────────────────────────────────────────

    /// Whether this payload is a failed command reply.
    pub fn is_command_error(&self) -> bool {
        self.kind() == TYPE_COMMAND_ERROR
    }

    /// HTTP-style error code of a failed reply.
    pub fn error_code(&self) -> Option<i64> {
        self.get("code").and_then(Value::as_i64)
    }

    /// Human-readable message of a failed reply.
    pub fn error_message(&self) -> Option<&str> {
        self.get("message").and_then(Value::as_str)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

// ── Command construction ─────────────────────────────────────────

/// Build the outbound message object for a command.
///
/// Payload fields are flattened into the top level next to `type` and
/// `command`, so `motor_move {x: 10}` goes out as
/// `{"type":"command","command":"motor_move","x":10}`. `null` stands for
/// an empty payload; anything else non-object is rejected.
pub fn command_object(name: &str, payload: Value) -> Result<Map<String, Value>, BusError> {
    let fields = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => return Err(BusError::NotAnObject(json_type_name(&other))),
    };

    let mut message = Map::new();
    message.insert("type".into(), Value::String(TYPE_COMMAND.into()));
    message.insert("command".into(), Value::String(name.into()));
    message.extend(fields);
    Ok(message)
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ── Tests ────────────────────────────────────────────────────────
