//! Command protocol records.
//!
//! One JSON object per request, one per response:
//!
//! ```json
//! {"message_type": "collect_pks", "args": {}}
//! {"message_type": "collect_pks", "status": "success", "args": {"public_keys": []}}
//! ```
//!
//! Binary payloads (keys, message data) travel as standard base64.

use crate::error::ProtocolError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An incoming command envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Command name, echoed back in the response.
    pub message_type: String,
    /// Command arguments. Absent or `null` is treated as `{}`.
    #[serde(default)]
    pub args: Value,
}

impl Envelope {
    /// Look up an argument by name, treating non-object args as empty.
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.as_object().and_then(|m| m.get(name))
    }

    /// Look up a required argument.
    pub fn require(&self, name: &'static str) -> Result<&Value, ProtocolError> {
        match self.arg(name) {
            Some(Value::Null) | None => Err(ProtocolError::MissingField(name)),
            Some(v) => Ok(v),
        }
    }
}

/// Outcome marker of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// An outgoing command response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub message_type: String,
    pub status: Status,
    pub args: Map<String, Value>,
}

impl Response {
    /// A successful response with no arguments.
    pub fn success(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            status: Status::Success,
            args: Map::new(),
        }
    }

    /// A failed response carrying `args.error`.
    pub fn failure(message_type: impl Into<String>, error: impl ToString) -> Self {
        let mut args = Map::new();
        args.insert("error".to_string(), Value::String(error.to_string()));
        Self {
            message_type: message_type.into(),
            status: Status::Failure,
            args,
        }
    }

    /// Builder-style setter for one response argument.
    pub fn with_arg(mut self, key: &str, value: Value) -> Self {
        self.args.insert(key.to_string(), value);
        self
    }

    /// Replace the whole argument object.
    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }
}

/// A remote identity credential as reported by `collect_pks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyRecord {
    /// Transport tag, e.g. `"bluetooth"` or `"reticulum"`.
    pub platform: String,
    /// Randomly generated identifier.
    pub alias: String,
    /// Base64 of the raw key bytes. Unique within a store.
    pub content: String,
}

/// A received message as reported by `recv_messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub platform: String,
    /// Base64 of the payload.
    pub data: String,
    /// Empty when the sender is unknown.
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub sent_by_us: bool,
    #[serde(default = "empty_object")]
    pub args: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Encode raw bytes for the command protocol.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 protocol field.
pub fn decode_payload(field: &'static str, encoded: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| ProtocolError::InvalidField {
            field,
            reason: e.to_string(),
        })
}
