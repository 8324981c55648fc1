//! Command dispatch: JSON envelopes in, JSON responses out.
//!
//! Parsing produces a typed [`Command`]; execution maps each variant to one
//! relay operation. Everything except protocol errors reports `success`.

use crate::relay::Relay;
use centi_types::protocol::decode_payload;
use centi_types::{
    DecodeError, Envelope, MicroserviceConfig, ProtocolError, RelayError, RelayResult, Response,
};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A parsed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    InitMicroservice(MicroserviceConfig),
    InitChannels { addresses: Vec<String> },
    DeleteChannels,
    /// `None` when the key was present but not valid base64.
    DistributePk { public_key: Option<Vec<u8>> },
    CollectPks,
    Send { payload: Vec<u8> },
    RecvMessages,
    PrepareToDelete,
    Delete,
    MessageFromBytes,
    Health,
}

impl Command {
    /// Parse and validate an envelope into a command.
    pub fn parse(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let command = match envelope.message_type.as_str() {
            "init_microservice" => {
                Self::InitMicroservice(MicroserviceConfig::from_args(&envelope.args))
            }
            "init_channels" => Self::InitChannels {
                addresses: parse_channels(envelope.require("channels")?)?,
            },
            "delete_channels" => Self::DeleteChannels,
            "distribute_pk" => {
                let encoded = envelope
                    .require("public_key")?
                    .as_str()
                    .ok_or_else(|| ProtocolError::InvalidField {
                        field: "public_key",
                        reason: "expected a base64 string".to_string(),
                    })?;
                let public_key = match decode_payload("public_key", encoded) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(error = %e, "Ignoring undecodable public key");
                        None
                    }
                };
                Self::DistributePk { public_key }
            }
            "collect_pks" => Self::CollectPks,
            "send" => {
                let data = envelope
                    .require("message")?
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingField("message.data"))?;
                Self::Send {
                    payload: decode_payload("message.data", data)?,
                }
            }
            "recv_messages" => Self::RecvMessages,
            "prepare_to_delete" => Self::PrepareToDelete,
            "delete" => Self::Delete,
            "message_from_bytes" => Self::MessageFromBytes,
            "health" => Self::Health,
            other => return Err(ProtocolError::UnknownMessageType(other.to_string())),
        };
        Ok(command)
    }
}

/// `channels` is a list of `[label, address]` pairs. Malformed entries are
/// skipped.
fn parse_channels(value: &Value) -> Result<Vec<String>, ProtocolError> {
    let entries = value.as_array().ok_or_else(|| ProtocolError::InvalidField {
        field: "channels",
        reason: "expected a list of [label, address] pairs".to_string(),
    })?;
    let mut addresses = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.as_array().and_then(|pair| pair.get(1)).and_then(Value::as_str) {
            Some(address) => addresses.push(address.to_string()),
            None => warn!(entry = %entry, "Skipping malformed channel entry"),
        }
    }
    Ok(addresses)
}

/// Routes envelopes to a [`Relay`].
#[derive(Clone)]
pub struct Dispatcher {
    relay: Arc<Relay>,
}

impl Dispatcher {
    /// Create a dispatcher for `relay`.
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }

    /// The relay commands are executed against.
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Execute one envelope.
    pub async fn dispatch(&self, envelope: Envelope) -> Response {
        let message_type = envelope.message_type.clone();
        match Command::parse(&envelope) {
            Ok(command) => {
                debug!(message_type = %message_type, "Dispatching command");
                self.execute(&message_type, command).await
            }
            Err(e) => {
                warn!(message_type = %message_type, error = %e, "Rejected command");
                Response::failure(message_type, e)
            }
        }
    }

    async fn execute(&self, message_type: &str, command: Command) -> Response {
        let relay = &self.relay;
        let response = Response::success(message_type);
        match command {
            Command::InitMicroservice(config) => {
                relay.init_microservice(config).await;
                response
            }
            Command::InitChannels { addresses } => {
                relay.init_channels(addresses).await;
                response
            }
            Command::DeleteChannels => {
                relay.delete_channels().await;
                response
            }
            Command::DistributePk { public_key } => {
                if let Some(key) = public_key {
                    relay.distribute_pk(key);
                }
                response
            }
            Command::CollectPks => {
                let keys = relay.collect_pks();
                info!(count = keys.len(), "Collected public keys");
                response.with_arg("public_keys", json!(keys))
            }
            Command::Send { payload } => {
                relay.send(payload);
                response
            }
            Command::RecvMessages => {
                let messages = relay.recv_messages();
                if !messages.is_empty() {
                    info!(count = messages.len(), "Delivered received messages");
                }
                response.with_arg("messages", json!(messages))
            }
            Command::PrepareToDelete => response.with_arg("message", Value::Null),
            Command::Delete => response,
            Command::MessageFromBytes => {
                let mut args = Map::new();
                args.insert("test_argument".to_string(), json!("test_value"));
                response.with_args(args)
            }
            Command::Health => match serde_json::to_value(relay.health().await) {
                Ok(Value::Object(args)) => response.with_args(args),
                Ok(_) => response,
                Err(e) => Response::failure(message_type, e),
            },
        }
    }

    /// Decode a raw request body, dispatch it and encode the response.
    ///
    /// Undecodable bodies and handler panics yield an empty string.
    pub async fn handle_body(&self, body: &[u8]) -> String {
        match AssertUnwindSafe(self.respond(body)).catch_unwind().await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to handle command");
                String::new()
            }
            Err(_) => {
                error!("Command handler panicked");
                String::new()
            }
        }
    }

    /// Decode, dispatch and encode one request body.
    pub async fn respond(&self, body: &[u8]) -> RelayResult<String> {
        let envelope = decode_envelope(body)?;
        let response = self.dispatch(envelope).await;
        serde_json::to_string(&response).map_err(RelayError::Encode)
    }
}

/// Decode a raw request body into an envelope.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(body).map_err(|_| DecodeError::NotUtf8)?;
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::NullTransport;
    use centi_types::protocol::encode_payload;
    use centi_types::Status;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(Relay::new(Arc::new(NullTransport))))
    }

    fn envelope(value: Value) -> Envelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_init_channels() {
        let cmd = Command::parse(&envelope(json!({
            "message_type": "init_channels",
            "args": {"channels": [["n1", "addr-1"], "junk", ["n2", "addr-2"]]}
        })))
        .unwrap();
        assert_eq!(
            cmd,
            Command::InitChannels {
                addresses: vec!["addr-1".to_string(), "addr-2".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_missing_required_fields() {
        let err = Command::parse(&envelope(json!({"message_type": "init_channels", "args": {}})))
            .unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("channels"));

        let err = Command::parse(&envelope(json!({
            "message_type": "send",
            "args": {"message": {}}
        })))
        .unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("message.data"));
    }

    #[test]
    fn test_parse_lenient_config() {
        let cmd = Command::parse(&envelope(json!({
            "message_type": "init_microservice",
            "args": {"run_as_server": "true", "max_attempts": "oops"}
        })))
        .unwrap();
        let Command::InitMicroservice(config) = cmd else {
            panic!("wrong command");
        };
        assert!(config.run_as_server);
        assert_eq!(config.max_attempts, centi_types::config::DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_unknown_message_type_fails_without_mutation() {
        let d = dispatcher();
        let resp = d
            .dispatch(envelope(json!({"message_type": "frobnicate", "args": {}})))
            .await;
        assert_eq!(resp.status, Status::Failure);
        assert_eq!(resp.message_type, "frobnicate");
        assert_eq!(resp.args["error"], "Unknown message type: frobnicate");
        assert!(!d.relay().is_running().await);
    }

    #[tokio::test]
    async fn test_collect_pks_is_idempotent() {
        let d = dispatcher();
        d.relay().context().keys.add(b"remote-key");
        let req = json!({"message_type": "collect_pks", "args": {"distribution_parameters": {}}});
        let first = d.dispatch(envelope(req.clone())).await;
        let second = d.dispatch(envelope(req)).await;
        assert_eq!(first.args["public_keys"], second.args["public_keys"]);
        assert_eq!(
            first.args["public_keys"][0]["content"],
            encode_payload(b"remote-key")
        );
    }

    #[tokio::test]
    async fn test_recv_messages_drains() {
        let d = dispatcher();
        d.relay().context().inbox.push(&[9u8; 4096]);
        let req = json!({"message_type": "recv_messages", "args": {}});

        let first = d.dispatch(envelope(req.clone())).await;
        assert_eq!(first.args["messages"].as_array().unwrap().len(), 1);
        let second = d.dispatch(envelope(req)).await;
        assert_eq!(second.args["messages"], json!([]));
    }

    #[tokio::test]
    async fn test_distribute_pk_never_fails_on_bad_base64() {
        let d = dispatcher();
        let resp = d
            .dispatch(envelope(json!({
                "message_type": "distribute_pk",
                "args": {"distribution_parameters": {}, "public_key": "%%%"}
            })))
            .await;
        assert_eq!(resp.status, Status::Success);
        assert!(!d.relay().context().local_key.is_set());
    }

    #[tokio::test]
    async fn test_stub_commands() {
        let d = dispatcher();
        let resp = d
            .dispatch(envelope(json!({"message_type": "message_from_bytes", "args": {}})))
            .await;
        assert_eq!(resp.args["test_argument"], "test_value");

        let resp = d
            .dispatch(envelope(json!({"message_type": "prepare_to_delete", "args": {"data": "x"}})))
            .await;
        assert_eq!(resp.args["message"], Value::Null);

        let resp = d
            .dispatch(envelope(json!({"message_type": "delete", "args": {"message": {}}})))
            .await;
        assert_eq!(resp.status, Status::Success);
        assert!(resp.args.is_empty());
    }

    #[tokio::test]
    async fn test_handle_body_decode_error_is_empty() {
        let d = dispatcher();
        assert_eq!(d.handle_body(b"{not json").await, "");
        assert_eq!(d.handle_body(&[0xff, 0xfe]).await, "");

        let body = d
            .handle_body(br#"{"message_type":"delete_channels","args":{"channels":[]}}"#)
            .await;
        let resp: Response = serde_json::from_str(&body).unwrap();
        assert_eq!(resp.status, Status::Success);
    }

    #[tokio::test]
    async fn test_respond_surfaces_decode_errors() {
        let d = dispatcher();
        assert!(matches!(
            d.respond(b"{not json").await,
            Err(RelayError::Decode(DecodeError::Json(_)))
        ));
        assert!(matches!(
            d.respond(&[0xff, 0xfe]).await,
            Err(RelayError::Decode(DecodeError::NotUtf8))
        ));

        let body = d
            .respond(br#"{"message_type":"health","args":{}}"#)
            .await
            .unwrap();
        assert!(body.contains("\"status\":\"success\""));
    }
}
