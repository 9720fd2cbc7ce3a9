//! peerlink control message types.
//!
//! Every message on the control socket is a flat JSON object
//! `{"type", "from", "to", "payload"}`. `payload` is an opaque string; for
//! `connect` and `connectionInfo` it carries a nested JSON document.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};

/// Message type names carried in the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    // inbound commands
    GetInfo,
    Connect,
    Close,

    // outbound replies
    ConnectionInfo,
    Error,
    Ack,
}

impl MsgType {
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::GetInfo => "getInfo",
            MsgType::Connect => "connect",
            MsgType::Close => "close",
            MsgType::ConnectionInfo => "connectionInfo",
            MsgType::Error => "error",
            MsgType::Ack => "ack",
        }
    }

    /// Map a wire name to a known type. Names are case-sensitive.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "getInfo" => Some(MsgType::GetInfo),
            "connect" => Some(MsgType::Connect),
            "close" => Some(MsgType::Close),
            "connectionInfo" => Some(MsgType::ConnectionInfo),
            "error" => Some(MsgType::Error),
            "ack" => Some(MsgType::Ack),
            _ => None,
        }
    }

    /// Whether the control client may send this type to the relay.
    pub fn is_command(self) -> bool {
        matches!(self, MsgType::GetInfo | MsgType::Connect | MsgType::Close)
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The control envelope. Absent fields decode as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub msg_type: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub payload: String,
}

impl Envelope {
    /// Build an outbound envelope.
    pub fn new(msg_type: MsgType, to: &str, from: &str, payload: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.as_str().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            payload: payload.into(),
        }
    }

    /// The inbound command this envelope names, if any.
    pub fn command(&self) -> Option<MsgType> {
        MsgType::from_wire(&self.msg_type).filter(|t| t.is_command())
    }

    /// Decode an envelope from an already-parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> RelayResult<Self> {
        if !value.is_object() {
            return Err(RelayError::Parse(format!(
                "expected a JSON object, got {}",
                json_kind(&value)
            )));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Nested payload of a `connect` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectDetails {
    #[serde(default)]
    pub sdp: String,
    #[serde(rename = "iceCandidates", default)]
    pub ice_candidates: Vec<String>,
}

impl ConnectDetails {
    pub fn parse(payload: &str) -> RelayResult<Self> {
        serde_json::from_str(payload).map_err(|e| RelayError::PayloadParse(e.to_string()))
    }
}

/// Nested payload of a `connectionInfo` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub sdp: String,
    #[serde(rename = "iceCandidates")]
    pub ice_candidates: Vec<String>,
}

impl ConnectionInfo {
    pub fn to_payload(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
