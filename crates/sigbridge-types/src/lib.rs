use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Keyword fields carried by a signal emission (`signal.send(sender, **fields)`).
pub type Payload = Map<String, Value>;

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QoS {
    /// Fire and forget (QoS 0).
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible (QoS 1).
    #[default]
    AtLeastOnce,
    /// Four-way handshake (QoS 2).
    ExactlyOnce,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(BridgeError::Transport(format!("invalid QoS level {other}"))),
        }
    }
}

/// A transport message, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
}

impl Message {
    /// Build a non-retained message at QoS 1.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retained: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// The payload as UTF-8, if it is valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// RPC operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    /// Invoke a named method.
    Call,
    /// Read (no args) or write (one arg) a named property.
    Property,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Call => "call",
            Verb::Property => "property",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(Verb::Call),
            "property" => Ok(Verb::Property),
            other => Err(BridgeError::MalformedTopic(format!("unknown verb `{other}`"))),
        }
    }
}

/// Wire body of a `call` or `property` request: `{"args": [...], "kwargs": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Payload,
}

impl RpcRequest {
    pub fn new(args: Vec<Value>, kwargs: Payload) -> Self {
        Self { args, kwargs }
    }

    /// Decode a request body. An empty body is an empty request.
    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Error taxonomy shared by the bridge, correlator, monitor and proxy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The topic does not match any recognised shape. Callers treat this as
    /// "not for me".
    #[error("Malformed topic: {0}")]
    MalformedTopic(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Signal namespace already bound to client `{0}`")]
    AlreadyBound(String),

    #[error("Signal namespace is not bound to a transport")]
    NotBound,

    #[error("Remote call `{name}` failed: {details}")]
    RemoteCallFailed { name: String, details: String },

    #[error("Unknown member `{0}`")]
    UnknownMember(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Device Fault on {device}: {details}")]
    Device { device: String, details: String },

    #[error("Configuration Error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn qos_levels_roundtrip_through_u8() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            assert_eq!(QoS::try_from(qos.as_u8()).unwrap(), qos);
        }
        assert!(QoS::try_from(3).is_err());
    }

    #[test]
    fn message_defaults_to_qos1_not_retained() {
        let msg = Message::new("/dropbot/abc/properties", "{}");
        assert_eq!(msg.qos, QoS::AtLeastOnce);
        assert!(!msg.retained);
        assert_eq!(msg.payload_str(), Some("{}"));

        let msg = msg.with_qos(QoS::AtMostOnce).retained(true);
        assert_eq!(msg.qos, QoS::AtMostOnce);
        assert!(msg.retained);
    }

    #[test]
    fn verb_parses_and_displays() {
        assert_eq!("call".parse::<Verb>().unwrap(), Verb::Call);
        assert_eq!("property".parse::<Verb>().unwrap(), Verb::Property);
        assert_eq!(Verb::Property.to_string(), "property");
        assert!(matches!(
            "result".parse::<Verb>(),
            Err(BridgeError::MalformedTopic(_))
        ));
    }

    #[test]
    fn rpc_request_tolerates_missing_fields() {
        let req = RpcRequest::decode(br#"{"args": [80]}"#).unwrap();
        assert_eq!(req.args, vec![json!(80)]);
        assert!(req.kwargs.is_empty());

        let empty = RpcRequest::decode(b"").unwrap();
        assert_eq!(empty, RpcRequest::default());
    }

    #[test]
    fn rpc_request_wire_shape() {
        let mut kwargs = Payload::new();
        kwargs.insert("capacitance_update_interval_ms".into(), json!(0));
        let bytes = RpcRequest::new(vec![], kwargs).encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"args": [], "kwargs": {"capacitance_update_interval_ms": 0}})
        );
    }

    #[test]
    fn invalid_json_maps_to_serialization_error() {
        let err = RpcRequest::decode(b"{not json").unwrap_err();
        assert!(matches!(err, BridgeError::Serialization(_)));
    }

    #[test]
    fn bridge_error_display() {
        let err = BridgeError::AlreadyBound("dropbot-monitor".to_string());
        assert!(err.to_string().contains("dropbot-monitor"));

        let err = BridgeError::Device {
            device: "dropbot".to_string(),
            details: "high voltage fault".to_string(),
        };
        assert!(err.to_string().contains("high voltage fault"));
    }
}
