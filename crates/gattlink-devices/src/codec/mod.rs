//! CBOR codec for proxy messages.
//!
//! Every message is a CBOR map keyed by single-character text keys. The
//! type key `w` is read first to route to the variant decoder; decoding is
//! all-or-nothing and never yields a partially populated message.

pub mod mqtt;
pub mod network;

use ciborium::value::{Integer, Value};

pub use mqtt::{
    Connack, Connect, MessageAck, MqttMessage, ProxyControl, Publish, Suback, Subscribe,
    Unsubscribe,
};
pub use network::{
    DeleteNetworkRequest, EditNetworkRequest, ListNetworkRequest, NetworkMessage,
    NetworkOperationResponse, SaveNetworkRequest, ScannedNetwork, SecurityType,
};

/// Wire keys.
pub mod keys {
    pub const TYPE: &str = "w";
    pub const MSG_ID: &str = "i";
    pub const STATUS: &str = "s";
    pub const SSID: &str = "r";
    pub const BSSID: &str = "b";
    pub const SECURITY: &str = "q";
    pub const HIDDEN: &str = "f";
    pub const RSSI: &str = "p";
    pub const CONNECTED: &str = "e";
    pub const INDEX: &str = "g";
    pub const NEW_INDEX: &str = "j";
    pub const MAX_NETWORKS: &str = "h";
    pub const TIMEOUT: &str = "t";
    pub const PSK: &str = "m";
    pub const PROXY_STATE: &str = "l";
    pub const CLIENT_ID: &str = "d";
    pub const BROKER_ENDPOINT: &str = "a";
    pub const CLEAN_SESSION: &str = "c";
    pub const TOPIC: &str = "u";
    pub const QOS: &str = "n";
    pub const PAYLOAD: &str = "k";
    pub const TOPIC_LIST: &str = "v";
    pub const QOS_LIST: &str = "o";
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The bytes are not a single well-formed CBOR item.
    #[error("Invalid CBOR: {0}")]
    Cbor(String),

    /// Well-formed CBOR that does not describe a known message.
    #[error("Malformed message: key '{key}' {reason}")]
    Malformed {
        key: &'static str,
        reason: &'static str,
    },

    /// The type key names no message of this namespace.
    #[error("Unknown message type: {0}")]
    UnknownType(u64),
}

impl DecodeError {
    fn missing(key: &'static str) -> Self {
        DecodeError::Malformed {
            key,
            reason: "is missing",
        }
    }

    fn wrong_type(key: &'static str) -> Self {
        DecodeError::Malformed {
            key,
            reason: "has the wrong type",
        }
    }

    fn out_of_range(key: &'static str) -> Self {
        DecodeError::Malformed {
            key,
            reason: "is out of range",
        }
    }
}

/// Read only the `w` key of an encoded message.
pub fn peek_message_type(bytes: &[u8]) -> Result<u64, DecodeError> {
    CborMap::parse(bytes)?.uint(keys::TYPE)
}

/// Read-only view over a decoded top-level CBOR map.
pub(crate) struct CborMap {
    entries: Vec<(Value, Value)>,
}

impl CborMap {
    pub(crate) fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value =
            ciborium::de::from_reader(bytes).map_err(|e| DecodeError::Cbor(format!("{:?}", e)))?;
        match value {
            Value::Map(entries) => Ok(Self { entries }),
            _ => Err(DecodeError::Malformed {
                key: keys::TYPE,
                reason: "is not inside a map",
            }),
        }
    }

    fn get(&self, key: &'static str) -> Option<&Value> {
        self.entries.iter().find_map(|(k, v)| match k {
            Value::Text(text) if text == key => Some(v),
            _ => None,
        })
    }

    fn required(&self, key: &'static str) -> Result<&Value, DecodeError> {
        self.get(key).ok_or_else(|| DecodeError::missing(key))
    }

    pub(crate) fn uint(&self, key: &'static str) -> Result<u64, DecodeError> {
        match self.required(key)? {
            Value::Integer(i) => u64::try_from(*i).map_err(|_| DecodeError::out_of_range(key)),
            _ => Err(DecodeError::wrong_type(key)),
        }
    }

    pub(crate) fn u32(&self, key: &'static str) -> Result<u32, DecodeError> {
        u32::try_from(self.uint(key)?).map_err(|_| DecodeError::out_of_range(key))
    }

    pub(crate) fn u8(&self, key: &'static str) -> Result<u8, DecodeError> {
        u8::try_from(self.uint(key)?).map_err(|_| DecodeError::out_of_range(key))
    }

    /// Signed integer; accepts both CBOR major types 0 and 1.
    pub(crate) fn i32(&self, key: &'static str) -> Result<i32, DecodeError> {
        match self.required(key)? {
            Value::Integer(i) => i32::try_from(i128::from(*i)).map_err(|_| DecodeError::out_of_range(key)),
            _ => Err(DecodeError::wrong_type(key)),
        }
    }

    pub(crate) fn text(&self, key: &'static str) -> Result<String, DecodeError> {
        match self.required(key)? {
            Value::Text(text) => Ok(text.clone()),
            _ => Err(DecodeError::wrong_type(key)),
        }
    }

    pub(crate) fn bytes(&self, key: &'static str) -> Result<Vec<u8>, DecodeError> {
        match self.required(key)? {
            Value::Bytes(bytes) => Ok(bytes.clone()),
            _ => Err(DecodeError::wrong_type(key)),
        }
    }

    pub(crate) fn bool(&self, key: &'static str) -> Result<bool, DecodeError> {
        match self.required(key)? {
            Value::Bool(b) => Ok(*b),
            _ => Err(DecodeError::wrong_type(key)),
        }
    }

    fn array(&self, key: &'static str) -> Result<&[Value], DecodeError> {
        match self.required(key)? {
            Value::Array(items) => Ok(items),
            _ => Err(DecodeError::wrong_type(key)),
        }
    }

    pub(crate) fn text_list(&self, key: &'static str) -> Result<Vec<String>, DecodeError> {
        self.array(key)?
            .iter()
            .map(|item| match item {
                Value::Text(text) => Ok(text.clone()),
                _ => Err(DecodeError::wrong_type(key)),
            })
            .collect()
    }

    pub(crate) fn u8_list(&self, key: &'static str) -> Result<Vec<u8>, DecodeError> {
        self.array(key)?
            .iter()
            .map(|item| match item {
                Value::Integer(i) => u8::try_from(*i).map_err(|_| DecodeError::out_of_range(key)),
                _ => Err(DecodeError::wrong_type(key)),
            })
            .collect()
    }
}

/// Builder for an outgoing CBOR map. Keys are written in insertion order.
#[derive(Default)]
pub(crate) struct MapBuilder {
    entries: Vec<(Value, Value)>,
}

impl MapBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn put(mut self, key: &str, value: Value) -> Self {
        self.entries.push((Value::Text(key.to_string()), value));
        self
    }

    pub(crate) fn uint(self, key: &str, value: u64) -> Self {
        self.put(key, Value::Integer(Integer::from(value)))
    }

    pub(crate) fn int(self, key: &str, value: i64) -> Self {
        self.put(key, Value::Integer(Integer::from(value)))
    }

    pub(crate) fn text(self, key: &str, value: &str) -> Self {
        self.put(key, Value::Text(value.to_string()))
    }

    pub(crate) fn bytes(self, key: &str, value: &[u8]) -> Self {
        self.put(key, Value::Bytes(value.to_vec()))
    }

    pub(crate) fn bool(self, key: &str, value: bool) -> Self {
        self.put(key, Value::Bool(value))
    }

    pub(crate) fn text_list(self, key: &str, values: &[String]) -> Self {
        let items = values.iter().map(|v| Value::Text(v.clone())).collect();
        self.put(key, Value::Array(items))
    }

    pub(crate) fn uint_list(self, key: &str, values: &[u8]) -> Self {
        let items = values
            .iter()
            .map(|v| Value::Integer(Integer::from(*v)))
            .collect();
        self.put(key, Value::Array(items))
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Serializing an in-memory Value into a Vec cannot fail.
        if let Err(e) = ciborium::ser::into_writer(&Value::Map(self.entries), &mut buf) {
            tracing::error!("CBOR encoding failed: {:?}", e);
        }
        buf
    }
}
