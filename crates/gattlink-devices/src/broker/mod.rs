//! Broker capability.
//!
//! The MQTT proxy bridge drives a real broker session through
//! [`BrokerConnector`] and [`BrokerSession`]. Connection status, delivery
//! results and inbound messages come back as [`BrokerEvent`]s on the sink
//! handed to `connect`.

#[cfg(feature = "mqtt")]
pub mod rumqtt;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Delivery guarantee. QoS 2 is not proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    /// Map a wire QoS value; anything other than 0 is treated as 1.
    pub fn from_wire(value: u8) -> Self {
        if value == 0 {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        }
    }

    pub fn wire(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

/// Proxied MQTT session state, as reported to the device in CONNACK.
///
/// Ordinals are part of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MqttSessionState {
    Unknown,
    Connecting,
    Connected,
    #[default]
    Disconnected,
    ConnectionRefused,
    ConnectionError,
    ProtocolError,
}

impl MqttSessionState {
    pub fn ordinal(self) -> u32 {
        match self {
            MqttSessionState::Unknown => 0,
            MqttSessionState::Connecting => 1,
            MqttSessionState::Connected => 2,
            MqttSessionState::Disconnected => 3,
            MqttSessionState::ConnectionRefused => 4,
            MqttSessionState::ConnectionError => 5,
            MqttSessionState::ProtocolError => 6,
        }
    }
}

/// Parameters for opening a broker session on a device's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub client_id: String,
    pub endpoint: String,
    pub clean_session: bool,
    /// Key/value pairs describing the device, sent with the connection.
    pub metadata: Vec<(String, String)>,
}

/// Identifies a device publish so its delivery result can be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTag {
    pub message_id: u32,
    pub qos: QoS,
}

/// Broker connection status as reported by the client library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerStatus {
    Connecting,
    Connected,
    Reconnecting,
    ConnectionLost,
    Refused(String),
    Error(String),
    ProtocolViolation(String),
}

impl BrokerStatus {
    /// Session state this status maps to.
    pub fn session_state(&self) -> MqttSessionState {
        match self {
            BrokerStatus::Connecting | BrokerStatus::Reconnecting => MqttSessionState::Connecting,
            BrokerStatus::Connected => MqttSessionState::Connected,
            BrokerStatus::ConnectionLost => MqttSessionState::Disconnected,
            BrokerStatus::Refused(_) => MqttSessionState::ConnectionRefused,
            BrokerStatus::Error(_) => MqttSessionState::ConnectionError,
            BrokerStatus::ProtocolViolation(_) => MqttSessionState::ProtocolError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Status(BrokerStatus),
    Delivered { tag: DeliveryTag, success: bool },
    Message {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
}

/// Where a broker session reports its events.
#[derive(Debug, Clone)]
pub struct BrokerEventSink {
    tx: mpsc::UnboundedSender<BrokerEvent>,
}

impl BrokerEventSink {
    pub fn new(tx: mpsc::UnboundedSender<BrokerEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Returns `false` once the receiving session has gone away.
    pub fn emit(&self, event: BrokerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    Connect(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Broker request failed: {0}")]
    Request(String),

    #[error("Broker session closed")]
    Closed,
}

/// Opens broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Start connecting. Progress is reported on `events`, starting with
    /// a `Connecting` status.
    async fn connect(
        &self,
        params: ConnectParams,
        events: BrokerEventSink,
    ) -> Result<Box<dyn BrokerSession>, BrokerError>;
}

/// One live broker session, exclusively owned by a session's MQTT bridge.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
        tag: DeliveryTag,
    ) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;
}

/// Match an MQTT topic against a subscription filter with `+` and `#`
/// wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
