//! MQTT proxy messages.

use super::{keys, CborMap, DecodeError, MapBuilder};

/// Type codes carried in the `w` key.
pub mod message_type {
    pub const CONNECT: u64 = 1;
    pub const CONNACK: u64 = 2;
    pub const PUBLISH: u64 = 3;
    pub const PUBACK: u64 = 4;
    pub const PUBREC: u64 = 5;
    pub const PUBREL: u64 = 6;
    pub const PUBCOMP: u64 = 7;
    pub const SUBSCRIBE: u64 = 8;
    pub const SUBACK: u64 = 9;
    pub const UNSUBSCRIBE: u64 = 10;
    pub const UNSUBACK: u64 = 11;
    pub const PINGREQ: u64 = 12;
    pub const PINGRESP: u64 = 13;
    pub const DISCONNECT: u64 = 14;
}

/// Device asks the gateway to open a broker session on its behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub broker_endpoint: String,
    pub clean_session: bool,
}

/// Connection result sent to the device. `status` is a broker state ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub msg_id: u32,
    pub qos: u8,
    pub payload: Vec<u8>,
}

/// Acknowledgement that only carries a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageAck {
    pub msg_id: u32,
}

/// Parallel topic and QoS lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub topics: Vec<String>,
    pub qos: Vec<u8>,
    pub msg_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suback {
    pub msg_id: u32,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub topics: Vec<String>,
    pub msg_id: u32,
}

/// A message on the MQTT proxy channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttMessage {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(MessageAck),
    PubRec(MessageAck),
    PubRel(MessageAck),
    PubComp(MessageAck),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(MessageAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl MqttMessage {
    pub fn message_type(&self) -> u64 {
        match self {
            MqttMessage::Connect(_) => message_type::CONNECT,
            MqttMessage::Connack(_) => message_type::CONNACK,
            MqttMessage::Publish(_) => message_type::PUBLISH,
            MqttMessage::Puback(_) => message_type::PUBACK,
            MqttMessage::PubRec(_) => message_type::PUBREC,
            MqttMessage::PubRel(_) => message_type::PUBREL,
            MqttMessage::PubComp(_) => message_type::PUBCOMP,
            MqttMessage::Subscribe(_) => message_type::SUBSCRIBE,
            MqttMessage::Suback(_) => message_type::SUBACK,
            MqttMessage::Unsubscribe(_) => message_type::UNSUBSCRIBE,
            MqttMessage::Unsuback(_) => message_type::UNSUBACK,
            MqttMessage::PingReq => message_type::PINGREQ,
            MqttMessage::PingResp => message_type::PINGRESP,
            MqttMessage::Disconnect => message_type::DISCONNECT,
        }
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            MqttMessage::Connect(_) => "CONNECT",
            MqttMessage::Connack(_) => "CONNACK",
            MqttMessage::Publish(_) => "PUBLISH",
            MqttMessage::Puback(_) => "PUBACK",
            MqttMessage::PubRec(_) => "PUBREC",
            MqttMessage::PubRel(_) => "PUBREL",
            MqttMessage::PubComp(_) => "PUBCOMP",
            MqttMessage::Subscribe(_) => "SUBSCRIBE",
            MqttMessage::Suback(_) => "SUBACK",
            MqttMessage::Unsubscribe(_) => "UNSUBSCRIBE",
            MqttMessage::Unsuback(_) => "UNSUBACK",
            MqttMessage::PingReq => "PINGREQ",
            MqttMessage::PingResp => "PINGRESP",
            MqttMessage::Disconnect => "DISCONNECT",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let map = MapBuilder::new().uint(keys::TYPE, self.message_type());
        let map = match self {
            MqttMessage::Connect(m) => map
                .text(keys::CLIENT_ID, &m.client_id)
                .text(keys::BROKER_ENDPOINT, &m.broker_endpoint)
                .bool(keys::CLEAN_SESSION, m.clean_session),
            MqttMessage::Connack(m) => map.uint(keys::STATUS, u64::from(m.status)),
            MqttMessage::Publish(m) => map
                .text(keys::TOPIC, &m.topic)
                .uint(keys::MSG_ID, u64::from(m.msg_id))
                .uint(keys::QOS, u64::from(m.qos))
                .bytes(keys::PAYLOAD, &m.payload),
            MqttMessage::Puback(m)
            | MqttMessage::PubRec(m)
            | MqttMessage::PubRel(m)
            | MqttMessage::PubComp(m)
            | MqttMessage::Unsuback(m) => map.uint(keys::MSG_ID, u64::from(m.msg_id)),
            MqttMessage::Subscribe(m) => map
                .text_list(keys::TOPIC_LIST, &m.topics)
                .uint_list(keys::QOS_LIST, &m.qos)
                .uint(keys::MSG_ID, u64::from(m.msg_id)),
            MqttMessage::Suback(m) => map
                .uint(keys::MSG_ID, u64::from(m.msg_id))
                .uint(keys::STATUS, u64::from(m.status)),
            MqttMessage::Unsubscribe(m) => map
                .text_list(keys::TOPIC_LIST, &m.topics)
                .uint(keys::MSG_ID, u64::from(m.msg_id)),
            MqttMessage::PingReq | MqttMessage::PingResp | MqttMessage::Disconnect => map,
        };
        map.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let map = CborMap::parse(bytes)?;
        let ack = |map: &CborMap| -> Result<MessageAck, DecodeError> {
            Ok(MessageAck {
                msg_id: map.u32(keys::MSG_ID)?,
            })
        };

        let message = match map.uint(keys::TYPE)? {
            message_type::CONNECT => MqttMessage::Connect(Connect {
                client_id: map.text(keys::CLIENT_ID)?,
                broker_endpoint: map.text(keys::BROKER_ENDPOINT)?,
                clean_session: map.bool(keys::CLEAN_SESSION)?,
            }),
            message_type::CONNACK => MqttMessage::Connack(Connack {
                status: map.u32(keys::STATUS)?,
            }),
            message_type::PUBLISH => MqttMessage::Publish(Publish {
                topic: map.text(keys::TOPIC)?,
                msg_id: map.u32(keys::MSG_ID)?,
                qos: map.u8(keys::QOS)?,
                payload: map.bytes(keys::PAYLOAD)?,
            }),
            message_type::PUBACK => MqttMessage::Puback(ack(&map)?),
            message_type::PUBREC => MqttMessage::PubRec(ack(&map)?),
            message_type::PUBREL => MqttMessage::PubRel(ack(&map)?),
            message_type::PUBCOMP => MqttMessage::PubComp(ack(&map)?),
            message_type::SUBSCRIBE => {
                let topics = map.text_list(keys::TOPIC_LIST)?;
                let qos = map.u8_list(keys::QOS_LIST)?;
                if topics.len() != qos.len() {
                    return Err(DecodeError::Malformed {
                        key: keys::QOS_LIST,
                        reason: "does not match the topic list length",
                    });
                }
                MqttMessage::Subscribe(Subscribe {
                    topics,
                    qos,
                    msg_id: map.u32(keys::MSG_ID)?,
                })
            }
            message_type::SUBACK => MqttMessage::Suback(Suback {
                msg_id: map.u32(keys::MSG_ID)?,
                status: map.u32(keys::STATUS)?,
            }),
            message_type::UNSUBSCRIBE => MqttMessage::Unsubscribe(Unsubscribe {
                topics: map.text_list(keys::TOPIC_LIST)?,
                msg_id: map.u32(keys::MSG_ID)?,
            }),
            message_type::UNSUBACK => MqttMessage::Unsuback(ack(&map)?),
            message_type::PINGREQ => MqttMessage::PingReq,
            message_type::PINGRESP => MqttMessage::PingResp,
            message_type::DISCONNECT => MqttMessage::Disconnect,
            other => return Err(DecodeError::UnknownType(other)),
        };
        Ok(message)
    }
}

/// Proxy enable/disable control value, `{l: 1}` or `{l: 0}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyControl {
    pub enabled: bool,
}

impl ProxyControl {
    pub const ON: u64 = 1;
    pub const OFF: u64 = 0;

    pub fn encode(&self) -> Vec<u8> {
        let state = if self.enabled { Self::ON } else { Self::OFF };
        MapBuilder::new().uint(keys::PROXY_STATE, state).finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let map = CborMap::parse(bytes)?;
        match map.uint(keys::PROXY_STATE)? {
            Self::ON => Ok(Self { enabled: true }),
            Self::OFF => Ok(Self { enabled: false }),
            _ => Err(DecodeError::Malformed {
                key: keys::PROXY_STATE,
                reason: "is not 0 or 1",
            }),
        }
    }
}
