//! Protocol bridges between the device's proxy channels and the outside.

pub mod mqtt;
pub mod network;

pub use mqtt::{BridgeOutput, MqttBridge};
pub use network::{decode_batch, network_order, NetworkRequest};
