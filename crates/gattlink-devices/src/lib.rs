//! BLE proxy engine.
//!
//! Bridges a provisioning device's GATT proxy channels to an MQTT broker
//! and to the app, for many devices at once.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | `rumqttc` broker connector |
//!
//! ## Architecture
//!
//! - **SessionRegistry**: one live [`DeviceSession`](session) per device address
//! - **CommandScheduler**: serializes GATT operations over two lanes
//! - **ConnectionMachine**: link bring-up from connect to ready
//! - **MqttBridge** / **network bridge**: translate proxy messages
//! - **Transport** / **BrokerConnector** / **Scanner**: platform capabilities
//!
//! Apps observe everything through the [`GatewayEventBus`].

pub mod bridge;
pub mod broker;
pub mod codec;
pub mod command;
pub mod connection;
pub mod event;
pub mod fragment;
pub mod gatt;
pub mod scan;
pub mod scheduler;
pub mod transport;

// Per-device actor and its registry
pub mod registry;
pub mod session;

// In-memory platform implementations for tests and demos
pub mod mock;

gattlink_core::string_id!(
    /// Platform address of a BLE peripheral.
    pub struct DeviceId
);

pub use broker::{
    BrokerConnector, BrokerError, BrokerEvent, BrokerEventSink, BrokerSession, BrokerStatus,
    ConnectParams, DeliveryTag, MqttSessionState, QoS,
};
#[cfg(feature = "mqtt")]
pub use broker::rumqtt::RumqttConnector;
pub use codec::{DecodeError, MqttMessage, NetworkMessage};
pub use connection::{ConnectionMachine, ConnectionState};
pub use event::{DeviceInfo, DeviceInfoError, GatewayEvent, GatewayEventBus, NetworkConfigResponse};
pub use gatt::{Characteristic, Lane, Service};
pub use registry::SessionRegistry;
pub use scan::{ScanError, ScanEvent, ScanManager, ScanResult, Scanner};
pub use scheduler::{CommandScheduler, SchedulerSnapshot};
pub use session::{DeviceMetadata, SessionConfig, SessionError, SessionHandle, SessionSnapshot};
pub use transport::{BondState, GattStatus, LinkState, Transport, TransportError, TransportEvent};
