//! Core types shared across gattlink crates.
//!
//! Configuration, error handling, logging setup and the event bus live here;
//! the BLE/broker protocol engine is in `gattlink-devices`.

pub mod config;
pub mod error;
pub mod eventbus;
pub mod logging;
pub mod macros;

pub use config::{
    BrokerConfig, ControlEncoding, GatewayConfig, LogConfig, MqttProxyConfig, ScanConfig,
    SchedulerConfig, TlsConfig,
};
pub use error::{Error, Result};
pub use eventbus::{EventBus, EventMetadata, Subscription, DEFAULT_CHANNEL_CAPACITY};
