//! Events published to applications.
//!
//! Only aggregate state changes and decoded responses are published.
//! Individual transport and decode failures are logged, not surfaced.

use gattlink_core::EventBus;

use crate::broker::MqttSessionState;
use crate::codec::{NetworkOperationResponse, ScannedNetwork};
use crate::connection::ConnectionState;
use crate::scan::ScanResult;
use crate::DeviceId;

/// Value read from the device-information service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceInfo {
    Mtu(u16),
    BrokerEndpoint(String),
    Version(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceInfoError {
    #[error("BLE link is not connected")]
    Disconnected,
}

/// A decoded response on the network-config channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkConfigResponse {
    /// One network from a list request.
    Network(ScannedNetwork),
    Saved(NetworkOperationResponse),
    Edited(NetworkOperationResponse),
    Deleted(NetworkOperationResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    ConnectionState {
        device_id: DeviceId,
        state: ConnectionState,
    },
    BrokerState {
        device_id: DeviceId,
        state: MqttSessionState,
    },
    NetworkConfig {
        device_id: DeviceId,
        response: NetworkConfigResponse,
    },
    DeviceInfo {
        device_id: DeviceId,
        info: DeviceInfo,
    },
    DeviceInfoError {
        device_id: DeviceId,
        error: DeviceInfoError,
    },
    ScanResult(ScanResult),
    ScanFailed {
        code: i32,
    },
}

impl GatewayEvent {
    /// Device the event concerns; scan events concern none.
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            GatewayEvent::ConnectionState { device_id, .. }
            | GatewayEvent::BrokerState { device_id, .. }
            | GatewayEvent::NetworkConfig { device_id, .. }
            | GatewayEvent::DeviceInfo { device_id, .. }
            | GatewayEvent::DeviceInfoError { device_id, .. } => Some(device_id),
            GatewayEvent::ScanResult(_) | GatewayEvent::ScanFailed { .. } => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            GatewayEvent::ConnectionState { .. } => "ConnectionState",
            GatewayEvent::BrokerState { .. } => "BrokerState",
            GatewayEvent::NetworkConfig { .. } => "NetworkConfig",
            GatewayEvent::DeviceInfo { .. } => "DeviceInfo",
            GatewayEvent::DeviceInfoError { .. } => "DeviceInfoError",
            GatewayEvent::ScanResult(_) => "ScanResult",
            GatewayEvent::ScanFailed { .. } => "ScanFailed",
        }
    }

    pub fn is_network_config(&self) -> bool {
        matches!(self, GatewayEvent::NetworkConfig { .. })
    }

    pub fn is_scan_event(&self) -> bool {
        matches!(self, GatewayEvent::ScanResult(_) | GatewayEvent::ScanFailed { .. })
    }
}

pub type GatewayEventBus = EventBus<GatewayEvent>;
