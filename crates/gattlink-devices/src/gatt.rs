//! GATT surface exposed by provisionable devices.

use uuid::Uuid;

/// Client characteristic configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Value written to the CCCD to enable notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// ATT header overhead subtracted from the MTU to get the usable payload.
pub const ATT_HEADER_SIZE: u16 = 3;

/// MTU assumed until the device reports its own.
pub const DEFAULT_MTU: u16 = 23;

/// GATT services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    DeviceInfo,
    NetworkConfig,
    MqttProxy,
}

impl Service {
    pub fn uuid(self) -> Uuid {
        match self {
            Service::DeviceInfo => Uuid::from_u128(0x8a7f1168_48af_4efb_83b5_e679f932ff00),
            Service::NetworkConfig => Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30100),
            Service::MqttProxy => Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30000),
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        [Service::DeviceInfo, Service::NetworkConfig, Service::MqttProxy]
            .into_iter()
            .find(|s| s.uuid() == uuid)
    }
}

/// GATT characteristics, grouped by service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    DeviceVersion,
    BrokerEndpoint,
    DeviceMtu,
    DevicePlatform,
    DeviceId,
    NetworkControl,
    NetworkTx,
    NetworkRx,
    NetworkTxLarge,
    NetworkRxLarge,
    MqttControl,
    MqttTx,
    MqttRx,
    MqttTxLarge,
    MqttRxLarge,
}

const ALL_CHARACTERISTICS: [Characteristic; 15] = [
    Characteristic::DeviceVersion,
    Characteristic::BrokerEndpoint,
    Characteristic::DeviceMtu,
    Characteristic::DevicePlatform,
    Characteristic::DeviceId,
    Characteristic::NetworkControl,
    Characteristic::NetworkTx,
    Characteristic::NetworkRx,
    Characteristic::NetworkTxLarge,
    Characteristic::NetworkRxLarge,
    Characteristic::MqttControl,
    Characteristic::MqttTx,
    Characteristic::MqttRx,
    Characteristic::MqttTxLarge,
    Characteristic::MqttRxLarge,
];

impl Characteristic {
    pub fn uuid(self) -> Uuid {
        let value: u128 = match self {
            Characteristic::DeviceVersion => 0x8a7f1168_48af_4efb_83b5_e679f932ff01,
            Characteristic::BrokerEndpoint => 0x8a7f1168_48af_4efb_83b5_e679f932ff02,
            Characteristic::DeviceMtu => 0x8a7f1168_48af_4efb_83b5_e679f932ff03,
            Characteristic::DevicePlatform => 0x8a7f1168_48af_4efb_83b5_e679f932ff04,
            Characteristic::DeviceId => 0x8a7f1168_48af_4efb_83b5_e679f932ff05,
            Characteristic::NetworkControl => 0xa9d7166a_d72e_40a9_a002_48044cc30101,
            Characteristic::NetworkTx => 0xa9d7166a_d72e_40a9_a002_48044cc30102,
            Characteristic::NetworkRx => 0xa9d7166a_d72e_40a9_a002_48044cc30103,
            Characteristic::NetworkTxLarge => 0xa9d7166a_d72e_40a9_a002_48044cc30104,
            Characteristic::NetworkRxLarge => 0xa9d7166a_d72e_40a9_a002_48044cc30105,
            Characteristic::MqttControl => 0xa9d7166a_d72e_40a9_a002_48044cc30001,
            Characteristic::MqttTx => 0xa9d7166a_d72e_40a9_a002_48044cc30002,
            Characteristic::MqttRx => 0xa9d7166a_d72e_40a9_a002_48044cc30003,
            Characteristic::MqttTxLarge => 0xa9d7166a_d72e_40a9_a002_48044cc30004,
            Characteristic::MqttRxLarge => 0xa9d7166a_d72e_40a9_a002_48044cc30005,
        };
        Uuid::from_u128(value)
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        ALL_CHARACTERISTICS.into_iter().find(|c| c.uuid() == uuid)
    }

    pub fn service(self) -> Service {
        match self {
            Characteristic::DeviceVersion
            | Characteristic::BrokerEndpoint
            | Characteristic::DeviceMtu
            | Characteristic::DevicePlatform
            | Characteristic::DeviceId => Service::DeviceInfo,
            Characteristic::NetworkControl
            | Characteristic::NetworkTx
            | Characteristic::NetworkRx
            | Characteristic::NetworkTxLarge
            | Characteristic::NetworkRxLarge => Service::NetworkConfig,
            Characteristic::MqttControl
            | Characteristic::MqttTx
            | Characteristic::MqttRx
            | Characteristic::MqttTxLarge
            | Characteristic::MqttRxLarge => Service::MqttProxy,
        }
    }
}

/// Traffic class. Each has its own command lane and reassembly buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    NetworkConfig,
    MqttProxy,
}

impl Lane {
    /// Commands on the MQTT proxy service use the MQTT lane; everything
    /// else, including device-info reads, uses the network lane.
    pub fn for_service(service: Service) -> Self {
        match service {
            Service::MqttProxy => Lane::MqttProxy,
            Service::NetworkConfig | Service::DeviceInfo => Lane::NetworkConfig,
        }
    }

    pub fn service(self) -> Service {
        match self {
            Lane::NetworkConfig => Service::NetworkConfig,
            Lane::MqttProxy => Service::MqttProxy,
        }
    }

    pub fn control(self) -> Characteristic {
        match self {
            Lane::NetworkConfig => Characteristic::NetworkControl,
            Lane::MqttProxy => Characteristic::MqttControl,
        }
    }

    /// Device to host, complete messages.
    pub fn tx(self) -> Characteristic {
        match self {
            Lane::NetworkConfig => Characteristic::NetworkTx,
            Lane::MqttProxy => Characteristic::MqttTx,
        }
    }

    /// Device to host, chunked messages.
    pub fn tx_large(self) -> Characteristic {
        match self {
            Lane::NetworkConfig => Characteristic::NetworkTxLarge,
            Lane::MqttProxy => Characteristic::MqttTxLarge,
        }
    }

    /// Host to device, complete messages.
    pub fn rx(self) -> Characteristic {
        match self {
            Lane::NetworkConfig => Characteristic::NetworkRx,
            Lane::MqttProxy => Characteristic::MqttRx,
        }
    }

    /// Host to device, chunked messages.
    pub fn rx_large(self) -> Characteristic {
        match self {
            Lane::NetworkConfig => Characteristic::NetworkRxLarge,
            Lane::MqttProxy => Characteristic::MqttRxLarge,
        }
    }

    /// Lane whose TX or TX-large characteristic this is.
    pub fn for_inbound(characteristic: Characteristic) -> Option<(Self, bool)> {
        match characteristic {
            Characteristic::NetworkTx => Some((Lane::NetworkConfig, false)),
            Characteristic::NetworkTxLarge => Some((Lane::NetworkConfig, true)),
            Characteristic::MqttTx => Some((Lane::MqttProxy, false)),
            Characteristic::MqttTxLarge => Some((Lane::MqttProxy, true)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_lookup_round_trip() {
        for c in ALL_CHARACTERISTICS {
            assert_eq!(Characteristic::from_uuid(c.uuid()), Some(c));
        }
        assert_eq!(
            Service::from_uuid(Service::MqttProxy.uuid()),
            Some(Service::MqttProxy)
        );
        assert_eq!(Characteristic::from_uuid(CLIENT_CHARACTERISTIC_CONFIG), None);
    }

    #[test]
    fn test_uuid_strings() {
        assert_eq!(
            Characteristic::NetworkRxLarge.uuid().to_string(),
            "a9d7166a-d72e-40a9-a002-48044cc30105"
        );
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIG.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_lane_routing() {
        assert_eq!(Lane::for_service(Service::DeviceInfo), Lane::NetworkConfig);
        assert_eq!(Lane::for_service(Service::MqttProxy), Lane::MqttProxy);
        assert_eq!(Lane::MqttProxy.rx_large().service(), Service::MqttProxy);
        assert_eq!(
            Lane::for_inbound(Characteristic::NetworkTxLarge),
            Some((Lane::NetworkConfig, true))
        );
        assert_eq!(Lane::for_inbound(Characteristic::MqttRx), None);
    }
}
