//! GATT operations queued on a session's command lanes.

use crate::gatt::{Characteristic, Lane, Service};
use crate::transport::{Transport, TransportResult};

/// One GATT operation. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCommand {
    DiscoverServices,
    ReadCharacteristic(Characteristic),
    WriteCharacteristic {
        characteristic: Characteristic,
        value: Vec<u8>,
    },
    /// Enable notifications on `characteristic`.
    WriteDescriptor {
        characteristic: Characteristic,
        value: Vec<u8>,
    },
    RequestMtu(u16),
}

impl GattCommand {
    pub fn write(characteristic: Characteristic, value: impl Into<Vec<u8>>) -> Self {
        GattCommand::WriteCharacteristic {
            characteristic,
            value: value.into(),
        }
    }

    pub fn service(&self) -> Option<Service> {
        match self {
            GattCommand::ReadCharacteristic(c)
            | GattCommand::WriteCharacteristic { characteristic: c, .. }
            | GattCommand::WriteDescriptor { characteristic: c, .. } => Some(c.service()),
            GattCommand::DiscoverServices | GattCommand::RequestMtu(_) => None,
        }
    }

    /// Lane this command is queued on.
    pub fn lane(&self) -> Lane {
        self.service()
            .map(Lane::for_service)
            .unwrap_or(Lane::NetworkConfig)
    }

    /// Characteristic reads and writes block incoming notification handling
    /// until they complete.
    pub fn is_read_or_write(&self) -> bool {
        matches!(
            self,
            GattCommand::ReadCharacteristic(_) | GattCommand::WriteCharacteristic { .. }
        )
    }

    pub(crate) fn issue(&self, transport: &dyn Transport) -> TransportResult<()> {
        match self {
            GattCommand::DiscoverServices => transport.discover_services(),
            GattCommand::ReadCharacteristic(c) => transport.read_characteristic(*c),
            GattCommand::WriteCharacteristic {
                characteristic,
                value,
            } => transport.write_characteristic(*characteristic, value),
            GattCommand::WriteDescriptor {
                characteristic,
                value,
            } => transport.write_descriptor(*characteristic, value),
            GattCommand::RequestMtu(mtu) => transport.request_mtu(*mtu),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_assignment() {
        assert_eq!(GattCommand::DiscoverServices.lane(), Lane::NetworkConfig);
        assert_eq!(GattCommand::RequestMtu(185).lane(), Lane::NetworkConfig);
        assert_eq!(
            GattCommand::ReadCharacteristic(Characteristic::DeviceMtu).lane(),
            Lane::NetworkConfig
        );
        assert_eq!(
            GattCommand::write(Characteristic::MqttRxLarge, vec![1]).lane(),
            Lane::MqttProxy
        );
    }

    #[test]
    fn test_read_or_write() {
        assert!(GattCommand::ReadCharacteristic(Characteristic::MqttTxLarge).is_read_or_write());
        assert!(!GattCommand::WriteDescriptor {
            characteristic: Characteristic::MqttTx,
            value: vec![1, 0],
        }
        .is_read_or_write());
    }
}
