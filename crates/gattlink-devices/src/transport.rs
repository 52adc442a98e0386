//! BLE transport capability.
//!
//! The platform GATT stack sits behind [`Transport`]. Every operation is
//! fire-and-forget: a call only reports whether the stack accepted the
//! request, and its outcome arrives later as a [`TransportEvent`] delivered
//! to the owning session.

use crate::gatt::Characteristic;

/// Synchronous rejection of a transport request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Request rejected by the BLE stack: {0}")]
    Rejected(String),

    #[error("Characteristic not present on device: {0:?}")]
    MissingCharacteristic(Characteristic),

    #[error("Transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Platform bonding state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondState {
    #[default]
    None,
    Bonding,
    Bonded,
}

/// Link-layer connection state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// GATT-level status of a completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure(u16),
}

impl GattStatus {
    pub fn is_success(self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

/// Asynchronous outcomes and unsolicited notifications from the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStateChanged { status: GattStatus, state: LinkState },
    ServicesDiscovered { status: GattStatus },
    CharacteristicRead {
        characteristic: Characteristic,
        status: GattStatus,
        value: Vec<u8>,
    },
    /// Write acknowledgement carrying the value the stack wrote.
    CharacteristicWrite {
        characteristic: Characteristic,
        status: GattStatus,
        value: Vec<u8>,
    },
    /// Notification from the device.
    CharacteristicChanged {
        characteristic: Characteristic,
        value: Vec<u8>,
    },
    DescriptorWrite {
        characteristic: Characteristic,
        status: GattStatus,
    },
    MtuChanged { mtu: u16, status: GattStatus },
    BondStateChanged { previous: BondState, current: BondState },
}

/// One BLE link to one device.
///
/// Implementations must not call back into the session synchronously;
/// outcomes are delivered as events through the session handle.
pub trait Transport: Send + Sync {
    fn connect(&self) -> TransportResult<()>;

    fn disconnect(&self) -> TransportResult<()>;

    /// Release platform resources for the link.
    fn close(&self);

    fn bond_state(&self) -> BondState;

    fn discover_services(&self) -> TransportResult<()>;

    fn read_characteristic(&self, characteristic: Characteristic) -> TransportResult<()>;

    fn write_characteristic(
        &self,
        characteristic: Characteristic,
        value: &[u8],
    ) -> TransportResult<()>;

    /// Write the client characteristic configuration descriptor of
    /// `characteristic`, enabling notifications.
    fn write_descriptor(&self, characteristic: Characteristic, value: &[u8]) -> TransportResult<()>;

    fn request_mtu(&self, mtu: u16) -> TransportResult<()>;
}
