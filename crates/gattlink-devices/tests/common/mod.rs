//! Shared harness: a session over the mock transport, driven by a test
//! that plays the part of a well-behaved device.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gattlink_devices::command::GattCommand;
use gattlink_devices::mock::{MockBrokerConnector, MockTransport};
use gattlink_devices::session::{self, SessionConfig, SessionHandle, SessionSnapshot};
use gattlink_devices::{
    BrokerConnector, Characteristic, ConnectionState, DeviceId, GatewayEventBus, GattStatus,
    LinkState, TransportEvent,
};

pub const DEVICE: &str = "AA:BB:CC:DD:EE:FF";
pub const VERSION: &str = "1.2.0";
pub const PLATFORM: &str = "esp32";
pub const THING: &str = "thing-42";
pub const ENDPOINT: &str = "a.iot.example.com";
pub const MTU: u16 = 185;

pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub handle: SessionHandle,
    pub bus: GatewayEventBus,
    pub broker: MockBrokerConnector,
}

pub fn spawn(broker: Option<MockBrokerConnector>, config: SessionConfig) -> Harness {
    let transport = MockTransport::shared();
    let bus = GatewayEventBus::new();
    let connector = broker
        .clone()
        .map(|b| Arc::new(b) as Arc<dyn BrokerConnector>);
    let handle = session::spawn(
        DeviceId::from(DEVICE),
        transport.clone(),
        connector,
        bus.clone(),
        config,
    );
    Harness {
        transport,
        handle,
        bus,
        broker: broker.unwrap_or_default(),
    }
}

pub fn with_broker() -> Harness {
    spawn(Some(MockBrokerConnector::auto_connecting()), SessionConfig::default())
}

pub fn without_broker() -> Harness {
    spawn(None, SessionConfig::default())
}

impl Harness {
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.handle.snapshot().await.expect("session ended")
    }

    pub fn send(&self, event: TransportEvent) {
        self.handle.transport_event(event).expect("session ended");
    }

    pub fn link_up(&self) {
        self.send(TransportEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            state: LinkState::Connected,
        });
    }

    pub fn link_down(&self) {
        self.send(TransportEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            state: LinkState::Disconnected,
        });
    }

    pub fn notify(&self, characteristic: Characteristic, value: Vec<u8>) {
        self.send(TransportEvent::CharacteristicChanged {
            characteristic,
            value,
        });
    }

    /// Complete the in-flight command successfully. Returns the command,
    /// or `None` if nothing was in flight.
    pub async fn answer(&self) -> Option<GattCommand> {
        let command = self.snapshot().await.scheduler.in_flight?;
        let event = match &command {
            GattCommand::DiscoverServices => TransportEvent::ServicesDiscovered {
                status: GattStatus::Success,
            },
            GattCommand::ReadCharacteristic(characteristic) => {
                let value = match characteristic {
                    Characteristic::DeviceVersion => VERSION.to_string(),
                    Characteristic::DevicePlatform => PLATFORM.to_string(),
                    Characteristic::DeviceId => THING.to_string(),
                    Characteristic::DeviceMtu => MTU.to_string(),
                    Characteristic::BrokerEndpoint => ENDPOINT.to_string(),
                    other => panic!("no canned value for {:?}", other),
                };
                TransportEvent::CharacteristicRead {
                    characteristic: *characteristic,
                    status: GattStatus::Success,
                    value: value.into_bytes(),
                }
            }
            GattCommand::WriteCharacteristic {
                characteristic,
                value,
            } => TransportEvent::CharacteristicWrite {
                characteristic: *characteristic,
                status: GattStatus::Success,
                value: value.clone(),
            },
            GattCommand::WriteDescriptor { characteristic, .. } => TransportEvent::DescriptorWrite {
                characteristic: *characteristic,
                status: GattStatus::Success,
            },
            GattCommand::RequestMtu(mtu) => TransportEvent::MtuChanged {
                mtu: *mtu,
                status: GattStatus::Success,
            },
        };
        self.send(event);
        Some(command)
    }

    /// Answer commands until the scheduler is idle.
    pub async fn drive(&self) -> Vec<GattCommand> {
        let mut answered = Vec::new();
        for _ in 0..100 {
            match self.answer().await {
                Some(command) => answered.push(command),
                None => return answered,
            }
        }
        panic!("scheduler never went idle: {:?}", answered);
    }

    /// Connect and run the full initialization sequence.
    pub async fn bring_up(&self) -> Vec<GattCommand> {
        self.handle.connect().expect("session ended");
        self.link_up();
        let answered = self.drive().await;
        assert_eq!(self.snapshot().await.connection, ConnectionState::Initialized);
        answered
    }

    /// Poll until `predicate` holds.
    pub async fn wait_for(&self, predicate: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
        for _ in 0..400 {
            let snapshot = self.snapshot().await;
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached: {:?}", self.snapshot().await);
    }

    /// Wait for a write to `characteristic` to be in flight and return its
    /// value.
    pub async fn in_flight_write(&self, characteristic: Characteristic) -> Vec<u8> {
        let snapshot = self
            .wait_for(|s| {
                matches!(
                    &s.scheduler.in_flight,
                    Some(GattCommand::WriteCharacteristic { characteristic: c, .. }) if *c == characteristic
                )
            })
            .await;
        match snapshot.scheduler.in_flight {
            Some(GattCommand::WriteCharacteristic { value, .. }) => value,
            _ => unreachable!(),
        }
    }
}
