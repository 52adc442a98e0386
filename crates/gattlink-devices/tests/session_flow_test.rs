//! Session bring-up, scheduling and network-config flows over the mock
//! transport.

mod common;

use std::time::Duration;

use common::*;
use gattlink_core::ControlEncoding;
use gattlink_devices::codec::{
    ListNetworkRequest, NetworkMessage, ProxyControl, SaveNetworkRequest, ScannedNetwork,
    SecurityType,
};
use gattlink_devices::command::GattCommand;
use gattlink_devices::gatt::{DEFAULT_MTU, ENABLE_NOTIFICATION_VALUE};
use gattlink_devices::mock::TransportOp;
use gattlink_devices::session::SessionConfig;
use gattlink_devices::{
    BondState, Characteristic, ConnectionState, DeviceInfo, DeviceInfoError, GatewayEvent,
    GattStatus, NetworkConfigResponse, TransportEvent,
};
use tokio::test;

fn scanned(ssid: &str, rssi: i32, index: i32) -> ScannedNetwork {
    ScannedNetwork {
        status: 0,
        ssid: ssid.to_string(),
        bssid: vec![0x10, 0x20, 0x30, 0x40, 0x50, 0x60],
        security: SecurityType::Wpa2,
        hidden: false,
        rssi,
        connected: false,
        index,
    }
}

fn network(ssid: &str, rssi: i32, index: i32) -> Vec<u8> {
    NetworkMessage::ListResponse(scanned(ssid, rssi, index)).encode()
}

fn position(ops: &[TransportOp], op: &TransportOp) -> usize {
    ops.iter()
        .position(|o| o == op)
        .unwrap_or_else(|| panic!("{:?} not issued in {:?}", op, ops))
}

#[test]
async fn test_initialization_sequence() {
    let h = with_broker();
    let mut states = h.bus.subscribe_filtered(|e| matches!(e, GatewayEvent::ConnectionState { .. }));

    h.bring_up().await;
    let ops = h.transport.ops();

    assert_eq!(ops[0], TransportOp::Connect);
    assert_eq!(ops[1], TransportOp::DiscoverServices);
    assert_eq!(ops[2], TransportOp::Read(Characteristic::DeviceVersion));

    for characteristic in [
        Characteristic::MqttTx,
        Characteristic::MqttTxLarge,
        Characteristic::NetworkTx,
        Characteristic::NetworkTxLarge,
    ] {
        position(
            &ops,
            &TransportOp::WriteDescriptor(characteristic, ENABLE_NOTIFICATION_VALUE.to_vec()),
        );
    }
    position(&ops, &TransportOp::Read(Characteristic::DevicePlatform));
    position(&ops, &TransportOp::Read(Characteristic::DeviceId));

    let mtu_read = position(&ops, &TransportOp::Read(Characteristic::DeviceMtu));
    let mtu_request = position(&ops, &TransportOp::RequestMtu(MTU));
    let network_enable = position(&ops, &TransportOp::Write(Characteristic::NetworkControl, vec![1]));
    let mqtt_enable = position(&ops, &TransportOp::Write(Characteristic::MqttControl, vec![1]));
    assert!(mtu_read < mtu_request);
    assert!(mtu_request < network_enable);
    assert!(mtu_request < mqtt_enable);

    for expected in [
        ConnectionState::Connected,
        ConnectionState::Initializing,
        ConnectionState::Initialized,
    ] {
        match states.recv().await.unwrap().0 {
            GatewayEvent::ConnectionState { state, .. } => assert_eq!(state, expected),
            other => panic!("unexpected event {:?}", other),
        }
    }

    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.mtu, Some(MTU));
    assert_eq!(snapshot.metadata.version, VERSION);
    assert_eq!(snapshot.metadata.platform, PLATFORM);
    assert_eq!(snapshot.metadata.device_id, THING);
}

#[test]
async fn test_mqtt_proxy_not_enabled_without_broker() {
    let h = without_broker();
    h.bring_up().await;

    let ops = h.transport.ops();
    assert!(ops.contains(&TransportOp::Write(Characteristic::NetworkControl, vec![1])));
    assert!(!ops
        .iter()
        .any(|op| matches!(op, TransportOp::Write(Characteristic::MqttControl, _))));
}

#[test]
async fn test_cbor_control_encoding() {
    let config = SessionConfig {
        control_encoding: ControlEncoding::Cbor,
        ..SessionConfig::default()
    };
    let h = spawn(None, config);
    h.bring_up().await;

    let expected = ProxyControl { enabled: true }.encode();
    assert!(h
        .transport
        .ops()
        .contains(&TransportOp::Write(Characteristic::NetworkControl, expected)));
}

#[test]
async fn test_bonding_defers_discovery() {
    let h = without_broker();
    h.transport.set_bond_state(BondState::Bonding);
    h.handle.connect().unwrap();
    h.link_up();

    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert_eq!(h.transport.ops(), vec![TransportOp::Connect]);

    h.transport.set_bond_state(BondState::Bonded);
    h.send(TransportEvent::BondStateChanged {
        previous: BondState::Bonding,
        current: BondState::Bonded,
    });
    h.drive().await;

    assert_eq!(h.transport.ops()[1], TransportOp::DiscoverServices);
    assert_eq!(h.snapshot().await.connection, ConnectionState::Initialized);
}

#[test]
async fn test_device_info_events() {
    let h = without_broker();
    let mut info = h.bus.subscribe_filtered(|e| matches!(e, GatewayEvent::DeviceInfo { .. }));
    h.bring_up().await;

    h.handle.get_broker_endpoint().unwrap();
    h.drive().await;

    let mut seen = Vec::new();
    while let Some((event, _)) = info.try_recv() {
        if let GatewayEvent::DeviceInfo { info, .. } = event {
            seen.push(info);
        }
    }
    assert_eq!(
        seen,
        vec![
            DeviceInfo::Version(VERSION.to_string()),
            DeviceInfo::Mtu(MTU),
            DeviceInfo::BrokerEndpoint(ENDPOINT.to_string()),
        ]
    );
}

#[test]
async fn test_device_info_while_disconnected() {
    let h = without_broker();
    let mut errors = h.bus.subscribe();

    h.handle.get_mtu().unwrap();
    match errors.recv().await.unwrap().0 {
        GatewayEvent::DeviceInfoError { error, .. } => {
            assert_eq!(error, DeviceInfoError::Disconnected)
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(h.transport.ops().is_empty());
}

#[test]
async fn test_buffered_list_responses_saved_first() {
    let h = without_broker();
    h.bring_up().await;
    let mut responses = h.bus.subscribe_filtered(GatewayEvent::is_network_config);

    h.handle
        .list_networks(ListNetworkRequest {
            max_networks: 10,
            timeout_secs: 5,
        })
        .unwrap();
    let request = h.in_flight_write(Characteristic::NetworkRx).await;
    assert!(matches!(
        NetworkMessage::decode(&request),
        Ok(NetworkMessage::ListRequest(_))
    ));

    // Both arrive while the request write is unacknowledged.
    h.notify(Characteristic::NetworkTx, network("cafe", -40, -1));
    h.notify(Characteristic::NetworkTx, network("home", -70, 0));
    assert_eq!(h.snapshot().await.buffered_notifications, 2);

    h.drive().await;

    let mut ssids = Vec::new();
    for _ in 0..2 {
        match responses.recv().await.unwrap().0 {
            GatewayEvent::NetworkConfig {
                response: NetworkConfigResponse::Network(n),
                ..
            } => ssids.push(n.ssid),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(ssids, vec!["home", "cafe"]);
    assert_eq!(h.snapshot().await.buffered_notifications, 0);
}

#[test]
async fn test_large_network_response_is_read_in_chunks() {
    let h = without_broker();
    h.bring_up().await;
    let mut responses = h.bus.subscribe_filtered(GatewayEvent::is_network_config);

    let ssid = "x".repeat(32);
    let mut large = scanned(&ssid, -55, -1);
    large.bssid = vec![0xab; 200];
    let bytes = NetworkMessage::ListResponse(large).encode();
    let max = usize::from(MTU) - 3;
    assert!(bytes.len() > max);

    h.notify(Characteristic::NetworkTxLarge, bytes[..max].to_vec());
    let snapshot = h.wait_for(|s| s.scheduler.in_flight.is_some()).await;
    assert_eq!(
        snapshot.scheduler.in_flight,
        Some(GattCommand::ReadCharacteristic(Characteristic::NetworkTxLarge))
    );

    h.send(TransportEvent::CharacteristicRead {
        characteristic: Characteristic::NetworkTxLarge,
        status: GattStatus::Success,
        value: bytes[max..].to_vec(),
    });

    match responses.recv().await.unwrap().0 {
        GatewayEvent::NetworkConfig {
            response: NetworkConfigResponse::Network(n),
            ..
        } => {
            assert_eq!(n.ssid, ssid);
            assert_eq!(n.bssid.len(), 200);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
async fn test_write_echo_mismatch_stalls_until_link_reset() {
    let config = SessionConfig {
        auto_reconnect: true,
        ..SessionConfig::default()
    };
    let h = spawn(None, config);
    h.bring_up().await;

    h.handle
        .list_networks(ListNetworkRequest {
            max_networks: 4,
            timeout_secs: 2,
        })
        .unwrap();
    h.in_flight_write(Characteristic::NetworkRx).await;
    h.handle.get_device_version().unwrap();
    let before = h.transport.ops().len();

    h.send(TransportEvent::CharacteristicWrite {
        characteristic: Characteristic::NetworkRx,
        status: GattStatus::Success,
        value: vec![0xde, 0xad],
    });

    let snapshot = h.snapshot().await;
    assert!(snapshot.scheduler.stalled);
    assert_eq!(snapshot.scheduler.network_depth, 1);
    assert_eq!(h.transport.ops().len(), before);

    h.link_down();
    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Disconnected);
    assert!(!snapshot.scheduler.stalled);
    assert_eq!(snapshot.scheduler.network_depth, 0);
    assert_eq!(snapshot.mtu, None);
    assert_eq!(h.transport.last_op(), Some(TransportOp::Connect));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_advances_to_next_command() {
    let h = without_broker();
    h.bring_up().await;

    h.handle.get_broker_endpoint().unwrap();
    h.handle.get_device_version().unwrap();
    let snapshot = h.snapshot().await;
    assert_eq!(
        snapshot.scheduler.in_flight,
        Some(GattCommand::ReadCharacteristic(Characteristic::BrokerEndpoint))
    );
    assert_eq!(snapshot.scheduler.network_depth, 1);

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    assert_eq!(
        h.snapshot().await.scheduler.in_flight,
        Some(GattCommand::ReadCharacteristic(Characteristic::DeviceVersion))
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_rearms_while_bonding() {
    let h = without_broker();
    h.bring_up().await;

    h.transport.set_bond_state(BondState::Bonding);
    h.handle.get_broker_endpoint().unwrap();

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    assert_eq!(
        h.snapshot().await.scheduler.in_flight,
        Some(GattCommand::ReadCharacteristic(Characteristic::BrokerEndpoint))
    );

    h.transport.set_bond_state(BondState::Bonded);
    tokio::time::sleep(Duration::from_millis(3_100)).await;
    assert_eq!(h.snapshot().await.scheduler.in_flight, None);
}

#[test]
async fn test_rejected_command_advances_queue() {
    let h = without_broker();
    h.bring_up().await;

    h.transport.reject(TransportOp::Read(Characteristic::BrokerEndpoint));
    h.handle.get_broker_endpoint().unwrap();
    h.handle.get_device_version().unwrap();

    assert_eq!(
        h.snapshot().await.scheduler.in_flight,
        Some(GattCommand::ReadCharacteristic(Characteristic::DeviceVersion))
    );
}

#[test]
async fn test_user_disconnect_ends_session() {
    let h = without_broker();
    h.bring_up().await;

    h.handle.disconnect().unwrap();
    assert_eq!(h.snapshot().await.connection, ConnectionState::Disconnecting);
    assert_eq!(h.transport.last_op(), Some(TransportOp::Disconnect));

    h.link_down();
    while !h.handle.is_closed() {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.transport.last_op(), Some(TransportOp::Close));
    assert!(h.handle.get_mtu().is_err());
}

#[test]
async fn test_failed_mtu_negotiation_uses_link_mtu() {
    let h = without_broker();
    h.handle.connect().unwrap();
    h.link_up();
    loop {
        match h.snapshot().await.scheduler.in_flight {
            Some(GattCommand::RequestMtu(requested)) => {
                assert_eq!(requested, MTU);
                break;
            }
            Some(_) => {
                h.answer().await;
            }
            None => panic!("MTU was never requested"),
        }
    }

    h.send(TransportEvent::MtuChanged {
        mtu: DEFAULT_MTU,
        status: GattStatus::Failure(4),
    });
    h.drive().await;
    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Initialized);
    assert_eq!(snapshot.mtu, Some(DEFAULT_MTU));

    // Would fit a single write at the device's preferred MTU.
    h.handle
        .save_network(SaveNetworkRequest {
            index: -1,
            ssid: "s".repeat(20),
            bssid: Vec::new(),
            psk: "p".repeat(20),
            security: SecurityType::Wpa2,
        })
        .unwrap();
    let chunk = h.in_flight_write(Characteristic::NetworkRxLarge).await;
    assert_eq!(chunk.len(), usize::from(DEFAULT_MTU) - 3);
}

#[test]
async fn test_disconnect_drops_queued_commands() {
    let h = without_broker();
    h.bring_up().await;

    h.handle.get_broker_endpoint().unwrap();
    h.handle.get_device_version().unwrap();
    h.handle.get_mtu().unwrap();
    h.handle.disconnect().unwrap();

    let snapshot = h.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Disconnecting);
    assert_eq!(snapshot.scheduler.network_depth + snapshot.scheduler.mqtt_depth, 0);
    assert_eq!(h.transport.last_op(), Some(TransportOp::Disconnect));

    // The read issued before the request still completes, and nothing follows.
    assert_eq!(
        h.answer().await,
        Some(GattCommand::ReadCharacteristic(Characteristic::BrokerEndpoint))
    );
    assert_eq!(h.snapshot().await.scheduler.in_flight, None);
    assert_eq!(h.transport.last_op(), Some(TransportOp::Disconnect));
}
