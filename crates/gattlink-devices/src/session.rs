//! Per-device session actor.
//!
//! Each device gets one task that owns its transport, scheduler,
//! connection machine, reassembly buffers and MQTT bridge. Transport
//! callbacks, app requests and broker events are all funnelled into that
//! task, so protocol state for one device is never touched concurrently.
//! Sessions for different devices share nothing but the event bus.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use gattlink_core::{ControlEncoding, GatewayConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bridge::{decode_batch, BridgeOutput, MqttBridge, NetworkRequest};
use crate::broker::{BrokerConnector, BrokerEvent, MqttSessionState};
use crate::codec::{MqttMessage, ProxyControl};
use crate::command::GattCommand;
use crate::connection::{ConnectionAction, ConnectionInput, ConnectionMachine, ConnectionState};
use crate::event::{DeviceInfo, DeviceInfoError, GatewayEvent, GatewayEventBus};
use crate::fragment::{self, Outbound, Reassembler, Reassembly};
use crate::gatt::{Characteristic, Lane, DEFAULT_MTU, ENABLE_NOTIFICATION_VALUE};
use crate::scheduler::{CommandScheduler, SchedulerSnapshot, TimeoutOutcome, WriteAck};
use crate::transport::{BondState, GattStatus, LinkState, Transport, TransportEvent};
use crate::DeviceId;

const EVENT_SOURCE: &str = "session";
const UNKNOWN_METADATA: &str = "NA";

/// Per-session settings taken from the gateway configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub command_timeout: Duration,
    pub suback_delay: Duration,
    pub control_encoding: ControlEncoding,
    pub auto_reconnect: bool,
}

impl SessionConfig {
    pub fn from_gateway(config: &GatewayConfig, auto_reconnect: bool) -> Self {
        Self {
            command_timeout: config.scheduler.command_timeout(),
            suback_delay: config.mqtt.suback_delay(),
            control_encoding: config.mqtt.control_encoding,
            auto_reconnect,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_gateway(&GatewayConfig::default(), false)
    }
}

/// Metadata read from the device-information service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub version: String,
    pub platform: String,
    pub device_id: String,
}

impl Default for DeviceMetadata {
    fn default() -> Self {
        Self {
            version: UNKNOWN_METADATA.to_string(),
            platform: UNKNOWN_METADATA.to_string(),
            device_id: UNKNOWN_METADATA.to_string(),
        }
    }
}

impl DeviceMetadata {
    /// Key/value pairs attached to the broker connection.
    pub fn broker_metadata(&self) -> Vec<(String, String)> {
        vec![
            ("Gateway".to_string(), env!("CARGO_PKG_NAME").to_string()),
            ("FirmwareVersion".to_string(), self.version.clone()),
            ("Platform".to_string(), self.platform.clone()),
            ("DeviceId".to_string(), self.device_id.clone()),
        ]
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub device_id: DeviceId,
    pub connection: ConnectionState,
    pub mqtt: MqttSessionState,
    /// MTU last reported by the link, if any.
    pub mtu: Option<u16>,
    pub scheduler: SchedulerSnapshot,
    pub metadata: DeviceMetadata,
    /// Notifications waiting for the in-flight read or write.
    pub buffered_notifications: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session for device {0} has ended")]
    Closed(DeviceId),
}

/// Device-information characteristic the app can query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoQuery {
    Mtu,
    BrokerEndpoint,
    Version,
}

impl InfoQuery {
    fn characteristic(self) -> Characteristic {
        match self {
            InfoQuery::Mtu => Characteristic::DeviceMtu,
            InfoQuery::BrokerEndpoint => Characteristic::BrokerEndpoint,
            InfoQuery::Version => Characteristic::DeviceVersion,
        }
    }
}

#[derive(Debug)]
enum SessionRequest {
    Connect,
    Disconnect,
    Network(NetworkRequest),
    DeviceInfo(InfoQuery),
    SetMqttProxy(bool),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

#[derive(Debug)]
enum SessionEvent {
    Transport(TransportEvent),
    Request(SessionRequest),
    /// A reply to the device whose delay has elapsed, for the link it was
    /// produced on.
    Delayed { link: u64, message: MqttMessage },
}

/// Cloneable handle to a running session.
///
/// The platform layer feeds transport callbacks through
/// [`SessionHandle::transport_event`]; apps issue requests through the
/// other methods and observe results on the event bus.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    device_id: DeviceId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Whether the session task has ended.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.tx
            .send(event)
            .map_err(|_| SessionError::Closed(self.device_id.clone()))
    }

    fn request(&self, request: SessionRequest) -> Result<(), SessionError> {
        self.send(SessionEvent::Request(request))
    }

    /// Deliver a transport callback to the session.
    pub fn transport_event(&self, event: TransportEvent) -> Result<(), SessionError> {
        self.send(SessionEvent::Transport(event))
    }

    pub fn connect(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::Connect)
    }

    /// Disconnect the link without reconnecting. The session ends once the
    /// link is down.
    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::Disconnect)
    }

    pub fn list_networks(&self, request: crate::codec::ListNetworkRequest) -> Result<(), SessionError> {
        self.request(SessionRequest::Network(NetworkRequest::List(request)))
    }

    pub fn save_network(&self, request: crate::codec::SaveNetworkRequest) -> Result<(), SessionError> {
        self.request(SessionRequest::Network(NetworkRequest::Save(request)))
    }

    pub fn edit_network(&self, request: crate::codec::EditNetworkRequest) -> Result<(), SessionError> {
        self.request(SessionRequest::Network(NetworkRequest::Edit(request)))
    }

    pub fn delete_network(
        &self,
        request: crate::codec::DeleteNetworkRequest,
    ) -> Result<(), SessionError> {
        self.request(SessionRequest::Network(NetworkRequest::Delete(request)))
    }

    pub fn get_mtu(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::DeviceInfo(InfoQuery::Mtu))
    }

    pub fn get_broker_endpoint(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::DeviceInfo(InfoQuery::BrokerEndpoint))
    }

    pub fn get_device_version(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::DeviceInfo(InfoQuery::Version))
    }

    /// Turn the device's MQTT proxy on or off.
    pub fn set_mqtt_proxy(&self, enabled: bool) -> Result<(), SessionError> {
        self.request(SessionRequest::SetMqttProxy(enabled))
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.request(SessionRequest::Snapshot(tx))?;
        rx.await
            .map_err(|_| SessionError::Closed(self.device_id.clone()))
    }
}

/// Complete inbound messages gathered while handling one transport event,
/// in arrival order per lane.
#[derive(Debug, Default)]
struct InboundBatch {
    network: Vec<Vec<u8>>,
    mqtt: Vec<Vec<u8>>,
}

impl InboundBatch {
    fn push(&mut self, lane: Lane, message: Vec<u8>) {
        match lane {
            Lane::NetworkConfig => self.network.push(message),
            Lane::MqttProxy => self.mqtt.push(message),
        }
    }
}

/// Spawn a session task for `device_id` and return its handle.
///
/// The session starts disconnected; call [`SessionHandle::connect`] to
/// bring the link up.
pub fn spawn(
    device_id: DeviceId,
    transport: Arc<dyn Transport>,
    connector: Option<Arc<dyn BrokerConnector>>,
    event_bus: GatewayEventBus,
    config: SessionConfig,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = DeviceSession {
        device_id: device_id.clone(),
        transport,
        scheduler: CommandScheduler::new(config.command_timeout),
        machine: ConnectionMachine::new(config.auto_reconnect),
        mqtt: MqttBridge::new(device_id.clone(), connector, config.suback_delay),
        reassembler: Reassembler::new(),
        incoming: VecDeque::new(),
        mtu: None,
        link: 0,
        metadata: DeviceMetadata::default(),
        control_encoding: config.control_encoding,
        event_bus,
        delayed_tx: tx.downgrade(),
        events: rx,
        finished: false,
    };
    tokio::spawn(session.run());
    SessionHandle { device_id, tx }
}

struct DeviceSession {
    device_id: DeviceId,
    transport: Arc<dyn Transport>,
    scheduler: CommandScheduler,
    machine: ConnectionMachine,
    mqtt: MqttBridge,
    reassembler: Reassembler,
    /// Notifications received while a read or write was in flight.
    incoming: VecDeque<(Characteristic, Vec<u8>)>,
    mtu: Option<u16>,
    /// Bumped on every link reset.
    link: u64,
    metadata: DeviceMetadata,
    control_encoding: ControlEncoding,
    event_bus: GatewayEventBus,
    delayed_tx: mpsc::WeakUnboundedSender<SessionEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    finished: bool,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl DeviceSession {
    async fn run(mut self) {
        info!(device = %self.device_id, "Session started");
        while !self.finished {
            let deadline = self.scheduler.deadline();
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!(device = %self.device_id, "All handles dropped");
                        let mut out = Vec::new();
                        self.mqtt.disconnect_broker(&mut out).await;
                        self.transport.close();
                        break;
                    }
                },
                Some(event) = self.mqtt.next_event() => self.on_broker_event(event).await,
                _ = wait_until(deadline) => self.on_command_timeout().await,
            }
        }
        info!(device = %self.device_id, "Session ended");
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Transport(event) => self.on_transport_event(event).await,
            SessionEvent::Request(request) => self.on_request(request).await,
            SessionEvent::Delayed { link, message } if link == self.link => self.send_mqtt(message),
            SessionEvent::Delayed { message, .. } => {
                debug!(device = %self.device_id, message = message.name(), "Dropping delayed reply from a previous link");
            }
        }
    }

    fn publish(&self, event: GatewayEvent) {
        self.event_bus.publish_with_source(event, EVENT_SOURCE);
    }

    fn max_payload(&self) -> usize {
        fragment::max_payload(self.mtu.unwrap_or(DEFAULT_MTU))
    }

    fn is_bonding(&self) -> bool {
        self.transport.bond_state() == BondState::Bonding
    }

    /// Queue a GATT command if the link can carry it.
    fn queue(&self, command: GattCommand) -> bool {
        if !self.machine.state().is_link_up() {
            debug!(device = %self.device_id, ?command, state = ?self.machine.state(), "Link not up, dropping command");
            return false;
        }
        self.scheduler.submit_routed(command, self.transport.as_ref());
        true
    }

    /// Queue an encoded message on `lane`, chunked if it exceeds the MTU.
    fn queue_message(&self, lane: Lane, bytes: &[u8]) {
        match fragment::split(bytes, self.max_payload()) {
            Outbound::Single(bytes) => {
                self.queue(GattCommand::write(lane.rx(), bytes));
            }
            Outbound::Chunked(chunks) => {
                debug!(device = %self.device_id, ?lane, len = bytes.len(), chunks = chunks.len(), "Sending large message");
                for chunk in chunks {
                    if !self.queue(GattCommand::write(lane.rx_large(), chunk)) {
                        break;
                    }
                }
            }
        }
    }

    fn send_mqtt(&self, message: MqttMessage) {
        debug!(device = %self.device_id, message = message.name(), "MQTT proxy message to device");
        self.queue_message(Lane::MqttProxy, &message.encode());
    }

    fn control_value(&self, enabled: bool) -> Vec<u8> {
        match self.control_encoding {
            ControlEncoding::Raw => vec![u8::from(enabled)],
            ControlEncoding::Cbor => ProxyControl { enabled }.encode(),
        }
    }

    // ---- app requests ----

    async fn on_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Connect => {
                let actions = self.machine.handle(ConnectionInput::ConnectRequested);
                self.apply(actions).await;
            }
            SessionRequest::Disconnect => {
                let actions = self.machine.handle(ConnectionInput::DisconnectRequested);
                self.apply(actions).await;
            }
            SessionRequest::Network(request) => {
                if !self.machine.state().is_link_up() {
                    warn!(device = %self.device_id, ?request, "Link not up, dropping network request");
                    return;
                }
                debug!(device = %self.device_id, ?request, "Network config request");
                self.queue_message(Lane::NetworkConfig, &request.encode());
            }
            SessionRequest::DeviceInfo(query) => {
                if !self.queue(GattCommand::ReadCharacteristic(query.characteristic())) {
                    warn!(device = %self.device_id, ?query, "Device info requested while disconnected");
                    self.publish(GatewayEvent::DeviceInfoError {
                        device_id: self.device_id.clone(),
                        error: DeviceInfoError::Disconnected,
                    });
                }
            }
            SessionRequest::SetMqttProxy(enabled) => {
                info!(device = %self.device_id, enabled, "Setting MQTT proxy");
                let value = self.control_value(enabled);
                self.queue(GattCommand::write(Characteristic::MqttControl, value));
            }
            SessionRequest::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device_id: self.device_id.clone(),
            connection: self.machine.state(),
            mqtt: self.mqtt.state(),
            mtu: self.mtu,
            scheduler: self.scheduler.snapshot(),
            metadata: self.metadata.clone(),
            buffered_notifications: self.incoming.len(),
        }
    }

    // ---- connection machine ----

    async fn apply(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::Connect | ConnectionAction::Reconnect => {
                    info!(device = %self.device_id, reconnect = action == ConnectionAction::Reconnect, "Connecting");
                    if let Err(e) = self.transport.connect() {
                        warn!(device = %self.device_id, error = %e, "Connect rejected");
                    }
                }
                ConnectionAction::Disconnect => {
                    if let Err(e) = self.transport.disconnect() {
                        warn!(device = %self.device_id, error = %e, "Disconnect rejected");
                    }
                }
                ConnectionAction::Notify(state) => {
                    info!(device = %self.device_id, ?state, "Connection state");
                    self.publish(GatewayEvent::ConnectionState {
                        device_id: self.device_id.clone(),
                        state,
                    });
                }
                ConnectionAction::DiscoverServices => {
                    self.queue(GattCommand::DiscoverServices);
                }
                ConnectionAction::Probe => {
                    self.queue(GattCommand::ReadCharacteristic(Characteristic::DeviceVersion));
                }
                ConnectionAction::Initialize => self.initialize(),
                ConnectionAction::EnableServices => self.enable_services(),
                ConnectionAction::DisconnectBroker => {
                    let out = self.mqtt.reset().await;
                    self.apply_bridge_outputs(out);
                }
                ConnectionAction::HaltCommands => self.scheduler.halt(),
                ConnectionAction::ResetSession => {
                    self.scheduler.reset();
                    self.reassembler.clear();
                    self.incoming.clear();
                    self.mtu = None;
                    self.link += 1;
                }
                ConnectionAction::Close => {
                    self.transport.close();
                    self.finished = true;
                }
            }
        }
    }

    fn initialize(&self) {
        for characteristic in [
            Characteristic::DevicePlatform,
            Characteristic::DeviceId,
            Characteristic::DeviceMtu,
        ] {
            self.queue(GattCommand::ReadCharacteristic(characteristic));
        }
        for characteristic in [
            Characteristic::MqttTx,
            Characteristic::MqttTxLarge,
            Characteristic::NetworkTx,
            Characteristic::NetworkTxLarge,
        ] {
            self.queue(GattCommand::WriteDescriptor {
                characteristic,
                value: ENABLE_NOTIFICATION_VALUE.to_vec(),
            });
        }
    }

    fn enable_services(&self) {
        info!(device = %self.device_id, "Enabling network config");
        self.queue(GattCommand::write(
            Characteristic::NetworkControl,
            self.control_value(true),
        ));
        if self.mqtt.has_connector() {
            info!(device = %self.device_id, "Enabling MQTT proxy");
            self.queue(GattCommand::write(
                Characteristic::MqttControl,
                self.control_value(true),
            ));
        }
    }

    // ---- transport callbacks ----

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionStateChanged { status, state } => match state {
                LinkState::Connected if status.is_success() => {
                    let bonding = self.is_bonding();
                    let actions = self.machine.handle(ConnectionInput::LinkUp { bonding });
                    self.apply(actions).await;
                }
                LinkState::Connected => {
                    warn!(device = %self.device_id, ?status, "Link reported connected with failure status");
                }
                LinkState::Disconnected => {
                    if status != GattStatus::Success {
                        warn!(device = %self.device_id, ?status, "Link dropped");
                    }
                    let actions = self.machine.handle(ConnectionInput::LinkDown);
                    self.apply(actions).await;
                }
            },
            TransportEvent::BondStateChanged { previous, current } => {
                debug!(device = %self.device_id, ?previous, ?current, "Bond state change");
                let actions = self
                    .machine
                    .handle(ConnectionInput::BondStateChanged { previous, current });
                self.apply(actions).await;
            }
            TransportEvent::ServicesDiscovered { status } => {
                let bonding = self.is_bonding();
                let actions = self.machine.handle(ConnectionInput::ServicesDiscovered {
                    success: status.is_success(),
                    bonding,
                });
                self.apply(actions).await;
                self.scheduler.complete(self.transport.as_ref());
            }
            TransportEvent::CharacteristicRead {
                characteristic,
                status,
                value,
            } => self.on_read(characteristic, status, value).await,
            TransportEvent::CharacteristicWrite {
                characteristic,
                status,
                value,
            } => self.on_write(characteristic, status, value).await,
            TransportEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                self.incoming.push_back((characteristic, value));
                if self.scheduler.is_rw_in_progress() {
                    debug!(device = %self.device_id, ?characteristic, buffered = self.incoming.len(), "Buffering notification");
                    return;
                }
                let mut batch = InboundBatch::default();
                self.drain_incoming(&mut batch);
                self.deliver(batch).await;
            }
            TransportEvent::DescriptorWrite {
                characteristic,
                status,
            } => {
                if !status.is_success() {
                    warn!(device = %self.device_id, ?characteristic, ?status, "Enabling notifications failed");
                }
                self.scheduler.complete(self.transport.as_ref());
            }
            TransportEvent::MtuChanged { mtu, status } => {
                if status.is_success() {
                    info!(device = %self.device_id, mtu, "MTU changed");
                } else {
                    warn!(device = %self.device_id, mtu, ?status, "MTU request failed, using link MTU");
                }
                self.mtu = Some(mtu);
                let actions = self.machine.handle(ConnectionInput::MtuChanged);
                self.apply(actions).await;
                let requested = matches!(
                    self.scheduler.snapshot().in_flight,
                    Some(GattCommand::RequestMtu(_))
                );
                if requested {
                    self.scheduler.complete(self.transport.as_ref());
                }
            }
        }
    }

    async fn on_read(&mut self, characteristic: Characteristic, status: GattStatus, value: Vec<u8>) {
        let mut batch = InboundBatch::default();
        if status.is_success() {
            let actions = self.machine.handle(ConnectionInput::ReadSucceeded);
            self.apply(actions).await;
            self.on_read_value(characteristic, value, &mut batch);
        } else {
            warn!(device = %self.device_id, ?characteristic, ?status, "Characteristic read failed");
        }
        self.scheduler.finish_read_write();
        self.drain_incoming(&mut batch);
        self.deliver(batch).await;
        self.scheduler.complete(self.transport.as_ref());
    }

    fn on_read_value(&mut self, characteristic: Characteristic, value: Vec<u8>, batch: &mut InboundBatch) {
        if let Some((lane, true)) = Lane::for_inbound(characteristic) {
            self.on_large_chunk(lane, &value, batch);
            return;
        }

        let text = String::from_utf8_lossy(&value).trim().to_string();
        match characteristic {
            Characteristic::DeviceMtu => match text.parse::<u16>() {
                Ok(mtu) => {
                    info!(device = %self.device_id, mtu, "Device MTU");
                    self.publish(GatewayEvent::DeviceInfo {
                        device_id: self.device_id.clone(),
                        info: DeviceInfo::Mtu(mtu),
                    });
                    self.queue(GattCommand::RequestMtu(mtu));
                }
                Err(e) => warn!(device = %self.device_id, value = %text, error = %e, "Unparseable device MTU"),
            },
            Characteristic::BrokerEndpoint => {
                self.publish(GatewayEvent::DeviceInfo {
                    device_id: self.device_id.clone(),
                    info: DeviceInfo::BrokerEndpoint(text),
                });
            }
            Characteristic::DeviceVersion => {
                if !text.is_empty() {
                    self.metadata.version = text.clone();
                }
                self.publish(GatewayEvent::DeviceInfo {
                    device_id: self.device_id.clone(),
                    info: DeviceInfo::Version(text),
                });
            }
            Characteristic::DevicePlatform => {
                debug!(device = %self.device_id, platform = %text, "Device platform");
                if !text.is_empty() {
                    self.metadata.platform = text;
                }
            }
            Characteristic::DeviceId => {
                debug!(device = %self.device_id, device_id = %text, "Device id");
                if !text.is_empty() {
                    self.metadata.device_id = text;
                }
            }
            other => debug!(device = %self.device_id, characteristic = ?other, "Ignoring read result"),
        }
    }

    async fn on_write(&mut self, characteristic: Characteristic, status: GattStatus, value: Vec<u8>) {
        if !status.is_success() {
            warn!(device = %self.device_id, ?characteristic, ?status, "Characteristic write failed");
        }
        self.scheduler.finish_read_write();
        match self.scheduler.acknowledge_write(&value) {
            WriteAck::Matched => {
                let mut batch = InboundBatch::default();
                self.drain_incoming(&mut batch);
                self.deliver(batch).await;
                self.scheduler.complete(self.transport.as_ref());
            }
            WriteAck::Mismatch => {
                error!(device = %self.device_id, ?characteristic, "Write echo mismatch, dispatch stalled until reconnect");
                let mut batch = InboundBatch::default();
                self.drain_incoming(&mut batch);
                self.deliver(batch).await;
            }
            WriteAck::Unexpected => {
                debug!(device = %self.device_id, ?characteristic, "Write acknowledgement with no write in flight");
            }
        }
    }

    async fn on_command_timeout(&mut self) {
        let bonding = self.is_bonding();
        let outcome = self.scheduler.on_timeout(bonding, self.transport.as_ref());
        debug!(device = %self.device_id, ?outcome, "Command deadline elapsed");
        // Notifications held behind the expired read or write.
        if outcome == TimeoutOutcome::Advanced && !self.scheduler.is_rw_in_progress() {
            let mut batch = InboundBatch::default();
            self.drain_incoming(&mut batch);
            self.deliver(batch).await;
        }
    }

    // ---- inbound messages ----

    fn drain_incoming(&mut self, batch: &mut InboundBatch) {
        while let Some((characteristic, value)) = self.incoming.pop_front() {
            match Lane::for_inbound(characteristic) {
                Some((lane, false)) => batch.push(lane, value),
                Some((lane, true)) => self.on_large_chunk(lane, &value, batch),
                None => {
                    debug!(device = %self.device_id, ?characteristic, "Ignoring notification");
                }
            }
        }
    }

    fn on_large_chunk(&mut self, lane: Lane, chunk: &[u8], batch: &mut InboundBatch) {
        let max_payload = self.max_payload();
        match self.reassembler.push(lane, chunk, max_payload) {
            Reassembly::Complete(message) => {
                debug!(device = %self.device_id, ?lane, len = message.len(), "Large message reassembled");
                batch.push(lane, message);
            }
            Reassembly::Incomplete => {
                self.queue(GattCommand::ReadCharacteristic(lane.tx_large()));
            }
        }
    }

    async fn deliver(&mut self, batch: InboundBatch) {
        for response in decode_batch(&batch.network) {
            self.publish(GatewayEvent::NetworkConfig {
                device_id: self.device_id.clone(),
                response,
            });
        }

        let metadata = self.metadata.broker_metadata();
        for bytes in batch.mqtt {
            let message = match MqttMessage::decode(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    warn!(device = %self.device_id, error = %e, "Dropping undecodable MQTT proxy message");
                    continue;
                }
            };
            let out = self.mqtt.handle_device_message(message, &metadata).await;
            self.apply_bridge_outputs(out);
        }
    }

    // ---- broker side ----

    async fn on_broker_event(&mut self, event: BrokerEvent) {
        let out = self.mqtt.handle_broker_event(event).await;
        self.apply_bridge_outputs(out);
    }

    fn apply_bridge_outputs(&self, outputs: Vec<BridgeOutput>) {
        for output in outputs {
            match output {
                BridgeOutput::Send(message) => self.send_mqtt(message),
                BridgeOutput::SendAfter(delay, message) => {
                    let tx = self.delayed_tx.clone();
                    let link = self.link;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(tx) = tx.upgrade() {
                            let _ = tx.send(SessionEvent::Delayed { link, message });
                        }
                    });
                }
                BridgeOutput::StateChanged(state) => {
                    self.publish(GatewayEvent::BrokerState {
                        device_id: self.device_id.clone(),
                        state,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_defaults_to_na() {
        let metadata = DeviceMetadata::default();
        let pairs = metadata.broker_metadata();
        assert_eq!(pairs.len(), 4);
        assert!(pairs
            .iter()
            .filter(|(k, _)| k != "Gateway")
            .all(|(_, v)| v == UNKNOWN_METADATA));
    }

    #[test]
    fn test_config_from_gateway() {
        let mut gateway = GatewayConfig::default();
        gateway.scheduler.command_timeout_ms = 1_500;
        gateway.mqtt.control_encoding = ControlEncoding::Cbor;

        let config = SessionConfig::from_gateway(&gateway, true);
        assert_eq!(config.command_timeout, Duration::from_millis(1_500));
        assert_eq!(config.suback_delay, Duration::from_millis(500));
        assert_eq!(config.control_encoding, ControlEncoding::Cbor);
        assert!(config.auto_reconnect);
    }

    #[test]
    fn test_info_query_characteristics() {
        assert_eq!(InfoQuery::Mtu.characteristic(), Characteristic::DeviceMtu);
        assert_eq!(
            InfoQuery::BrokerEndpoint.characteristic(),
            Characteristic::BrokerEndpoint
        );
        assert_eq!(InfoQuery::Version.characteristic(), Characteristic::DeviceVersion);
    }
}
