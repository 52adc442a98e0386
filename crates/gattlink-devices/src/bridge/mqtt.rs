//! MQTT proxy bridge.
//!
//! Translates proxy messages from the device into broker operations and
//! broker events back into proxy messages. The bridge owns the broker
//! session; it never talks to the BLE link directly but returns
//! [`BridgeOutput`]s for the session to carry out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{
    topic_matches, BrokerConnector, BrokerEvent, BrokerEventSink, BrokerSession, BrokerStatus,
    ConnectParams, DeliveryTag, MqttSessionState, QoS,
};
use crate::codec::{Connack, Connect, MessageAck, MqttMessage, Publish, Suback, Subscribe, Unsubscribe};
use crate::DeviceId;

/// What the bridge asks the session to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutput {
    /// Send to the device now.
    Send(MqttMessage),
    /// Send to the device after a delay.
    SendAfter(Duration, MqttMessage),
    /// The proxied session state changed.
    StateChanged(MqttSessionState),
}

pub struct MqttBridge {
    device_id: DeviceId,
    connector: Option<Arc<dyn BrokerConnector>>,
    session: Option<Box<dyn BrokerSession>>,
    events: Option<mpsc::UnboundedReceiver<BrokerEvent>>,
    state: MqttSessionState,
    /// Id of the last PUBLISH from the device, reused for broker-originated
    /// PUBLISHes.
    last_message_id: u32,
    subscriptions: Vec<(String, QoS)>,
    suback_delay: Duration,
}

impl MqttBridge {
    pub fn new(
        device_id: DeviceId,
        connector: Option<Arc<dyn BrokerConnector>>,
        suback_delay: Duration,
    ) -> Self {
        Self {
            device_id,
            connector,
            session: None,
            events: None,
            state: MqttSessionState::Disconnected,
            last_message_id: 0,
            subscriptions: Vec::new(),
            suback_delay,
        }
    }

    pub fn state(&self) -> MqttSessionState {
        self.state
    }

    /// Whether a broker connector is configured at all.
    pub fn has_connector(&self) -> bool {
        self.connector.is_some()
    }

    pub fn last_message_id(&self) -> u32 {
        self.last_message_id
    }

    /// Next event from the current broker session.
    ///
    /// Pends forever when no session is open, so it can sit in a `select!`.
    pub async fn next_event(&mut self) -> Option<BrokerEvent> {
        let event = match self.events.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        };
        if event.is_none() {
            self.events = None;
        }
        event
    }

    fn set_state(&mut self, state: MqttSessionState, out: &mut Vec<BridgeOutput>) {
        if self.state != state {
            debug!(device = %self.device_id, from = ?self.state, to = ?state, "MQTT proxy state change");
            self.state = state;
            out.push(BridgeOutput::StateChanged(state));
        }
    }

    /// Handle a message decoded from the device's MQTT channel.
    pub async fn handle_device_message(
        &mut self,
        message: MqttMessage,
        metadata: &[(String, String)],
    ) -> Vec<BridgeOutput> {
        let mut out = Vec::new();
        debug!(device = %self.device_id, message = message.name(), "MQTT proxy message from device");

        match message {
            MqttMessage::Connect(connect) => self.on_connect(connect, metadata, &mut out).await,
            MqttMessage::Subscribe(subscribe) => self.on_subscribe(subscribe, &mut out).await,
            MqttMessage::Publish(publish) => self.on_publish(publish).await,
            MqttMessage::Unsubscribe(unsubscribe) => {
                self.on_unsubscribe(unsubscribe, &mut out).await
            }
            MqttMessage::Disconnect => self.disconnect_broker(&mut out).await,
            MqttMessage::PingReq => out.push(BridgeOutput::Send(MqttMessage::PingResp)),
            MqttMessage::Puback(ack) => {
                debug!(device = %self.device_id, msg_id = ack.msg_id, "PUBACK from device");
            }
            MqttMessage::PubRec(_) | MqttMessage::PubRel(_) | MqttMessage::PubComp(_) => {
                warn!(device = %self.device_id, "QoS 2 flow is not supported, dropping");
            }
            other => {
                warn!(device = %self.device_id, message = other.name(), "Unexpected message direction, dropping");
            }
        }
        out
    }

    async fn on_connect(
        &mut self,
        connect: Connect,
        metadata: &[(String, String)],
        out: &mut Vec<BridgeOutput>,
    ) {
        match self.state {
            MqttSessionState::Disconnected => {}
            MqttSessionState::Connected => {
                info!(device = %self.device_id, "Already connected, re-sending CONNACK");
                out.push(connack());
                return;
            }
            MqttSessionState::Connecting => {
                warn!(device = %self.device_id, "Connection already in progress, ignoring CONNECT");
                return;
            }
            state => {
                warn!(device = %self.device_id, ?state, "CONNECT ignored until the device disconnects");
                return;
            }
        }

        let Some(connector) = self.connector.clone() else {
            warn!(device = %self.device_id, "No broker configured, ignoring CONNECT");
            return;
        };

        // A session kept alive across a lost connection is replaced.
        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect().await {
                debug!(device = %self.device_id, error = %e, "Closing stale broker session failed");
            }
        }

        let params = ConnectParams {
            client_id: connect.client_id,
            endpoint: connect.broker_endpoint,
            clean_session: connect.clean_session,
            metadata: metadata.to_vec(),
        };
        info!(device = %self.device_id, client_id = %params.client_id, endpoint = %params.endpoint, "Connecting to broker");

        let (sink, rx) = BrokerEventSink::channel();
        match connector.connect(params, sink).await {
            Ok(session) => {
                self.session = Some(session);
                self.events = Some(rx);
                self.set_state(MqttSessionState::Connecting, out);
            }
            Err(e) => {
                warn!(device = %self.device_id, error = %e, "Broker connect failed");
                self.events = None;
                self.set_state(MqttSessionState::ConnectionError, out);
            }
        }
    }

    async fn on_subscribe(&mut self, subscribe: Subscribe, out: &mut Vec<BridgeOutput>) {
        let Some(session) = self.connected_session() else {
            warn!(device = %self.device_id, "Not connected, dropping SUBSCRIBE");
            return;
        };

        let mut granted = Vec::with_capacity(subscribe.topics.len());
        for (topic, qos) in subscribe.topics.iter().zip(subscribe.qos.iter()) {
            let qos = QoS::from_wire(*qos);
            match session.subscribe(topic, qos).await {
                Ok(()) => granted.push((topic.clone(), qos)),
                Err(e) => warn!(device = %self.device_id, topic = %topic, error = %e, "Subscribe failed"),
            }
        }
        for (topic, qos) in granted {
            self.subscriptions.retain(|(t, _)| t != &topic);
            self.subscriptions.push((topic, qos));
        }

        // The broker's own SUBACK is not observable here; acknowledge after a
        // fixed delay with the first requested QoS.
        let status = subscribe.qos.first().map(|q| u32::from(*q)).unwrap_or(0);
        out.push(BridgeOutput::SendAfter(
            self.suback_delay,
            MqttMessage::Suback(Suback {
                msg_id: subscribe.msg_id,
                status,
            }),
        ));
    }

    async fn on_publish(&mut self, publish: Publish) {
        self.last_message_id = publish.msg_id;

        let Some(session) = self.connected_session() else {
            warn!(device = %self.device_id, topic = %publish.topic, "Not connected, dropping PUBLISH");
            return;
        };

        let qos = QoS::from_wire(publish.qos);
        let tag = DeliveryTag {
            message_id: publish.msg_id,
            qos,
        };
        if let Err(e) = session
            .publish(&publish.topic, qos, publish.payload, tag)
            .await
        {
            warn!(device = %self.device_id, topic = %publish.topic, error = %e, "Publish failed");
        }
    }

    async fn on_unsubscribe(&mut self, unsubscribe: Unsubscribe, out: &mut Vec<BridgeOutput>) {
        let Some(session) = self.connected_session() else {
            warn!(device = %self.device_id, "Not connected, dropping UNSUBSCRIBE");
            return;
        };

        for topic in &unsubscribe.topics {
            if let Err(e) = session.unsubscribe(topic).await {
                warn!(device = %self.device_id, topic = %topic, error = %e, "Unsubscribe failed");
            }
        }
        self.subscriptions
            .retain(|(t, _)| !unsubscribe.topics.contains(t));

        out.push(BridgeOutput::Send(MqttMessage::Unsuback(MessageAck {
            msg_id: unsubscribe.msg_id,
        })));
    }

    fn connected_session(&self) -> Option<&dyn BrokerSession> {
        if self.state == MqttSessionState::Connected {
            self.session.as_deref()
        } else {
            None
        }
    }

    /// Close the broker session, if any, and return to Disconnected.
    pub async fn disconnect_broker(&mut self, out: &mut Vec<BridgeOutput>) {
        if let Some(session) = self.session.take() {
            info!(device = %self.device_id, "Disconnecting from broker");
            if let Err(e) = session.disconnect().await {
                warn!(device = %self.device_id, error = %e, "Broker disconnect failed");
            }
        }
        self.events = None;
        self.subscriptions.clear();
        self.set_state(MqttSessionState::Disconnected, out);
    }

    /// Handle an event from the broker session.
    pub async fn handle_broker_event(&mut self, event: BrokerEvent) -> Vec<BridgeOutput> {
        let mut out = Vec::new();
        match event {
            BrokerEvent::Status(status) => {
                info!(device = %self.device_id, ?status, "Broker status");
                self.set_state(status.session_state(), &mut out);
                match status {
                    BrokerStatus::Connected => out.push(connack()),
                    BrokerStatus::Refused(_)
                    | BrokerStatus::Error(_)
                    | BrokerStatus::ProtocolViolation(_) => {
                        if let Some(session) = self.session.take() {
                            if let Err(e) = session.disconnect().await {
                                debug!(device = %self.device_id, error = %e, "Closing failed broker session");
                            }
                        }
                        self.events = None;
                    }
                    _ => {}
                }
            }
            BrokerEvent::Delivered { tag, success } => {
                if !success {
                    warn!(device = %self.device_id, msg_id = tag.message_id, "Publish delivery failed");
                } else if tag.qos == QoS::AtLeastOnce {
                    out.push(BridgeOutput::Send(MqttMessage::Puback(MessageAck {
                        msg_id: tag.message_id,
                    })));
                }
            }
            BrokerEvent::Message {
                topic,
                payload,
                qos,
            } => {
                let qos = self
                    .subscriptions
                    .iter()
                    .find(|(filter, _)| topic_matches(filter, &topic))
                    .map(|(_, q)| *q)
                    .unwrap_or(qos);
                out.push(BridgeOutput::Send(MqttMessage::Publish(Publish {
                    topic,
                    msg_id: self.last_message_id,
                    qos: qos.wire(),
                    payload,
                })));
            }
        }
        out
    }

    /// Forget per-link state after the BLE link drops.
    pub async fn reset(&mut self) -> Vec<BridgeOutput> {
        let mut out = Vec::new();
        if self.session.is_some() || self.state != MqttSessionState::Disconnected {
            self.disconnect_broker(&mut out).await;
        }
        self.last_message_id = 0;
        out
    }
}

fn connack() -> BridgeOutput {
    BridgeOutput::Send(MqttMessage::Connack(Connack {
        status: MqttSessionState::Connected.ordinal(),
    }))
}
