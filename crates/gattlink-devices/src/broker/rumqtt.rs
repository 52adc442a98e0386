//! Broker connector backed by `rumqttc`.
//!
//! Each session owns an `AsyncClient` and a spawned event-loop task that
//! turns `rumqttc` events into [`BrokerEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gattlink_core::{BrokerConfig, TlsConfig};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, TlsConfiguration, Transport,
};
use tracing::{debug, info, warn};

use super::{
    BrokerConnector, BrokerError, BrokerEvent, BrokerEventSink, BrokerSession, BrokerStatus,
    ConnectParams, DeliveryTag, QoS,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

fn from_rumqttc(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Split `host[:port]`, falling back to `default_port`.
fn split_endpoint(endpoint: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port)) = endpoint.rsplit_once(':') {
        if let Ok(port) = port.parse() {
            return (host.to_string(), port);
        }
    }
    (endpoint.to_string(), default_port)
}

/// Device metadata travels as a query string on the username.
fn username_with_metadata(username: &str, metadata: &[(String, String)]) -> String {
    if metadata.is_empty() {
        return username.to_string();
    }
    let query: Vec<String> = metadata
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!("{}?{}", username, query.join("&"))
}

async fn load_tls(tls: &TlsConfig) -> Result<TlsConfiguration, BrokerError> {
    let ca = tokio::fs::read(&tls.ca_path)
        .await
        .map_err(|e| BrokerError::Tls(format!("{}: {}", tls.ca_path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut &ca[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BrokerError::Tls(format!("Invalid CA file: {}", e)))?;
    if certs.is_empty() {
        return Err(BrokerError::Tls(format!(
            "No certificates in {}",
            tls.ca_path.display()
        )));
    }

    let client_auth = match (&tls.cert_path, &tls.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert = tokio::fs::read(cert_path)
                .await
                .map_err(|e| BrokerError::Tls(format!("{}: {}", cert_path.display(), e)))?;
            let key = tokio::fs::read(key_path)
                .await
                .map_err(|e| BrokerError::Tls(format!("{}: {}", key_path.display(), e)))?;
            match rustls_pemfile::private_key(&mut &key[..]) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(BrokerError::Tls(format!(
                        "No private key in {}",
                        key_path.display()
                    )))
                }
                Err(e) => return Err(BrokerError::Tls(format!("Invalid key file: {}", e))),
            }
            Some((cert, key))
        }
        (None, None) => None,
        _ => {
            return Err(BrokerError::Tls(
                "Client certificate and key must be configured together".to_string(),
            ))
        }
    };

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })
}

/// Matches outgoing publishes to their delivery results.
///
/// `rumqttc` reports publishes in the order they were queued, so tags are
/// kept in a FIFO until the event loop assigns a packet id.
#[derive(Debug, Default)]
struct DeliveryTracker {
    queued: VecDeque<DeliveryTag>,
    awaiting_ack: HashMap<u16, DeliveryTag>,
}

impl DeliveryTracker {
    fn queue(&mut self, tag: DeliveryTag) {
        self.queued.push_back(tag);
    }

    /// A publish went out. QoS 0 publishes are delivered at this point.
    ///
    /// A packet id still awaiting its PUBACK is a retransmission after a
    /// reconnect and consumes no queued tag.
    fn sent(&mut self, pkid: u16) -> Option<DeliveryTag> {
        if self.awaiting_ack.contains_key(&pkid) {
            debug!(pkid, "Publish retransmitted");
            return None;
        }
        let tag = self.queued.pop_front()?;
        match tag.qos {
            QoS::AtMostOnce => Some(tag),
            QoS::AtLeastOnce => {
                self.awaiting_ack.insert(pkid, tag);
                None
            }
        }
    }

    fn acked(&mut self, pkid: u16) -> Option<DeliveryTag> {
        self.awaiting_ack.remove(&pkid)
    }

    /// Drop a publish the client refused to queue.
    fn unqueue(&mut self) -> Option<DeliveryTag> {
        self.queued.pop_back()
    }
}

/// Opens `rumqttc` sessions using the gateway broker settings.
#[derive(Debug, Clone)]
pub struct RumqttConnector {
    config: BrokerConfig,
}

impl RumqttConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    async fn options(&self, params: &ConnectParams) -> Result<MqttOptions, BrokerError> {
        let (host, port) = split_endpoint(&params.endpoint, self.config.port);
        if host.is_empty() {
            return Err(BrokerError::Connect("Empty broker endpoint".to_string()));
        }

        let mut options = MqttOptions::new(&params.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        options.set_clean_session(params.clean_session);

        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username_with_metadata(user, &params.metadata), pass);
        }
        if let Some(tls) = &self.config.tls {
            options.set_transport(Transport::tls_with_config(load_tls(tls).await?));
        }
        Ok(options)
    }
}

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn connect(
        &self,
        params: ConnectParams,
        events: BrokerEventSink,
    ) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let options = self.options(&params).await?;
        info!(
            client_id = %params.client_id,
            endpoint = %params.endpoint,
            "Opening broker session"
        );

        let (client, eventloop) = AsyncClient::new(options, self.config.capacity);
        let tracker = Arc::new(Mutex::new(DeliveryTracker::default()));
        let closing = Arc::new(AtomicBool::new(false));

        events.emit(BrokerEvent::Status(BrokerStatus::Connecting));
        tokio::spawn(run_event_loop(
            eventloop,
            events,
            tracker.clone(),
            closing.clone(),
            params.client_id,
        ));

        Ok(Box::new(RumqttSession {
            client,
            tracker,
            closing,
        }))
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    events: BrokerEventSink,
    tracker: Arc<Mutex<DeliveryTracker>>,
    closing: Arc<AtomicBool>,
    client_id: String,
) {
    let mut connected_once = false;

    loop {
        if events.is_closed() {
            debug!(client_id = %client_id, "Broker event sink dropped");
            break;
        }
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected_once = true;
                    events.emit(BrokerEvent::Status(BrokerStatus::Connected));
                } else {
                    events.emit(BrokerEvent::Status(BrokerStatus::Refused(format!(
                        "{:?}",
                        ack.code
                    ))));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                events.emit(BrokerEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    qos: from_rumqttc(publish.qos),
                });
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                if let Some(tag) = tracker.lock().acked(ack.pkid) {
                    events.emit(BrokerEvent::Delivered { tag, success: true });
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                if let Some(tag) = tracker.lock().sent(pkid) {
                    events.emit(BrokerEvent::Delivered { tag, success: true });
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(client_id = %client_id, "Broker disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                match e {
                    ConnectionError::ConnectionRefused(code) => {
                        events.emit(BrokerEvent::Status(BrokerStatus::Refused(format!(
                            "{:?}",
                            code
                        ))));
                        break;
                    }
                    e if !connected_once => {
                        warn!(client_id = %client_id, error = %e, "Broker connection failed");
                        events.emit(BrokerEvent::Status(BrokerStatus::Error(e.to_string())));
                        break;
                    }
                    e => {
                        warn!(client_id = %client_id, error = %e, "Broker connection lost");
                        events.emit(BrokerEvent::Status(BrokerStatus::ConnectionLost));
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        events.emit(BrokerEvent::Status(BrokerStatus::Reconnecting));
                    }
                }
            }
        }
    }
    info!(client_id = %client_id, "Broker session closed");
}

struct RumqttSession {
    client: AsyncClient,
    tracker: Arc<Mutex<DeliveryTracker>>,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerSession for RumqttSession {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
        tag: DeliveryTag,
    ) -> Result<(), BrokerError> {
        self.tracker.lock().queue(tag);
        if let Err(e) = self
            .client
            .publish(topic, to_rumqttc(qos), false, payload)
            .await
        {
            self.tracker.lock().unqueue();
            return Err(BrokerError::Request(e.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        self.client
            .subscribe(topic, to_rumqttc(qos))
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.closing.store(true, Ordering::SeqCst);
        self.client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))
    }
}
