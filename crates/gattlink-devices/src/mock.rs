//! In-memory transport, broker and scanner for testing.
//!
//! These record every request so tests can assert on exactly what the
//! engine asked the platform to do, and let tests inject the events the
//! platform would deliver.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::broker::{
    BrokerConnector, BrokerError, BrokerEvent, BrokerEventSink, BrokerSession, BrokerStatus,
    ConnectParams, DeliveryTag, QoS,
};
use crate::gatt::Characteristic;
use crate::scan::{ScanError, ScanEvent, ScanEventSink, Scanner};
use crate::transport::{BondState, Transport, TransportError, TransportResult};

/// A request made to [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportOp {
    Connect,
    Disconnect,
    Close,
    DiscoverServices,
    Read(Characteristic),
    Write(Characteristic, Vec<u8>),
    WriteDescriptor(Characteristic, Vec<u8>),
    RequestMtu(u16),
}

/// Transport that records requests and accepts them unless told otherwise.
#[derive(Debug, Default)]
pub struct MockTransport {
    ops: Mutex<Vec<TransportOp>>,
    rejected: Mutex<HashSet<TransportOp>>,
    reject_all: Mutex<bool>,
    bond_state: Mutex<BondState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Reject every future occurrence of `op`.
    pub fn reject(&self, op: TransportOp) {
        self.rejected.lock().insert(op);
    }

    pub fn set_reject_all(&self, reject: bool) {
        *self.reject_all.lock() = reject;
    }

    pub fn set_bond_state(&self, state: BondState) {
        *self.bond_state.lock() = state;
    }

    pub fn ops(&self) -> Vec<TransportOp> {
        self.ops.lock().clone()
    }

    pub fn take_ops(&self) -> Vec<TransportOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    pub fn last_op(&self) -> Option<TransportOp> {
        self.ops.lock().last().cloned()
    }

    fn record(&self, op: TransportOp) -> TransportResult<()> {
        let rejected = *self.reject_all.lock() || self.rejected.lock().contains(&op);
        self.ops.lock().push(op.clone());
        if rejected {
            Err(TransportError::Rejected(format!("{:?}", op)))
        } else {
            Ok(())
        }
    }
}

impl Transport for MockTransport {
    fn connect(&self) -> TransportResult<()> {
        self.record(TransportOp::Connect)
    }

    fn disconnect(&self) -> TransportResult<()> {
        self.record(TransportOp::Disconnect)
    }

    fn close(&self) {
        self.ops.lock().push(TransportOp::Close);
    }

    fn bond_state(&self) -> BondState {
        *self.bond_state.lock()
    }

    fn discover_services(&self) -> TransportResult<()> {
        self.record(TransportOp::DiscoverServices)
    }

    fn read_characteristic(&self, characteristic: Characteristic) -> TransportResult<()> {
        self.record(TransportOp::Read(characteristic))
    }

    fn write_characteristic(
        &self,
        characteristic: Characteristic,
        value: &[u8],
    ) -> TransportResult<()> {
        self.record(TransportOp::Write(characteristic, value.to_vec()))
    }

    fn write_descriptor(&self, characteristic: Characteristic, value: &[u8]) -> TransportResult<()> {
        self.record(TransportOp::WriteDescriptor(characteristic, value.to_vec()))
    }

    fn request_mtu(&self, mtu: u16) -> TransportResult<()> {
        self.record(TransportOp::RequestMtu(mtu))
    }
}

/// A request made to a [`MockBrokerSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    Publish {
        topic: String,
        qos: QoS,
        payload: Vec<u8>,
        tag: DeliveryTag,
    },
    Subscribe { topic: String, qos: QoS },
    Unsubscribe { topic: String },
    Disconnect,
}

#[derive(Debug, Default)]
struct MockBrokerState {
    connects: Vec<ConnectParams>,
    ops: Vec<BrokerOp>,
    sink: Option<BrokerEventSink>,
}

/// Broker connector that records sessions and their requests.
///
/// With `auto_connect` the session reports `Connecting` then `Connected`
/// as soon as it is opened; otherwise tests drive status through
/// [`MockBrokerConnector::emit`].
#[derive(Debug, Clone, Default)]
pub struct MockBrokerConnector {
    state: Arc<Mutex<MockBrokerState>>,
    auto_connect: bool,
    fail_connect: bool,
}

impl MockBrokerConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_connecting() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_connect: true,
            ..Self::default()
        }
    }

    pub fn connects(&self) -> Vec<ConnectParams> {
        self.state.lock().connects.clone()
    }

    pub fn ops(&self) -> Vec<BrokerOp> {
        self.state.lock().ops.clone()
    }

    /// Deliver an event as the most recently opened session.
    pub fn emit(&self, event: BrokerEvent) -> bool {
        match &self.state.lock().sink {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }
}

#[async_trait]
impl BrokerConnector for MockBrokerConnector {
    async fn connect(
        &self,
        params: ConnectParams,
        events: BrokerEventSink,
    ) -> Result<Box<dyn BrokerSession>, BrokerError> {
        if self.fail_connect {
            return Err(BrokerError::Connect("mock connect failure".to_string()));
        }
        events.emit(BrokerEvent::Status(BrokerStatus::Connecting));
        if self.auto_connect {
            events.emit(BrokerEvent::Status(BrokerStatus::Connected));
        }

        let mut state = self.state.lock();
        state.connects.push(params);
        state.sink = Some(events);
        Ok(Box::new(MockBrokerSession {
            state: self.state.clone(),
        }))
    }
}

/// Session handed out by [`MockBrokerConnector`].
#[derive(Debug)]
pub struct MockBrokerSession {
    state: Arc<Mutex<MockBrokerState>>,
}

#[async_trait]
impl BrokerSession for MockBrokerSession {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
        tag: DeliveryTag,
    ) -> Result<(), BrokerError> {
        self.state.lock().ops.push(BrokerOp::Publish {
            topic: topic.to_string(),
            qos,
            payload,
            tag,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        self.state.lock().ops.push(BrokerOp::Subscribe {
            topic: topic.to_string(),
            qos,
        });
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.state.lock().ops.push(BrokerOp::Unsubscribe {
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.state.lock().ops.push(BrokerOp::Disconnect);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockScannerState {
    starts: Vec<Vec<Uuid>>,
    stops: usize,
    sink: Option<ScanEventSink>,
}

/// Scanner that records start/stop calls.
#[derive(Debug, Clone, Default)]
pub struct MockScanner {
    state: Arc<Mutex<MockScannerState>>,
}

impl MockScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starts(&self) -> Vec<Vec<Uuid>> {
        self.state.lock().starts.clone()
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }

    /// Deliver a scan event to the active scan.
    pub fn emit(&self, event: ScanEvent) -> bool {
        match &self.state.lock().sink {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }
}

impl Scanner for MockScanner {
    fn start_scan(&self, service_filter: &[Uuid], events: ScanEventSink) -> Result<(), ScanError> {
        let mut state = self.state.lock();
        state.starts.push(service_filter.to_vec());
        state.sink = Some(events);
        Ok(())
    }

    fn stop_scan(&self) {
        let mut state = self.state.lock();
        state.stops += 1;
        state.sink = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_transport_records_rejections() {
        let transport = MockTransport::new();
        transport.reject(TransportOp::RequestMtu(512));

        assert!(transport.request_mtu(185).is_ok());
        assert!(transport.request_mtu(512).is_err());
        assert_eq!(
            transport.take_ops(),
            vec![TransportOp::RequestMtu(185), TransportOp::RequestMtu(512)]
        );
        assert!(transport.ops().is_empty());
    }

    #[tokio::test]
    async fn test_mock_broker_auto_connect() {
        let connector = MockBrokerConnector::auto_connecting();
        let (sink, mut rx) = BrokerEventSink::channel();
        let params = ConnectParams {
            client_id: "c".into(),
            endpoint: "e".into(),
            clean_session: true,
            metadata: Vec::new(),
        };

        let session = connector.connect(params.clone(), sink).await.unwrap();
        session.subscribe("t", QoS::AtLeastOnce).await.unwrap();

        assert_eq!(rx.recv().await, Some(BrokerEvent::Status(BrokerStatus::Connecting)));
        assert_eq!(rx.recv().await, Some(BrokerEvent::Status(BrokerStatus::Connected)));
        assert_eq!(connector.connects(), vec![params]);
        assert_eq!(connector.ops().len(), 1);
    }
}
