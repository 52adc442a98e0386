//! Session registry.
//!
//! Maps each device address to its one live session. Sessions are created
//! on connect and dropped from the registry on disconnect; a session whose
//! task has ended is pruned the next time it is looked up.

use std::sync::Arc;

use dashmap::DashMap;
use gattlink_core::GatewayConfig;
use tracing::{debug, info};

use crate::broker::BrokerConnector;
use crate::event::GatewayEventBus;
use crate::session::{self, SessionConfig, SessionError, SessionHandle};
use crate::transport::Transport;
use crate::DeviceId;

pub struct SessionRegistry {
    sessions: DashMap<DeviceId, SessionHandle>,
    event_bus: GatewayEventBus,
    config: GatewayConfig,
    /// Broker connector handed to every new session. Without one the MQTT
    /// proxy is never enabled on devices.
    connector: Option<Arc<dyn BrokerConnector>>,
}

impl SessionRegistry {
    pub fn new(config: GatewayConfig, event_bus: GatewayEventBus) -> Self {
        Self {
            sessions: DashMap::new(),
            event_bus,
            config,
            connector: None,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn event_bus(&self) -> &GatewayEventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Connect to a device, creating its session if none is live.
    ///
    /// An existing live session is reused and asked to connect again; its
    /// transport and reconnect policy are kept.
    pub fn connect(
        &self,
        device_id: DeviceId,
        transport: Arc<dyn Transport>,
        auto_reconnect: bool,
    ) -> Result<SessionHandle, SessionError> {
        let handle = {
            let mut entry = self.sessions.entry(device_id.clone()).or_insert_with(|| {
                info!(device = %device_id, auto_reconnect, "Creating device session");
                self.spawn(device_id.clone(), transport.clone(), auto_reconnect)
            });
            if entry.is_closed() {
                debug!(device = %device_id, "Replacing ended session");
                *entry = self.spawn(device_id.clone(), transport, auto_reconnect);
            }
            entry.clone()
        };
        handle.connect()?;
        Ok(handle)
    }

    fn spawn(
        &self,
        device_id: DeviceId,
        transport: Arc<dyn Transport>,
        auto_reconnect: bool,
    ) -> SessionHandle {
        session::spawn(
            device_id,
            transport,
            self.connector.clone(),
            self.event_bus.clone(),
            SessionConfig::from_gateway(&self.config, auto_reconnect),
        )
    }

    /// Disconnect a device and forget its session.
    ///
    /// Returns `false` if no session was registered.
    pub fn disconnect(&self, device_id: &DeviceId) -> bool {
        match self.sessions.remove(device_id) {
            Some((_, handle)) => {
                info!(device = %device_id, "Disconnecting device session");
                if let Err(e) = handle.disconnect() {
                    debug!(device = %device_id, error = %e, "Session already ended");
                }
                true
            }
            None => false,
        }
    }

    /// Live session for a device.
    pub fn get(&self, device_id: &DeviceId) -> Option<SessionHandle> {
        let handle = self.sessions.get(device_id)?.clone();
        if handle.is_closed() {
            self.sessions.remove_if(device_id, |_, h| h.is_closed());
            return None;
        }
        Some(handle)
    }

    /// Addresses of all registered devices, sorted.
    pub fn list(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions whose task has ended. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, handle| !handle.is_closed());
        before - self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::mock::{MockTransport, TransportOp};

    fn registry() -> SessionRegistry {
        SessionRegistry::new(GatewayConfig::default(), GatewayEventBus::new())
    }

    #[tokio::test]
    async fn test_connect_creates_one_session_per_device() {
        let registry = registry();
        let transport = MockTransport::shared();
        let id = DeviceId::from("AA:BB:CC:DD:EE:01");

        let first = registry.connect(id.clone(), transport.clone(), false).unwrap();
        let second = registry.connect(id.clone(), transport.clone(), false).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(first.device_id(), second.device_id());

        // No link event has arrived yet, so both requests issue a connect.
        let snapshot = first.snapshot().await.unwrap();
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);
        assert_eq!(
            transport.ops(),
            vec![TransportOp::Connect, TransportOp::Connect]
        );
    }

    #[tokio::test]
    async fn test_disconnect_removes_session() {
        let registry = registry();
        let id = DeviceId::from("AA:BB:CC:DD:EE:02");
        let transport = MockTransport::shared();

        let handle = registry.connect(id.clone(), transport.clone(), false).unwrap();
        assert!(registry.disconnect(&id));
        assert!(!registry.disconnect(&id));
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());

        // Never connected, so the disconnect closes the session outright.
        while !handle.is_closed() {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.last_op(), Some(TransportOp::Close));
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let registry = registry();
        for id in ["CC", "AA", "BB"] {
            registry
                .connect(DeviceId::from(id), MockTransport::shared(), false)
                .unwrap();
        }
        assert_eq!(
            registry.list(),
            vec![DeviceId::from("AA"), DeviceId::from("BB"), DeviceId::from("CC")]
        );
    }
}
