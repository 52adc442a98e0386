//! BLE scanning for provisionable devices.

use std::sync::Arc;
use std::time::Duration;

use gattlink_core::ScanConfig;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{GatewayEvent, GatewayEventBus};
use crate::DeviceId;

/// An advertising device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub rssi: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Result(ScanResult),
    /// Platform-specific failure code.
    Failed(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    #[error("Scan could not be started: {0}")]
    StartFailed(String),
}

/// Where a scanner reports results.
#[derive(Debug, Clone)]
pub struct ScanEventSink {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl ScanEventSink {
    pub fn new(tx: mpsc::UnboundedSender<ScanEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: ScanEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Platform BLE scanner.
pub trait Scanner: Send + Sync {
    /// Start scanning for devices advertising any of `service_filter`.
    fn start_scan(&self, service_filter: &[Uuid], events: ScanEventSink) -> Result<(), ScanError>;

    fn stop_scan(&self);
}

#[derive(Debug, Default)]
struct ScanState {
    scanning: bool,
    /// Incremented per scan so a stale auto-stop timer leaves a newer scan
    /// alone.
    generation: u64,
}

/// Runs scans and publishes their results on the event bus.
#[derive(Clone)]
pub struct ScanManager {
    scanner: Arc<dyn Scanner>,
    event_bus: GatewayEventBus,
    config: ScanConfig,
    state: Arc<Mutex<ScanState>>,
}

impl ScanManager {
    pub fn new(scanner: Arc<dyn Scanner>, event_bus: GatewayEventBus, config: ScanConfig) -> Self {
        Self {
            scanner,
            event_bus,
            config,
            state: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    /// Start a scan for the configured period.
    pub fn start(&self) -> Result<bool, ScanError> {
        self.start_for(self.config.period())
    }

    /// Start a scan that stops itself after `period`; a zero period scans
    /// until [`ScanManager::stop`].
    ///
    /// Returns `Ok(false)` if a scan is already running.
    pub fn start_for(&self, period: Duration) -> Result<bool, ScanError> {
        let generation = {
            let mut state = self.state.lock();
            if state.scanning {
                debug!("Scan already in progress");
                return Ok(false);
            }
            state.scanning = true;
            state.generation += 1;
            state.generation
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Err(e) = self
            .scanner
            .start_scan(&self.config.service_filter, ScanEventSink::new(tx))
        {
            warn!(error = %e, "Failed to start BLE scan");
            self.state.lock().scanning = false;
            return Err(e);
        }
        info!(period_ms = period.as_millis() as u64, "Started BLE scan");

        let event_bus = self.event_bus.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let event = match event {
                    ScanEvent::Result(result) => GatewayEvent::ScanResult(result),
                    ScanEvent::Failed(code) => {
                        warn!(code, "BLE scan failed");
                        GatewayEvent::ScanFailed { code }
                    }
                };
                event_bus.publish_with_source(event, "scan");
            }
        });

        if !period.is_zero() {
            let manager = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(period).await;
                manager.stop_generation(generation);
            });
        }
        Ok(true)
    }

    /// Stop the running scan.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.scanning {
            warn!("Stop requested but no scan is running");
            return;
        }
        state.scanning = false;
        drop(state);
        self.scanner.stop_scan();
        info!("Stopped BLE scan");
    }

    fn stop_generation(&self, generation: u64) {
        let current = self.state.lock().generation;
        if current == generation && self.is_scanning() {
            debug!("Scan period elapsed");
            self.stop();
        }
    }
}
