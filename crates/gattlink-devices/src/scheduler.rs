//! Serializes GATT operations against one link.
//!
//! Only one operation may be in flight. Commands wait on one of two lanes
//! (network config and MQTT proxy); when both have work the scheduler
//! alternates between them. Each dispatched operation is bounded by a
//! deadline that the owning session polls.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::command::GattCommand;
use crate::gatt::Lane;
use crate::transport::Transport;

/// Outcome of matching a write acknowledgement against the last write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAck {
    Matched,
    /// The echoed value differs from what was written. Dispatch stays
    /// stalled until [`CommandScheduler::reset`].
    Mismatch,
    /// No characteristic write was in flight.
    Unexpected,
}

/// Outcome of a command deadline expiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// The deadline was re-armed because bonding is in progress.
    Rearmed,
    /// The in-flight slot was released and the next command dispatched.
    Advanced,
    /// Nothing was in flight.
    Idle,
}

#[derive(Debug, Default)]
struct SchedulerState {
    in_flight: Option<GattCommand>,
    network: VecDeque<GattCommand>,
    mqtt: VecDeque<GattCommand>,
    /// Round-robin bit, flipped after every pick made while both lanes
    /// have work.
    prefer_mqtt: bool,
    last_written: Option<Vec<u8>>,
    rw_in_progress: bool,
    deadline: Option<Instant>,
    stalled: bool,
    halted: bool,
}

impl SchedulerState {
    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<GattCommand> {
        match lane {
            Lane::NetworkConfig => &mut self.network,
            Lane::MqttProxy => &mut self.mqtt,
        }
    }

    fn pick(&mut self) -> Option<GattCommand> {
        match (self.network.is_empty(), self.mqtt.is_empty()) {
            (false, false) => {
                let lane = if self.prefer_mqtt {
                    Lane::MqttProxy
                } else {
                    Lane::NetworkConfig
                };
                self.prefer_mqtt = !self.prefer_mqtt;
                self.lane_mut(lane).pop_front()
            }
            (false, true) => self.network.pop_front(),
            (true, false) => self.mqtt.pop_front(),
            (true, true) => None,
        }
    }

    fn release(&mut self) {
        self.in_flight = None;
        self.rw_in_progress = false;
        self.deadline = None;
    }
}

/// Point-in-time view of the scheduler, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub in_flight: Option<GattCommand>,
    pub network_depth: usize,
    pub mqtt_depth: usize,
    pub stalled: bool,
}

/// Single-slot GATT command scheduler.
///
/// The internal lock is held only while deciding what to dispatch, never
/// across a transport call.
#[derive(Debug)]
pub struct CommandScheduler {
    state: Mutex<SchedulerState>,
    timeout: Duration,
}

impl CommandScheduler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Queue `command` on `lane` and dispatch if the slot is free.
    pub fn submit(&self, lane: Lane, command: GattCommand, transport: &dyn Transport) {
        debug!(?lane, ?command, "Queueing GATT command");
        self.state.lock().lane_mut(lane).push_back(command);
        self.dispatch(transport);
    }

    /// Queue `command` on the lane derived from its service.
    pub fn submit_routed(&self, command: GattCommand, transport: &dyn Transport) {
        self.submit(command.lane(), command, transport);
    }

    /// Issue the next queued command if nothing is in flight.
    ///
    /// A command the transport rejects synchronously counts as complete
    /// and the next one is tried immediately.
    pub fn dispatch(&self, transport: &dyn Transport) {
        loop {
            let command = {
                let mut state = self.state.lock();
                if state.in_flight.is_some() || state.stalled || state.halted {
                    return;
                }
                let Some(command) = state.pick() else {
                    return;
                };
                if let GattCommand::WriteCharacteristic { value, .. } = &command {
                    state.last_written = Some(value.clone());
                }
                state.rw_in_progress = command.is_read_or_write();
                state.in_flight = Some(command.clone());
                command
            };

            match command.issue(transport) {
                Ok(()) => {
                    self.state.lock().deadline = Some(Instant::now() + self.timeout);
                    return;
                }
                Err(e) => {
                    warn!(?command, error = %e, "GATT command rejected, moving on");
                    self.state.lock().release();
                }
            }
        }
    }

    /// The in-flight operation finished; release the slot and dispatch.
    pub fn complete(&self, transport: &dyn Transport) {
        self.state.lock().release();
        self.dispatch(transport);
    }

    /// Clear the read/write flag so buffered notifications can be handled
    /// before the slot itself is released.
    pub fn finish_read_write(&self) {
        self.state.lock().rw_in_progress = false;
    }

    /// Match a write acknowledgement against the last written value.
    ///
    /// Does not release the slot; on a match the caller completes the
    /// command once any buffered notifications are handled.
    pub fn acknowledge_write(&self, echoed: &[u8]) -> WriteAck {
        let mut state = self.state.lock();
        let writing = matches!(state.in_flight, Some(GattCommand::WriteCharacteristic { .. }));
        if !writing {
            return WriteAck::Unexpected;
        }
        if state.last_written.as_deref() == Some(echoed) {
            WriteAck::Matched
        } else {
            error!("Write acknowledgement does not match the written value, stalling");
            state.stalled = true;
            state.deadline = None;
            WriteAck::Mismatch
        }
    }

    /// Handle an expired deadline.
    ///
    /// While the platform is bonding the deadline is pushed out instead,
    /// since pairing legitimately blocks GATT traffic.
    pub fn on_timeout(&self, bonding: bool, transport: &dyn Transport) -> TimeoutOutcome {
        {
            let mut state = self.state.lock();
            let Some(command) = state.in_flight.as_ref() else {
                state.deadline = None;
                return TimeoutOutcome::Idle;
            };
            if bonding {
                debug!(?command, "Command timed out while bonding, re-arming");
                state.deadline = Some(Instant::now() + self.timeout);
                return TimeoutOutcome::Rearmed;
            }
            warn!(?command, timeout_ms = self.timeout.as_millis() as u64, "GATT command timed out");
            state.release();
        }
        self.dispatch(transport);
        TimeoutOutcome::Advanced
    }

    /// Deadline of the in-flight command, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    pub fn is_rw_in_progress(&self) -> bool {
        self.state.lock().rw_in_progress
    }

    pub fn is_stalled(&self) -> bool {
        self.state.lock().stalled
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock();
        SchedulerSnapshot {
            in_flight: state.in_flight.clone(),
            network_depth: state.network.len(),
            mqtt_depth: state.mqtt.len(),
            stalled: state.stalled,
        }
    }

    /// Drop queued work and stop dispatching. The in-flight command may
    /// still finish; nothing follows it until [`CommandScheduler::reset`].
    pub fn halt(&self) {
        let mut state = self.state.lock();
        let dropped = state.network.len() + state.mqtt.len();
        if dropped > 0 {
            debug!(dropped, "Dropping queued GATT commands");
        }
        state.network.clear();
        state.mqtt.clear();
        state.halted = true;
    }

    /// Drop all queued work and any stall, as on disconnect.
    pub fn reset(&self) {
        *self.state.lock() = SchedulerState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::Characteristic;
    use crate::mock::{MockTransport, TransportOp};

    fn read(c: Characteristic) -> GattCommand {
        GattCommand::ReadCharacteristic(c)
    }

    fn scheduler() -> CommandScheduler {
        CommandScheduler::new(Duration::from_millis(3000))
    }

    #[test]
    fn test_submit_dispatches_when_idle() {
        let transport = MockTransport::new();
        let scheduler = scheduler();

        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DeviceMtu), &transport);

        assert_eq!(transport.ops(), vec![TransportOp::Read(Characteristic::DeviceMtu)]);
        assert!(scheduler.is_busy());
        assert!(scheduler.is_rw_in_progress());
        assert!(scheduler.deadline().is_some());
    }

    #[test]
    fn test_single_operation_in_flight() {
        let transport = MockTransport::new();
        let scheduler = scheduler();

        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DeviceMtu), &transport);
        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DeviceId), &transport);
        assert_eq!(transport.ops().len(), 1);

        scheduler.complete(&transport);
        assert_eq!(transport.ops().len(), 2);
        assert_eq!(transport.last_op(), Some(TransportOp::Read(Characteristic::DeviceId)));
    }

    #[test]
    fn test_round_robin_across_lanes() {
        let transport = MockTransport::new();
        let scheduler = scheduler();

        // Occupy the slot so everything else queues.
        scheduler.submit(Lane::NetworkConfig, GattCommand::DiscoverServices, &transport);
        for _ in 0..3 {
            scheduler.submit(Lane::NetworkConfig, read(Characteristic::NetworkTxLarge), &transport);
        }
        for _ in 0..2 {
            scheduler.submit(Lane::MqttProxy, read(Characteristic::MqttTxLarge), &transport);
        }

        for _ in 0..5 {
            scheduler.complete(&transport);
        }

        let order: Vec<_> = transport.ops().into_iter().skip(1).collect();
        assert_eq!(
            order,
            vec![
                TransportOp::Read(Characteristic::NetworkTxLarge),
                TransportOp::Read(Characteristic::MqttTxLarge),
                TransportOp::Read(Characteristic::NetworkTxLarge),
                TransportOp::Read(Characteristic::MqttTxLarge),
                TransportOp::Read(Characteristic::NetworkTxLarge),
            ]
        );
    }

    #[test]
    fn test_rejected_command_advances() {
        let transport = MockTransport::new();
        transport.reject(TransportOp::Read(Characteristic::DeviceVersion));
        let scheduler = scheduler();

        scheduler.submit(Lane::NetworkConfig, GattCommand::DiscoverServices, &transport);
        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DeviceVersion), &transport);
        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DeviceId), &transport);
        scheduler.complete(&transport);

        assert_eq!(
            transport.ops(),
            vec![
                TransportOp::DiscoverServices,
                TransportOp::Read(Characteristic::DeviceVersion),
                TransportOp::Read(Characteristic::DeviceId),
            ]
        );
        assert!(scheduler.is_busy());
    }

    #[test]
    fn test_all_rejected_leaves_slot_free() {
        let transport = MockTransport::new();
        transport.set_reject_all(true);
        let scheduler = scheduler();

        scheduler.submit(Lane::MqttProxy, read(Characteristic::MqttTxLarge), &transport);
        assert!(!scheduler.is_busy());
        assert!(scheduler.deadline().is_none());
    }

    #[test]
    fn test_timeout_dispatches_exactly_one_next() {
        let transport = MockTransport::new();
        let scheduler = scheduler();

        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DeviceMtu), &transport);
        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DeviceId), &transport);
        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DevicePlatform), &transport);

        assert_eq!(scheduler.on_timeout(false, &transport), TimeoutOutcome::Advanced);
        assert_eq!(transport.ops().len(), 2);
        assert_eq!(scheduler.snapshot().network_depth, 1);
    }

    #[test]
    fn test_timeout_while_bonding_rearms() {
        let transport = MockTransport::new();
        let scheduler = scheduler();

        scheduler.submit(Lane::NetworkConfig, GattCommand::DiscoverServices, &transport);
        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DeviceId), &transport);

        assert_eq!(scheduler.on_timeout(true, &transport), TimeoutOutcome::Rearmed);
        assert_eq!(transport.ops().len(), 1);
        assert!(scheduler.is_busy());
        assert!(scheduler.deadline().is_some());
    }

    #[test]
    fn test_timeout_when_idle() {
        let transport = MockTransport::new();
        assert_eq!(scheduler().on_timeout(false, &transport), TimeoutOutcome::Idle);
    }

    #[test]
    fn test_write_echo_mismatch_stalls() {
        let transport = MockTransport::new();
        let scheduler = scheduler();

        scheduler.submit(
            Lane::MqttProxy,
            GattCommand::write(Characteristic::MqttRx, vec![1, 2, 3]),
            &transport,
        );
        scheduler.submit(Lane::MqttProxy, read(Characteristic::MqttTxLarge), &transport);

        assert_eq!(scheduler.acknowledge_write(&[1, 2, 4]), WriteAck::Mismatch);
        assert!(scheduler.is_stalled());
        assert!(scheduler.deadline().is_none());

        // Even a completion does not dispatch while stalled.
        scheduler.complete(&transport);
        assert_eq!(transport.ops().len(), 1);

        scheduler.reset();
        assert!(!scheduler.is_stalled());
        assert_eq!(scheduler.snapshot().mqtt_depth, 0);
    }

    #[test]
    fn test_halt_blocks_dispatch_until_reset() {
        let transport = MockTransport::new();
        let scheduler = scheduler();

        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DeviceMtu), &transport);
        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DeviceId), &transport);
        scheduler.submit(Lane::MqttProxy, read(Characteristic::MqttTxLarge), &transport);

        scheduler.halt();
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.network_depth + snapshot.mqtt_depth, 0);
        assert!(scheduler.is_busy());

        scheduler.complete(&transport);
        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DevicePlatform), &transport);
        assert_eq!(transport.ops(), vec![TransportOp::Read(Characteristic::DeviceMtu)]);
        assert!(!scheduler.is_busy());

        scheduler.reset();
        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DevicePlatform), &transport);
        assert_eq!(transport.last_op(), Some(TransportOp::Read(Characteristic::DevicePlatform)));
    }

    #[test]
    fn test_write_echo_match() {
        let transport = MockTransport::new();
        let scheduler = scheduler();

        scheduler.submit(
            Lane::NetworkConfig,
            GattCommand::write(Characteristic::NetworkRx, vec![9]),
            &transport,
        );
        assert_eq!(scheduler.acknowledge_write(&[9]), WriteAck::Matched);
        assert!(scheduler.is_busy());
        scheduler.finish_read_write();
        assert!(!scheduler.is_rw_in_progress());
    }

    #[test]
    fn test_unexpected_write_ack() {
        let transport = MockTransport::new();
        let scheduler = scheduler();
        scheduler.submit(Lane::NetworkConfig, read(Characteristic::DeviceId), &transport);
        assert_eq!(scheduler.acknowledge_write(&[1]), WriteAck::Unexpected);
        assert!(!scheduler.is_stalled());
    }
}
