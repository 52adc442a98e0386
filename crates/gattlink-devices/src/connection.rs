//! Connection and initialization state machine.
//!
//! A pure transition function: inputs are link-level happenings, outputs
//! are the actions the session must carry out. The machine never touches
//! the transport itself.

use tracing::{debug, warn};

use crate::transport::BondState;

/// BLE connection lifecycle of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Link is up; services are being discovered and probed.
    Connected,
    /// Probe succeeded; reading device metadata and enabling notifications.
    Initializing,
    /// MTU negotiated and proxy services enabled.
    Initialized,
    /// A disconnect was requested and is waiting for the link to drop.
    Disconnecting,
}

impl ConnectionState {
    /// Characteristic operations are only dispatched in these states.
    pub fn is_link_up(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Initializing | ConnectionState::Initialized
        )
    }
}

/// Something that happened on the link or was requested by the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionInput {
    ConnectRequested,
    DisconnectRequested,
    LinkUp { bonding: bool },
    LinkDown,
    BondStateChanged { previous: BondState, current: BondState },
    ServicesDiscovered { success: bool, bonding: bool },
    /// A characteristic read completed successfully.
    ReadSucceeded,
    MtuChanged,
}

/// Work the session performs in response to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    Connect,
    Disconnect,
    Notify(ConnectionState),
    DiscoverServices,
    /// Read the firmware version to confirm the GATT database is usable.
    Probe,
    /// Read device metadata and enable TX notifications.
    Initialize,
    /// Write the proxy control characteristics.
    EnableServices,
    /// Close the broker session if one is active.
    DisconnectBroker,
    /// Drop queued commands and refuse further dispatch until the link
    /// resets.
    HaltCommands,
    /// Drop queued commands, buffers and negotiated MTU.
    ResetSession,
    Reconnect,
    /// Release the transport; the session ends.
    Close,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    auto_reconnect: bool,
    services_discovered: bool,
}

impl ConnectionMachine {
    pub fn new(auto_reconnect: bool) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            auto_reconnect,
            services_discovered: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn services_discovered(&self) -> bool {
        self.services_discovered
    }

    fn enter(&mut self, state: ConnectionState, actions: &mut Vec<ConnectionAction>) {
        debug!(from = ?self.state, to = ?state, "Connection state change");
        self.state = state;
        actions.push(ConnectionAction::Notify(state));
    }

    pub fn handle(&mut self, input: ConnectionInput) -> Vec<ConnectionAction> {
        use ConnectionAction as A;
        use ConnectionState as S;

        let mut actions = Vec::new();
        match input {
            ConnectionInput::ConnectRequested => {
                if self.state == S::Disconnected {
                    actions.push(A::Connect);
                } else {
                    warn!(state = ?self.state, "Connect requested while not disconnected");
                }
            }
            ConnectionInput::DisconnectRequested => {
                self.auto_reconnect = false;
                if self.state == S::Disconnected {
                    actions.push(A::Close);
                } else if self.state != S::Disconnecting {
                    self.enter(S::Disconnecting, &mut actions);
                    actions.push(A::HaltCommands);
                    actions.push(A::Disconnect);
                }
            }
            ConnectionInput::LinkUp { bonding } => {
                self.services_discovered = false;
                self.enter(S::Connected, &mut actions);
                if bonding {
                    debug!("Bonding in progress, deferring service discovery");
                } else {
                    actions.push(A::DiscoverServices);
                }
            }
            ConnectionInput::BondStateChanged { previous, current } => {
                let bond_completed =
                    previous == BondState::Bonding && current == BondState::Bonded;
                if bond_completed && self.state.is_link_up() {
                    if self.services_discovered {
                        actions.push(A::Probe);
                    } else {
                        actions.push(A::DiscoverServices);
                    }
                }
            }
            ConnectionInput::ServicesDiscovered { success, bonding } => {
                if success {
                    self.services_discovered = true;
                    if !bonding {
                        actions.push(A::Probe);
                    }
                } else {
                    warn!("Service discovery failed, disconnecting");
                    actions.push(A::Disconnect);
                }
            }
            ConnectionInput::ReadSucceeded => {
                if self.state == S::Connected {
                    self.enter(S::Initializing, &mut actions);
                    actions.push(A::Initialize);
                }
            }
            ConnectionInput::MtuChanged => {
                if self.state == S::Initializing {
                    self.enter(S::Initialized, &mut actions);
                }
                if self.state.is_link_up() {
                    actions.push(A::EnableServices);
                }
            }
            ConnectionInput::LinkDown => {
                self.services_discovered = false;
                actions.push(A::DisconnectBroker);
                actions.push(A::ResetSession);
                self.enter(S::Disconnected, &mut actions);
                if self.auto_reconnect {
                    actions.push(A::Reconnect);
                } else {
                    actions.push(A::Close);
                }
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionAction as A;
    use ConnectionState as S;

    fn connected(auto_reconnect: bool) -> ConnectionMachine {
        let mut machine = ConnectionMachine::new(auto_reconnect);
        machine.handle(ConnectionInput::LinkUp { bonding: false });
        machine
    }

    #[test]
    fn test_connect_only_from_disconnected() {
        let mut machine = ConnectionMachine::new(false);
        assert_eq!(machine.handle(ConnectionInput::ConnectRequested), vec![A::Connect]);
        // State only changes on the transport callback.
        assert_eq!(machine.state(), S::Disconnected);

        let mut machine = connected(false);
        assert!(machine.handle(ConnectionInput::ConnectRequested).is_empty());
    }

    #[test]
    fn test_full_initialization_sequence() {
        let mut machine = ConnectionMachine::new(false);

        assert_eq!(
            machine.handle(ConnectionInput::LinkUp { bonding: false }),
            vec![A::Notify(S::Connected), A::DiscoverServices]
        );
        assert_eq!(
            machine.handle(ConnectionInput::ServicesDiscovered {
                success: true,
                bonding: false
            }),
            vec![A::Probe]
        );
        assert_eq!(
            machine.handle(ConnectionInput::ReadSucceeded),
            vec![A::Notify(S::Initializing), A::Initialize]
        );
        // Later reads do not re-initialize.
        assert!(machine.handle(ConnectionInput::ReadSucceeded).is_empty());
        assert_eq!(
            machine.handle(ConnectionInput::MtuChanged),
            vec![A::Notify(S::Initialized), A::EnableServices]
        );
        assert_eq!(machine.state(), S::Initialized);
    }

    #[test]
    fn test_bonding_defers_discovery() {
        let mut machine = ConnectionMachine::new(false);
        assert_eq!(
            machine.handle(ConnectionInput::LinkUp { bonding: true }),
            vec![A::Notify(S::Connected)]
        );
        assert_eq!(
            machine.handle(ConnectionInput::BondStateChanged {
                previous: BondState::Bonding,
                current: BondState::Bonded
            }),
            vec![A::DiscoverServices]
        );
        assert_eq!(
            machine.handle(ConnectionInput::ServicesDiscovered {
                success: true,
                bonding: true
            }),
            Vec::new()
        );
        assert_eq!(
            machine.handle(ConnectionInput::BondStateChanged {
                previous: BondState::Bonding,
                current: BondState::Bonded
            }),
            vec![A::Probe]
        );
    }

    #[test]
    fn test_bond_change_other_than_completion_ignored() {
        let mut machine = connected(false);
        assert!(machine
            .handle(ConnectionInput::BondStateChanged {
                previous: BondState::None,
                current: BondState::Bonding
            })
            .is_empty());
    }

    #[test]
    fn test_discovery_failure_disconnects() {
        let mut machine = connected(false);
        assert_eq!(
            machine.handle(ConnectionInput::ServicesDiscovered {
                success: false,
                bonding: false
            }),
            vec![A::Disconnect]
        );
    }

    #[test]
    fn test_link_down_reconnects_when_enabled() {
        let mut machine = connected(true);
        assert_eq!(
            machine.handle(ConnectionInput::LinkDown),
            vec![
                A::DisconnectBroker,
                A::ResetSession,
                A::Notify(S::Disconnected),
                A::Reconnect
            ]
        );
        assert!(!machine.services_discovered());
    }

    #[test]
    fn test_user_disconnect_disables_reconnect() {
        let mut machine = connected(true);
        assert_eq!(
            machine.handle(ConnectionInput::DisconnectRequested),
            vec![A::Notify(S::Disconnecting), A::HaltCommands, A::Disconnect]
        );
        assert_eq!(machine.state(), S::Disconnecting);
        assert!(!machine.state().is_link_up());

        let actions = machine.handle(ConnectionInput::LinkDown);
        assert_eq!(actions.last(), Some(&A::Close));
        assert_eq!(machine.state(), S::Disconnected);
    }

    #[test]
    fn test_disconnect_when_already_disconnected_closes() {
        let mut machine = ConnectionMachine::new(true);
        assert_eq!(machine.handle(ConnectionInput::DisconnectRequested), vec![A::Close]);
    }
}
