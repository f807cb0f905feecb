use std::ops::{Deref, DerefMut};

use statig::{
    Response,
    prelude::{InitializedStateMachine, IntoStateMachineExt as _},
    state_machine,
};
use tracing::{debug, error, trace};

use crate::antfs::{Beacon, DeviceState};

/// Events driving the ANT-FS host state machine.
#[derive(Clone, Debug)]
pub enum HostEvent {
    /// The host (re)opened its search channel.
    Search,
    /// A beacon was received from the tracked device.
    Beacon(Beacon),
    /// The host dropped the link.
    Disconnect,
}

/// Data recorded while handling events, read back by the driver.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostContext {
    pub beacon: Option<Beacon>,
}

#[derive(Debug, Clone)]
pub struct HostMachine(InitializedStateMachine<HostState>);
impl Deref for HostMachine {
    type Target = InitializedStateMachine<HostState>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl DerefMut for HostMachine {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
impl HostMachine {
    pub fn new(ctx: &mut HostContext) -> Self {
        let sm = HostState::default()
            .uninitialized_state_machine()
            .init_with_context(ctx);
        Self(sm)
    }
}

#[derive(Debug, Default, Clone)]
pub struct HostState {
    /// Device state from the last beacon seen while linked.
    pub device_state: Option<DeviceState>,
}

#[state_machine(
    initial = "State::disconnected()",
    before_transition = "Self::before_transition",
    after_transition = "Self::after_transition",
    state(derive(Clone, Debug, PartialEq, Eq)),
    superstate(derive(Clone, Debug))
)]
impl HostState {
    fn before_transition(&mut self, source: &State, target: &State) {
        trace!("before transitioning from `{source:?}` to `{target:?}`");
    }
    fn after_transition(&mut self, source: &State, target: &State) {
        debug!("transitioned from `{source:?}` to `{target:?}`");
    }

    fn record(&mut self, context: &mut HostContext, beacon: &Beacon) {
        self.device_state = Some(beacon.state);
        context.beacon = Some(beacon.clone());
    }

    #[state]
    fn disconnected(event: &HostEvent) -> Response<State> {
        match event {
            HostEvent::Search => Response::Transition(State::search()),
            HostEvent::Beacon(_) | HostEvent::Disconnect => Response::Handled,
        }
    }

    #[state]
    fn search(&mut self, context: &mut HostContext, event: &HostEvent) -> Response<State> {
        match event {
            HostEvent::Beacon(beacon) if beacon.state == DeviceState::Link => {
                self.record(context, beacon);
                Response::Transition(State::link())
            }
            // beacons from devices busy with another host are not ours to track
            HostEvent::Beacon(_) | HostEvent::Search => Response::Handled,
            HostEvent::Disconnect => Response::Transition(State::disconnected()),
        }
    }

    #[state]
    fn link(&mut self, context: &mut HostContext, event: &HostEvent) -> Response<State> {
        match event {
            HostEvent::Beacon(beacon) => {
                self.record(context, beacon);
                match beacon.state {
                    DeviceState::Link | DeviceState::Busy => Response::Handled,
                    DeviceState::Authentication => Response::Transition(State::authentication()),
                    DeviceState::Transport => {
                        error!("Unexpected beacon {beacon:?} in LINK");
                        Response::Transition(State::error())
                    }
                }
            }
            HostEvent::Search => Response::Transition(State::search()),
            HostEvent::Disconnect => Response::Transition(State::disconnected()),
        }
    }

    #[state]
    fn authentication(&mut self, context: &mut HostContext, event: &HostEvent) -> Response<State> {
        match event {
            HostEvent::Beacon(beacon) => {
                self.record(context, beacon);
                match beacon.state {
                    DeviceState::Authentication | DeviceState::Busy => Response::Handled,
                    DeviceState::Transport => Response::Transition(State::transport()),
                    DeviceState::Link => Response::Transition(State::link()),
                }
            }
            HostEvent::Search => Response::Transition(State::search()),
            HostEvent::Disconnect => Response::Transition(State::disconnected()),
        }
    }

    #[state]
    fn transport(&mut self, context: &mut HostContext, event: &HostEvent) -> Response<State> {
        match event {
            HostEvent::Beacon(beacon) => {
                self.record(context, beacon);
                match beacon.state {
                    DeviceState::Transport | DeviceState::Busy => Response::Handled,
                    DeviceState::Authentication => Response::Transition(State::authentication()),
                    DeviceState::Link => Response::Transition(State::link()),
                }
            }
            HostEvent::Search => Response::Transition(State::search()),
            HostEvent::Disconnect => Response::Transition(State::disconnected()),
        }
    }

    /// Entered on an out of order beacon; only a new search or a disconnect
    /// leaves it.
    #[state]
    fn error(event: &HostEvent) -> Response<State> {
        match event {
            HostEvent::Search => Response::Transition(State::search()),
            HostEvent::Disconnect => Response::Transition(State::disconnected()),
            HostEvent::Beacon(_) => Response::Handled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(state: DeviceState) -> HostEvent {
        HostEvent::Beacon(Beacon {
            period: 4,
            data_available: true,
            upload_enabled: false,
            pairing_enabled: true,
            state,
            auth_type: 3,
            descriptor: 0,
            data: Vec::new(),
        })
    }

    fn machine() -> (HostMachine, HostContext) {
        let mut ctx = HostContext::default();
        let sm = HostMachine::new(&mut ctx);
        (sm, ctx)
    }

    #[test]
    fn link_auth_transport() {
        let (mut sm, mut ctx) = machine();
        assert_eq!(*sm.state(), State::Disconnected {});
        for (event, expected) in [
            (HostEvent::Search, State::Search {}),
            (beacon(DeviceState::Link), State::Link {}),
            (beacon(DeviceState::Authentication), State::Authentication {}),
            (beacon(DeviceState::Transport), State::Transport {}),
            (beacon(DeviceState::Busy), State::Transport {}),
        ] {
            sm.handle_with_context(&event, &mut ctx);
            assert_eq!(*sm.state(), expected);
        }
        assert_eq!(sm.device_state, Some(DeviceState::Busy));
        assert_eq!(ctx.beacon.map(|b| b.state), Some(DeviceState::Busy));
    }

    #[test]
    fn transport_straight_after_link_is_an_error() {
        let (mut sm, mut ctx) = machine();
        sm.handle_with_context(&HostEvent::Search, &mut ctx);
        sm.handle_with_context(&beacon(DeviceState::Link), &mut ctx);
        sm.handle_with_context(&beacon(DeviceState::Transport), &mut ctx);
        assert_eq!(*sm.state(), State::Error {});

        sm.handle_with_context(&HostEvent::Search, &mut ctx);
        assert_eq!(*sm.state(), State::Search {});
    }

    #[test]
    fn search_ignores_busy_devices() {
        let (mut sm, mut ctx) = machine();
        sm.handle_with_context(&HostEvent::Search, &mut ctx);
        sm.handle_with_context(&beacon(DeviceState::Transport), &mut ctx);
        assert_eq!(*sm.state(), State::Search {});
        assert_eq!(ctx.beacon, None);
    }

    #[test]
    fn rejected_auth_reverts_to_link() {
        let (mut sm, mut ctx) = machine();
        sm.handle_with_context(&HostEvent::Search, &mut ctx);
        sm.handle_with_context(&beacon(DeviceState::Link), &mut ctx);
        sm.handle_with_context(&beacon(DeviceState::Authentication), &mut ctx);
        sm.handle_with_context(&beacon(DeviceState::Link), &mut ctx);
        assert_eq!(*sm.state(), State::Link {});
        sm.handle_with_context(&HostEvent::Disconnect, &mut ctx);
        assert_eq!(*sm.state(), State::Disconnected {});
    }
}
