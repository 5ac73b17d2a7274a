use std::collections::BTreeMap;

use crate::{
    automation::{AutomationEngine, Decision},
    types::{HeartbeatPayload, Mode, RelayId, RelayState, SensorSnapshot},
};

/// Process-wide device state. The control loop owns the single instance and
/// lends it to the ingestor and the automation tick; nothing else writes it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    mode: Mode,
    relays: BTreeMap<RelayId, RelayState>,
    last_decision: Option<Decision>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            mode: Mode::Auto,
            relays: RelayId::ALL
                .into_iter()
                .map(|relay| (relay, RelayState::Inactive))
                .collect(),
            last_decision: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn relay(&self, relay: RelayId) -> RelayState {
        self.relays
            .get(&relay)
            .copied()
            .unwrap_or(RelayState::Inactive)
    }

    pub fn relays(&self) -> impl Iterator<Item = (RelayId, RelayState)> + '_ {
        self.relays.iter().map(|(relay, state)| (*relay, *state))
    }

    pub fn last_decision(&self) -> Option<Decision> {
        self.last_decision
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) -> bool {
        if self.mode != mode {
            self.mode = mode;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_relay(&mut self, relay: RelayId, state: RelayState) -> bool {
        self.relays.insert(relay, state) != Some(state)
    }

    /// Runs one automation tick against the pump relay. Returns the relay
    /// transition when the decision changed the stored state.
    pub fn apply_automation(
        &mut self,
        engine: &AutomationEngine,
        sensors: &SensorSnapshot,
    ) -> Option<(RelayId, RelayState)> {
        let decision = engine.decide(sensors, self.mode)?;
        self.last_decision = Some(decision);

        let target = decision.command.target_state();
        if self.set_relay(RelayId::Pump, target) {
            Some((RelayId::Pump, target))
        } else {
            None
        }
    }

    pub fn heartbeat(&self, timestamp: u64) -> HeartbeatPayload {
        HeartbeatPayload {
            relay1_status: self.relay(RelayId::Pump).is_active(),
            timestamp,
        }
    }
}
