use std::collections::BTreeMap;

use tracing::info;

use irrigation_common::{
    ports::rain_detected, RelayDriver, RelayId, RelayState, SensorSnapshot, SensorSource,
    SensorUnavailable, SoilCalibration,
};

/// Stand-in for the soil probe, rain switch and DHT sensor on the host build.
/// The soil slowly dries out, gets a rain shower now and then, and the DHT
/// read fails occasionally the way the real part does.
pub struct SimulatedSensors {
    rng: fastrand::Rng,
    calibration: SoilCalibration,
    soil_raw: u16,
    tick: u64,
}

impl SimulatedSensors {
    pub fn new(rng: fastrand::Rng) -> Self {
        let calibration = SoilCalibration::default();
        Self {
            rng,
            soil_raw: calibration.wet_raw,
            calibration,
            tick: 0,
        }
    }
}

impl SensorSource for SimulatedSensors {
    fn read(&mut self) -> Result<SensorSnapshot, SensorUnavailable> {
        self.tick = self.tick.wrapping_add(1);

        let raining = self.tick % 60 >= 50;
        if raining {
            self.soil_raw = self.soil_raw.saturating_sub(120).max(self.calibration.wet_raw);
        } else {
            self.soil_raw = (self.soil_raw + self.rng.u16(10..60)).min(self.calibration.dry_raw);
        }

        if self.rng.u8(..) < 3 {
            return Err(SensorUnavailable::AirTemperature);
        }

        let temperature = 26.0 + (self.tick % 24) as f32 * 0.5 + self.rng.f32();
        let humidity = 55.0 - (self.tick % 24) as f32 + self.rng.f32() * 2.0;

        SensorSnapshot::new(
            Some(self.calibration.percent(self.soil_raw)),
            Some(temperature),
            Some(humidity),
            rain_detected(!raining),
        )
    }
}

/// Relay outputs on the host build only log their transitions.
#[derive(Debug, Default)]
pub struct LoggingRelays {
    states: BTreeMap<RelayId, RelayState>,
}

impl LoggingRelays {
    #[cfg(test)]
    pub fn state(&self, relay: RelayId) -> Option<RelayState> {
        self.states.get(&relay).copied()
    }
}

impl RelayDriver for LoggingRelays {
    fn drive(&mut self, relay: RelayId, state: RelayState) {
        if self.states.insert(relay, state) != Some(state) {
            info!("relay {} -> {}", relay.as_str(), state.as_str());
        }
    }
}
