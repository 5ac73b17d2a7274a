use crate::types::{RelayId, RelayState, SensorSnapshot, SensorUnavailable};

pub trait SensorSource {
    fn read(&mut self) -> Result<SensorSnapshot, SensorUnavailable>;
}

/// Physical relay outputs. The driver mirrors `DeviceState`; it never decides.
pub trait RelayDriver {
    fn drive(&mut self, relay: RelayId, state: RelayState);
}

/// Two-point calibration of the capacitive soil probe: the raw ADC value read
/// in dry air maps to 0 %, the value read in water maps to 100 %.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoilCalibration {
    pub dry_raw: u16,
    pub wet_raw: u16,
}

impl Default for SoilCalibration {
    fn default() -> Self {
        Self {
            dry_raw: 4095,
            wet_raw: 1800,
        }
    }
}

impl SoilCalibration {
    pub fn percent(&self, raw: u16) -> f32 {
        let span = i32::from(self.wet_raw) - i32::from(self.dry_raw);
        if span == 0 {
            return 0.0;
        }
        let scaled = (i32::from(raw) - i32::from(self.dry_raw)) * 100 / span;
        scaled.clamp(0, 100) as f32
    }
}

/// The rain sensor pulls its output low when wet.
pub fn rain_detected(level_high: bool) -> bool {
    !level_high
}
