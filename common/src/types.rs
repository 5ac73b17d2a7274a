use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Manual,
    Schedule,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Schedule => "schedule",
        }
    }

    /// Parses the wire value of a config message. Matching is exact
    /// (lowercase), anything else is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            "schedule" => Some(Self::Schedule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayId {
    Pump,
    Relay2,
}

impl RelayId {
    pub const ALL: [RelayId; 2] = [RelayId::Pump, RelayId::Relay2];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pump => "pump",
            Self::Relay2 => "relay2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayState {
    Active,
    Inactive,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
        }
    }

    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    Activate,
    Deactivate,
}

impl RelayCommand {
    pub fn target_state(self) -> RelayState {
        match self {
            Self::Activate => RelayState::Active,
            Self::Deactivate => RelayState::Inactive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorUnavailable {
    #[error("soil moisture reading unavailable")]
    SoilMoisture,
    #[error("air temperature reading unavailable")]
    AirTemperature,
    #[error("air humidity reading unavailable")]
    AirHumidity,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSnapshot {
    soil_moisture_percent: u8,
    air_temperature_c: f32,
    air_humidity_percent: f32,
    is_raining: bool,
}

impl SensorSnapshot {
    /// Builds a snapshot from already-scaled readings. Percentages are clamped
    /// to 0..=100 and soil moisture is truncated to whole percent, so 39.9 is
    /// still below 40. A missing or non-finite reading is reported, never zeroed.
    pub fn new(
        soil_moisture_percent: Option<f32>,
        air_temperature_c: Option<f32>,
        air_humidity_percent: Option<f32>,
        is_raining: bool,
    ) -> Result<Self, SensorUnavailable> {
        let soil = soil_moisture_percent
            .filter(|value| value.is_finite())
            .ok_or(SensorUnavailable::SoilMoisture)?;
        let temp = air_temperature_c
            .filter(|value| value.is_finite())
            .ok_or(SensorUnavailable::AirTemperature)?;
        let humidity = air_humidity_percent
            .filter(|value| value.is_finite())
            .ok_or(SensorUnavailable::AirHumidity)?;

        Ok(Self {
            soil_moisture_percent: soil.clamp(0.0, 100.0).trunc() as u8,
            air_temperature_c: temp,
            air_humidity_percent: humidity.clamp(0.0, 100.0),
            is_raining,
        })
    }

    pub fn soil_moisture_percent(&self) -> u8 {
        self.soil_moisture_percent
    }

    pub fn air_temperature_c(&self) -> f32 {
        self.air_temperature_c
    }

    pub fn air_humidity_percent(&self) -> f32 {
        self.air_humidity_percent
    }

    pub fn is_raining(&self) -> bool {
        self.is_raining
    }

    pub fn data_payload(&self) -> SensorDataPayload {
        SensorDataPayload {
            temperature: self.air_temperature_c,
            humidity: self.air_humidity_percent,
            soil_moisture: self.soil_moisture_percent,
            is_rain: self.is_raining,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDataPayload {
    pub temperature: f32,
    pub humidity: f32,
    #[serde(rename = "soilMoisture")]
    pub soil_moisture: u8,
    #[serde(rename = "isRain")]
    pub is_rain: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusPayload {
    pub status: String,
    pub timestamp: u64,
}

impl StatusPayload {
    pub fn new(status: impl Into<String>, timestamp: u64) -> Self {
        Self {
            status: status.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "relay1Status")]
    pub relay1_status: bool,
    pub timestamp: u64,
}
