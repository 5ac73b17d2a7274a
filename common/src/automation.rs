use crate::{
    config::{AutomationConfig, HeatStressGuard},
    types::{Mode, RelayCommand, SensorSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    DryNoRain,
    DryRaining,
    Saturated,
    HeatStress,
}

impl Rule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryNoRain => "soil dry, no rain",
            Self::DryRaining => "soil dry, rain detected",
            Self::Saturated => "soil moist enough",
            Self::HeatStress => "hot and dry conditions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub rule: Rule,
    pub command: RelayCommand,
}

#[derive(Debug, Clone, Default)]
pub struct AutomationEngine {
    pub config: AutomationConfig,
}

impl AutomationEngine {
    pub fn new(mut config: AutomationConfig) -> Self {
        config.sanitize();
        Self { config }
    }

    /// Evaluates the decision table in order; the first matching rule wins.
    /// Returns `None` outside of automatic mode and when no rule matches, in
    /// which case the pump keeps its previous state.
    pub fn decide(&self, sensors: &SensorSnapshot, mode: Mode) -> Option<Decision> {
        if mode != Mode::Auto {
            return None;
        }

        let moisture = sensors.soil_moisture_percent();
        let dry = moisture < self.config.dry_threshold_percent;

        let (rule, command) = if dry && !sensors.is_raining() {
            (Rule::DryNoRain, RelayCommand::Activate)
        } else if dry {
            (Rule::DryRaining, RelayCommand::Deactivate)
        } else if moisture >= self.config.saturated_threshold_percent {
            (Rule::Saturated, RelayCommand::Deactivate)
        } else if self.in_heat_stress_band(moisture)
            && sensors.air_temperature_c() >= self.config.heat_stress_temp_c
            && sensors.air_humidity_percent() <= self.config.heat_stress_max_humidity_percent
        {
            (Rule::HeatStress, RelayCommand::Activate)
        } else {
            return None;
        };

        Some(Decision { rule, command })
    }

    fn in_heat_stress_band(&self, moisture: u8) -> bool {
        let lower = self.config.dry_threshold_percent;
        let upper = self.config.heat_band_upper_percent;
        match self.config.heat_stress_guard {
            HeatStressGuard::AnyMoisture => moisture <= upper || moisture >= lower,
            HeatStressGuard::Band => (lower..=upper).contains(&moisture),
        }
    }
}
