use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatStressGuard {
    /// `m <= upper || m >= lower`, which holds for every moisture value.
    AnyMoisture,
    /// `lower <= m <= upper`.
    Band,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutomationConfig {
    pub dry_threshold_percent: u8,
    pub saturated_threshold_percent: u8,
    pub heat_band_upper_percent: u8,
    pub heat_stress_temp_c: f32,
    pub heat_stress_max_humidity_percent: f32,
    pub heat_stress_guard: HeatStressGuard,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            dry_threshold_percent: 40,
            saturated_threshold_percent: 80,
            heat_band_upper_percent: 60,
            heat_stress_temp_c: 35.0,
            heat_stress_max_humidity_percent: 40.0,
            heat_stress_guard: HeatStressGuard::AnyMoisture,
        }
    }
}

impl AutomationConfig {
    pub fn sanitize(&mut self) {
        self.dry_threshold_percent = self.dry_threshold_percent.min(100);
        self.saturated_threshold_percent = self
            .saturated_threshold_percent
            .clamp(self.dry_threshold_percent, 100);
        self.heat_band_upper_percent = self
            .heat_band_upper_percent
            .clamp(self.dry_threshold_percent, self.saturated_threshold_percent);

        if !self.heat_stress_temp_c.is_finite() {
            self.heat_stress_temp_c = 35.0;
        }
        if !self.heat_stress_max_humidity_percent.is_finite() {
            self.heat_stress_max_humidity_percent = 40.0;
        }
        self.heat_stress_max_humidity_percent =
            self.heat_stress_max_humidity_percent.clamp(0.0, 100.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub retry_delay_ms: u64,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 5_000,
            client_id_prefix: "ESP32".to_string(),
            keep_alive_secs: 60,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub request_timeout_ms: u64,
    pub stall_timeout_ms: u64,
    pub progress_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub reboot_grace_ms: u64,
    pub chunk_size: usize,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 120_000,
            stall_timeout_ms: 60_000,
            progress_interval_ms: 5_000,
            poll_interval_ms: 10,
            reboot_grace_ms: 3_000,
            chunk_size: 1_024,
        }
    }
}

impl OtaConfig {
    pub fn sanitize(&mut self) {
        self.chunk_size = self.chunk_size.clamp(64, 16 * 1024);
        self.poll_interval_ms = self.poll_interval_ms.clamp(1, 1_000);
        if self.stall_timeout_ms == 0 {
            self.stall_timeout_ms = 60_000;
        }
        if self.request_timeout_ms == 0 {
            self.request_timeout_ms = 120_000;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub loop_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub sensor_publish_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            sensor_publish_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub device_id: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            device_id: "ESP32_001".to_string(),
            mqtt_host: "broker.hivemq.com".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub ota: OtaConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.automation.sanitize();
        self.ota.sanitize();

        if self.network.device_id.trim().is_empty() {
            self.network.device_id = NetworkConfig::default().device_id;
        }
        if self.network.mqtt_port == 0 {
            self.network.mqtt_port = 1883;
        }
        if self.connectivity.retry_delay_ms == 0 {
            self.connectivity.retry_delay_ms = 5_000;
        }
        if self.telemetry.loop_interval_ms == 0 {
            self.telemetry.loop_interval_ms = 5_000;
        }
    }
}
