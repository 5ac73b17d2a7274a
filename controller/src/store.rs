use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::info;

use irrigation_common::RuntimeConfig;

const DEFAULT_DATA_DIR: &str = "./.irrigation";

#[derive(Debug, Clone)]
pub struct Store {
    data_dir: PathBuf,
    runtime_path: PathBuf,
}

impl Store {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("IRRIGATION_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
        Self::new(data_dir)
    }

    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            runtime_path: data_dir.join("runtime.json"),
            data_dir,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Loads `runtime.json`, writing the defaults out on first start so the
    /// file can be edited in place.
    pub fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match fs::read(&self.runtime_path) {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("malformed {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let runtime = RuntimeConfig::default();
                self.save_runtime_config(&runtime)?;
                info!("wrote default config to {}", self.runtime_path.display());
                Ok(runtime)
            }
            Err(err) => Err(err)
                .with_context(|| format!("failed to read {}", self.runtime_path.display())),
        }
    }

    pub fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        let payload = serde_json::to_vec_pretty(runtime)?;
        fs::write(&self.runtime_path, payload)
            .with_context(|| format!("failed to write {}", self.runtime_path.display()))
    }
}

/// Applies `MQTT_HOST`, `MQTT_PORT`, `MQTT_USER`, `MQTT_PASS` and `DEVICE_ID`
/// on top of the stored config.
pub fn apply_env_overrides(runtime: &mut RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        runtime.network.mqtt_port = port;
    }
    if let Some(user) = lookup("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Some(pass) = lookup("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
    if let Some(device_id) = lookup("DEVICE_ID") {
        runtime.network.device_id = device_id;
    }
}
