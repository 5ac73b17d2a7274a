use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{info, warn};

use irrigation_common::{ota::hex_digest, DeviceTopics};

const IMAGE_PATH: &str = "/firmware.bin";

/// Image served to devices, loaded once at startup.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    version: String,
    bytes: Bytes,
    sha256: String,
}

impl FirmwareImage {
    pub fn new(version: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let sha256 = hex_digest(&Sha256::digest(&bytes));
        Self {
            version: version.into(),
            bytes,
            sha256,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct StartUpdate {
    action: &'static str,
    version: String,
    #[serde(rename = "firmwareUrl")]
    firmware_url: String,
    #[serde(rename = "firmwareSize")]
    firmware_size: usize,
    checksum: String,
}

impl StartUpdate {
    pub fn for_image(image: &FirmwareImage, public_base: &str) -> Self {
        Self {
            action: "start_update",
            version: image.version.clone(),
            firmware_url: format!("{}{IMAGE_PATH}", public_base.trim_end_matches('/')),
            firmware_size: image.len(),
            checksum: format!("sha256:{}", image.sha256),
        }
    }
}

#[derive(Debug, Clone)]
struct Settings {
    image_path: PathBuf,
    version: String,
    port: u16,
    public_base: String,
    device_id: String,
    publish_update: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_user: Option<String>,
    mqtt_pass: String,
}

impl Settings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("HTTP_PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8000);
        Self {
            image_path: lookup("FIRMWARE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("firmware.bin")),
            version: lookup("FIRMWARE_VERSION").unwrap_or_else(|| "dev".to_string()),
            public_base: lookup("PUBLIC_URL")
                .unwrap_or_else(|| format!("http://127.0.0.1:{port}")),
            port,
            device_id: lookup("DEVICE_ID").unwrap_or_else(|| "ESP32_001".to_string()),
            publish_update: lookup("PUBLISH_UPDATE").as_deref() == Some("1"),
            mqtt_host: lookup("MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: lookup("MQTT_PORT")
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or(1883),
            mqtt_user: lookup("MQTT_USER"),
            mqtt_pass: lookup("MQTT_PASS").unwrap_or_default(),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_lookup(|key| std::env::var(key).ok());
    let bytes = tokio::fs::read(&settings.image_path)
        .await
        .with_context(|| format!("failed to read {}", settings.image_path.display()))?;
    let image = Arc::new(FirmwareImage::new(settings.version.clone(), bytes));
    anyhow::ensure!(
        !image.is_empty(),
        "{} is empty",
        settings.image_path.display()
    );
    info!(
        "serving firmware {} from {} ({} bytes, sha256 {})",
        image.version,
        settings.image_path.display(),
        image.len(),
        image.sha256()
    );

    if settings.publish_update {
        publish_start_update(&settings, &image).await?;
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind firmware server at {addr}"))?;

    info!("firmware server listening on http://{addr}");
    axum::serve(listener, router(image)).await?;
    Ok(())
}

pub fn router(image: Arc<FirmwareImage>) -> Router {
    Router::new()
        .route(IMAGE_PATH, get(handle_get_firmware))
        .route("/latest", get(handle_get_latest))
        .route("/manifest", get(handle_get_manifest))
        .with_state(image)
}

async fn handle_get_firmware(State(image): State<Arc<FirmwareImage>>) -> impl IntoResponse {
    info!("serving firmware {} ({} bytes)", image.version, image.len());
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, image.len().to_string()),
        ],
        image.bytes.clone(),
    )
}

async fn handle_get_latest() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, IMAGE_PATH)])
}

async fn handle_get_manifest(State(image): State<Arc<FirmwareImage>>) -> impl IntoResponse {
    Json(StartUpdate::for_image(&image, ""))
}

async fn publish_start_update(settings: &Settings, image: &FirmwareImage) -> anyhow::Result<()> {
    let mut mqtt_options = MqttOptions::new(
        format!("firmware-server-{}", settings.device_id),
        settings.mqtt_host.clone(),
        settings.mqtt_port,
    );
    if let Some(user) = settings.mqtt_user.clone() {
        mqtt_options.set_credentials(user, settings.mqtt_pass.clone());
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 8);
    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("firmware server mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    let topics = DeviceTopics::new(&settings.device_id);
    let topic = topics.inbound(irrigation_common::Channel::FirmwareUpdate);
    let payload = serde_json::to_vec(&StartUpdate::for_image(image, &settings.public_base))?;
    mqtt.publish(topic, QoS::AtLeastOnce, false, payload)
        .await
        .context("failed to publish start_update")?;

    info!("published start_update for {} to {topic}", image.version);
    Ok(())
}
