use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;

use serde::Serialize;
use tracing::{debug, info, warn};

use irrigation_common::{
    handle_message,
    message::{decode, ControlMessage, FirmwareRequest},
    AutomationConfig, AutomationEngine, Channel, ConnectivityPort, ConnectivitySupervisor,
    DeviceState, DeviceTopics, FirmwareDescriptor, FirmwareResponse, HeartbeatPayload,
    IngestError, Ingested, Interrupted, OtaEvent, OtaPipeline, OtaPlatform, PartitionError,
    RelayDriver, RuntimeConfig, SensorDataPayload, SensorSnapshot, SensorSource,
    SessionSignal, StatusPayload, TransportError,
};

use crate::{
    firmware::{self, FilePartition, FileRegion, HttpBody},
    mqtt::MqttSession,
    sim::{LoggingRelays, SimulatedSensors},
    store::{apply_env_overrides, Store},
};

const SERVICE_WAIT: Duration = Duration::from_millis(50);
const UPDATE_SLOT_BYTES: u64 = 0x14_0000;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = Store::from_env();
    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());
    runtime.sanitize();

    let shutdown = Arc::new(AtomicBool::new(false));
    watch_ctrl_c(Arc::clone(&shutdown))?;

    info!(
        "irrigation controller {} starting as {} (broker {}:{})",
        env!("CARGO_PKG_VERSION"),
        runtime.network.device_id,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port
    );

    let device = Device::new(
        runtime.automation.clone(),
        SimulatedSensors::new(fastrand::Rng::new()),
        LoggingRelays::default(),
    );
    let partition = FilePartition::new(store.data_dir().join("firmware"), UPDATE_SLOT_BYTES);
    let mut host = Host::new(runtime, device, partition, shutdown);
    host.run()
}

fn watch_ctrl_c(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || match runtime.block_on(tokio::signal::ctrl_c()) {
            Ok(()) => {
                info!("ctrl-c received, stopping");
                shutdown.store(true, Ordering::Relaxed);
            }
            Err(err) => warn!("failed to listen for ctrl-c: {err}"),
        })
        .context("failed to spawn ctrl-c watcher")?;
    Ok(())
}

/// Device state plus the sensors and relays it is wired to.
pub struct Device<S, R> {
    state: DeviceState,
    engine: AutomationEngine,
    sensors: S,
    relays: R,
    last_reading: Option<SensorSnapshot>,
}

impl<S: SensorSource, R: RelayDriver> Device<S, R> {
    pub fn new(automation: AutomationConfig, sensors: S, mut relays: R) -> Self {
        let state = DeviceState::new();
        for (relay, relay_state) in state.relays() {
            relays.drive(relay, relay_state);
        }

        Self {
            state,
            engine: AutomationEngine::new(automation),
            sensors,
            relays,
            last_reading: None,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    #[cfg(test)]
    pub fn relays(&self) -> &R {
        &self.relays
    }

    pub fn ingest(&mut self, channel: Channel, payload: &[u8]) -> Result<Ingested, IngestError> {
        let ingested = handle_message(&mut self.state, channel, payload)?;
        if let Ingested::Relay {
            relay,
            state,
            changed: true,
        } = ingested
        {
            self.relays.drive(relay, state);
        }
        Ok(ingested)
    }

    /// One control tick: read the sensors and let automation move the pump.
    pub fn tick(&mut self) {
        let snapshot = match self.sensors.read() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("skipping control tick: {err}");
                self.last_reading = None;
                return;
            }
        };

        if let Some((relay, relay_state)) = self.state.apply_automation(&self.engine, &snapshot) {
            if let Some(decision) = self.state.last_decision() {
                info!(
                    "automation: {} -> {} {}",
                    decision.rule.as_str(),
                    relay.as_str(),
                    relay_state.as_str()
                );
            }
            self.relays.drive(relay, relay_state);
        }
        self.last_reading = Some(snapshot);
    }

    pub fn sensor_payload(&self) -> Option<SensorDataPayload> {
        self.last_reading.as_ref().map(SensorSnapshot::data_payload)
    }

    pub fn heartbeat(&self, timestamp: u64) -> HeartbeatPayload {
        self.state.heartbeat(timestamp)
    }
}

struct Host<S, R> {
    config: RuntimeConfig,
    topics: DeviceTopics,
    device: Device<S, R>,
    supervisor: ConnectivitySupervisor,
    pipeline: OtaPipeline,
    session: MqttSession,
    partition: FilePartition,
    pending: VecDeque<(Channel, Vec<u8>)>,
}

impl<S: SensorSource, R: RelayDriver> Host<S, R> {
    fn new(
        config: RuntimeConfig,
        device: Device<S, R>,
        partition: FilePartition,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let topics = DeviceTopics::new(&config.network.device_id);
        Self {
            supervisor: ConnectivitySupervisor::new(config.connectivity.clone(), topics.clone()),
            pipeline: OtaPipeline::new(config.ota.clone()),
            session: MqttSession::new(config.network.clone(), &config.connectivity, shutdown),
            topics,
            device,
            partition,
            pending: VecDeque::new(),
            config,
        }
    }

    /// Runs until ctrl-c, or until a firmware update has been committed and
    /// the reboot grace period has elapsed.
    fn run(&mut self) -> anyhow::Result<()> {
        let telemetry = self.config.telemetry.clone();
        let mut last_tick = None;
        let mut last_sensor_publish = None;
        let mut last_heartbeat = None;

        loop {
            if let Err(Interrupted) = self.supervisor.ensure_connected(&mut self.session) {
                info!("controller stopped");
                self.session.disconnect_broker();
                return Ok(());
            }
            self.session.pump(SERVICE_WAIT);
            self.queue_inbound();

            while let Some((channel, payload)) = self.pending.pop_front() {
                let Some(descriptor) = self.dispatch(channel, &payload) else {
                    continue;
                };
                if self.apply_update(&descriptor) {
                    return Ok(());
                }
            }

            let now = monotonic_ms();
            if is_due(last_tick, now, telemetry.loop_interval_ms) {
                last_tick = Some(now);
                self.device.tick();
            }
            if is_due(last_sensor_publish, now, telemetry.sensor_publish_interval_ms) {
                last_sensor_publish = Some(now);
                if let Some(payload) = self.device.sensor_payload() {
                    publish_json(&mut self.session, self.topics.sensor_data(), &payload);
                }
            }
            if is_due(last_heartbeat, now, telemetry.heartbeat_interval_ms) {
                last_heartbeat = Some(now);
                let heartbeat = self.device.heartbeat(now);
                debug!(
                    "heartbeat: mode {}, pump active {}",
                    self.device.state().mode().as_str(),
                    heartbeat.relay1_status
                );
                publish_json(&mut self.session, self.topics.heartbeat(), &heartbeat);
            }
        }
    }

    fn queue_inbound(&mut self) {
        for (topic, payload) in self.session.take_inbound() {
            match self.topics.channel_for(&topic) {
                Some(channel) => self.pending.push_back((channel, payload)),
                None => debug!("ignoring message on {topic}"),
            }
        }
    }

    fn dispatch(&mut self, channel: Channel, payload: &[u8]) -> Option<FirmwareDescriptor> {
        match self.device.ingest(channel, payload) {
            Ok(Ingested::StartUpdate(descriptor)) => Some(descriptor),
            Ok(Ingested::CancelUpdate) => {
                info!("cancel requested but no firmware update is running");
                None
            }
            Ok(_) | Err(_) => None,
        }
    }

    /// Returns true once a new image is committed and the device should
    /// restart.
    fn apply_update(&mut self, descriptor: &FirmwareDescriptor) -> bool {
        let mut platform = UpdatePlatform {
            session: &mut self.session,
            topics: &self.topics,
            partition: &self.partition,
            pending: &mut self.pending,
            reboot_in_ms: None,
        };
        let result = self.pipeline.run(&mut platform, descriptor);
        let reboot_in_ms = platform.reboot_in_ms;

        match (result, reboot_in_ms) {
            (Ok(report), Some(grace_ms)) => {
                info!(
                    "restarting into firmware {} in {grace_ms} ms",
                    report.version
                );
                let deadline = Instant::now() + Duration::from_millis(grace_ms);
                while Instant::now() < deadline {
                    self.session.pump(SERVICE_WAIT);
                }
                true
            }
            _ => false,
        }
    }
}

/// Hooks the update pipeline up to the live broker session, the firmware
/// HTTP client and the file-backed update slot.
struct UpdatePlatform<'a> {
    session: &'a mut MqttSession,
    topics: &'a DeviceTopics,
    partition: &'a FilePartition,
    pending: &'a mut VecDeque<(Channel, Vec<u8>)>,
    reboot_in_ms: Option<u64>,
}

impl OtaPlatform for UpdatePlatform<'_> {
    type Body = HttpBody;
    type Region = FileRegion;

    fn request(
        &mut self,
        url: &str,
        timeout_ms: u64,
    ) -> Result<FirmwareResponse<HttpBody>, TransportError> {
        firmware::fetch(url, timeout_ms)
    }

    fn allocate(&mut self, size: u32) -> Result<FileRegion, PartitionError> {
        self.partition.allocate(size)
    }

    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn link_attached(&self) -> bool {
        self.session.network_attached()
    }

    fn service_session(&mut self) -> SessionSignal {
        self.session.pump(Duration::ZERO);
        if self.session.interrupted() {
            return SessionSignal::Cancel;
        }
        route_during_update(self.topics, self.session.take_inbound(), self.pending)
    }

    fn notify(&mut self, event: &OtaEvent) {
        let status = match event {
            OtaEvent::Started { .. } => "ota_started",
            OtaEvent::Aborted { .. } => "ota_failed",
            OtaEvent::Committed { .. } => "ota_success",
            OtaEvent::Progress { bytes, total } => {
                info!("firmware download {bytes}/{total} bytes");
                return;
            }
        };
        publish_json(
            self.session,
            self.topics.status(),
            &StatusPayload::new(status, monotonic_ms()),
        );
    }

    fn schedule_reboot(&mut self, grace_ms: u64) {
        self.reboot_in_ms = Some(grace_ms);
    }
}

/// Sorts messages that arrive while an update is downloading: a cancel stops
/// the download, a second start is dropped and everything else waits in
/// `pending` until the pipeline returns.
fn route_during_update(
    topics: &DeviceTopics,
    inbound: Vec<(String, Vec<u8>)>,
    pending: &mut VecDeque<(Channel, Vec<u8>)>,
) -> SessionSignal {
    let mut signal = SessionSignal::Continue;
    for (topic, payload) in inbound {
        let Some(channel) = topics.channel_for(&topic) else {
            continue;
        };
        if channel != Channel::FirmwareUpdate {
            pending.push_back((channel, payload));
            continue;
        }

        match decode(channel, &payload) {
            Ok(ControlMessage::FirmwareUpdate(FirmwareRequest::Cancel)) => {
                info!("firmware update cancelled by remote request");
                signal = SessionSignal::Cancel;
            }
            Ok(ControlMessage::FirmwareUpdate(FirmwareRequest::Start(descriptor))) => {
                warn!(
                    "ignoring update to {}: an update is already running",
                    descriptor.version_label()
                );
            }
            _ => pending.push_back((channel, payload)),
        }
    }
    signal
}

fn publish_json<T: Serialize>(session: &mut MqttSession, topic: &str, payload: &T) {
    match serde_json::to_vec(payload) {
        Ok(body) => {
            if let Err(err) = session.publish(topic, body) {
                warn!("publish to {topic} failed: {err}");
            }
        }
        Err(err) => warn!("serialization for {topic} failed: {err}"),
    }
}

fn is_due(last_ms: Option<u64>, now_ms: u64, interval_ms: u64) -> bool {
    last_ms.is_none_or(|last| now_ms.saturating_sub(last) >= interval_ms)
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use irrigation_common::{Mode, RelayId, RelayState, SensorUnavailable};

    use super::*;

    struct ScriptedSensors(VecDeque<Result<SensorSnapshot, SensorUnavailable>>);

    impl SensorSource for ScriptedSensors {
        fn read(&mut self) -> Result<SensorSnapshot, SensorUnavailable> {
            self.0
                .pop_front()
                .unwrap_or(Err(SensorUnavailable::SoilMoisture))
        }
    }

    #[derive(Default)]
    struct RecordingRelays(Vec<(RelayId, RelayState)>);

    impl RelayDriver for RecordingRelays {
        fn drive(&mut self, relay: RelayId, state: RelayState) {
            self.0.push((relay, state));
        }
    }

    fn reading(moisture: f32, raining: bool) -> Result<SensorSnapshot, SensorUnavailable> {
        SensorSnapshot::new(Some(moisture), Some(24.0), Some(60.0), raining)
    }

    fn device(
        readings: Vec<Result<SensorSnapshot, SensorUnavailable>>,
    ) -> Device<ScriptedSensors, RecordingRelays> {
        Device::new(
            AutomationConfig::default(),
            ScriptedSensors(readings.into()),
            RecordingRelays::default(),
        )
    }

    #[test]
    fn boot_drives_every_relay_inactive() {
        let device = device(vec![]);

        assert_eq!(
            device.relays().0,
            &[
                (RelayId::Pump, RelayState::Inactive),
                (RelayId::Relay2, RelayState::Inactive),
            ]
        );
    }

    #[test]
    fn tick_drives_pump_on_transition_only() {
        let mut device = device(vec![
            reading(10.0, false),
            reading(12.0, false),
            reading(90.0, false),
        ]);

        device.tick();
        device.tick();
        device.tick();

        assert_eq!(
            &device.relays().0[2..],
            &[
                (RelayId::Pump, RelayState::Active),
                (RelayId::Pump, RelayState::Inactive),
            ]
        );
        assert_eq!(device.sensor_payload().map(|p| p.soil_moisture), Some(90));
    }

    #[test]
    fn unavailable_sensor_skips_tick() {
        let mut device = device(vec![reading(10.0, false), Err(SensorUnavailable::AirHumidity)]);

        device.tick();
        device.tick();

        assert_eq!(device.state().relay(RelayId::Pump), RelayState::Active);
        assert_eq!(device.relays().0.len(), 3);
        assert_eq!(device.sensor_payload(), None);
    }

    #[test]
    fn remote_commands_reach_the_relays() {
        let mut device = device(vec![]);
        device
            .ingest(Channel::Config, br#"{"mode":"manual"}"#)
            .unwrap();
        device
            .ingest(Channel::Command, br#"{"action":"relay2_on"}"#)
            .unwrap();
        device
            .ingest(Channel::Command, br#"{"action":"relay2_on"}"#)
            .unwrap();

        assert_eq!(device.state().mode(), Mode::Manual);
        assert_eq!(
            device.relays().0.last(),
            Some(&(RelayId::Relay2, RelayState::Active))
        );
        assert_eq!(device.relays().0.len(), 3);
    }

    #[test]
    fn heartbeat_reflects_pump() {
        let mut device = device(vec![]);
        device
            .ingest(Channel::Command, br#"{"action":"pump_on"}"#)
            .unwrap();

        let heartbeat = device.heartbeat(42);
        assert!(heartbeat.relay1_status);
        assert_eq!(heartbeat.timestamp, 42);
    }

    #[test]
    fn intervals_fire_immediately_then_on_schedule() {
        assert!(is_due(None, 0, 5_000));
        assert!(!is_due(Some(1_000), 5_999, 5_000));
        assert!(is_due(Some(1_000), 6_000, 5_000));
    }

    fn inbound(topics: &DeviceTopics, channel: Channel, payload: &str) -> (String, Vec<u8>) {
        (topics.inbound(channel).to_string(), payload.as_bytes().to_vec())
    }

    #[test]
    fn cancel_during_update_stops_the_download() {
        let topics = DeviceTopics::new("ESP32_001");
        let mut pending = VecDeque::new();

        let signal = route_during_update(
            &topics,
            vec![inbound(&topics, Channel::FirmwareUpdate, r#"{"action":"cancel_update"}"#)],
            &mut pending,
        );

        assert_eq!(signal, SessionSignal::Cancel);
        assert!(pending.is_empty());
    }

    #[test]
    fn other_messages_wait_for_the_update_to_finish() {
        let topics = DeviceTopics::new("ESP32_001");
        let mut pending = VecDeque::new();

        let signal = route_during_update(
            &topics,
            vec![
                inbound(&topics, Channel::Command, r#"{"action":"pump_on"}"#),
                ("iot/device/other/command".to_string(), b"{}".to_vec()),
                inbound(&topics, Channel::Config, r#"{"mode":"manual"}"#),
                inbound(&topics, Channel::FirmwareUpdate, r#"{"action":"rollback"}"#),
            ],
            &mut pending,
        );

        assert_eq!(signal, SessionSignal::Continue);
        let queued: Vec<Channel> = pending.iter().map(|(channel, _)| *channel).collect();
        assert_eq!(
            queued,
            vec![Channel::Command, Channel::Config, Channel::FirmwareUpdate]
        );
        assert_eq!(pending[0].1, br#"{"action":"pump_on"}"#);
    }

    #[test]
    fn second_start_during_update_is_ignored() {
        let topics = DeviceTopics::new("ESP32_001");
        let mut pending = VecDeque::new();

        let signal = route_during_update(
            &topics,
            vec![inbound(
                &topics,
                Channel::FirmwareUpdate,
                r#"{"action":"start_update","version":"9.9.9","firmwareUrl":"http://h/f.bin"}"#,
            )],
            &mut pending,
        );

        assert_eq!(signal, SessionSignal::Continue);
        assert!(pending.is_empty());
    }
}
