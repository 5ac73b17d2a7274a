use thiserror::Error;
use tracing::{info, warn};

use crate::{config::ConnectivityConfig, topics::DeviceTopics, types::StatusPayload};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("network attachment failed: {0}")]
pub struct LinkError(pub String);

/// Broker failure carrying a PubSubClient-style diagnostic code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rc={code} ({})", describe_connect_code(*code))]
pub struct BrokerError {
    pub code: i32,
}

impl BrokerError {
    pub const CONNECTION_TIMEOUT: i32 = -4;
    pub const CONNECTION_LOST: i32 = -3;
    pub const CONNECT_FAILED: i32 = -2;
    pub const DISCONNECTED: i32 = -1;
    pub const BAD_PROTOCOL: i32 = 1;
    pub const BAD_CLIENT_ID: i32 = 2;
    pub const UNAVAILABLE: i32 = 3;
    pub const BAD_CREDENTIALS: i32 = 4;
    pub const UNAUTHORIZED: i32 = 5;

    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

pub fn describe_connect_code(code: i32) -> &'static str {
    match code {
        BrokerError::CONNECTION_TIMEOUT => "connection timeout",
        BrokerError::CONNECTION_LOST => "connection lost",
        BrokerError::CONNECT_FAILED => "connect failed",
        BrokerError::DISCONNECTED => "disconnected",
        BrokerError::BAD_PROTOCOL => "bad protocol",
        BrokerError::BAD_CLIENT_ID => "bad client id",
        BrokerError::UNAVAILABLE => "unavailable",
        BrokerError::BAD_CREDENTIALS => "bad credentials",
        BrokerError::UNAUTHORIZED => "unauthorized",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connectivity supervisor interrupted")]
pub struct Interrupted;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    AttachFailed(LinkError),
    Attached,
    ConnectFailed { client_id: String, error: BrokerError },
    Connected { client_id: String },
    SubscribeFailed { topic: String, error: BrokerError },
}

/// Network link and broker session as seen by the supervisor.
pub trait ConnectivityPort {
    fn network_attached(&self) -> bool;
    fn attach_network(&mut self) -> Result<(), LinkError>;
    fn broker_connected(&self) -> bool;
    fn connect_broker(&mut self, client_id: &str) -> Result<(), BrokerError>;
    fn disconnect_broker(&mut self);
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
    fn sleep_ms(&mut self, ms: u64);
    fn now_ms(&self) -> u64;

    fn interrupted(&self) -> bool {
        false
    }

    fn on_event(&mut self, _event: &ConnectivityEvent) {}
}

#[derive(Debug)]
pub struct ConnectivitySupervisor {
    config: ConnectivityConfig,
    topics: DeviceTopics,
    rng: fastrand::Rng,
    last_client_suffix: Option<u32>,
}

impl ConnectivitySupervisor {
    pub fn new(config: ConnectivityConfig, topics: DeviceTopics) -> Self {
        Self::with_rng(config, topics, fastrand::Rng::new())
    }

    pub fn with_rng(config: ConnectivityConfig, topics: DeviceTopics, rng: fastrand::Rng) -> Self {
        Self {
            config,
            topics,
            rng,
            last_client_suffix: None,
        }
    }

    /// Fresh identifier for the next broker session, never equal to the
    /// previous one so a half-closed session cannot collide with it.
    pub fn next_client_id(&mut self) -> String {
        let suffix = loop {
            let candidate = self.rng.u32(0..0xffff);
            if Some(candidate) != self.last_client_suffix {
                break candidate;
            }
        };
        self.last_client_suffix = Some(suffix);
        format!(
            "{}-{}-{suffix:x}",
            self.config.client_id_prefix,
            self.topics.device_id()
        )
    }

    /// Blocks until both the network link and the broker session are up.
    /// Returns the new client id when a session had to be (re)established,
    /// `None` when everything was already connected.
    pub fn ensure_connected<P: ConnectivityPort>(
        &mut self,
        port: &mut P,
    ) -> Result<Option<String>, Interrupted> {
        loop {
            if port.interrupted() {
                return Err(Interrupted);
            }

            if !port.network_attached() {
                if let Err(err) = port.attach_network() {
                    warn!(
                        "{err}; retrying in {} ms",
                        self.config.retry_delay_ms
                    );
                    port.on_event(&ConnectivityEvent::AttachFailed(err));
                    port.sleep_ms(self.config.retry_delay_ms);
                    continue;
                }
                info!("network attached");
                port.on_event(&ConnectivityEvent::Attached);
            }

            if port.broker_connected() {
                return Ok(None);
            }

            let client_id = self.next_client_id();
            info!("connecting to broker as {client_id}");
            if let Err(error) = port.connect_broker(&client_id) {
                warn!(
                    "broker connect failed for {client_id}, {error}; retrying in {} ms",
                    self.config.retry_delay_ms
                );
                port.on_event(&ConnectivityEvent::ConnectFailed { client_id, error });
                port.sleep_ms(self.config.retry_delay_ms);
                continue;
            }

            if let Err((topic, error)) = self.subscribe_all(port) {
                warn!("subscribe to {topic} failed, {error}; dropping session");
                port.on_event(&ConnectivityEvent::SubscribeFailed { topic, error });
                port.disconnect_broker();
                port.sleep_ms(self.config.retry_delay_ms);
                continue;
            }

            self.publish_online(port);
            info!("broker session established as {client_id}");
            port.on_event(&ConnectivityEvent::Connected {
                client_id: client_id.clone(),
            });
            return Ok(Some(client_id));
        }
    }

    fn subscribe_all<P: ConnectivityPort>(
        &self,
        port: &mut P,
    ) -> Result<(), (String, BrokerError)> {
        for topic in self.topics.subscriptions() {
            port.subscribe(topic)
                .map_err(|error| (topic.to_string(), error))?;
        }
        Ok(())
    }

    fn publish_online<P: ConnectivityPort>(&self, port: &mut P) {
        let payload = StatusPayload::new("online", port.now_ms());
        match serde_json::to_vec(&payload) {
            Ok(body) => {
                if let Err(err) = port.publish(self.topics.status(), body) {
                    warn!("online status publish failed: {err}");
                }
            }
            Err(err) => warn!("online status serialization failed: {err}"),
        }
    }
}
