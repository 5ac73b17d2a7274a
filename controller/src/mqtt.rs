use std::{
    collections::VecDeque,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, Incoming, MqttOptions, QoS,
    RecvTimeoutError, TryRecvError,
};
use tracing::{debug, info, warn};

use irrigation_common::{
    BrokerError, ConnectivityConfig, ConnectivityEvent, ConnectivityPort, LinkError,
    NetworkConfig,
};

use crate::host::monotonic_ms;

const REQUEST_CAPACITY: usize = 32;
const SLEEP_SLICE: Duration = Duration::from_millis(100);

enum Polled {
    Event(Event),
    Idle,
    Lost(String),
}

/// Broker session on the blocking rumqttc client. Every call returns within
/// the wait it is given so the control loop stays cooperative.
pub struct MqttSession {
    network: NetworkConfig,
    keep_alive: Duration,
    connect_timeout: Duration,
    broker_addr: Option<SocketAddr>,
    session: Option<(Client, Connection)>,
    inbound: VecDeque<(String, Vec<u8>)>,
    shutdown: Arc<AtomicBool>,
    failed_attempts: u32,
}

impl MqttSession {
    pub fn new(
        network: NetworkConfig,
        connectivity: &ConnectivityConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            network,
            keep_alive: Duration::from_secs(connectivity.keep_alive_secs.max(5)),
            connect_timeout: Duration::from_millis(connectivity.connect_timeout_ms.max(500)),
            broker_addr: None,
            session: None,
            inbound: VecDeque::new(),
            shutdown,
            failed_attempts: 0,
        }
    }

    /// Drives the event loop, waiting up to `wait` for the first event and
    /// then draining whatever is already buffered.
    pub fn pump(&mut self, wait: Duration) {
        if self.session.is_none() {
            thread::sleep(wait);
            return;
        }

        let mut wait = Some(wait);
        loop {
            match self.poll_once(wait.take()) {
                Polled::Event(Event::Incoming(Incoming::Publish(publish))) => {
                    debug!("mqtt rx {} ({} bytes)", publish.topic, publish.payload.len());
                    self.inbound
                        .push_back((publish.topic, publish.payload.to_vec()));
                }
                Polled::Event(Event::Incoming(Incoming::Disconnect)) => {
                    self.drop_session("broker sent disconnect");
                    return;
                }
                Polled::Event(_) => {}
                Polled::Idle => return,
                Polled::Lost(reason) => {
                    self.drop_session(&reason);
                    return;
                }
            }
        }
    }

    pub fn take_inbound(&mut self) -> Vec<(String, Vec<u8>)> {
        self.inbound.drain(..).collect()
    }

    fn poll_once(&mut self, wait: Option<Duration>) -> Polled {
        let Some((_, connection)) = self.session.as_mut() else {
            return Polled::Idle;
        };

        let polled = match wait {
            Some(wait) => connection
                .recv_timeout(wait)
                .map_err(|err| matches!(err, RecvTimeoutError::Disconnected)),
            None => connection
                .try_recv()
                .map_err(|err| matches!(err, TryRecvError::Disconnected)),
        };

        match polled {
            Ok(Ok(event)) => Polled::Event(event),
            Ok(Err(err)) => Polled::Lost(err.to_string()),
            Err(true) => Polled::Lost("event loop closed".to_string()),
            Err(false) => Polled::Idle,
        }
    }

    fn drop_session(&mut self, reason: &str) {
        if self.session.take().is_some() {
            warn!("mqtt session lost: {reason}");
        }
    }
}

impl ConnectivityPort for MqttSession {
    fn network_attached(&self) -> bool {
        self.broker_addr.is_some_and(|addr| probe_route(addr).is_ok())
    }

    fn attach_network(&mut self) -> Result<(), LinkError> {
        let host = self.network.mqtt_host.as_str();
        let addr = (host, self.network.mqtt_port)
            .to_socket_addrs()
            .map_err(|err| LinkError(format!("cannot resolve {host}: {err}")))?
            .next()
            .ok_or_else(|| LinkError(format!("no address for {host}")))?;
        probe_route(addr).map_err(|err| LinkError(format!("no route to {addr}: {err}")))?;

        self.broker_addr = Some(addr);
        Ok(())
    }

    fn broker_connected(&self) -> bool {
        self.session.is_some()
    }

    fn connect_broker(&mut self, client_id: &str) -> Result<(), BrokerError> {
        self.session = None;

        let mut options = MqttOptions::new(
            client_id,
            self.network.mqtt_host.clone(),
            self.network.mqtt_port,
        );
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if !self.network.mqtt_user.is_empty() {
            options.set_credentials(
                self.network.mqtt_user.clone(),
                self.network.mqtt_pass.clone(),
            );
        }

        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BrokerError::new(BrokerError::CONNECTION_TIMEOUT));
            }

            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Incoming::ConnAck(ack)))) => {
                    if !matches!(ack.code, ConnectReturnCode::Success) {
                        return Err(BrokerError::new(refused_code(ack.code)));
                    }
                    info!(
                        "mqtt connected to {}:{}",
                        self.network.mqtt_host, self.network.mqtt_port
                    );
                    self.session = Some((client, connection));
                    return Ok(());
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    debug!("mqtt connect error: {err}");
                    return Err(BrokerError::new(connect_error_code(&err)));
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(BrokerError::new(BrokerError::CONNECTION_TIMEOUT))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BrokerError::new(BrokerError::CONNECT_FAILED))
                }
            }
        }
    }

    fn disconnect_broker(&mut self) {
        if let Some((client, _)) = self.session.take() {
            let _ = client.try_disconnect();
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let (client, _) = self
            .session
            .as_mut()
            .ok_or(BrokerError::new(BrokerError::DISCONNECTED))?;
        client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|_| BrokerError::new(BrokerError::CONNECTION_LOST))
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let (client, _) = self
            .session
            .as_mut()
            .ok_or(BrokerError::new(BrokerError::DISCONNECTED))?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|_| BrokerError::new(BrokerError::CONNECTION_LOST))
    }

    /// Sleeps in short slices so a shutdown request is seen promptly.
    fn sleep_ms(&mut self, ms: u64) {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while !self.interrupted() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }

    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn on_event(&mut self, event: &ConnectivityEvent) {
        match event {
            ConnectivityEvent::AttachFailed(_)
            | ConnectivityEvent::ConnectFailed { .. }
            | ConnectivityEvent::SubscribeFailed { .. } => {
                self.failed_attempts = self.failed_attempts.saturating_add(1);
            }
            ConnectivityEvent::Connected { client_id } => {
                if self.failed_attempts > 0 {
                    info!(
                        "broker reachable again as {client_id} after {} failed attempts",
                        self.failed_attempts
                    );
                }
                self.failed_attempts = 0;
            }
            ConnectivityEvent::Attached => {}
        }
    }
}

/// Asks the OS for a route to `addr` without sending anything.
fn probe_route(addr: SocketAddr) -> std::io::Result<()> {
    let local = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0_u16; 8], 0))
    };
    UdpSocket::bind(local)?.connect(addr)
}

fn refused_code(code: ConnectReturnCode) -> i32 {
    match code {
        ConnectReturnCode::RefusedProtocolVersion => BrokerError::BAD_PROTOCOL,
        ConnectReturnCode::BadClientId => BrokerError::BAD_CLIENT_ID,
        ConnectReturnCode::ServiceUnavailable => BrokerError::UNAVAILABLE,
        ConnectReturnCode::BadUserNamePassword => BrokerError::BAD_CREDENTIALS,
        ConnectReturnCode::NotAuthorized => BrokerError::UNAUTHORIZED,
        _ => BrokerError::CONNECT_FAILED,
    }
}

fn connect_error_code(err: &ConnectionError) -> i32 {
    match err {
        ConnectionError::ConnectionRefused(code) => refused_code(*code),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            BrokerError::CONNECTION_TIMEOUT
        }
        _ => BrokerError::CONNECT_FAILED,
    }
}
