//! MQTT transport built on `rumqttc`.
//!
//! Destinations map one-to-one onto MQTT topic names. A driver task owns the
//! `rumqttc` event loop and the routing table from topic to subscription
//! channel; the session only sends it commands, so neither side ever waits
//! on the other while holding frames.

use super::{SessionErrors, Subscription, SubscriptionHandle, Transport, TransportError, TransportSession};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use url::{Host, Url};
use uuid::Uuid;

const DEFAULT_PORT: u16 = 1883;

/// Configuration for the MQTT transport.
#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    /// Client ID for MQTT connection
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Username sent alongside a bearer token
    pub token_username: String,
    /// Time allowed for the broker to acknowledge CONNECT
    pub connect_timeout: Duration,
    /// Capacity of each subscription channel and of the request queue
    pub channel_capacity: usize,
    /// Largest accepted packet, in bytes
    pub max_packet_size: usize,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            client_id: format!("rostersync-{}", Uuid::new_v4()),
            keep_alive: Duration::from_secs(30),
            token_username: "bearer".to_string(),
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 100,
            max_packet_size: 1024 * 1024,
        }
    }
}

/// Opens MQTT connections.
#[derive(Debug, Clone, Default)]
pub struct MqttTransport {
    config: MqttTransportConfig,
}

impl MqttTransport {
    /// Create a transport with the given configuration.
    #[must_use]
    pub fn new(config: MqttTransportConfig) -> Self {
        Self { config }
    }

    /// Build client options for one connection.
    fn options(&self, url: &str, auth_token: Option<&str>) -> Result<MqttOptions, TransportError> {
        let broker = BrokerAddress::parse(url)?;

        let mut options = MqttOptions::new(&self.config.client_id, broker.host, broker.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(self.config.max_packet_size, self.config.max_packet_size);

        if let Some(token) = auth_token {
            options.set_credentials(&self.config.token_username, token);
        }

        Ok(options)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Session = MqttSession;

    async fn open(
        &self,
        url: &str,
        auth_token: Option<&str>,
    ) -> Result<(MqttSession, SessionErrors), TransportError> {
        let options = self.options(url, auth_token)?;
        let (client, mut eventloop) = AsyncClient::new(options, self.config.channel_capacity);

        tracing::debug!(broker = url, authenticated = auth_token.is_some(), "Opening MQTT connection");

        tokio::time::timeout(self.config.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                TransportError::Connection(format!(
                    "no CONNACK within {:?}",
                    self.config.connect_timeout
                ))
            })??;

        tracing::info!(broker = url, "Connected to MQTT broker");

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (errors_tx, errors_rx) = mpsc::channel(1);

        let driver = Driver {
            client,
            eventloop,
            commands: commands_rx,
            errors: errors_tx,
            routes: Routes::default(),
        };
        tokio::spawn(driver.run());

        let session = MqttSession {
            commands: commands_tx,
            capacity: self.config.channel_capacity,
            next_id: 0,
            closed: false,
        };

        Ok((session, errors_rx))
    }
}

/// Poll the event loop until the broker answers CONNECT.
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::Protocol(format!(
                        "connection refused: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(map_connection_error(e)),
        }
    }
}

fn map_connection_error(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            TransportError::Protocol(format!("connection refused: {code:?}"))
        }
        ConnectionError::MqttState(e) => TransportError::Protocol(e.to_string()),
        ConnectionError::NotConnAck(packet) => {
            TransportError::Protocol(format!("expected CONNACK, got {packet:?}"))
        }
        other => TransportError::Connection(other.to_string()),
    }
}

/// An open MQTT connection.
pub struct MqttSession {
    commands: mpsc::Sender<Command>,
    capacity: usize,
    next_id: u64,
    closed: bool,
}

#[async_trait]
impl TransportSession for MqttSession {
    async fn subscribe(&mut self, destination: &str) -> Result<Subscription, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        // Frames are routed by exact topic name.
        if !rumqttc::valid_topic(destination) {
            return Err(TransportError::Protocol(format!(
                "'{destination}' is a topic filter, not a topic name"
            )));
        }

        let id = self.next_id;
        self.next_id += 1;

        let (frames_tx, frames_rx) = mpsc::channel(self.capacity);
        self.commands
            .send(Command::Subscribe {
                id,
                destination: destination.to_string(),
                frames: frames_tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        Ok(Subscription {
            handle: SubscriptionHandle::new(id, destination),
            messages: frames_rx,
        })
    }

    async fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        self.commands
            .send(Command::Unsubscribe {
                id: handle.id(),
                destination: handle.destination().to_string(),
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.commands.send(Command::Close).await.is_err() {
            tracing::debug!("MQTT driver already stopped");
        }
    }
}

enum Command {
    Subscribe {
        id: u64,
        destination: String,
        frames: mpsc::Sender<Vec<u8>>,
    },
    Unsubscribe {
        id: u64,
        destination: String,
    },
    Close,
}

struct Route {
    id: u64,
    frames: mpsc::Sender<Vec<u8>>,
}

/// Topic to subscription channel table for one connection.
#[derive(Default)]
struct Routes {
    by_topic: HashMap<String, Route>,
}

impl Routes {
    /// Point `topic` at subscription `id`, replacing any older route.
    fn insert(&mut self, id: u64, topic: String, frames: mpsc::Sender<Vec<u8>>) {
        self.by_topic.insert(topic, Route { id, frames });
    }

    /// Remove the route for `topic` if it still belongs to `id`.
    fn remove(&mut self, id: u64, topic: &str) -> bool {
        if self.by_topic.get(topic).map(|route| route.id) != Some(id) {
            return false;
        }
        self.by_topic.remove(topic);
        true
    }

    fn get(&self, topic: &str) -> Option<&mpsc::Sender<Vec<u8>>> {
        self.by_topic.get(topic).map(|route| &route.frames)
    }

    fn forget(&mut self, topic: &str) {
        self.by_topic.remove(topic);
    }

    fn clear(&mut self) {
        self.by_topic.clear();
    }
}

/// Owns the event loop for one connection.
struct Driver {
    client: AsyncClient,
    eventloop: EventLoop,
    commands: mpsc::Receiver<Command>,
    errors: mpsc::Sender<TransportError>,
    routes: Routes,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Subscribe { id, destination, frames }) => {
                        if let Err(e) = self.subscribe(id, destination, frames) {
                            self.fail(e);
                            break;
                        }
                    }
                    Some(Command::Unsubscribe { id, destination }) => {
                        if let Err(e) = self.unsubscribe(id, &destination) {
                            self.fail(e);
                            break;
                        }
                    }
                    Some(Command::Close) | None => {
                        self.disconnect().await;
                        break;
                    }
                },

                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => self.route(publish).await,
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        tracing::debug!(pkid = ack.pkid, "Subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.fail(map_connection_error(e));
                        break;
                    }
                },
            }
        }

        tracing::debug!("MQTT driver stopped");
    }

    /// Install the route, then queue the SUBSCRIBE.
    fn subscribe(
        &mut self,
        id: u64,
        destination: String,
        frames: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), TransportError> {
        tracing::info!(destination = %destination, "Subscribing");

        self.routes.insert(id, destination.clone(), frames);
        self.client
            .try_subscribe(destination, QoS::AtLeastOnce)
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    fn unsubscribe(&mut self, id: u64, destination: &str) -> Result<(), TransportError> {
        // A newer subscription may have replaced this route.
        if !self.routes.remove(id, destination) {
            return Ok(());
        }

        tracing::info!(destination, "Unsubscribing");

        self.client
            .try_unsubscribe(destination)
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn route(&mut self, publish: Publish) {
        let payload_len = publish.payload.len();

        let Some(frames) = self.routes.get(&publish.topic) else {
            tracing::debug!(
                topic = %publish.topic,
                payload_len,
                "Dropping frame for inactive subscription"
            );
            return;
        };

        tracing::debug!(topic = %publish.topic, payload_len, "Received frame");

        if frames.send(publish.payload.to_vec()).await.is_err() {
            tracing::debug!(topic = %publish.topic, "Subscription receiver dropped");
            self.routes.forget(&publish.topic);
        }
    }

    fn fail(&mut self, error: TransportError) {
        tracing::error!(error = %error, "MQTT session failed");
        // Queue the cause before the frame channels close. Only the first
        // failure matters to the owner.
        let _ = self.errors.try_send(error);
        self.routes.clear();
    }

    async fn disconnect(&mut self) {
        self.routes.clear();

        if self.client.try_disconnect().is_err() {
            return;
        }

        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };

        if tokio::time::timeout(Duration::from_secs(1), flush).await.is_err() {
            tracing::debug!("Timed out flushing DISCONNECT");
        }
    }
}

/// Host and port of a plain-TCP MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BrokerAddress {
    host: String,
    port: u16,
}

impl BrokerAddress {
    /// Accepts `tcp://host[:port]`, `mqtt://host[:port]` and bare
    /// `host[:port]`. The port defaults to 1883.
    fn parse(input: &str) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidUrl(format!("{input}: {reason}"));

        let url = if input.contains("://") {
            Url::parse(input)
        } else {
            Url::parse(&format!("tcp://{input}"))
        }
        .map_err(|e| invalid(&e.to_string()))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            "ws" | "wss" => return Err(invalid("MQTT over WebSocket is not supported")),
            scheme => return Err(invalid(&format!("unsupported scheme '{scheme}'"))),
        }

        if !matches!(url.path(), "" | "/") {
            return Err(invalid(&format!("unexpected path '{}'", url.path())));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(invalid("missing host")),
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }
}
