//! Publish/subscribe transport for live uplinks.
//!
//! [`MqttTransport`] runs the `rumqttc` event loop on its own thread and
//! forwards publish payloads into a bounded queue; the ingestion worker pulls
//! from that queue with [`MessageSource::next`]. Closing the transport through
//! its [`TransportHandle`] disconnects from the broker, which ends the event
//! loop thread and makes `next` return `Ok(None)`.

use log::{debug, info, warn};
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::MqttConfig;
use crate::models::things::SensorMessage;

/// Messages buffered between the event loop and the worker.
pub const QUEUE_DEPTH: usize = 1024;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// How often a blocked `next` or a reconnect back-off looks at the closing flag.
const CLOSE_POLL: Duration = Duration::from_millis(100);
const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug)]
pub enum TransportError {
    Connect(String),
    Subscribe(String),
    Decode {
        topic: String,
        source: serde_path_to_error::Error<serde_json::Error>,
    },
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "connect failed: {}", e),
            TransportError::Subscribe(e) => write!(f, "subscribe failed: {}", e),
            TransportError::Decode { topic, source } => {
                write!(f, "undecodable message on {} at {}: {}", topic, source.path(), source.inner())
            }
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::Decode { source, .. } => Some(source.inner()),
            _ => None,
        }
    }
}

/// Blocking, pull-based source of decoded uplinks.
pub trait MessageSource {
    /// Wait for the next message. `Ok(None)` means the source is closed for good;
    /// an `Err` only concerns the message at hand.
    fn next(&mut self) -> Result<Option<SensorMessage>, TransportError>;
}

/// Raw publish as received from the broker.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub fn decode(raw: &RawMessage) -> Result<SensorMessage, TransportError> {
    let de = &mut serde_json::Deserializer::from_slice(&raw.payload);
    serde_path_to_error::deserialize(de).map_err(|source| TransportError::Decode {
        topic: raw.topic.clone(),
        source,
    })
}

pub struct MqttTransport {
    queue: Receiver<RawMessage>,
    closing: Arc<AtomicBool>,
}

impl MessageSource for MqttTransport {
    /// Returns `Ok(None)` as soon as the transport is closed, even while the
    /// event loop is still busy reconnecting.
    fn next(&mut self) -> Result<Option<SensorMessage>, TransportError> {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match self.queue.recv_timeout(CLOSE_POLL) {
                Ok(raw) => return decode(&raw).map(Some),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }
}

/// Owned by the control thread; closes the transport.
///
/// Closing does not wait for the event loop thread: it may be blocked handing
/// a message to a worker that is itself shutting down.
pub struct TransportHandle {
    client: Client,
    closing: Arc<AtomicBool>,
}

impl TransportHandle {
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.try_disconnect() {
            warn!("MQTT: disconnect request failed: {}", e);
        }
        info!("MQTT: transport closing");
    }
}

impl MqttTransport {
    /// Connect, wait for the broker's ConnAck and subscribe.
    pub fn connect(cfg: &MqttConfig) -> Result<(MqttTransport, TransportHandle), TransportError> {
        let (host, port) = split_broker(&cfg.broker)?;
        let client_id = format!("things-weather-{:08x}", rand::random::<u32>());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_credentials(cfg.username.clone(), cfg.password.clone());

        let (client, mut connection) = Client::new(options, QUEUE_DEPTH);
        wait_for_connack(&mut connection)?;
        info!("MQTT: connected to {}", cfg.broker);
        client
            .try_subscribe(cfg.topic.clone(), QoS::AtMostOnce)
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::sync_channel(QUEUE_DEPTH);
        let closing = Arc::new(AtomicBool::new(false));
        {
            let client = client.clone();
            let closing = Arc::clone(&closing);
            let topic = cfg.topic.clone();
            thread::Builder::new()
                .name("mqtt-event-loop".into())
                .spawn(move || run_event_loop(connection, client, topic, tx, closing))
                .map_err(|e| TransportError::Connect(format!("spawning event loop failed: {}", e)))?;
        }

        let transport = MqttTransport {
            queue: rx,
            closing: Arc::clone(&closing),
        };
        Ok((transport, TransportHandle { client, closing }))
    }
}

fn wait_for_connack(connection: &mut Connection) -> Result<(), TransportError> {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
    Err(TransportError::Connect("event loop ended before ConnAck".into()))
}

fn run_event_loop(
    mut connection: Connection,
    client: Client,
    topic: String,
    queue: SyncSender<RawMessage>,
    closing: Arc<AtomicBool>,
) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let raw = RawMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                match queue.try_send(raw) {
                    Ok(()) => {}
                    Err(TrySendError::Full(raw)) => {
                        warn!("MQTT: queue full, waiting for worker ({})", raw.topic);
                        if queue.send(raw).is_err() {
                            break;
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT: reconnected, subscribing to {}", topic);
                if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
                    warn!("MQTT: resubscribe failed: {}", e);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => info!("MQTT: subscribed to {}", topic),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT: disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                warn!("MQTT: connection error, retrying in {}s: {}", RECONNECT_DELAY.as_secs(), e);
                if !back_off(&closing) {
                    break;
                }
            }
        }
    }
    debug!("MQTT: event loop stopped");
}

/// Sleep for [`RECONNECT_DELAY`]. Returns false early once `closing` is set.
fn back_off(closing: &AtomicBool) -> bool {
    let mut waited = Duration::ZERO;
    while waited < RECONNECT_DELAY {
        if closing.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(CLOSE_POLL);
        waited += CLOSE_POLL;
    }
    !closing.load(Ordering::SeqCst)
}

/// `host[:port]`, with an optional `tcp://` or `mqtt://` prefix.
pub fn split_broker(broker: &str) -> Result<(String, u16), TransportError> {
    let trimmed = broker.trim();
    let address = trimmed.split_once("://").map(|(_, rest)| rest).unwrap_or(trimmed);
    if address.is_empty() {
        return Err(TransportError::Connect("empty broker address".into()));
    }
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::Connect(format!("invalid broker port in {}", broker)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((address.to_string(), DEFAULT_MQTT_PORT)),
    }
}
