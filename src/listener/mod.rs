//! Transport listeners for decoder feeds.
//!
//! Each listener owns one socket or connection, a reconnect loop and the
//! raw-byte-to-JSON framing for its transport. Listeners surface a
//! uniform event stream (connected / disconnected / message / error) and
//! nothing else; the ingestion pipeline never sees transport detail.

mod framing;
mod pubsub;
mod tcp;
mod udp;

pub use framing::{parse_datagram, FrameBuffer};
pub use pubsub::PubSubListener;
pub use tcp::TcpFeedListener;
pub use udp::UdpFeedListener;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// The datalink protocols whose decoders feed this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecoderType {
    Acars,
    Vdlm2,
    Hfdl,
    Imsl,
    Irdm,
}

impl DecoderType {
    pub const ALL: [DecoderType; 5] = [
        DecoderType::Acars,
        DecoderType::Vdlm2,
        DecoderType::Hfdl,
        DecoderType::Imsl,
        DecoderType::Irdm,
    ];

    /// Wire name, as stored in the database and shown to viewers.
    pub fn as_str(&self) -> &'static str {
        match self {
            DecoderType::Acars => "ACARS",
            DecoderType::Vdlm2 => "VDL-M2",
            DecoderType::Hfdl => "HFDL",
            DecoderType::Imsl => "IMSL",
            DecoderType::Irdm => "IRDM",
        }
    }

    /// Name used in configuration keys (`DLH_<NAME>_SOURCE`).
    pub fn config_name(&self) -> &'static str {
        match self {
            DecoderType::Acars => "ACARS",
            DecoderType::Vdlm2 => "VDLM2",
            DecoderType::Hfdl => "HFDL",
            DecoderType::Imsl => "IMSL",
            DecoderType::Irdm => "IRDM",
        }
    }
}

impl fmt::Display for DecoderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a decoder delivers its feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    Tcp,
    PubSub,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => f.write_str("udp"),
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::PubSub => f.write_str("pubsub"),
        }
    }
}

/// One configured feed endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `udp://host:port`, `tcp://host:port` or `pubsub://host:port`.
    pub fn parse(s: &str) -> Option<Endpoint> {
        let (scheme, rest) = s.split_once("://")?;
        let kind = match scheme {
            "udp" => TransportKind::Udp,
            "tcp" => TransportKind::Tcp,
            "pubsub" => TransportKind::PubSub,
            _ => return None,
        };
        let (host, port) = rest.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port: u16 = port.parse().ok()?;
        Some(Endpoint {
            kind,
            host: host.to_string(),
            port,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.kind, self.host, self.port)
    }
}

/// Events emitted by every listener, regardless of transport.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    Connected(DecoderType),
    Disconnected(DecoderType),
    Message(DecoderType, Value),
    Error(DecoderType, String),
}

/// Snapshot of one listener's identity and connection state.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStats {
    pub decoder: String,
    pub transport: String,
    pub connection_point: String,
    pub connected: bool,
}

/// State shared by all listener implementations: identity, the event
/// channel, the connected flag and the start/stop bookkeeping.
pub(crate) struct ListenerCore {
    pub decoder: DecoderType,
    pub endpoint: Endpoint,
    pub reconnect_delay: Duration,
    pub events: mpsc::UnboundedSender<ListenerEvent>,
    pub connected: Arc<AtomicBool>,
    running: AtomicBool,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl ListenerCore {
    pub fn new(
        decoder: DecoderType,
        endpoint: Endpoint,
        reconnect_delay: Duration,
        events: mpsc::UnboundedSender<ListenerEvent>,
    ) -> Self {
        Self {
            decoder,
            endpoint,
            reconnect_delay,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            stop: Mutex::new(None),
        }
    }

    /// Transition idle -> running. Returns a stop receiver for the new
    /// listener task, or `None` if the listener is already running.
    pub fn begin_start(&self) -> Option<broadcast::Receiver<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let (tx, rx) = broadcast::channel(1);
        *self.stop.lock().unwrap() = Some(tx);
        Some(rx)
    }

    /// Transition any state -> idle. Safe to call repeatedly.
    pub fn request_stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.stop.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            decoder: self.decoder.to_string(),
            transport: self.endpoint.kind.to_string(),
            connection_point: self.endpoint.address(),
            connected: self.is_connected(),
        }
    }
}

/// Wait out the reconnect delay, unless a stop arrives first.
/// Returns `false` when the listener should shut down.
pub(crate) async fn reconnect_pause(
    delay: Duration,
    stop: &mut broadcast::Receiver<()>,
) -> bool {
    tokio::select! {
        _ = stop.recv() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// A feed listener for any supported transport.
///
/// The set of transports is closed; callers match on nothing and use only
/// the uniform surface below.
pub enum Listener {
    Udp(UdpFeedListener),
    Tcp(TcpFeedListener),
    PubSub(PubSubListener),
}

impl Listener {
    /// Begin listening. A second call while running is a no-op.
    pub fn start(&self) {
        match self {
            Listener::Udp(l) => l.start(),
            Listener::Tcp(l) => l.start(),
            Listener::PubSub(l) => l.start(),
        }
    }

    /// Release the socket/connection and cancel any pending reconnect.
    /// Safe to call repeatedly.
    pub fn stop(&self) {
        match self {
            Listener::Udp(l) => l.stop(),
            Listener::Tcp(l) => l.stop(),
            Listener::PubSub(l) => l.stop(),
        }
    }

    pub fn connected(&self) -> bool {
        match self {
            Listener::Udp(l) => l.connected(),
            Listener::Tcp(l) => l.connected(),
            Listener::PubSub(l) => l.connected(),
        }
    }

    pub fn stats(&self) -> ListenerStats {
        match self {
            Listener::Udp(l) => l.stats(),
            Listener::Tcp(l) => l.stats(),
            Listener::PubSub(l) => l.stats(),
        }
    }
}

/// Listener registry: construct the right listener for an endpoint.
///
/// Pure factory; starting and stopping the result is the caller's job.
pub fn build_listener(
    decoder: DecoderType,
    endpoint: Endpoint,
    reconnect_delay: Duration,
    events: mpsc::UnboundedSender<ListenerEvent>,
) -> Listener {
    match endpoint.kind {
        TransportKind::Udp => {
            Listener::Udp(UdpFeedListener::new(decoder, endpoint, reconnect_delay, events))
        }
        TransportKind::Tcp => {
            Listener::Tcp(TcpFeedListener::new(decoder, endpoint, reconnect_delay, events))
        }
        TransportKind::PubSub => {
            Listener::PubSub(PubSubListener::new(decoder, endpoint, reconnect_delay, events))
        }
    }
}
