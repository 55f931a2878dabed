//! UDP datagram listener.
//!
//! Binds the configured address and treats each datagram as a
//! self-contained batch of JSON objects. "Connected" means bound; a bind
//! failure (port still held by a dying process, for instance) is retried
//! on the reconnect cadence.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use super::{parse_datagram, reconnect_pause, DecoderType, Endpoint, ListenerCore, ListenerEvent, ListenerStats};

pub struct UdpFeedListener {
    core: Arc<ListenerCore>,
}

impl UdpFeedListener {
    pub fn new(
        decoder: DecoderType,
        endpoint: Endpoint,
        reconnect_delay: Duration,
        events: mpsc::UnboundedSender<ListenerEvent>,
    ) -> Self {
        Self {
            core: Arc::new(ListenerCore::new(decoder, endpoint, reconnect_delay, events)),
        }
    }

    pub fn start(&self) {
        let Some(stop_rx) = self.core.begin_start() else {
            return;
        };
        let core = self.core.clone();
        tokio::spawn(run_udp_loop(core, stop_rx));
    }

    pub fn stop(&self) {
        self.core.request_stop();
    }

    pub fn connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn stats(&self) -> ListenerStats {
        self.core.stats()
    }
}

async fn run_udp_loop(core: Arc<ListenerCore>, mut stop_rx: broadcast::Receiver<()>) {
    let decoder = core.decoder;
    let address = core.endpoint.address();

    loop {
        let socket = match UdpSocket::bind(&address).await {
            Ok(socket) => socket,
            Err(e) => {
                let _ = core.events.send(ListenerEvent::Error(decoder, e.to_string()));
                if !reconnect_pause(core.reconnect_delay, &mut stop_rx).await {
                    return;
                }
                continue;
            }
        };

        tracing::info!("Listener: {} bound udp://{}", decoder, address);
        core.connected.store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = core.events.send(ListenerEvent::Connected(decoder));

        if !recv_datagrams(&core, socket, &mut stop_rx).await {
            core.connected.store(false, std::sync::atomic::Ordering::SeqCst);
            return;
        }

        core.connected.store(false, std::sync::atomic::Ordering::SeqCst);
        let _ = core.events.send(ListenerEvent::Disconnected(decoder));

        if !reconnect_pause(core.reconnect_delay, &mut stop_rx).await {
            return;
        }
    }
}

/// Receive until a socket error or a stop request. Returns `false` when
/// the listener should shut down entirely.
async fn recv_datagrams(
    core: &ListenerCore,
    socket: UdpSocket,
    stop_rx: &mut broadcast::Receiver<()>,
) -> bool {
    let decoder = core.decoder;
    // Max UDP payload; decoder datagrams are far smaller in practice.
    let mut buf = vec![0u8; 65535];

    loop {
        tokio::select! {
            _ = stop_rx.recv() => return false,
            res = socket.recv_from(&mut buf) => match res {
                Ok((0, _)) => continue, // empty datagram, not an error
                Ok((n, _)) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    for value in parse_datagram(decoder, &chunk) {
                        let _ = core.events.send(ListenerEvent::Message(decoder, value));
                    }
                }
                Err(e) => {
                    let _ = core.events.send(ListenerEvent::Error(decoder, e.to_string()));
                    return true;
                }
            },
        }
    }
}
