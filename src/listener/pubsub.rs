//! Pub-sub (ZeroMQ SUB) listener.
//!
//! Some decoders publish on a ZMQ PUB socket instead of writing to a
//! plain socket. We subscribe to everything and feed each frame through
//! the same framing as TCP. A SUB socket connects lazily, so "connected"
//! is only reported once the first frame actually arrives.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use zeromq::{Socket, SocketRecv, SubSocket};

use super::{reconnect_pause, DecoderType, Endpoint, FrameBuffer, ListenerCore, ListenerEvent, ListenerStats};

pub struct PubSubListener {
    core: Arc<ListenerCore>,
}

impl PubSubListener {
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
        tokio::spawn(run_sub_loop(core, stop_rx));
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

async fn run_sub_loop(core: Arc<ListenerCore>, mut stop_rx: broadcast::Receiver<()>) {
    let decoder = core.decoder;
    let address = format!("tcp://{}", core.endpoint.address());
    let mut framing = FrameBuffer::new(decoder);

    loop {
        // Fresh socket per attempt; a SUB socket that has errored is not
        // worth reusing.
        let mut socket = SubSocket::new();
        let subscribed = async {
            socket.connect(&address).await?;
            socket.subscribe("").await
        };
        let setup = tokio::select! {
            _ = stop_rx.recv() => return,
            res = subscribed => res,
        };
        if let Err(e) = setup {
            let _ = core.events.send(ListenerEvent::Error(decoder, e.to_string()));
            if !reconnect_pause(core.reconnect_delay, &mut stop_rx).await {
                return;
            }
            continue;
        }

        tracing::info!("Listener: {} subscribed to {}", decoder, address);
        framing.reset();

        if !recv_frames(&core, socket, &mut framing, &mut stop_rx).await {
            core.connected.store(false, std::sync::atomic::Ordering::SeqCst);
            return;
        }

        if core.connected.swap(false, std::sync::atomic::Ordering::SeqCst) {
            let _ = core.events.send(ListenerEvent::Disconnected(decoder));
        }
        framing.reset();

        if !reconnect_pause(core.reconnect_delay, &mut stop_rx).await {
            return;
        }
    }
}

/// Receive frames until a socket error or a stop request. Returns `false`
/// when the listener should shut down entirely.
async fn recv_frames(
    core: &ListenerCore,
    mut socket: SubSocket,
    framing: &mut FrameBuffer,
    stop_rx: &mut broadcast::Receiver<()>,
) -> bool {
    let decoder = core.decoder;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => return false,
            res = socket.recv() => match res {
                Ok(message) => {
                    if !core.connected.swap(true, std::sync::atomic::Ordering::SeqCst) {
                        let _ = core.events.send(ListenerEvent::Connected(decoder));
                    }
                    for frame in message.into_vec() {
                        let chunk = String::from_utf8_lossy(&frame);
                        for value in framing.extract(&chunk) {
                            let _ = core.events.send(ListenerEvent::Message(decoder, value));
                        }
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
