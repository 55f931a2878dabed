//! TCP stream listener.
//!
//! Connects out to a decoder's JSON output port and re-dials on any
//! close or error. Decoders flap constantly (SDR restarts, container
//! redeploys); the rest of the pipeline only ever sees the event stream.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use super::{reconnect_pause, DecoderType, Endpoint, FrameBuffer, ListenerCore, ListenerEvent, ListenerStats};

pub struct TcpFeedListener {
    core: Arc<ListenerCore>,
}

impl TcpFeedListener {
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
        tokio::spawn(run_tcp_loop(core, stop_rx));
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

async fn run_tcp_loop(core: Arc<ListenerCore>, mut stop_rx: broadcast::Receiver<()>) {
    let decoder = core.decoder;
    let address = core.endpoint.address();
    let mut framing = FrameBuffer::new(decoder);

    loop {
        let stream = tokio::select! {
            _ = stop_rx.recv() => return,
            res = TcpStream::connect(&address) => match res {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = core.events.send(ListenerEvent::Error(decoder, e.to_string()));
                    if !reconnect_pause(core.reconnect_delay, &mut stop_rx).await {
                        return;
                    }
                    continue;
                }
            },
        };

        tracing::info!("Listener: {} connected to tcp://{}", decoder, address);
        core.connected.store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = core.events.send(ListenerEvent::Connected(decoder));
        // A partial from the previous connection must never merge with
        // this one's data.
        framing.reset();

        if !read_stream(&core, stream, &mut framing, &mut stop_rx).await {
            core.connected.store(false, std::sync::atomic::Ordering::SeqCst);
            return;
        }

        core.connected.store(false, std::sync::atomic::Ordering::SeqCst);
        let _ = core.events.send(ListenerEvent::Disconnected(decoder));
        framing.reset();

        if !reconnect_pause(core.reconnect_delay, &mut stop_rx).await {
            return;
        }
    }
}

/// Read until the peer closes, an error occurs, or stop is requested.
/// Returns `false` when the listener should shut down entirely.
async fn read_stream(
    core: &ListenerCore,
    mut stream: TcpStream,
    framing: &mut FrameBuffer,
    stop_rx: &mut broadcast::Receiver<()>,
) -> bool {
    let decoder = core.decoder;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            _ = stop_rx.recv() => return false,
            res = stream.read(&mut buf) => match res {
                Ok(0) => {
                    tracing::info!("Listener: {} stream closed by peer", decoder);
                    return true;
                }
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    for value in framing.extract(&chunk) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener as TokioTcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::{timeout, Duration};

    async fn next_event(rx: &mut UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for listener event")
            .expect("event channel closed")
    }

    fn listener_for(
        addr: std::net::SocketAddr,
    ) -> (TcpFeedListener, UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Endpoint {
            kind: super::super::TransportKind::Tcp,
            host: addr.ip().to_string(),
            port: addr.port(),
        };
        let listener = TcpFeedListener::new(
            DecoderType::Acars,
            endpoint,
            Duration::from_millis(50),
            tx,
        );
        (listener, rx)
    }

    #[tokio::test]
    async fn test_connect_and_receive_back_to_back() {
        let server = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let (listener, mut rx) = listener_for(addr);

        listener.start();
        let (mut peer, _) = server.accept().await.unwrap();

        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Connected(DecoderType::Acars)));
        assert!(listener.connected());

        peer.write_all(b"{\"a\":1}{\"b\":2}").await.unwrap();
        peer.flush().await.unwrap();

        match next_event(&mut rx).await {
            ListenerEvent::Message(DecoderType::Acars, v) => assert_eq!(v["a"], 1),
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut rx).await {
            ListenerEvent::Message(DecoderType::Acars, v) => assert_eq!(v["b"], 2),
            other => panic!("unexpected event: {:?}", other),
        }

        // Peer close surfaces as a disconnect, then the listener re-dials.
        drop(peer);
        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Disconnected(DecoderType::Acars)));

        let (mut peer, _) = server.accept().await.unwrap();
        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Connected(DecoderType::Acars)));
        peer.write_all(b"{\"c\":3}\n").await.unwrap();
        match next_event(&mut rx).await {
            ListenerEvent::Message(_, v) => assert_eq!(v["c"], 3),
            other => panic!("unexpected event: {:?}", other),
        }

        listener.stop();
    }

    #[tokio::test]
    async fn test_error_then_connected_on_late_server() {
        // Reserve a port, then close it so the first dial fails.
        let placeholder = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = placeholder.local_addr().unwrap();
        drop(placeholder);

        let (listener, mut rx) = listener_for(addr);
        listener.start();

        // At least one connect error before the server exists.
        match next_event(&mut rx).await {
            ListenerEvent::Error(DecoderType::Acars, _) => {}
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(!listener.connected());

        // Bring the server up; the reconnect loop should find it. Skip
        // over further errors from dials that raced the bind.
        let server = TokioTcpListener::bind(addr).await.unwrap();
        loop {
            match next_event(&mut rx).await {
                ListenerEvent::Connected(DecoderType::Acars) => break,
                ListenerEvent::Error(_, _) => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(listener.connected());

        drop(server);
        listener.stop();
        assert!(!listener.connected());
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let server = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let (listener, mut rx) = listener_for(addr);

        listener.start();
        listener.start(); // no-op while running

        let _peer = server.accept().await.unwrap();
        assert!(matches!(next_event(&mut rx).await, ListenerEvent::Connected(_)));

        // Only one connection should ever have been made.
        listener.stop();
        listener.stop(); // no-op when idle
        assert!(!listener.connected());

        // No further events after stop.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
