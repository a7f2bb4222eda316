//! WebSocket transport with transport-level auto-reconnect.
//!
//! The signaling channel sits on top of the [`Transport`] trait; this module
//! provides the production `tokio-tungstenite` implementation plus the mock
//! used by tests. Reconnection after an unexpected drop happens here, inside
//! the transport, with a bounded attempt count and a fixed delay. A
//! successful re-handshake surfaces as a fresh [`TransportEvent::Connected`]
//! on the event stream; the original connect call is never re-resolved.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has (re-)established its handshake.
    Connected,
    /// A text frame has been received from the server.
    Message(String),
    /// The connection was lost (expected or not).
    Disconnected,
}

/// Represents an active network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a text frame to the server.
    async fn send(&self, frame: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection. No reconnect attempts follow.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Connects to `url` and returns the transport along with its event
    /// stream. Resolves once the handshake completes.
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const RECONNECT_MAX_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Tokio WebSocket transport.
pub struct WsTransport {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, frame: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        debug!(target: "Transport", "--> Sending frame: {} bytes", frame.len());
        sink.send(Message::text(frame.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let mut sink_guard = self.ws_sink.lock().await;
        if let Some(sink) = sink_guard.as_mut() {
            let _ = sink.close().await;
        }
        *sink_guard = None;
    }
}

/// Factory for the production WebSocket transport.
#[derive(Default)]
pub struct WsTransportFactory;

impl WsTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!(target: "Transport", "Dialing {url}");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = ws.split();
        let (event_tx, event_rx) = mpsc::channel(100);

        let ws_sink = Arc::new(Mutex::new(Some(sink)));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(WsTransport {
            ws_sink: ws_sink.clone(),
            closed: closed.clone(),
        });

        tokio::spawn(supervise(
            stream,
            url.to_string(),
            ws_sink,
            closed,
            event_tx.clone(),
        ));

        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

/// Owns the read half: pumps frames until the stream dies, then drives the
/// bounded reconnect loop. Exits when the caller disconnected on purpose or
/// the attempts are exhausted.
async fn supervise(
    mut stream: WsStream,
    url: String,
    ws_sink: Arc<Mutex<Option<WsSink>>>,
    closed: Arc<AtomicBool>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    loop {
        read_pump(&mut stream, &event_tx).await;

        *ws_sink.lock().await = None;
        if event_tx.send(TransportEvent::Disconnected).await.is_err() {
            return;
        }
        if closed.load(Ordering::Relaxed) {
            return;
        }

        let mut reconnected = false;
        for attempt in 1..=RECONNECT_MAX_ATTEMPTS {
            sleep(RECONNECT_DELAY).await;
            if closed.load(Ordering::Relaxed) {
                return;
            }
            info!(
                target: "Transport",
                "Reconnect attempt {attempt}/{RECONNECT_MAX_ATTEMPTS} to {url}"
            );
            match connect_async(url.as_str()).await {
                Ok((ws, _response)) => {
                    let (sink, new_stream) = ws.split();
                    *ws_sink.lock().await = Some(sink);
                    stream = new_stream;
                    if event_tx.send(TransportEvent::Connected).await.is_err() {
                        return;
                    }
                    reconnected = true;
                    break;
                }
                Err(e) => {
                    warn!(target: "Transport", "Reconnect attempt {attempt} failed: {e}");
                }
            }
        }

        if !reconnected {
            error!(
                target: "Transport",
                "Giving up after {RECONNECT_MAX_ATTEMPTS} reconnect attempts"
            );
            return;
        }
    }
}

async fn read_pump(stream: &mut WsStream, event_tx: &mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(msg)) => {
                if msg.is_text() {
                    let text = match msg.into_text() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(target: "Transport", "Dropping non-UTF8 frame: {e}");
                            continue;
                        }
                    };
                    trace!(target: "Transport", "<-- Received frame: {} bytes", text.len());
                    if event_tx
                        .send(TransportEvent::Message(text.to_string()))
                        .await
                        .is_err()
                    {
                        warn!(target: "Transport", "Event receiver dropped, closing read pump");
                        return;
                    }
                } else if msg.is_close() {
                    trace!(target: "Transport", "Received close frame");
                    return;
                }
            }
            Some(Err(e)) => {
                error!(target: "Transport", "Error reading from websocket: {e}");
                return;
            }
            None => {
                trace!(target: "Transport", "Websocket stream ended");
                return;
            }
        }
    }
}

/// Mock transport for tests: captures outgoing frames and lets the test
/// inject transport events as if the server had produced them.
pub mod mock {
    use super::*;
    use std::sync::Mutex as StdMutex;

    pub struct MockTransport {
        sent: StdMutex<Vec<String>>,
        pub disconnected: AtomicBool,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                disconnected: AtomicBool::new(false),
            }
        }

        /// All frames sent so far, in order.
        pub fn sent_frames(&self) -> Vec<String> {
            self.sent.lock().expect("mock lock poisoned").clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, frame: &str) -> Result<(), anyhow::Error> {
            self.sent
                .lock()
                .expect("mock lock poisoned")
                .push(frame.to_string());
            Ok(())
        }

        async fn disconnect(&self) {
            self.disconnected.store(true, Ordering::Relaxed);
        }
    }

    /// Factory that hands out [`MockTransport`]s and keeps the pieces the
    /// test needs: the transport for frame inspection and the event sender
    /// for injecting `Connected` / `Disconnected` / `Message` events.
    #[derive(Default)]
    pub struct MockTransportFactory {
        last: StdMutex<Option<(Arc<MockTransport>, mpsc::Sender<TransportEvent>)>>,
    }

    impl MockTransportFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn transport(&self) -> Arc<MockTransport> {
            self.last
                .lock()
                .expect("mock lock poisoned")
                .as_ref()
                .expect("create_transport not called yet")
                .0
                .clone()
        }

        pub fn event_sender(&self) -> mpsc::Sender<TransportEvent> {
            self.last
                .lock()
                .expect("mock lock poisoned")
                .as_ref()
                .expect("create_transport not called yet")
                .1
                .clone()
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
            _url: &str,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            let (event_tx, event_rx) = mpsc::channel(100);
            let transport = Arc::new(MockTransport::new());
            *self.last.lock().expect("mock lock poisoned") =
                Some((transport.clone(), event_tx.clone()));
            let _ = event_tx.send(TransportEvent::Connected).await;
            Ok((transport, event_rx))
        }
    }
}
