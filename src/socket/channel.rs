//! Room-based signaling channel over a [`Transport`].
//!
//! Thin by design: connect, join a room, subscribe to named events, emit.
//! The transport owns reconnection; this layer tracks connected state,
//! fans incoming frames out to subscribers, and re-raises transport state
//! changes as the reserved `connect` / `disconnect` events.

use super::error::{Result, SocketError};
use super::events::{EV_CONNECT, EV_DISCONNECT, EV_JOIN_ROOM, EventFrame, JoinRoomPayload, UserRole};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use log::{debug, trace, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Identifies one registration made with [`SignalingChannel::on`]; hand it
/// back to [`SignalingChannel::off`] to release the handler.
#[derive(Debug)]
pub struct SubscriptionHandle {
    event: String,
    id: u64,
}

#[derive(Default)]
struct HandlerRegistry {
    // Registration order within each event is preserved for fan-out.
    handlers: HashMap<String, Vec<(u64, EventHandler)>>,
}

pub struct SignalingChannel {
    factory: Arc<dyn TransportFactory>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    connected: Arc<AtomicBool>,
    registry: Arc<StdMutex<HandlerRegistry>>,
    next_handler_id: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            transport: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            registry: Arc::new(StdMutex::new(HandlerRegistry::default())),
            next_handler_id: AtomicU64::new(0),
            pump: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Opens the transport. Resolves when the handshake completes; later
    /// transport-level re-handshakes surface as `connect` events through the
    /// subscription registry, never by re-resolving this call.
    pub async fn connect(&self, url: &str) -> Result<()> {
        if self.is_connected() {
            return Err(SocketError::SocketAlreadyOpen);
        }

        let (transport, event_rx) = timeout(CONNECT_TIMEOUT, self.factory.create_transport(url))
            .await
            .map_err(|_| SocketError::Timeout(CONNECT_TIMEOUT))?
            .map_err(|e| SocketError::Handshake(e.to_string()))?;

        *self.transport.lock().await = Some(transport);
        self.connected.store(true, Ordering::Relaxed);

        let pump = tokio::spawn(Self::event_pump(
            event_rx,
            self.connected.clone(),
            self.registry.clone(),
        ));
        if let Some(old) = self.pump.lock().await.replace(pump) {
            old.abort();
        }

        debug!(target: "Socket", "Channel connected to {url}");
        Ok(())
    }

    /// Joins the signaling room for `connection_id`. Logs and returns when
    /// not connected; callers gate on connection state. Safe to repeat —
    /// re-joining after a transport reconnect is required and expected.
    pub async fn join_room(&self, connection_id: &str, role: UserRole) {
        if !self.is_connected() {
            warn!(target: "Socket", "join_room while not connected, ignoring");
            return;
        }
        debug!(target: "Socket", "Joining room {connection_id} as {role:?}");
        let payload = JoinRoomPayload {
            connection_id: connection_id.to_string(),
            user_type: role,
        };
        match serde_json::to_value(&payload) {
            Ok(data) => self.emit(EV_JOIN_ROOM, data).await,
            Err(e) => warn!(target: "Socket", "Failed to encode join-room: {e}"),
        }
    }

    /// Registers a handler for `event`. Multiple registrations for the same
    /// event all fire, in registration order.
    pub fn on(&self, event: &str, handler: impl Fn(Value) + Send + Sync + 'static) -> SubscriptionHandle {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .expect("handler registry poisoned")
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionHandle {
            event: event.to_string(),
            id,
        }
    }

    /// Releases a handler registration. Unknown handles are ignored.
    pub fn off(&self, handle: &SubscriptionHandle) {
        let mut registry = self.registry.lock().expect("handler registry poisoned");
        if let Some(entries) = registry.handlers.get_mut(&handle.event) {
            entries.retain(|(id, _)| *id != handle.id);
        }
    }

    /// Emits `{event, data}` on the wire. A silent no-op while disconnected:
    /// nothing is buffered or replayed later.
    pub async fn emit(&self, event: &str, data: Value) {
        if !self.is_connected() {
            trace!(target: "Socket", "emit '{event}' while not connected, dropping");
            return;
        }
        let transport = match self.transport.lock().await.clone() {
            Some(transport) => transport,
            None => return,
        };
        let frame = EventFrame::new(event, data);
        let encoded = match serde_json::to_string(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(target: "Socket", "Failed to encode '{event}' frame: {e}");
                return;
            }
        };
        if let Err(e) = transport.send(&encoded).await {
            warn!(target: "Socket", "Failed to send '{event}' frame: {e}");
        }
    }

    /// Tears down the transport. Subsequent emits are no-ops until a fresh
    /// `connect`.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        debug!(target: "Socket", "Channel disconnected");
    }

    async fn event_pump(
        mut event_rx: mpsc::Receiver<TransportEvent>,
        connected: Arc<AtomicBool>,
        registry: Arc<StdMutex<HandlerRegistry>>,
    ) {
        // The factory emits an initial Connected; only drops after that
        // make a later Connected a reconnect worth re-raising.
        let mut had_dropped = false;
        while let Some(event) = event_rx.recv().await {
            match event {
                TransportEvent::Connected => {
                    connected.store(true, Ordering::Relaxed);
                    if had_dropped {
                        had_dropped = false;
                        debug!(target: "Socket", "Transport re-connected");
                        Self::dispatch(&registry, EV_CONNECT, Value::Null);
                    }
                }
                TransportEvent::Disconnected => {
                    connected.store(false, Ordering::Relaxed);
                    had_dropped = true;
                    debug!(target: "Socket", "Transport dropped");
                    Self::dispatch(&registry, EV_DISCONNECT, Value::Null);
                }
                TransportEvent::Message(text) => {
                    let frame: EventFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(target: "Socket", "Dropping unparseable frame: {e}");
                            continue;
                        }
                    };
                    trace!(target: "Socket", "<-- {}", frame.event);
                    Self::dispatch(&registry, &frame.event, frame.data);
                }
            }
        }
        trace!(target: "Socket", "Event pump ended");
    }

    fn dispatch(registry: &StdMutex<HandlerRegistry>, event: &str, data: Value) {
        // Snapshot under the lock, invoke outside it: handlers may
        // register or release subscriptions themselves.
        let handlers: Vec<EventHandler> = {
            let registry = registry.lock().expect("handler registry poisoned");
            registry
                .handlers
                .get(event)
                .map(|entries| entries.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(data.clone());
        }
    }
}
