//! The call session controller.
//!
//! Owns the whole lifecycle of one call: session bootstrap vs. resume,
//! listener registration, offer/answer/ICE sequencing, keep-alive, the call
//! clock and termination. Channel handlers never touch controller state
//! directly; they enqueue [`ControllerEvent`]s onto one queue consumed by a
//! single event-loop task, so transitions are serialized and ICE candidates
//! apply in delivery order.

use crate::allocate::{InitiateRequest, SessionAllocator, SessionGrant};
use crate::config::{ClientConfig, RemoteConfig};
use crate::error::ClientError;
use crate::media::{MediaError, MediaPipeline, MediaSource};
use crate::net::HttpClient;
use crate::permissions::{LocationProvider, PermissionSet, acquire_location};
use crate::socket::events::{
    AgentMessagePayload, AnswerPayload, CallEndedPayload, EV_AGENT_MESSAGE, EV_ANSWER,
    EV_CALL_ENDED_BY_AGENT, EV_CONNECT, EV_DISCONNECT, EV_ICE_CANDIDATE, EV_OFFER, EV_USER_JOINED,
    IceCandidatePayload, OfferPayload, UserJoinedPayload, UserRole,
};
use crate::socket::{SignalingChannel, SocketError, SubscriptionHandle};
use crate::state::{CallState, CallTransition, ConnectionState, EndReason};
use crate::store::{SessionRecord, SessionStore};
use crate::transport::TransportFactory;
use crate::types::events::{
    AgentJoined, AgentMessage, CallEnded, CallStarted, CallTick, EventBus, WaitingForAgent,
};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// The resolved identity of the running session. Constructed once per
/// bootstrap (fresh or resumed) and threaded through every transition that
/// needs an identifier; nothing ambient.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub vcip_id: String,
    pub connection_id: String,
    pub session_token: String,
    pub resumed: bool,
}

impl SessionContext {
    fn fresh(grant: &SessionGrant) -> Self {
        Self {
            vcip_id: grant.vcip_id.clone(),
            connection_id: grant.connection_id.clone(),
            session_token: grant.session_token.clone(),
            resumed: false,
        }
    }

    fn resumed(record: &SessionRecord) -> Self {
        Self {
            vcip_id: record.vcip_id.clone(),
            connection_id: record.connection_id.clone(),
            session_token: record.session_token.clone(),
            resumed: true,
        }
    }
}

/// Controller-internal events, consumed by the single event-loop task.
#[derive(Debug)]
enum ControllerEvent {
    UserJoined { role: UserRole },
    Answer { answer: Value },
    IceCandidate { candidate: Value },
    AgentMessage { message: String, timestamp: Option<String> },
    EndedByAgent { reason: String },
    LocalHangup,
    TransportConnected,
    TransportDisconnected,
}

pub struct Client {
    config: ClientConfig,
    store: Arc<dyn SessionStore>,
    http: Arc<dyn HttpClient>,
    location: Arc<dyn LocationProvider>,
    channel: Arc<SignalingChannel>,
    media: Arc<MediaPipeline>,
    allocator: SessionAllocator,
    pub event_bus: Arc<EventBus>,
    pub permissions: PermissionSet,

    state: Mutex<CallState>,
    connection: Mutex<ConnectionState>,
    session: Mutex<Option<SessionContext>>,
    socket_url: Mutex<Option<String>>,

    // Re-entrancy guard for setup_connection: the resume path and the
    // reconnect path may both invoke it, possibly at the same time.
    is_connecting: AtomicBool,
    offer_sent: AtomicBool,
    listeners_registered: AtomicBool,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,

    controller_tx: mpsc::UnboundedSender<ControllerEvent>,
    controller_rx: Mutex<Option<mpsc::UnboundedReceiver<ControllerEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    pub(crate) keepalive: Mutex<Option<JoinHandle<()>>>,
    call_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn SessionStore>,
        transport_factory: Arc<dyn TransportFactory>,
        media_source: Arc<dyn MediaSource>,
        http: Arc<dyn HttpClient>,
        location: Arc<dyn LocationProvider>,
    ) -> Arc<Self> {
        let (controller_tx, controller_rx) = mpsc::unbounded_channel();
        let allocator = SessionAllocator::new(http.clone(), config.base_url.clone());

        Arc::new(Self {
            config,
            store,
            http,
            location,
            channel: Arc::new(SignalingChannel::new(transport_factory)),
            media: Arc::new(MediaPipeline::new(media_source)),
            allocator,
            event_bus: Arc::new(EventBus::new()),
            permissions: PermissionSet::new(),

            state: Mutex::new(CallState::Idle),
            connection: Mutex::new(ConnectionState::default()),
            session: Mutex::new(None),
            socket_url: Mutex::new(None),

            is_connecting: AtomicBool::new(false),
            offer_sent: AtomicBool::new(false),
            listeners_registered: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),

            controller_tx,
            controller_rx: Mutex::new(Some(controller_rx)),
            event_loop: Mutex::new(None),
            keepalive: Mutex::new(None),
            call_timer: Mutex::new(None),
        })
    }

    pub async fn call_state(&self) -> CallState {
        self.state.lock().await.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.connection.lock().await
    }

    pub(crate) async fn session_context(&self) -> Option<SessionContext> {
        self.session.lock().await.clone()
    }

    pub async fn session(&self) -> Option<SessionContext> {
        self.session_context().await
    }

    pub(crate) fn channel(&self) -> &Arc<SignalingChannel> {
        &self.channel
    }

    /// Moves Idle → AwaitingPermissions. The embedding UI drives permission
    /// probing, reports grants via [`PermissionSet::grant`], then calls
    /// [`Client::begin_call`].
    pub async fn start(&self) -> Result<(), ClientError> {
        self.state.lock().await.apply_transition(CallTransition::Start)?;
        info!(target: "Client", "Session flow started, awaiting permissions");
        Ok(())
    }

    /// Enters `Connecting`: resolves the session (stored or freshly
    /// allocated) and attaches channel + media. Requires all three advisory
    /// permissions.
    pub async fn begin_call(self: &Arc<Self>) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock().await;
            if !matches!(&*state, CallState::AwaitingPermissions) {
                return Err(ClientError::InvalidState(
                    "begin_call requires AwaitingPermissions",
                ));
            }
            if !self.permissions.all_granted() {
                return Err(ClientError::PermissionsMissing);
            }
            state.apply_transition(CallTransition::PermissionsGranted)?;
        }

        if let Some(rx) = self.controller_rx.lock().await.take() {
            let client = self.clone();
            *self.event_loop.lock().await = Some(tokio::spawn(client.run_event_loop(rx)));
        }

        self.bootstrap().await
    }

    /// Resolves identity and converges on [`Client::setup_connection`].
    /// A failing resume clears the stale session and falls back to a fresh
    /// bootstrap; a failing fresh bootstrap aborts back to the permission
    /// screen.
    async fn bootstrap(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.socket_url.lock().await.is_none() {
            match RemoteConfig::fetch(self.http.as_ref(), &self.config.base_url).await {
                Ok(config) => *self.socket_url.lock().await = Some(config.socket_url),
                Err(e) => {
                    self.abort_bootstrap().await;
                    return Err(e.into());
                }
            }
        }

        if let Some(record) = self.store.load().await {
            info!(
                target: "Client",
                "Resuming stored session, connection {}", record.connection_id
            );
            *self.session.lock().await = Some(SessionContext::resumed(&record));
            match self.setup_connection().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        target: "Client",
                        "Resume failed, falling back to fresh bootstrap: {e}"
                    );
                    let _ = self.store.clear().await;
                    *self.session.lock().await = None;
                }
            }
        }

        match self.fresh_bootstrap().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(target: "Client", "Fresh bootstrap failed: {e}");
                self.abort_bootstrap().await;
                Err(e)
            }
        }
    }

    async fn fresh_bootstrap(self: &Arc<Self>) -> Result<(), ClientError> {
        let coords = acquire_location(self.location.as_ref()).await?;

        let request = InitiateRequest {
            customer_name: self.config.customer_name.clone(),
            client_name: self.config.client_name.clone(),
            mobile_number: self.config.mobile_number.clone(),
            latitude: None,
            longitude: None,
            device_info: self.config.device_info.clone(),
        }
        .with_location(coords);

        let grant = self.allocator.initiate(&request).await?;
        self.store
            .save(&SessionRecord::new(
                &grant.vcip_id,
                &grant.connection_id,
                &grant.session_token,
            ))
            .await?;
        *self.session.lock().await = Some(SessionContext::fresh(&grant));

        self.setup_connection().await
    }

    async fn abort_bootstrap(&self) {
        self.stop_keep_alive().await;
        let mut state = self.state.lock().await;
        if state.is_connecting() {
            let _ = state.apply_transition(CallTransition::BootstrapFailed);
        }
    }

    /// The Connecting entry action, shared by every path that needs the
    /// session attached: fresh bootstrap, resume, and reconnection after an
    /// app resume. Idempotent, and guarded against concurrent invocation.
    pub async fn setup_connection(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            debug!(target: "Client", "setup_connection already in progress, skipping");
            return Ok(());
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::SeqCst);
        });

        if self.state.lock().await.is_ended() {
            return Ok(());
        }
        let ctx = self.session_context().await.ok_or(ClientError::NoSession)?;
        let url = self
            .socket_url
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NoSession)?;

        if !self.channel.is_connected() {
            match self.channel.connect(&url).await {
                Ok(()) | Err(SocketError::SocketAlreadyOpen) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.connection.lock().await.set_channel_connected(true);

        self.register_listeners().await;

        self.channel
            .join_room(&ctx.connection_id, UserRole::Customer)
            .await;
        self.connection.lock().await.set_room_joined(true);

        self.start_keep_alive().await;

        self.media.acquire_local_stream().await?;
        self.media
            .create_peer_connection(self.channel.clone(), &ctx.connection_id)
            .await?;
        self.connection.lock().await.set_peer_established(true);

        let mut state = self.state.lock().await;
        if state.is_connecting() {
            state.apply_transition(CallTransition::ConnectionReady)?;
            info!(
                target: "Client",
                "Attached, waiting for agent in room {}", ctx.connection_id
            );
            let _ = self.event_bus.waiting_for_agent.send(Arc::new(WaitingForAgent {
                vcip_id: ctx.vcip_id.clone(),
                connection_id: ctx.connection_id.clone(),
                resumed: ctx.resumed,
            }));
        }
        Ok(())
    }

    /// App-resume hook: when the channel reports not connected while a
    /// session is known, the full Connecting-entry sequence re-runs rather
    /// than only reconnecting the transport.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.session_context().await.is_none() {
            return Ok(());
        }
        if self.channel.is_connected() {
            return Ok(());
        }
        info!(target: "Client", "Channel down on app resume, re-running connection setup");
        self.setup_connection().await
    }

    /// Registers the channel listeners once. Handlers only enqueue; the
    /// event loop does the work.
    async fn register_listeners(&self) {
        if self.listeners_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: "Client", "Registering channel listeners");
        let mut subs = self.subscriptions.lock().await;

        let tx = self.controller_tx.clone();
        subs.push(self.channel.on(EV_USER_JOINED, move |data| {
            match serde_json::from_value::<UserJoinedPayload>(data) {
                Ok(payload) => {
                    let _ = tx.send(ControllerEvent::UserJoined {
                        role: payload.user_type,
                    });
                }
                Err(e) => warn!(target: "Client", "Bad user-joined payload: {e}"),
            }
        }));

        let tx = self.controller_tx.clone();
        subs.push(self.channel.on(EV_ANSWER, move |data| {
            match serde_json::from_value::<AnswerPayload>(data) {
                Ok(payload) => {
                    let _ = tx.send(ControllerEvent::Answer {
                        answer: payload.answer,
                    });
                }
                Err(e) => warn!(target: "Client", "Bad answer payload: {e}"),
            }
        }));

        let tx = self.controller_tx.clone();
        subs.push(self.channel.on(EV_ICE_CANDIDATE, move |data| {
            match serde_json::from_value::<IceCandidatePayload>(data) {
                Ok(payload) => {
                    let _ = tx.send(ControllerEvent::IceCandidate {
                        candidate: payload.candidate,
                    });
                }
                Err(e) => warn!(target: "Client", "Bad ice-candidate payload: {e}"),
            }
        }));

        let tx = self.controller_tx.clone();
        subs.push(self.channel.on(EV_AGENT_MESSAGE, move |data| {
            match serde_json::from_value::<AgentMessagePayload>(data) {
                Ok(payload) => {
                    let _ = tx.send(ControllerEvent::AgentMessage {
                        message: payload.message,
                        timestamp: payload.timestamp,
                    });
                }
                Err(e) => warn!(target: "Client", "Bad agent-message payload: {e}"),
            }
        }));

        let tx = self.controller_tx.clone();
        subs.push(self.channel.on(EV_CALL_ENDED_BY_AGENT, move |data| {
            let reason = serde_json::from_value::<CallEndedPayload>(data)
                .ok()
                .and_then(|p| p.reason)
                .unwrap_or_else(|| "No reason provided".to_string());
            let _ = tx.send(ControllerEvent::EndedByAgent { reason });
        }));

        let tx = self.controller_tx.clone();
        subs.push(self.channel.on(EV_CONNECT, move |_| {
            let _ = tx.send(ControllerEvent::TransportConnected);
        }));

        let tx = self.controller_tx.clone();
        subs.push(self.channel.on(EV_DISCONNECT, move |_| {
            let _ = tx.send(ControllerEvent::TransportDisconnected);
        }));
    }

    async fn run_event_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ControllerEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
            if self.state.lock().await.is_ended() {
                debug!(target: "Client", "Terminal state reached, event loop exiting");
                return;
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: ControllerEvent) {
        match event {
            ControllerEvent::UserJoined { role } => self.handle_user_joined(role).await,
            ControllerEvent::Answer { answer } => self.handle_answer(answer).await,
            ControllerEvent::IceCandidate { candidate } => {
                self.handle_ice_candidate(candidate).await
            }
            ControllerEvent::AgentMessage { message, timestamp } => {
                info!(target: "Client", "Agent message: {message}");
                let _ = self
                    .event_bus
                    .agent_message
                    .send(Arc::new(AgentMessage { message, timestamp }));
            }
            ControllerEvent::EndedByAgent { reason } => {
                info!(target: "Client", "Call ended by agent: {reason}");
                self.end_call(EndReason::Agent { reason }).await;
            }
            ControllerEvent::LocalHangup => {
                info!(target: "Client", "Local hangup");
                self.end_call(EndReason::Local).await;
            }
            ControllerEvent::TransportConnected => {
                self.connection.lock().await.set_channel_connected(true);
                // Room membership does not survive a transport reconnect;
                // not re-joining here would strand the client in a
                // connected-but-not-joined limbo.
                if let Some(ctx) = self.session_context().await {
                    info!(
                        target: "Client",
                        "Transport reconnected, re-joining room {}", ctx.connection_id
                    );
                    self.channel
                        .join_room(&ctx.connection_id, UserRole::Customer)
                        .await;
                    self.connection.lock().await.set_room_joined(true);
                }
            }
            ControllerEvent::TransportDisconnected => {
                warn!(target: "Client", "Transport dropped, waiting for auto-reconnect");
                self.connection.lock().await.set_channel_connected(false);
            }
        }
    }

    /// The agent's join is the trigger for this client to generate the SDP
    /// offer, not the reverse. Exactly one offer per session.
    async fn handle_user_joined(self: &Arc<Self>, role: UserRole) {
        if role != UserRole::Agent {
            debug!(target: "Client", "Ignoring user-joined for {role:?}");
            return;
        }
        if !self.state.lock().await.is_waiting_for_agent() {
            debug!(target: "Client", "Ignoring user-joined outside WaitingForAgent");
            return;
        }
        if self.offer_sent.swap(true, Ordering::SeqCst) {
            warn!(target: "Client", "Duplicate agent join, offer already sent");
            return;
        }
        let Some(ctx) = self.session_context().await else {
            return;
        };

        info!(target: "Client", "Agent joined, starting negotiation");
        let _ = self.event_bus.agent_joined.send(Arc::new(AgentJoined));
        self.stop_keep_alive().await;

        let offer = match self.media.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.negotiation_failure("creating offer", e).await;
                return;
            }
        };
        if self.state.lock().await.is_ended() {
            return;
        }

        let payload = OfferPayload {
            offer,
            connection_id: ctx.connection_id.clone(),
        };
        match serde_json::to_value(&payload) {
            Ok(data) => self.channel.emit(EV_OFFER, data).await,
            Err(e) => {
                self.negotiation_failure("encoding offer", MediaError::Payload(e))
                    .await;
                return;
            }
        }
        info!(target: "Client", "Offer sent for room {}", ctx.connection_id);

        if let Err(e) = self
            .state
            .lock()
            .await
            .apply_transition(CallTransition::AgentJoined)
        {
            warn!(target: "Client", "State transition after offer failed: {e}");
            return;
        }
        self.start_call_timer().await;
        let _ = self.event_bus.call_started.send(Arc::new(CallStarted));
    }

    async fn handle_answer(self: &Arc<Self>, answer: Value) {
        if !self.media.is_open().await {
            debug!(target: "Client", "Dropping answer, peer connection not open");
            return;
        }
        if let Err(e) = self.media.apply_answer(answer).await {
            self.negotiation_failure("applying answer", e).await;
        }
    }

    async fn handle_ice_candidate(self: &Arc<Self>, candidate: Value) {
        if let Err(e) = self.media.add_remote_candidate(candidate).await {
            self.negotiation_failure("applying ice candidate", e).await;
        }
    }

    /// Negotiation failures abort the call: resuming mid-negotiation is not
    /// supported, so the session is cleared along the way.
    async fn negotiation_failure(self: &Arc<Self>, context: &str, err: MediaError) {
        error!(target: "Client", "Negotiation failure while {context}: {err}");
        self.end_call(EndReason::Failed {
            message: format!("{context}: {err}"),
        })
        .await;
    }

    /// Common teardown. Stops both timers, releases media, clears the
    /// persisted session and moves to `Ended` — in that order, from whatever
    /// state the controller was in.
    async fn end_call(self: &Arc<Self>, reason: EndReason) {
        self.stop_keep_alive().await;
        self.stop_call_timer().await;

        let _ = self
            .state
            .lock()
            .await
            .apply_transition(CallTransition::Terminated {
                reason: reason.clone(),
            });

        self.media.close().await;
        if let Err(e) = self.store.clear().await {
            warn!(target: "Client", "Failed to clear session: {e}");
        }
        self.connection.lock().await.set_peer_established(false);

        let _ = self.event_bus.call_ended.send(Arc::new(CallEnded { reason }));
    }

    /// Local hangup: enqueued so it serializes with in-flight signaling.
    pub fn hang_up(&self) {
        let _ = self.controller_tx.send(ControllerEvent::LocalHangup);
    }

    /// Called when the user acknowledged the end of the call: releases the
    /// subscription handles and tears the transport down.
    pub async fn acknowledge_end(&self) {
        for handle in self.subscriptions.lock().await.drain(..) {
            self.channel.off(&handle);
        }
        self.listeners_registered.store(false, Ordering::SeqCst);

        self.channel.disconnect().await;
        self.connection.lock().await.set_channel_connected(false);

        if let Some(handle) = self.event_loop.lock().await.take() {
            handle.abort();
        }
        info!(target: "Client", "Call teardown acknowledged");
    }

    /// The held local track bundle, for the embedding UI's self-view.
    pub async fn local_stream(&self) -> Option<Arc<crate::media::LocalStream>> {
        self.media.local_stream().await
    }

    /// Resulting audio enabled state, or `None` while no stream is held.
    pub async fn toggle_audio(&self) -> Option<bool> {
        self.media.toggle_audio().await
    }

    /// Resulting video enabled state, or `None` while no stream is held.
    pub async fn toggle_video(&self) -> Option<bool> {
        self.media.toggle_video().await
    }

    async fn start_call_timer(self: &Arc<Self>) {
        let mut guard = self.call_timer.lock().await;
        if guard.is_some() {
            return;
        }
        let client = self.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.tick().await;
            let mut elapsed = 0u64;
            loop {
                ticker.tick().await;
                elapsed += 1;
                let _ = client
                    .event_bus
                    .call_tick
                    .send(Arc::new(CallTick { elapsed_secs: elapsed }));
            }
        }));
        debug!(target: "Client", "Call timer started");
    }

    async fn stop_call_timer(&self) {
        if let Some(handle) = self.call_timer.lock().await.take() {
            handle.abort();
            debug!(target: "Client", "Call timer stopped");
        }
    }
}
