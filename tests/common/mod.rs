//! Shared harness for scenario tests: canned backend, counting media
//! source, transport helpers.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use vkyc_rust::client::Client;
use vkyc_rust::config::ClientConfig;
use vkyc_rust::media::{LocalStream, MediaError, MediaSource, SilentMediaSource};
use vkyc_rust::net::{HttpClient, HttpRequest, HttpResponse};
use vkyc_rust::permissions::{Coordinates, FixedLocation, PermissionKind};
use vkyc_rust::socket::events::EventFrame;
use vkyc_rust::store::{MemorySessionStore, SessionStore};
use vkyc_rust::transport::mock::MockTransportFactory;
use vkyc_rust::transport::{Transport, TransportEvent, TransportFactory};

pub const GRANT_BODY: &str =
    r#"{"success":true,"data":{"vcipId":"V1","connectionId":"CONN-1","sessionToken":"T1"}}"#;

/// Backend stub answering `/config` and `/customer/initiate`.
pub struct TestBackend {
    pub initiate_calls: AtomicUsize,
    initiate_body: String,
}

impl TestBackend {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            initiate_calls: AtomicUsize::new(0),
            initiate_body: GRANT_BODY.to_string(),
        })
    }

    pub fn rejecting(message: &str) -> Arc<Self> {
        Arc::new(Self {
            initiate_calls: AtomicUsize::new(0),
            initiate_body: format!(r#"{{"success":false,"message":"{message}"}}"#),
        })
    }
}

#[async_trait]
impl HttpClient for TestBackend {
    async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let body = if request.url.ends_with("/config") {
            r#"{"socketUrl":"ws://signal.test"}"#.to_string()
        } else if request.url.ends_with("/customer/initiate") {
            self.initiate_calls.fetch_add(1, Ordering::SeqCst);
            self.initiate_body.clone()
        } else {
            anyhow::bail!("unexpected request to {}", request.url);
        };
        Ok(HttpResponse {
            status_code: 200,
            body: body.into_bytes(),
        })
    }
}

/// Wraps the silent source and counts acquisitions.
pub struct CountingMediaSource {
    inner: SilentMediaSource,
    pub acquisitions: AtomicUsize,
}

impl CountingMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SilentMediaSource::new(),
            acquisitions: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MediaSource for CountingMediaSource {
    async fn acquire(&self) -> Result<Arc<LocalStream>, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire().await
    }
}

/// Factory whose first `create_transport` fails, then delegates to the mock.
pub struct FailOnceFactory {
    inner: MockTransportFactory,
    attempts: AtomicUsize,
}

impl FailOnceFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MockTransportFactory::new(),
            attempts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TransportFactory for FailOnceFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("simulated handshake failure");
        }
        self.inner.create_transport(url).await
    }
}

pub struct Harness {
    pub client: Arc<Client>,
    pub factory: Arc<MockTransportFactory>,
    pub store: Arc<MemorySessionStore>,
    pub backend: Arc<TestBackend>,
    pub media: Arc<CountingMediaSource>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store_and_backend(Arc::new(MemorySessionStore::new()), TestBackend::granting())
    }

    pub fn with_store_and_backend(
        store: Arc<MemorySessionStore>,
        backend: Arc<TestBackend>,
    ) -> Self {
        let factory = Arc::new(MockTransportFactory::new());
        let media = CountingMediaSource::new();
        let client = Client::new(
            ClientConfig::new("http://backend.test"),
            store.clone(),
            factory.clone(),
            media.clone(),
            backend.clone(),
            Arc::new(FixedLocation(Coordinates {
                latitude: 12.97,
                longitude: 77.59,
            })),
        );
        Self {
            client,
            factory,
            store,
            backend,
            media,
        }
    }

    /// start + grant everything + begin_call.
    pub async fn start_call(&self) {
        self.client.start().await.unwrap();
        grant_all(&self.client);
        self.client.begin_call().await.unwrap();
    }

    /// Frames sent on the current mock transport, decoded.
    pub fn sent_events(&self) -> Vec<EventFrame> {
        self.factory
            .transport()
            .sent_frames()
            .iter()
            .map(|frame| serde_json::from_str(frame).expect("sent frame must be valid JSON"))
            .collect()
    }

    pub fn count_events(&self, name: &str) -> usize {
        self.sent_events().iter().filter(|f| f.event == name).count()
    }

    /// Injects a server-side frame into the channel.
    pub async fn inject(&self, event: &str, data: Value) {
        self.factory
            .event_sender()
            .send(TransportEvent::Message(
                json!({"event": event, "data": data}).to_string(),
            ))
            .await
            .unwrap();
        settle().await;
    }

    pub async fn agent_joins(&self) {
        self.inject("user-joined", json!({"userType": "agent"})).await;
    }
}

pub fn grant_all(client: &Client) {
    for kind in [
        PermissionKind::Microphone,
        PermissionKind::Camera,
        PermissionKind::Location,
    ] {
        client.permissions.grant(kind);
    }
}

/// Lets queued events drain through the pump and the controller loop.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}

/// Seeds the store with a resumable record.
pub async fn seed_session(store: &MemorySessionStore, vcip: &str, conn: &str, token: &str) {
    store
        .save(&vkyc_rust::store::SessionRecord::new(vcip, conn, token))
        .await
        .unwrap();
}
