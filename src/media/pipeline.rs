use super::error::MediaError;
use super::source::{LocalStream, MediaSource};
use crate::socket::SignalingChannel;
use crate::socket::events::{EV_ICE_CANDIDATE, IceCandidatePayload};
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Owns the media handles of one call: the local track bundle and the peer
/// connection. Acquisition and peer creation are idempotent so the
/// re-entrant connection path can run through them again without
/// duplicating anything.
pub struct MediaPipeline {
    source: Arc<dyn MediaSource>,
    local: Mutex<Option<Arc<LocalStream>>>,
    peer: Mutex<Option<Arc<RTCPeerConnection>>>,
    // Senders are retained for the lifetime of the peer connection.
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    // Remote candidates that arrived before the remote description; flushed
    // in arrival order once the answer is applied.
    pending_candidates: Mutex<Vec<Value>>,
    closed: AtomicBool,
}

impl MediaPipeline {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            local: Mutex::new(None),
            peer: Mutex::new(None),
            senders: Mutex::new(Vec::new()),
            pending_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Acquires the local audio+video bundle from the media source. A second
    /// call while a bundle is held returns the existing one.
    pub async fn acquire_local_stream(&self) -> Result<Arc<LocalStream>, MediaError> {
        let mut local = self.local.lock().await;
        if let Some(stream) = local.as_ref() {
            debug!(target: "Media", "Local stream already held, reusing");
            return Ok(stream.clone());
        }
        let stream = self.source.acquire().await?;
        *local = Some(stream.clone());
        // A fresh acquisition starts a fresh call.
        self.closed.store(false, Ordering::Relaxed);
        Ok(stream)
    }

    pub async fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.local.lock().await.clone()
    }

    /// Builds the peer connection, attaches the held local tracks, and wires
    /// candidate generation to `ice-candidate` emissions tagged with
    /// `connection_id`. Idempotent: an existing open peer connection is kept.
    pub async fn create_peer_connection(
        &self,
        channel: Arc<SignalingChannel>,
        connection_id: &str,
    ) -> Result<(), MediaError> {
        let stream = self
            .local
            .lock()
            .await
            .clone()
            .ok_or(MediaError::NoLocalStream)?;

        let mut peer = self.peer.lock().await;
        if peer.is_some() {
            debug!(target: "Media", "Peer connection already exists, reusing");
            return Ok(());
        }

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![STUN_SERVER.to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        let mut senders = self.senders.lock().await;
        senders.push(
            pc.add_track(stream.audio_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?,
        );
        senders.push(
            pc.add_track(stream.video_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?,
        );
        drop(senders);

        let room = connection_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let channel = channel.clone();
            let room = room.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(target: "Media", "Failed to encode ICE candidate: {e}");
                        return;
                    }
                };
                match serde_json::to_value(IceCandidatePayload {
                    candidate: serde_json::to_value(&init).unwrap_or(Value::Null),
                    connection_id: Some(room),
                }) {
                    Ok(data) => channel.emit(EV_ICE_CANDIDATE, data).await,
                    Err(e) => warn!(target: "Media", "Failed to encode ICE payload: {e}"),
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(|state| {
            debug!(target: "Media", "Peer connection state: {state}");
            Box::pin(async {})
        }));

        *peer = Some(pc);
        debug!(target: "Media", "Peer connection created for room {connection_id}");
        Ok(())
    }

    /// Creates an SDP offer (audio and video are both in it because both
    /// local tracks are attached), applies it as the local description and
    /// returns its wire form.
    pub async fn create_offer(&self) -> Result<Value, MediaError> {
        let pc = self
            .peer
            .lock()
            .await
            .clone()
            .ok_or_else(|| MediaError::Negotiation("no peer connection".to_string()))?;

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_value(&offer)?)
    }

    /// Applies the remote answer. An answer arriving before the local
    /// description is set is a protocol violation from the remote side and
    /// is reported, not retried.
    pub async fn apply_answer(&self, answer: Value) -> Result<(), MediaError> {
        if self.closed.load(Ordering::Relaxed) {
            debug!(target: "Media", "Dropping answer after close");
            return Ok(());
        }
        let pc = self
            .peer
            .lock()
            .await
            .clone()
            .ok_or_else(|| MediaError::Negotiation("no peer connection".to_string()))?;

        if pc.local_description().await.is_none() {
            return Err(MediaError::Negotiation(
                "answer received before local description was set".to_string(),
            ));
        }

        let desc: RTCSessionDescription = serde_json::from_value(answer)?;
        pc.set_remote_description(desc).await?;
        debug!(target: "Media", "Remote description applied");

        let pending: Vec<Value> = self.pending_candidates.lock().await.drain(..).collect();
        for candidate in pending {
            self.apply_candidate(&pc, candidate).await?;
        }
        Ok(())
    }

    /// Applies a remote ICE candidate in delivery order. Candidates arriving
    /// before the remote description are held back; candidates arriving
    /// after close are dropped.
    pub async fn add_remote_candidate(&self, candidate: Value) -> Result<(), MediaError> {
        if self.closed.load(Ordering::Relaxed) {
            debug!(target: "Media", "Dropping ICE candidate after close");
            return Ok(());
        }
        let Some(pc) = self.peer.lock().await.clone() else {
            debug!(target: "Media", "Dropping ICE candidate, no peer connection");
            return Ok(());
        };

        if pc.remote_description().await.is_none() {
            debug!(target: "Media", "Holding ICE candidate until remote description");
            self.pending_candidates.lock().await.push(candidate);
            return Ok(());
        }
        self.apply_candidate(&pc, candidate).await
    }

    async fn apply_candidate(
        &self,
        pc: &Arc<RTCPeerConnection>,
        candidate: Value,
    ) -> Result<(), MediaError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        pc.add_ice_candidate(init).await?;
        Ok(())
    }

    /// Resulting audio enabled state, or `None` when no stream is held.
    pub async fn toggle_audio(&self) -> Option<bool> {
        self.local.lock().await.as_ref().map(|s| s.toggle_audio())
    }

    /// Resulting video enabled state, or `None` when no stream is held.
    pub async fn toggle_video(&self) -> Option<bool> {
        self.local.lock().await.as_ref().map(|s| s.toggle_video())
    }

    pub async fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && self.peer.lock().await.is_some()
    }

    /// Releases all held tracks and the peer connection. Safe to call when
    /// already closed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.pending_candidates.lock().await.clear();
        self.senders.lock().await.clear();
        if let Some(pc) = self.peer.lock().await.take() {
            if let Err(e) = pc.close().await {
                warn!(target: "Media", "Error closing peer connection: {e}");
            }
        }
        if let Some(stream) = self.local.lock().await.take() {
            stream.stop();
        }
        debug!(target: "Media", "Media pipeline closed");
    }

    #[cfg(test)]
    pub(crate) async fn peer_handle(&self) -> Option<Arc<RTCPeerConnection>> {
        self.peer.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SilentMediaSource;
    use crate::transport::mock::MockTransportFactory;

    async fn pipeline_with_channel() -> (MediaPipeline, Arc<SignalingChannel>) {
        let pipeline = MediaPipeline::new(Arc::new(SilentMediaSource::new()));
        let channel = Arc::new(SignalingChannel::new(Arc::new(
            MockTransportFactory::new(),
        )));
        (pipeline, channel)
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let (pipeline, _channel) = pipeline_with_channel().await;
        let first = pipeline.acquire_local_stream().await.unwrap();
        let second = pipeline.acquire_local_stream().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_create_peer_connection_requires_local_stream() {
        let (pipeline, channel) = pipeline_with_channel().await;
        let err = pipeline
            .create_peer_connection(channel, "CONN-1")
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NoLocalStream));
    }

    #[tokio::test]
    async fn test_create_peer_connection_is_idempotent() {
        let (pipeline, channel) = pipeline_with_channel().await;
        pipeline.acquire_local_stream().await.unwrap();
        pipeline
            .create_peer_connection(channel.clone(), "CONN-1")
            .await
            .unwrap();
        let first = pipeline.peer_handle().await.unwrap();
        pipeline
            .create_peer_connection(channel, "CONN-1")
            .await
            .unwrap();
        let second = pipeline.peer_handle().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_answer_before_local_description_is_rejected() {
        let (pipeline, channel) = pipeline_with_channel().await;
        pipeline.acquire_local_stream().await.unwrap();
        pipeline
            .create_peer_connection(channel, "CONN-1")
            .await
            .unwrap();

        let err = pipeline
            .apply_answer(serde_json::json!({"type": "answer", "sdp": "v=0\r\n"}))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Negotiation(_)));
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_offer_sets_local_description() {
        let (pipeline, channel) = pipeline_with_channel().await;
        pipeline.acquire_local_stream().await.unwrap();
        pipeline
            .create_peer_connection(channel, "CONN-1")
            .await
            .unwrap();

        let offer = pipeline.create_offer().await.unwrap();
        assert_eq!(offer["type"], "offer");
        assert!(offer["sdp"].as_str().unwrap().contains("v=0"));

        let pc = pipeline.peer_handle().await.unwrap();
        assert!(pc.local_description().await.is_some());
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_candidates_after_close_are_dropped() {
        let (pipeline, channel) = pipeline_with_channel().await;
        pipeline.acquire_local_stream().await.unwrap();
        pipeline
            .create_peer_connection(channel, "CONN-1")
            .await
            .unwrap();
        pipeline.close().await;

        // Must not error even though the candidate is junk: it is dropped
        // before parsing.
        pipeline
            .add_remote_candidate(serde_json::json!({"candidate": 5}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (pipeline, _channel) = pipeline_with_channel().await;
        pipeline.acquire_local_stream().await.unwrap();
        pipeline.close().await;
        pipeline.close().await;
        assert!(!pipeline.is_open().await);
    }
}
