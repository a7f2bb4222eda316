use super::error::MediaError;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// The held local audio+video track bundle.
///
/// Tracks stay attached to the peer connection for the whole call; muting
/// flips the enabled flags in place and the producing source stops writing
/// samples for a disabled track.
pub struct LocalStream {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    writer: StdMutex<Option<JoinHandle<()>>>,
}

impl LocalStream {
    pub fn new(audio: Arc<TrackLocalStaticSample>, video: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            audio,
            video,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            writer: StdMutex::new(None),
        }
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        self.audio.clone()
    }

    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        self.video.clone()
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::Relaxed)
    }

    /// Flips the audio flag and returns the resulting enabled state.
    pub fn toggle_audio(&self) -> bool {
        let enabled = !self.audio_enabled.load(Ordering::Relaxed);
        self.audio_enabled.store(enabled, Ordering::Relaxed);
        debug!(target: "Media", "Audio {}", if enabled { "unmuted" } else { "muted" });
        enabled
    }

    /// Flips the video flag and returns the resulting enabled state.
    pub fn toggle_video(&self) -> bool {
        let enabled = !self.video_enabled.load(Ordering::Relaxed);
        self.video_enabled.store(enabled, Ordering::Relaxed);
        debug!(target: "Media", "Video {}", if enabled { "on" } else { "off" });
        enabled
    }

    /// Attaches the sample-writer task so it is stopped with the stream.
    pub fn set_writer(&self, handle: JoinHandle<()>) {
        if let Some(old) = self
            .writer
            .lock()
            .expect("writer lock poisoned")
            .replace(handle)
        {
            old.abort();
        }
    }

    /// Stops sample production. Called by the pipeline on close.
    pub(crate) fn stop(&self) {
        if let Some(handle) = self.writer.lock().expect("writer lock poisoned").take() {
            handle.abort();
        }
    }
}

/// Produces the local track bundle.
///
/// Real implementations wrap platform capture; failing to produce tracks is
/// the authoritative media-permission failure, distinct from the advisory
/// permission probing done up front.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<Arc<LocalStream>, MediaError>;
}

// Opus DTX silence frame.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Capture-less media source: Opus silence on the audio track, nothing on
/// the video track. Lets the call flow run end-to-end on machines without
/// devices (demo binary, tests).
#[derive(Default)]
pub struct SilentMediaSource;

impl SilentMediaSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSource for SilentMediaSource {
    async fn acquire(&self) -> Result<Arc<LocalStream>, MediaError> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "vkyc-local".to_owned(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "vkyc-local".to_owned(),
        ));

        let stream = Arc::new(LocalStream::new(audio, video));

        let writer_stream = stream.clone();
        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AUDIO_FRAME_INTERVAL);
            loop {
                ticker.tick().await;
                if !writer_stream.audio_enabled() {
                    continue;
                }
                // Unbound tracks swallow samples, so this is safe to run
                // before the peer connection exists.
                let _ = writer_stream
                    .audio_track()
                    .write_sample(&Sample {
                        data: Bytes::from_static(&OPUS_SILENCE),
                        duration: AUDIO_FRAME_INTERVAL,
                        ..Default::default()
                    })
                    .await;
            }
        });
        stream.set_writer(writer);

        debug!(target: "Media", "Acquired silent local stream");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_toggle_flips_and_reports_state() {
        let source = SilentMediaSource::new();
        let stream = source.acquire().await.unwrap();

        assert!(stream.audio_enabled());
        assert!(!stream.toggle_audio());
        assert!(!stream.audio_enabled());
        assert!(stream.toggle_audio());

        assert!(stream.video_enabled());
        assert!(!stream.toggle_video());
        stream.stop();
    }
}
