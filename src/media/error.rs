use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media access denied: {0}")]
    AccessDenied(String),

    #[error("no local stream acquired")]
    NoLocalStream,

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}
