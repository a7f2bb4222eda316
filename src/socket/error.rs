use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Socket is already open")]
    SocketAlreadyOpen,
    #[error("Socket is closed")]
    SocketClosed,
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Connect timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, SocketError>;
