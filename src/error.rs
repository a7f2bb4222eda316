//! Top-level error type aggregating the per-module taxonomies.

use crate::allocate::AllocateError;
use crate::config::ConfigError;
use crate::media::MediaError;
use crate::permissions::PermissionError;
use crate::socket::SocketError;
use crate::state::InvalidTransition;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no active session")]
    NoSession,

    #[error("not all permissions are granted")]
    PermissionsMissing,

    #[error("invalid call state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Allocate(#[from] AllocateError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
