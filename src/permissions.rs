//! Advisory permission tracking and location acquisition.
//!
//! The permission set mirrors what the UI layer has probed; it is advisory
//! only. The authoritative failure for camera/microphone is the media
//! source's at acquisition time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

pub const LOCATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("{0:?} access denied")]
    Denied(PermissionKind),
    #[error("location acquisition timed out after {0:?}")]
    LocationTimeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionKind {
    Microphone,
    Camera,
    Location,
}

/// Monotonic permission flags: once granted, never reset within a session
/// lifetime.
#[derive(Debug, Default)]
pub struct PermissionSet {
    microphone: AtomicBool,
    camera: AtomicBool,
    location: AtomicBool,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, kind: PermissionKind) {
        match kind {
            PermissionKind::Microphone => self.microphone.store(true, Ordering::Relaxed),
            PermissionKind::Camera => self.camera.store(true, Ordering::Relaxed),
            PermissionKind::Location => self.location.store(true, Ordering::Relaxed),
        }
    }

    pub fn is_granted(&self, kind: PermissionKind) -> bool {
        match kind {
            PermissionKind::Microphone => self.microphone.load(Ordering::Relaxed),
            PermissionKind::Camera => self.camera.load(Ordering::Relaxed),
            PermissionKind::Location => self.location.load(Ordering::Relaxed),
        }
    }

    pub fn all_granted(&self) -> bool {
        self.is_granted(PermissionKind::Microphone)
            && self.is_granted(PermissionKind::Camera)
            && self.is_granted(PermissionKind::Location)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Produces the device's current position for the allocation request.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self) -> Result<Coordinates, PermissionError>;
}

/// Applies the fixed acquisition bound on top of whatever the provider does.
pub async fn acquire_location(
    provider: &dyn LocationProvider,
) -> Result<Coordinates, PermissionError> {
    timeout(LOCATION_TIMEOUT, provider.current_location())
        .await
        .map_err(|_| PermissionError::LocationTimeout(LOCATION_TIMEOUT))?
}

/// Provider returning a fixed position. Good enough for the demo binary and
/// for tests.
pub struct FixedLocation(pub Coordinates);

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_location(&self) -> Result<Coordinates, PermissionError> {
        Ok(self.0)
    }
}
