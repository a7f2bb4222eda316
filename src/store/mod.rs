pub mod error;
pub mod filestore;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use filestore::FileSessionStore;
pub use memory::MemorySessionStore;
pub use traits::SessionStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a persisted session stays resumable.
pub const SESSION_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// The durable identity of one call session, written once per new session
/// and read back on every start. A record is either absent or fully
/// populated; partial writes never happen because the whole record is
/// serialized in one shot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub vcip_id: String,
    pub connection_id: String,
    pub session_token: String,
    pub saved_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(
        vcip_id: impl Into<String>,
        connection_id: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            vcip_id: vcip_id.into(),
            connection_id: connection_id.into(),
            session_token: session_token.into(),
            saved_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.saved_at).num_seconds() >= SESSION_TTL.as_secs() as i64
    }
}
