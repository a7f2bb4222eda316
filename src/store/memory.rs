use super::error::Result;
use super::traits::SessionStore;
use super::SessionRecord;
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use tokio::sync::Mutex;

/// In-memory session store for tests and throwaway profiles.
#[derive(Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<()> {
        *self.record.lock().await = Some(record.clone());
        Ok(())
    }

    async fn load(&self) -> Option<SessionRecord> {
        let mut guard = self.record.lock().await;
        match guard.as_ref() {
            Some(record) if record.is_expired(Utc::now()) => {
                debug!(target: "Store", "Session expired, clearing");
                *guard = None;
                None
            }
            Some(record) => Some(record.clone()),
            None => None,
        }
    }

    async fn clear(&self) -> Result<()> {
        *self.record.lock().await = None;
        Ok(())
    }
}
