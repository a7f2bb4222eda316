use super::error::{Result, StoreError};
use super::traits::SessionStore;
use super::SessionRecord;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use std::io;
use std::path::PathBuf;
use tokio::fs;

const SESSION_FILE: &str = "session.json";

/// File-backed session store: one JSON record per profile directory.
pub struct FileSessionStore {
    base_path: PathBuf,
}

impl FileSessionStore {
    pub async fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn session_path(&self) -> PathBuf {
        self.base_path.join(SESSION_FILE)
    }

    async fn remove_session_file(&self) -> Result<()> {
        fs::remove_file(self.session_path())
            .await
            .or_else(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(self.session_path(), data)
            .await
            .map_err(StoreError::Io)?;
        debug!(target: "Store", "Session saved for connection {}", record.connection_id);
        Ok(())
    }

    async fn load(&self) -> Option<SessionRecord> {
        let data = match fs::read(self.session_path()).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(target: "Store", "Failed to read session file: {e}");
                return None;
            }
        };

        let record: SessionRecord = match serde_json::from_slice(&data) {
            Ok(record) => record,
            Err(e) => {
                // Fail closed: a record we cannot parse is a record we
                // do not have.
                warn!(target: "Store", "Malformed session file, discarding: {e}");
                let _ = self.remove_session_file().await;
                return None;
            }
        };

        if record.is_expired(Utc::now()) {
            debug!(target: "Store", "Session expired, clearing");
            let _ = self.remove_session_file().await;
            return None;
        }

        debug!(target: "Store", "Session restored for connection {}", record.connection_id);
        Some(record)
    }

    async fn clear(&self) -> Result<()> {
        self.remove_session_file().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store_in(dir: &tempfile::TempDir) -> FileSessionStore {
        FileSessionStore::new(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        let record = SessionRecord::new("V1", "CONN-1", "T1");
        store.save(&record).await.unwrap();

        let loaded = store.load().await.expect("record should be present");
        assert_eq!(loaded, record);
    }

    fn ttl() -> Duration {
        Duration::seconds(super::super::SESSION_TTL.as_secs() as i64)
    }

    #[tokio::test]
    async fn test_expired_record_is_deleted_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        let mut record = SessionRecord::new("V1", "CONN-1", "T1");
        record.saved_at = Utc::now() - ttl() - Duration::seconds(1);
        store.save(&record).await.unwrap();

        assert!(store.load().await.is_none());
        // The expired file must be gone, not merely skipped.
        assert!(!dir.path().join(SESSION_FILE).exists());
    }

    #[tokio::test]
    async fn test_record_just_inside_ttl_survives() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        let mut record = SessionRecord::new("V1", "CONN-1", "T1");
        record.saved_at = Utc::now() - ttl() + Duration::minutes(1);
        store.save(&record).await.unwrap();

        assert!(store.load().await.is_some());
    }

    #[tokio::test]
    async fn test_malformed_file_treated_as_absent_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        fs::write(dir.path().join(SESSION_FILE), b"{not json")
            .await
            .unwrap();

        assert!(store.load().await.is_none());
        assert!(!dir.path().join(SESSION_FILE).exists());
    }

    #[tokio::test]
    async fn test_save_overwrites_prior_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        store
            .save(&SessionRecord::new("V1", "CONN-1", "T1"))
            .await
            .unwrap();
        store
            .save(&SessionRecord::new("V2", "CONN-2", "T2"))
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.vcip_id, "V2");
        assert_eq!(loaded.connection_id, "CONN-2");
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        store
            .save(&SessionRecord::new("V1", "CONN-1", "T1"))
            .await
            .unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.is_none());
    }
}
