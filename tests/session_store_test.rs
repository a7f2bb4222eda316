//! Session persistence across simulated restarts.

use vkyc_rust::store::{FileSessionStore, SessionRecord, SessionStore};

/// A reload within the TTL — a second store over the same directory, as
/// after a process restart — restores identical fields.
#[tokio::test]
async fn test_reload_restores_identical_fields() {
    let dir = tempfile::tempdir().unwrap();

    let record = SessionRecord::new("V1", "CONN-1", "T1");
    {
        let store = FileSessionStore::new(dir.path()).await.unwrap();
        store.save(&record).await.unwrap();
    }

    let reopened = FileSessionStore::new(dir.path()).await.unwrap();
    let loaded = reopened.load().await.expect("record should survive reload");
    assert_eq!(loaded, record);
}

/// Termination on one instance is visible to the next.
#[tokio::test]
async fn test_clear_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = FileSessionStore::new(dir.path()).await.unwrap();
        store
            .save(&SessionRecord::new("V1", "CONN-1", "T1"))
            .await
            .unwrap();
        store.clear().await.unwrap();
    }

    let reopened = FileSessionStore::new(dir.path()).await.unwrap();
    assert!(reopened.load().await.is_none());
}
