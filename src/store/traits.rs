use super::SessionRecord;
use super::error::Result;
use async_trait::async_trait;

/// Persistence for the single session record of this profile.
///
/// Accessed single-threaded from the call session controller; `load` never
/// fails (malformed or unreadable data is treated as absent), while `save`
/// surfaces write errors so a failed persist is not mistaken for durability.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persists the record, overwriting any prior one.
    async fn save(&self, record: &SessionRecord) -> Result<()>;

    /// Returns the stored record if present and younger than
    /// [`super::SESSION_TTL`]. An expired or malformed record is deleted as
    /// a side effect and reported as absent.
    async fn load(&self) -> Option<SessionRecord>;

    /// Deletes the stored record. Idempotent.
    async fn clear(&self) -> Result<()>;
}
