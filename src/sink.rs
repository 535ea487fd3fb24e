use async_trait::async_trait;

use crate::db::models::Fixture;
use crate::error::SinkError;

/// Durable owner of fixture records. Shared by the bulk and streaming paths,
/// so implementations must tolerate concurrent writers; last write wins.
#[async_trait]
pub trait FixtureSink: Send + Sync {
    /// Insert or overwrite each fixture by `id`. Never creates duplicates.
    async fn upsert_all(&self, fixtures: &[Fixture]) -> Result<(), SinkError>;

    /// Tombstone the fixture with this id. Unknown ids are a no-op.
    async fn remove(&self, id: i64) -> Result<(), SinkError>;
}
