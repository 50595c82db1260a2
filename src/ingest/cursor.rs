//! Ingestion cursor store: durable single-value holder for the sync token.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::ingest::model::SyncCursor;

/// Durable home of the current [`SyncCursor`].
///
/// Only the source poller writes to it, and only after a fetched batch has
/// been handed off downstream.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Current cursor, or `None` when the next poll must be a full sync.
    async fn read(&self) -> Result<Option<SyncCursor>, DatabaseError>;

    /// Replace the current cursor.
    async fn write(&self, cursor: &SyncCursor) -> Result<(), DatabaseError>;

    /// Forget the cursor (operator reset). The next poll is a full sync.
    async fn reset(&self) -> Result<(), DatabaseError>;
}

/// In-process cursor store. Not durable; for tests and embedding.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursor: RwLock<Option<SyncCursor>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn read(&self) -> Result<Option<SyncCursor>, DatabaseError> {
        Ok(self.cursor.read().await.clone())
    }

    async fn write(&self, cursor: &SyncCursor) -> Result<(), DatabaseError> {
        *self.cursor.write().await = Some(cursor.clone());
        Ok(())
    }

    async fn reset(&self) -> Result<(), DatabaseError> {
        *self.cursor.write().await = None;
        Ok(())
    }
}
