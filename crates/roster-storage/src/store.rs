//! Roster store contracts shared by the Postgres and in-memory backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roster_core::{Event, EventMember, EventType, JobProgress, Member, RosterUpdate, SyncStatus};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored value is invalid: {0}")]
    InvalidData(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("injected fault: {0}")]
    Injected(String),
}

/// Result of a unique-constraint-aware insert on `(event_id, membership_number)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer already holds the natural key.
    Conflict,
}

/// Event, job-progress and read access outside of chunk transactions.
#[async_trait]
pub trait RosterStore: Send + Sync {
    type Tx: RosterTx;

    /// Open an atomic unit of work. Nothing written through it is visible until commit.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Most recently created active event of the given type.
    async fn find_active_event(&self, event_type: EventType) -> Result<Option<Event>, StoreError>;

    async fn insert_event(&self, event: &Event) -> Result<(), StoreError>;

    async fn attach_dataset(&self, event_id: Uuid, dataset_id: &str) -> Result<(), StoreError>;

    async fn set_event_sync_status(
        &self,
        event_id: Uuid,
        status: SyncStatus,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn save_job_progress(&self, progress: &JobProgress) -> Result<(), StoreError>;

    async fn load_job_progress(&self, job_id: &str) -> Result<Option<JobProgress>, StoreError>;

    async fn roster_row(
        &self,
        event_id: Uuid,
        membership_number: &str,
    ) -> Result<Option<EventMember>, StoreError>;

    async fn count_roster_rows(&self, event_id: Uuid) -> Result<u64, StoreError>;
}

/// One chunk's transaction. Individual writes are isolated so a failed statement
/// does not poison the rest of the chunk.
#[async_trait]
pub trait RosterTx: Send + Sized {
    async fn find_roster_row(
        &mut self,
        event_id: Uuid,
        membership_number: &str,
    ) -> Result<Option<EventMember>, StoreError>;

    async fn insert_roster_row(&mut self, row: &EventMember) -> Result<InsertOutcome, StoreError>;

    /// Rewrite descriptive, contact and provenance data only.
    async fn update_roster_row(
        &mut self,
        row_id: Uuid,
        update: &RosterUpdate,
    ) -> Result<(), StoreError>;

    /// Insert or refresh the canonical member keyed by membership number; returns its id.
    async fn upsert_member(&mut self, member: &Member) -> Result<Uuid, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
