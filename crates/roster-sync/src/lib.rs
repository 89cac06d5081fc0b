//! Sync orchestration: fetch an export, guard and normalize it, resolve the
//! target event and upsert every record in chunked transactions.

pub mod batch;
pub mod config;
pub mod pipeline;
pub mod target;
pub mod upsert;

pub use batch::{
    BatchConfig, BatchOrchestrator, BatchReport, BatchStats, ChunkError, RecordFailure,
    MAX_REPORTED_FAILURES,
};
pub use config::{expand_env_placeholders, DatasetConfig, DatasetRegistry, SyncConfig};
pub use pipeline::{new_job_id, SyncError, SyncPipeline, SyncRequest, SyncRunSummary};
pub use target::{placeholder_event, resolve_target, ResolvedTarget, PLACEHOLDER_LEAD_DAYS};
pub use upsert::{
    new_identity, upsert_draft, upsert_record, UpsertContext, UpsertError, UpsertOutcome,
};

pub const CRATE_NAME: &str = "roster-sync";
