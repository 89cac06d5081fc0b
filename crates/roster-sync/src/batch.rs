//! Chunked, transactional processing of normalized export records.
//!
//! Each chunk commits or rolls back as a unit. Record failures are counted and
//! the chunk carries on; a chunk that cannot open or commit its transaction is
//! counted as failed in full, and too many of those abort the run.

use std::time::{Duration, Instant};

use chrono::Utc;
use roster_adapters::mapping::MEMBERSHIP_NUMBER_KEYS;
use roster_adapters::RawRecord;
use roster_core::{JobProgress, JobStatus, SyncStage};
use roster_storage::{RosterStore, RosterTx, StoreError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::upsert::{upsert_record, UpsertContext, UpsertError, UpsertOutcome};

/// Cap on individually reported record failures per run.
pub const MAX_REPORTED_FAILURES: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub chunk_size: usize,
    /// Chunk failures tolerated before the run stops early.
    pub max_failed_chunks: usize,
    pub chunk_pause: Duration,
    pub progress_every: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            max_failed_chunks: 20,
            chunk_pause: Duration::from_millis(100),
            progress_every: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub errored: u64,
    pub committed_chunks: u64,
    pub failed_chunks: u64,
}

impl BatchStats {
    fn absorb(&mut self, chunk: &BatchStats) {
        self.processed += chunk.processed;
        self.created += chunk.created;
        self.updated += chunk.updated;
        self.errored += chunk.errored;
        self.committed_chunks += chunk.committed_chunks;
        self.failed_chunks += chunk.failed_chunks;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    /// Zero-based position in the normalized record list.
    pub index: usize,
    pub membership_number: Option<String>,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk {chunk}: could not open transaction: {source}")]
    Begin {
        chunk: usize,
        #[source]
        source: StoreError,
    },
    #[error("chunk {chunk}: commit failed: {source}")]
    Commit {
        chunk: usize,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub total_records: u64,
    pub total_chunks: usize,
    pub stats: BatchStats,
    /// Records never attempted because the run stopped early.
    pub skipped: u64,
    pub aborted: bool,
    pub failures: Vec<RecordFailure>,
    pub chunk_errors: Vec<String>,
}

impl BatchReport {
    /// SUCCESS when every chunk committed, PARTIAL when only some did,
    /// FAILED when none did.
    pub fn status(&self) -> JobStatus {
        if self.stats.failed_chunks == 0 && !self.aborted {
            JobStatus::Success
        } else if self.stats.committed_chunks == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Partial
        }
    }
}

struct ChunkOutcome {
    stats: BatchStats,
    failures: Vec<RecordFailure>,
}

#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Process `records` in chunks, saving `progress` after each one.
    pub async fn run<S: RosterStore>(
        &self,
        store: &S,
        ctx: &UpsertContext,
        records: &[JsonValue],
        progress: &mut JobProgress,
    ) -> BatchReport {
        let chunk_size = self.config.chunk_size.max(1);
        let total_records = records.len() as u64;
        let total_chunks = records.len().div_ceil(chunk_size);
        let mut report = BatchReport {
            total_records,
            total_chunks,
            stats: BatchStats::default(),
            skipped: 0,
            aborted: false,
            failures: Vec::new(),
            chunk_errors: Vec::new(),
        };

        progress.stage = SyncStage::BatchProcess;
        progress.total_records = total_records;

        let started = Instant::now();
        let progress_every = self.config.progress_every.max(1) as u64;
        let mut next_progress_log = progress_every;

        for (chunk_index, chunk) in records.chunks(chunk_size).enumerate() {
            let offset = chunk_index * chunk_size;
            match self.process_chunk(store, ctx, chunk_index, offset, chunk).await {
                Ok(outcome) => {
                    report.stats.absorb(&outcome.stats);
                    let room = MAX_REPORTED_FAILURES.saturating_sub(report.failures.len());
                    report.failures.extend(outcome.failures.into_iter().take(room));
                }
                Err(err) => {
                    error!(error = %err, records = chunk.len(), "chunk rolled back");
                    report.stats.absorb(&BatchStats {
                        processed: chunk.len() as u64,
                        errored: chunk.len() as u64,
                        failed_chunks: 1,
                        ..BatchStats::default()
                    });
                    report.chunk_errors.push(err.to_string());
                }
            }

            self.record_progress(store, progress, &report.stats).await;

            if report.stats.processed >= next_progress_log || report.stats.processed == total_records {
                log_progress(&report.stats, total_records, started.elapsed());
                while next_progress_log <= report.stats.processed {
                    next_progress_log += progress_every;
                }
            }

            if report.stats.failed_chunks > self.config.max_failed_chunks as u64 {
                report.aborted = true;
                report.skipped = total_records - report.stats.processed;
                error!(
                    failed_chunks = report.stats.failed_chunks,
                    limit = self.config.max_failed_chunks,
                    skipped = report.skipped,
                    "too many failed chunks; stopping early"
                );
                break;
            }

            let is_last = offset + chunk.len() >= records.len();
            if !is_last && !self.config.chunk_pause.is_zero() {
                tokio::time::sleep(self.config.chunk_pause).await;
            }
        }

        report
    }

    async fn process_chunk<S: RosterStore>(
        &self,
        store: &S,
        ctx: &UpsertContext,
        chunk_index: usize,
        offset: usize,
        records: &[JsonValue],
    ) -> Result<ChunkOutcome, ChunkError> {
        let chunk = chunk_index + 1;
        let mut tx = store
            .begin()
            .await
            .map_err(|source| ChunkError::Begin { chunk, source })?;

        let now = Utc::now();
        let mut stats = BatchStats::default();
        let mut failures = Vec::new();
        for (position, raw) in records.iter().enumerate() {
            stats.processed += 1;
            match upsert_record(&mut tx, ctx, raw, now).await {
                Ok(UpsertOutcome::Created) => stats.created += 1,
                Ok(UpsertOutcome::Updated) => stats.updated += 1,
                Err(err) => {
                    stats.errored += 1;
                    let failure = RecordFailure {
                        index: offset + position,
                        membership_number: membership_number_hint(raw),
                        reason: err.to_string(),
                    };
                    log_record_failure(&failure, &err);
                    failures.push(failure);
                }
            }
        }

        tx.commit()
            .await
            .map_err(|source| ChunkError::Commit { chunk, source })?;
        stats.committed_chunks = 1;
        Ok(ChunkOutcome { stats, failures })
    }

    async fn record_progress<S: RosterStore>(
        &self,
        store: &S,
        progress: &mut JobProgress,
        stats: &BatchStats,
    ) {
        progress.processed = stats.processed;
        progress.created = stats.created;
        progress.updated = stats.updated;
        progress.errored = stats.errored;
        progress.failed_chunks = stats.failed_chunks;
        progress.updated_at = Utc::now();
        if let Err(err) = store.save_job_progress(progress).await {
            warn!(job_id = %progress.job_id, error = %err, "failed to save job progress");
        }
    }
}

fn membership_number_hint(raw: &JsonValue) -> Option<String> {
    RawRecord::from_value(raw)
        .ok()?
        .first_text(MEMBERSHIP_NUMBER_KEYS)
}

fn log_record_failure(failure: &RecordFailure, err: &UpsertError) {
    match err {
        UpsertError::Record(_) => warn!(
            index = failure.index,
            membership_number = failure.membership_number.as_deref().unwrap_or("-"),
            reason = %failure.reason,
            "skipping record"
        ),
        _ => error!(
            index = failure.index,
            membership_number = failure.membership_number.as_deref().unwrap_or("-"),
            reason = %failure.reason,
            "record write failed"
        ),
    }
}

fn log_progress(stats: &BatchStats, total: u64, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { stats.processed as f64 / secs } else { 0.0 };
    let remaining = total.saturating_sub(stats.processed);
    let eta_secs = if rate > 0.0 { (remaining as f64 / rate).round() as u64 } else { 0 };
    info!(
        processed = stats.processed,
        total,
        created = stats.created,
        updated = stats.updated,
        errored = stats.errored,
        rate_per_sec = %format!("{rate:.1}"),
        eta_secs,
        "batch progress"
    );
}
