//! One sync run: fetch, validate, normalize, resolve the target event, batch
//! upsert, then record the outcome on the job and the event.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use roster_adapters::{
    clean_response, normalize_envelope, CorruptionError, EnvelopeError, EnvelopeShape,
};
use roster_core::{EventType, JobProgress, JobStatus, SyncStage, SyncStatus};
use roster_storage::{FetchError, HttpFetcher, PayloadArchive, RosterStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::{BatchOrchestrator, BatchReport};
use crate::config::{DatasetConfig, SyncConfig};
use crate::target::resolve_target;
use crate::upsert::UpsertContext;

/// Run-fatal failures. Each one ends the run before any roster row is written.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("payload rejected: {0}")]
    Corruption(#[from] CorruptionError),
    #[error("unexpected export shape: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("could not resolve target event: {0}")]
    Target(#[source] StoreError),
}

impl SyncError {
    pub fn stage(&self) -> SyncStage {
        match self {
            SyncError::Fetch(_) => SyncStage::Fetch,
            SyncError::Corruption(_) => SyncStage::Validate,
            SyncError::Envelope(_) => SyncStage::Normalize,
            SyncError::Target(_) => SyncStage::ResolveTarget,
        }
    }
}

/// One requested sync of one export.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub job_id: String,
    pub dataset_id: Option<String>,
    pub url: String,
    pub event_type: EventType,
    pub data_source: String,
}

impl SyncRequest {
    pub fn for_dataset(
        dataset: &DatasetConfig,
        url: String,
        job_id: String,
        config: &SyncConfig,
    ) -> Self {
        Self {
            job_id,
            dataset_id: Some(dataset.dataset_id.clone()),
            url,
            event_type: dataset.event_type.unwrap_or(config.default_event_type),
            data_source: dataset
                .source_tag
                .clone()
                .unwrap_or_else(|| config.source_tag.clone()),
        }
    }

    pub fn for_url(url: String, job_id: String, config: &SyncConfig) -> Self {
        Self {
            job_id,
            dataset_id: None,
            url,
            event_type: config.default_event_type,
            data_source: config.source_tag.clone(),
        }
    }
}

pub fn new_job_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("sync-{}-{}", now.format("%Y%m%dT%H%M%S"), &suffix[..8])
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub job_id: String,
    pub import_batch_id: Uuid,
    pub status: JobStatus,
    pub event_id: Uuid,
    pub event_code: String,
    pub event_created: bool,
    pub envelope: String,
    pub stripped_chars: usize,
    pub archived_payload: Option<PathBuf>,
    pub report: BatchReport,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct SyncPipeline<S> {
    config: SyncConfig,
    store: S,
    http: HttpFetcher,
    archive: Option<PayloadArchive>,
    batch: BatchOrchestrator,
}

impl<S: RosterStore> SyncPipeline<S> {
    pub fn new(config: SyncConfig, store: S) -> Result<Self, SyncError> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let archive = config.archive_dir.clone().map(PayloadArchive::new);
        let batch = BatchOrchestrator::new(config.batch);
        Ok(Self {
            config,
            store,
            http,
            archive,
            batch,
        })
    }

    /// Fetch the export over HTTP and sync it.
    pub async fn run(&self, request: &SyncRequest) -> Result<SyncRunSummary, SyncError> {
        let span = info_span!(
            "sync_run",
            job_id = %request.job_id,
            dataset = request.dataset_id.as_deref().unwrap_or("-"),
            event_type = %request.event_type,
        );
        async {
            let mut progress = self.start_job(request).await;
            let payload = match self.http.fetch_text(&request.url).await {
                Ok(payload) => payload,
                Err(err) => return Err(self.fail(&mut progress, err.into(), None).await),
            };
            if payload.had_decode_errors {
                warn!(encoding = payload.encoding, "response contained undecodable bytes");
            }
            self.process(request, &payload.text, progress).await
        }
        .instrument(span)
        .await
    }

    /// Sync an export body that was obtained some other way (a saved file, a test fixture).
    pub async fn run_with_text(
        &self,
        request: &SyncRequest,
        raw: &str,
    ) -> Result<SyncRunSummary, SyncError> {
        let span = info_span!(
            "sync_run",
            job_id = %request.job_id,
            dataset = request.dataset_id.as_deref().unwrap_or("-"),
            event_type = %request.event_type,
        );
        async {
            let progress = self.start_job(request).await;
            self.process(request, raw, progress).await
        }
        .instrument(span)
        .await
    }

    async fn start_job(&self, request: &SyncRequest) -> JobProgress {
        let progress = JobProgress::started(request.job_id.clone(), Utc::now());
        self.save_progress(&progress).await;
        info!("sync started");
        progress
    }

    async fn process(
        &self,
        request: &SyncRequest,
        raw: &str,
        mut progress: JobProgress,
    ) -> Result<SyncRunSummary, SyncError> {
        let archived_payload = self.archive_payload(request, raw).await;

        self.advance(&mut progress, SyncStage::Validate).await;
        let cleaned = match clean_response(raw, &self.config.guard) {
            Ok(cleaned) => cleaned,
            Err(err) => {
                return Err(self
                    .fail(&mut progress, err.into(), archived_payload.as_ref())
                    .await)
            }
        };
        if cleaned.was_modified() {
            warn!(
                stripped = cleaned.stripped_chars,
                preamble = cleaned.preamble_chars,
                ratio = cleaned.sample_ratio,
                "payload repaired before parsing"
            );
        }

        self.advance(&mut progress, SyncStage::Normalize).await;
        let envelope = match normalize_envelope(&cleaned.text) {
            Ok(envelope) => envelope,
            Err(err) => {
                return Err(self
                    .fail(&mut progress, err.into(), archived_payload.as_ref())
                    .await)
            }
        };
        let envelope_label = match &envelope.shape {
            EnvelopeShape::BareArray => "array".to_string(),
            EnvelopeShape::Wrapped(key) => format!("object.{key}"),
        };
        info!(records = envelope.records.len(), envelope = %envelope_label, "export normalized");

        self.advance(&mut progress, SyncStage::ResolveTarget).await;
        let target = match resolve_target(
            &self.store,
            request.event_type,
            request.dataset_id.as_deref(),
            Utc::now(),
        )
        .await
        {
            Ok(target) => target,
            Err(err) => {
                return Err(self
                    .fail(&mut progress, SyncError::Target(err), archived_payload.as_ref())
                    .await)
            }
        };
        let event = target.event;
        progress.event_id = Some(event.id);
        if let Err(err) = self
            .store
            .set_event_sync_status(event.id, SyncStatus::InProgress, None)
            .await
        {
            warn!(event_id = %event.id, error = %err, "could not mark event in progress");
        }

        let ctx = UpsertContext {
            event_id: event.id,
            import_batch_id: Uuid::new_v4(),
            data_source: request.data_source.clone(),
            link_members: self.config.link_members,
        };
        let report = self
            .batch
            .run(&self.store, &ctx, &envelope.records, &mut progress)
            .await;

        let status = report.status();
        let finished_at = Utc::now();
        progress.stage = SyncStage::Report;
        progress.status = status;
        progress.finished_at = Some(finished_at);
        progress.updated_at = finished_at;
        progress.message = Some(report_message(&report));
        self.save_progress(&progress).await;

        if let Err(err) = self
            .store
            .set_event_sync_status(event.id, status.into(), Some(finished_at))
            .await
        {
            warn!(event_id = %event.id, error = %err, "could not record event sync status");
        }

        match status {
            JobStatus::Success => info!(
                processed = report.stats.processed,
                created = report.stats.created,
                updated = report.stats.updated,
                errored = report.stats.errored,
                "sync finished"
            ),
            _ => error!(
                status = %status,
                processed = report.stats.processed,
                errored = report.stats.errored,
                failed_chunks = report.stats.failed_chunks,
                skipped = report.skipped,
                "sync finished with failures"
            ),
        }

        Ok(SyncRunSummary {
            job_id: request.job_id.clone(),
            import_batch_id: ctx.import_batch_id,
            status,
            event_id: event.id,
            event_code: event.code,
            event_created: target.created,
            envelope: envelope_label,
            stripped_chars: cleaned.stripped_chars,
            archived_payload,
            report,
            started_at: progress.started_at,
            finished_at,
        })
    }

    async fn archive_payload(&self, request: &SyncRequest, raw: &str) -> Option<PathBuf> {
        let archive = self.archive.as_ref()?;
        let dataset = request.dataset_id.as_deref().unwrap_or("adhoc");
        match archive.store_payload(Utc::now(), dataset, raw).await {
            Ok(stored) => {
                info!(
                    path = %stored.absolute_path.display(),
                    bytes = stored.byte_size,
                    deduplicated = stored.deduplicated,
                    "payload archived"
                );
                Some(stored.absolute_path)
            }
            Err(err) => {
                warn!(error = %err, "payload archive failed; continuing");
                None
            }
        }
    }

    async fn advance(&self, progress: &mut JobProgress, stage: SyncStage) {
        progress.stage = stage;
        progress.updated_at = Utc::now();
        self.save_progress(progress).await;
    }

    async fn fail(
        &self,
        progress: &mut JobProgress,
        err: SyncError,
        archived_payload: Option<&PathBuf>,
    ) -> SyncError {
        let now = Utc::now();
        let mut message = err.to_string();
        if let Some(path) = archived_payload {
            message.push_str(&format!(" (payload archived at {})", path.display()));
        }
        error!(stage = %err.stage(), error = %message, "sync failed");
        progress.stage = err.stage();
        progress.status = JobStatus::Failed;
        progress.message = Some(message);
        progress.updated_at = now;
        progress.finished_at = Some(now);
        self.save_progress(progress).await;
        err
    }

    async fn save_progress(&self, progress: &JobProgress) {
        if let Err(err) = self.store.save_job_progress(progress).await {
            warn!(job_id = %progress.job_id, error = %err, "failed to save job progress");
        }
    }
}

fn report_message(report: &BatchReport) -> String {
    let stats = &report.stats;
    let mut message = format!(
        "{} of {} records processed: {} created, {} updated, {} errored; {} of {} chunks failed",
        stats.processed,
        report.total_records,
        stats.created,
        stats.updated,
        stats.errored,
        stats.failed_chunks,
        report.total_chunks,
    );
    if report.aborted {
        message.push_str(&format!(
            "; stopped early after exceeding the failure budget, {} records skipped",
            report.skipped
        ));
    }
    message
}
