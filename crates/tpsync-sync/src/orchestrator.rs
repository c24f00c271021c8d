//! Sync Orchestrator: runs the registry's jobs one after another and
//! aggregates a run summary. A job failure never stops the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tpsync_adapters::{rows_from_payload, transform_for, JobInputs, NameAliases, TransformError};
use tpsync_core::{
    FailureKind, RunMode, RunStatus, SyncJobDescriptor, SyncRunResult, SyncRunSummary,
    WriteStrategy,
};
use tpsync_storage::{DestinationError, SourceError, SourceFetcher};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::registry::JobRegistry;
use crate::table::{TableSynchronizer, WriteOutcome};

pub const DEFAULT_JOB_DELAY: Duration = Duration::from_secs(1);

/// Why a job failed, as recorded in its summary entry.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("lookup {name:?}: {source}")]
    Lookup {
        name: String,
        #[source]
        source: SourceError,
    },
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("unknown transform {0:?}")]
    UnknownTransform(String),
    #[error("clearing {table} failed: {source}")]
    Delete {
        table: String,
        #[source]
        source: DestinationError,
    },
    #[error("reading existing keys of {table} failed: {source}")]
    ExistingKeys {
        table: String,
        #[source]
        source: DestinationError,
    },
    #[error("{failed} of {total} insert batches into {table} failed (first: {first})")]
    PartialWrite {
        table: String,
        failed: usize,
        total: usize,
        first: String,
    },
}

fn source_kind(err: &SourceError) -> FailureKind {
    match err {
        SourceError::Authentication(err) if !err.is_rejection() => FailureKind::SourceUnavailable,
        SourceError::Authentication(_) | SourceError::SessionRejected { .. } => {
            FailureKind::Authentication
        }
        SourceError::Unavailable(_) => FailureKind::SourceUnavailable,
        SourceError::Malformed { .. } => FailureKind::MalformedSourceData,
    }
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Source(err) | JobError::Lookup { source: err, .. } => source_kind(err),
            JobError::Transform(err) => err.kind(),
            JobError::UnknownTransform(_) => FailureKind::Transform,
            JobError::Delete { .. } | JobError::ExistingKeys { .. } | JobError::PartialWrite { .. } => {
                FailureKind::DestinationWrite
            }
        }
    }
}

/// Errors that prevent a run from starting at all.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("unknown job {0:?}")]
    UnknownJob(String),
    #[error("job {0:?} is disabled")]
    JobDisabled(String),
}

/// What a job got done before (or without) failing.
#[derive(Debug, Default)]
struct JobProgress {
    dropped: usize,
    write: WriteOutcome,
}

pub struct SyncOrchestrator {
    registry: JobRegistry,
    fetcher: Arc<SourceFetcher>,
    synchronizer: TableSynchronizer,
    aliases: NameAliases,
    job_delay: Duration,
    run_lock: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        registry: JobRegistry,
        fetcher: Arc<SourceFetcher>,
        synchronizer: TableSynchronizer,
        aliases: NameAliases,
    ) -> Self {
        Self {
            registry,
            fetcher,
            synchronizer,
            aliases,
            job_delay: DEFAULT_JOB_DELAY,
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_job_delay(mut self, job_delay: Duration) -> Self {
        self.job_delay = job_delay;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Run the jobs `mode` selects. Concurrent calls queue behind the run in
    /// progress.
    pub async fn run(&self, mode: RunMode) -> Result<SyncRunSummary, RunError> {
        if let RunMode::Job(name) = &mode {
            match self.registry.get(name) {
                None => return Err(RunError::UnknownJob(name.clone())),
                Some(job) if !job.enabled => return Err(RunError::JobDisabled(name.clone())),
                Some(_) => {}
            }
        }

        let run_id = Uuid::new_v4();
        info!(%run_id, %mode, status = RunStatus::Pending.as_str(), "sync run queued");
        let _guard = self.run_lock.lock().await;

        let started_at = Utc::now();
        let jobs = self.registry.select(&mode);
        let mut results = Vec::with_capacity(jobs.len());
        for (idx, job) in jobs.iter().enumerate() {
            if idx > 0 && !self.job_delay.is_zero() {
                tokio::time::sleep(self.job_delay).await;
            }
            let span = info_span!("sync_job", %run_id, job = %job.name, table = %job.table);
            results.push(self.execute_job(job).instrument(span).await);
        }

        let summary = SyncRunSummary {
            run_id,
            mode,
            status: RunStatus::from_results(&results),
            started_at,
            finished_at: Utc::now(),
            jobs: results,
        };
        log_summary(&summary);
        Ok(summary)
    }

    pub async fn run_job(&self, name: &str) -> Result<SyncRunSummary, RunError> {
        self.run(RunMode::Job(name.to_string())).await
    }

    /// Resolves once no run is in progress.
    pub async fn wait_idle(&self) {
        drop(self.run_lock.lock().await);
    }

    async fn execute_job(&self, job: &SyncJobDescriptor) -> SyncRunResult {
        let started = Instant::now();
        info!(status = RunStatus::Running.as_str(), source = %job.source, "job started");

        let mut progress = JobProgress::default();
        let outcome = self.try_job(job, &mut progress).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut result = SyncRunResult {
            job_name: job.name.clone(),
            table: job.table.clone(),
            success: true,
            record_count: progress.write.inserted,
            dropped_rows: progress.dropped,
            skipped_existing: progress.write.skipped_existing,
            failed_batches: progress.write.failed_batches.clone(),
            failure_kind: None,
            error: None,
            duration_ms,
        };
        match outcome {
            Ok(()) => info!(
                records = result.record_count,
                dropped = result.dropped_rows,
                skipped_existing = result.skipped_existing,
                duration_ms,
                "job completed"
            ),
            Err(err) => {
                let kind = err.kind();
                error!(kind = kind.as_str(), error = %err, "job failed");
                result.success = false;
                result.failure_kind = Some(kind);
                result.error = Some(err.to_string());
            }
        }
        result
    }

    async fn try_job(&self, job: &SyncJobDescriptor, progress: &mut JobProgress) -> Result<(), JobError> {
        let transform = transform_for(&job.transform)
            .ok_or_else(|| JobError::UnknownTransform(job.transform.clone()))?;

        let payload = self.fetcher.fetch(&job.source).await?;
        let mut inputs = JobInputs::new(rows_from_payload(&payload)?);
        for (name, spec) in &job.lookups {
            let payload = self.fetcher.fetch(spec).await.map_err(|source| JobError::Lookup {
                name: name.clone(),
                source,
            })?;
            inputs = inputs.with_lookup(name.clone(), rows_from_payload(&payload)?);
        }

        let output = transform.transform(&inputs, &self.aliases)?;
        progress.dropped = output.dropped;
        if output.dropped > 0 {
            info!(dropped = output.dropped, "dropped rows missing required keys");
        }

        progress.write = match &job.strategy {
            WriteStrategy::FullReplace => self
                .synchronizer
                .full_replace(&job.table, &job.delete_filter_column, &output.records)
                .await
                .map_err(|source| JobError::Delete {
                    table: job.table.clone(),
                    source,
                })?,
            WriteStrategy::Differential { key_columns } => self
                .synchronizer
                .differential_insert(&job.table, key_columns, &output.records)
                .await
                .map_err(|source| JobError::ExistingKeys {
                    table: job.table.clone(),
                    source,
                })?,
        };

        match progress.write.failed_batches.first() {
            None => Ok(()),
            Some(first) => Err(JobError::PartialWrite {
                table: job.table.clone(),
                failed: progress.write.failed_batches.len(),
                total: progress.write.batches,
                first: first.error.clone(),
            }),
        }
    }
}

fn log_summary(summary: &SyncRunSummary) {
    for job in &summary.jobs {
        info!(
            run_id = %summary.run_id,
            job = %job.job_name,
            success = job.success,
            records = job.record_count,
            error = job.error.as_deref().unwrap_or("-"),
            "job result"
        );
    }
    info!(
        run_id = %summary.run_id,
        mode = %summary.mode,
        status = summary.status.as_str(),
        total_records = summary.total_records(),
        duration_ms = summary.duration_ms(),
        "sync run finished"
    );
}
