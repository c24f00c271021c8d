use std::sync::Arc;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use tokio_cron_scheduler::{Job, JobScheduler};
use tpsync_core::RunMode;
use tracing::{error, info, warn};

use crate::orchestrator::SyncOrchestrator;

/// Cron expressions for the two recurring run variants.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub light_cron: String,
    pub full_cron: String,
    pub timezone: Tz,
}

pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    schedule: ScheduleConfig,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, schedule: ScheduleConfig) -> Self {
        Self {
            orchestrator,
            schedule,
        }
    }

    /// Cron jobs for the lightweight and full variants, evaluated in the
    /// configured timezone.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        [
            (&self.schedule.light_cron, RunMode::Lightweight),
            (&self.schedule.full_cron, RunMode::Full),
        ]
        .into_iter()
        .map(|(cron, mode)| self.cron_job(cron, mode))
        .collect()
    }

    fn cron_job(&self, cron: &str, mode: RunMode) -> Result<Job> {
        let orchestrator = self.orchestrator.clone();
        Job::new_async_tz(cron, self.schedule.timezone, move |_uuid, _scheduler| {
            let orchestrator = orchestrator.clone();
            let mode = mode.clone();
            Box::pin(async move {
                info!(%mode, "scheduled sync triggered");
                match orchestrator.run(mode).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        status = summary.status.as_str(),
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(%err, "scheduled sync could not start"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))
    }

    pub async fn start(self) -> Result<SchedulerHandle> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        for job in self.jobs()? {
            scheduler.add(job).await.context("adding scheduler job")?;
        }
        scheduler.start().await.context("starting scheduler")?;
        info!(
            light = %self.schedule.light_cron,
            full = %self.schedule.full_cron,
            timezone = %self.schedule.timezone,
            "scheduler started"
        );
        Ok(SchedulerHandle {
            scheduler,
            orchestrator: self.orchestrator,
        })
    }
}

/// Running scheduler. Dropping it leaves the cron jobs running; call
/// [`SchedulerHandle::shutdown`] to stop them.
pub struct SchedulerHandle {
    scheduler: JobScheduler,
    orchestrator: Arc<SyncOrchestrator>,
}

impl SchedulerHandle {
    /// Stop triggering new runs. With `drain`, also wait for a run already in
    /// progress to finish.
    pub async fn shutdown(mut self, drain: bool) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("stopping scheduler")?;
        if drain {
            info!("waiting for in-flight sync run to finish");
            self.orchestrator.wait_idle().await;
        } else {
            warn!("scheduler stopped without draining; an in-flight run may be cut short");
        }
        Ok(())
    }
}
