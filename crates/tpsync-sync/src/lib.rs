//! Sync pipeline orchestration: configuration, the job registry, table
//! writes, the run loop and its schedule.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tpsync_adapters::NameAliases;
use tpsync_core::{RunMode, SyncRunSummary};
use tpsync_storage::{
    BiCredentials, CredentialManager, Destination, EnvFileStore, HttpClientConfig, HttpFeedClient,
    HttpFetcher, MetabaseClient, PgDestination, PostgrestDestination, SourceFetcher,
};
use tracing::info;

pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod table;

pub use config::{ConfigError, DestinationConfig, SyncConfig};
pub use orchestrator::{JobError, RunError, SyncOrchestrator};
pub use registry::JobRegistry;
pub use scheduler::{ScheduleConfig, SchedulerHandle, SyncScheduler};
pub use table::{TableSynchronizer, WriteOutcome};

pub const CRATE_NAME: &str = "tpsync-sync";

impl SyncConfig {
    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            light_cron: self.light_cron.clone(),
            full_cron: self.full_cron.clone(),
            timezone: self.timezone,
        }
    }
}

/// Wire the production collaborators described by `config`.
pub async fn build_orchestrator(config: &SyncConfig) -> Result<SyncOrchestrator> {
    let registry = JobRegistry::load(&config.jobs_file)?;
    let aliases = NameAliases::from_rules_dir(&config.rules_dir)?;

    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?);

    let bi = Arc::new(MetabaseClient::new(config.metabase_url.clone(), http.clone()));
    let store = Arc::new(EnvFileStore::new(&config.env_file).with_env_reload(true));
    let credentials = Arc::new(
        CredentialManager::new(
            bi.clone(),
            BiCredentials {
                username: config.metabase_username.clone(),
                password: config.metabase_password.clone(),
            },
            store,
        )
        .with_validity(chrono::Duration::days(config.token_validity_days)),
    );
    let fetcher = SourceFetcher::new(bi, Arc::new(HttpFeedClient::new(http.clone())), credentials);

    let destination: Arc<dyn Destination> = match &config.destination {
        DestinationConfig::Postgrest { url, service_key } => {
            Arc::new(PostgrestDestination::new(url, service_key.clone(), http))
        }
        DestinationConfig::Postgres { database_url } => Arc::new(
            PgDestination::connect(database_url)
                .await
                .context("connecting to destination database")?,
        ),
    };

    info!(
        jobs = registry.jobs.len(),
        aliases = aliases.len(),
        batch_size = config.batch_size,
        "sync pipeline ready"
    );
    Ok(SyncOrchestrator::new(
        registry,
        Arc::new(fetcher),
        TableSynchronizer::new(destination, config.batch_size),
        aliases,
    )
    .with_job_delay(config.job_delay))
}

pub async fn run_sync_once(config: &SyncConfig, mode: RunMode) -> Result<SyncRunSummary> {
    let orchestrator = build_orchestrator(config).await?;
    let summary = orchestrator.run(mode).await?;
    Ok(summary)
}

pub async fn run_sync_once_from_env(mode: RunMode) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    run_sync_once(&config, mode).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tpsync_core::{FailureKind, RunStatus};

    #[tokio::test]
    async fn one_shot_run_wires_config_into_a_summary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let jobs_file = dir.path().join("sync-jobs.yaml");
        std::fs::write(
            &jobs_file,
            "jobs:\n  - name: learning_materials\n    table: learning_materials\n    \
             transform: learning_materials\n    \
             source: { kind: feed, url: \"http://127.0.0.1:9/materials.json\" }\n",
        )
        .expect("write jobs");
        let rules_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules");
        let env_file = dir.path().join(".env");

        let values = [
            ("METABASE_URL", "http://127.0.0.1:9".to_string()),
            ("METABASE_USERNAME", "sync@example.test".to_string()),
            ("METABASE_PASSWORD", "secret".to_string()),
            ("SUPABASE_URL", "http://127.0.0.1:9".to_string()),
            ("SUPABASE_SERVICE_KEY", "service-key".to_string()),
            ("TPSYNC_JOBS_FILE", jobs_file.display().to_string()),
            ("TPSYNC_RULES_DIR", rules_dir.display().to_string()),
            ("TPSYNC_ENV_FILE", env_file.display().to_string()),
            ("TPSYNC_HTTP_TIMEOUT_SECS", "2".to_string()),
            ("TPSYNC_JOB_DELAY_MS", "0".to_string()),
        ];
        let config = SyncConfig::from_lookup(|key: &str| {
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap();

        let summary = run_sync_once(&config, RunMode::Full).await.unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.jobs.len(), 1);
        assert_eq!(summary.jobs[0].job_name, "learning_materials");
        assert_eq!(summary.jobs[0].failure_kind, Some(FailureKind::SourceUnavailable));
    }
}
