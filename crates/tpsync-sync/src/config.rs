use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;
use tpsync_storage::DEFAULT_TOKEN_VALIDITY_DAYS;

use crate::table::MAX_BATCH_SIZE;

pub const DEFAULT_LIGHT_CRON: &str = "0 */15 * * * *";
pub const DEFAULT_FULL_CRON: &str = "0 0 1 * * Sun";
pub const DEFAULT_TIMEZONE: &str = "Asia/Jakarta";
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Problems that stop the process before any job runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("job registry {path}: {reason}")]
    Registry { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationConfig {
    /// Supabase REST API.
    Postgrest { url: String, service_key: String },
    /// Direct connection through sqlx.
    Postgres { database_url: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub metabase_url: String,
    pub metabase_username: String,
    pub metabase_password: String,
    pub env_file: PathBuf,
    pub token_validity_days: i64,
    pub destination: DestinationConfig,
    pub jobs_file: PathBuf,
    pub rules_dir: PathBuf,
    pub batch_size: usize,
    pub job_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub light_cron: String,
    pub full_cron: String,
    pub timezone: Tz,
    pub drain_on_shutdown: bool,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let destination = match get("TPSYNC_DESTINATION").as_deref().unwrap_or("postgrest") {
            "postgrest" | "supabase" => DestinationConfig::Postgrest {
                url: required("SUPABASE_URL")?,
                service_key: required("SUPABASE_SERVICE_KEY")?,
            },
            "postgres" => DestinationConfig::Postgres {
                database_url: required("DATABASE_URL")?,
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: "TPSYNC_DESTINATION",
                    reason: format!("expected postgrest or postgres, got {other:?}"),
                })
            }
        };

        let timezone_name = get("TPSYNC_TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        let timezone = timezone_name
            .parse::<Tz>()
            .map_err(|e| ConfigError::Invalid {
                key: "TPSYNC_TIMEZONE",
                reason: e.to_string(),
            })?;

        Ok(Self {
            metabase_url: required("METABASE_URL")?,
            metabase_username: required("METABASE_USERNAME")?,
            metabase_password: required("METABASE_PASSWORD")?,
            env_file: get("TPSYNC_ENV_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".env")),
            token_validity_days: parse_or(
                "TPSYNC_TOKEN_VALIDITY_DAYS",
                get("TPSYNC_TOKEN_VALIDITY_DAYS"),
                DEFAULT_TOKEN_VALIDITY_DAYS,
            )?,
            destination,
            jobs_file: get("TPSYNC_JOBS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sync-jobs.yaml")),
            rules_dir: get("TPSYNC_RULES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rules")),
            batch_size: parse_or("TPSYNC_BATCH_SIZE", get("TPSYNC_BATCH_SIZE"), DEFAULT_BATCH_SIZE)?
                .clamp(1, MAX_BATCH_SIZE),
            job_delay: Duration::from_millis(parse_or(
                "TPSYNC_JOB_DELAY_MS",
                get("TPSYNC_JOB_DELAY_MS"),
                1000,
            )?),
            http_timeout_secs: parse_or(
                "TPSYNC_HTTP_TIMEOUT_SECS",
                get("TPSYNC_HTTP_TIMEOUT_SECS"),
                30,
            )?,
            user_agent: get("TPSYNC_USER_AGENT").unwrap_or_else(|| "tpsync/0.1".to_string()),
            light_cron: get("TPSYNC_LIGHT_CRON").unwrap_or_else(|| DEFAULT_LIGHT_CRON.to_string()),
            full_cron: get("TPSYNC_FULL_CRON").unwrap_or_else(|| DEFAULT_FULL_CRON.to_string()),
            timezone,
            drain_on_shutdown: get("TPSYNC_DRAIN_ON_SHUTDOWN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(true),
        })
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: format!("{value:?}: {e}"),
        }),
        None => Ok(default),
    }
}
