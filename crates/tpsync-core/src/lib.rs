//! Core data model for the teacher-portal sync pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tpsync-core";

/// Separator used when several join columns form one lookup key.
pub const KEY_DELIMITER: char = '|';

/// Join values into a single lookup key, e.g. `["S1", "R7"]` -> `"S1|R7"`.
pub fn composite_key<S: AsRef<str>>(parts: &[S]) -> String {
    let mut key = String::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            key.push(KEY_DELIMITER);
        }
        key.push_str(part.as_ref().trim());
    }
    key
}

/// Lowercase ASCII alphanumerics only; `"Session ID"`, `"session_id"` and
/// `"sessionId"` all normalize to `"sessionid"`.
pub fn normalize_column_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// One decoded source row: column name -> string value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow {
    columns: BTreeMap<String, String>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.columns.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.get(column).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Resolve the first candidate column present in this row.
    ///
    /// Candidates are tried in order against the exact column names first;
    /// only when none matches exactly is a second pass made comparing
    /// normalized names (case, spaces and underscores ignored).
    pub fn resolve(&self, candidates: &[&str]) -> Option<&str> {
        if let Some(value) = candidates.iter().find_map(|c| self.get(c)) {
            return Some(value);
        }
        candidates.iter().find_map(|candidate| {
            let wanted = normalize_column_name(candidate);
            self.columns
                .iter()
                .find(|(column, _)| normalize_column_name(column) == wanted)
                .map(|(_, value)| value.as_str())
        })
    }
}

impl<K, V> FromIterator<(K, V)> for RawRow
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            columns: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Ordered candidate source column names for one target field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnCandidates {
    pub field: &'static str,
    pub candidates: &'static [&'static str],
}

impl ColumnCandidates {
    pub const fn new(field: &'static str, candidates: &'static [&'static str]) -> Self {
        Self { field, candidates }
    }

    /// Trimmed value of the first matching column, possibly empty.
    pub fn resolve<'a>(&self, row: &'a RawRow) -> Option<&'a str> {
        row.resolve(self.candidates).map(str::trim)
    }

    /// Like [`ColumnCandidates::resolve`] but treats blank values as missing.
    pub fn resolve_non_empty<'a>(&self, row: &'a RawRow) -> Option<&'a str> {
        self.resolve(row).filter(|v| !v.is_empty())
    }
}

/// A row shaped for a destination table. Only transforms build these;
/// the synchronizer only reads them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetRecord(Map<String, Value>);

impl TargetRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, column: &str, value: Value) -> &mut Self {
        self.0.insert(column.to_string(), value);
        self
    }

    pub fn set_text(&mut self, column: &str, value: impl Into<String>) -> &mut Self {
        self.set(column, Value::String(value.into()))
    }

    /// Blank or missing values are written as SQL NULL.
    pub fn set_optional_text(&mut self, column: &str, value: Option<&str>) -> &mut Self {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => self.set_text(column, v),
            None => self.set(column, Value::Null),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.0.get(column).and_then(Value::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Composite key over `columns`; non-string values use their JSON text
    /// and nulls become empty segments.
    pub fn key_for(&self, columns: &[String]) -> String {
        let parts = columns
            .iter()
            .map(|c| match self.0.get(c) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect::<Vec<_>>();
        composite_key(&parts)
    }
}

/// Short-lived BI session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionCredential {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.token.is_empty() && now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    #[default]
    Csv,
    Json,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Csv => "csv",
            SourceFormat::Json => "json",
        }
    }
}

/// Where a job's rows come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    BiQuestion {
        question_id: u64,
        #[serde(default)]
        format: SourceFormat,
    },
    Feed {
        url: String,
    },
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::BiQuestion {
                question_id,
                format,
            } => write!(f, "question {question_id} ({})", format.as_str()),
            SourceSpec::Feed { url } => write!(f, "feed {url}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteStrategy {
    #[default]
    FullReplace,
    Differential { key_columns: Vec<String> },
}

fn default_delete_filter_column() -> String {
    "id".to_string()
}

fn default_true() -> bool {
    true
}

/// Static description of one table sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobDescriptor {
    pub name: String,
    pub table: String,
    pub transform: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub lookups: BTreeMap<String, SourceSpec>,
    #[serde(default)]
    pub strategy: WriteStrategy,
    /// Non-null column used to build the match-every-row delete predicate.
    #[serde(default = "default_delete_filter_column")]
    pub delete_filter_column: String,
    /// Expensive, slow-changing jobs are left out of lightweight runs.
    #[serde(default)]
    pub heavy: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Authentication,
    SourceUnavailable,
    MalformedSourceData,
    DestinationWrite,
    Transform,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Authentication => "AuthenticationError",
            FailureKind::SourceUnavailable => "SourceUnavailableError",
            FailureKind::MalformedSourceData => "MalformedSourceData",
            FailureKind::DestinationWrite => "DestinationWriteError",
            FailureKind::Transform => "TransformError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedBatch {
    pub batch_index: usize,
    pub rows: usize,
    pub error: String,
}

/// Outcome of one job within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunResult {
    pub job_name: String,
    pub table: String,
    pub success: bool,
    pub record_count: usize,
    #[serde(default)]
    pub dropped_rows: usize,
    #[serde(default)]
    pub skipped_existing: usize,
    #[serde(default)]
    pub failed_batches: Vec<FailedBatch>,
    pub failure_kind: Option<FailureKind>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl RunStatus {
    /// Terminal status for a finished run.
    pub fn from_results(results: &[SyncRunResult]) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        if succeeded == results.len() {
            RunStatus::Completed
        } else if succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::PartiallyCompleted
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::PartiallyCompleted => "PARTIALLY_COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Every enabled job.
    Full,
    /// Every enabled job except the heavy ones.
    Lightweight,
    /// A single named job.
    Job(String),
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Full => f.write_str("full"),
            RunMode::Lightweight => f.write_str("lightweight"),
            RunMode::Job(name) => write!(f, "job:{name}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<SyncRunResult>,
}

impl SyncRunSummary {
    pub fn total_records(&self) -> usize {
        self.jobs.iter().map(|j| j.record_count).sum()
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &SyncRunResult> {
        self.jobs.iter().filter(|j| !j.success)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Fixed-width table for terminal output.
    pub fn render_table(&self) -> String {
        let name_width = self
            .jobs
            .iter()
            .map(|j| j.job_name.len())
            .chain(std::iter::once("job".len()))
            .max()
            .unwrap_or(3);

        let mut lines = vec![
            format!(
                "sync run {} ({}) {} in {} ms",
                self.run_id,
                self.mode,
                self.status.as_str(),
                self.duration_ms()
            ),
            format!(
                "{:<name_width$}  {:<6}  {:>8}  {:>7}  error",
                "job", "status", "records", "dropped"
            ),
        ];
        for job in &self.jobs {
            lines.push(format!(
                "{:<name_width$}  {:<6}  {:>8}  {:>7}  {}",
                job.job_name,
                if job.success { "ok" } else { "FAILED" },
                job.record_count,
                job.dropped_rows,
                job.error.as_deref().unwrap_or("-")
            ));
        }
        lines.push(format!("total records: {}", self.total_records()));
        lines.join("\n")
    }
}
