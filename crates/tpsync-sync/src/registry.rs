use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use tpsync_adapters::{transform_for, TRANSFORM_NAMES};
use tpsync_core::{RunMode, SourceSpec, SyncJobDescriptor, WriteStrategy};
use tpsync_storage::validate_identifier;

use crate::config::ConfigError;

/// The static job list, in execution order.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRegistry {
    pub jobs: Vec<SyncJobDescriptor>,
}

impl JobRegistry {
    pub fn new(jobs: Vec<SyncJobDescriptor>) -> Self {
        Self { jobs }
    }

    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let registry: Self = serde_yaml::from_str(text).map_err(|e| ConfigError::Registry {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        registry.validate().map_err(|reason| ConfigError::Registry {
            path: origin.to_string(),
            reason,
        })?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let origin = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Registry {
            path: origin.clone(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&text, &origin)
    }

    /// First problem found, as a message naming the job.
    pub fn validate(&self) -> Result<(), String> {
        let mut names = HashSet::new();
        let mut tables = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err("job with an empty name".to_string());
            }
            if !names.insert(job.name.as_str()) {
                return Err(format!("duplicate job name {:?}", job.name));
            }
            if !tables.insert(job.table.as_str()) {
                return Err(format!("job {:?}: table {:?} is synced by another job", job.name, job.table));
            }
            validate_identifier(&job.table)
                .and_then(|_| validate_identifier(&job.delete_filter_column))
                .map_err(|e| format!("job {:?}: {e}", job.name))?;

            let transform = transform_for(&job.transform).ok_or_else(|| {
                format!(
                    "job {:?}: unknown transform {:?} (known: {})",
                    job.name,
                    job.transform,
                    TRANSFORM_NAMES.join(", ")
                )
            })?;
            for lookup in transform.required_lookups() {
                if !job.lookups.contains_key(*lookup) {
                    return Err(format!("job {:?}: missing lookup {lookup:?}", job.name));
                }
            }

            for spec in std::iter::once(&job.source).chain(job.lookups.values()) {
                if let SourceSpec::Feed { url } = spec {
                    if !url.starts_with("http") {
                        return Err(format!("job {:?}: feed url {url:?} is not http(s)", job.name));
                    }
                }
            }

            if let WriteStrategy::Differential { key_columns } = &job.strategy {
                if key_columns.is_empty() {
                    return Err(format!("job {:?}: differential strategy without key columns", job.name));
                }
                for column in key_columns {
                    validate_identifier(column).map_err(|e| format!("job {:?}: {e}", job.name))?;
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SyncJobDescriptor> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Enabled jobs a run of `mode` executes, in registry order. A named job
    /// that is unknown or disabled selects nothing.
    pub fn select(&self, mode: &RunMode) -> Vec<&SyncJobDescriptor> {
        self.jobs
            .iter()
            .filter(|j| j.enabled)
            .filter(|j| match mode {
                RunMode::Full => true,
                RunMode::Lightweight => !j.heavy,
                RunMode::Job(name) => &j.name == name,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
jobs:
  - name: class_schedule
    table: class_schedule
    transform: class_schedule
    source: { kind: bi_question, question_id: 101 }
  - name: understanding
    table: student_understanding
    transform: student_understanding
    source: { kind: bi_question, question_id: 103 }
    lookups:
      answer_keys: { kind: bi_question, question_id: 104 }
      roster: { kind: bi_question, question_id: 105 }
  - name: teacher_photos
    table: teacher_photos
    transform: teacher_photos
    source: { kind: bi_question, question_id: 106, format: json }
    strategy: { kind: differential, key_columns: [teacher_name] }
    heavy: true
  - name: archived
    table: archived_materials
    transform: learning_materials
    source: { kind: feed, url: "https://feeds.example.test/old.json" }
    enabled: false
"#;

    fn names(jobs: Vec<&SyncJobDescriptor>) -> Vec<&str> {
        jobs.into_iter().map(|j| j.name.as_str()).collect()
    }

    #[test]
    fn modes_select_enabled_jobs_in_order() {
        let registry = JobRegistry::from_yaml_str(REGISTRY, "test").unwrap();
        assert_eq!(
            names(registry.select(&RunMode::Full)),
            vec!["class_schedule", "understanding", "teacher_photos"]
        );
        assert_eq!(
            names(registry.select(&RunMode::Lightweight)),
            vec!["class_schedule", "understanding"]
        );
        assert_eq!(
            names(registry.select(&RunMode::Job("teacher_photos".into()))),
            vec!["teacher_photos"]
        );
        assert!(registry.select(&RunMode::Job("archived".into())).is_empty());
        assert_eq!(registry.get("understanding").unwrap().delete_filter_column, "id");
    }

    #[test]
    fn missing_required_lookup_is_rejected() {
        let text = r#"
jobs:
  - name: piket
    table: piket_roster
    transform: piket_roster
    source: { kind: bi_question, question_id: 102 }
"#;
        let err = JobRegistry::from_yaml_str(text, "sync-jobs.yaml").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("sync-jobs.yaml"), "{message}");
        assert!(message.contains("missing lookup \"classes\""), "{message}");
    }

    #[test]
    fn invalid_jobs_are_rejected() {
        let cases = [
            (
                "jobs:\n  - { name: a, table: t, transform: nope, source: { kind: bi_question, question_id: 1 } }\n",
                "unknown transform",
            ),
            (
                "jobs:\n  - { name: a, table: \"t; drop\", transform: class_schedule, source: { kind: bi_question, question_id: 1 } }\n",
                "invalid identifier",
            ),
            (
                "jobs:\n  - { name: a, table: t, transform: class_schedule, source: { kind: bi_question, question_id: 1 } }\n  - { name: a, table: u, transform: class_schedule, source: { kind: bi_question, question_id: 2 } }\n",
                "duplicate job name",
            ),
            (
                "jobs:\n  - { name: a, table: t, transform: learning_materials, source: { kind: feed, url: \"ftp://x\" } }\n",
                "not http",
            ),
            (
                "jobs:\n  - { name: a, table: t, transform: teacher_photos, source: { kind: bi_question, question_id: 1 }, strategy: { kind: differential, key_columns: [] } }\n",
                "without key columns",
            ),
        ];
        for (text, expected) in cases {
            let err = JobRegistry::from_yaml_str(text, "test").unwrap_err();
            assert!(err.to_string().contains(expected), "{err} should mention {expected}");
        }
    }

    #[test]
    fn shipped_registry_is_valid() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let registry = JobRegistry::load(&root.join("sync-jobs.yaml")).unwrap();
        assert_eq!(registry.jobs.len(), 5);
        assert_eq!(
            names(registry.select(&RunMode::Lightweight)),
            vec!["class_schedule", "piket_roster", "student_understanding", "learning_materials"]
        );
    }
}
