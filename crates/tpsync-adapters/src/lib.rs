//! Table transforms: raw source rows in, destination records out.
//!
//! Everything here is pure; fetching and writing live in `tpsync-storage`.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tpsync_core::{FailureKind, RawRow, TargetRecord};
use tpsync_storage::SourcePayload;

pub mod aliases;
pub mod csv;
pub mod roster;
pub mod simple;
pub mod understanding;

pub use aliases::NameAliases;
pub use csv::parse_csv;
pub use understanding::{UnderstandingIndex, ABSENT, NO_ATTEMPT};

pub const CRATE_NAME: &str = "tpsync-adapters";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("malformed CSV at line {line}: {reason}")]
    Csv { line: usize, reason: String },
    #[error("row {index} is not a JSON object")]
    NotAnObject { index: usize },
    #[error("lookup dataset {0:?} was not provided")]
    MissingLookup(String),
}

impl TransformError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransformError::Csv { .. } | TransformError::NotAnObject { .. } => {
                FailureKind::MalformedSourceData
            }
            TransformError::MissingLookup(_) => FailureKind::Transform,
        }
    }
}

/// Decoded datasets for one job: the primary rows plus named lookups.
#[derive(Debug, Clone, Default)]
pub struct JobInputs {
    pub primary: Vec<RawRow>,
    pub lookups: BTreeMap<String, Vec<RawRow>>,
}

impl JobInputs {
    pub fn new(primary: Vec<RawRow>) -> Self {
        Self {
            primary,
            lookups: BTreeMap::new(),
        }
    }

    pub fn with_lookup(mut self, name: impl Into<String>, rows: Vec<RawRow>) -> Self {
        self.lookups.insert(name.into(), rows);
        self
    }

    pub fn lookup(&self, name: &str) -> Result<&[RawRow], TransformError> {
        self.lookups
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| TransformError::MissingLookup(name.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    pub records: Vec<TargetRecord>,
    /// Primary rows dropped for a missing identifying key.
    pub dropped: usize,
}

pub trait TableTransform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lookup datasets the job must declare.
    fn required_lookups(&self) -> &'static [&'static str] {
        &[]
    }

    fn transform(
        &self,
        inputs: &JobInputs,
        aliases: &NameAliases,
    ) -> Result<TransformOutput, TransformError>;
}

pub const TRANSFORM_NAMES: &[&str] = &[
    "class_schedule",
    "piket_roster",
    "student_understanding",
    "learning_materials",
    "teacher_photos",
];

pub fn transform_for(name: &str) -> Option<Box<dyn TableTransform>> {
    match name {
        "class_schedule" => Some(Box::new(simple::ClassScheduleTransform)),
        "piket_roster" => Some(Box::new(roster::PiketRosterTransform)),
        "student_understanding" => Some(Box::new(understanding::StudentUnderstandingTransform)),
        "learning_materials" => Some(Box::new(simple::LearningMaterialsTransform)),
        "teacher_photos" => Some(Box::new(simple::TeacherPhotosTransform)),
        _ => None,
    }
}

/// Decode a fetched payload into rows.
pub fn rows_from_payload(payload: &SourcePayload) -> Result<Vec<RawRow>, TransformError> {
    match payload {
        SourcePayload::Csv(text) => parse_csv(text),
        SourcePayload::Json(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| json_row(index, item))
            .collect(),
    }
}

fn json_row(index: usize, item: &JsonValue) -> Result<RawRow, TransformError> {
    let JsonValue::Object(map) = item else {
        return Err(TransformError::NotAnObject { index });
    };
    Ok(map
        .iter()
        .map(|(key, value)| {
            let text = match value {
                JsonValue::String(s) => s.clone(),
                JsonValue::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect())
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%B %d, %Y", "%b %d, %Y", "%d/%m/%Y", "%d-%m-%Y"];
const DATETIME_FORMATS: &[&str] = &["%B %d, %Y, %I:%M %p", "%b %d, %Y, %I:%M %p"];

/// Parse the date shapes the BI exports use (ISO dates and timestamps,
/// `July 1, 2024`, `01/07/2024`).
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Some(date) = raw
        .get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
    {
        return Some(date);
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
}

/// ISO `YYYY-MM-DD` when the value parses as a date, otherwise the trimmed
/// original, so join keys built from either dataset agree.
pub fn date_key(raw: &str) -> String {
    parse_date(raw)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| raw.trim().to_string())
}
