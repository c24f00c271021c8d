//! Piket (duty) roster enriched with each teacher's first class date.

use std::collections::HashMap;

use chrono::NaiveDate;
use tpsync_core::{ColumnCandidates, RawRow, TargetRecord};

use crate::simple::{CLASS_DATE, TEACHER_NAME};
use crate::{date_key, parse_date, JobInputs, NameAliases, TableTransform, TransformError, TransformOutput};

pub const CLASSES_LOOKUP: &str = "classes";

const DUTY_DATE: ColumnCandidates = ColumnCandidates::new(
    "duty_date",
    &["duty_date", "Duty Date", "piket_date", "date", "Tanggal"],
);
const DUTY_POST: ColumnCandidates =
    ColumnCandidates::new("duty_post", &["duty_post", "Duty Post", "post", "location", "Pos"]);
const SHIFT: ColumnCandidates = ColumnCandidates::new("shift", &["shift", "Shift", "session", "Sesi"]);
const FIRST_CLASS_DATE: &str = "first_class_date";

/// Earliest known class date per calibrated teacher name.
#[derive(Debug, Clone, Default)]
pub struct FirstClassDateMap {
    dates: HashMap<String, NaiveDate>,
}

impl FirstClassDateMap {
    /// Rows without a teacher or a parseable date are skipped.
    pub fn build(class_rows: &[RawRow], aliases: &NameAliases) -> Self {
        let mut dates: HashMap<String, NaiveDate> = HashMap::new();
        for row in class_rows {
            let Some(teacher) = TEACHER_NAME.resolve_non_empty(row) else {
                continue;
            };
            let Some(date) = CLASS_DATE.resolve(row).and_then(parse_date) else {
                continue;
            };
            dates
                .entry(aliases.calibrate(teacher))
                .and_modify(|earliest| *earliest = (*earliest).min(date))
                .or_insert(date);
        }
        Self { dates }
    }

    pub fn get(&self, teacher: &str) -> Option<NaiveDate> {
        self.dates.get(teacher).copied()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

pub struct PiketRosterTransform;

impl TableTransform for PiketRosterTransform {
    fn name(&self) -> &'static str {
        "piket_roster"
    }

    fn required_lookups(&self) -> &'static [&'static str] {
        &[CLASSES_LOOKUP]
    }

    fn transform(
        &self,
        inputs: &JobInputs,
        aliases: &NameAliases,
    ) -> Result<TransformOutput, TransformError> {
        let first_dates = FirstClassDateMap::build(inputs.lookup(CLASSES_LOOKUP)?, aliases);

        let mut output = TransformOutput::default();
        for row in &inputs.primary {
            let (Some(teacher), Some(duty_date)) =
                (TEACHER_NAME.resolve_non_empty(row), DUTY_DATE.resolve_non_empty(row))
            else {
                output.dropped += 1;
                continue;
            };
            let teacher = aliases.calibrate(teacher);
            let first_class = first_dates
                .get(&teacher)
                .map(|d| d.format("%Y-%m-%d").to_string());

            let mut record = TargetRecord::new();
            record
                .set_text(TEACHER_NAME.field, teacher)
                .set_text(DUTY_DATE.field, date_key(duty_date))
                .set_optional_text(DUTY_POST.field, DUTY_POST.resolve(row))
                .set_optional_text(SHIFT.field, SHIFT.resolve(row))
                .set_optional_text(FIRST_CLASS_DATE, first_class.as_deref());
            output.records.push(record);
        }
        Ok(output)
    }
}
