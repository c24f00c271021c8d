//! Student understanding per (student, reference, session date).
//!
//! Submitted answers are matched against the answer key to get an
//! understanding type. Where a student has no matched answer, presence is
//! inferred from their other answers on the same date: any sibling record
//! means "No Attempt", none at all means "ABSENT".

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tpsync_core::{composite_key, ColumnCandidates, RawRow, TargetRecord};

use crate::simple::CLASS_NAME;
use crate::{date_key, JobInputs, NameAliases, TableTransform, TransformError, TransformOutput};

pub const ANSWER_KEYS_LOOKUP: &str = "answer_keys";
pub const ROSTER_LOOKUP: &str = "roster";

pub const NO_ATTEMPT: &str = "No Attempt";
pub const ABSENT: &str = "ABSENT";

const STUDENT_NAME: ColumnCandidates = ColumnCandidates::new(
    "student_name",
    &["student_name", "Student Name", "student", "name", "Nama Siswa"],
);
const REFERENCE_ID: ColumnCandidates = ColumnCandidates::new(
    "reference_id",
    &["reference_id", "Reference ID", "ref_id", "question_id", "Question ID"],
);
const SESSION_DATE: ColumnCandidates = ColumnCandidates::new(
    "session_date",
    &["session_date", "Session Date", "class_date", "date", "Tanggal"],
);
const SUBMITTED_OPTION: ColumnCandidates = ColumnCandidates::new(
    "submitted_option",
    &["submitted_option", "answer", "Answer", "option", "Jawaban"],
);
const KEY_OPTION: ColumnCandidates =
    ColumnCandidates::new("option", &["option", "Option", "answer", "choice", "Choice"]);
const UNDERSTANDING_TYPE: ColumnCandidates = ColumnCandidates::new(
    "understanding_type",
    &["understanding_type", "Understanding Type", "understanding", "type"],
);

fn option_key(reference_id: &str, option: &str) -> String {
    let option = option.trim().to_uppercase();
    composite_key(&[reference_id, option.as_str()])
}

#[derive(Debug, Clone)]
struct Answer {
    option: String,
    class_name: Option<String>,
}

/// Lookup maps for one run, built from the answer and answer-key datasets.
#[derive(Debug, Clone, Default)]
pub struct UnderstandingIndex {
    /// `reference|OPTION` -> understanding type.
    answer_keys: HashMap<String, String>,
    /// `student|reference|date` -> submitted answer.
    answers: HashMap<String, Answer>,
    /// `student|date` for every student with at least one answer that day.
    student_dates: HashSet<String>,
    /// date -> references asked that day.
    references_by_date: BTreeMap<String, BTreeSet<String>>,
    /// (date, student) -> class, for everyone who answered.
    answered_students: BTreeMap<(String, String), Option<String>>,
    dropped: usize,
}

impl UnderstandingIndex {
    pub fn build(answer_rows: &[RawRow], key_rows: &[RawRow], aliases: &NameAliases) -> Self {
        let mut index = Self::default();

        for row in key_rows {
            let (Some(reference), Some(option), Some(kind)) = (
                REFERENCE_ID.resolve_non_empty(row),
                KEY_OPTION.resolve_non_empty(row),
                UNDERSTANDING_TYPE.resolve_non_empty(row),
            ) else {
                continue;
            };
            index
                .answer_keys
                .insert(option_key(reference, option), kind.to_string());
        }

        for row in answer_rows {
            let (Some(student), Some(reference), Some(date)) = (
                STUDENT_NAME.resolve_non_empty(row),
                REFERENCE_ID.resolve_non_empty(row),
                SESSION_DATE.resolve_non_empty(row),
            ) else {
                index.dropped += 1;
                continue;
            };
            let student = aliases.calibrate(student);
            let date = date_key(date);
            let class_name = CLASS_NAME.resolve_non_empty(row).map(str::to_string);

            index
                .student_dates
                .insert(composite_key(&[student.as_str(), date.as_str()]));
            index
                .references_by_date
                .entry(date.clone())
                .or_default()
                .insert(reference.to_string());
            index
                .answered_students
                .entry((date.clone(), student.clone()))
                .and_modify(|c| {
                    if c.is_none() {
                        *c = class_name.clone();
                    }
                })
                .or_insert_with(|| class_name.clone());
            index.answers.insert(
                composite_key(&[student.as_str(), reference, date.as_str()]),
                Answer {
                    option: SUBMITTED_OPTION.resolve(row).unwrap_or_default().to_string(),
                    class_name,
                },
            );
        }
        index
    }

    /// Answer rows dropped for a missing student, reference or date.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Understanding type of `student` for `reference_id` on `date`.
    ///
    /// `date` may be in any supported export shape; names are expected to be
    /// calibrated already.
    pub fn get_status(&self, student: &str, reference_id: &str, date: &str) -> String {
        let date = date_key(date);
        let matched = self
            .answers
            .get(&composite_key(&[student, reference_id, date.as_str()]))
            .and_then(|answer| {
                self.answer_keys
                    .get(&option_key(reference_id, &answer.option))
            });
        match matched {
            Some(kind) => kind.clone(),
            None if self
                .student_dates
                .contains(&composite_key(&[student, date.as_str()])) =>
            {
                NO_ATTEMPT.to_string()
            }
            None => ABSENT.to_string(),
        }
    }

    fn submitted_option(&self, student: &str, reference_id: &str, date: &str) -> Option<&str> {
        self.answers
            .get(&composite_key(&[student, reference_id, date]))
            .map(|a| a.option.as_str())
            .filter(|o| !o.trim().is_empty())
    }

    fn answered_class(&self, student: &str, reference_id: &str, date: &str) -> Option<&str> {
        self.answers
            .get(&composite_key(&[student, reference_id, date]))
            .and_then(|a| a.class_name.as_deref())
    }
}

pub struct StudentUnderstandingTransform;

impl TableTransform for StudentUnderstandingTransform {
    fn name(&self) -> &'static str {
        "student_understanding"
    }

    fn required_lookups(&self) -> &'static [&'static str] {
        &[ANSWER_KEYS_LOOKUP, ROSTER_LOOKUP]
    }

    fn transform(
        &self,
        inputs: &JobInputs,
        aliases: &NameAliases,
    ) -> Result<TransformOutput, TransformError> {
        let index = UnderstandingIndex::build(
            &inputs.primary,
            inputs.lookup(ANSWER_KEYS_LOOKUP)?,
            aliases,
        );

        // Everyone expected on a date: the roster plus anyone who answered.
        let mut expected = index.answered_students.clone();
        for row in inputs.lookup(ROSTER_LOOKUP)? {
            let (Some(student), Some(date)) = (
                STUDENT_NAME.resolve_non_empty(row),
                SESSION_DATE.resolve_non_empty(row),
            ) else {
                continue;
            };
            let class_name = CLASS_NAME.resolve_non_empty(row).map(str::to_string);
            expected
                .entry((date_key(date), aliases.calibrate(student)))
                .and_modify(|c| {
                    if class_name.is_some() {
                        *c = class_name.clone();
                    }
                })
                .or_insert(class_name);
        }

        let mut output = TransformOutput {
            records: Vec::new(),
            dropped: index.dropped(),
        };
        for ((date, student), class_name) in &expected {
            let Some(references) = index.references_by_date.get(date) else {
                continue;
            };
            for reference in references {
                let class_name = class_name
                    .as_deref()
                    .or_else(|| index.answered_class(student, reference, date));
                let mut record = TargetRecord::new();
                record
                    .set_text(STUDENT_NAME.field, student.as_str())
                    .set_optional_text(CLASS_NAME.field, class_name)
                    .set_text(SESSION_DATE.field, date.as_str())
                    .set_text(REFERENCE_ID.field, reference.as_str())
                    .set_optional_text(
                        SUBMITTED_OPTION.field,
                        index.submitted_option(student, reference, date),
                    )
                    .set_text(
                        UNDERSTANDING_TYPE.field,
                        index.get_status(student, reference, date),
                    );
                output.records.push(record);
            }
        }
        Ok(output)
    }
}
