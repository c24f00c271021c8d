//! Single-source transforms: one raw row maps to at most one record.

use tpsync_core::{ColumnCandidates, RawRow, TargetRecord};

use crate::{date_key, JobInputs, NameAliases, TableTransform, TransformError, TransformOutput};

pub(crate) const SESSION_ID: ColumnCandidates = ColumnCandidates::new(
    "session_id",
    &["session_id", "Session ID", "id_session", "ID Sesi"],
);
pub(crate) const CLASS_NAME: ColumnCandidates =
    ColumnCandidates::new("class_name", &["class_name", "Class Name", "class", "Kelas"]);
pub(crate) const TEACHER_NAME: ColumnCandidates = ColumnCandidates::new(
    "teacher_name",
    &["teacher_name", "Teacher Name", "teacher", "Nama Guru", "Guru"],
);
pub(crate) const CLASS_DATE: ColumnCandidates = ColumnCandidates::new(
    "class_date",
    &["class_date", "Class Date", "session_date", "date", "Tanggal"],
);
const START_TIME: ColumnCandidates =
    ColumnCandidates::new("start_time", &["start_time", "Start Time", "time", "Jam"]);
const COURSE: ColumnCandidates =
    ColumnCandidates::new("course", &["course", "Course Name", "program", "Program"]);

const KEYWORD: ColumnCandidates =
    ColumnCandidates::new("keyword", &["keyword", "Keyword", "topic", "Topic"]);
const FILE_LINK: ColumnCandidates =
    ColumnCandidates::new("file_link", &["file_link", "File Link", "link", "url"]);

const PHOTO_URL: ColumnCandidates = ColumnCandidates::new(
    "photo_url",
    &["photo_url", "avatar_url", "Photo URL", "photo", "foto"],
);

/// Map each row with `map_row`; `None` means the identifying key was
/// missing and the row is dropped.
fn map_rows<F>(rows: &[RawRow], mut map_row: F) -> TransformOutput
where
    F: FnMut(&RawRow) -> Option<TargetRecord>,
{
    let mut output = TransformOutput::default();
    for row in rows {
        match map_row(row) {
            Some(record) => output.records.push(record),
            None => output.dropped += 1,
        }
    }
    output
}

/// Class sessions keyed by `session_id`.
pub struct ClassScheduleTransform;

impl TableTransform for ClassScheduleTransform {
    fn name(&self) -> &'static str {
        "class_schedule"
    }

    fn transform(
        &self,
        inputs: &JobInputs,
        aliases: &NameAliases,
    ) -> Result<TransformOutput, TransformError> {
        Ok(map_rows(&inputs.primary, |row| {
            let session_id = SESSION_ID.resolve_non_empty(row)?;
            let mut record = TargetRecord::new();
            record
                .set_text(SESSION_ID.field, session_id)
                .set_optional_text(CLASS_NAME.field, CLASS_NAME.resolve(row))
                .set_optional_text(
                    TEACHER_NAME.field,
                    TEACHER_NAME
                        .resolve_non_empty(row)
                        .map(|n| aliases.calibrate(n))
                        .as_deref(),
                )
                .set_optional_text(
                    CLASS_DATE.field,
                    CLASS_DATE.resolve_non_empty(row).map(date_key).as_deref(),
                )
                .set_optional_text(START_TIME.field, START_TIME.resolve(row))
                .set_optional_text(COURSE.field, COURSE.resolve(row));
            Some(record)
        }))
    }
}

/// Learning-material links from the public feed, keyed by `keyword`.
pub struct LearningMaterialsTransform;

impl TableTransform for LearningMaterialsTransform {
    fn name(&self) -> &'static str {
        "learning_materials"
    }

    fn transform(
        &self,
        inputs: &JobInputs,
        _aliases: &NameAliases,
    ) -> Result<TransformOutput, TransformError> {
        Ok(map_rows(&inputs.primary, |row| {
            let keyword = KEYWORD.resolve_non_empty(row)?;
            let mut record = TargetRecord::new();
            record
                .set_text(KEYWORD.field, keyword)
                .set_optional_text(FILE_LINK.field, FILE_LINK.resolve(row));
            Some(record)
        }))
    }
}

/// Teacher avatar URLs keyed by calibrated teacher name.
pub struct TeacherPhotosTransform;

impl TableTransform for TeacherPhotosTransform {
    fn name(&self) -> &'static str {
        "teacher_photos"
    }

    fn transform(
        &self,
        inputs: &JobInputs,
        aliases: &NameAliases,
    ) -> Result<TransformOutput, TransformError> {
        Ok(map_rows(&inputs.primary, |row| {
            let teacher = aliases.calibrate(TEACHER_NAME.resolve_non_empty(row)?);
            let mut record = TargetRecord::new();
            record
                .set_text(TEACHER_NAME.field, teacher)
                .set_optional_text(PHOTO_URL.field, PHOTO_URL.resolve(row));
            Some(record)
        }))
    }
}
