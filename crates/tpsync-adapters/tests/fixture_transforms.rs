use std::path::{Path, PathBuf};

use tpsync_adapters::{parse_csv, rows_from_payload, transform_for, JobInputs, NameAliases};
use tpsync_storage::{parse_json_array, SourcePayload};

fn root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn read(rel: &str) -> String {
    std::fs::read_to_string(root().join("fixtures").join(rel)).unwrap()
}

fn aliases() -> NameAliases {
    NameAliases::from_rules_dir(&root().join("rules")).unwrap()
}

#[test]
fn class_schedule_fixture_keeps_quoted_commas() {
    let rows = parse_csv(&read("metabase/class_schedule.csv")).unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].get("Course Name"), Some("Math, Advanced"));
    assert_eq!(rows[3].get("Course Name"), Some("Art \"Studio\""));

    let out = transform_for("class_schedule")
        .unwrap()
        .transform(&JobInputs::new(rows), &aliases())
        .unwrap();
    assert_eq!(out.records.len(), 3);
    assert_eq!(out.dropped, 1);
}

#[test]
fn piket_fixture_gets_first_class_dates() {
    let inputs = JobInputs::new(parse_csv(&read("metabase/piket_roster.csv")).unwrap())
        .with_lookup("classes", parse_csv(&read("metabase/class_schedule.csv")).unwrap());
    let out = transform_for("piket_roster")
        .unwrap()
        .transform(&inputs, &aliases())
        .unwrap();

    let dates: Vec<_> = out
        .records
        .iter()
        .map(|r| (r.get_str("teacher_name").unwrap(), r.get_str("first_class_date")))
        .collect();
    assert_eq!(
        dates,
        vec![
            ("Ani Rahmawati", Some("2024-07-01")),
            ("Budi Santoso", Some("2024-07-01")),
        ]
    );
}

#[test]
fn teacher_photos_fixture_decodes_from_json() {
    let items = parse_json_array("fixture", &read("metabase/teacher_photos.json")).unwrap();
    let rows = rows_from_payload(&SourcePayload::Json(items)).unwrap();
    let out = transform_for("teacher_photos")
        .unwrap()
        .transform(&JobInputs::new(rows), &aliases())
        .unwrap();
    assert_eq!(out.records.len(), 2);
    assert_eq!(out.dropped, 1);
    assert_eq!(out.records[0].get_str("teacher_name"), Some("Ani Rahmawati"));
}
