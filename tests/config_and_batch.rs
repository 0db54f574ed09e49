use chrono::NaiveDate;
use gradecore::batch::{compose_report_cards, compute_exam_statistics};
use gradecore::db::SqliteGradebook;
use gradecore::model::{AssessmentRecord, AssessmentType, RubricCriterion, Semester, StudentProfile, SubjectInfo};
use gradecore::report::{ReportCardExtras, ReportCardRequest};
use gradecore::{EngineConfig, ErrorKind};
use serde_json::json;
use std::sync::atomic::AtomicBool;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn seed(db: &SqliteGradebook, students: usize) {
    db.save_subject(&SubjectInfo {
        id: "hist".to_string(),
        name: "History".to_string(),
        code: "HIS".to_string(),
    })
    .expect("save subject");
    for i in 0..students {
        let id = format!("s{:02}", i);
        db.save_student(
            &StudentProfile {
                id: id.clone(),
                name: format!("Student {}", i),
                roll_number: Some(format!("{}", i + 1)),
                grade: "9".to_string(),
                section: Some("C".to_string()),
            },
            i as i64,
        )
        .expect("save student");
        db.save_record(&AssessmentRecord {
            id: String::new(),
            student_id: id,
            subject_id: "hist".to_string(),
            teacher_id: "t9".to_string(),
            academic_year: "2025-2026".to_string(),
            semester: Semester::Second,
            title: "Essay".to_string(),
            assessment_type: AssessmentType::Assignment,
            marks_obtained: 50.0 + i as f64,
            total_marks: 100.0,
            weightage: 25.0,
            graded_date: NaiveDate::from_ymd_opt(2026, 2, 2).expect("date"),
            due_date: None,
            submitted_date: None,
            is_published: true,
            is_deleted: false,
            is_extra_credit: false,
            rubric: Vec::new(),
        })
        .expect("save record");
    }
}

fn requests(students: usize) -> Vec<(ReportCardRequest, ReportCardExtras)> {
    (0..students)
        .map(|i| {
            (
                ReportCardRequest {
                    student_id: format!("s{:02}", i),
                    academic_year: "2025-2026".to_string(),
                    semester: Some(Semester::Second),
                },
                ReportCardExtras::default(),
            )
        })
        .collect()
}

#[test]
fn config_survives_reopening_the_database() {
    init_logging();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("workspace").join("gradebook.sqlite3");

    {
        let db = SqliteGradebook::open(&path).expect("open");
        assert_eq!(db.load_config().expect("defaults"), EngineConfig::default());
        db.update_config(&json!({ "batchWorkers": 2, "examTopN": 3 }))
            .expect("patch");
        let e = db
            .update_config(&json!({ "batchWorkers": 2, "examTopN": 500 }))
            .expect_err("out of range");
        assert_eq!(e.kind, ErrorKind::Validation);
    }

    let db = SqliteGradebook::open(&path).expect("reopen");
    let config = db.load_config().expect("load");
    assert_eq!(config.batch_workers, 2);
    assert_eq!(config.exam_top_n, 3);
    assert_eq!(config.cohort_top_n, 5);
}

#[test]
fn saved_records_get_ids_and_rubrics_on_disk() {
    let dir = tempfile::tempdir().expect("temp dir");
    let db = SqliteGradebook::open(&dir.path().join("gb.sqlite3")).expect("open");
    seed(&db, 1);

    let record = AssessmentRecord {
        id: String::new(),
        student_id: "s00".to_string(),
        subject_id: "hist".to_string(),
        teacher_id: "t9".to_string(),
        academic_year: "2025-2026".to_string(),
        semester: Semester::Second,
        title: "Project".to_string(),
        assessment_type: AssessmentType::Project,
        marks_obtained: 18.0,
        total_marks: 20.0,
        weightage: 30.0,
        graded_date: NaiveDate::from_ymd_opt(2026, 3, 1).expect("date"),
        due_date: NaiveDate::from_ymd_opt(2026, 2, 28).and_then(|d| d.and_hms_opt(23, 59, 0)),
        submitted_date: NaiveDate::from_ymd_opt(2026, 3, 1).and_then(|d| d.and_hms_opt(8, 0, 0)),
        is_published: true,
        is_deleted: false,
        is_extra_credit: false,
        rubric: vec![
            RubricCriterion {
                criterion: "Research".to_string(),
                max_points: 12.0,
                earned_points: 11.0,
            },
            RubricCriterion {
                criterion: "Presentation".to_string(),
                max_points: 8.0,
                earned_points: 7.0,
            },
        ],
    };
    let saved = db.save_record(&record).expect("save");
    assert_eq!(saved.id.len(), 36);
    assert_eq!(saved.derived.percentage, 90.0);
    assert!(saved.derived.is_late);
    assert!(saved.derived.is_passing);

    let back = db.record(&saved.id).expect("reload");
    assert_eq!(back.rubric, record.rubric);
    assert_eq!(back.submitted_date, record.submitted_date);

    let mut bad = record.clone();
    bad.rubric[0].earned_points = 5.0;
    let e = db.save_record(&bad).expect_err("rubric mismatch");
    assert_eq!(e.kind, ErrorKind::Validation);
}

#[test]
fn batch_report_cards_over_the_gradebook() {
    init_logging();
    let db = SqliteGradebook::open_in_memory().expect("open");
    seed(&db, 12);
    let config = EngineConfig {
        batch_workers: 3,
        ..EngineConfig::default()
    };

    let out = compose_report_cards(&db, &requests(12), &config, &AtomicBool::new(false))
        .expect("batch");
    assert_eq!(out.completed.len(), 12);
    assert!(out.skipped.is_empty());
    for (i, (id, card)) in out.completed.iter().enumerate() {
        let card = card.as_ref().expect("card");
        assert_eq!(id, &format!("s{:02}", i));
        assert_eq!(card.total_subjects, 1);
        assert_eq!(card.overall_percentage, 50.0 + i as f64);
    }
}

#[test]
fn cancelled_batch_reports_every_unit_as_skipped() {
    let db = SqliteGradebook::open_in_memory().expect("open");
    seed(&db, 4);
    let cancel = AtomicBool::new(true);

    let cards = compose_report_cards(&db, &requests(4), &EngineConfig::default(), &cancel)
        .expect("batch");
    assert!(cards.completed.is_empty());
    assert_eq!(cards.skipped.len(), 4);

    let ids = vec!["x1".to_string(), "x2".to_string()];
    let now = NaiveDate::from_ymd_opt(2026, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("now");
    let exams = compute_exam_statistics(&db, &ids, now, &EngineConfig::default(), &cancel)
        .expect("batch");
    assert!(exams.was_cancelled());
    assert_eq!(exams.skipped, ids);
}

#[test]
fn concurrent_config_patches_do_not_lose_updates() {
    let db = SqliteGradebook::open_in_memory().expect("open");
    std::thread::scope(|scope| {
        scope.spawn(|| {
            for n in 1..=40 {
                db.update_config(&json!({ "cohortTopN": n })).expect("cohort patch");
            }
        });
        scope.spawn(|| {
            for n in 1..=40 {
                db.update_config(&json!({ "examTopN": n })).expect("exam patch");
            }
        });
    });
    let config = db.load_config().expect("load");
    assert_eq!(config.cohort_top_n, 40);
    assert_eq!(config.exam_top_n, 40);
}
