//! SQLite-backed collaborator: stores records with their derived fields and
//! serves them back through the repository traits.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::config::{self, EngineConfig};
use crate::error::{CalcError, CalcResult};
use crate::exam::{can_publish_results, grade_outcome, ExamResult};
use crate::model::{
    validate_exam, validate_record, AssessmentRecord, AssessmentType, ExamDefinition,
    ExamOutcome, ExamType, GradingScale, RubricCriterion, Semester, StudentProfile, SubjectInfo,
};
use crate::normalize::{normalize_record, DerivedScore};
use crate::source::{ExamSource, GradebookSource, OutcomeRow, RecordQuery};

const DATE_FMT: &str = "%Y-%m-%d";
const DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S";
const TIME_FMT: &str = "%H:%M:%S";

pub fn open_db(path: &Path) -> anyhow::Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            roll_number TEXT,
            grade TEXT NOT NULL,
            section TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_grade_section ON students(grade, section, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            semester TEXT NOT NULL,
            title TEXT NOT NULL,
            assessment_type TEXT NOT NULL,
            marks_obtained REAL NOT NULL,
            total_marks REAL NOT NULL,
            weightage REAL NOT NULL,
            graded_date TEXT NOT NULL,
            due_date TEXT,
            submitted_date TEXT,
            is_published INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            is_extra_credit INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    // Workspaces created before rubrics and derived columns existed.
    ensure_records_rubric(conn)?;
    ensure_records_derived_columns(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_student_year ON assessment_records(student_id, academic_year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_subject ON assessment_records(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            grade TEXT NOT NULL,
            section TEXT,
            academic_year TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            exam_date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            total_marks REAL NOT NULL,
            passing_marks REAL NOT NULL,
            grading_scale_json TEXT,
            is_published INTEGER NOT NULL DEFAULT 0,
            results_published INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_outcomes(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            marks_obtained REAL,
            is_absent INTEGER NOT NULL DEFAULT 0,
            remarks TEXT,
            percentage REAL,
            grade TEXT,
            is_pass INTEGER,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(exam_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_outcomes_exam ON exam_outcomes(exam_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn ensure_records_rubric(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assessment_records", "rubric_json")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE assessment_records ADD COLUMN rubric_json TEXT",
        [],
    )?;
    Ok(())
}

fn ensure_records_derived_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "assessment_records", "percentage")? {
        conn.execute("ALTER TABLE assessment_records ADD COLUMN percentage REAL", [])?;
    }
    if !table_has_column(conn, "assessment_records", "grade")? {
        conn.execute("ALTER TABLE assessment_records ADD COLUMN grade TEXT", [])?;
    }
    if !table_has_column(conn, "assessment_records", "gpa_points")? {
        conn.execute("ALTER TABLE assessment_records ADD COLUMN gpa_points REAL", [])?;
    }
    if !table_has_column(conn, "assessment_records", "is_late")? {
        conn.execute(
            "ALTER TABLE assessment_records ADD COLUMN is_late INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "assessment_records", "is_passing")? {
        conn.execute(
            "ALTER TABLE assessment_records ADD COLUMN is_passing INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> CalcResult<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(v) => Ok(Some(v)),
        Err(e) => {
            warn!(key, error = %e, "ignoring malformed settings row");
            Ok(None)
        }
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> CalcResult<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

fn parse_date(field: &str, s: &str) -> CalcResult<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FMT)
        .map_err(|e| CalcError::storage(format!("bad {} '{}': {}", field, s, e)))
}

fn parse_datetime(field: &str, s: Option<String>) -> CalcResult<Option<NaiveDateTime>> {
    let Some(s) = s else {
        return Ok(None);
    };
    NaiveDateTime::parse_from_str(&s, DATETIME_FMT)
        .map(Some)
        .map_err(|e| CalcError::storage(format!("bad {} '{}': {}", field, s, e)))
}

fn parse_time(field: &str, s: &str) -> CalcResult<NaiveTime> {
    NaiveTime::parse_from_str(s, TIME_FMT)
        .map_err(|e| CalcError::storage(format!("bad {} '{}': {}", field, s, e)))
}

/// Raw column values; conversion to domain types happens outside rusqlite's
/// row closure so parse failures surface as `CalcError`.
struct RecordRow {
    id: String,
    student_id: String,
    subject_id: String,
    teacher_id: String,
    academic_year: String,
    semester: String,
    title: String,
    assessment_type: String,
    marks_obtained: f64,
    total_marks: f64,
    weightage: f64,
    graded_date: String,
    due_date: Option<String>,
    submitted_date: Option<String>,
    is_published: bool,
    is_deleted: bool,
    is_extra_credit: bool,
    rubric_json: Option<String>,
}

const RECORD_COLUMNS: &str = "id, student_id, subject_id, teacher_id, academic_year, semester, title,
     assessment_type, marks_obtained, total_marks, weightage, graded_date, due_date,
     submitted_date, is_published, is_deleted, is_extra_credit, rubric_json";

impl RecordRow {
    fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            student_id: r.get(1)?,
            subject_id: r.get(2)?,
            teacher_id: r.get(3)?,
            academic_year: r.get(4)?,
            semester: r.get(5)?,
            title: r.get(6)?,
            assessment_type: r.get(7)?,
            marks_obtained: r.get(8)?,
            total_marks: r.get(9)?,
            weightage: r.get(10)?,
            graded_date: r.get(11)?,
            due_date: r.get(12)?,
            submitted_date: r.get(13)?,
            is_published: r.get::<_, i64>(14)? != 0,
            is_deleted: r.get::<_, i64>(15)? != 0,
            is_extra_credit: r.get::<_, i64>(16)? != 0,
            rubric_json: r.get(17)?,
        })
    }

    fn into_record(self) -> CalcResult<AssessmentRecord> {
        let semester = Semester::parse(&self.semester)
            .ok_or_else(|| CalcError::storage(format!("unknown semester '{}'", self.semester)))?;
        let assessment_type = AssessmentType::parse(&self.assessment_type).ok_or_else(|| {
            CalcError::storage(format!("unknown assessment type '{}'", self.assessment_type))
        })?;
        let rubric: Vec<RubricCriterion> = match self.rubric_json.as_deref() {
            None | Some("") => Vec::new(),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| CalcError::storage(format!("bad rubric_json: {}", e)))?,
        };
        Ok(AssessmentRecord {
            graded_date: parse_date("graded_date", &self.graded_date)?,
            due_date: parse_datetime("due_date", self.due_date)?,
            submitted_date: parse_datetime("submitted_date", self.submitted_date)?,
            id: self.id,
            student_id: self.student_id,
            subject_id: self.subject_id,
            teacher_id: self.teacher_id,
            academic_year: self.academic_year,
            semester,
            title: self.title,
            assessment_type,
            marks_obtained: self.marks_obtained,
            total_marks: self.total_marks,
            weightage: self.weightage,
            is_published: self.is_published,
            is_deleted: self.is_deleted,
            is_extra_credit: self.is_extra_credit,
            rubric,
        })
    }
}

struct ExamRow {
    id: String,
    name: String,
    subject_id: String,
    grade: String,
    section: Option<String>,
    academic_year: String,
    exam_type: String,
    exam_date: String,
    start_time: String,
    end_time: String,
    total_marks: f64,
    passing_marks: f64,
    grading_scale_json: Option<String>,
    is_published: bool,
    results_published: bool,
}

impl ExamRow {
    fn into_exam(self) -> CalcResult<ExamDefinition> {
        let exam_type = ExamType::parse(&self.exam_type)
            .ok_or_else(|| CalcError::storage(format!("unknown exam type '{}'", self.exam_type)))?;
        let grading_scale: Option<GradingScale> = match self.grading_scale_json.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                serde_json::from_str(raw)
                    .map_err(|e| CalcError::storage(format!("bad grading_scale_json: {}", e)))?,
            ),
        };
        Ok(ExamDefinition {
            exam_date: parse_date("exam_date", &self.exam_date)?,
            start_time: parse_time("start_time", &self.start_time)?,
            end_time: parse_time("end_time", &self.end_time)?,
            id: self.id,
            name: self.name,
            subject_id: self.subject_id,
            grade: self.grade,
            section: self.section,
            academic_year: self.academic_year,
            exam_type,
            total_marks: self.total_marks,
            passing_marks: self.passing_marks,
            grading_scale,
            is_published: self.is_published,
            results_published: self.results_published,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedRecord {
    pub id: String,
    pub derived: DerivedScore,
}

pub struct SqliteGradebook {
    conn: Mutex<Connection>,
}

impl SqliteGradebook {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_db(path)?),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> CalcResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CalcError::storage("database lock poisoned"))
    }

    pub fn save_student(&self, student: &StudentProfile, sort_order: i64) -> CalcResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO students(id, name, roll_number, grade, section, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                roll_number = excluded.roll_number,
                grade = excluded.grade,
                section = excluded.section,
                sort_order = excluded.sort_order",
            (
                &student.id,
                &student.name,
                &student.roll_number,
                &student.grade,
                &student.section,
                sort_order,
            ),
        )?;
        Ok(())
    }

    pub fn save_subject(&self, subject: &SubjectInfo) -> CalcResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO subjects(id, name, code) VALUES(?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, code = excluded.code",
            (&subject.id, &subject.name, &subject.code),
        )?;
        Ok(())
    }

    /// Validate, normalize and store a record together with its derived
    /// fields. An empty id is replaced by a fresh one.
    pub fn save_record(&self, record: &AssessmentRecord) -> CalcResult<SavedRecord> {
        if let Err(e) = validate_record(record) {
            warn!(record_id = %record.id, error = %e, "rejected assessment record");
            return Err(e);
        }
        let derived = normalize_record(record)?;
        let id = if record.id.trim().is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            record.id.clone()
        };
        let rubric_json = if record.rubric.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&record.rubric)
                    .map_err(|e| CalcError::storage(e.to_string()))?,
            )
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO assessment_records(
                id, student_id, subject_id, teacher_id, academic_year, semester, title,
                assessment_type, marks_obtained, total_marks, weightage, graded_date, due_date,
                submitted_date, is_published, is_deleted, is_extra_credit, rubric_json,
                percentage, grade, gpa_points, is_late, is_passing)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                id,
                record.student_id,
                record.subject_id,
                record.teacher_id,
                record.academic_year,
                record.semester.as_str(),
                record.title,
                record.assessment_type.as_str(),
                record.marks_obtained,
                record.total_marks,
                record.weightage,
                record.graded_date.format(DATE_FMT).to_string(),
                record.due_date.map(|d| d.format(DATETIME_FMT).to_string()),
                record.submitted_date.map(|d| d.format(DATETIME_FMT).to_string()),
                record.is_published as i64,
                record.is_deleted as i64,
                record.is_extra_credit as i64,
                rubric_json,
                derived.percentage,
                derived.grade.as_str(),
                derived.gpa_points,
                derived.is_late as i64,
                derived.is_passing as i64,
            ],
        )?;
        Ok(SavedRecord { id, derived })
    }

    pub fn record(&self, record_id: &str) -> CalcResult<AssessmentRecord> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM assessment_records WHERE id = ?", RECORD_COLUMNS);
        let row = conn
            .query_row(&sql, [record_id], RecordRow::from_row)
            .optional()?;
        match row {
            Some(row) => row.into_record(),
            None => Err(CalcError::not_found("record not found")
                .with_details(serde_json::json!({ "recordId": record_id }))),
        }
    }

    pub fn set_record_published(&self, record_id: &str, published: bool) -> CalcResult<()> {
        self.update_record_flag(record_id, "is_published", published)
    }

    pub fn delete_record(&self, record_id: &str) -> CalcResult<()> {
        self.update_record_flag(record_id, "is_deleted", true)
    }

    fn update_record_flag(&self, record_id: &str, column: &str, value: bool) -> CalcResult<()> {
        let conn = self.conn()?;
        let sql = format!("UPDATE assessment_records SET {} = ? WHERE id = ?", column);
        let changed = conn.execute(&sql, (value as i64, record_id))?;
        if changed == 0 {
            return Err(CalcError::not_found("record not found")
                .with_details(serde_json::json!({ "recordId": record_id })));
        }
        Ok(())
    }

    pub fn save_exam(&self, exam: &ExamDefinition) -> CalcResult<()> {
        validate_exam(exam)?;
        let scale_json = match &exam.grading_scale {
            Some(s) => Some(serde_json::to_string(s).map_err(|e| CalcError::storage(e.to_string()))?),
            None => None,
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO exams(
                id, name, subject_id, grade, section, academic_year, exam_type, exam_date,
                start_time, end_time, total_marks, passing_marks, grading_scale_json,
                is_published, results_published)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                exam.id,
                exam.name,
                exam.subject_id,
                exam.grade,
                exam.section,
                exam.academic_year,
                exam.exam_type.as_str(),
                exam.exam_date.format(DATE_FMT).to_string(),
                exam.start_time.format(TIME_FMT).to_string(),
                exam.end_time.format(TIME_FMT).to_string(),
                exam.total_marks,
                exam.passing_marks,
                scale_json,
                exam.is_published as i64,
                exam.results_published as i64,
            ],
        )?;
        Ok(())
    }

    /// Grade and store one outcome. Re-entering a student's outcome replaces it.
    pub fn save_outcome(&self, outcome: &ExamOutcome) -> CalcResult<ExamResult> {
        let Some(exam) = self.exam(&outcome.exam_id)? else {
            return Err(CalcError::not_found("exam not found")
                .with_details(serde_json::json!({ "examId": outcome.exam_id })));
        };
        let result = grade_outcome(&exam, outcome)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO exam_outcomes(
                id, exam_id, student_id, marks_obtained, is_absent, remarks, percentage, grade, is_pass)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(exam_id, student_id) DO UPDATE SET
                marks_obtained = excluded.marks_obtained,
                is_absent = excluded.is_absent,
                remarks = excluded.remarks,
                percentage = excluded.percentage,
                grade = excluded.grade,
                is_pass = excluded.is_pass",
            rusqlite::params![
                uuid::Uuid::new_v4().to_string(),
                outcome.exam_id,
                outcome.student_id,
                if outcome.is_absent { None } else { Some(result.marks_obtained) },
                outcome.is_absent as i64,
                outcome.remarks,
                result.percentage,
                result.grade.as_str(),
                result.is_pass as i64,
            ],
        )?;
        Ok(result)
    }

    /// Flip the results-published flag, allowed only once the exam has ended.
    /// The check and the flip happen under one lock, so exactly one caller wins.
    pub fn publish_results(&self, exam_id: &str, now: NaiveDateTime) -> CalcResult<()> {
        let conn = self.conn()?;
        let Some(exam) = load_exam(&conn, exam_id)? else {
            return Err(CalcError::not_found("exam not found")
                .with_details(serde_json::json!({ "examId": exam_id })));
        };
        let refused = || {
            CalcError::validation("results can be published once, after the exam has completed")
                .with_details(serde_json::json!({ "examId": exam_id }))
        };
        if !can_publish_results(&exam, now) {
            return Err(refused());
        }
        let changed = conn.execute(
            "UPDATE exams SET results_published = 1 WHERE id = ? AND results_published = 0",
            [exam_id],
        )?;
        if changed == 0 {
            return Err(refused());
        }
        info!(exam_id, "exam results published");
        Ok(())
    }

    pub fn load_config(&self) -> CalcResult<EngineConfig> {
        let conn = self.conn()?;
        let saved = settings_get_json(&conn, config::SETTINGS_KEY)?;
        Ok(config::from_stored(saved.as_ref()))
    }

    pub fn save_config(&self, config: &EngineConfig) -> CalcResult<()> {
        let value = serde_json::to_value(config).map_err(|e| CalcError::storage(e.to_string()))?;
        let conn = self.conn()?;
        settings_set_json(&conn, config::SETTINGS_KEY, &value)
    }

    /// Merge a JSON patch into the stored config; a rejected patch leaves it untouched.
    pub fn update_config(&self, patch: &serde_json::Value) -> CalcResult<EngineConfig> {
        let conn = self.conn()?;
        let saved = settings_get_json(&conn, config::SETTINGS_KEY)?;
        let next = config::merge_patch(&config::from_stored(saved.as_ref()), patch)?;
        let value = serde_json::to_value(&next).map_err(|e| CalcError::storage(e.to_string()))?;
        settings_set_json(&conn, config::SETTINGS_KEY, &value)?;
        Ok(next)
    }
}

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentProfile> {
    Ok(StudentProfile {
        id: r.get(0)?,
        name: r.get(1)?,
        roll_number: r.get(2)?,
        grade: r.get(3)?,
        section: r.get(4)?,
    })
}

impl GradebookSource for SqliteGradebook {
    fn student(&self, student_id: &str) -> CalcResult<Option<StudentProfile>> {
        let conn = self.conn()?;
        let s = conn
            .query_row(
                "SELECT id, name, roll_number, grade, section FROM students WHERE id = ?",
                [student_id],
                student_from_row,
            )
            .optional()?;
        Ok(s)
    }

    fn subject(&self, subject_id: &str) -> CalcResult<Option<SubjectInfo>> {
        let conn = self.conn()?;
        let s = conn
            .query_row(
                "SELECT id, name, code FROM subjects WHERE id = ?",
                [subject_id],
                |r| {
                    Ok(SubjectInfo {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        code: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(s)
    }

    // One SELECT under the connection lock: a record toggled mid-read is
    // either wholly in the result or wholly out of it.
    fn published_records(&self, query: &RecordQuery) -> CalcResult<Vec<AssessmentRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {}
             FROM assessment_records
             WHERE student_id = ?1
               AND academic_year = ?2
               AND (?3 IS NULL OR semester = ?3)
               AND (?4 IS NULL OR subject_id = ?4)
               AND is_published = 1
               AND is_deleted = 0
             ORDER BY graded_date, rowid",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params![
                    query.student_id,
                    query.academic_year,
                    query.semester.map(|s| s.as_str()),
                    query.subject_id,
                ],
                RecordRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    fn roster(&self, grade: &str, section: Option<&str>) -> CalcResult<Vec<StudentProfile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            &format!(
                "SELECT s.id, s.name, s.roll_number, s.grade, s.section
                 FROM students s
                 WHERE s.grade = ?1 AND (?2 IS NULL OR s.section = ?2)
                 ORDER BY {}",
                ROSTER_ORDER
            ),
        )?;
        let students = stmt
            .query_map((grade, section), student_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(students)
    }
}

fn load_exam(conn: &Connection, exam_id: &str) -> CalcResult<Option<ExamDefinition>> {
    let row = conn
        .query_row(
            "SELECT id, name, subject_id, grade, section, academic_year, exam_type, exam_date,
                    start_time, end_time, total_marks, passing_marks, grading_scale_json,
                    is_published, results_published
             FROM exams WHERE id = ?",
            [exam_id],
            |r| {
                Ok(ExamRow {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    subject_id: r.get(2)?,
                    grade: r.get(3)?,
                    section: r.get(4)?,
                    academic_year: r.get(5)?,
                    exam_type: r.get(6)?,
                    exam_date: r.get(7)?,
                    start_time: r.get(8)?,
                    end_time: r.get(9)?,
                    total_marks: r.get(10)?,
                    passing_marks: r.get(11)?,
                    grading_scale_json: r.get(12)?,
                    is_published: r.get::<_, i64>(13)? != 0,
                    results_published: r.get::<_, i64>(14)? != 0,
                })
            },
        )
        .optional()?;
    row.map(ExamRow::into_exam).transpose()
}

/// Roster order: explicit sort order, then roll number compared as a number
/// when it is one ("2" before "10"), then as text, then id.
const ROSTER_ORDER: &str =
    "COALESCE(s.sort_order, 0), CAST(s.roll_number AS INTEGER), s.roll_number, s.id";

impl ExamSource for SqliteGradebook {
    fn exam(&self, exam_id: &str) -> CalcResult<Option<ExamDefinition>> {
        let conn = self.conn()?;
        load_exam(&conn, exam_id)
    }

    // The outcome set and its order are fixed by one key read up front;
    // outcomes saved while the visitor runs are neither re-read nor
    // allowed to shift later chunks.
    fn visit_outcomes(
        &self,
        exam_id: &str,
        chunk_size: usize,
        visit: &mut dyn FnMut(OutcomeRow) -> CalcResult<()>,
    ) -> CalcResult<()> {
        let keys: Vec<i64> = {
            let conn = self.conn()?;
            let sql = format!(
                "SELECT o.rowid
                 FROM exam_outcomes o
                 LEFT JOIN students s ON s.id = o.student_id
                 WHERE o.exam_id = ?1
                 ORDER BY {}, o.student_id",
                ROSTER_ORDER
            );
            let mut stmt = conn.prepare(&sql)?;
            let keys = stmt
                .query_map([exam_id], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            keys
        };

        for chunk in keys.chunks(chunk_size.max(1)) {
            // Each chunk is read and released before the visitor runs.
            let mut by_key: HashMap<i64, OutcomeRow> = {
                let conn = self.conn()?;
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let sql = format!(
                    "SELECT o.rowid, o.exam_id, o.student_id, o.marks_obtained, o.is_absent,
                            o.remarks, COALESCE(s.name, ''), s.roll_number
                     FROM exam_outcomes o
                     LEFT JOIN students s ON s.id = o.student_id
                     WHERE o.rowid IN ({})",
                    placeholders
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(chunk.iter()), |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            OutcomeRow {
                                outcome: ExamOutcome {
                                    exam_id: r.get(1)?,
                                    student_id: r.get(2)?,
                                    marks_obtained: r.get(3)?,
                                    is_absent: r.get::<_, i64>(4)? != 0,
                                    remarks: r.get(5)?,
                                },
                                student_name: r.get(6)?,
                                roll_number: r.get(7)?,
                            },
                        ))
                    })?
                    .collect::<Result<HashMap<_, _>, _>>()?;
                rows
            };
            for key in chunk {
                if let Some(row) = by_key.remove(key) {
                    visit(row)?;
                }
            }
        }
        Ok(())
    }
}
