//! Exam lifecycle, per-student outcome grading and exam statistics.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{CalcError, CalcResult};
use crate::model::{validate_outcome, ExamDefinition, ExamGrade, ExamOutcome, GradingScale};
use crate::normalize::{normalize_exam_score, normalize_for_exam, round_2_decimals};
use crate::source::{ExamSource, OutcomeRow};
use crate::stats::{
    analyze_cohort, ranked_indices, ratio_percent, CohortEntry, CohortStatistics, RankOrder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamStatus {
    Upcoming,
    Ongoing,
    Completed,
}

/// Derived from the wall clock only; the status is never stored.
pub fn exam_status(exam: &ExamDefinition, now: NaiveDateTime) -> ExamStatus {
    if now < exam.starts_at() {
        ExamStatus::Upcoming
    } else if now <= exam.ends_at() {
        ExamStatus::Ongoing
    } else {
        ExamStatus::Completed
    }
}

pub fn can_publish_results(exam: &ExamDefinition, now: NaiveDateTime) -> bool {
    exam_status(exam, now) == ExamStatus::Completed && !exam.results_published
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamResult {
    pub exam_id: String,
    pub student_id: String,
    pub is_absent: bool,
    pub marks_obtained: f64,
    pub percentage: f64,
    pub grade: ExamGrade,
    pub is_pass: bool,
    pub remarks: Option<String>,
}

pub fn grade_outcome(exam: &ExamDefinition, outcome: &ExamOutcome) -> CalcResult<ExamResult> {
    validate_outcome(exam, outcome)?;
    let score = normalize_for_exam(exam, outcome.marks_obtained, outcome.is_absent)?;
    Ok(ExamResult {
        exam_id: exam.id.clone(),
        student_id: outcome.student_id.clone(),
        is_absent: outcome.is_absent,
        marks_obtained: score.marks_obtained,
        percentage: score.percentage,
        grade: score.grade,
        is_pass: score.is_pass,
        remarks: outcome.remarks.clone(),
    })
}

fn duplicate_outcome(student_id: &str) -> CalcError {
    CalcError::validation("more than one outcome for the same student")
        .with_details(serde_json::json!({ "studentId": student_id }))
}

/// Grade every outcome of one exam. A second outcome for a student is rejected.
pub fn grade_outcomes(
    exam: &ExamDefinition,
    outcomes: &[ExamOutcome],
) -> CalcResult<Vec<ExamResult>> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::with_capacity(outcomes.len());
    for o in outcomes {
        if !seen.insert(o.student_id.as_str()) {
            return Err(duplicate_outcome(&o.student_id));
        }
        out.push(grade_outcome(exam, o)?);
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRankEntry {
    pub rank: usize,
    pub student_id: String,
    pub name: String,
    pub roll_number: Option<String>,
    pub marks_obtained: f64,
    pub percentage: f64,
    pub grade: ExamGrade,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamStatistics {
    pub exam_id: String,
    pub exam_name: String,
    pub subject_id: String,
    pub status: ExamStatus,
    pub total_marks: f64,
    pub passing_marks: f64,
    pub total_students: usize,
    pub appeared: usize,
    pub absent: usize,
    pub passed: usize,
    pub failed: usize,
    pub attendance_percentage: f64,
    /// Passed over appeared, using the exam's passing marks.
    pub pass_percentage: f64,
    /// Statistics over students who appeared.
    pub cohort: CohortStatistics<ExamGrade>,
    pub top_performers: Vec<ExamRankEntry>,
}

/// Consumes outcomes one at a time. Only the compact per-student figures the
/// statistics need are retained.
pub struct ExamStatsAccumulator<'a> {
    exam: &'a ExamDefinition,
    scale: GradingScale,
    seen: HashSet<String>,
    entries: Vec<CohortEntry>,
    marks: Vec<f64>,
    absent: usize,
    passed: usize,
}

impl<'a> ExamStatsAccumulator<'a> {
    pub fn new(exam: &'a ExamDefinition) -> Self {
        Self {
            exam,
            scale: exam.scale(),
            seen: HashSet::new(),
            entries: Vec::new(),
            marks: Vec::new(),
            absent: 0,
            passed: 0,
        }
    }

    pub fn push(&mut self, row: OutcomeRow) -> CalcResult<()> {
        let OutcomeRow {
            outcome,
            student_name,
            roll_number,
        } = row;
        validate_outcome(self.exam, &outcome)?;
        if !self.seen.insert(outcome.student_id.clone()) {
            return Err(duplicate_outcome(&outcome.student_id));
        }
        if outcome.is_absent {
            self.absent += 1;
            return Ok(());
        }

        let score = normalize_exam_score(
            outcome.marks_obtained,
            self.exam.total_marks,
            self.exam.passing_marks,
            &self.scale,
            false,
        )?;
        if score.is_pass {
            self.passed += 1;
        }
        self.marks.push(score.marks_obtained);
        self.entries.push(CohortEntry {
            student_id: outcome.student_id,
            name: student_name,
            roll_number,
            percentage: score.percentage,
        });
        Ok(())
    }

    pub fn finish(self, now: NaiveDateTime, config: &EngineConfig) -> ExamStatistics {
        let appeared = self.entries.len();
        let total_students = appeared + self.absent;

        let top_performers = ranked_indices(&self.marks, config.exam_top_n, RankOrder::Highest)
            .into_iter()
            .enumerate()
            .map(|(pos, i)| {
                let e = &self.entries[i];
                ExamRankEntry {
                    rank: pos + 1,
                    student_id: e.student_id.clone(),
                    name: e.name.clone(),
                    roll_number: e.roll_number.clone(),
                    marks_obtained: self.marks[i],
                    percentage: e.percentage,
                    grade: self.scale.grade_for(e.percentage),
                }
            })
            .collect();

        debug!(
            exam_id = %self.exam.id,
            appeared,
            absent = self.absent,
            passed = self.passed,
            "computed exam statistics"
        );

        ExamStatistics {
            exam_id: self.exam.id.clone(),
            exam_name: self.exam.name.clone(),
            subject_id: self.exam.subject_id.clone(),
            status: exam_status(self.exam, now),
            total_marks: self.exam.total_marks,
            passing_marks: self.exam.passing_marks,
            total_students,
            appeared,
            absent: self.absent,
            passed: self.passed,
            failed: appeared - self.passed,
            attendance_percentage: round_2_decimals(ratio_percent(appeared, total_students)),
            pass_percentage: round_2_decimals(ratio_percent(self.passed, appeared)),
            cohort: analyze_cohort(&self.entries, &self.scale, config.cohort_top_n),
            top_performers,
        }
    }
}

pub fn exam_statistics<S>(
    source: &S,
    exam_id: &str,
    now: NaiveDateTime,
    config: &EngineConfig,
) -> CalcResult<ExamStatistics>
where
    S: ExamSource + ?Sized,
{
    let Some(exam) = source.exam(exam_id)? else {
        return Err(CalcError::not_found("exam not found")
            .with_details(serde_json::json!({ "examId": exam_id })));
    };
    let mut acc = ExamStatsAccumulator::new(&exam);
    source.visit_outcomes(exam_id, config.batch_chunk_size, &mut |row: OutcomeRow| {
        acc.push(row)
    })?;
    Ok(acc.finish(now, config))
}
