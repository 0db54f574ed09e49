//! Per-record score normalization.
//!
//! Two grade tables live here: the 13-letter general-assessment table used for
//! coursework and report cards, and the 5-band exam table driven by a
//! [`GradingScale`]. They carry different pass rules and are kept apart.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::{CalcError, CalcResult};
use crate::model::{AssessmentRecord, ExamDefinition, ExamGrade, GradingScale, LetterGrade};

/// Pass cut for general assessments, as a percentage.
pub const GENERAL_PASS_PERCENTAGE: f64 = 60.0;

/// Half-up rounding to a whole number: `Int(x + 0.5)`.
pub fn round_whole(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Half-up rounding to two decimals, used for every aggregated output value.
pub fn round_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// `round(marks / total * 100)`. A non-positive total is rejected, never divided.
pub fn percentage(marks_obtained: f64, total_marks: f64) -> CalcResult<f64> {
    if !total_marks.is_finite() || total_marks <= 0.0 {
        return Err(CalcError::validation("totalMarks must be greater than 0")
            .with_details(serde_json::json!({ "field": "totalMarks" })));
    }
    Ok(round_whole(marks_obtained * 100.0 / total_marks))
}

pub fn general_letter(percentage: f64) -> LetterGrade {
    const CUTS: [(f64, LetterGrade); 12] = [
        (97.0, LetterGrade::APlus),
        (93.0, LetterGrade::A),
        (90.0, LetterGrade::AMinus),
        (87.0, LetterGrade::BPlus),
        (83.0, LetterGrade::B),
        (80.0, LetterGrade::BMinus),
        (77.0, LetterGrade::CPlus),
        (73.0, LetterGrade::C),
        (70.0, LetterGrade::CMinus),
        (67.0, LetterGrade::DPlus),
        (63.0, LetterGrade::D),
        (60.0, LetterGrade::DMinus),
    ];
    CUTS.iter()
        .find(|(cut, _)| percentage >= *cut)
        .map(|(_, g)| *g)
        .unwrap_or(LetterGrade::F)
}

pub fn is_late(due: Option<NaiveDateTime>, submitted: Option<NaiveDateTime>) -> bool {
    match (due, submitted) {
        (Some(due), Some(submitted)) => submitted > due,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralScore {
    pub percentage: f64,
    pub grade: LetterGrade,
    pub gpa_points: f64,
    pub is_pass: bool,
}

impl GeneralScore {
    /// Grade an already computed percentage (e.g. a weighted average).
    pub fn from_percentage(percentage: f64) -> Self {
        let grade = general_letter(percentage);
        Self {
            percentage,
            grade,
            gpa_points: grade.gpa_points(),
            is_pass: percentage >= GENERAL_PASS_PERCENTAGE,
        }
    }

    fn absent() -> Self {
        Self {
            percentage: 0.0,
            grade: LetterGrade::WEAKEST,
            gpa_points: LetterGrade::WEAKEST.gpa_points(),
            is_pass: false,
        }
    }
}

pub fn normalize_score(
    marks_obtained: f64,
    total_marks: f64,
    is_absent: bool,
) -> CalcResult<GeneralScore> {
    if is_absent {
        return Ok(GeneralScore::absent());
    }
    let pct = percentage(marks_obtained, total_marks)?;
    Ok(GeneralScore::from_percentage(pct))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamScore {
    pub marks_obtained: f64,
    pub percentage: f64,
    pub grade: ExamGrade,
    pub is_pass: bool,
}

/// Exam-domain normalization. Missing marks count as 0; absence dominates
/// every other input.
pub fn normalize_exam_score(
    marks_obtained: Option<f64>,
    total_marks: f64,
    passing_marks: f64,
    scale: &GradingScale,
    is_absent: bool,
) -> CalcResult<ExamScore> {
    if is_absent {
        return Ok(ExamScore {
            marks_obtained: 0.0,
            percentage: 0.0,
            grade: ExamGrade::Absent,
            is_pass: false,
        });
    }
    let marks = marks_obtained.unwrap_or(0.0);
    let pct = percentage(marks, total_marks)?;
    Ok(ExamScore {
        marks_obtained: marks,
        percentage: pct,
        grade: scale.grade_for(pct),
        is_pass: marks >= passing_marks,
    })
}

pub fn normalize_for_exam(
    exam: &ExamDefinition,
    marks_obtained: Option<f64>,
    is_absent: bool,
) -> CalcResult<ExamScore> {
    normalize_exam_score(
        marks_obtained,
        exam.total_marks,
        exam.passing_marks,
        &exam.scale(),
        is_absent,
    )
}

/// Fields the storage layer persists next to an assessment record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedScore {
    pub percentage: f64,
    pub grade: LetterGrade,
    pub gpa_points: f64,
    pub is_passing: bool,
    pub is_late: bool,
}

pub fn normalize_record(record: &AssessmentRecord) -> CalcResult<DerivedScore> {
    let score = normalize_score(record.marks_obtained, record.total_marks, false)?;
    Ok(DerivedScore {
        percentage: score.percentage,
        grade: score.grade,
        gpa_points: score.gpa_points,
        is_passing: score.is_pass,
        is_late: is_late(record.due_date, record.submitted_date),
    })
}
