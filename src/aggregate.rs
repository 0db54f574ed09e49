use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;

use crate::error::CalcResult;
use crate::model::{AssessmentRecord, AssessmentType, LetterGrade, Semester};
use crate::normalize::{normalize_record, round_2_decimals, GeneralScore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectScope {
    pub student_id: String,
    pub subject_id: String,
    pub academic_year: String,
    pub semester: Option<Semester>,
}

impl SubjectScope {
    pub fn contains(&self, r: &AssessmentRecord) -> bool {
        r.student_id == self.student_id
            && r.subject_id == self.subject_id
            && r.academic_year == self.academic_year
            && self.semester.map(|s| r.semester == s).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeBreakdown {
    pub assessment_type: AssessmentType,
    pub count: usize,
    pub average_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub grade: LetterGrade,
    pub percentage: f64,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub student_id: String,
    pub subject_id: String,
    pub academic_year: String,
    pub semester: Option<Semester>,
    pub weighted_percentage: f64,
    pub grade: LetterGrade,
    pub gpa_points: f64,
    pub is_passing: bool,
    pub total_marks: f64,
    pub total_obtained: f64,
    pub assessment_count: usize,
    pub by_type: Vec<TypeBreakdown>,
    pub trend: Vec<TrendPoint>,
}

/// Σ(p·w) / Σw. Returns 0 when there is nothing to weigh.
pub fn weighted_average<I>(items: I) -> f64
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for (percentage, weight) in items {
        if weight <= 0.0 {
            continue;
        }
        sum += percentage * weight;
        denom += weight;
    }
    if denom > 0.0 {
        sum / denom
    } else {
        0.0
    }
}

pub fn summarize_subject(
    scope: &SubjectScope,
    records: &[AssessmentRecord],
) -> CalcResult<SubjectSummary> {
    let mut weighted: Vec<(f64, f64)> = Vec::new();
    let mut per_type: HashMap<AssessmentType, (usize, f64)> = HashMap::new(); // count, sum
    let mut trend: Vec<TrendPoint> = Vec::new();
    let mut total_marks = 0.0_f64;
    let mut total_obtained = 0.0_f64;

    for r in records {
        if !r.is_countable() || !scope.contains(r) {
            continue;
        }
        let derived = normalize_record(r)?;

        weighted.push((derived.percentage, r.weightage));
        total_marks += r.total_marks;
        total_obtained += r.marks_obtained;

        let entry = per_type.entry(r.assessment_type).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += derived.percentage;

        trend.push(TrendPoint {
            date: r.graded_date,
            grade: derived.grade,
            percentage: derived.percentage,
            title: r.title.clone(),
        });
    }

    // Stable: records graded on the same day keep their input order.
    trend.sort_by_key(|p| p.date);

    let by_type = AssessmentType::ALL
        .iter()
        .map(|t| {
            let (count, sum) = per_type.get(t).copied().unwrap_or((0, 0.0));
            let average_percentage = if count > 0 {
                round_2_decimals(sum / count as f64)
            } else {
                0.0
            };
            TypeBreakdown {
                assessment_type: *t,
                count,
                average_percentage,
            }
        })
        .collect();

    let weighted_percentage = round_2_decimals(weighted_average(weighted.iter().copied()));
    let score = GeneralScore::from_percentage(weighted_percentage);

    Ok(SubjectSummary {
        student_id: scope.student_id.clone(),
        subject_id: scope.subject_id.clone(),
        academic_year: scope.academic_year.clone(),
        semester: scope.semester,
        weighted_percentage,
        grade: score.grade,
        gpa_points: score.gpa_points,
        is_passing: score.is_pass,
        total_marks,
        total_obtained,
        assessment_count: weighted.len(),
        by_type,
        trend,
    })
}
