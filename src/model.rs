use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{CalcError, CalcResult};

const RUBRIC_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentType {
    Assignment,
    Quiz,
    Test,
    Project,
    Homework,
    Participation,
    Exam,
    Final,
}

impl AssessmentType {
    pub const ALL: [AssessmentType; 8] = [
        Self::Assignment,
        Self::Quiz,
        Self::Test,
        Self::Project,
        Self::Homework,
        Self::Participation,
        Self::Exam,
        Self::Final,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assignment => "assignment",
            Self::Quiz => "quiz",
            Self::Test => "test",
            Self::Project => "project",
            Self::Homework => "homework",
            Self::Participation => "participation",
            Self::Exam => "exam",
            Self::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamType {
    UnitTest,
    Midterm,
    Final,
    Quarterly,
    HalfYearly,
    Annual,
}

impl ExamType {
    pub const ALL: [ExamType; 6] = [
        Self::UnitTest,
        Self::Midterm,
        Self::Final,
        Self::Quarterly,
        Self::HalfYearly,
        Self::Annual,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnitTest => "unit_test",
            Self::Midterm => "midterm",
            Self::Final => "final",
            Self::Quarterly => "quarterly",
            Self::HalfYearly => "half_yearly",
            Self::Annual => "annual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Semester {
    First,
    Second,
    Summer,
}

impl Semester {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Second => "second",
            Self::Summer => "summer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "first" => Some(Self::First),
            "second" => Some(Self::Second),
            "summer" => Some(Self::Summer),
            _ => None,
        }
    }
}

/// Letter on the general-assessment table, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LetterGrade {
    #[serde(rename = "A+")]
    APlus,
    A,
    #[serde(rename = "A-")]
    AMinus,
    #[serde(rename = "B+")]
    BPlus,
    B,
    #[serde(rename = "B-")]
    BMinus,
    #[serde(rename = "C+")]
    CPlus,
    C,
    #[serde(rename = "C-")]
    CMinus,
    #[serde(rename = "D+")]
    DPlus,
    D,
    #[serde(rename = "D-")]
    DMinus,
    F,
}

impl LetterGrade {
    pub const ALL: [LetterGrade; 13] = [
        Self::APlus,
        Self::A,
        Self::AMinus,
        Self::BPlus,
        Self::B,
        Self::BMinus,
        Self::CPlus,
        Self::C,
        Self::CMinus,
        Self::DPlus,
        Self::D,
        Self::DMinus,
        Self::F,
    ];

    pub const WEAKEST: LetterGrade = LetterGrade::F;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::AMinus => "A-",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::BMinus => "B-",
            Self::CPlus => "C+",
            Self::C => "C",
            Self::CMinus => "C-",
            Self::DPlus => "D+",
            Self::D => "D",
            Self::DMinus => "D-",
            Self::F => "F",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.as_str() == s)
    }

    pub fn gpa_points(self) -> f64 {
        match self {
            Self::APlus | Self::A => 4.0,
            Self::AMinus => 3.7,
            Self::BPlus => 3.3,
            Self::B => 3.0,
            Self::BMinus => 2.7,
            Self::CPlus => 2.3,
            Self::C => 2.0,
            Self::CMinus => 1.7,
            Self::DPlus => 1.3,
            Self::D => 1.0,
            Self::DMinus => 0.7,
            Self::F => 0.0,
        }
    }
}

/// Letter on the 5-band exam table. `Absent` is never produced from a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExamGrade {
    A,
    B,
    C,
    D,
    F,
    #[serde(rename = "ABS")]
    Absent,
}

impl ExamGrade {
    pub const BANDS: [ExamGrade; 5] = [Self::A, Self::B, Self::C, Self::D, Self::F];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
            Self::Absent => "ABS",
        }
    }
}

/// Percentage cut points for the exam table. Each threshold is the lowest
/// percentage that still earns the band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingScale {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub f: f64,
}

impl Default for GradingScale {
    fn default() -> Self {
        Self {
            a: 90.0,
            b: 80.0,
            c: 70.0,
            d: 60.0,
            f: 0.0,
        }
    }
}

impl GradingScale {
    pub fn new(a: f64, b: f64, c: f64, d: f64, f: f64) -> CalcResult<Self> {
        let scale = Self { a, b, c, d, f };
        scale.validate()?;
        Ok(scale)
    }

    pub fn validate(&self) -> CalcResult<()> {
        let cuts = [self.a, self.b, self.c, self.d, self.f];
        if cuts.iter().any(|v| !v.is_finite()) {
            return Err(CalcError::validation("grading scale thresholds must be finite numbers"));
        }
        let descending = cuts.windows(2).all(|w| w[0] > w[1]);
        if !descending {
            return Err(
                CalcError::validation("grading scale must be strictly descending A>B>C>D>F")
                    .with_details(json!({ "thresholds": cuts })),
            );
        }
        Ok(())
    }

    pub fn grade_for(&self, percentage: f64) -> ExamGrade {
        if percentage >= self.a {
            ExamGrade::A
        } else if percentage >= self.b {
            ExamGrade::B
        } else if percentage >= self.c {
            ExamGrade::C
        } else if percentage >= self.d {
            ExamGrade::D
        } else {
            ExamGrade::F
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricCriterion {
    pub criterion: String,
    pub max_points: f64,
    pub earned_points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentRecord {
    pub id: String,
    pub student_id: String,
    pub subject_id: String,
    pub teacher_id: String,
    pub academic_year: String,
    pub semester: Semester,
    pub title: String,
    pub assessment_type: AssessmentType,
    pub marks_obtained: f64,
    pub total_marks: f64,
    pub weightage: f64,
    pub graded_date: NaiveDate,
    #[serde(default)]
    pub due_date: Option<NaiveDateTime>,
    #[serde(default)]
    pub submitted_date: Option<NaiveDateTime>,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_extra_credit: bool,
    #[serde(default)]
    pub rubric: Vec<RubricCriterion>,
}

impl AssessmentRecord {
    /// Whether the record may take part in any aggregation.
    pub fn is_countable(&self) -> bool {
        self.is_published && !self.is_deleted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamDefinition {
    pub id: String,
    pub name: String,
    pub subject_id: String,
    pub grade: String,
    #[serde(default)]
    pub section: Option<String>,
    pub academic_year: String,
    pub exam_type: ExamType,
    pub exam_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub total_marks: f64,
    pub passing_marks: f64,
    #[serde(default)]
    pub grading_scale: Option<GradingScale>,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub results_published: bool,
}

impl ExamDefinition {
    pub fn scale(&self) -> GradingScale {
        self.grading_scale.unwrap_or_default()
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.exam_date.and_time(self.start_time)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.exam_date.and_time(self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamOutcome {
    pub exam_id: String,
    pub student_id: String,
    #[serde(default)]
    pub marks_obtained: Option<f64>,
    #[serde(default)]
    pub is_absent: bool,
    #[serde(default)]
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub roll_number: Option<String>,
    pub grade: String,
    #[serde(default)]
    pub section: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectInfo {
    pub id: String,
    pub name: String,
    pub code: String,
}

fn field_error(field: &str, message: impl Into<String>) -> CalcError {
    CalcError::validation(message).with_details(json!({ "field": field }))
}

pub fn validate_record(record: &AssessmentRecord) -> CalcResult<()> {
    if !record.total_marks.is_finite() || record.total_marks <= 0.0 {
        return Err(field_error("totalMarks", "totalMarks must be greater than 0"));
    }
    if !record.marks_obtained.is_finite() || record.marks_obtained < 0.0 {
        return Err(field_error(
            "marksObtained",
            "marksObtained must be a non-negative number",
        ));
    }
    if !record.is_extra_credit && record.marks_obtained > record.total_marks {
        return Err(field_error(
            "marksObtained",
            "marksObtained cannot exceed totalMarks",
        ));
    }
    if !(0.0..=100.0).contains(&record.weightage) {
        return Err(field_error("weightage", "weightage must be between 0 and 100"));
    }

    if !record.rubric.is_empty() {
        let max_sum: f64 = record.rubric.iter().map(|c| c.max_points).sum();
        let earned_sum: f64 = record.rubric.iter().map(|c| c.earned_points).sum();
        if (max_sum - record.total_marks).abs() > RUBRIC_TOLERANCE {
            return Err(CalcError::validation(
                "rubric maxPoints must sum to totalMarks",
            )
            .with_details(json!({ "field": "rubric", "maxPoints": max_sum, "totalMarks": record.total_marks })));
        }
        if (earned_sum - record.marks_obtained).abs() > RUBRIC_TOLERANCE {
            return Err(CalcError::validation(
                "rubric earnedPoints must sum to marksObtained",
            )
            .with_details(json!({ "field": "rubric", "earnedPoints": earned_sum, "marksObtained": record.marks_obtained })));
        }
        if let Some(c) = record.rubric.iter().find(|c| c.earned_points > c.max_points) {
            return Err(field_error(
                "rubric",
                format!("criterion '{}' earns more than its maxPoints", c.criterion),
            ));
        }
    }
    Ok(())
}

pub fn validate_exam(exam: &ExamDefinition) -> CalcResult<()> {
    if !exam.total_marks.is_finite() || exam.total_marks <= 0.0 {
        return Err(field_error("totalMarks", "totalMarks must be greater than 0"));
    }
    if !exam.passing_marks.is_finite() || exam.passing_marks < 0.0 {
        return Err(field_error(
            "passingMarks",
            "passingMarks must be a non-negative number",
        ));
    }
    if exam.passing_marks > exam.total_marks {
        return Err(field_error(
            "passingMarks",
            "passingMarks cannot exceed totalMarks",
        ));
    }
    if exam.end_time <= exam.start_time {
        return Err(field_error("endTime", "endTime must be after startTime"));
    }
    if let Some(scale) = &exam.grading_scale {
        scale.validate()?;
    }
    Ok(())
}

pub fn validate_outcome(exam: &ExamDefinition, outcome: &ExamOutcome) -> CalcResult<()> {
    if outcome.exam_id != exam.id {
        return Err(field_error("examId", "outcome does not belong to this exam"));
    }
    if outcome.is_absent {
        return Ok(());
    }
    if let Some(m) = outcome.marks_obtained {
        if !m.is_finite() || m < 0.0 || m > exam.total_marks {
            return Err(field_error(
                "marksObtained",
                "marksObtained must be between 0 and the exam's totalMarks",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn record(id: &str, subject: &str, marks: f64, total: f64, weightage: f64) -> AssessmentRecord {
        AssessmentRecord {
            id: id.to_string(),
            student_id: "s1".to_string(),
            subject_id: subject.to_string(),
            teacher_id: "t1".to_string(),
            academic_year: "2025-2026".to_string(),
            semester: Semester::First,
            title: format!("Item {}", id),
            assessment_type: AssessmentType::Test,
            marks_obtained: marks,
            total_marks: total,
            weightage,
            graded_date: NaiveDate::from_ymd_opt(2025, 9, 1).expect("date"),
            due_date: None,
            submitted_date: None,
            is_published: true,
            is_deleted: false,
            is_extra_credit: false,
            rubric: Vec::new(),
        }
    }

    pub fn exam(total: f64, passing: f64) -> ExamDefinition {
        ExamDefinition {
            id: "e1".to_string(),
            name: "Midterm".to_string(),
            subject_id: "math".to_string(),
            grade: "10".to_string(),
            section: Some("A".to_string()),
            academic_year: "2025-2026".to_string(),
            exam_type: ExamType::Midterm,
            exam_date: NaiveDate::from_ymd_opt(2025, 10, 15).expect("date"),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).expect("time"),
            end_time: NaiveTime::from_hms_opt(11, 0, 0).expect("time"),
            total_marks: total,
            passing_marks: passing,
            grading_scale: None,
            is_published: true,
            results_published: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{exam, record};
    use super::*;
    use crate::error::ErrorKind;

    fn field_of(e: &CalcError) -> Option<&str> {
        e.details.as_ref().and_then(|d| d.get("field")).and_then(|v| v.as_str())
    }

    #[test]
    fn enums_round_trip_through_their_codes() {
        for t in AssessmentType::ALL {
            assert_eq!(AssessmentType::parse(t.as_str()), Some(t));
        }
        for g in LetterGrade::ALL {
            assert_eq!(LetterGrade::parse(g.as_str()), Some(g));
        }
        assert_eq!(ExamType::parse("half_yearly"), Some(ExamType::HalfYearly));
        assert_eq!(AssessmentType::parse("lab"), None);
    }

    #[test]
    fn letter_grades_serialize_with_symbols() {
        let v = serde_json::to_value(LetterGrade::BMinus).expect("serialize");
        assert_eq!(v, "B-");
        let v = serde_json::to_value(ExamGrade::Absent).expect("serialize");
        assert_eq!(v, "ABS");
    }

    #[test]
    fn weightage_outside_range_is_rejected() {
        let mut r = record("r1", "math", 10.0, 20.0, 101.0);
        let e = validate_record(&r).expect_err("weightage above 100");
        assert_eq!(e.kind, ErrorKind::Validation);
        assert_eq!(field_of(&e), Some("weightage"));

        r.weightage = -1.0;
        assert!(validate_record(&r).is_err());
        r.weightage = 0.0;
        assert!(validate_record(&r).is_ok());
    }

    #[test]
    fn marks_above_total_only_allowed_for_extra_credit() {
        let mut r = record("r1", "math", 22.0, 20.0, 10.0);
        assert!(validate_record(&r).is_err());
        r.is_extra_credit = true;
        assert!(validate_record(&r).is_ok());
    }

    #[test]
    fn rubric_sums_must_match_marks() {
        let mut r = record("r1", "math", 15.0, 20.0, 10.0);
        r.rubric = vec![
            RubricCriterion {
                criterion: "Clarity".to_string(),
                max_points: 10.0,
                earned_points: 8.0,
            },
            RubricCriterion {
                criterion: "Accuracy".to_string(),
                max_points: 10.0,
                earned_points: 7.0,
            },
        ];
        assert!(validate_record(&r).is_ok());

        r.marks_obtained = 14.0;
        let e = validate_record(&r).expect_err("earned mismatch");
        assert_eq!(field_of(&e), Some("rubric"));

        r.marks_obtained = 15.0;
        r.total_marks = 25.0;
        assert!(validate_record(&r).is_err());
    }

    #[test]
    fn zero_total_marks_is_a_validation_error() {
        let r = record("r1", "math", 0.0, 0.0, 10.0);
        let e = validate_record(&r).expect_err("zero total");
        assert_eq!(field_of(&e), Some("totalMarks"));
    }

    #[test]
    fn scale_must_be_strictly_descending() {
        assert!(GradingScale::new(85.0, 75.0, 65.0, 50.0, 0.0).is_ok());
        assert!(GradingScale::new(85.0, 85.0, 65.0, 50.0, 0.0).is_err());
        assert!(GradingScale::new(60.0, 70.0, 80.0, 90.0, 0.0).is_err());
    }

    #[test]
    fn passing_marks_cannot_exceed_total() {
        let mut e = exam(100.0, 40.0);
        assert!(validate_exam(&e).is_ok());
        e.passing_marks = 120.0;
        let err = validate_exam(&e).expect_err("passing > total");
        assert_eq!(field_of(&err), Some("passingMarks"));

        e.passing_marks = 40.0;
        e.grading_scale = Some(GradingScale {
            a: 80.0,
            b: 90.0,
            c: 70.0,
            d: 60.0,
            f: 0.0,
        });
        assert!(validate_exam(&e).is_err());
    }

    #[test]
    fn outcome_marks_must_fit_exam_total() {
        let e = exam(50.0, 20.0);
        let mut o = ExamOutcome {
            exam_id: "e1".to_string(),
            student_id: "s1".to_string(),
            marks_obtained: Some(51.0),
            is_absent: false,
            remarks: None,
        };
        assert!(validate_outcome(&e, &o).is_err());
        o.is_absent = true;
        assert!(validate_outcome(&e, &o).is_ok());
        o.exam_id = "other".to_string();
        assert!(validate_outcome(&e, &o).is_err());
    }
}
