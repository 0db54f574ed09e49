use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregate::{summarize_subject, SubjectScope, SubjectSummary};
use crate::error::{CalcError, CalcResult};
use crate::model::{AssessmentRecord, LetterGrade, Semester, StudentProfile, SubjectInfo};
use crate::normalize::{general_letter, round_2_decimals};
use crate::source::{GradebookSource, RecordQuery};
use crate::stats::{analyze_cohort, mean, CohortEntry, CohortStatistics, GeneralScheme};

/// Attendance figures computed elsewhere and embedded verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub total_days: u32,
    pub present_days: u32,
    pub absent_days: u32,
    pub late_days: u32,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardExtras {
    #[serde(default)]
    pub attendance: Option<AttendanceSummary>,
    #[serde(default)]
    pub disciplinary_count: Option<u32>,
    #[serde(default)]
    pub teacher_comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardRequest {
    pub student_id: String,
    pub academic_year: String,
    #[serde(default)]
    pub semester: Option<Semester>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectReport {
    pub subject_name: String,
    pub subject_code: String,
    #[serde(flatten)]
    pub summary: SubjectSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub student: StudentProfile,
    pub academic_year: String,
    pub semester: Option<Semester>,
    pub subjects: Vec<SubjectReport>,
    pub total_subjects: usize,
    pub overall_gpa: f64,
    pub overall_percentage: f64,
    /// `None` when the student has no published records in scope.
    pub overall_grade: Option<LetterGrade>,
    pub attendance: Option<AttendanceSummary>,
    pub disciplinary_count: Option<u32>,
    pub teacher_comments: Option<String>,
}

fn distinct_subjects(records: &[AssessmentRecord]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for r in records {
        if !out.iter().any(|s| *s == r.subject_id) {
            out.push(r.subject_id.clone());
        }
    }
    out
}

fn subject_or_placeholder<S>(source: &S, subject_id: &str) -> CalcResult<SubjectInfo>
where
    S: GradebookSource + ?Sized,
{
    match source.subject(subject_id)? {
        Some(s) => Ok(s),
        None => {
            warn!(subject_id, "records reference a subject missing from the catalog");
            Ok(SubjectInfo {
                id: subject_id.to_string(),
                name: subject_id.to_string(),
                code: subject_id.to_string(),
            })
        }
    }
}

/// Build one consolidated report card. Subjects weigh equally in the overall
/// GPA: the catalog carries no credit hours.
pub fn compose_report_card<S>(
    source: &S,
    request: &ReportCardRequest,
    extras: ReportCardExtras,
) -> CalcResult<ReportCard>
where
    S: GradebookSource + ?Sized,
{
    let Some(student) = source.student(&request.student_id)? else {
        return Err(CalcError::not_found("student not found").with_details(
            serde_json::json!({ "studentId": request.student_id }),
        ));
    };

    let records = source.published_records(&RecordQuery {
        student_id: request.student_id.clone(),
        academic_year: request.academic_year.clone(),
        semester: request.semester,
        subject_id: None,
    })?;

    let mut subjects: Vec<SubjectReport> = Vec::new();
    for subject_id in distinct_subjects(&records) {
        let info = subject_or_placeholder(source, &subject_id)?;
        let summary = summarize_subject(
            &SubjectScope {
                student_id: request.student_id.clone(),
                subject_id,
                academic_year: request.academic_year.clone(),
                semester: request.semester,
            },
            &records,
        )?;
        subjects.push(SubjectReport {
            subject_name: info.name,
            subject_code: info.code,
            summary,
        });
    }
    subjects.sort_by(|a, b| {
        a.subject_name
            .to_ascii_lowercase()
            .cmp(&b.subject_name.to_ascii_lowercase())
            .then_with(|| a.summary.subject_id.cmp(&b.summary.subject_id))
    });

    let gpas: Vec<f64> = subjects.iter().map(|s| s.summary.gpa_points).collect();
    let percents: Vec<f64> = subjects
        .iter()
        .map(|s| s.summary.weighted_percentage)
        .collect();
    let overall_percentage = round_2_decimals(mean(&percents));
    let overall_grade = if subjects.is_empty() {
        None
    } else {
        Some(general_letter(overall_percentage))
    };

    debug!(
        student_id = %request.student_id,
        academic_year = %request.academic_year,
        subjects = subjects.len(),
        "composed report card"
    );

    Ok(ReportCard {
        student,
        academic_year: request.academic_year.clone(),
        semester: request.semester,
        total_subjects: subjects.len(),
        overall_gpa: round_2_decimals(mean(&gpas)),
        overall_percentage,
        overall_grade,
        subjects,
        attendance: extras.attendance,
        disciplinary_count: extras.disciplinary_count,
        teacher_comments: extras.teacher_comments,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSubjectQuery {
    pub subject_id: String,
    pub grade: String,
    #[serde(default)]
    pub section: Option<String>,
    pub academic_year: String,
    #[serde(default)]
    pub semester: Option<Semester>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSubjectStatistics {
    pub subject: SubjectInfo,
    pub grade: String,
    pub section: Option<String>,
    pub academic_year: String,
    pub semester: Option<Semester>,
    pub roster_size: usize,
    pub students_without_records: usize,
    #[serde(flatten)]
    pub statistics: CohortStatistics<LetterGrade>,
}

/// Class-level statistics for one subject over each rostered student's
/// weighted percentage. Students are read and summarized one at a time.
pub fn class_subject_statistics<S>(
    source: &S,
    query: &ClassSubjectQuery,
    top_n: usize,
) -> CalcResult<ClassSubjectStatistics>
where
    S: GradebookSource + ?Sized,
{
    let Some(subject) = source.subject(&query.subject_id)? else {
        return Err(CalcError::not_found("subject not found").with_details(
            serde_json::json!({ "subjectId": query.subject_id }),
        ));
    };

    let roster = source.roster(&query.grade, query.section.as_deref())?;
    let mut entries: Vec<CohortEntry> = Vec::with_capacity(roster.len());
    let mut without_records = 0usize;

    for student in &roster {
        let records = source.published_records(&RecordQuery {
            student_id: student.id.clone(),
            academic_year: query.academic_year.clone(),
            semester: query.semester,
            subject_id: Some(query.subject_id.clone()),
        })?;
        if records.is_empty() {
            without_records += 1;
            continue;
        }
        let summary = summarize_subject(
            &SubjectScope {
                student_id: student.id.clone(),
                subject_id: query.subject_id.clone(),
                academic_year: query.academic_year.clone(),
                semester: query.semester,
            },
            &records,
        )?;
        entries.push(CohortEntry {
            student_id: student.id.clone(),
            name: student.name.clone(),
            roll_number: student.roll_number.clone(),
            percentage: summary.weighted_percentage,
        });
    }

    debug!(
        subject_id = %query.subject_id,
        grade = %query.grade,
        cohort = entries.len(),
        without_records,
        "computed class subject statistics"
    );

    Ok(ClassSubjectStatistics {
        subject,
        grade: query.grade.clone(),
        section: query.section.clone(),
        academic_year: query.academic_year.clone(),
        semester: query.semester,
        roster_size: roster.len(),
        students_without_records: without_records,
        statistics: analyze_cohort(&entries, &GeneralScheme, top_n),
    })
}
