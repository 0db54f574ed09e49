//! Collaborator seams. The composer and exam calculator receive these
//! explicitly; nothing in the engine looks records up on its own.

use serde::Serialize;

use crate::error::CalcResult;
use crate::model::{AssessmentRecord, ExamDefinition, ExamOutcome, Semester, StudentProfile, SubjectInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordQuery {
    pub student_id: String,
    pub academic_year: String,
    pub semester: Option<Semester>,
    pub subject_id: Option<String>,
}

/// One outcome joined with the roster fields shown next to it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRow {
    pub outcome: ExamOutcome,
    pub student_name: String,
    pub roll_number: Option<String>,
}

pub trait GradebookSource {
    fn student(&self, student_id: &str) -> CalcResult<Option<StudentProfile>>;

    fn subject(&self, subject_id: &str) -> CalcResult<Option<SubjectInfo>>;

    /// Published, non-deleted records matching `query`, read as one snapshot.
    /// Records are returned in graded-date order.
    fn published_records(&self, query: &RecordQuery) -> CalcResult<Vec<AssessmentRecord>>;

    /// Students in a grade (and optional section), in roll order.
    fn roster(&self, grade: &str, section: Option<&str>) -> CalcResult<Vec<StudentProfile>>;
}

pub trait ExamSource {
    fn exam(&self, exam_id: &str) -> CalcResult<Option<ExamDefinition>>;

    /// Feed every outcome of an exam to `visit`, in roster order, reading at
    /// most `chunk_size` rows from storage at a time.
    fn visit_outcomes(
        &self,
        exam_id: &str,
        chunk_size: usize,
        visit: &mut dyn FnMut(OutcomeRow) -> CalcResult<()>,
    ) -> CalcResult<()>;
}
