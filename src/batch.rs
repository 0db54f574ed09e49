//! Run many independent report cards or exam statistics on a bounded pool.
//!
//! Each unit reads its own snapshot from the source and shares nothing with
//! its neighbours. Cancellation is cooperative: the flag is checked before a
//! unit starts, and a started unit always runs to completion.

use chrono::NaiveDateTime;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{CalcError, CalcResult};
use crate::exam::{exam_statistics, ExamStatistics};
use crate::report::{compose_report_card, ReportCard, ReportCardExtras, ReportCardRequest};
use crate::source::{ExamSource, GradebookSource};

#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// Finished units, keyed by student or exam id, in request order.
    pub completed: Vec<(String, CalcResult<T>)>,
    /// Ids never started because the batch was cancelled.
    pub skipped: Vec<String>,
}

impl<T> BatchOutcome<T> {
    pub fn was_cancelled(&self) -> bool {
        !self.skipped.is_empty()
    }

    /// Flatten into one result per requested id; skipped units become
    /// `Cancelled` errors after the completed ones.
    pub fn into_results(self) -> Vec<(String, CalcResult<T>)> {
        let mut out = self.completed;
        for id in self.skipped {
            let e = CalcError::cancelled("batch cancelled before this unit started")
                .with_details(serde_json::json!({ "id": id }));
            out.push((id, Err(e)));
        }
        out
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &CalcError)> {
        self.completed
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (id.as_str(), e)))
    }
}

fn build_pool(config: &EngineConfig) -> CalcResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(config.batch_workers.max(1))
        .thread_name(|i| format!("gradecore-batch-{}", i))
        .build()
        .map_err(|e| CalcError::storage(format!("failed to start batch pool: {}", e)))
}

fn run_units<I, T, F>(
    config: &EngineConfig,
    ids: Vec<String>,
    inputs: &[I],
    cancel: &AtomicBool,
    work: F,
) -> CalcResult<BatchOutcome<T>>
where
    I: Sync,
    T: Send,
    F: Fn(&I) -> CalcResult<T> + Sync,
{
    let pool = build_pool(config)?;
    let results: Vec<Option<CalcResult<T>>> = pool.install(|| {
        inputs
            .par_iter()
            .map(|input| {
                if cancel.load(Ordering::Relaxed) {
                    return None;
                }
                Some(work(input))
            })
            .collect()
    });

    let mut completed = Vec::with_capacity(results.len());
    let mut skipped = Vec::new();
    for (id, result) in ids.into_iter().zip(results) {
        match result {
            Some(r) => completed.push((id, r)),
            None => skipped.push(id),
        }
    }
    Ok(BatchOutcome { completed, skipped })
}

pub fn compose_report_cards<S>(
    source: &S,
    requests: &[(ReportCardRequest, ReportCardExtras)],
    config: &EngineConfig,
    cancel: &AtomicBool,
) -> CalcResult<BatchOutcome<ReportCard>>
where
    S: GradebookSource + Sync + ?Sized,
{
    let ids = requests.iter().map(|(r, _)| r.student_id.clone()).collect();
    let outcome = run_units(config, ids, requests, cancel, |(request, extras)| {
        compose_report_card(source, request, extras.clone())
    })?;
    info!(
        workers = config.batch_workers,
        completed = outcome.completed.len(),
        failed = outcome.failures().count(),
        skipped = outcome.skipped.len(),
        "report card batch finished"
    );
    Ok(outcome)
}

pub fn compute_exam_statistics<S>(
    source: &S,
    exam_ids: &[String],
    now: NaiveDateTime,
    config: &EngineConfig,
    cancel: &AtomicBool,
) -> CalcResult<BatchOutcome<ExamStatistics>>
where
    S: ExamSource + Sync + ?Sized,
{
    let outcome = run_units(config, exam_ids.to_vec(), exam_ids, cancel, |exam_id| {
        exam_statistics(source, exam_id, now, config)
    })?;
    info!(
        workers = config.batch_workers,
        completed = outcome.completed.len(),
        failed = outcome.failures().count(),
        skipped = outcome.skipped.len(),
        "exam statistics batch finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{exam, record};
    use crate::model::{ExamOutcome, SubjectInfo};
    use crate::source::memory::{student, MemorySource};

    fn source() -> MemorySource {
        let mut src = MemorySource {
            students: vec![student("s1", "Ada", "1"), student("s2", "Alan", "2")],
            ..Default::default()
        };
        src.subjects.insert(
            "math".to_string(),
            SubjectInfo {
                id: "math".to_string(),
                name: "Mathematics".to_string(),
                code: "MATH".to_string(),
            },
        );
        src.records.push(record("r1", "math", 80.0, 100.0, 50.0));
        let mut other = record("r2", "math", 60.0, 100.0, 50.0);
        other.student_id = "s2".to_string();
        src.records.push(other);
        src.exams.push(exam(100.0, 40.0));
        src.outcomes.push(ExamOutcome {
            exam_id: "e1".to_string(),
            student_id: "s1".to_string(),
            marks_obtained: Some(55.0),
            is_absent: false,
            remarks: None,
        });
        src
    }

    fn request(student_id: &str) -> (ReportCardRequest, ReportCardExtras) {
        (
            ReportCardRequest {
                student_id: student_id.to_string(),
                academic_year: "2025-2026".to_string(),
                semester: None,
            },
            ReportCardExtras::default(),
        )
    }

    fn after_exam() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2025, 11, 1)
            .and_then(|d| d.and_hms_opt(8, 0, 0))
            .expect("dt")
    }

    #[test]
    fn report_cards_keep_request_order_and_isolate_failures() {
        let src = source();
        let config = EngineConfig {
            batch_workers: 2,
            ..Default::default()
        };
        let requests = vec![request("s2"), request("ghost"), request("s1")];
        let out = compose_report_cards(&src, &requests, &config, &AtomicBool::new(false))
            .expect("batch");

        let ids: Vec<&str> = out.completed.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "ghost", "s1"]);
        assert!(!out.was_cancelled());
        let failed: Vec<&str> = out.failures().map(|(id, _)| id).collect();
        assert_eq!(failed, vec!["ghost"]);
        let s1 = out.completed[2].1.as_ref().expect("s1 card");
        assert_eq!(s1.overall_percentage, 80.0);
    }

    #[test]
    fn cancelled_batch_starts_nothing() {
        let src = source();
        let out = compose_report_cards(
            &src,
            &[request("s1"), request("s2")],
            &EngineConfig::default(),
            &AtomicBool::new(true),
        )
        .expect("batch");
        assert!(out.completed.is_empty());
        assert_eq!(out.skipped, vec!["s1".to_string(), "s2".to_string()]);
        assert!(out.was_cancelled());

        let results = out.into_results();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|(_, r)| matches!(r, Err(e) if e.kind == crate::error::ErrorKind::Cancelled)));
    }

    #[test]
    fn exam_batch_reports_missing_exam_as_not_found() {
        let src = source();
        let ids = vec!["e1".to_string(), "nope".to_string()];
        let out = compute_exam_statistics(
            &src,
            &ids,
            after_exam(),
            &EngineConfig::default(),
            &AtomicBool::new(false),
        )
        .expect("batch");
        let stats = out.completed[0].1.as_ref().expect("stats");
        assert_eq!(stats.appeared, 1);
        assert_eq!(stats.passed, 1);
        let err = out.completed[1].1.as_ref().expect_err("missing");
        assert!(err.is_not_found());
    }
}
