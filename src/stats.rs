//! Cohort-level descriptive statistics over per-student percentages.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

use crate::model::{ExamGrade, GradingScale, LetterGrade};
use crate::normalize::{general_letter, round_2_decimals, GENERAL_PASS_PERCENTAGE};

/// A letter table the analyzer can bucket a cohort by.
pub trait GradeScheme {
    type Grade: Copy + Eq + Hash + Serialize;

    fn grade(&self, percentage: f64) -> Self::Grade;

    /// Every letter a percentage can map to, best first.
    fn bands(&self) -> Vec<Self::Grade>;
}

/// The 13-letter general-assessment table.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneralScheme;

impl GradeScheme for GeneralScheme {
    type Grade = LetterGrade;

    fn grade(&self, percentage: f64) -> LetterGrade {
        general_letter(percentage)
    }

    fn bands(&self) -> Vec<LetterGrade> {
        LetterGrade::ALL.to_vec()
    }
}

impl GradeScheme for GradingScale {
    type Grade = ExamGrade;

    fn grade(&self, percentage: f64) -> ExamGrade {
        self.grade_for(percentage)
    }

    fn bands(&self) -> Vec<ExamGrade> {
        ExamGrade::BANDS.to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortEntry {
    pub student_id: String,
    pub name: String,
    pub roll_number: Option<String>,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedEntry<G> {
    pub student_id: String,
    pub name: String,
    pub roll_number: Option<String>,
    pub percentage: f64,
    pub grade: G,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBucket<G> {
    pub grade: G,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBucket {
    pub label: String,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortStatistics<G> {
    pub count: usize,
    pub mean: f64,
    pub max: f64,
    pub min: f64,
    pub median: f64,
    pub std_dev: f64,
    pub passing_percentage: f64,
    pub grade_distribution: Vec<GradeBucket<G>>,
    pub histogram: Vec<HistogramBucket>,
    pub top: Vec<RankedEntry<G>>,
    pub bottom: Vec<RankedEntry<G>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankOrder {
    Highest,
    Lowest,
}

/// `part / whole * 100`, or 0 for an empty whole.
pub fn ratio_percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64) * 100.0 / (whole as f64)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / (values.len() as f64)
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

/// Population standard deviation. Zero for fewer than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() as f64);
    var.sqrt()
}

/// Decile bucket for a percentage: 0-10 is bucket 0, then (10k, 10k+10] is bucket k.
pub fn histogram_index(percentage: f64) -> usize {
    if percentage <= 10.0 {
        return 0;
    }
    let idx = (percentage / 10.0).ceil() as usize - 1;
    idx.min(9)
}

pub fn histogram(values: &[f64]) -> Vec<HistogramBucket> {
    let mut counts = [0usize; 10];
    for v in values {
        counts[histogram_index(*v)] += 1;
    }
    counts
        .iter()
        .enumerate()
        .map(|(i, count)| {
            let (min, max) = if i == 0 {
                (0.0, 10.0)
            } else {
                ((i * 10 + 1) as f64, ((i + 1) * 10) as f64)
            };
            HistogramBucket {
                label: format!("{}-{}", min, max),
                min,
                max,
                count: *count,
            }
        })
        .collect()
}

/// Indices of the first `n` values in rank order. Ties keep input order.
pub fn ranked_indices(values: &[f64], n: usize, order: RankOrder) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|a, b| {
        let ord = values[*a]
            .partial_cmp(&values[*b])
            .unwrap_or(Ordering::Equal);
        match order {
            RankOrder::Highest => ord.reverse(),
            RankOrder::Lowest => ord,
        }
    });
    idx.truncate(n);
    idx
}

pub fn grade_distribution<S: GradeScheme>(values: &[f64], scheme: &S) -> Vec<GradeBucket<S::Grade>> {
    let mut counts: HashMap<S::Grade, usize> = HashMap::new();
    for v in values {
        *counts.entry(scheme.grade(*v)).or_insert(0) += 1;
    }
    scheme
        .bands()
        .into_iter()
        .map(|g| {
            let count = counts.get(&g).copied().unwrap_or(0);
            GradeBucket {
                grade: g,
                count,
                percentage: round_2_decimals(ratio_percent(count, values.len())),
            }
        })
        .collect()
}

pub fn analyze_cohort<S: GradeScheme>(
    entries: &[CohortEntry],
    scheme: &S,
    top_n: usize,
) -> CohortStatistics<S::Grade> {
    let values: Vec<f64> = entries.iter().map(|e| e.percentage).collect();
    let passing = values
        .iter()
        .filter(|v| **v >= GENERAL_PASS_PERCENTAGE)
        .count();

    let (max, min) = if values.is_empty() {
        (0.0, 0.0)
    } else {
        (
            values.iter().copied().fold(f64::MIN, f64::max),
            values.iter().copied().fold(f64::MAX, f64::min),
        )
    };

    let ranked = |order: RankOrder| -> Vec<RankedEntry<S::Grade>> {
        ranked_indices(&values, top_n, order)
            .into_iter()
            .map(|i| {
                let e = &entries[i];
                RankedEntry {
                    student_id: e.student_id.clone(),
                    name: e.name.clone(),
                    roll_number: e.roll_number.clone(),
                    percentage: e.percentage,
                    grade: scheme.grade(e.percentage),
                }
            })
            .collect()
    };

    CohortStatistics {
        count: values.len(),
        mean: round_2_decimals(mean(&values)),
        max,
        min,
        median: round_2_decimals(median(&values)),
        std_dev: round_2_decimals(std_dev(&values)),
        passing_percentage: round_2_decimals(ratio_percent(passing, values.len())),
        grade_distribution: grade_distribution(&values, scheme),
        histogram: histogram(&values),
        top: ranked(RankOrder::Highest),
        bottom: ranked(RankOrder::Lowest),
    }
}
