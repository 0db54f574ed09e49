//! Grade computation engine: score normalization, weighted subject averages,
//! cohort statistics, report cards and exam outcomes, with a SQLite-backed
//! gradebook as the default storage collaborator.

pub mod aggregate;
pub mod batch;
pub mod config;
pub mod db;
pub mod error;
pub mod exam;
pub mod model;
pub mod normalize;
pub mod report;
pub mod source;
pub mod stats;

pub use config::EngineConfig;
pub use db::SqliteGradebook;
pub use error::{CalcError, CalcResult, ErrorKind};
pub use source::{ExamSource, GradebookSource};
