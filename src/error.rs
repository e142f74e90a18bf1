//! Error taxonomy for a recompute run.
//!
//! Only [`ConfigurationError`] and [`EngineError`] abort a run. Chunk write
//! failures are collected into the run summary as [`ChunkWriteError`] values.

use crate::engine::types::ExamId;
use serde::Serialize;
use thiserror::Error;

/// Threshold or exam setup problems detected before any write.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("exam {exam_id} has no grade thresholds")]
    MissingGradeThresholds { exam_id: ExamId },

    #[error("exam {exam_id} has no division thresholds")]
    MissingDivisionThresholds { exam_id: ExamId },

    #[error("grade threshold '{grade}' is malformed: {reason}")]
    InvalidGradeThreshold { grade: String, reason: String },

    #[error("grade thresholds overlap between '{upper}' and '{lower}'")]
    OverlappingGradeThresholds { upper: String, lower: String },

    #[error("division threshold '{label}' is malformed: {reason}")]
    InvalidDivisionThreshold { label: String, reason: String },

    #[error("exam {exam_id}: {reason}")]
    InvalidSettings { exam_id: ExamId, reason: String },
}

/// Why a transient storage error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    LockTimeout,
    Deadlock,
}

/// Errors surfaced by a [`crate::store::ResultStore`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("transient storage error ({kind:?}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Backend(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Lock wait timeouts and deadlocks are worth retrying; nothing else is.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) => StoreError::Transient {
                kind: TransientKind::LockTimeout,
                message: err.to_string(),
            },
            Some(rusqlite::ErrorCode::DatabaseLocked) => StoreError::Transient {
                kind: TransientKind::Deadlock,
                message: err.to_string(),
            },
            _ if matches!(err, rusqlite::Error::QueryReturnedNoRows) => {
                StoreError::NotFound(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// Which derived table a chunk targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkTarget {
    SubjectMarks,
    StudentResults,
}

/// A chunk that still failed after the retry budget was spent.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{target:?} chunk {chunk_index} ({rows} rows) failed after {attempts} attempts: {message}")]
pub struct ChunkWriteError {
    pub target: ChunkTarget,
    pub chunk_index: usize,
    pub rows: usize,
    pub attempts: u32,
    pub message: String,
}

/// Fatal errors returned by [`crate::orchestrator::Orchestrator::recompute`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("{step} failed after {attempts} attempts: {source}")]
    Storage {
        step: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}
