//! Storage seam for the engine.
//!
//! [`ResultStore`] is the async trait the orchestrator reads raw rows from
//! and writes derived rows back to. [`MemoryStore`] keeps everything in
//! process (and can inject failures); [`SqliteStore`] persists to an SQLite
//! database with one transaction per chunk.

mod memory;
mod sqlite;

pub use memory::{MemoryStore, StoredResult, StoredSubject};
pub use sqlite::{SqliteStore, StudentResultRow, SubjectResultRow};

use crate::engine::types::{
    CompositeUpdate, ExamId, ExamSettings, RawMark, StudentProfile, SubjectUpdate,
};
use crate::error::StoreError;
use crate::thresholds::{DivisionThreshold, GradeThreshold};
use async_trait::async_trait;

/// Row counts reported by a chunk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Target rows found by key.
    pub matched: usize,
    /// Matched rows whose stored values actually changed.
    pub changed: usize,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn load_settings(&self, exam_id: ExamId) -> Result<ExamSettings, StoreError>;

    async fn load_marks(&self, exam_id: ExamId) -> Result<Vec<RawMark>, StoreError>;

    async fn load_students(&self, exam_id: ExamId) -> Result<Vec<StudentProfile>, StoreError>;

    async fn load_grade_thresholds(&self, exam_id: ExamId)
    -> Result<Vec<GradeThreshold>, StoreError>;

    async fn load_division_thresholds(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<DivisionThreshold>, StoreError>;

    /// Resets every derived ranking and division field of the exam.
    /// Returns the number of rows touched.
    async fn clear_derived(&self, exam_id: ExamId) -> Result<u64, StoreError>;

    /// Updates existing subject mark records by key. Rows with no matching
    /// record are not inserted.
    async fn write_subject_chunk(
        &self,
        exam_id: ExamId,
        rows: &[SubjectUpdate],
    ) -> Result<ChunkOutcome, StoreError>;

    /// Upserts student composite records by key.
    async fn write_composite_chunk(
        &self,
        exam_id: ExamId,
        rows: &[CompositeUpdate],
    ) -> Result<ChunkOutcome, StoreError>;
}
