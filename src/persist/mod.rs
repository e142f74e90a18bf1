//! Chunked, retried writes of derived rows.
//!
//! A run moves through [`RunState`]s: the exam's derived fields are cleared,
//! recomputed, then written back in chunks of `chunk_size` rows, one
//! transaction per chunk. A chunk that keeps failing is recorded as a
//! [`ChunkWriteError`] and the remaining chunks are still written.

pub mod retry;

pub use retry::{RetryFailure, RetryPolicy};

use crate::engine::types::{CompositeUpdate, ExamId, SubjectUpdate};
use crate::error::{ChunkTarget, ChunkWriteError, StoreError};
use crate::store::{ChunkOutcome, ResultStore};
use serde::Serialize;
use tracing::{Instrument, debug, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Clearing,
    Computing,
    Writing,
    Done,
    Failed,
}

/// Counters accumulated over every chunk of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteReport {
    /// Rows whose stored values changed.
    pub updated: usize,
    /// Rows matched but already up to date, plus rows with no target record.
    pub skipped: usize,
    /// Chunks that matched fewer rows than they carried.
    pub partial_updates: usize,
    pub chunk_errors: Vec<ChunkWriteError>,
}

#[derive(Clone, Copy)]
enum Chunk<'r> {
    Subjects(&'r [SubjectUpdate]),
    Composites(&'r [CompositeUpdate]),
}

impl Chunk<'_> {
    fn len(&self) -> usize {
        match self {
            Chunk::Subjects(rows) => rows.len(),
            Chunk::Composites(rows) => rows.len(),
        }
    }

    fn target(&self) -> ChunkTarget {
        match self {
            Chunk::Subjects(_) => ChunkTarget::SubjectMarks,
            Chunk::Composites(_) => ChunkTarget::StudentResults,
        }
    }
}

async fn write_chunk<S>(
    store: &S,
    exam_id: ExamId,
    chunk: Chunk<'_>,
) -> Result<ChunkOutcome, StoreError>
where
    S: ResultStore + ?Sized,
{
    match chunk {
        Chunk::Subjects(rows) => store.write_subject_chunk(exam_id, rows).await,
        Chunk::Composites(rows) => store.write_composite_chunk(exam_id, rows).await,
    }
}

/// Writes an exam's derived rows through a [`ResultStore`].
pub struct BatchPersister<'a, S: ResultStore + ?Sized> {
    store: &'a S,
    exam_id: ExamId,
    chunk_size: usize,
    retry: &'a RetryPolicy,
    report: WriteReport,
}

impl<'a, S: ResultStore + ?Sized> BatchPersister<'a, S> {
    pub fn new(store: &'a S, exam_id: ExamId, chunk_size: usize, retry: &'a RetryPolicy) -> Self {
        Self {
            store,
            exam_id,
            chunk_size: chunk_size.max(1),
            retry,
            report: WriteReport::default(),
        }
    }

    /// Resets every derived ranking and division field of the exam.
    pub async fn clear(&self) -> Result<u64, RetryFailure> {
        let store = self.store;
        let exam_id = self.exam_id;
        let touched = self
            .retry
            .run("clear_derived", || store.clear_derived(exam_id))
            .await?;
        info!(exam_id, touched, "Derived fields cleared");
        Ok(touched)
    }

    pub async fn write_subjects(&mut self, rows: &[SubjectUpdate]) {
        let chunks: Vec<_> = rows.chunks(self.chunk_size).map(Chunk::Subjects).collect();
        self.write_all(chunks).await;
    }

    pub async fn write_composites(&mut self, rows: &[CompositeUpdate]) {
        let chunks: Vec<_> = rows.chunks(self.chunk_size).map(Chunk::Composites).collect();
        self.write_all(chunks).await;
    }

    pub fn finish(self) -> WriteReport {
        self.report
    }

    async fn write_all(&mut self, chunks: Vec<Chunk<'_>>) {
        let store = self.store;
        let exam_id = self.exam_id;

        for (index, chunk) in chunks.into_iter().enumerate() {
            let target = chunk.target();
            let expected = chunk.len();
            let span = info_span!("chunk", ?target, index, rows = expected);

            let result = self
                .retry
                .run("write_chunk", || write_chunk(store, exam_id, chunk))
                .instrument(span)
                .await;

            match result {
                Ok(outcome) => self.record(target, index, expected, outcome),
                Err(RetryFailure { attempts, error }) => {
                    warn!(
                        exam_id,
                        ?target,
                        index,
                        attempts,
                        error = %error,
                        "Chunk write failed; continuing with remaining chunks"
                    );
                    self.report.chunk_errors.push(ChunkWriteError {
                        target,
                        chunk_index: index,
                        rows: expected,
                        attempts,
                        message: error.to_string(),
                    });
                }
            }
        }
    }

    fn record(
        &mut self,
        target: ChunkTarget,
        index: usize,
        expected: usize,
        outcome: ChunkOutcome,
    ) {
        let matched = outcome.matched.min(expected);
        let changed = outcome.changed.min(matched);
        if matched < expected {
            let missing = expected - matched;
            warn!(
                exam_id = self.exam_id,
                ?target,
                index,
                expected,
                matched,
                missing,
                "Partial update: target records missing"
            );
            self.report.partial_updates += 1;
            self.report.skipped += missing;
        }
        self.report.updated += changed;
        self.report.skipped += matched - changed;
        debug!(?target, index, matched, changed, "Chunk written");
    }
}
