//! Drives one recompute of an exam from load to write-back.

use crate::config::EngineConfig;
use crate::engine::types::ExamId;
use crate::engine::{self, ExamInput};
use crate::error::{ChunkWriteError, ConfigurationError, EngineError, StoreError};
use crate::persist::{BatchPersister, RetryFailure, RetryPolicy, RunState};
use crate::store::ResultStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Outcome of a recompute that got as far as writing.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub exam_id: ExamId,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    /// Raw mark rows read plus composite rows produced.
    pub rows_considered: usize,
    pub rows_updated: usize,
    /// Duplicate raw rows, unchanged rows and rows with no target record.
    pub rows_skipped: usize,
    pub outliers: usize,
    pub partial_updates: usize,
    pub chunk_errors: Vec<ChunkWriteError>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl RunSummary {
    /// True when some derived field may still be stale.
    pub fn needs_rerun(&self) -> bool {
        self.state != RunState::Done || !self.chunk_errors.is_empty()
    }
}

/// Recomputes exams against a [`ResultStore`].
///
/// Runs for the same exam are serialized; a second call waits for the first
/// to finish. Different exams proceed concurrently.
pub struct Orchestrator<S: ResultStore> {
    store: Arc<S>,
    config: EngineConfig,
    retry: RetryPolicy,
    locks: Mutex<HashMap<ExamId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: ResultStore> Orchestrator<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            store,
            config,
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn exam_lock(&self, exam_id: ExamId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(exam_id).or_default())
    }

    /// Drops the caller's handle and forgets the exam's lock when no other
    /// run holds or awaits it.
    fn release_lock(&self, exam_id: ExamId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        drop(lock);
        if locks.get(&exam_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&exam_id);
        }
    }

    /// Clears, recomputes and rewrites every derived field of `exam_id`.
    ///
    /// Configuration problems and storage failures while loading or clearing
    /// are returned as errors. Chunk write failures are reported in the
    /// summary, whose state is then [`RunState::Failed`].
    #[tracing::instrument(name = "recompute", skip(self))]
    pub async fn recompute(&self, exam_id: ExamId) -> Result<RunSummary, EngineError> {
        let lock = self.exam_lock(exam_id);
        let result = {
            let _guard = lock.lock().await;
            self.run(exam_id).await
        };
        self.release_lock(exam_id, lock);
        result
    }

    async fn run(&self, exam_id: ExamId) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        let started_at = Utc::now();
        info!("Recompute started");

        let (input, tables) = self.load(exam_id).await?;

        let mut persister =
            BatchPersister::new(self.store.as_ref(), exam_id, self.config.chunk_size, &self.retry);

        let mut state = RunState::Clearing;
        info!(?state, "Run state");
        persister
            .clear()
            .await
            .map_err(|f| storage_error("clear_derived", f))?;

        state = RunState::Computing;
        info!(?state, "Run state");
        let computed = engine::compute(&input, &tables, self.config.legacy_subject_code.as_deref());

        state = RunState::Writing;
        info!(?state, "Run state");
        persister.write_subjects(&computed.subjects).await;
        persister.write_composites(&computed.composites).await;
        let report = persister.finish();

        state = if report.chunk_errors.is_empty() {
            RunState::Done
        } else {
            RunState::Failed
        };

        let summary = RunSummary {
            exam_id,
            state,
            started_at,
            rows_considered: computed.raw_rows + computed.composites.len(),
            rows_updated: report.updated,
            rows_skipped: computed.duplicates + report.skipped,
            outliers: computed.outliers,
            partial_updates: report.partial_updates,
            chunk_errors: report.chunk_errors,
            elapsed: started.elapsed(),
        };

        if summary.needs_rerun() {
            error!(
                ?state,
                chunk_errors = summary.chunk_errors.len(),
                "Recompute finished with failed chunks; rerun required"
            );
        } else {
            info!(
                ?state,
                rows_considered = summary.rows_considered,
                rows_updated = summary.rows_updated,
                rows_skipped = summary.rows_skipped,
                outliers = summary.outliers,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "Recompute finished"
            );
        }
        Ok(summary)
    }

    async fn load(
        &self,
        exam_id: ExamId,
    ) -> Result<(ExamInput, crate::thresholds::ThresholdTables), EngineError> {
        let store = self.store.as_ref();
        let retry = &self.retry;

        let settings = match retry.run("load_settings", || store.load_settings(exam_id)).await {
            Ok(settings) => settings,
            Err(RetryFailure {
                error: StoreError::NotFound(_) | StoreError::Corrupt(_),
                ..
            }) => {
                return Err(ConfigurationError::InvalidSettings {
                    exam_id,
                    reason: "exam settings are missing or unreadable".to_string(),
                }
                .into());
            }
            Err(f) => return Err(storage_error("load_settings", f)),
        };

        let grades = retry
            .run("load_grade_thresholds", || store.load_grade_thresholds(exam_id))
            .await
            .map_err(|f| storage_error("load_grade_thresholds", f))?;
        let divisions = retry
            .run("load_division_thresholds", || store.load_division_thresholds(exam_id))
            .await
            .map_err(|f| storage_error("load_division_thresholds", f))?;

        let tables = crate::thresholds::ThresholdTables::new(exam_id, grades, divisions)
            .inspect_err(|e| warn!(error = %e, "Threshold tables rejected"))?;

        let marks = retry
            .run("load_marks", || store.load_marks(exam_id))
            .await
            .map_err(|f| storage_error("load_marks", f))?;
        let students = retry
            .run("load_students", || store.load_students(exam_id))
            .await
            .map_err(|f| storage_error("load_students", f))?;
        info!(marks = marks.len(), students = students.len(), "Exam loaded");

        Ok((
            ExamInput {
                exam_id,
                settings,
                marks,
                students,
            },
            tables,
        ))
    }
}

fn storage_error(step: &'static str, failure: RetryFailure) -> EngineError {
    error!(step, attempts = failure.attempts, error = %failure.error, "Storage step failed");
    EngineError::Storage {
        step,
        attempts: failure.attempts,
        source: failure.error,
    }
}
