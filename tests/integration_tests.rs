use async_trait::async_trait;
use exam_ranker::config::EngineConfig;
use exam_ranker::engine::ExamInput;
use exam_ranker::engine::types::{
    AveragingPolicy, CompositeUpdate, Division, ExamId, ExamSettings, Geography, Ownership,
    Position, RankField, RawMark, Scope, Sex, Split, StudentProfile, SubjectUpdate,
};
use exam_ranker::error::{ChunkTarget, ConfigurationError, EngineError, StoreError};
use exam_ranker::persist::RunState;
use exam_ranker::store::{ChunkOutcome, MemoryStore, ResultStore, SqliteStore};
use exam_ranker::thresholds::{DivisionThreshold, GradeThreshold};
use exam_ranker::{Orchestrator, output};
use std::sync::Arc;
use std::time::Duration;

const EXAM: i64 = 7;
const SUBJECTS: [&str; 8] = ["BIO", "CHE", "CIV", "ENG", "GEO", "HIS", "KIS", "MAT"];

fn grades() -> Vec<GradeThreshold> {
    [
        (75.0, 100.0, "A", 1),
        (65.0, 74.9, "B", 2),
        (45.0, 64.9, "C", 3),
        (30.0, 44.9, "D", 4),
        (0.0, 29.9, "F", 5),
    ]
    .into_iter()
    .map(|(lower, upper, grade, points)| GradeThreshold {
        lower_bound: lower,
        upper_bound: upper,
        grade: grade.to_string(),
        grade_points: points as f64,
        division_points: points,
    })
    .collect()
}

fn divisions() -> Vec<DivisionThreshold> {
    [(8, 17, "I"), (18, 21, "II"), (22, 25, "III"), (26, 33, "IV"), (34, 40, "0")]
        .into_iter()
        .map(|(lowest, highest, label)| DivisionThreshold {
            lowest_points: lowest,
            highest_points: highest,
            division: label.to_string(),
        })
        .collect()
}

fn profile(student_id: i64, sex: Sex, ward: Option<&str>) -> StudentProfile {
    StudentProfile {
        student_id,
        sex: Some(sex),
        ownership: Some(if student_id % 2 == 0 {
            Ownership::Private
        } else {
            Ownership::Government
        }),
        geography: Geography {
            region: Some("Mwanza".into()),
            council: Some("Ilemela".into()),
            ward: ward.map(str::to_string),
            centre: Some("S1201".into()),
        },
    }
}

/// Six students across two wards with distinct averages.
fn exam_input() -> ExamInput {
    let mut marks = Vec::new();
    let mut students = Vec::new();
    for student_id in 1..=6 {
        let base = 40.0 + student_id as f64 * 8.0;
        for (i, code) in SUBJECTS.iter().enumerate() {
            marks.push(RawMark {
                student_id,
                subject_code: code.to_string(),
                theory_mark: Some(base + i as f64),
                practical_mark: None,
                has_practical: false,
            });
        }
        let sex = if student_id % 3 == 0 { Sex::Male } else { Sex::Female };
        let ward = if student_id <= 3 { "Buswelu" } else { "Kirumba" };
        students.push(profile(student_id, sex, Some(ward)));
    }
    ExamInput {
        exam_id: EXAM,
        settings: ExamSettings {
            averaging_policy: AveragingPolicy::Auto,
            legacy_subject_code: None,
        },
        marks,
        students,
    }
}

fn memory_store(input: &ExamInput) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.set_settings(input.exam_id, input.settings.clone());
    store.set_thresholds(input.exam_id, grades(), divisions());
    for mark in &input.marks {
        store.add_mark(input.exam_id, mark.clone());
    }
    for student in &input.students {
        store.put_student(input.exam_id, student.clone());
    }
    store
}

fn config(chunk_size: usize, max_attempts: u32) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.chunk_size = chunk_size;
    config.retry.max_attempts = max_attempts;
    config.retry.initial_delay_ms = 2;
    config.retry.max_delay_ms = 4;
    config
}

const WARD: RankField = RankField::new(Scope::Ward, Split::All);
const GLOBAL: RankField = RankField::new(Scope::Global, Split::All);

#[tokio::test]
async fn test_recompute_is_idempotent() {
    let store = memory_store(&exam_input());
    let orchestrator = Orchestrator::new(store.clone(), config(5, 3));

    let first = orchestrator.recompute(EXAM).await.unwrap();
    assert_eq!(first.state, RunState::Done);
    assert_eq!(first.rows_considered, 48 + 6);
    assert_eq!(first.rows_updated, 54);
    let before = store.snapshot(EXAM);

    let second = orchestrator.recompute(EXAM).await.unwrap();
    assert_eq!(second.state, RunState::Done);
    assert_eq!(store.snapshot(EXAM), before);
    // clearing drops every rank, so each row is rewritten with identical values
    assert_eq!(second.rows_updated, 54);
    assert_eq!(second.rows_skipped, 0);
}

#[tokio::test]
async fn test_rankings_and_divisions_written() {
    let store = memory_store(&exam_input());
    let orchestrator = Orchestrator::new(store.clone(), config(500, 3));
    orchestrator.recompute(EXAM).await.unwrap();

    // student 6 has the highest marks: 88..=95
    let top = store.result(EXAM, 6).unwrap();
    assert_eq!(top.ranks[&GLOBAL], Position { rank: 1, out_of: 6 });
    assert_eq!(top.ranks[&WARD], Position { rank: 1, out_of: 3 });
    assert_eq!(top.division, Some(Division::I));
    assert_eq!(top.avg_mark, Some(91.5));

    let by_sex = RankField::new(Scope::Global, Split::Sex);
    let male = store.result(EXAM, 3).unwrap();
    assert_eq!(male.ranks[&by_sex], Position { rank: 2, out_of: 2 });

    let maths = store.subject(EXAM, 1, "MAT").unwrap();
    assert_eq!(maths.overall_mark, Some(55.0));
    assert_eq!(maths.grade.as_deref(), Some("C"));
    assert_eq!(maths.ranks[&GLOBAL], Position { rank: 6, out_of: 6 });
}

#[tokio::test]
async fn test_stale_ward_ranks_cleared_after_move() {
    let input = exam_input();
    let store = memory_store(&input);
    let orchestrator = Orchestrator::new(store.clone(), config(500, 3));
    orchestrator.recompute(EXAM).await.unwrap();
    assert!(store.result(EXAM, 1).unwrap().ranks.contains_key(&WARD));

    store.put_student(EXAM, profile(1, Sex::Female, None));
    orchestrator.recompute(EXAM).await.unwrap();

    let moved = store.result(EXAM, 1).unwrap();
    assert!(!moved.ranks.contains_key(&WARD));
    assert!(moved.ranks.contains_key(&RankField::new(Scope::Council, Split::All)));
    assert!(
        !store
            .subject(EXAM, 1, "BIO")
            .unwrap()
            .ranks
            .contains_key(&WARD)
    );
    assert_eq!(store.result(EXAM, 2).unwrap().ranks[&WARD].out_of, 2);
}

#[tokio::test]
async fn test_transient_write_errors_are_retried() {
    let store = memory_store(&exam_input());
    store.fail_next_writes(3);
    let orchestrator = Orchestrator::new(store.clone(), config(10, 5));

    let summary = orchestrator.recompute(EXAM).await.unwrap();
    assert_eq!(summary.state, RunState::Done);
    assert!(summary.chunk_errors.is_empty());
    assert!(store.result(EXAM, 4).unwrap().division.is_some());
}

#[tokio::test]
async fn test_exhausted_chunk_fails_run_but_siblings_persist() {
    let store = memory_store(&exam_input());
    store.poison_student(2);
    let orchestrator = Orchestrator::new(store.clone(), config(8, 2));

    let summary = orchestrator.recompute(EXAM).await.unwrap();
    assert_eq!(summary.state, RunState::Failed);
    assert!(summary.needs_rerun());
    assert_eq!(summary.chunk_errors.len(), 1);
    let err = &summary.chunk_errors[0];
    assert_eq!(err.target, ChunkTarget::SubjectMarks);
    assert_eq!(err.chunk_index, 1);
    assert_eq!(err.attempts, 2);

    assert!(store.subject(EXAM, 2, "MAT").unwrap().grade.is_none());
    assert!(store.subject(EXAM, 3, "MAT").unwrap().grade.is_some());
    assert!(store.result(EXAM, 2).unwrap().division.is_some());
}

#[tokio::test]
async fn test_configuration_error_writes_nothing() {
    let store = memory_store(&exam_input());
    store.set_thresholds(EXAM, grades(), vec![]);
    let orchestrator = Orchestrator::new(store.clone(), config(500, 3));

    let err = orchestrator.recompute(EXAM).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Configuration(ConfigurationError::MissingDivisionThresholds { exam_id: EXAM })
    ));
    assert!(store.events().is_empty());
}

#[tokio::test]
async fn test_overlapping_thresholds_rejected_before_clearing() {
    let store = memory_store(&exam_input());
    let mut overlapping = grades();
    overlapping[1].upper_bound = 80.0;
    store.set_thresholds(EXAM, overlapping, divisions());
    let orchestrator = Orchestrator::new(store.clone(), config(500, 3));

    assert!(matches!(
        orchestrator.recompute(EXAM).await,
        Err(EngineError::Configuration(_))
    ));
    assert!(store.events().is_empty());
}

#[tokio::test]
async fn test_concurrent_runs_of_same_exam_are_serialized() {
    let store = memory_store(&exam_input());
    store.set_write_delay(Duration::from_millis(5));
    let orchestrator = Orchestrator::new(store.clone(), config(16, 3));

    let (a, b) = tokio::join!(orchestrator.recompute(EXAM), orchestrator.recompute(EXAM));
    assert_eq!(a.unwrap().state, RunState::Done);
    assert_eq!(b.unwrap().state, RunState::Done);

    let events = store.events();
    let clears: Vec<_> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.starts_with("clear"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(clears.len(), 2);
    // 48 subject rows in chunks of 16, then 6 composites in one chunk
    assert_eq!(clears[1] - clears[0], 1 + 3 + 1);
    assert_eq!(events.len(), 10);
}

#[tokio::test]
async fn test_missing_subject_record_counts_as_partial_update() {
    let store = memory_store(&exam_input());
    store.remove_subject_record(EXAM, 5, "GEO");
    let orchestrator = Orchestrator::new(store.clone(), config(500, 3));

    let summary = orchestrator.recompute(EXAM).await.unwrap();
    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.partial_updates, 1);
    assert_eq!(summary.rows_updated, 47 + 6);
    assert_eq!(summary.rows_skipped, 1);
}

#[tokio::test]
async fn test_sqlite_round_trip_and_export() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("exam.db");
    let input = exam_input();
    let store = SqliteStore::open(&db).unwrap();
    store.import(&input, &grades(), &divisions()).await.unwrap();

    let orchestrator = Orchestrator::new(Arc::new(store), config(20, 3));
    let first = orchestrator.recompute(EXAM).await.unwrap();
    assert_eq!(first.state, RunState::Done);
    assert_eq!(first.rows_updated, 54);

    let rows = orchestrator.store().student_results(EXAM).await.unwrap();
    assert_eq!(rows.len(), 6);
    let top = rows.iter().find(|r| r.student_id == 6).unwrap();
    assert_eq!(top.division.as_deref(), Some("I"));
    assert_eq!(top.ranks[&GLOBAL], Position { rank: 1, out_of: 6 });

    let subjects = orchestrator.store().subject_results(EXAM).await.unwrap();
    assert_eq!(subjects.len(), 48);
    assert!(subjects.iter().all(|s| s.grade.is_some()));

    // a fresh connection sees the same rows
    let reopened = SqliteStore::open(&db).unwrap();
    assert_eq!(reopened.student_results(EXAM).await.unwrap(), rows);

    let second = orchestrator.recompute(EXAM).await.unwrap();
    assert_eq!(second.state, RunState::Done);
    assert_eq!(orchestrator.store().student_results(EXAM).await.unwrap(), rows);

    let csv_path = dir.path().join("results.csv");
    output::export_results(&csv_path, &rows).unwrap();
    let csv = std::fs::read_to_string(&csv_path).unwrap();
    assert_eq!(csv.lines().count(), 7);
    assert!(csv.lines().next().unwrap().starts_with("student_id,division"));
}

#[tokio::test]
async fn test_sqlite_missing_thresholds_is_configuration_error() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.import(&exam_input(), &grades(), &[]).await.unwrap();
    let orchestrator = Orchestrator::new(Arc::new(store), config(500, 3));

    assert!(matches!(
        orchestrator.recompute(EXAM).await,
        Err(EngineError::Configuration(
            ConfigurationError::MissingDivisionThresholds { .. }
        ))
    ));
    let rows = orchestrator.store().subject_results(EXAM).await.unwrap();
    assert!(rows.iter().all(|r| r.overall_mark.is_none()));
}

/// Drops one subject record right after the derived fields are cleared, the
/// way a concurrent writer deleting an entry mid-run would.
struct DeleteAfterClear {
    inner: SqliteStore,
    student_id: i64,
    subject_code: &'static str,
}

#[async_trait]
impl ResultStore for DeleteAfterClear {
    async fn load_settings(&self, exam_id: ExamId) -> Result<ExamSettings, StoreError> {
        self.inner.load_settings(exam_id).await
    }

    async fn load_marks(&self, exam_id: ExamId) -> Result<Vec<RawMark>, StoreError> {
        self.inner.load_marks(exam_id).await
    }

    async fn load_students(&self, exam_id: ExamId) -> Result<Vec<StudentProfile>, StoreError> {
        self.inner.load_students(exam_id).await
    }

    async fn load_grade_thresholds(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<GradeThreshold>, StoreError> {
        self.inner.load_grade_thresholds(exam_id).await
    }

    async fn load_division_thresholds(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<DivisionThreshold>, StoreError> {
        self.inner.load_division_thresholds(exam_id).await
    }

    async fn clear_derived(&self, exam_id: ExamId) -> Result<u64, StoreError> {
        let touched = self.inner.clear_derived(exam_id).await?;
        self.inner
            .delete_subject_record(exam_id, self.student_id, self.subject_code)
            .await?;
        Ok(touched)
    }

    async fn write_subject_chunk(
        &self,
        exam_id: ExamId,
        rows: &[SubjectUpdate],
    ) -> Result<ChunkOutcome, StoreError> {
        self.inner.write_subject_chunk(exam_id, rows).await
    }

    async fn write_composite_chunk(
        &self,
        exam_id: ExamId,
        rows: &[CompositeUpdate],
    ) -> Result<ChunkOutcome, StoreError> {
        self.inner.write_composite_chunk(exam_id, rows).await
    }
}

#[tokio::test]
async fn test_sqlite_subject_record_deleted_mid_run_is_partial_update() {
    let inner = SqliteStore::open_in_memory().unwrap();
    inner.import(&exam_input(), &grades(), &divisions()).await.unwrap();
    let store = DeleteAfterClear {
        inner,
        student_id: 5,
        subject_code: "GEO",
    };
    let orchestrator = Orchestrator::new(Arc::new(store), config(500, 3));

    let summary = orchestrator.recompute(EXAM).await.unwrap();
    assert_eq!(summary.state, RunState::Done);
    assert!(!summary.needs_rerun());
    assert_eq!(summary.partial_updates, 1);
    assert_eq!(summary.rows_skipped, 1);
    assert_eq!(summary.rows_updated, 47 + 6);

    let subjects = orchestrator.store().inner.subject_results(EXAM).await.unwrap();
    assert_eq!(subjects.len(), 47);
    assert!(!subjects.iter().any(|s| s.student_id == 5 && s.subject_code == "GEO"));
    let results = orchestrator.store().inner.student_results(EXAM).await.unwrap();
    assert!(results.iter().all(|r| r.division.is_some()));
}

#[tokio::test]
async fn test_two_band_grade_table_grades_what_it_covers() {
    let input = exam_input();
    let store = memory_store(&input);
    let two_bands = vec![
        GradeThreshold {
            lower_bound: 75.0,
            upper_bound: 100.0,
            grade: "A".into(),
            grade_points: 1.0,
            division_points: 1,
        },
        GradeThreshold {
            lower_bound: 65.0,
            upper_bound: 74.9,
            grade: "B".into(),
            grade_points: 2.0,
            division_points: 2,
        },
    ];
    store.set_thresholds(EXAM, two_bands, divisions());
    let orchestrator = Orchestrator::new(store.clone(), config(500, 3));

    let summary = orchestrator.recompute(EXAM).await.unwrap();
    assert_eq!(summary.state, RunState::Done);
    // students 1 and 2 sit below 65 in every subject, student 3 in one
    assert_eq!(summary.outliers, 8 + 8 + 1);

    let low = store.subject(EXAM, 1, "MAT").unwrap();
    assert_eq!(low.overall_mark, Some(55.0));
    assert_eq!(low.grade, None);
    let mid = store.subject(EXAM, 3, "MAT").unwrap();
    assert_eq!(mid.grade.as_deref(), Some("B"));
    assert_eq!(mid.grade_points, Some(2.0));
    assert_eq!(store.subject(EXAM, 6, "MAT").unwrap().grade.as_deref(), Some("A"));
}
