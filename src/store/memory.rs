use super::{ChunkOutcome, ResultStore};
use crate::engine::types::{
    CompositeUpdate, Division, ExamId, ExamSettings, RankMap, RawMark, StudentId, StudentProfile,
    SubjectUpdate,
};
use crate::error::{StoreError, TransientKind};
use crate::thresholds::{DivisionThreshold, GradeThreshold};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Derived fields of a stored subject mark record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredSubject {
    pub overall_mark: Option<f64>,
    pub grade: Option<String>,
    pub grade_points: Option<f64>,
    pub ranks: RankMap,
}

/// Derived fields of a stored student composite record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredResult {
    pub avg_mark: Option<f64>,
    pub total_mark: Option<f64>,
    pub division: Option<Division>,
    pub total_points: Option<u32>,
    pub ranks: RankMap,
}

#[derive(Debug, Default)]
struct ExamData {
    settings: Option<ExamSettings>,
    marks: Vec<RawMark>,
    students: Vec<StudentProfile>,
    grades: Vec<GradeThreshold>,
    divisions: Vec<DivisionThreshold>,
    subjects: BTreeMap<(StudentId, String), StoredSubject>,
    results: BTreeMap<StudentId, StoredResult>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Remaining write calls that fail with a lock timeout.
    transient_writes: usize,
    /// Subject chunks containing one of these students always deadlock.
    poisoned_students: HashSet<StudentId>,
    write_delay: Option<Duration>,
}

/// In-process [`ResultStore`] used by tests and dry runs.
///
/// Failure injection hooks let callers exercise the retry path without a
/// real database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    exams: Mutex<HashMap<ExamId, ExamData>>,
    faults: Mutex<Faults>,
    events: Mutex<Vec<String>>,
}

fn poisoned() -> StoreError {
    StoreError::Backend("memory store mutex poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_exam<T>(
        &self,
        exam_id: ExamId,
        f: impl FnOnce(&mut ExamData) -> T,
    ) -> Result<T, StoreError> {
        let mut exams = self.exams.lock().map_err(|_| poisoned())?;
        Ok(f(exams.entry(exam_id).or_default()))
    }

    fn record(&self, event: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn set_settings(&self, exam_id: ExamId, settings: ExamSettings) {
        let _ = self.with_exam(exam_id, |e| e.settings = Some(settings));
    }

    pub fn set_thresholds(
        &self,
        exam_id: ExamId,
        grades: Vec<GradeThreshold>,
        divisions: Vec<DivisionThreshold>,
    ) {
        let _ = self.with_exam(exam_id, |e| {
            e.grades = grades;
            e.divisions = divisions;
        });
    }

    /// Registers a student for a subject, creating the subject record.
    pub fn add_mark(&self, exam_id: ExamId, mark: RawMark) {
        let _ = self.with_exam(exam_id, |e| {
            e.subjects
                .entry((mark.student_id, mark.subject_code.clone()))
                .or_default();
            e.marks.push(mark);
        });
    }

    /// Inserts or replaces a student's profile.
    pub fn put_student(&self, exam_id: ExamId, profile: StudentProfile) {
        let _ = self.with_exam(exam_id, |e| {
            e.students.retain(|p| p.student_id != profile.student_id);
            e.students.push(profile);
        });
    }

    /// Deletes a subject record out from under the engine.
    pub fn remove_subject_record(&self, exam_id: ExamId, student_id: StudentId, code: &str) {
        let _ = self.with_exam(exam_id, |e| {
            e.subjects.remove(&(student_id, code.to_string()));
        });
    }

    pub fn subject(
        &self,
        exam_id: ExamId,
        student_id: StudentId,
        code: &str,
    ) -> Option<StoredSubject> {
        self.with_exam(exam_id, |e| e.subjects.get(&(student_id, code.to_string())).cloned())
            .ok()
            .flatten()
    }

    pub fn result(&self, exam_id: ExamId, student_id: StudentId) -> Option<StoredResult> {
        self.with_exam(exam_id, |e| e.results.get(&student_id).cloned())
            .ok()
            .flatten()
    }

    /// All derived rows of an exam, for whole-exam comparisons.
    pub fn snapshot(
        &self,
        exam_id: ExamId,
    ) -> (BTreeMap<(StudentId, String), StoredSubject>, BTreeMap<StudentId, StoredResult>) {
        self.with_exam(exam_id, |e| (e.subjects.clone(), e.results.clone()))
            .unwrap_or_default()
    }

    /// The next `n` chunk writes fail with a lock wait timeout.
    pub fn fail_next_writes(&self, n: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.transient_writes = n;
        }
    }

    /// Every subject chunk containing `student_id` fails with a deadlock.
    pub fn poison_student(&self, student_id: StudentId) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.poisoned_students.insert(student_id);
        }
    }

    pub fn set_write_delay(&self, delay: Duration) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.write_delay = Some(delay);
        }
    }

    /// Operation log: `clear`, `subjects` and `composites` entries per exam.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    async fn before_write(&self, students: &[StudentId]) -> Result<(), StoreError> {
        let delay = {
            let mut faults = self.faults.lock().map_err(|_| poisoned())?;
            if faults.transient_writes > 0 {
                faults.transient_writes -= 1;
                return Err(StoreError::Transient {
                    kind: TransientKind::LockTimeout,
                    message: "injected lock wait timeout".to_string(),
                });
            }
            if students.iter().any(|s| faults.poisoned_students.contains(s)) {
                return Err(StoreError::Transient {
                    kind: TransientKind::Deadlock,
                    message: "injected deadlock".to_string(),
                });
            }
            faults.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn load_settings(&self, exam_id: ExamId) -> Result<ExamSettings, StoreError> {
        self.with_exam(exam_id, |e| e.settings.clone())?
            .ok_or_else(|| StoreError::NotFound(format!("exam {exam_id}")))
    }

    async fn load_marks(&self, exam_id: ExamId) -> Result<Vec<RawMark>, StoreError> {
        self.with_exam(exam_id, |e| e.marks.clone())
    }

    async fn load_students(&self, exam_id: ExamId) -> Result<Vec<StudentProfile>, StoreError> {
        self.with_exam(exam_id, |e| e.students.clone())
    }

    async fn load_grade_thresholds(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<GradeThreshold>, StoreError> {
        self.with_exam(exam_id, |e| e.grades.clone())
    }

    async fn load_division_thresholds(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<DivisionThreshold>, StoreError> {
        self.with_exam(exam_id, |e| e.divisions.clone())
    }

    async fn clear_derived(&self, exam_id: ExamId) -> Result<u64, StoreError> {
        self.record(format!("clear:{exam_id}"));
        self.with_exam(exam_id, |e| {
            for subject in e.subjects.values_mut() {
                subject.ranks.clear();
            }
            for result in e.results.values_mut() {
                *result = StoredResult::default();
            }
            (e.subjects.len() + e.results.len()) as u64
        })
    }

    async fn write_subject_chunk(
        &self,
        exam_id: ExamId,
        rows: &[SubjectUpdate],
    ) -> Result<ChunkOutcome, StoreError> {
        let ids: Vec<StudentId> = rows.iter().map(|r| r.student_id).collect();
        self.before_write(&ids).await?;
        self.record(format!("subjects:{exam_id}"));

        self.with_exam(exam_id, |e| {
            let mut outcome = ChunkOutcome::default();
            for row in rows {
                let Some(stored) = e.subjects.get_mut(&(row.student_id, row.subject_code.clone()))
                else {
                    continue;
                };
                outcome.matched += 1;
                let next = StoredSubject {
                    overall_mark: row.overall_mark,
                    grade: row.grade.clone(),
                    grade_points: row.grade_points,
                    ranks: row.ranks.clone(),
                };
                if *stored != next {
                    *stored = next;
                    outcome.changed += 1;
                }
            }
            outcome
        })
    }

    async fn write_composite_chunk(
        &self,
        exam_id: ExamId,
        rows: &[CompositeUpdate],
    ) -> Result<ChunkOutcome, StoreError> {
        self.before_write(&[]).await?;
        self.record(format!("composites:{exam_id}"));

        self.with_exam(exam_id, |e| {
            let mut outcome = ChunkOutcome::default();
            for row in rows {
                outcome.matched += 1;
                let next = StoredResult {
                    avg_mark: row.avg_mark,
                    total_mark: row.total_mark,
                    division: Some(row.division),
                    total_points: row.total_points,
                    ranks: row.ranks.clone(),
                };
                let stored = e.results.entry(row.student_id).or_default();
                if *stored != next {
                    *stored = next;
                    outcome.changed += 1;
                }
            }
            outcome
        })
    }
}
