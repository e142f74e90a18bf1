use super::{ChunkOutcome, ResultStore};
use crate::engine::ExamInput;
use crate::engine::types::{
    AveragingPolicy, CompositeUpdate, ExamId, ExamSettings, Geography, Ownership, Position,
    RankField, RankMap, RawMark, Scope, Sex, Split, StudentId, StudentProfile, SubjectUpdate,
};
use crate::error::StoreError;
use crate::thresholds::{DivisionThreshold, GradeThreshold};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A student's composite record with its ranks, as read back for export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentResultRow {
    pub student_id: StudentId,
    pub avg_mark: Option<f64>,
    pub total_mark: Option<f64>,
    pub division: Option<String>,
    pub total_points: Option<u32>,
    #[serde(skip)]
    pub ranks: RankMap,
}

/// A subject mark record's derived fields, as read back.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectResultRow {
    pub student_id: StudentId,
    pub subject_code: String,
    pub overall_mark: Option<f64>,
    pub grade: Option<String>,
    pub grade_points: Option<f64>,
    pub ranks: RankMap,
}

/// [`ResultStore`] backed by a single SQLite connection.
///
/// Calls run on the blocking pool. Each chunk write is one transaction, so a
/// failed chunk leaves no partial rows behind.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                StoreError::Backend("sqlite connection mutex poisoned".to_string())
            })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }

    /// Replaces an exam's settings, thresholds, students and raw marks.
    ///
    /// Derived columns of imported marks start out null.
    pub async fn import(
        &self,
        input: &ExamInput,
        grades: &[GradeThreshold],
        divisions: &[DivisionThreshold],
    ) -> Result<(), StoreError> {
        let input = input.clone();
        let grades = grades.to_vec();
        let divisions = divisions.to_vec();
        self.call(move |conn| import_exam(conn, &input, &grades, &divisions)).await
    }

    /// Deletes one subject mark record and its ranks.
    pub async fn delete_subject_record(
        &self,
        exam_id: ExamId,
        student_id: StudentId,
        subject_code: &str,
    ) -> Result<(), StoreError> {
        let subject_code = subject_code.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            for table in ["subject_ranks", "subject_marks"] {
                tx.execute(
                    &format!(
                        "DELETE FROM {table}
                         WHERE exam_id = ?1 AND student_id = ?2 AND subject_code = ?3"
                    ),
                    params![exam_id, student_id, subject_code],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Composite records of an exam ordered by student id.
    pub async fn student_results(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<StudentResultRow>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT student_id, avg_mark, total_mark, division, total_points
                 FROM student_results WHERE exam_id = ?1 ORDER BY student_id",
            )?;
            let rows = stmt
                .query_map([exam_id], |row| {
                    Ok(StudentResultRow {
                        student_id: row.get(0)?,
                        avg_mark: row.get(1)?,
                        total_mark: row.get(2)?,
                        division: row.get(3)?,
                        total_points: row.get(4)?,
                        ranks: RankMap::new(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let mut ranks = load_rank_rows(
                conn,
                "SELECT student_id, '', scope, split, rank, out_of
                 FROM result_ranks WHERE exam_id = ?1",
                exam_id,
            )?;
            Ok(rows
                .into_iter()
                .map(|mut row| {
                    if let Some(r) = ranks.remove(&(row.student_id, String::new())) {
                        row.ranks = r;
                    }
                    row
                })
                .collect())
        })
        .await
    }

    /// Subject mark records of an exam ordered by student id, then subject code.
    pub async fn subject_results(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<SubjectResultRow>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT student_id, subject_code, overall_mark, grade, grade_points
                 FROM subject_marks WHERE exam_id = ?1 ORDER BY student_id, subject_code",
            )?;
            let rows = stmt
                .query_map([exam_id], |row| {
                    Ok(SubjectResultRow {
                        student_id: row.get(0)?,
                        subject_code: row.get(1)?,
                        overall_mark: row.get(2)?,
                        grade: row.get(3)?,
                        grade_points: row.get(4)?,
                        ranks: RankMap::new(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let mut ranks = load_rank_rows(
                conn,
                "SELECT student_id, subject_code, scope, split, rank, out_of
                 FROM subject_ranks WHERE exam_id = ?1",
                exam_id,
            )?;
            Ok(rows
                .into_iter()
                .map(|mut row| {
                    if let Some(r) = ranks.remove(&(row.student_id, row.subject_code.clone())) {
                        row.ranks = r;
                    }
                    row
                })
                .collect())
        })
        .await
    }
}

fn import_exam(
    conn: &mut Connection,
    input: &ExamInput,
    grades: &[GradeThreshold],
    divisions: &[DivisionThreshold],
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    let exam_id = input.exam_id;
    for table in [
        "subject_ranks",
        "result_ranks",
        "student_results",
        "subject_marks",
        "students",
        "grade_thresholds",
        "division_thresholds",
    ] {
        tx.execute(&format!("DELETE FROM {table} WHERE exam_id = ?1"), [exam_id])?;
    }
    tx.execute(
        "INSERT INTO exams (exam_id, averaging_policy, legacy_subject_code)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(exam_id) DO UPDATE SET
            averaging_policy = excluded.averaging_policy,
            legacy_subject_code = excluded.legacy_subject_code",
        params![
            exam_id,
            policy_str(input.settings.averaging_policy),
            input.settings.legacy_subject_code
        ],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO grade_thresholds
                (exam_id, grade, lower_bound, upper_bound, grade_points, division_points)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for g in grades {
            stmt.execute(params![
                exam_id,
                g.grade,
                g.lower_bound,
                g.upper_bound,
                g.grade_points,
                g.division_points
            ])?;
        }
        let mut stmt = tx.prepare(
            "INSERT INTO division_thresholds (exam_id, division, lowest_points, highest_points)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for d in divisions {
            stmt.execute(params![exam_id, d.division, d.lowest_points, d.highest_points])?;
        }
        let mut stmt = tx.prepare(
            "INSERT INTO students
                (exam_id, student_id, sex, ownership, centre, ward, council, region)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for s in &input.students {
            stmt.execute(params![
                exam_id,
                s.student_id,
                s.sex.map(Sex::as_str),
                s.ownership.map(Ownership::as_str),
                s.geography.centre,
                s.geography.ward,
                s.geography.council,
                s.geography.region
            ])?;
        }
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO subject_marks
                (exam_id, student_id, subject_code, theory_mark, practical_mark, has_practical)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for m in &input.marks {
            stmt.execute(params![
                exam_id,
                m.student_id,
                m.subject_code,
                m.theory_mark,
                m.practical_mark,
                m.has_practical
            ])?;
        }
    }
    tx.commit()?;
    debug!(
        exam_id,
        students = input.students.len(),
        marks = input.marks.len(),
        "Exam imported"
    );
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS exams (
            exam_id INTEGER PRIMARY KEY,
            averaging_policy TEXT NOT NULL,
            legacy_subject_code TEXT
        );
        CREATE TABLE IF NOT EXISTS students (
            exam_id INTEGER NOT NULL,
            student_id INTEGER NOT NULL,
            sex TEXT,
            ownership TEXT,
            centre TEXT,
            ward TEXT,
            council TEXT,
            region TEXT,
            PRIMARY KEY (exam_id, student_id)
        );
        CREATE TABLE IF NOT EXISTS subject_marks (
            exam_id INTEGER NOT NULL,
            student_id INTEGER NOT NULL,
            subject_code TEXT NOT NULL,
            theory_mark REAL,
            practical_mark REAL,
            has_practical INTEGER NOT NULL DEFAULT 0,
            overall_mark REAL,
            grade TEXT,
            grade_points REAL,
            PRIMARY KEY (exam_id, student_id, subject_code)
        );
        CREATE TABLE IF NOT EXISTS grade_thresholds (
            exam_id INTEGER NOT NULL,
            grade TEXT NOT NULL,
            lower_bound REAL NOT NULL,
            upper_bound REAL NOT NULL,
            grade_points REAL NOT NULL,
            division_points INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS division_thresholds (
            exam_id INTEGER NOT NULL,
            division TEXT NOT NULL,
            lowest_points INTEGER NOT NULL,
            highest_points INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS student_results (
            exam_id INTEGER NOT NULL,
            student_id INTEGER NOT NULL,
            avg_mark REAL,
            total_mark REAL,
            division TEXT,
            total_points INTEGER,
            PRIMARY KEY (exam_id, student_id)
        );
        CREATE TABLE IF NOT EXISTS subject_ranks (
            exam_id INTEGER NOT NULL,
            student_id INTEGER NOT NULL,
            subject_code TEXT NOT NULL,
            scope TEXT NOT NULL,
            split TEXT NOT NULL,
            rank INTEGER NOT NULL,
            out_of INTEGER NOT NULL,
            PRIMARY KEY (exam_id, student_id, subject_code, scope, split)
        );
        CREATE TABLE IF NOT EXISTS result_ranks (
            exam_id INTEGER NOT NULL,
            student_id INTEGER NOT NULL,
            scope TEXT NOT NULL,
            split TEXT NOT NULL,
            rank INTEGER NOT NULL,
            out_of INTEGER NOT NULL,
            PRIMARY KEY (exam_id, student_id, scope, split)
        );
        ",
    )?;
    Ok(())
}

fn policy_str(policy: AveragingPolicy) -> &'static str {
    match policy {
        AveragingPolicy::SevenBest => "SEVEN_BEST",
        AveragingPolicy::EightBest => "EIGHT_BEST",
        AveragingPolicy::Auto => "AUTO",
    }
}

fn parse_field(scope: &str, split: &str) -> Result<RankField, StoreError> {
    let scope: Scope = scope.parse().map_err(StoreError::Corrupt)?;
    let split: Split = split.parse().map_err(StoreError::Corrupt)?;
    Ok(RankField::new(scope, split))
}

/// Groups rank rows by (student id, subject code). The query must select
/// exactly those two key columns followed by scope, split, rank and out_of.
fn load_rank_rows(
    conn: &Connection,
    sql: &str,
    exam_id: ExamId,
) -> Result<std::collections::HashMap<(StudentId, String), RankMap>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map([exam_id], |row| {
            Ok((
                row.get::<_, StudentId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, u32>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grouped = std::collections::HashMap::<(StudentId, String), RankMap>::new();
    for (student_id, code, scope, split, rank, out_of) in raw {
        grouped
            .entry((student_id, code))
            .or_default()
            .insert(parse_field(&scope, &split)?, Position { rank, out_of });
    }
    Ok(grouped)
}

/// Rewrites a record's rank rows when they differ from `ranks`.
/// Returns whether anything changed.
fn replace_ranks(
    tx: &Transaction<'_>,
    exam_id: ExamId,
    student_id: StudentId,
    subject_code: Option<&str>,
    ranks: &RankMap,
) -> Result<bool, StoreError> {
    let mut current = RankMap::new();
    {
        let mut stmt;
        let mut rows = match subject_code {
            Some(code) => {
                stmt = tx.prepare_cached(
                    "SELECT scope, split, rank, out_of FROM subject_ranks
                     WHERE exam_id = ?1 AND student_id = ?2 AND subject_code = ?3",
                )?;
                stmt.query(params![exam_id, student_id, code])?
            }
            None => {
                stmt = tx.prepare_cached(
                    "SELECT scope, split, rank, out_of FROM result_ranks
                     WHERE exam_id = ?1 AND student_id = ?2",
                )?;
                stmt.query(params![exam_id, student_id])?
            }
        };
        while let Some(row) = rows.next()? {
            let scope: String = row.get(0)?;
            let split: String = row.get(1)?;
            current.insert(
                parse_field(&scope, &split)?,
                Position {
                    rank: row.get(2)?,
                    out_of: row.get(3)?,
                },
            );
        }
    }
    if current == *ranks {
        return Ok(false);
    }

    match subject_code {
        Some(code) => {
            tx.prepare_cached(
                "DELETE FROM subject_ranks
                 WHERE exam_id = ?1 AND student_id = ?2 AND subject_code = ?3",
            )?
            .execute(params![exam_id, student_id, code])?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO subject_ranks
                    (exam_id, student_id, subject_code, scope, split, rank, out_of)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (field, pos) in ranks {
                insert.execute(params![
                    exam_id,
                    student_id,
                    code,
                    field.scope.as_str(),
                    field.split.as_str(),
                    pos.rank,
                    pos.out_of
                ])?;
            }
        }
        None => {
            tx.prepare_cached("DELETE FROM result_ranks WHERE exam_id = ?1 AND student_id = ?2")?
                .execute(params![exam_id, student_id])?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO result_ranks (exam_id, student_id, scope, split, rank, out_of)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (field, pos) in ranks {
                insert.execute(params![
                    exam_id,
                    student_id,
                    field.scope.as_str(),
                    field.split.as_str(),
                    pos.rank,
                    pos.out_of
                ])?;
            }
        }
    }
    Ok(true)
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn load_settings(&self, exam_id: ExamId) -> Result<ExamSettings, StoreError> {
        self.call(move |conn| {
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT averaging_policy, legacy_subject_code FROM exams WHERE exam_id = ?1",
                    [exam_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (policy, legacy_subject_code) =
                row.ok_or_else(|| StoreError::NotFound(format!("exam {exam_id}")))?;
            Ok(ExamSettings {
                averaging_policy: policy.parse().map_err(StoreError::Corrupt)?,
                legacy_subject_code: blank_to_none(legacy_subject_code),
            })
        })
        .await
    }

    async fn load_marks(&self, exam_id: ExamId) -> Result<Vec<RawMark>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT student_id, subject_code, theory_mark, practical_mark, has_practical
                 FROM subject_marks WHERE exam_id = ?1",
            )?;
            let marks = stmt
                .query_map([exam_id], |row| {
                    Ok(RawMark {
                        student_id: row.get(0)?,
                        subject_code: row.get(1)?,
                        theory_mark: row.get(2)?,
                        practical_mark: row.get(3)?,
                        has_practical: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(marks)
        })
        .await
    }

    async fn load_students(&self, exam_id: ExamId) -> Result<Vec<StudentProfile>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT student_id, sex, ownership, centre, ward, council, region
                 FROM students WHERE exam_id = ?1",
            )?;
            let raw = stmt
                .query_map([exam_id], |row| {
                    Ok((
                        row.get::<_, StudentId>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        Geography {
                            centre: blank_to_none(row.get(3)?),
                            ward: blank_to_none(row.get(4)?),
                            council: blank_to_none(row.get(5)?),
                            region: blank_to_none(row.get(6)?),
                        },
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(student_id, sex, ownership, geography)| {
                    let sex = blank_to_none(sex)
                        .map(|s| s.parse::<Sex>())
                        .transpose()
                        .map_err(StoreError::Corrupt)?;
                    let ownership = ownership
                        .map(|o| o.parse::<Ownership>())
                        .transpose()
                        .map_err(StoreError::Corrupt)?;
                    Ok(StudentProfile {
                        student_id,
                        sex,
                        ownership,
                        geography,
                    })
                })
                .collect()
        })
        .await
    }

    async fn load_grade_thresholds(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<GradeThreshold>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT lower_bound, upper_bound, grade, grade_points, division_points
                 FROM grade_thresholds WHERE exam_id = ?1",
            )?;
            let rows = stmt
                .query_map([exam_id], |row| {
                    Ok(GradeThreshold {
                        lower_bound: row.get(0)?,
                        upper_bound: row.get(1)?,
                        grade: row.get(2)?,
                        grade_points: row.get(3)?,
                        division_points: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn load_division_thresholds(
        &self,
        exam_id: ExamId,
    ) -> Result<Vec<DivisionThreshold>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT lowest_points, highest_points, division
                 FROM division_thresholds WHERE exam_id = ?1",
            )?;
            let rows = stmt
                .query_map([exam_id], |row| {
                    Ok(DivisionThreshold {
                        lowest_points: row.get(0)?,
                        highest_points: row.get(1)?,
                        division: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn clear_derived(&self, exam_id: ExamId) -> Result<u64, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut touched = 0;
            touched += tx.execute("DELETE FROM subject_ranks WHERE exam_id = ?1", [exam_id])?;
            touched += tx.execute("DELETE FROM result_ranks WHERE exam_id = ?1", [exam_id])?;
            touched += tx.execute(
                "UPDATE student_results
                 SET avg_mark = NULL, total_mark = NULL, division = NULL, total_points = NULL
                 WHERE exam_id = ?1",
                [exam_id],
            )?;
            tx.commit()?;
            Ok(touched as u64)
        })
        .await
    }

    async fn write_subject_chunk(
        &self,
        exam_id: ExamId,
        rows: &[SubjectUpdate],
    ) -> Result<ChunkOutcome, StoreError> {
        let rows = rows.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut outcome = ChunkOutcome::default();
            {
                let mut exists = tx.prepare_cached(
                    "SELECT 1 FROM subject_marks
                     WHERE exam_id = ?1 AND student_id = ?2 AND subject_code = ?3",
                )?;
                let mut update = tx.prepare_cached(
                    "UPDATE subject_marks SET overall_mark = ?4, grade = ?5, grade_points = ?6
                     WHERE exam_id = ?1 AND student_id = ?2 AND subject_code = ?3
                       AND (overall_mark IS NOT ?4 OR grade IS NOT ?5 OR grade_points IS NOT ?6)",
                )?;
                for row in &rows {
                    if !exists.exists(params![exam_id, row.student_id, row.subject_code])? {
                        continue;
                    }
                    outcome.matched += 1;
                    let fields_changed = update.execute(params![
                        exam_id,
                        row.student_id,
                        row.subject_code,
                        row.overall_mark,
                        row.grade,
                        row.grade_points
                    ])? > 0;
                    let ranks_changed = replace_ranks(
                        &tx,
                        exam_id,
                        row.student_id,
                        Some(&row.subject_code),
                        &row.ranks,
                    )?;
                    if fields_changed || ranks_changed {
                        outcome.changed += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn write_composite_chunk(
        &self,
        exam_id: ExamId,
        rows: &[CompositeUpdate],
    ) -> Result<ChunkOutcome, StoreError> {
        let rows = rows.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut outcome = ChunkOutcome::default();
            {
                let mut upsert = tx.prepare_cached(
                    "INSERT INTO student_results
                        (exam_id, student_id, avg_mark, total_mark, division, total_points)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(exam_id, student_id) DO UPDATE SET
                        avg_mark = excluded.avg_mark,
                        total_mark = excluded.total_mark,
                        division = excluded.division,
                        total_points = excluded.total_points
                     WHERE avg_mark IS NOT excluded.avg_mark
                        OR total_mark IS NOT excluded.total_mark
                        OR division IS NOT excluded.division
                        OR total_points IS NOT excluded.total_points",
                )?;
                for row in &rows {
                    outcome.matched += 1;
                    let fields_changed = upsert.execute(params![
                        exam_id,
                        row.student_id,
                        row.avg_mark,
                        row.total_mark,
                        row.division.as_str(),
                        row.total_points
                    ])? > 0;
                    let ranks_changed =
                        replace_ranks(&tx, exam_id, row.student_id, None, &row.ranks)?;
                    if fields_changed || ranks_changed {
                        outcome.changed += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Division;
    use crate::thresholds::tests::{division, grade};

    fn exam() -> ExamInput {
        ExamInput {
            exam_id: 9,
            settings: ExamSettings {
                averaging_policy: AveragingPolicy::Auto,
                legacy_subject_code: None,
            },
            marks: vec![RawMark {
                student_id: 1,
                subject_code: "PHY".into(),
                theory_mark: Some(60.0),
                practical_mark: Some(80.0),
                has_practical: true,
            }],
            students: vec![StudentProfile {
                student_id: 1,
                sex: Some(Sex::Female),
                ownership: Some(Ownership::Private),
                geography: Geography {
                    region: Some("Arusha".into()),
                    council: Some("Meru".into()),
                    ward: Some("  ".into()),
                    centre: Some("S0101".into()),
                },
            }],
        }
    }

    async fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .import(
                &exam(),
                &[grade(0.0, 100.0, "A", 1)],
                &[division(0, 40, "I")],
            )
            .await
            .unwrap();
        store
    }

    fn global(rank: u32, out_of: u32) -> RankMap {
        RankMap::from([(RankField::new(Scope::Global, Split::All), Position { rank, out_of })])
    }

    #[tokio::test]
    async fn test_loads_imported_exam() {
        let store = store().await;
        let settings = store.load_settings(9).await.unwrap();
        assert_eq!(settings.averaging_policy, AveragingPolicy::Auto);

        let students = store.load_students(9).await.unwrap();
        assert_eq!(students[0].sex, Some(Sex::Female));
        assert_eq!(students[0].geography.ward, None);

        let marks = store.load_marks(9).await.unwrap();
        assert_eq!(marks, exam().marks);
        assert_eq!(store.load_grade_thresholds(9).await.unwrap().len(), 1);
        assert_eq!(store.load_division_thresholds(9).await.unwrap()[0].division, "I");
    }

    #[tokio::test]
    async fn test_missing_exam_is_not_found() {
        let store = store().await;
        assert!(matches!(
            store.load_settings(404).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subject_write_reports_matches_and_changes() {
        let store = store().await;
        let update = SubjectUpdate {
            student_id: 1,
            subject_code: "PHY".into(),
            overall_mark: Some(73.33),
            grade: Some("A".into()),
            grade_points: Some(1.0),
            ranks: global(1, 1),
        };
        let ghost = SubjectUpdate {
            subject_code: "CHE".into(),
            ..update.clone()
        };

        let first = store
            .write_subject_chunk(9, &[update.clone(), ghost])
            .await
            .unwrap();
        assert_eq!(first, ChunkOutcome { matched: 1, changed: 1 });

        let again = store.write_subject_chunk(9, &[update]).await.unwrap();
        assert_eq!(again, ChunkOutcome { matched: 1, changed: 0 });

        let rows = store.subject_results(9).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].overall_mark, Some(73.33));
        assert_eq!(rows[0].ranks, global(1, 1));
    }

    #[tokio::test]
    async fn test_composite_upsert_and_clear() {
        let store = store().await;
        let update = CompositeUpdate {
            student_id: 1,
            avg_mark: Some(73.33),
            total_mark: Some(73.33),
            division: Division::I,
            total_points: Some(1),
            ranks: global(1, 1),
        };
        let outcome = store.write_composite_chunk(9, &[update]).await.unwrap();
        assert_eq!(outcome.changed, 1);

        let rows = store.student_results(9).await.unwrap();
        assert_eq!(rows[0].division.as_deref(), Some("I"));
        assert_eq!(rows[0].ranks, global(1, 1));

        store.clear_derived(9).await.unwrap();
        let rows = store.student_results(9).await.unwrap();
        assert_eq!(rows[0].division, None);
        assert_eq!(rows[0].avg_mark, None);
        assert!(rows[0].ranks.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_subject_record_is_skipped_on_write() {
        let store = store().await;
        let update = SubjectUpdate {
            student_id: 1,
            subject_code: "PHY".into(),
            overall_mark: Some(73.33),
            grade: Some("A".into()),
            grade_points: Some(1.0),
            ranks: global(1, 1),
        };
        store.write_subject_chunk(9, &[update.clone()]).await.unwrap();

        store.delete_subject_record(9, 1, "PHY").await.unwrap();
        assert!(store.subject_results(9).await.unwrap().is_empty());
        assert!(store.load_marks(9).await.unwrap().is_empty());

        let outcome = store.write_subject_chunk(9, &[update]).await.unwrap();
        assert_eq!(outcome, ChunkOutcome { matched: 0, changed: 0 });
    }
}
