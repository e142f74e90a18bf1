//! Best-K / best-N subject selection.
//!
//! The division selection (K subjects, curriculum dependent) and the
//! averaging selection (N subjects, policy dependent) are separate and must
//! not be mixed up: they feed different derived fields.

use crate::engine::types::AveragingPolicy;
use std::cmp::Ordering;

/// Subjects counted toward a division under the legacy curriculum.
pub const LEGACY_DIVISION_SUBJECTS: usize = 7;
/// Subjects counted toward a division under the current curriculum.
pub const CURRENT_DIVISION_SUBJECTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curriculum {
    Legacy,
    Current,
}

impl Curriculum {
    /// The exam is on the legacy curriculum when any registered subject uses
    /// the designated legacy code.
    pub fn detect<'a, I>(registered_codes: I, legacy_code: Option<&str>) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        match legacy_code {
            Some(legacy) if registered_codes.into_iter().any(|c| c == legacy) => {
                Curriculum::Legacy
            }
            _ => Curriculum::Current,
        }
    }

    /// K: subjects required for a complete division.
    pub fn required_subjects(self) -> usize {
        match self {
            Curriculum::Legacy => LEGACY_DIVISION_SUBJECTS,
            Curriculum::Current => CURRENT_DIVISION_SUBJECTS,
        }
    }
}

/// One registered subject of a student, reduced to what selection needs.
///
/// `mark` is `Some` only for a valid, classified mark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubjectScore<'a> {
    pub subject_code: &'a str,
    pub mark: Option<f64>,
    pub division_points: Option<u32>,
}

impl SubjectScore<'_> {
    pub fn is_valid(&self) -> bool {
        self.mark.is_some()
    }
}

/// Highest mark first; missing marks last; ties by subject code ascending.
fn best_first(a: &SubjectScore<'_>, b: &SubjectScore<'_>) -> Ordering {
    match (a.mark, b.mark) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.subject_code.cmp(b.subject_code))
}

fn top<'a>(scores: &[SubjectScore<'a>], n: usize) -> Vec<SubjectScore<'a>> {
    let mut sorted = scores.to_vec();
    sorted.sort_by(best_first);
    sorted.truncate(n);
    sorted
}

/// The K subjects used for total points and division.
pub fn division_selection<'a>(scores: &[SubjectScore<'a>], k: usize) -> Vec<SubjectScore<'a>> {
    top(scores, k)
}

/// The subjects used for `total_mark`/`avg_mark`: top N for the fixed
/// policies, every registered subject for `Auto`.
pub fn averaging_selection<'a>(
    scores: &[SubjectScore<'a>],
    policy: AveragingPolicy,
) -> Vec<SubjectScore<'a>> {
    match policy.best_n() {
        Some(n) => top(scores, n),
        None => top(scores, scores.len()),
    }
}
