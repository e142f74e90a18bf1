use crate::engine::select::{SubjectScore, averaging_selection, division_selection};
use crate::engine::types::{AveragingPolicy, Division};
use crate::engine::utility::{round2, sum};
use crate::thresholds::ThresholdTables;
use tracing::warn;

/// Composite result for one student before ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    pub division: Division,
    pub total_points: Option<u32>,
    pub total_mark: Option<f64>,
    pub avg_mark: Option<f64>,
}

impl Composite {
    fn without_numbers(division: Division) -> Self {
        Self {
            division,
            total_points: None,
            total_mark: None,
            avg_mark: None,
        }
    }
}

/// Total and average mark as `(total_mark, avg_mark)`, both rounded.
///
/// Fixed policies divide by N whatever the number of valid marks. `Auto`
/// sums every valid mark and divides by `max(min_required, valid_count)`.
pub fn average(
    scores: &[SubjectScore<'_>],
    policy: AveragingPolicy,
    min_required: usize,
) -> (f64, f64) {
    let selected = averaging_selection(scores, policy);
    let marks: Vec<f64> = selected.iter().filter_map(|s| s.mark).collect();
    let total = sum(&marks);

    let denominator = match policy.best_n() {
        Some(n) => n,
        None => min_required.max(marks.len()),
    };

    let avg = if denominator == 0 {
        0.0
    } else {
        total / denominator as f64
    };
    (round2(total), round2(avg))
}

/// Classifies a student's division and computes their averages.
///
/// `k` is the curriculum's required subject count; it doubles as the `Auto`
/// minimum denominator.
pub fn score_student(
    student_id: i64,
    scores: &[SubjectScore<'_>],
    k: usize,
    policy: AveragingPolicy,
    tables: &ThresholdTables,
) -> Composite {
    let selected = division_selection(scores, k);
    let valid: Vec<&SubjectScore<'_>> = selected.iter().filter(|s| s.is_valid()).collect();

    if valid.is_empty() {
        return Composite::without_numbers(Division::Absent);
    }
    if valid.len() < k {
        return Composite::without_numbers(Division::Incomplete);
    }

    let total_points: u32 = valid.iter().filter_map(|s| s.division_points).sum();
    let (total_mark, avg_mark) = average(scores, policy, k);

    let division = tables.division_for(total_points).unwrap_or_else(|| {
        warn!(
            exam_id = tables.exam_id(),
            student_id, total_points, "No division band matched, classified ABS"
        );
        Division::Absent
    });

    Composite {
        division,
        total_points: Some(total_points),
        total_mark: Some(total_mark),
        avg_mark: Some(avg_mark),
    }
}
