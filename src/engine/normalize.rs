use crate::engine::utility::round2;
use tracing::warn;

/// Weight applied to the theory + practical sum for practical subjects.
const PRACTICAL_WEIGHT: f64 = 2.0 / 3.0;

/// Overall mark of one student-subject before grading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverallMark {
    /// Neither component was recorded.
    Absent,
    /// The components combined to NaN or an infinity.
    NonFinite(f64),
    Mark(f64),
}

impl OverallMark {
    /// The storable mark, if any.
    pub fn value(self) -> Option<f64> {
        match self {
            OverallMark::Mark(m) => Some(m),
            OverallMark::Absent | OverallMark::NonFinite(_) => None,
        }
    }
}

/// Derives the overall mark for one student-subject.
///
/// | has_practical | theory | practical | overall                        |
/// |---------------|--------|-----------|--------------------------------|
/// | false         | t      | any       | t                              |
/// | true          | t      | p         | (t + p) * 2/3                  |
/// | true          | t / -  | - / p     | that value * 2/3               |
/// | any           | -      | -         | null                           |
///
/// The result is rounded to two decimals. Missing input never errors; a
/// non-finite result is returned as [`OverallMark::NonFinite`] and is never
/// stored.
pub fn overall_mark(
    has_practical: bool,
    theory_mark: Option<f64>,
    practical_mark: Option<f64>,
) -> OverallMark {
    let raw = if has_practical {
        match (theory_mark, practical_mark) {
            (Some(t), Some(p)) => Some((t + p) * PRACTICAL_WEIGHT),
            (Some(v), None) | (None, Some(v)) => Some(v * PRACTICAL_WEIGHT),
            (None, None) => None,
        }
    } else {
        theory_mark
    };

    match raw {
        None => OverallMark::Absent,
        Some(raw) if !raw.is_finite() => {
            warn!(
                theory = ?theory_mark,
                practical = ?practical_mark,
                "Non-finite overall mark dropped"
            );
            OverallMark::NonFinite(raw)
        }
        Some(raw) => OverallMark::Mark(round2(raw)),
    }
}
