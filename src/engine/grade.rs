use crate::thresholds::ThresholdTables;
use tracing::warn;

/// Grade and points assigned to one normalized mark.
#[derive(Debug, Clone, PartialEq)]
pub struct Graded {
    pub grade: String,
    pub grade_points: f64,
    pub division_points: u32,
}

/// Outcome of classifying an optional mark.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// The subject was not examined.
    Missing,
    /// The mark exists but no grade band applies to it.
    Outlier(f64),
    Graded(Graded),
}

impl Classification {
    pub fn graded(&self) -> Option<&Graded> {
        match self {
            Classification::Graded(g) => Some(g),
            _ => None,
        }
    }

    pub fn is_outlier(&self) -> bool {
        matches!(self, Classification::Outlier(_))
    }
}

/// Maps a normalized mark to a grade via the exam's threshold table.
///
/// Outliers are logged and reported, never fatal.
pub fn classify(tables: &ThresholdTables, mark: Option<f64>) -> Classification {
    let Some(mark) = mark else {
        return Classification::Missing;
    };

    match tables.grade_for(mark) {
        Some(t) => Classification::Graded(Graded {
            grade: t.grade.clone(),
            grade_points: t.grade_points,
            division_points: t.division_points,
        }),
        None => {
            warn!(exam_id = tables.exam_id(), mark, "Outlier mark left unclassified");
            Classification::Outlier(mark)
        }
    }
}
