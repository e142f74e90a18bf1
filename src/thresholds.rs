//! Exam-scoped lookup tables for grades and divisions.
//!
//! Both tables are sorted descending once at construction and validated; a
//! table that fails validation is a [`ConfigurationError`] and stops the run
//! before anything is written.

use crate::engine::types::{Division, ExamId};
use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GradeThreshold {
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub grade: String,
    pub grade_points: f64,
    pub division_points: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DivisionThreshold {
    pub lowest_points: u32,
    pub highest_points: u32,
    pub division: String,
}

/// A division threshold with its label already parsed.
#[derive(Debug, Clone, Copy, PartialEq)]
struct DivisionBand {
    lowest_points: u32,
    division: Division,
}

/// Immutable grade and division tables for one exam.
#[derive(Debug, Clone)]
pub struct ThresholdTables {
    exam_id: ExamId,
    grades: Vec<GradeThreshold>,
    divisions: Vec<DivisionBand>,
}

impl ThresholdTables {
    pub fn new(
        exam_id: ExamId,
        mut grades: Vec<GradeThreshold>,
        mut divisions: Vec<DivisionThreshold>,
    ) -> Result<Self, ConfigurationError> {
        if grades.is_empty() {
            return Err(ConfigurationError::MissingGradeThresholds { exam_id });
        }
        if divisions.is_empty() {
            return Err(ConfigurationError::MissingDivisionThresholds { exam_id });
        }

        for g in &grades {
            if !g.lower_bound.is_finite() || !g.upper_bound.is_finite() {
                return Err(invalid_grade(g, "bounds must be finite"));
            }
            if g.lower_bound > g.upper_bound {
                return Err(invalid_grade(g, "lower bound above upper bound"));
            }
            if !g.grade_points.is_finite() {
                return Err(invalid_grade(g, "grade points must be finite"));
            }
        }

        grades.sort_by(|a, b| b.lower_bound.total_cmp(&a.lower_bound));

        for pair in grades.windows(2) {
            let (upper, lower) = (&pair[0], &pair[1]);
            if upper.lower_bound == lower.lower_bound {
                return Err(invalid_grade(lower, "duplicate lower bound"));
            }
            if lower.upper_bound > upper.lower_bound {
                return Err(ConfigurationError::OverlappingGradeThresholds {
                    upper: upper.grade.clone(),
                    lower: lower.grade.clone(),
                });
            }
        }

        // sorted descending, so first/last hold the extremes; marks outside
        // the covered range are unclassified rather than fatal
        let (floor, ceiling) = (grades[grades.len() - 1].lower_bound, grades[0].upper_bound);
        if floor > 0.0 || ceiling < 100.0 {
            warn!(exam_id, floor, ceiling, "Grade thresholds do not cover 0..=100");
        }

        let mut bands = Vec::with_capacity(divisions.len());
        divisions.sort_by(|a, b| b.lowest_points.cmp(&a.lowest_points));
        for (i, d) in divisions.iter().enumerate() {
            if d.lowest_points > d.highest_points {
                return Err(invalid_division(d, "lowest points above highest points"));
            }
            if i > 0 && divisions[i - 1].lowest_points == d.lowest_points {
                return Err(invalid_division(d, "duplicate lowest points"));
            }
            let division = d
                .division
                .parse::<Division>()
                .map_err(|reason| invalid_division(d, &reason))?;
            if matches!(division, Division::Absent | Division::Incomplete) {
                return Err(invalid_division(d, "ABS and INC are not point bands"));
            }
            bands.push(DivisionBand {
                lowest_points: d.lowest_points,
                division,
            });
        }

        Ok(Self {
            exam_id,
            grades,
            divisions: bands,
        })
    }

    pub fn exam_id(&self) -> ExamId {
        self.exam_id
    }

    /// First grade entry (in descending order) whose lower bound is at or
    /// below `mark`. `None` when `mark` is outside [0, 100] or non-finite.
    pub fn grade_for(&self, mark: f64) -> Option<&GradeThreshold> {
        if !crate::engine::utility::is_valid_mark(mark) {
            return None;
        }
        // entries are descending, so matches form a suffix; the first match
        // is where that suffix starts
        let idx = self.grades.partition_point(|g| g.lower_bound > mark);
        self.grades.get(idx)
    }

    /// First division band (in descending order) whose lowest points are at
    /// or below `total_points`.
    pub fn division_for(&self, total_points: u32) -> Option<Division> {
        let idx = self
            .divisions
            .partition_point(|d| d.lowest_points > total_points);
        self.divisions.get(idx).map(|d| d.division)
    }

    /// Index of the matched division band. Lower index means a higher band.
    pub fn division_band_index(&self, total_points: u32) -> Option<usize> {
        let idx = self
            .divisions
            .partition_point(|d| d.lowest_points > total_points);
        (idx < self.divisions.len()).then_some(idx)
    }
}

fn invalid_grade(g: &GradeThreshold, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidGradeThreshold {
        grade: g.grade.clone(),
        reason: reason.to_string(),
    }
}

fn invalid_division(d: &DivisionThreshold, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidDivisionThreshold {
        label: d.division.clone(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn grade(lower: f64, upper: f64, name: &str, points: u32) -> GradeThreshold {
        GradeThreshold {
            lower_bound: lower,
            upper_bound: upper,
            grade: name.to_string(),
            grade_points: points as f64,
            division_points: points,
        }
    }

    pub(crate) fn division(lowest: u32, highest: u32, label: &str) -> DivisionThreshold {
        DivisionThreshold {
            lowest_points: lowest,
            highest_points: highest,
            division: label.to_string(),
        }
    }

    /// CSEE-style tables: A..F on 1..5 points, divisions over seven subjects.
    pub(crate) fn standard_tables() -> ThresholdTables {
        ThresholdTables::new(
            1,
            vec![
                grade(0.0, 29.9, "F", 5),
                grade(75.0, 100.0, "A", 1),
                grade(45.0, 64.9, "C", 3),
                grade(65.0, 74.9, "B", 2),
                grade(30.0, 44.9, "D", 4),
            ],
            vec![
                division(7, 17, "I"),
                division(18, 21, "II"),
                division(22, 25, "III"),
                division(26, 33, "IV"),
                division(34, 40, "0"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_two_band_table_lookup() {
        let tables = ThresholdTables::new(
            1,
            vec![grade(75.0, 100.0, "A", 1), grade(65.0, 74.9, "B", 2)],
            vec![division(0, 40, "I")],
        )
        .unwrap();
        let hit = tables.grade_for(70.0).unwrap();
        assert_eq!(hit.grade, "B");
        assert_eq!(hit.grade_points, 2.0);
        assert_eq!(hit.division_points, 2);
        assert_eq!(tables.grade_for(80.0).unwrap().grade, "A");
        assert!(tables.grade_for(64.0).is_none());
        assert!(tables.grade_for(0.0).is_none());
    }

    #[test]
    fn test_gap_between_declared_bounds_falls_to_lower_grade() {
        let tables = standard_tables();
        assert_eq!(tables.grade_for(74.95).unwrap().grade, "B");
        assert_eq!(tables.grade_for(75.0).unwrap().grade, "A");
        assert_eq!(tables.grade_for(0.0).unwrap().grade, "F");
        assert_eq!(tables.grade_for(100.0).unwrap().grade, "A");
    }

    #[test]
    fn test_grade_totality_over_range() {
        let tables = standard_tables();
        let mut mark = 0.0;
        while mark <= 100.0 {
            assert!(tables.grade_for(mark).is_some(), "no grade for {mark}");
            mark += 0.01;
        }
    }

    #[test]
    fn test_out_of_range_is_unclassified() {
        let tables = standard_tables();
        assert!(tables.grade_for(-0.5).is_none());
        assert!(tables.grade_for(100.01).is_none());
        assert!(tables.grade_for(f64::NAN).is_none());
        assert!(tables.grade_for(f64::INFINITY).is_none());
    }

    #[test]
    fn test_division_lookup() {
        let tables = standard_tables();
        assert_eq!(tables.division_for(7), Some(Division::I));
        assert_eq!(tables.division_for(17), Some(Division::I));
        assert_eq!(tables.division_for(18), Some(Division::II));
        assert_eq!(tables.division_for(33), Some(Division::IV));
        assert_eq!(tables.division_for(35), Some(Division::Zero));
        assert_eq!(tables.division_for(6), None);
    }

    #[test]
    fn test_division_monotonicity() {
        let tables = standard_tables();
        for b in 7..=40u32 {
            for a in (b + 1)..=40 {
                let ia = tables.division_band_index(a).unwrap();
                let ib = tables.division_band_index(b).unwrap();
                assert!(ia <= ib, "{a} points matched band {ia}, {b} points band {ib}");
            }
        }
    }

    #[test]
    fn test_empty_tables_rejected() {
        let err = ThresholdTables::new(9, vec![], vec![division(0, 1, "I")]).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingGradeThresholds { exam_id: 9 });

        let err =
            ThresholdTables::new(9, vec![grade(0.0, 100.0, "A", 1)], vec![]).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingDivisionThresholds { exam_id: 9 });
    }

    #[test]
    fn test_duplicate_lower_bound_rejected() {
        let err = ThresholdTables::new(
            1,
            vec![grade(0.0, 100.0, "A", 1), grade(0.0, 50.0, "B", 2)],
            vec![division(0, 10, "I")],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidGradeThreshold { .. }));
    }

    #[test]
    fn test_overlap_rejected() {
        let err = ThresholdTables::new(
            1,
            vec![grade(60.0, 100.0, "A", 1), grade(0.0, 70.0, "B", 2)],
            vec![division(0, 10, "I")],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::OverlappingGradeThresholds { .. }));
    }

    #[test]
    fn test_partial_coverage_accepted() {
        let tables = ThresholdTables::new(
            1,
            vec![grade(10.0, 100.0, "A", 1)],
            vec![division(0, 10, "I")],
        )
        .unwrap();
        assert!(tables.grade_for(5.0).is_none());

        let tables = ThresholdTables::new(
            1,
            vec![grade(0.0, 90.0, "A", 1)],
            vec![division(0, 10, "I")],
        )
        .unwrap();
        assert_eq!(tables.grade_for(50.0).unwrap().grade, "A");
    }

    #[test]
    fn test_bad_division_label_rejected() {
        let err = ThresholdTables::new(
            1,
            vec![grade(0.0, 100.0, "A", 1)],
            vec![division(0, 10, "V")],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidDivisionThreshold { .. }));

        let err = ThresholdTables::new(
            1,
            vec![grade(0.0, 100.0, "A", 1)],
            vec![division(0, 10, "INC")],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidDivisionThreshold { .. }));
    }
}
