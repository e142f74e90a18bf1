//! One pass from raw marks to the derived rows of an exam.

use crate::engine::composite::score_student;
use crate::engine::grade::{Classification, classify};
use crate::engine::normalize::{OverallMark, overall_mark};
use crate::engine::ranking::{Candidate, composite_plan, rank, subject_plan};
use crate::engine::select::{Curriculum, SubjectScore};
use crate::engine::types::{
    CompositeUpdate, ExamId, ExamSettings, RawMark, StudentId, StudentProfile, SubjectUpdate,
};
use crate::thresholds::ThresholdTables;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Everything loaded from storage for one exam.
#[derive(Debug, Clone)]
pub struct ExamInput {
    pub exam_id: ExamId,
    pub settings: ExamSettings,
    pub marks: Vec<RawMark>,
    pub students: Vec<StudentProfile>,
}

/// Derived rows ready for persistence.
#[derive(Debug, Clone)]
pub struct ComputedExam {
    pub curriculum: Curriculum,
    pub subjects: Vec<SubjectUpdate>,
    pub composites: Vec<CompositeUpdate>,
    /// Raw mark rows read, duplicates included.
    pub raw_rows: usize,
    /// Raw mark rows dropped because their key was already seen.
    pub duplicates: usize,
    pub outliers: usize,
}

/// Per subject row state between normalization and ranking.
struct Normalized<'a> {
    mark: &'a RawMark,
    overall: Option<f64>,
    classification: Classification,
}

/// Runs normalization, classification, selection, scoring and ranking.
///
/// Output rows are ordered by student id, then subject code, so that two runs
/// over the same input produce identical output.
pub fn compute(
    input: &ExamInput,
    tables: &ThresholdTables,
    configured_legacy_code: Option<&str>,
) -> ComputedExam {
    let raw_rows = input.marks.len();

    // first row for a key wins
    let mut seen = HashSet::new();
    let mut marks: Vec<&RawMark> = input
        .marks
        .iter()
        .filter(|m| seen.insert((m.student_id, m.subject_code.as_str())))
        .collect();
    let duplicates = raw_rows - marks.len();
    marks.sort_by(|a, b| {
        a.student_id
            .cmp(&b.student_id)
            .then_with(|| a.subject_code.cmp(&b.subject_code))
    });

    let legacy_code = input
        .settings
        .legacy_subject_code
        .as_deref()
        .or(configured_legacy_code);
    let curriculum = Curriculum::detect(marks.iter().map(|m| m.subject_code.as_str()), legacy_code);
    let k = curriculum.required_subjects();
    debug!(exam_id = input.exam_id, ?curriculum, k, "Curriculum detected");

    let mut profiles: HashMap<StudentId, StudentProfile> = input
        .students
        .iter()
        .map(|p| (p.student_id, p.clone()))
        .collect();
    for m in &marks {
        profiles
            .entry(m.student_id)
            .or_insert_with(|| StudentProfile::bare(m.student_id));
    }

    let normalized: Vec<Normalized<'_>> = marks
        .par_iter()
        .map(|&m| {
            let (overall, classification) =
                match overall_mark(m.has_practical, m.theory_mark, m.practical_mark) {
                    OverallMark::NonFinite(raw) => (None, Classification::Outlier(raw)),
                    mark => (mark.value(), classify(tables, mark.value())),
                };
            Normalized {
                mark: m,
                overall,
                classification,
            }
        })
        .collect();
    let outliers = normalized
        .iter()
        .filter(|n| n.classification.is_outlier())
        .count();

    // subject rankings
    let subject_candidates: Vec<Candidate<'_>> = normalized
        .iter()
        .map(|n| Candidate {
            value: n.classification.graded().and(n.overall),
            subject: Some(n.mark.subject_code.as_str()),
            profile: &profiles[&n.mark.student_id],
        })
        .collect();
    let subject_ranks = rank(&subject_candidates, &subject_plan());

    let subjects: Vec<SubjectUpdate> = normalized
        .iter()
        .zip(subject_ranks)
        .map(|(n, ranks)| {
            let graded = n.classification.graded();
            SubjectUpdate {
                student_id: n.mark.student_id,
                subject_code: n.mark.subject_code.clone(),
                overall_mark: n.overall,
                grade: graded.map(|g| g.grade.clone()),
                grade_points: graded.map(|g| g.grade_points),
                ranks,
            }
        })
        .collect();

    // composites; rows are sorted so each student's subjects are contiguous
    let mut per_student: Vec<(StudentId, Vec<SubjectScore<'_>>)> = Vec::new();
    for n in &normalized {
        let graded = n.classification.graded();
        let score = SubjectScore {
            subject_code: n.mark.subject_code.as_str(),
            mark: graded.and(n.overall),
            division_points: graded.map(|g| g.division_points),
        };
        match per_student.last_mut() {
            Some((id, scores)) if *id == n.mark.student_id => scores.push(score),
            _ => per_student.push((n.mark.student_id, vec![score])),
        }
    }

    let policy = input.settings.averaging_policy;
    let scored: Vec<_> = per_student
        .par_iter()
        .map(|(id, scores)| (*id, score_student(*id, scores, k, policy, tables)))
        .collect();

    let composite_candidates: Vec<Candidate<'_>> = scored
        .iter()
        .map(|(id, c)| Candidate {
            value: c.avg_mark,
            subject: None,
            profile: &profiles[id],
        })
        .collect();
    let composite_ranks = rank(&composite_candidates, &composite_plan());

    let composites: Vec<CompositeUpdate> = scored
        .into_iter()
        .zip(composite_ranks)
        .map(|((student_id, c), ranks)| CompositeUpdate {
            student_id,
            avg_mark: c.avg_mark,
            total_mark: c.total_mark,
            division: c.division,
            total_points: c.total_points,
            ranks,
        })
        .collect();

    info!(
        exam_id = input.exam_id,
        subject_rows = subjects.len(),
        students = composites.len(),
        duplicates,
        outliers,
        "Derived fields computed"
    );

    ComputedExam {
        curriculum,
        subjects,
        composites,
        raw_rows,
        duplicates,
        outliers,
    }
}
