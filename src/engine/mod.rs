//! Ranking and aggregation of exam results.
//!
//! Raw marks are normalized into overall marks, classified into grades,
//! reduced to best-K/best-N selections per student, scored into divisions
//! and averages, and ranked across subject, geography, sex and ownership
//! partitions. Everything here is synchronous and free of I/O.

pub mod composite;
pub mod grade;
pub mod normalize;
pub mod pipeline;
pub mod ranking;
pub mod select;
pub mod types;
pub mod utility;

pub use pipeline::{ComputedExam, ExamInput, compute};
