//! CSV export of an exam's student results.

use anyhow::Result;
use tracing::{debug, info};

use crate::engine::ranking::composite_plan;
use crate::store::StudentResultRow;
use csv::WriterBuilder;
use std::fs::File;
use std::io::Write;
use std::path::Path;

fn header() -> Vec<String> {
    let mut columns: Vec<String> = [
        "student_id",
        "division",
        "total_points",
        "avg_mark",
        "total_mark",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    for field in composite_plan() {
        columns.push(format!("{field}_rank"));
        columns.push(format!("{field}_out_of"));
    }
    columns
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Writes one header row and one row per student. Empty cells stand for
/// null fields.
pub fn write_results<W: Write>(writer: W, rows: &[StudentResultRow]) -> Result<()> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(writer);
    writer.write_record(header())?;

    let plan = composite_plan();
    for row in rows {
        let mut record = vec![
            row.student_id.to_string(),
            row.division.clone().unwrap_or_default(),
            opt(row.total_points),
            opt(row.avg_mark),
            opt(row.total_mark),
        ];
        for field in &plan {
            let position = row.ranks.get(field);
            record.push(opt(position.map(|p| p.rank)));
            record.push(opt(position.map(|p| p.out_of)));
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes student results to a CSV file at `path`, replacing any existing file.
pub fn export_results(path: &Path, rows: &[StudentResultRow]) -> Result<()> {
    debug!(path = %path.display(), rows = rows.len(), "Exporting student results");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    write_results(file, rows)?;
    info!(path = %path.display(), rows = rows.len(), "Student results exported");
    Ok(())
}
