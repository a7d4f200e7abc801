use std::io::Write;

use common::error::AppError;
use serde::Serialize;

use crate::{catalog::PrefixUsage, pipeline::RunReport};

/// Write one CSV row per item the run looked at, clinical records first.
pub fn write_item_records<W: Write>(report: &RunReport, writer: W) -> Result<usize, AppError> {
    write_rows(report.records(), writer)
}

pub fn write_storage_summary<W: Write>(usage: &[PrefixUsage], writer: W) -> Result<usize, AppError> {
    write_rows(usage.iter(), writer)
}

fn write_rows<'a, T, W>(rows: impl Iterator<Item = &'a T>, writer: W) -> Result<usize, AppError>
where
    T: Serialize + 'a,
    W: Write,
{
    let mut csv = csv::Writer::from_writer(writer);
    let mut written = 0usize;
    for row in rows {
        csv.serialize(row).map_err(std::io::Error::from)?;
        written = written.saturating_add(1);
    }
    csv.flush()?;
    Ok(written)
}
