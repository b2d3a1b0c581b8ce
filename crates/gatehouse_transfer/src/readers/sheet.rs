use crate::readers::sampled::{parse_cell, RecordSource, SampledReader};
use anyhow::{Context, Result};
use gatehouse_protocol::Row;
use std::fs::File;
use std::path::{Path, PathBuf};

/// File holding one sheet of a workbook directory.
pub(crate) fn sheet_path(workbook: &Path, sheet: &str) -> PathBuf {
    workbook.join(format!("{}.csv", sheet))
}

/// Records of a CSV sheet keyed by its header row.
pub(crate) struct SheetRecords {
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<File>,
}

impl RecordSource for SheetRecords {
    fn next_record(&mut self) -> Option<Result<Row, String>> {
        let record = match self.records.next()? {
            Ok(record) => record,
            Err(err) => return Some(Err(format!("malformed sheet record: {}", err))),
        };
        let row = self
            .headers
            .iter()
            .zip(record.iter())
            .map(|(name, cell)| (name.clone(), parse_cell(cell)))
            .collect();
        Some(Ok(row))
    }
}

pub(crate) type SheetReader = SampledReader<SheetRecords>;

pub(crate) fn open_sheet(
    name: String,
    workbook: &Path,
    sheet: &str,
    sample_rows: usize,
) -> Result<SheetReader> {
    let path = sheet_path(workbook, sheet);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(&path)
        .with_context(|| format!("Failed to open sheet {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read header row of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    let records = SheetRecords {
        headers,
        records: reader.into_records(),
    };
    Ok(SampledReader::new(name, records, None, sample_rows))
}
