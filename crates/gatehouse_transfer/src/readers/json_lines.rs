//! JSON-lines reader.
//!
//! An optional first line `{"__isStreamHeader": true, "columns": [...]}`
//! declares the schema; otherwise it is inferred from a sample.

use crate::readers::sampled::{RecordSource, SampledReader};
use anyhow::{Context, Result};
use gatehouse_protocol::{ColumnInfo, Row, SchemaInfo, Value};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub(crate) const STREAM_HEADER_KEY: &str = "__isStreamHeader";

/// First line of a JSON-lines file declaring its schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StreamHeader {
    #[serde(rename = "__isStreamHeader")]
    pub is_stream_header: bool,
    pub columns: Vec<ColumnInfo>,
}

impl StreamHeader {
    pub fn new(schema: &SchemaInfo) -> Self {
        Self {
            is_stream_header: true,
            columns: schema.columns.clone(),
        }
    }
}

pub(crate) struct JsonLinesRecords<R> {
    lines: std::io::Lines<R>,
    line_no: u64,
    pending: Option<Row>,
}

impl<R: BufRead> JsonLinesRecords<R> {
    /// Next non-blank line with its line number.
    fn next_line(&mut self) -> Option<Result<(u64, String), String>> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;
            match line {
                Ok(text) if text.trim().is_empty() => continue,
                Ok(text) => return Some(Ok((self.line_no, text))),
                Err(err) => return Some(Err(format!("line {}: {}", self.line_no, err))),
            }
        }
    }
}

fn parse_record(line_no: u64, text: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(format!("line {}: expected a JSON object", line_no)),
        Err(err) => Err(format!("line {}: {}", line_no, err)),
    }
}

fn to_row(map: serde_json::Map<String, serde_json::Value>) -> Row {
    map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
}

impl<R: BufRead + Send> RecordSource for JsonLinesRecords<R> {
    fn next_record(&mut self) -> Option<Result<Row, String>> {
        if let Some(row) = self.pending.take() {
            return Some(Ok(row));
        }
        let (line_no, text) = match self.next_line()? {
            Ok(line) => line,
            Err(message) => return Some(Err(message)),
        };
        Some(parse_record(line_no, &text).map(to_row))
    }
}

pub(crate) type JsonLinesReader<R> = SampledReader<JsonLinesRecords<R>>;

/// Build a reader over any buffered input, consuming the stream header when
/// present.
pub(crate) fn from_buf_read<R: BufRead + Send>(
    name: String,
    input: R,
    sample_rows: usize,
) -> Result<JsonLinesReader<R>> {
    let mut records = JsonLinesRecords {
        lines: input.lines(),
        line_no: 0,
        pending: None,
    };

    let mut declared = None;
    if let Some(first) = records.next_line() {
        let (line_no, text) = first.map_err(anyhow::Error::msg)?;
        let map = parse_record(line_no, &text).map_err(anyhow::Error::msg)?;
        if map.get(STREAM_HEADER_KEY) == Some(&serde_json::Value::Bool(true)) {
            let header: StreamHeader = serde_json::from_value(serde_json::Value::Object(map))
                .with_context(|| format!("line {}: invalid stream header", line_no))?;
            declared = Some(SchemaInfo::new(header.columns));
        } else {
            records.pending = Some(to_row(map));
        }
    }

    Ok(SampledReader::new(name, records, declared, sample_rows))
}

pub(crate) fn open_json_lines(
    name: String,
    path: &Path,
    sample_rows: usize,
) -> Result<JsonLinesReader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    from_buf_read(name, BufReader::new(file), sample_rows)
}
