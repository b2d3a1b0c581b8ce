//! Writers that keep rows in the runner process: console and collector.

use crate::error::StreamError;
use crate::stream::{ObjectWriter, WriterOutput};
use anyhow::Result;
use gatehouse_protocol::{CollectedRows, Row, SchemaInfo};
use tracing::{info, warn};

/// Logs every row.
#[derive(Default)]
pub(crate) struct ConsoleWriter {
    rows: u64,
}

impl ObjectWriter for ConsoleWriter {
    fn init(&mut self, schema: &SchemaInfo) -> Result<()> {
        let columns: Vec<&str> = schema.column_names().collect();
        info!(target: "gatehouse::console", "columns: {}", columns.join(", "));
        Ok(())
    }

    fn write_row(&mut self, row: &Row) -> Result<()> {
        self.rows += 1;
        info!(target: "gatehouse::console", "{}", serde_json::to_string(row)?);
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<WriterOutput> {
        info!(target: "gatehouse::console", "{} rows", self.rows);
        Ok(WriterOutput {
            rows: self.rows,
            collected: None,
        })
    }

    fn rollback(&mut self, reason: &StreamError) {
        warn!(target: "gatehouse::console", "stream aborted: {}", reason);
    }
}

/// Keeps up to `limit` rows and returns them with the run summary.
pub(crate) struct CollectorWriter {
    name: String,
    limit: usize,
    schema: SchemaInfo,
    rows: Vec<Row>,
    seen: u64,
}

impl CollectorWriter {
    pub fn new(name: String, limit: usize) -> Self {
        Self {
            name,
            limit,
            schema: SchemaInfo::default(),
            rows: Vec::new(),
            seen: 0,
        }
    }
}

impl ObjectWriter for CollectorWriter {
    fn init(&mut self, schema: &SchemaInfo) -> Result<()> {
        self.schema = schema.clone();
        Ok(())
    }

    fn write_row(&mut self, row: &Row) -> Result<()> {
        self.seen += 1;
        if self.rows.len() < self.limit {
            self.rows.push(row.clone());
        }
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<WriterOutput> {
        let rows = std::mem::take(&mut self.rows);
        Ok(WriterOutput {
            rows: self.seen,
            collected: Some(CollectedRows {
                name: self.name.clone(),
                schema: self.schema.clone(),
                truncated: self.seen > rows.len() as u64,
                rows,
            }),
        })
    }

    fn rollback(&mut self, _reason: &StreamError) {
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{id_name_row, id_name_schema};

    #[test]
    fn collector_truncates_at_limit() {
        let mut writer = CollectorWriter::new("preview".into(), 2);
        writer.init(&id_name_schema()).unwrap();
        for i in 1..=3 {
            writer.write_row(&id_name_row(i, "x")).unwrap();
        }
        writer.prepare().unwrap();
        let output = writer.commit().unwrap();
        assert_eq!(output.rows, 3);
        let collected = output.collected.unwrap();
        assert_eq!(collected.rows.len(), 2);
        assert!(collected.truncated);
        assert_eq!(collected.schema, id_name_schema());
    }
}
