use crate::error::StreamError;
use crate::finalizer::Finalizer;
use crate::readers::json_lines::StreamHeader;
use crate::stream::{ObjectWriter, WriterOutput};
use crate::writers::file::StagedFile;
use anyhow::{Context, Result};
use gatehouse_protocol::{Row, SchemaInfo};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

pub(crate) fn write_stream_header<W: Write>(out: &mut W, schema: &SchemaInfo) -> Result<()> {
    serde_json::to_writer(&mut *out, &StreamHeader::new(schema))
        .context("Failed to write stream header")?;
    out.write_all(b"\n")?;
    Ok(())
}

pub(crate) fn write_row_line<W: Write>(out: &mut W, row: &Row) -> Result<()> {
    serde_json::to_writer(&mut *out, row).context("Failed to serialize row")?;
    out.write_all(b"\n")?;
    Ok(())
}

pub(crate) struct JsonLinesWriter {
    path: PathBuf,
    header: bool,
    staged: Option<StagedFile>,
    out: Option<BufWriter<File>>,
    rows: u64,
    finalizer: Finalizer,
}

impl JsonLinesWriter {
    pub fn new(path: PathBuf, header: bool, finalizer: Finalizer) -> Self {
        Self {
            path,
            header,
            finalizer,
            staged: None,
            out: None,
            rows: 0,
        }
    }
}

impl ObjectWriter for JsonLinesWriter {
    fn init(&mut self, schema: &SchemaInfo) -> Result<()> {
        let (staged, file) = StagedFile::create(&self.path, &self.finalizer)?;
        let mut out = BufWriter::new(file);
        if self.header {
            write_stream_header(&mut out, schema)?;
        }
        self.staged = Some(staged);
        self.out = Some(out);
        Ok(())
    }

    fn write_row(&mut self, row: &Row) -> Result<()> {
        let out = self
            .out
            .as_mut()
            .context("JSON-lines writer not initialized")?;
        write_row_line(out, row)?;
        self.rows += 1;
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        if let Some(out) = self.out.take() {
            let file = out
                .into_inner()
                .map_err(|e| e.into_error())
                .with_context(|| format!("Failed to flush {}", self.path.display()))?;
            file.sync_all()
                .with_context(|| format!("Failed to sync {}", self.path.display()))?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<WriterOutput> {
        let staged = self
            .staged
            .as_mut()
            .context("JSON-lines writer not initialized")?;
        staged.commit()?;
        Ok(WriterOutput {
            rows: self.rows,
            collected: None,
        })
    }

    fn rollback(&mut self, _reason: &StreamError) {
        self.out = None;
        if let Some(staged) = self.staged.as_mut() {
            staged.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{id_name_row, id_name_schema};

    #[test]
    fn writes_rows_in_order_with_optional_header() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("users.jsonl");
        let mut writer = JsonLinesWriter::new(path.clone(), true, Finalizer::new());
        writer.init(&id_name_schema()).unwrap();
        writer.write_row(&id_name_row(1, "a")).unwrap();
        writer.write_row(&id_name_row(2, "b")).unwrap();
        assert!(!path.exists());
        writer.prepare().unwrap();
        assert_eq!(writer.commit().unwrap().rows, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with(r#"{"__isStreamHeader":true"#));
        assert_eq!(lines[1], r#"{"id":1,"name":"a"}"#);
        assert_eq!(lines[2], r#"{"id":2,"name":"b"}"#);
    }

    #[test]
    fn rollback_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("users.jsonl");
        let mut writer = JsonLinesWriter::new(path.clone(), false, Finalizer::new());
        writer.init(&id_name_schema()).unwrap();
        writer.write_row(&id_name_row(1, "a")).unwrap();
        writer.rollback(&StreamError::source("boom"));
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
