use crate::error::StreamError;
use crate::finalizer::Finalizer;
use crate::readers::sheet::sheet_path;
use crate::stream::{ObjectWriter, WriterOutput};
use crate::writers::file::StagedFile;
use anyhow::{Context, Result};
use gatehouse_protocol::{Row, SchemaInfo};
use std::fs::File;
use std::path::PathBuf;

/// Writes one sheet of a workbook directory as `<path>/<sheet>.csv`.
pub(crate) struct SheetWriter {
    path: PathBuf,
    columns: Vec<String>,
    staged: Option<StagedFile>,
    out: Option<csv::Writer<File>>,
    rows: u64,
    finalizer: Finalizer,
}

impl SheetWriter {
    pub fn new(workbook: &std::path::Path, sheet: &str, finalizer: Finalizer) -> Self {
        Self {
            path: sheet_path(workbook, sheet),
            finalizer,
            columns: Vec::new(),
            staged: None,
            out: None,
            rows: 0,
        }
    }
}

impl ObjectWriter for SheetWriter {
    fn init(&mut self, schema: &SchemaInfo) -> Result<()> {
        let (staged, file) = StagedFile::create(&self.path, &self.finalizer)?;
        let mut out = csv::Writer::from_writer(file);
        self.columns = schema.column_names().map(str::to_string).collect();
        out.write_record(&self.columns)
            .context("Failed to write sheet header")?;
        self.staged = Some(staged);
        self.out = Some(out);
        Ok(())
    }

    fn write_row(&mut self, row: &Row) -> Result<()> {
        let out = self.out.as_mut().context("Sheet writer not initialized")?;
        let record = self
            .columns
            .iter()
            .map(|c| row.get(c).map(|v| v.to_cell()).unwrap_or_default());
        out.write_record(record)
            .context("Failed to write sheet record")?;
        self.rows += 1;
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()
                .with_context(|| format!("Failed to flush {}", self.path.display()))?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<WriterOutput> {
        let staged = self.staged.as_mut().context("Sheet writer not initialized")?;
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
