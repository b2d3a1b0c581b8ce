//! Object readers, one per source kind.

mod fake;
pub(crate) mod json_lines;
pub(crate) mod sampled;
pub(crate) mod sheet;
mod sql;
pub(crate) mod tracked;

use crate::archive::ArchiveReader;
use crate::driver::TableName;
use crate::error::StreamError;
use crate::finalizer::Finalizer;
use crate::stream::{FailedReader, ObjectReader};
use gatehouse_protocol::{defaults, PipelineOptions, SourceSpec};
use fake::FakeReader;
use sql::{SqlPlan, SqlReader};
use tracked::TrackedReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-run settings handed to every reader.
#[derive(Clone)]
pub struct ReaderContext {
    pub sample_rows: usize,
    /// Bound of the queue between a producer thread and its reader.
    pub queue_depth: usize,
    pub cancel: CancellationToken,
    pub finalizer: Finalizer,
}

impl ReaderContext {
    pub fn new(cancel: CancellationToken, finalizer: Finalizer) -> Self {
        Self {
            sample_rows: defaults::DEFAULT_SAMPLE_ROWS,
            queue_depth: defaults::DEFAULT_WRITER_QUEUE_DEPTH,
            cancel,
            finalizer,
        }
    }

    pub fn with_options(mut self, options: &PipelineOptions) -> Self {
        self.sample_rows = options.sample_rows;
        self.queue_depth = options.queue_depth;
        self
    }
}

/// Open the reader for a source.
///
/// Open failures are reported through the stream as a single `Error` event.
pub fn open_reader(spec: &SourceSpec, ctx: &ReaderContext) -> Box<dyn ObjectReader> {
    let name = spec.to_string();
    debug!(source = %name, "Opening reader");

    let opened: Result<Box<dyn ObjectReader>, StreamError> = match spec {
        SourceSpec::Table {
            connection,
            schema,
            table,
        } => SqlReader::spawn(
            name.clone(),
            connection.clone(),
            SqlPlan::Table(TableName::new(schema.as_deref(), table.clone())),
            ctx,
        )
        .map(|r| Box::new(r) as Box<dyn ObjectReader>)
        .map_err(source_error),
        SourceSpec::Query { connection, sql } => SqlReader::spawn(
            name.clone(),
            connection.clone(),
            SqlPlan::Query(sql.clone()),
            ctx,
        )
        .map(|r| Box::new(r) as Box<dyn ObjectReader>)
        .map_err(source_error),
        SourceSpec::Sheet { path, sheet } => {
            sheet::open_sheet(name.clone(), path, sheet, ctx.sample_rows)
                .map(|r| tracked(Box::new(r), ctx))
                .map_err(source_error)
        }
        SourceSpec::JsonLines { path } => {
            json_lines::open_json_lines(name.clone(), path, ctx.sample_rows)
                .map(|r| tracked(Box::new(r), ctx))
                .map_err(source_error)
        }
        SourceSpec::Archive { path, entry } => ArchiveReader::open(path)
            .and_then(|archive| archive.open_entry(entry))
            .map(|r| tracked(r, ctx))
            .map_err(|err| StreamError::container(err.to_string())),
        SourceSpec::Fake {
            rows,
            delay_ms,
            fail_after,
        } => Ok(Box::new(FakeReader::new(
            name.clone(),
            *rows,
            *delay_ms,
            *fail_after,
            ctx.cancel.clone(),
        ))),
    };

    match opened {
        Ok(reader) => reader,
        Err(err) => Box::new(FailedReader::new(name, err)),
    }
}

fn tracked(reader: Box<dyn ObjectReader>, ctx: &ReaderContext) -> Box<dyn ObjectReader> {
    Box::new(TrackedReader::new(reader, &ctx.finalizer))
}

fn source_error(err: anyhow::Error) -> StreamError {
    StreamError::source(format!("{:#}", err))
}
