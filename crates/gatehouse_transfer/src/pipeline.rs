//! Runs one pipeline descriptor: open sinks, open the source, copy, commit.

use crate::coupler::{copy_stream, CopyContext, CopyReport, EventSink};
use crate::error::{Result, StreamError, TransferError};
use crate::finalizer::Finalizer;
use crate::readers::{open_reader, ReaderContext};
use crate::stream::ObjectWriter;
use crate::writers::{open_writer, WriterContext};
use gatehouse_protocol::{EventKind, OutputSummary, PipelineDescriptor, PipelineOptions, RunSummary};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a run shares across its pipelines and steps.
#[derive(Clone)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub finalizer: Finalizer,
    pub events: EventSink,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, events: EventSink) -> Self {
        Self {
            cancel,
            finalizer: Finalizer::new(),
            events,
        }
    }

    pub fn emit(&self, event: EventKind) {
        (self.events)(event);
    }

    pub(crate) fn reader_context(&self, options: &PipelineOptions) -> ReaderContext {
        ReaderContext::new(self.cancel.clone(), self.finalizer.clone()).with_options(options)
    }

    pub(crate) fn copy_context(&self, options: &PipelineOptions) -> CopyContext {
        CopyContext::new(self.cancel.clone(), self.events.clone()).with_options(options)
    }
}

/// Add a copy's rows and outputs to a run summary.
pub(crate) fn record_copy(summary: &mut RunSummary, report: CopyReport) {
    summary.rows += report.rows;
    for (writer, output) in report.outputs {
        summary.outputs.push(OutputSummary {
            writer,
            rows: output.rows,
        });
        if let Some(collected) = output.collected {
            summary.collected.push(collected);
        }
    }
}

/// Copy the pipeline's source into all of its sinks.
///
/// Sinks are opened before the source, so an unreachable target fails the
/// run without reading anything. Archive sinks are committed after every
/// writer committed; on failure they are abandoned and stay incomplete.
pub fn run_pipeline(pipeline: &PipelineDescriptor, ctx: &RunContext) -> Result<RunSummary> {
    info!("Running pipeline: {}", pipeline.label());
    let options = &pipeline.options;

    let mut writer_ctx = WriterContext::new(options, ctx.finalizer.clone());
    let mut writers: Vec<(String, Box<dyn ObjectWriter>)> = Vec::with_capacity(pipeline.sinks.len());
    for sink in &pipeline.sinks {
        let name = sink.to_string();
        match open_writer(sink, &mut writer_ctx) {
            Ok(writer) => writers.push((name, writer)),
            Err(err) => {
                let error = StreamError::from_writer_error(&err);
                warn!(writer = %name, "Failed to open sink: {}", error);
                for (_, mut opened) in writers {
                    opened.rollback(&error);
                }
                return Err(TransferError::writer(name, error));
            }
        }
    }

    let reader = open_reader(&pipeline.source, &ctx.reader_context(options));
    let copied = copy_stream(reader, writers, &ctx.copy_context(options));
    let archives = writer_ctx.take_archives();

    let report = match copied {
        Ok(report) => report,
        Err(err) => {
            for archive in archives {
                archive.abandon();
            }
            return Err(err);
        }
    };
    for archive in archives {
        archive.commit()?;
    }

    let mut summary = RunSummary::default();
    record_copy(&mut summary, report);
    Ok(summary)
}
