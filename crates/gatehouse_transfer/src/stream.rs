//! Reader and writer contracts shared by every source and sink kind.

use crate::error::StreamError;
use gatehouse_protocol::{CollectedRows, Row, SchemaInfo};

/// One item of an object stream.
///
/// A well-formed stream is `Schema, Row*, (End | Error)`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Schema(SchemaInfo),
    Row(Row),
    Error(StreamError),
    End,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error(_) | StreamEvent::End)
    }
}

/// Lazy, finite, non-restartable source of stream events.
///
/// Failures surface as `StreamEvent::Error`; implementations never panic
/// across this boundary. Callers stop pulling after a terminal event.
pub trait ObjectReader: Send {
    /// Stream name used in progress events.
    fn name(&self) -> &str;

    fn next_event(&mut self) -> StreamEvent;

    /// Release cursors and handles before the stream reached its end.
    fn cancel(&mut self) {}
}

/// What a writer produced once committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriterOutput {
    pub rows: u64,
    pub collected: Option<CollectedRows>,
}

/// Sink side of a stream.
///
/// Life cycle: `init`, `write_row*`, then either `prepare` + `commit`, or
/// `rollback`. Only a successful commit makes output visible.
pub trait ObjectWriter: Send {
    /// Create sink structures for the stream's schema.
    fn init(&mut self, schema: &SchemaInfo) -> anyhow::Result<()>;

    fn write_row(&mut self, row: &Row) -> anyhow::Result<()>;

    /// Flush buffered rows; the sink must be ready to commit afterwards.
    fn prepare(&mut self) -> anyhow::Result<()>;

    fn commit(&mut self) -> anyhow::Result<WriterOutput>;

    /// Discard staged output. Never fails; problems are logged.
    fn rollback(&mut self, reason: &StreamError);
}

/// Reader wrapper that enforces stream ordering.
///
/// Emits an `Error` for a row before the schema, a second schema, or a row
/// with undeclared columns, and yields nothing after the terminal event.
pub struct CheckedReader {
    inner: Box<dyn ObjectReader>,
    schema: Option<SchemaInfo>,
    rows: u64,
    finished: bool,
}

impl CheckedReader {
    pub fn new(inner: Box<dyn ObjectReader>) -> Self {
        Self {
            inner,
            schema: None,
            rows: 0,
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = match self.inner.next_event() {
            StreamEvent::Schema(schema) => {
                if self.schema.is_some() {
                    StreamEvent::Error(StreamError::source("schema emitted twice"))
                } else {
                    self.schema = Some(schema.clone());
                    StreamEvent::Schema(schema)
                }
            }
            StreamEvent::Row(row) => match &self.schema {
                None => StreamEvent::Error(StreamError::source("row emitted before schema")),
                Some(schema) => match schema.validate_row(&row) {
                    Ok(()) => {
                        self.rows += 1;
                        StreamEvent::Row(row)
                    }
                    Err(message) => StreamEvent::Error(StreamError::source(format!(
                        "record {}: {}",
                        self.rows + 1,
                        message
                    ))),
                },
            },
            StreamEvent::End if self.schema.is_none() => {
                StreamEvent::Error(StreamError::source("stream ended without a schema"))
            }
            other => other,
        };
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Cancel the underlying reader unless it already finished.
    pub fn cancel(&mut self) {
        if !self.finished {
            self.inner.cancel();
            self.finished = true;
        }
    }
}

/// Reader whose open step failed; yields a single error event.
pub struct FailedReader {
    name: String,
    error: Option<StreamError>,
}

impl FailedReader {
    pub fn new(name: impl Into<String>, error: StreamError) -> Self {
        Self {
            name: name.into(),
            error: Some(error),
        }
    }
}

impl ObjectReader for FailedReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_event(&mut self) -> StreamEvent {
        match self.error.take() {
            Some(err) => StreamEvent::Error(err),
            None => StreamEvent::End,
        }
    }
}
