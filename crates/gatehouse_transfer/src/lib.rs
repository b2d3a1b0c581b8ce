//! Streaming transfer of tabular data between sources and sinks.
//!
//! A reader produces `Schema, Row*, (End | Error)`; the coupler fans those
//! events out to one or more writers and commits them only when every writer
//! prepared successfully. Pipelines and scripts are built on top of that.

pub mod archive;
mod channel;
pub mod coupler;
pub mod driver;
pub mod error;
pub mod finalizer;
pub mod pipeline;
pub mod readers;
pub mod script;
pub mod stream;
pub mod writers;

pub use archive::{ArchiveReader, ArchiveWriter, ContainerError, Manifest, ManifestEntry};
pub use coupler::{copy_stream, discard_events, CopyContext, CopyReport, EventSink};
pub use driver::{open_driver, Access, Driver, TableName};
pub use error::{StreamError, TransferError, WriterFailure};
pub use finalizer::{CleanupToken, Finalizer};
pub use pipeline::{run_pipeline, RunContext};
pub use readers::{open_reader, ReaderContext};
pub use script::{run_script, run_task};
pub use stream::{CheckedReader, ObjectReader, ObjectWriter, StreamEvent, WriterOutput};
pub use writers::{open_writer, WriterContext};

/// Cancellation is shared with the async orchestrator: threads poll
/// `is_cancelled`, tasks await `cancelled()`.
pub use tokio_util::sync::CancellationToken;
