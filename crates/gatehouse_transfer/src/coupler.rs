//! Stream coupler: copies one reader into one or more writers.
//!
//! Every writer runs on its own thread behind a bounded queue. The reader is
//! pulled on the calling thread and never gets further ahead than the fullest
//! queue allows. Writers are committed only after all of them prepared
//! successfully; any failure rolls back every writer.

use crate::channel::{send_or_stop, SendOutcome};
use crate::error::{Result, StreamError, TransferError, WriterFailure};
use crate::stream::{CheckedReader, ObjectReader, ObjectWriter, StreamEvent, WriterOutput};
use gatehouse_protocol::{defaults, EventKind, PipelineOptions, Progress, Row, SchemaInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback receiving schema and progress events.
pub type EventSink = Arc<dyn Fn(EventKind) + Send + Sync>;

/// Event sink that drops everything.
pub fn discard_events() -> EventSink {
    Arc::new(|_| {})
}

/// Settings for one [`copy_stream`] call.
#[derive(Clone)]
pub struct CopyContext {
    pub cancel: CancellationToken,
    /// Rows buffered per writer before the reader is suspended.
    pub queue_depth: usize,
    /// Rows between progress events; 0 disables them.
    pub progress_interval: u64,
    pub events: EventSink,
}

impl CopyContext {
    pub fn new(cancel: CancellationToken, events: EventSink) -> Self {
        Self {
            cancel,
            queue_depth: defaults::DEFAULT_WRITER_QUEUE_DEPTH,
            progress_interval: defaults::DEFAULT_PROGRESS_INTERVAL,
            events,
        }
    }

    pub fn with_options(mut self, options: &PipelineOptions) -> Self {
        self.queue_depth = options.queue_depth;
        self.progress_interval = options.progress_interval;
        self
    }
}

/// Outcome of a successful copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyReport {
    pub stream: String,
    pub schema: SchemaInfo,
    /// Rows read from the source.
    pub rows: u64,
    /// Committed writers in the order they were passed in.
    pub outputs: Vec<(String, WriterOutput)>,
}

#[derive(Clone)]
enum WriterMsg {
    Schema(Arc<SchemaInfo>),
    Row(Arc<Row>),
    End,
    Abort(StreamError),
}

enum WriterExit {
    /// Flushed and waiting for commit.
    Prepared,
    Failed(StreamError),
    /// Rolled back because of the source, another writer, or cancellation.
    Aborted,
}

enum PumpOutcome {
    Completed,
    SourceFailed(StreamError),
    WriterFailed,
    Cancelled,
}

struct Pumped {
    stream: String,
    schema: Option<SchemaInfo>,
    rows: u64,
    outcome: PumpOutcome,
}

/// Copy `reader` into every writer.
///
/// Returns once the reader and all writers are terminal. On success every
/// writer is committed; otherwise all of them are rolled back and the error
/// names the failing stage.
pub fn copy_stream(
    reader: Box<dyn ObjectReader>,
    writers: Vec<(String, Box<dyn ObjectWriter>)>,
    ctx: &CopyContext,
) -> Result<CopyReport> {
    let writer_failed = AtomicBool::new(false);
    let names: Vec<String> = writers.iter().map(|(name, _)| name.clone()).collect();
    let queue_depth = ctx.queue_depth.max(1);

    let (pumped, joined) = std::thread::scope(|scope| {
        let mut senders = Vec::with_capacity(writers.len());
        let mut handles = Vec::with_capacity(writers.len());
        for (name, mut writer) in writers {
            let (tx, rx) = sync_channel(queue_depth);
            senders.push(tx);
            let cancel = &ctx.cancel;
            let failed = &writer_failed;
            handles.push(scope.spawn(move || {
                let exit = drive_writer(&name, writer.as_mut(), rx, cancel, failed);
                (writer, exit)
            }));
        }

        let pumped = pump(reader, senders, ctx, &writer_failed);
        let joined: Vec<_> = handles.into_iter().map(|handle| handle.join()).collect();
        (pumped, joined)
    });

    let mut prepared = Vec::new();
    let mut failures = Vec::new();
    for (name, joined) in names.into_iter().zip(joined) {
        match joined {
            Ok((writer, WriterExit::Prepared)) => prepared.push((name, writer)),
            Ok((_, WriterExit::Failed(error))) => failures.push(WriterFailure {
                writer: name,
                error,
            }),
            Ok((_, WriterExit::Aborted)) => {}
            Err(_) => failures.push(WriterFailure {
                writer: name,
                error: StreamError::sink("writer thread panicked"),
            }),
        }
    }

    let Pumped {
        stream,
        schema,
        rows,
        outcome,
    } = pumped;

    if ctx.cancel.is_cancelled() || matches!(outcome, PumpOutcome::Cancelled) {
        rollback_all(&mut prepared, &StreamError::cancelled());
        info!(stream = %stream, rows, "Copy cancelled");
        return Err(TransferError::Cancelled { rows });
    }
    if let PumpOutcome::SourceFailed(error) = outcome {
        rollback_all(&mut prepared, &error);
        warn!(stream = %stream, "Source failed after {} rows: {}", rows, error.message);
        return Err(TransferError::Source { stream, error });
    }
    if !failures.is_empty() || matches!(outcome, PumpOutcome::WriterFailed) {
        rollback_all(&mut prepared, &StreamError::sink("another writer failed"));
        return Err(TransferError::Writers(failures));
    }

    let mut outputs = Vec::with_capacity(prepared.len());
    let mut pending = prepared.into_iter();
    while let Some((name, mut writer)) = pending.next() {
        match writer.commit() {
            Ok(output) => outputs.push((name, output)),
            Err(err) => {
                let error = StreamError::from_writer_error(&err);
                warn!(writer = %name, "Commit failed: {}", error);
                let mut rest: Vec<_> = pending.collect();
                rollback_all(&mut rest, &error);
                return Err(TransferError::writer(name, error));
            }
        }
    }

    if ctx.progress_interval > 0 {
        (ctx.events)(EventKind::Progress(Progress::Rows {
            stream: stream.clone(),
            rows,
        }));
    }
    info!(stream = %stream, rows, writers = outputs.len(), "Copy finished");
    Ok(CopyReport {
        stream,
        schema: schema.unwrap_or_default(),
        rows,
        outputs,
    })
}

fn rollback_all(writers: &mut [(String, Box<dyn ObjectWriter>)], reason: &StreamError) {
    for (name, writer) in writers.iter_mut() {
        debug!(writer = %name, "Rolling back prepared writer");
        writer.rollback(reason);
    }
}

/// Pull the reader and fan its events out to every writer queue.
fn pump(
    reader: Box<dyn ObjectReader>,
    senders: Vec<SyncSender<WriterMsg>>,
    ctx: &CopyContext,
    writer_failed: &AtomicBool,
) -> Pumped {
    let mut reader = CheckedReader::new(reader);
    let stream = reader.name().to_string();
    let stop = || ctx.cancel.is_cancelled() || writer_failed.load(Ordering::SeqCst);
    let mut schema = None;

    let outcome = 'pump: loop {
        if ctx.cancel.is_cancelled() {
            break PumpOutcome::Cancelled;
        }
        if writer_failed.load(Ordering::SeqCst) {
            break PumpOutcome::WriterFailed;
        }

        let msg = match reader.next_event() {
            Some(StreamEvent::Schema(declared)) => {
                (ctx.events)(EventKind::Schema {
                    stream: stream.clone(),
                    schema: declared.clone(),
                });
                let msg = WriterMsg::Schema(Arc::new(declared.clone()));
                schema = Some(declared);
                msg
            }
            Some(StreamEvent::Row(row)) => {
                let rows = reader.rows();
                if ctx.progress_interval > 0 && rows % ctx.progress_interval == 0 {
                    (ctx.events)(EventKind::Progress(Progress::Rows {
                        stream: stream.clone(),
                        rows,
                    }));
                }
                WriterMsg::Row(Arc::new(row))
            }
            Some(StreamEvent::End) | None => break PumpOutcome::Completed,
            Some(StreamEvent::Error(_)) if ctx.cancel.is_cancelled() => {
                break PumpOutcome::Cancelled
            }
            Some(StreamEvent::Error(error)) => break PumpOutcome::SourceFailed(error),
        };

        for tx in &senders {
            match send_or_stop(tx, msg.clone(), &stop) {
                SendOutcome::Sent => {}
                SendOutcome::Closed => writer_failed.store(true, Ordering::SeqCst),
                SendOutcome::Stopped => continue 'pump,
            }
        }
    };

    let terminal = match &outcome {
        PumpOutcome::Completed => Some(WriterMsg::End),
        PumpOutcome::SourceFailed(error) => Some(WriterMsg::Abort(error.clone())),
        PumpOutcome::WriterFailed => {
            reader.cancel();
            Some(WriterMsg::Abort(StreamError::sink("another writer failed")))
        }
        PumpOutcome::Cancelled => {
            reader.cancel();
            None
        }
    };
    if let Some(msg) = terminal {
        for tx in &senders {
            let _ = send_or_stop(tx, msg.clone(), || ctx.cancel.is_cancelled());
        }
    }
    drop(senders);

    Pumped {
        stream,
        schema,
        rows: reader.rows(),
        outcome,
    }
}

/// Feed one writer from its queue until the stream ends for it.
fn drive_writer(
    name: &str,
    writer: &mut dyn ObjectWriter,
    rx: Receiver<WriterMsg>,
    cancel: &CancellationToken,
    writer_failed: &AtomicBool,
) -> WriterExit {
    loop {
        let msg = match rx.recv() {
            Ok(msg) => msg,
            Err(_) => {
                let reason = if cancel.is_cancelled() {
                    StreamError::cancelled()
                } else {
                    StreamError::source("stream closed before its end")
                };
                writer.rollback(&reason);
                return WriterExit::Aborted;
            }
        };
        if cancel.is_cancelled() {
            writer.rollback(&StreamError::cancelled());
            return WriterExit::Aborted;
        }

        let step = match msg {
            WriterMsg::Schema(schema) => writer.init(&schema),
            WriterMsg::Row(row) => writer.write_row(&row),
            WriterMsg::End => match writer.prepare() {
                Ok(()) => return WriterExit::Prepared,
                Err(err) => Err(err),
            },
            WriterMsg::Abort(reason) => {
                writer.rollback(&reason);
                return WriterExit::Aborted;
            }
        };

        if let Err(err) = step {
            writer_failed.store(true, Ordering::SeqCst);
            let error = StreamError::from_writer_error(&err);
            warn!(writer = name, "Writer failed: {}", error);
            writer.rollback(&error);
            return WriterExit::Failed(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{id_name_row, id_name_schema, ScriptedReader};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Journal {
        log: Arc<Mutex<Vec<String>>>,
        rows: Arc<Mutex<Vec<Row>>>,
    }

    /// Records every call; fails on row `fail_on` when set.
    struct JournalWriter {
        journal: Journal,
        fail_on: Option<usize>,
    }

    impl JournalWriter {
        fn boxed(journal: &Journal, fail_on: Option<usize>) -> Box<dyn ObjectWriter> {
            Box::new(Self {
                journal: journal.clone(),
                fail_on,
            })
        }
    }

    impl ObjectWriter for JournalWriter {
        fn init(&mut self, _schema: &SchemaInfo) -> anyhow::Result<()> {
            self.journal.log.lock().unwrap().push("init".into());
            Ok(())
        }

        fn write_row(&mut self, row: &Row) -> anyhow::Result<()> {
            let mut rows = self.journal.rows.lock().unwrap();
            if Some(rows.len() + 1) == self.fail_on {
                anyhow::bail!("disk full");
            }
            rows.push(row.clone());
            Ok(())
        }

        fn prepare(&mut self) -> anyhow::Result<()> {
            self.journal.log.lock().unwrap().push("prepare".into());
            Ok(())
        }

        fn commit(&mut self) -> anyhow::Result<WriterOutput> {
            self.journal.log.lock().unwrap().push("commit".into());
            Ok(WriterOutput {
                rows: self.journal.rows.lock().unwrap().len() as u64,
                collected: None,
            })
        }

        fn rollback(&mut self, _reason: &StreamError) {
            self.journal.log.lock().unwrap().push("rollback".into());
        }
    }

    fn rows_reader(count: i64, tail: StreamEvent) -> Box<dyn ObjectReader> {
        let mut events = vec![StreamEvent::Schema(id_name_schema())];
        events.extend((1..=count).map(|i| StreamEvent::Row(id_name_row(i, "r"))));
        events.push(tail);
        Box::new(ScriptedReader::new(events))
    }

    fn ctx(queue_depth: usize) -> CopyContext {
        CopyContext {
            queue_depth,
            ..CopyContext::new(CancellationToken::new(), discard_events())
        }
    }

    #[test]
    fn copies_and_commits_every_writer() {
        let (a, b) = (Journal::default(), Journal::default());
        let report = copy_stream(
            rows_reader(10, StreamEvent::End),
            vec![
                ("a".into(), JournalWriter::boxed(&a, None)),
                ("b".into(), JournalWriter::boxed(&b, None)),
            ],
            &ctx(2),
        )
        .unwrap();

        assert_eq!(report.rows, 10);
        assert_eq!(report.schema, id_name_schema());
        assert_eq!(report.outputs.len(), 2);
        assert_eq!(*a.log.lock().unwrap(), ["init", "prepare", "commit"]);
        assert_eq!(a.rows.lock().unwrap().len(), 10);
        assert_eq!(*b.rows.lock().unwrap(), *a.rows.lock().unwrap());
    }

    #[test]
    fn source_error_rolls_back_all_writers() {
        let a = Journal::default();
        let err = copy_stream(
            rows_reader(3, StreamEvent::Error(StreamError::source("connection lost"))),
            vec![("a".into(), JournalWriter::boxed(&a, None))],
            &ctx(8),
        )
        .unwrap_err();

        assert!(matches!(err, TransferError::Source { .. }));
        assert_eq!(err.to_string(), "source 'scripted' failed: connection lost");
        assert_eq!(*a.log.lock().unwrap(), ["init", "rollback"]);
    }

    #[test]
    fn failing_writer_aborts_the_others() {
        let (a, b) = (Journal::default(), Journal::default());
        let err = copy_stream(
            rows_reader(500, StreamEvent::End),
            vec![
                ("a".into(), JournalWriter::boxed(&a, Some(5))),
                ("b".into(), JournalWriter::boxed(&b, None)),
            ],
            &ctx(4),
        )
        .unwrap_err();

        let TransferError::Writers(failures) = err else {
            panic!("expected writer failure");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].writer, "a");
        assert!(failures[0].error.message.contains("disk full"));

        let b_rows = b.rows.lock().unwrap();
        assert!(b_rows.len() >= 4);
        for (i, row) in b_rows.iter().enumerate() {
            assert_eq!(*row, id_name_row(i as i64 + 1, "r"));
        }
        assert_eq!(b.log.lock().unwrap().last().map(String::as_str), Some("rollback"));
        assert!(!b.log.lock().unwrap().contains(&"commit".to_string()));
    }

    #[test]
    fn events_are_reported() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx = CopyContext {
            progress_interval: 2,
            ..CopyContext::new(
                CancellationToken::new(),
                Arc::new(move |event| sink.lock().unwrap().push(event)),
            )
        };
        copy_stream(
            rows_reader(4, StreamEvent::End),
            vec![("a".into(), JournalWriter::boxed(&Journal::default(), None))],
            &ctx,
        )
        .unwrap();

        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], EventKind::Schema { .. }));
        let counts: Vec<u64> = seen
            .iter()
            .filter_map(|e| match e {
                EventKind::Progress(Progress::Rows { rows, .. }) => Some(*rows),
                _ => None,
            })
            .collect();
        assert_eq!(counts, [2, 4, 4]);
    }

    #[test]
    fn cancelled_before_start_writes_nothing() {
        let a = Journal::default();
        let ctx = ctx(4);
        ctx.cancel.cancel();
        let err = copy_stream(
            rows_reader(3, StreamEvent::End),
            vec![("a".into(), JournalWriter::boxed(&a, None))],
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled { rows: 0 }));
        assert!(a.rows.lock().unwrap().is_empty());
        assert!(!a.log.lock().unwrap().contains(&"commit".to_string()));
    }
}
