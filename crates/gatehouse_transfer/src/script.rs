//! Runner tasks: a single pipeline or a script of ordered steps.

use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::coupler::{copy_stream, CopyReport};
use crate::driver::{open_driver, Access, TableName};
use crate::error::{Result, StreamError, TransferError};
use crate::pipeline::{record_copy, run_pipeline, RunContext};
use crate::readers::open_reader;
use crate::readers::tracked::TrackedReader;
use crate::stream::{ObjectReader, ObjectWriter};
use crate::writers::{SharedConnection, TableWriter};
use gatehouse_protocol::{
    defaults, ConnectionSpec, EventKind, ExportItem, PipelineOptions, Progress, RunSummary,
    RunnerTask, Script, ScriptStep, SinkMode,
};
use std::path::Path;
use tracing::{info, warn};

/// Execute a runner task to completion.
pub fn run_task(task: &RunnerTask, ctx: &RunContext) -> Result<RunSummary> {
    match task {
        RunnerTask::Pipeline(pipeline) => run_pipeline(pipeline, ctx),
        RunnerTask::Script(script) => run_script(script, ctx),
    }
}

/// Run steps in order. The first failing step fails the script; a
/// cancellation reports the rows of every step so far.
pub fn run_script(script: &Script, ctx: &RunContext) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    for (index, step) in script.steps.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return Err(TransferError::Cancelled { rows: summary.rows });
        }
        let label = step.label();
        info!("Step {}: {}", index + 1, label);
        ctx.emit(EventKind::Progress(Progress::StepStarted { index, label }));

        let step_summary = run_step(step, ctx).map_err(|err| match err {
            TransferError::Cancelled { rows } => TransferError::Cancelled {
                rows: summary.rows + rows,
            },
            other => other,
        })?;

        summary.rows += step_summary.rows;
        summary.outputs.extend(step_summary.outputs);
        summary.collected.extend(step_summary.collected);
        ctx.emit(EventKind::Progress(Progress::StepFinished { index }));
    }
    Ok(summary)
}

fn run_step(step: &ScriptStep, ctx: &RunContext) -> Result<RunSummary> {
    match step {
        ScriptStep::Copy(pipeline) => run_pipeline(pipeline, ctx),
        ScriptStep::Execute { connection, sql } => {
            execute(connection, sql)?;
            Ok(RunSummary::default())
        }
        ScriptStep::ExportArchive {
            path,
            entries,
            concurrent,
            options,
        } => export_archive(path, entries, *concurrent, options, ctx),
        ScriptStep::ImportArchive {
            path,
            connection,
            entries,
            mode,
            options,
        } => import_archive(path, connection, entries.as_deref(), *mode, options, ctx),
    }
}

fn execute(connection: &ConnectionSpec, sql: &str) -> Result<()> {
    let writer = format!("execute {}", connection.conid);
    let mut driver = open_driver(connection, Access::Write)
        .map_err(|err| TransferError::writer(writer.clone(), StreamError::from_writer_error(&err)))?;
    driver
        .execute_batch(sql)
        .map_err(|err| TransferError::writer(writer, StreamError::from_writer_error(&err)))
}

/// Export every item into one archive. The manifest is written only when all
/// entries succeeded.
fn export_archive(
    path: &Path,
    items: &[ExportItem],
    concurrent: bool,
    options: &PipelineOptions,
    ctx: &RunContext,
) -> Result<RunSummary> {
    let archive = ArchiveWriter::open_with_finalizer(path, &ctx.finalizer)?;
    let reader_ctx = ctx.reader_context(options);
    let copy_ctx = ctx.copy_context(options);

    let export_one = |item: &ExportItem| -> Result<CopyReport> {
        ctx.emit(EventKind::Progress(Progress::EntryStarted {
            entry: item.name.clone(),
        }));
        let writer = archive.entry_writer(&item.name)?;
        let reader = open_reader(&item.source, &reader_ctx);
        let report = copy_stream(
            reader,
            vec![(
                format!("archive entry {}", item.name),
                Box::new(writer) as Box<dyn ObjectWriter>,
            )],
            &copy_ctx,
        )?;
        ctx.emit(EventKind::Progress(Progress::EntryFinished {
            entry: item.name.clone(),
            rows: report.rows,
        }));
        Ok(report)
    };

    let results: Vec<Result<CopyReport>> = if concurrent {
        let export_one = &export_one;
        std::thread::scope(|scope| {
            let handles: Vec<_> = items
                .iter()
                .map(|item| scope.spawn(move || export_one(item)))
                .collect();
            handles
                .into_iter()
                .zip(items)
                .map(|(handle, item)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(TransferError::writer(
                            format!("archive entry {}", item.name),
                            StreamError::sink("export thread panicked"),
                        ))
                    })
                })
                .collect()
        })
    } else {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let result = export_one(item);
            let failed = result.is_err();
            results.push(result);
            if failed {
                break;
            }
        }
        results
    };

    let mut summary = RunSummary::default();
    let mut first_error = None;
    let mut cancelled_rows = None;
    for result in results {
        match result {
            Ok(report) => record_copy(&mut summary, report),
            Err(TransferError::Cancelled { rows }) => {
                *cancelled_rows.get_or_insert(0) += rows;
            }
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    if let Some(rows) = cancelled_rows {
        archive.abandon();
        return Err(TransferError::Cancelled {
            rows: summary.rows + rows,
        });
    }
    if let Some(err) = first_error {
        warn!("Export to {} failed: {}", path.display(), err);
        archive.abandon();
        return Err(err);
    }
    archive.commit()?;
    Ok(summary)
}

/// Import archive entries into same-named tables, one transaction per table.
fn import_archive(
    path: &Path,
    connection: &ConnectionSpec,
    entries: Option<&[String]>,
    mode: SinkMode,
    options: &PipelineOptions,
    ctx: &RunContext,
) -> Result<RunSummary> {
    let archive = ArchiveReader::open(path)?;
    let names: Vec<String> = match entries {
        Some(names) => names.to_vec(),
        None => archive
            .list_entries()
            .iter()
            .map(|entry| entry.name.clone())
            .collect(),
    };
    let copy_ctx = ctx.copy_context(options);

    let mut summary = RunSummary::default();
    for name in names {
        if ctx.cancel.is_cancelled() {
            return Err(TransferError::Cancelled { rows: summary.rows });
        }
        ctx.emit(EventKind::Progress(Progress::EntryStarted {
            entry: name.clone(),
        }));
        let reader: Box<dyn ObjectReader> =
            Box::new(TrackedReader::new(archive.open_entry(&name)?, &ctx.finalizer));
        let writer_name = format!("table {}:{}", connection.conid, name);
        let shared = SharedConnection::open(connection, &ctx.finalizer).map_err(|err| {
            TransferError::writer(writer_name.clone(), StreamError::from_writer_error(&err))
        })?;
        let writer = TableWriter::new(
            shared,
            TableName::new(None, name.clone()),
            mode,
            defaults::DEFAULT_INSERT_BATCH_SIZE,
        );

        let writers: Vec<(String, Box<dyn ObjectWriter>)> = vec![(writer_name, Box::new(writer))];
        let report = copy_stream(reader, writers, &copy_ctx)
            .map_err(|err| match err {
                TransferError::Cancelled { rows } => TransferError::Cancelled {
                    rows: summary.rows + rows,
                },
                other => other,
            })?;
        ctx.emit(EventKind::Progress(Progress::EntryFinished {
            entry: name.clone(),
            rows: report.rows,
        }));
        record_copy(&mut summary, report);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ContainerError;
    use tokio_util::sync::CancellationToken;
    use crate::coupler::discard_events;
    use gatehouse_protocol::{EngineKind, FaultStage, SourceSpec};
    use std::sync::{Arc, Mutex};

    fn sqlite(dir: &tempfile::TempDir, file: &str) -> ConnectionSpec {
        ConnectionSpec {
            conid: file.into(),
            engine: EngineKind::Sqlite,
            database: dir.path().join(file).to_string_lossy().into_owned(),
        }
    }

    fn fake(rows: u64) -> SourceSpec {
        SourceSpec::Fake {
            rows,
            delay_ms: None,
            fail_after: None,
        }
    }

    #[test]
    fn first_failing_step_stops_the_script() {
        let tmp = tempfile::tempdir().unwrap();
        let db = sqlite(&tmp, "a.db");
        let script = Script {
            steps: vec![
                ScriptStep::Execute {
                    connection: db.clone(),
                    sql: "CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);".into(),
                },
                ScriptStep::Execute {
                    connection: db.clone(),
                    sql: "INSERT INTO missing VALUES (1);".into(),
                },
                ScriptStep::Execute {
                    connection: db.clone(),
                    sql: "INSERT INTO t VALUES (2);".into(),
                },
            ],
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx = RunContext::new(
            CancellationToken::new(),
            Arc::new(move |event| sink.lock().unwrap().push(event)),
        );

        let err = run_script(&script, &ctx).unwrap_err();
        assert_eq!(err.stage(), Some(FaultStage::Sink));
        assert!(err.to_string().contains("missing"));

        let started = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, EventKind::Progress(Progress::StepStarted { .. })))
            .count();
        assert_eq!(started, 2);

        let conn = rusqlite::Connection::open(&db.database).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn concurrent_export_commits_all_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("bundle");
        let items: Vec<ExportItem> = (1..=3)
            .map(|i| ExportItem {
                name: format!("part{}", i),
                source: fake(i * 10),
            })
            .collect();
        let ctx = RunContext::new(CancellationToken::new(), discard_events());
        let summary =
            export_archive(&root, &items, true, &PipelineOptions::default(), &ctx).unwrap();
        assert_eq!(summary.rows, 60);

        let archive = ArchiveReader::open(&root).unwrap();
        let mut rows: Vec<(String, u64)> = archive
            .list_entries()
            .iter()
            .map(|e| (e.name.clone(), e.rows))
            .collect();
        rows.sort();
        assert_eq!(
            rows,
            [
                ("part1".to_string(), 10),
                ("part2".to_string(), 20),
                ("part3".to_string(), 30)
            ]
        );
    }

    #[test]
    fn failed_export_item_abandons_the_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("bundle");
        let items = vec![
            ExportItem {
                name: "good".into(),
                source: fake(5),
            },
            ExportItem {
                name: "bad".into(),
                source: SourceSpec::Fake {
                    rows: 5,
                    delay_ms: None,
                    fail_after: Some(2),
                },
            },
        ];
        let ctx = RunContext::new(CancellationToken::new(), discard_events());
        let err =
            export_archive(&root, &items, false, &PipelineOptions::default(), &ctx).unwrap_err();
        assert_eq!(err.stage(), Some(FaultStage::Source));
        assert!(matches!(
            ArchiveReader::open(&root),
            Err(ContainerError::Incomplete(_))
        ));
    }

    #[test]
    fn importing_a_missing_entry_is_a_container_error() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("bundle");
        let ctx = RunContext::new(CancellationToken::new(), discard_events());
        export_archive(
            &root,
            &[ExportItem {
                name: "users".into(),
                source: fake(2),
            }],
            false,
            &PipelineOptions::default(),
            &ctx,
        )
        .unwrap();

        let wanted = vec!["orders".to_string()];
        let err = import_archive(
            &root,
            &sqlite(&tmp, "b.db"),
            Some(&wanted),
            SinkMode::Append,
            &PipelineOptions::default(),
            &ctx,
        )
        .unwrap_err();
        assert_eq!(err.stage(), Some(FaultStage::Container));
        assert!(err.to_string().contains("orders"));
    }
}
