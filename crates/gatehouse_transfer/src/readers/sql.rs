//! Table and query readers.
//!
//! The driver cursor lives on a producer thread that feeds a bounded queue,
//! so the consumer can stop pulling at any row without holding a borrowed
//! statement. The thread is registered with the run's finalizer.

use crate::channel::{send_or_stop, SendOutcome};
use crate::driver::{open_driver, Access, TableName};
use crate::error::StreamError;
use crate::finalizer::{CleanupToken, Finalizer};
use crate::readers::ReaderContext;
use crate::stream::{ObjectReader, StreamEvent};
use anyhow::{anyhow, Context, Result};
use gatehouse_protocol::ConnectionSpec;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What the producer thread runs.
pub(crate) enum SqlPlan {
    Table(TableName),
    Query(String),
}

pub(crate) struct SqlReader {
    name: String,
    rx: Option<Receiver<StreamEvent>>,
    stop: CancellationToken,
    cancel: CancellationToken,
    finalizer: Finalizer,
    cleanup: Option<CleanupToken>,
}

impl SqlReader {
    pub fn spawn(
        name: String,
        connection: ConnectionSpec,
        plan: SqlPlan,
        ctx: &ReaderContext,
    ) -> Result<Self> {
        let (tx, rx) = sync_channel(ctx.queue_depth.max(1));
        let stop = CancellationToken::new();

        let producer_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("gatehouse-sql-reader".to_string())
            .spawn(move || produce(connection, plan, tx, producer_stop))
            .context("Failed to spawn reader thread")?;

        let handle: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(Some(handle)));
        let cleanup_stop = stop.clone();
        let cleanup = ctx.finalizer.register(format!("reader {}", name), move || {
            cleanup_stop.cancel();
            let handle = handle
                .lock()
                .map_err(|_| anyhow!("reader handle lock poisoned"))?
                .take();
            if let Some(handle) = handle {
                handle
                    .join()
                    .map_err(|_| anyhow!("reader thread panicked"))?;
            }
            Ok(())
        });

        Ok(Self {
            name,
            rx: Some(rx),
            stop,
            cancel: ctx.cancel.clone(),
            finalizer: ctx.finalizer.clone(),
            cleanup: Some(cleanup),
        })
    }

    fn release(&mut self) {
        self.stop.cancel();
        self.rx = None;
        if let Some(token) = self.cleanup.take() {
            self.finalizer.release(token);
        }
    }
}

impl ObjectReader for SqlReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_event(&mut self) -> StreamEvent {
        let event = loop {
            let Some(rx) = self.rx.as_ref() else {
                return StreamEvent::End;
            };
            match rx.recv_timeout(RECV_POLL_INTERVAL) {
                Ok(event) => break event,
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.is_cancelled() {
                        break StreamEvent::Error(StreamError::cancelled());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    break StreamEvent::Error(StreamError::source(
                        "reader thread exited before the end of the stream",
                    ))
                }
            }
        };
        if event.is_terminal() {
            self.release();
        }
        event
    }

    fn cancel(&mut self) {
        debug!(reader = %self.name, "Cancelling SQL reader");
        self.release();
    }
}

impl Drop for SqlReader {
    fn drop(&mut self) {
        self.release();
    }
}

fn produce(
    connection: ConnectionSpec,
    plan: SqlPlan,
    tx: SyncSender<StreamEvent>,
    stop: CancellationToken,
) {
    let mut forward = |event: StreamEvent| {
        send_or_stop(&tx, event, || stop.is_cancelled()) == SendOutcome::Sent
    };

    let result = (|| -> Result<()> {
        let mut driver = open_driver(&connection, Access::Read)?;
        match plan {
            SqlPlan::Table(table) => {
                let declared = driver
                    .table_schema(&table)?
                    .ok_or_else(|| anyhow!("table {} does not exist", table))?;
                let sql = format!("SELECT * FROM {}", table.quoted());
                driver.query(&sql, &mut |event| match event {
                    StreamEvent::Schema(_) => forward(StreamEvent::Schema(declared.clone())),
                    other => forward(other),
                })
            }
            SqlPlan::Query(sql) => driver.query(&sql, &mut forward),
        }
    })();

    if stop.is_cancelled() {
        return;
    }
    let terminal = match result {
        Ok(()) => StreamEvent::End,
        Err(err) => StreamEvent::Error(StreamError::source(format!("{:#}", err))),
    };
    let _ = send_or_stop(&tx, terminal, || stop.is_cancelled());
}
