//! Child side of a runner: `gatehouse-runner exec`.
//!
//! Reads one `Start` frame from stdin, runs the task, and writes `Event`
//! frames to stdout. Further stdin frames may carry `Cancel`; closing stdin
//! also cancels. Logs go to stderr, which the orchestrator captures per run.

use anyhow::{Context, Result};
use gatehouse_protocol::defaults::CANCELLED_BY_USER_MESSAGE;
use gatehouse_protocol::{
    EventKind, FaultStage, Message, OpCode, RunFailure, RunnerTask, StartRequest,
};
use gatehouse_transfer::{run_task, CancellationToken, EventSink, RunContext, TransferError};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Entry point of the `exec` subcommand.
pub fn run_child() -> Result<()> {
    let mut stdin = std::io::stdin();
    let start = Message::read_from(&mut stdin)
        .context("Failed to read start frame")?
        .context("stdin closed before the start frame")?;
    let request: StartRequest = start
        .decode_as(OpCode::Start)
        .context("Invalid start frame")?;
    info!(
        "Runner {} starting: {}",
        request.runner_id.short(),
        request.task.label()
    );

    let cancel = CancellationToken::new();
    watch_for_cancel(stdin, cancel.clone())?;

    let terminal = run_to_frames(&request.task, cancel, Box::new(std::io::stdout()));
    info!("Runner {} done: {}", request.runner_id.short(), terminal.type_name());
    Ok(())
}

/// Cancel the run on a `Cancel` frame or when the orchestrator goes away.
fn watch_for_cancel<R: Read + Send + 'static>(mut input: R, cancel: CancellationToken) -> Result<()> {
    std::thread::Builder::new()
        .name("gatehouse-cancel-watch".into())
        .spawn(move || loop {
            match Message::read_from(&mut input) {
                Ok(Some(msg)) if msg.header.opcode == OpCode::Cancel => {
                    info!("Cancel requested");
                    cancel.cancel();
                }
                Ok(Some(msg)) => {
                    warn!("Ignoring unexpected {:?} frame", msg.header.opcode);
                }
                Ok(None) => {
                    debug!("Orchestrator closed stdin");
                    cancel.cancel();
                    return;
                }
                Err(err) => {
                    warn!("Control channel failed: {}", err);
                    cancel.cancel();
                    return;
                }
            }
        })
        .context("Failed to start cancel watcher")?;
    Ok(())
}

/// Writes events as frames with a per-runner sequence number.
struct FrameEmitter {
    out: Box<dyn Write + Send>,
    seq: u64,
    broken: bool,
}

impl FrameEmitter {
    fn emit(&mut self, event: &EventKind, cancel: &CancellationToken) {
        if self.broken {
            return;
        }
        let written = Message::json(OpCode::Event, self.seq, event)
            .and_then(|msg| msg.write_to(&mut self.out));
        match written {
            Ok(()) => self.seq += 1,
            Err(err) => {
                // orchestrator is gone; nobody is left to receive the rows
                error!("Failed to write event frame: {}", err);
                self.broken = true;
                cancel.cancel();
            }
        }
    }
}

/// Run `task` to completion, writing every event and exactly one terminal
/// event as frames into `out`. Cleanups registered during the run have been
/// executed by the time the terminal frame is written.
pub fn run_to_frames(
    task: &RunnerTask,
    cancel: CancellationToken,
    out: Box<dyn Write + Send>,
) -> EventKind {
    let emitter = Arc::new(Mutex::new(FrameEmitter {
        out,
        seq: 0,
        broken: false,
    }));

    let sink: EventSink = {
        let emitter = Arc::clone(&emitter);
        let cancel = cancel.clone();
        Arc::new(move |event: EventKind| {
            if let Ok(mut emitter) = emitter.lock() {
                emitter.emit(&event, &cancel);
            }
        })
    };
    let ctx = RunContext::new(cancel.clone(), sink);

    let result = run_task(task, &ctx);
    ctx.finalizer.run_all();

    let terminal = match result {
        Ok(summary) => EventKind::Finished(summary),
        Err(TransferError::Cancelled { rows }) => EventKind::Cancelled {
            message: CANCELLED_BY_USER_MESSAGE.to_string(),
            rows,
        },
        Err(err) => {
            let stage = err.stage().unwrap_or(FaultStage::Runner);
            EventKind::Failed(RunFailure::new(stage, err.to_string()))
        }
    };

    match emitter.lock() {
        Ok(mut emitter) => emitter.emit(&terminal, &cancel),
        Err(poisoned) => poisoned.into_inner().emit(&terminal, &cancel),
    }
    terminal
}
