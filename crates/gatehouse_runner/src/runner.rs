//! Orchestrator side of a runner: spawn the child process, relay its event
//! frames into an [`EventHub`], and enforce cancellation.

use crate::error::{Result, RunnerError};
use crate::hub::{EventHub, Subscription};
use crate::ipc;
use chrono::{DateTime, Utc};
use gatehouse_protocol::config::GatehouseConfig;
use gatehouse_protocol::defaults::{CANCELLED_BY_USER_MESSAGE, DEFAULT_RUNNER_EXECUTABLE};
use gatehouse_protocol::{
    EventKind, FaultStage, Message, OpCode, Progress, RunFailure, RunnerId, RunnerState,
    RunnerTask, StartRequest,
};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bytes of the run log attached to failures.
const LOG_TAIL_BYTES: usize = 4096;
const FRAME_BUFFER: usize = 64;

/// How runners are launched.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub executable: PathBuf,
    pub log_dir: PathBuf,
    /// Time a runner gets to wind down after a cancel before it is killed.
    pub cancel_grace: Duration,
}

impl RunnerOptions {
    pub fn from_config(config: &GatehouseConfig) -> Self {
        Self {
            executable: config
                .runner_executable
                .clone()
                .unwrap_or_else(default_executable),
            log_dir: config
                .run_log_dir
                .clone()
                .unwrap_or_else(gatehouse_logging::runs_log_dir),
            cancel_grace: config.cancel_grace(),
        }
    }
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self::from_config(&GatehouseConfig::default())
    }
}

/// `gatehouse-runner` next to the current executable, else whatever `PATH`
/// resolves.
fn default_executable() -> PathBuf {
    let file_name = format!("{}{}", DEFAULT_RUNNER_EXECUTABLE, std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(file_name))
}

/// A spawned runner.
///
/// Dropping the handle does not stop the runner; the child is killed only
/// when the supervising task itself is dropped (runtime shutdown).
pub struct RunnerHandle {
    id: RunnerId,
    label: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    log_path: PathBuf,
    hub: Arc<EventHub>,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl RunnerHandle {
    pub fn id(&self) -> &RunnerId {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn hub(&self) -> Arc<EventHub> {
        Arc::clone(&self.hub)
    }

    pub fn state(&self) -> RunnerState {
        self.hub.state()
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Request cancellation. No-op once the runner is terminal; repeated
    /// calls are no-ops too.
    pub fn cancel(&self) {
        if self.hub.state().is_terminal() || self.cancel.is_cancelled() {
            return;
        }
        info!("Cancelling runner {}", self.id.short());
        self.cancel.cancel();
    }

    /// True once the supervisor has published the terminal event and reaped
    /// the child.
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    pub async fn wait(&self) -> RunnerState {
        self.hub.wait().await
    }

    /// True once the runner finished and no subscription or waiter still
    /// holds its event hub.
    pub fn is_drained(&self) -> bool {
        self.is_finished() && Arc::strong_count(&self.hub) == 1
    }
}

/// Spawn a runner process for `task`. Must be called inside a tokio runtime.
///
/// The returned handle's hub already holds the `started` event.
pub fn spawn_runner(task: RunnerTask, options: &RunnerOptions) -> Result<RunnerHandle> {
    task.validate().map_err(RunnerError::InvalidTask)?;

    let id = RunnerId::new();
    let label = task.label();

    fs::create_dir_all(&options.log_dir).map_err(|source| RunnerError::Log {
        path: options.log_dir.clone(),
        source,
    })?;
    let log_path = options.log_dir.join(format!("{}.log", id));
    let log_file = File::create(&log_path).map_err(|source| RunnerError::Log {
        path: log_path.clone(),
        source,
    })?;

    let mut child = Command::new(&options.executable)
        .arg("exec")
        .env("GATEHOUSE_RUNNER_ID", id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(log_file))
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| RunnerError::Spawn {
            executable: options.executable.clone(),
            source,
        })?;

    let pid = child.id();
    let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            let _ = child.start_kill();
            return Err(RunnerError::Spawn {
                executable: options.executable.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "runner stdio not captured",
                ),
            });
        }
    };

    info!(
        "Spawned runner {} (pid {:?}): {}",
        id.short(),
        pid,
        label
    );

    let hub = EventHub::new(id);
    hub.publish(EventKind::Started {
        pid,
        label: label.clone(),
    });

    let cancel = CancellationToken::new();
    let supervisor = tokio::spawn(supervise(Supervised {
        child,
        stdin,
        stdout,
        request: StartRequest {
            runner_id: id,
            task,
        },
        hub: Arc::clone(&hub),
        cancel: cancel.clone(),
        grace: options.cancel_grace,
        log_path: log_path.clone(),
    }));

    Ok(RunnerHandle {
        id,
        label,
        pid,
        started_at: Utc::now(),
        log_path,
        hub,
        cancel,
        supervisor,
    })
}

struct Supervised {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    request: StartRequest,
    hub: Arc<EventHub>,
    cancel: CancellationToken,
    grace: Duration,
    log_path: PathBuf,
}

/// Rows per stream as last reported by the child.
#[derive(Default)]
struct RowTally(HashMap<String, u64>);

impl RowTally {
    fn observe(&mut self, kind: &EventKind) {
        if let EventKind::Progress(Progress::Rows { stream, rows }) = kind {
            self.0.insert(stream.clone(), *rows);
        }
    }

    fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

async fn supervise(run: Supervised) {
    let Supervised {
        mut child,
        stdin,
        mut stdout,
        request,
        hub,
        cancel,
        grace,
        log_path,
    } = run;
    let short = request.runner_id.short();

    let mut stdin = Some(stdin);
    if let Some(pipe) = stdin.as_mut() {
        if let Err(err) = ipc::send_json(pipe, OpCode::Start, 0, &request).await {
            warn!("Runner {}: failed to send start frame: {}", short, err);
        }
    }

    let (frame_tx, mut frames) = mpsc::channel(FRAME_BUFFER);
    let pump = tokio::spawn(async move {
        loop {
            match ipc::read_message(&mut stdout).await {
                Ok(Some(msg)) => {
                    if frame_tx.send(Ok(msg)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = frame_tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });

    let mut frames_done = false;
    let mut cancel_requested = false;
    let mut deadline: Option<Instant> = None;
    let mut killed = false;
    let mut terminal: Option<EventKind> = None;
    let mut tally = RowTally::default();

    let status = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled(), if !cancel_requested => {
                cancel_requested = true;
                deadline = Some(Instant::now() + grace);
                if let Some(pipe) = stdin.as_mut() {
                    let sent = match Message::new(OpCode::Cancel, 1, Vec::new()) {
                        Ok(msg) => ipc::write_message(pipe, &msg).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = sent {
                        debug!("Runner {}: cancel frame not delivered: {}", short, err);
                    }
                }
            }

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !killed => {
                warn!(
                    "Runner {} ignored cancel for {:?}, killing",
                    short, grace
                );
                if let Err(err) = child.start_kill() {
                    warn!("Runner {}: kill failed: {}", short, err);
                }
                killed = true;
            }

            frame = frames.recv(), if !frames_done => match frame {
                Some(Ok(msg)) => match msg.decode_as::<EventKind>(OpCode::Event) {
                    Ok(kind) => relay(&hub, &short, kind, &mut terminal, &mut tally),
                    Err(err) => warn!("Runner {}: undecodable frame: {}", short, err),
                },
                Some(Err(err)) => {
                    warn!("Runner {}: event stream broken: {}", short, err);
                    frames_done = true;
                }
                None => frames_done = true,
            },

            status = child.wait(), if frames_done => break status,
        }
    };
    drop(stdin);
    pump.abort();

    let final_event = finish(terminal, &status, killed || cancel_requested, tally.total(), &log_path);
    if !matches!(&status, Ok(s) if s.success()) {
        debug!("Runner {} exited with {}", short, describe_exit(&status));
    }
    info!("Runner {} {}", short, final_event.type_name());
    hub.publish(final_event);
}

fn relay(
    hub: &EventHub,
    short: &str,
    kind: EventKind,
    terminal: &mut Option<EventKind>,
    tally: &mut RowTally,
) {
    if terminal.is_some() {
        warn!("Runner {}: ignoring {} after terminal event", short, kind.type_name());
        return;
    }
    match kind {
        // published by the orchestrator at spawn
        EventKind::Started { .. } => {}
        kind if kind.is_terminal() => *terminal = Some(kind),
        kind => {
            tally.observe(&kind);
            hub.publish(kind);
        }
    }
}

/// The event that closes the run.
fn finish(
    terminal: Option<EventKind>,
    status: &std::io::Result<ExitStatus>,
    cancel_requested: bool,
    rows: u64,
    log_path: &Path,
) -> EventKind {
    match terminal {
        Some(EventKind::Failed(mut failure)) => {
            if failure.detail.is_none() {
                failure.detail = gatehouse_logging::read_log_tail(log_path, LOG_TAIL_BYTES);
            }
            EventKind::Failed(failure)
        }
        Some(kind) => {
            if !matches!(status, Ok(s) if s.success()) {
                warn!(
                    "Runner reported {} but exited with {}",
                    kind.type_name(),
                    describe_exit(status)
                );
            }
            kind
        }
        None if cancel_requested => EventKind::Cancelled {
            message: CANCELLED_BY_USER_MESSAGE.to_string(),
            rows,
        },
        None => EventKind::Failed(RunFailure {
            stage: FaultStage::Runner,
            message: format!("runner exited abnormally ({})", describe_exit(status)),
            detail: gatehouse_logging::read_log_tail(log_path, LOG_TAIL_BYTES),
        }),
    }
}

fn describe_exit(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(err) => format!("wait failed: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_protocol::RunSummary;

    fn exited(code: i32) -> std::io::Result<ExitStatus> {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Ok(ExitStatus::from_raw(code << 8))
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::ExitStatusExt;
            Ok(ExitStatus::from_raw(code as u32))
        }
    }

    #[test]
    fn child_terminal_event_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.log");
        let kind = finish(
            Some(EventKind::Finished(RunSummary::default())),
            &exited(3),
            true,
            0,
            &log,
        );
        assert!(matches!(kind, EventKind::Finished(_)));
    }

    #[test]
    fn silent_crash_fails_with_log_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.log");
        fs::write(&log, "starting\npanicked at 'boom'\n").unwrap();
        let EventKind::Failed(failure) = finish(None, &exited(101), false, 0, &log) else {
            panic!("expected failure");
        };
        assert_eq!(failure.stage, FaultStage::Runner);
        assert!(failure.message.starts_with("runner exited abnormally"));
        assert!(failure.detail.unwrap().contains("boom"));
    }

    #[test]
    fn killed_after_cancel_is_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let kind = finish(None, &exited(137), true, 42, &tmp.path().join("none.log"));
        assert_eq!(
            kind,
            EventKind::Cancelled {
                message: CANCELLED_BY_USER_MESSAGE.to_string(),
                rows: 42,
            }
        );
    }

    #[test]
    fn tally_sums_latest_per_stream() {
        let mut tally = RowTally::default();
        for (stream, rows) in [("a", 10), ("b", 5), ("a", 20)] {
            tally.observe(&EventKind::Progress(Progress::Rows {
                stream: stream.into(),
                rows,
            }));
        }
        assert_eq!(tally.total(), 25);
    }
}
