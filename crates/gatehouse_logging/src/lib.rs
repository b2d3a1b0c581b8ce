//! Shared logging setup for the Gatehouse binaries.
//!
//! The orchestrator logs to a size-capped rolling file plus stderr. Runner
//! processes log to stderr only; the orchestrator redirects that stream into
//! a per-run file under [`runs_log_dir`].

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "gatehouse=info,gatehouse_runner=info,gatehouse_transfer=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for an orchestrating binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Only warnings and errors on stderr (file output is unaffected).
    pub quiet: bool,
}

/// Initialize tracing with a rolling file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = SharedRollingWriter::new(&log_dir, config.app_name)
        .context("Failed to initialize rolling log writer")?;

    let file_filter = default_filter();
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else if config.quiet {
        EnvFilter::new("warn")
    } else {
        default_filter()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Stderr-only subscriber for runner processes.
///
/// Output carries no ANSI codes since it ends up in a run log file.
pub fn init_child_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(false)
                .with_target(true)
                .with_filter(default_filter()),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Gatehouse home directory: `$GATEHOUSE_HOME`, else `~/.gatehouse`.
pub fn gatehouse_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("GATEHOUSE_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".gatehouse")
}

/// `<home>/logs`
pub fn logs_dir() -> PathBuf {
    gatehouse_home().join("logs")
}

/// `<home>/logs/runs`, one file per runner process.
pub fn runs_log_dir() -> PathBuf {
    logs_dir().join("runs")
}

/// Ensure the logs directories exist and return the top-level one.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let runs = runs_log_dir();
    fs::create_dir_all(&runs)
        .with_context(|| format!("Failed to create run log directory: {}", runs.display()))?;
    Ok(logs_dir())
}

/// Last `max_bytes` of a log file, starting at a line boundary.
///
/// Used to attach diagnostics to failed runs.
pub fn read_log_tail(path: &Path, max_bytes: usize) -> Option<String> {
    let content = fs::read(path).ok()?;
    let start = content.len().saturating_sub(max_bytes);
    let mut tail = &content[start..];
    if start > 0 {
        if let Some(pos) = tail.iter().position(|b| *b == b'\n') {
            tail = &tail[pos + 1..];
        }
    }
    let text = String::from_utf8_lossy(tail).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// File appender that rotates `<name>.log` into `<name>.log.1 .. .N` once it
/// exceeds `max_size`.
struct RollingFileAppender {
    dir: PathBuf,
    base_name: String,
    max_files: usize,
    max_size: u64,
    file: Option<File>,
    current_size: u64,
}

impl RollingFileAppender {
    fn open(dir: &Path, base_name: &str, max_files: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut appender = Self {
            dir: dir.to_path_buf(),
            base_name: sanitize_name(base_name),
            max_files: max_files.max(1),
            max_size,
            file: None,
            current_size: 0,
        };
        appender.reopen()?;
        if appender.current_size > appender.max_size {
            appender.rotate()?;
        }
        Ok(appender)
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(0))?;
        self.current_size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    /// Index 0 is the live file.
    fn path_for(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.dir.join(format!("{}.log", self.base_name))
        } else {
            self.dir.join(format!("{}.log.{}", self.base_name, index))
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let oldest = self.max_files.saturating_sub(1);
        if oldest > 0 {
            let _ = fs::remove_file(self.path_for(oldest));
            for index in (0..oldest).rev() {
                let src = self.path_for(index);
                if src.exists() {
                    fs::rename(&src, self.path_for(index + 1))?;
                }
            }
        } else {
            let _ = fs::remove_file(self.path_for(0));
        }

        self.reopen()
    }
}

impl Write for RollingFileAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size > 0 && self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let written = file.write(buf)?;
        self.current_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct SharedRollingWriter {
    inner: Arc<Mutex<RollingFileAppender>>,
}

impl SharedRollingWriter {
    fn new(dir: &Path, base_name: &str) -> Result<Self> {
        let appender = RollingFileAppender::open(dir, base_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", base_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(appender)),
        })
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRollingWriter {
    type Writer = SharedRollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
