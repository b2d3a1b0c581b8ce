//! Gatehouse runner binary.
//!
//! Usage:
//!     gatehouse-runner run task.json
//!     gatehouse-runner archive list ./exports/nightly
//!     gatehouse-runner exec          (child mode, spawned by the orchestrator)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gatehouse_logging::{init_child_logging, init_logging, LogConfig};
use gatehouse_protocol::config::GatehouseConfig;
use gatehouse_protocol::{RunnerState, RunnerTask};
use gatehouse_runner::{run_child, Session, SessionConfig};
use gatehouse_transfer::ArchiveReader;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "gatehouse-runner", about = "Streaming data transfer runner", version)]
struct Cli {
    /// Gatehouse home directory (logs, default config)
    #[arg(long, global = true, env = "GATEHOUSE_HOME")]
    home: Option<PathBuf>,

    /// Config file (default: <home>/config.toml)
    #[arg(long, global = true, env = "GATEHOUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Debug output on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one task (pipeline or script) and print its events as JSON lines
    Run {
        /// Task file in JSON
        task: PathBuf,
    },

    /// Inspect archives
    Archive {
        #[command(subcommand)]
        command: ArchiveCommand,
    },

    /// Execute a task received on stdin (used by the orchestrator)
    #[command(hide = true)]
    Exec,
}

#[derive(Subcommand, Debug)]
enum ArchiveCommand {
    /// List the entries of a committed archive
    List { path: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(home) = &cli.home {
        std::env::set_var("GATEHOUSE_HOME", home);
    }

    let result = match cli.command {
        Command::Exec => exec(),
        Command::Run { ref task } => run(&cli, task),
        Command::Archive {
            command: ArchiveCommand::List { ref path },
        } => list_archive(path),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn exec() -> Result<ExitCode> {
    init_child_logging()?;
    run_child()?;
    Ok(ExitCode::SUCCESS)
}

fn load_config(cli: &Cli) -> Result<GatehouseConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| gatehouse_logging::gatehouse_home().join("config.toml"));
    GatehouseConfig::load(&path).context("Failed to load configuration")
}

/// Parse a task file, filling the configured queue depth into pipelines that
/// don't set one.
fn load_task(path: &Path, default_queue_depth: usize) -> Result<RunnerTask> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file {}", path.display()))?;
    let mut value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Task file {} is not valid JSON", path.display()))?;
    apply_queue_depth(&mut value, default_queue_depth);
    serde_json::from_value(value)
        .with_context(|| format!("Task file {} is not a valid task", path.display()))
}

fn apply_queue_depth(value: &mut Value, depth: usize) {
    match value {
        Value::Object(map) => {
            if map.contains_key("sinks") {
                let options = map
                    .entry("options")
                    .or_insert_with(|| Value::Object(Default::default()));
                if let Value::Object(options) = options {
                    options
                        .entry("queue_depth")
                        .or_insert_with(|| Value::from(depth));
                }
            }
            for child in map.values_mut() {
                apply_queue_depth(child, depth);
            }
        }
        Value::Array(items) => {
            for item in items {
                apply_queue_depth(item, depth);
            }
        }
        _ => {}
    }
}

fn run(cli: &Cli, task_path: &Path) -> Result<ExitCode> {
    init_logging(LogConfig {
        app_name: "gatehouse",
        verbose: cli.verbose,
        quiet: cli.quiet,
    })?;
    let config = load_config(cli)?;
    let task = load_task(task_path, config.default_queue_depth)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        let session = Session::new("cli", SessionConfig::from_config(&config));
        let id = session.create_runner(task).await?;
        info!("Started runner {}", id);

        let mut events = session.subscribe(&id).await?;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;
        let mut stdout = std::io::stdout();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
                        stdout.flush()?;
                    }
                    None => break,
                },
                _ = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    warn!("Interrupted, cancelling runner {}", id.short());
                    session.cancel_runner(&id).await?;
                }
            }
        }

        let state = session.wait(&id).await?;
        session.close().await;
        Ok::<_, anyhow::Error>(match state {
            RunnerState::Completed => ExitCode::SUCCESS,
            RunnerState::Cancelled => ExitCode::from(EXIT_INTERRUPTED),
            _ => ExitCode::FAILURE,
        })
    })
}

fn list_archive(path: &Path) -> Result<ExitCode> {
    let archive = ArchiveReader::open(path)
        .with_context(|| format!("Failed to open archive {}", path.display()))?;
    let manifest = archive.manifest();
    println!(
        "{} ({} entries, committed {})",
        path.display(),
        manifest.entries.len(),
        manifest.committed_at.to_rfc3339()
    );
    for entry in archive.list_entries() {
        println!(
            "  {:<24} {:>10} rows  {}",
            entry.name,
            entry.rows,
            entry.schema.column_names().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn queue_depth_fills_only_missing_values() {
        let mut task = json!({
            "type": "script",
            "steps": [
                {"step": "copy", "source": {"kind": "fake", "rows": 1}, "sinks": [{"kind": "console"}]},
                {"step": "copy", "source": {"kind": "fake", "rows": 1}, "sinks": [], "options": {"queue_depth": 4}}
            ]
        });
        apply_queue_depth(&mut task, 64);
        assert_eq!(task["steps"][0]["options"]["queue_depth"], 64);
        assert_eq!(task["steps"][1]["options"]["queue_depth"], 4);
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["gatehouse-runner", "run", "task.json", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Run { .. }));
    }
}
