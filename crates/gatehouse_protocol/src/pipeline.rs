//! Pipeline descriptors and runner tasks.
//!
//! Connection parameters, paths and names arrive already validated by the
//! caller; nothing here resolves them.

use crate::defaults;
use crate::types::SinkMode;
use gatehouse_ids::RunnerId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Connections
// ============================================================================

/// Database engine behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Sqlite,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Sqlite => "sqlite",
        }
    }
}

/// Resolved connection parameters handed over by the connection subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub conid: String,
    pub engine: EngineKind,
    /// Engine-specific database locator (file path for sqlite).
    pub database: String,
}

// ============================================================================
// Sources and sinks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Table {
        connection: ConnectionSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
        table: String,
    },
    Query {
        connection: ConnectionSpec,
        sql: String,
    },
    /// A sheet of a workbook directory (`<path>/<sheet>.csv`).
    Sheet { path: PathBuf, sheet: String },
    JsonLines { path: PathBuf },
    Archive { path: PathBuf, entry: String },
    /// Synthetic `{id, name}` rows.
    Fake {
        rows: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
        /// Emit a source error instead of row `fail_after + 1`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fail_after: Option<u64>,
    },
}

impl SourceSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceSpec::Table { .. } => "table",
            SourceSpec::Query { .. } => "query",
            SourceSpec::Sheet { .. } => "sheet",
            SourceSpec::JsonLines { .. } => "json_lines",
            SourceSpec::Archive { .. } => "archive",
            SourceSpec::Fake { .. } => "fake",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            SourceSpec::Table { table, .. } if table.trim().is_empty() => {
                Err("table source requires a table name".into())
            }
            SourceSpec::Query { sql, .. } if sql.trim().is_empty() => {
                Err("query source requires SQL text".into())
            }
            SourceSpec::Sheet { path, sheet } if path.as_os_str().is_empty() || sheet.is_empty() => {
                Err("sheet source requires a path and a sheet name".into())
            }
            SourceSpec::JsonLines { path } if path.as_os_str().is_empty() => {
                Err("json_lines source requires a path".into())
            }
            SourceSpec::Archive { path, entry } if path.as_os_str().is_empty() || entry.is_empty() => {
                Err("archive source requires a path and an entry name".into())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Table {
                connection,
                schema,
                table,
            } => match schema {
                Some(schema) => write!(f, "table {}:{}.{}", connection.conid, schema, table),
                None => write!(f, "table {}:{}", connection.conid, table),
            },
            SourceSpec::Query { connection, .. } => write!(f, "query {}", connection.conid),
            SourceSpec::Sheet { path, sheet } => write!(f, "sheet {}#{}", path.display(), sheet),
            SourceSpec::JsonLines { path } => write!(f, "json_lines {}", path.display()),
            SourceSpec::Archive { path, entry } => write!(f, "archive {}#{}", path.display(), entry),
            SourceSpec::Fake { rows, .. } => write!(f, "fake {} rows", rows),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkSpec {
    Table {
        connection: ConnectionSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
        table: String,
        #[serde(default)]
        mode: SinkMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_size: Option<usize>,
    },
    Sheet {
        path: PathBuf,
        sheet: String,
    },
    JsonLines {
        path: PathBuf,
        /// Write a stream header line declaring the schema.
        #[serde(default)]
        header: bool,
    },
    Archive {
        path: PathBuf,
        entry: String,
    },
    Console {},
    Collector {
        name: String,
    },
}

impl SinkSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            SinkSpec::Table { .. } => "table",
            SinkSpec::Sheet { .. } => "sheet",
            SinkSpec::JsonLines { .. } => "json_lines",
            SinkSpec::Archive { .. } => "archive",
            SinkSpec::Console {} => "console",
            SinkSpec::Collector { .. } => "collector",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            SinkSpec::Table {
                table, batch_size, ..
            } => {
                if table.trim().is_empty() {
                    return Err("table sink requires a table name".into());
                }
                if *batch_size == Some(0) {
                    return Err("table sink batch_size must be at least 1".into());
                }
                Ok(())
            }
            SinkSpec::Sheet { path, sheet } if path.as_os_str().is_empty() || sheet.is_empty() => {
                Err("sheet sink requires a path and a sheet name".into())
            }
            SinkSpec::JsonLines { path, .. } if path.as_os_str().is_empty() => {
                Err("json_lines sink requires a path".into())
            }
            SinkSpec::Archive { path, entry } if path.as_os_str().is_empty() || entry.is_empty() => {
                Err("archive sink requires a path and an entry name".into())
            }
            SinkSpec::Collector { name } if name.is_empty() => {
                Err("collector sink requires a name".into())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for SinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkSpec::Table {
                connection,
                schema,
                table,
                ..
            } => match schema {
                Some(schema) => write!(f, "table {}:{}.{}", connection.conid, schema, table),
                None => write!(f, "table {}:{}", connection.conid, table),
            },
            SinkSpec::Sheet { path, sheet } => write!(f, "sheet {}#{}", path.display(), sheet),
            SinkSpec::JsonLines { path, .. } => write!(f, "json_lines {}", path.display()),
            SinkSpec::Archive { path, entry } => write!(f, "archive {}#{}", path.display(), entry),
            SinkSpec::Console {} => write!(f, "console"),
            SinkSpec::Collector { name } => write!(f, "collector {}", name),
        }
    }
}

// ============================================================================
// Pipelines
// ============================================================================

/// Tuning knobs for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Rows buffered per writer before the reader is suspended.
    pub queue_depth: usize,
    /// Rows between progress events; 0 disables intermediate progress.
    pub progress_interval: u64,
    /// Records sampled for schema inference on untyped sources.
    pub sample_rows: usize,
    /// Maximum rows kept by collector sinks.
    pub collector_limit: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_depth: defaults::DEFAULT_WRITER_QUEUE_DEPTH,
            progress_interval: defaults::DEFAULT_PROGRESS_INTERVAL,
            sample_rows: defaults::DEFAULT_SAMPLE_ROWS,
            collector_limit: defaults::DEFAULT_COLLECTOR_LIMIT,
        }
    }
}

/// One source copied into one or more sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    pub source: SourceSpec,
    pub sinks: Vec<SinkSpec>,
    #[serde(default)]
    pub options: PipelineOptions,
}

impl PipelineDescriptor {
    pub fn new(source: SourceSpec, sinks: Vec<SinkSpec>) -> Self {
        Self {
            source,
            sinks,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sinks.is_empty() {
            return Err("pipeline requires at least one sink".into());
        }
        if self.options.queue_depth == 0 {
            return Err("queue_depth must be at least 1".into());
        }
        if self.options.sample_rows == 0 {
            return Err("sample_rows must be at least 1".into());
        }
        self.source.validate()?;

        let mut archive_entries = HashSet::new();
        let mut collectors = HashSet::new();
        for sink in &self.sinks {
            sink.validate()?;
            match sink {
                SinkSpec::Archive { path, entry } => {
                    if !archive_entries.insert((path.clone(), entry.clone())) {
                        return Err(format!(
                            "archive entry '{}' targeted twice in {}",
                            entry,
                            path.display()
                        ));
                    }
                }
                SinkSpec::Collector { name } => {
                    if !collectors.insert(name.clone()) {
                        return Err(format!("collector '{}' declared twice", name));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn label(&self) -> String {
        let sinks: Vec<String> = self.sinks.iter().map(|s| s.to_string()).collect();
        format!("{} -> {}", self.source, sinks.join(", "))
    }
}

// ============================================================================
// Scripts and runner tasks
// ============================================================================

/// One table exported into an archive entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportItem {
    pub name: String,
    pub source: SourceSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptStep {
    Copy(PipelineDescriptor),
    /// Run a SQL batch against a connection.
    Execute {
        connection: ConnectionSpec,
        sql: String,
    },
    /// Export several sources into one archive, committed as a unit.
    ExportArchive {
        path: PathBuf,
        entries: Vec<ExportItem>,
        /// Write entries in parallel instead of one after another.
        #[serde(default)]
        concurrent: bool,
        #[serde(default)]
        options: PipelineOptions,
    },
    /// Import archive entries into same-named tables.
    ImportArchive {
        path: PathBuf,
        connection: ConnectionSpec,
        /// Entries to import; all committed entries when unset.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entries: Option<Vec<String>>,
        #[serde(default)]
        mode: SinkMode,
        #[serde(default)]
        options: PipelineOptions,
    },
}

impl ScriptStep {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ScriptStep::Copy(pipeline) => pipeline.validate(),
            ScriptStep::Execute { sql, .. } if sql.trim().is_empty() => {
                Err("execute step requires SQL text".into())
            }
            ScriptStep::Execute { .. } => Ok(()),
            ScriptStep::ExportArchive { entries, options, .. } => {
                if entries.is_empty() {
                    return Err("export_archive requires at least one entry".into());
                }
                if options.queue_depth == 0 {
                    return Err("queue_depth must be at least 1".into());
                }
                let mut names = HashSet::new();
                for item in entries {
                    item.source.validate()?;
                    if !names.insert(item.name.as_str()) {
                        return Err(format!("archive entry '{}' exported twice", item.name));
                    }
                }
                Ok(())
            }
            ScriptStep::ImportArchive { options, .. } if options.queue_depth == 0 => {
                Err("queue_depth must be at least 1".into())
            }
            ScriptStep::ImportArchive { .. } => Ok(()),
        }
    }

    pub fn label(&self) -> String {
        match self {
            ScriptStep::Copy(pipeline) => format!("copy {}", pipeline.label()),
            ScriptStep::Execute { connection, .. } => format!("execute on {}", connection.conid),
            ScriptStep::ExportArchive { path, entries, .. } => {
                format!("export {} entries to {}", entries.len(), path.display())
            }
            ScriptStep::ImportArchive {
                path, connection, ..
            } => format!("import {} into {}", path.display(), connection.conid),
        }
    }
}

/// Ordered list of steps; the first failing step fails the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub steps: Vec<ScriptStep>,
}

/// Work handed to a runner process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerTask {
    Pipeline(PipelineDescriptor),
    Script(Script),
}

impl RunnerTask {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RunnerTask::Pipeline(pipeline) => pipeline.validate(),
            RunnerTask::Script(script) => {
                if script.steps.is_empty() {
                    return Err("script requires at least one step".into());
                }
                for (index, step) in script.steps.iter().enumerate() {
                    step.validate()
                        .map_err(|e| format!("step {}: {}", index + 1, e))?;
                }
                Ok(())
            }
        }
    }

    pub fn label(&self) -> String {
        match self {
            RunnerTask::Pipeline(pipeline) => pipeline.label(),
            RunnerTask::Script(script) => format!("script ({} steps)", script.steps.len()),
        }
    }
}

/// Payload of the `Start` frame sent to a runner process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub runner_id: RunnerId,
    pub task: RunnerTask,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite(path: &str) -> ConnectionSpec {
        ConnectionSpec {
            conid: "local".into(),
            engine: EngineKind::Sqlite,
            database: path.into(),
        }
    }

    #[test]
    fn task_json_shape() {
        let json = r#"{
            "type": "pipeline",
            "source": {"kind": "table", "connection": {"conid": "c1", "engine": "sqlite", "database": "/tmp/a.db"}, "table": "users"},
            "sinks": [{"kind": "json_lines", "path": "/tmp/users.jsonl"}, {"kind": "console"}]
        }"#;
        let task: RunnerTask = serde_json::from_str(json).unwrap();
        let RunnerTask::Pipeline(pipeline) = &task else {
            panic!("expected pipeline");
        };
        assert_eq!(pipeline.options, PipelineOptions::default());
        assert_eq!(
            pipeline.sinks[0],
            SinkSpec::JsonLines {
                path: "/tmp/users.jsonl".into(),
                header: false
            }
        );
        assert_eq!(task.label(), "table c1:users -> json_lines /tmp/users.jsonl, console");
        assert!(task.validate().is_ok());
    }

    #[test]
    fn pipeline_without_sinks_is_invalid() {
        let p = PipelineDescriptor::new(
            SourceSpec::Fake {
                rows: 1,
                delay_ms: None,
                fail_after: None,
            },
            vec![],
        );
        assert!(p.validate().unwrap_err().contains("at least one sink"));
    }

    #[test]
    fn duplicate_archive_targets_are_invalid() {
        let sink = SinkSpec::Archive {
            path: "/tmp/arch".into(),
            entry: "users".into(),
        };
        let p = PipelineDescriptor::new(
            SourceSpec::Query {
                connection: sqlite("/tmp/a.db"),
                sql: "select 1".into(),
            },
            vec![sink.clone(), sink],
        );
        assert!(p.validate().unwrap_err().contains("targeted twice"));
    }

    #[test]
    fn script_step_errors_name_the_step() {
        let task = RunnerTask::Script(Script {
            steps: vec![
                ScriptStep::Execute {
                    connection: sqlite("/tmp/a.db"),
                    sql: "create table t(x)".into(),
                },
                ScriptStep::ExportArchive {
                    path: "/tmp/arch".into(),
                    entries: vec![],
                    concurrent: false,
                    options: PipelineOptions::default(),
                },
            ],
        });
        assert_eq!(
            task.validate().unwrap_err(),
            "step 2: export_archive requires at least one entry"
        );
    }
}
