//! Object writers, one per sink kind.

pub(crate) mod file;
pub(crate) mod json_lines;
mod memory;
mod sheet;
mod table;

pub(crate) use table::{SharedConnection, TableWriter};

use crate::archive::ArchiveWriter;
use crate::driver::TableName;
use crate::finalizer::Finalizer;
use crate::stream::ObjectWriter;
use anyhow::Result;
use gatehouse_protocol::{defaults, ConnectionSpec, EngineKind, PipelineOptions, SinkSpec};
use memory::{CollectorWriter, ConsoleWriter};
use sheet::SheetWriter;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Writer state shared by all sinks of one pipeline.
///
/// Archive sinks targeting the same directory share one [`ArchiveWriter`],
/// which the pipeline commits once every stream finished. Table sinks on the
/// same database share one connection and one transaction. Staged files,
/// archives and open transactions are registered with `finalizer`.
pub struct WriterContext {
    pub collector_limit: usize,
    pub finalizer: Finalizer,
    archives: HashMap<PathBuf, Arc<ArchiveWriter>>,
    connections: HashMap<(EngineKind, String), Arc<SharedConnection>>,
}

impl Default for WriterContext {
    fn default() -> Self {
        Self {
            collector_limit: defaults::DEFAULT_COLLECTOR_LIMIT,
            finalizer: Finalizer::new(),
            archives: HashMap::new(),
            connections: HashMap::new(),
        }
    }
}

impl WriterContext {
    pub fn new(options: &PipelineOptions, finalizer: Finalizer) -> Self {
        Self {
            collector_limit: options.collector_limit,
            finalizer,
            ..Self::default()
        }
    }

    /// Archives opened by archive sinks.
    pub fn archives(&self) -> impl Iterator<Item = &Arc<ArchiveWriter>> {
        self.archives.values()
    }

    /// Take ownership of the opened archives, leaving none behind.
    pub fn take_archives(&mut self) -> Vec<Arc<ArchiveWriter>> {
        self.archives.drain().map(|(_, archive)| archive).collect()
    }

    fn archive(&mut self, path: &Path) -> Result<Arc<ArchiveWriter>> {
        if let Some(archive) = self.archives.get(path) {
            return Ok(Arc::clone(archive));
        }
        let archive = ArchiveWriter::open_with_finalizer(path, &self.finalizer)?;
        self.archives.insert(path.to_path_buf(), Arc::clone(&archive));
        Ok(archive)
    }

    fn connection(&mut self, spec: &ConnectionSpec) -> Result<Arc<SharedConnection>> {
        let key = (spec.engine, spec.database.clone());
        if let Some(shared) = self.connections.get(&key) {
            return Ok(Arc::clone(shared));
        }
        let shared = SharedConnection::open(spec, &self.finalizer)?;
        self.connections.insert(key, Arc::clone(&shared));
        Ok(shared)
    }
}

/// Open the writer for a sink.
///
/// Table sinks connect here, so unreachable targets fail before any row is
/// read. A second table sink on an already connected database reuses that
/// connection.
pub fn open_writer(spec: &SinkSpec, ctx: &mut WriterContext) -> Result<Box<dyn ObjectWriter>> {
    Ok(match spec {
        SinkSpec::Table {
            connection,
            schema,
            table,
            mode,
            batch_size,
        } => Box::new(TableWriter::new(
            ctx.connection(connection)?,
            TableName::new(schema.as_deref(), table.clone()),
            *mode,
            batch_size.unwrap_or(defaults::DEFAULT_INSERT_BATCH_SIZE),
        )),
        SinkSpec::Sheet { path, sheet } => {
            Box::new(SheetWriter::new(path, sheet, ctx.finalizer.clone()))
        }
        SinkSpec::JsonLines { path, header } => Box::new(json_lines::JsonLinesWriter::new(
            path.clone(),
            *header,
            ctx.finalizer.clone(),
        )),
        SinkSpec::Archive { path, entry } => {
            let archive = ctx.archive(path)?;
            Box::new(archive.entry_writer(entry)?)
        }
        SinkSpec::Console {} => Box::<ConsoleWriter>::default(),
        SinkSpec::Collector { name } => {
            Box::new(CollectorWriter::new(name.clone(), ctx.collector_limit))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ContainerError;

    #[test]
    fn archive_sinks_share_one_container() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bundle");
        let mut ctx = WriterContext::default();
        let users = SinkSpec::Archive {
            path: path.clone(),
            entry: "users".into(),
        };
        let orders = SinkSpec::Archive {
            path: path.clone(),
            entry: "orders".into(),
        };
        let _a = open_writer(&users, &mut ctx).unwrap();
        let _b = open_writer(&orders, &mut ctx).unwrap();
        assert_eq!(ctx.archives().count(), 1);

        let err = open_writer(&users, &mut ctx).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ContainerError>(),
            Some(ContainerError::DuplicateEntry(_))
        ));
    }

    #[test]
    fn table_sinks_on_one_database_share_a_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let connection = ConnectionSpec {
            conid: "local".into(),
            engine: EngineKind::Sqlite,
            database: tmp.path().join("x.db").to_string_lossy().into_owned(),
        };
        let sink = |table: &str| SinkSpec::Table {
            connection: connection.clone(),
            schema: None,
            table: table.into(),
            mode: gatehouse_protocol::SinkMode::Replace,
            batch_size: None,
        };
        let mut ctx = WriterContext::default();
        let _a = open_writer(&sink("t1"), &mut ctx).unwrap();
        let _b = open_writer(&sink("t2"), &mut ctx).unwrap();
        assert_eq!(ctx.connections.len(), 1);
        // one connection cleanup plus nothing staged yet
        assert_eq!(ctx.finalizer.pending(), 1);
    }
}
