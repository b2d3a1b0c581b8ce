use crate::driver::{open_driver, Access, Driver, TableName};
use crate::error::StreamError;
use crate::finalizer::{CleanupToken, Finalizer};
use crate::stream::{ObjectWriter, WriterOutput};
use anyhow::{bail, Context, Result};
use gatehouse_protocol::{ConnectionSpec, Row, SchemaInfo, SinkMode};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

struct ConnectionState {
    driver: Box<dyn Driver>,
    /// Writers that joined the open transaction and have not finished.
    members: usize,
    in_transaction: bool,
    /// Set once any member rolled back.
    failed: bool,
    cleanup: Option<CleanupToken>,
}

/// Write connection shared by the table sinks of one pipeline that target
/// the same database.
///
/// All members write inside one transaction. It begins when the first member
/// joins and ends when the last one finishes, committing only if none of
/// them rolled back.
pub(crate) struct SharedConnection {
    conid: String,
    state: Mutex<ConnectionState>,
    finalizer: Finalizer,
}

impl SharedConnection {
    /// Connect and register a rollback of any unfinished transaction with
    /// `finalizer`.
    pub fn open(connection: &ConnectionSpec, finalizer: &Finalizer) -> Result<Arc<Self>> {
        let driver = open_driver(connection, Access::Write)?;
        let shared = Arc::new(Self {
            conid: connection.conid.clone(),
            state: Mutex::new(ConnectionState {
                driver,
                members: 0,
                in_transaction: false,
                failed: false,
                cleanup: None,
            }),
            finalizer: finalizer.clone(),
        });

        let weak = Arc::downgrade(&shared);
        let token = finalizer.register(format!("connection {}", connection.conid), move || {
            if let Some(shared) = weak.upgrade() {
                shared.abort();
            }
            Ok(())
        });
        shared.lock().cleanup = Some(token);
        Ok(shared)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enter the shared transaction, beginning it if needed.
    fn join(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.in_transaction {
            state.driver.begin()?;
            state.in_transaction = true;
            state.failed = false;
        }
        state.members += 1;
        Ok(())
    }

    /// Leave the shared transaction. The last member to leave commits or
    /// rolls it back; a failed commit is rolled back and reported.
    fn leave(&self, committed: bool) -> Result<()> {
        let mut state = self.lock();
        state.members = state.members.saturating_sub(1);
        if !committed {
            state.failed = true;
        }
        if state.members > 0 || !state.in_transaction {
            return Ok(());
        }

        state.in_transaction = false;
        let outcome = if state.failed {
            state.driver.rollback()
        } else {
            match state.driver.commit() {
                Ok(()) => Ok(()),
                Err(err) => {
                    if let Err(rollback) = state.driver.rollback() {
                        debug!("Rollback after failed commit: {:#}", rollback);
                    }
                    Err(err)
                }
            }
        };
        if let Some(token) = state.cleanup.take() {
            self.finalizer.dismiss(token);
        }
        debug!(
            "Closed transaction on {} ({})",
            self.conid,
            if state.failed { "rolled back" } else { "committed" }
        );
        if committed {
            outcome
        } else {
            if let Err(err) = outcome {
                warn!("Rollback on {} failed: {:#}", self.conid, err);
            }
            Ok(())
        }
    }

    /// Roll back whatever is still open, regardless of members.
    fn abort(&self) {
        let mut state = self.lock();
        if state.in_transaction {
            state.in_transaction = false;
            state.members = 0;
            match state.driver.rollback() {
                Ok(()) => warn!("Rolled back unfinished transaction on {}", self.conid),
                Err(err) => warn!("Rollback on {} failed: {:#}", self.conid, err),
            }
        }
        if let Some(token) = state.cleanup.take() {
            self.finalizer.dismiss(token);
        }
    }
}

impl Drop for SharedConnection {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Inserts rows into a database table.
///
/// Table preparation (create, replace) happens inside the connection's
/// transaction, so a rollback also undoes it.
pub(crate) struct TableWriter {
    table: TableName,
    mode: SinkMode,
    batch_size: usize,
    connection: Arc<SharedConnection>,
    columns: Vec<String>,
    buffer: Vec<Row>,
    rows: u64,
    joined: bool,
}

impl TableWriter {
    pub fn new(
        connection: Arc<SharedConnection>,
        table: TableName,
        mode: SinkMode,
        batch_size: usize,
    ) -> Self {
        Self {
            table,
            mode,
            batch_size: batch_size.max(1),
            connection,
            columns: Vec::new(),
            buffer: Vec::new(),
            rows: 0,
            joined: false,
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.connection
            .lock()
            .driver
            .insert_rows(&self.table, &self.columns, &self.buffer)?;
        self.rows += self.buffer.len() as u64;
        debug!(
            "Inserted {} rows into {} (total: {})",
            self.buffer.len(),
            self.table,
            self.rows
        );
        self.buffer.clear();
        Ok(())
    }

    fn prepare_table(&self, schema: &SchemaInfo) -> Result<()> {
        let mut state = self.connection.lock();
        let driver = &mut state.driver;
        let existing = driver.table_schema(&self.table)?;
        match (self.mode, existing) {
            (SinkMode::Error, Some(_)) => {
                bail!("table {} already exists (sink mode: error)", self.table)
            }
            (SinkMode::Replace, Some(_)) => {
                driver.drop_table(&self.table)?;
                driver.create_table(&self.table, schema)?;
            }
            (SinkMode::Append, Some(target)) => {
                if let Some(missing) = schema.column_names().find(|c| !target.contains(c)) {
                    bail!("table {} has no column '{}'", self.table, missing);
                }
            }
            (_, None) => driver.create_table(&self.table, schema)?,
        }
        Ok(())
    }
}

impl ObjectWriter for TableWriter {
    fn init(&mut self, schema: &SchemaInfo) -> Result<()> {
        info!(
            "Initializing table sink: {}:{} (mode: {})",
            self.connection.conid, self.table, self.mode
        );
        self.connection.join()?;
        self.joined = true;
        self.prepare_table(schema)?;
        self.columns = schema.column_names().map(str::to_string).collect();
        Ok(())
    }

    fn write_row(&mut self, row: &Row) -> Result<()> {
        self.buffer.push(row.clone());
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        self.flush()
    }

    fn commit(&mut self) -> Result<WriterOutput> {
        if !self.joined {
            bail!("table writer for {} not initialized", self.table);
        }
        self.joined = false;
        self.connection
            .leave(true)
            .with_context(|| format!("Failed to commit rows into {}", self.table))?;
        info!(
            "Committed table sink: {}:{} ({} rows)",
            self.connection.conid, self.table, self.rows
        );
        Ok(WriterOutput {
            rows: self.rows,
            collected: None,
        })
    }

    fn rollback(&mut self, reason: &StreamError) {
        self.buffer.clear();
        if self.joined {
            self.joined = false;
            warn!("Rolling back table sink {}: {}", self.table, reason);
            // leave(false) never fails
            let _ = self.connection.leave(false);
        }
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if self.joined {
            self.joined = false;
            warn!("Rolling back unfinished table sink {}", self.table);
            let _ = self.connection.leave(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{id_name_row, id_name_schema};
    use gatehouse_protocol::EngineKind;

    fn connection(dir: &tempfile::TempDir) -> ConnectionSpec {
        ConnectionSpec {
            conid: "local".into(),
            engine: EngineKind::Sqlite,
            database: dir.path().join("t.db").to_string_lossy().into_owned(),
        }
    }

    fn count(conn: &ConnectionSpec, table: &str) -> i64 {
        let db = rusqlite::Connection::open(&conn.database).unwrap();
        db.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |r| r.get(0))
            .unwrap()
    }

    fn writer(shared: &Arc<SharedConnection>, table: &str, mode: SinkMode) -> TableWriter {
        TableWriter::new(Arc::clone(shared), TableName::new(None, table), mode, 2)
    }

    fn load(conn: &ConnectionSpec, mode: SinkMode, rows: i64) -> Result<WriterOutput> {
        let shared = SharedConnection::open(conn, &Finalizer::new())?;
        let mut writer = writer(&shared, "people", mode);
        writer.init(&id_name_schema())?;
        for i in 1..=rows {
            writer.write_row(&id_name_row(i, "p"))?;
        }
        writer.prepare()?;
        writer.commit()
    }

    #[test]
    fn modes_control_existing_tables() {
        let dir = tempfile::tempdir().unwrap();
        let conn = connection(&dir);

        assert_eq!(load(&conn, SinkMode::Append, 5).unwrap().rows, 5);
        load(&conn, SinkMode::Append, 3).unwrap();
        assert_eq!(count(&conn, "people"), 8);

        load(&conn, SinkMode::Replace, 2).unwrap();
        assert_eq!(count(&conn, "people"), 2);

        let err = load(&conn, SinkMode::Error, 1).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(count(&conn, "people"), 2);
    }

    #[test]
    fn rollback_discards_inserted_batches() {
        let dir = tempfile::tempdir().unwrap();
        let conn = connection(&dir);
        load(&conn, SinkMode::Append, 1).unwrap();

        let shared = SharedConnection::open(&conn, &Finalizer::new()).unwrap();
        let mut writer = writer(&shared, "people", SinkMode::Replace);
        writer.init(&id_name_schema()).unwrap();
        for i in 1..=5 {
            writer.write_row(&id_name_row(i, "q")).unwrap();
        }
        writer.rollback(&StreamError::source("boom"));
        drop(writer);

        assert_eq!(count(&conn, "people"), 1);
    }

    #[test]
    fn writers_on_one_database_share_the_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let conn = connection(&dir);
        let shared = SharedConnection::open(&conn, &Finalizer::new()).unwrap();
        let mut first = writer(&shared, "t1", SinkMode::Replace);
        let mut second = writer(&shared, "t2", SinkMode::Replace);
        first.init(&id_name_schema()).unwrap();
        second.init(&id_name_schema()).unwrap();
        for i in 1..=5 {
            first.write_row(&id_name_row(i, "a")).unwrap();
            second.write_row(&id_name_row(i, "b")).unwrap();
        }
        first.prepare().unwrap();
        second.prepare().unwrap();

        assert_eq!(first.commit().unwrap().rows, 5);
        // nothing is visible until the last member committed
        let db = rusqlite::Connection::open(&conn.database).unwrap();
        let visible: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name IN ('t1', 't2')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(visible, 0);

        assert_eq!(second.commit().unwrap().rows, 5);
        assert_eq!(count(&conn, "t1"), 5);
        assert_eq!(count(&conn, "t2"), 5);
    }

    #[test]
    fn one_rollback_discards_every_member() {
        let dir = tempfile::tempdir().unwrap();
        let conn = connection(&dir);
        let shared = SharedConnection::open(&conn, &Finalizer::new()).unwrap();
        let mut first = writer(&shared, "t1", SinkMode::Replace);
        let mut second = writer(&shared, "t2", SinkMode::Replace);
        first.init(&id_name_schema()).unwrap();
        second.init(&id_name_schema()).unwrap();
        first.write_row(&id_name_row(1, "a")).unwrap();
        first.prepare().unwrap();
        first.commit().unwrap();
        second.rollback(&StreamError::sink("boom"));

        let db = rusqlite::Connection::open(&conn.database).unwrap();
        let tables: i64 = db
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn finalizer_rolls_back_an_abandoned_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let conn = connection(&dir);
        let finalizer = Finalizer::new();
        let shared = SharedConnection::open(&conn, &finalizer).unwrap();
        let mut stuck = writer(&shared, "people", SinkMode::Replace);
        stuck.init(&id_name_schema()).unwrap();
        stuck.write_row(&id_name_row(1, "a")).unwrap();
        stuck.prepare().unwrap();
        assert_eq!(finalizer.pending(), 1);

        finalizer.run_all();
        drop(stuck);
        drop(shared);
        let db = rusqlite::Connection::open(&conn.database).unwrap();
        let tables: i64 = db
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(tables, 0);
    }
}
