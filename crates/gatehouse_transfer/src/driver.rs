//! Engine driver seam.
//!
//! Table and query readers, the table writer and the `execute` script step
//! only talk to a [`Driver`]. SQLite is the in-tree engine.

use crate::stream::StreamEvent;
use anyhow::{Context, Result};
use gatehouse_protocol::{ColumnInfo, ConnectionSpec, DataType, EngineKind, Row, SchemaInfo, Value};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, OpenFlags, ToSql};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// SQLite's default limit on bound parameters per statement.
const SQLITE_MAX_PARAMS: usize = 32_766;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Optionally schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(schema: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// How a connection is going to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Operations the transfer layer needs from a database engine.
pub trait Driver: Send {
    fn engine(&self) -> EngineKind;

    /// Run a query, calling `on_event` with one `Schema` then one `Row` per
    /// result row. Stops early when `on_event` returns false.
    fn query(&mut self, sql: &str, on_event: &mut dyn FnMut(StreamEvent) -> bool) -> Result<()>;

    /// Run a batch of statements without results.
    fn execute_batch(&mut self, sql: &str) -> Result<()>;

    /// Declared columns of a table, `None` when it does not exist.
    fn table_schema(&mut self, table: &TableName) -> Result<Option<SchemaInfo>>;

    fn create_table(&mut self, table: &TableName, schema: &SchemaInfo) -> Result<()>;

    fn drop_table(&mut self, table: &TableName) -> Result<()>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Insert rows as grouped statements. Missing columns are written as null.
    fn insert_rows(&mut self, table: &TableName, columns: &[String], rows: &[Row]) -> Result<()>;
}

/// Open a driver for a resolved connection.
pub fn open_driver(spec: &ConnectionSpec, access: Access) -> Result<Box<dyn Driver>> {
    match spec.engine {
        EngineKind::Sqlite => Ok(Box::new(SqliteDriver::open(&spec.database, access)?)),
    }
}

pub struct SqliteDriver {
    conn: Connection,
}

impl SqliteDriver {
    pub fn open(database: &str, access: Access) -> Result<Self> {
        let conn = match access {
            Access::Read => Connection::open_with_flags(
                database,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
            Access::Write => Connection::open(database),
        }
        .with_context(|| format!("Failed to open SQLite database: {}", database))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set SQLite busy timeout")?;
        if access == Access::Write {
            // WAL lets a reader of the same file run alongside the writer
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .context("Failed to enable WAL journal mode")?;
            debug!("Opened {} for writing (journal_mode={})", database, mode);
        }
        Ok(Self { conn })
    }

    fn sql_type(data_type: DataType) -> &'static str {
        match data_type {
            DataType::Boolean => "BOOLEAN",
            DataType::Int64 => "INTEGER",
            DataType::Float64 => "REAL",
            DataType::String => "TEXT",
            DataType::Unknown => "",
        }
    }
}

/// Map a declared SQLite column type onto a data type, following SQLite's
/// affinity rules.
fn decl_type_to_data_type(decl: Option<&str>) -> DataType {
    let Some(decl) = decl else {
        return DataType::Unknown;
    };
    let upper = decl.to_ascii_uppercase();
    if upper.contains("BOOL") {
        DataType::Boolean
    } else if upper.contains("INT") {
        DataType::Int64
    } else if upper.contains("REAL")
        || upper.contains("FLOA")
        || upper.contains("DOUB")
        || upper.contains("NUMERIC")
        || upper.contains("DECIMAL")
    {
        DataType::Float64
    } else if upper.is_empty() {
        DataType::Unknown
    } else {
        DataType::String
    }
}

fn value_from_sql(value: ValueRef<'_>, data_type: DataType) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) if data_type == DataType::Boolean => Value::Bool(v != 0),
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Text(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
    }
}

struct SqlValue<'a>(&'a Value);

impl ToSql for SqlValue<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Bool(v) => ToSqlOutput::Borrowed(ValueRef::Integer(i64::from(*v))),
            Value::Int(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

impl Driver for SqliteDriver {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    fn query(&mut self, sql: &str, on_event: &mut dyn FnMut(StreamEvent) -> bool) -> Result<()> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare query")?;
        let columns: Vec<ColumnInfo> = stmt
            .columns()
            .iter()
            .map(|c| ColumnInfo::new(c.name(), decl_type_to_data_type(c.decl_type())))
            .collect();
        let types: Vec<DataType> = columns.iter().map(|c| c.data_type).collect();
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

        if !on_event(StreamEvent::Schema(SchemaInfo::new(columns))) {
            return Ok(());
        }

        let mut rows = stmt.query([]).context("Failed to execute query")?;
        while let Some(sql_row) = rows.next().context("Failed to fetch row")? {
            let mut row = Row::with_capacity(names.len());
            for (idx, name) in names.iter().enumerate() {
                let value = sql_row.get_ref(idx).context("Failed to read column")?;
                row.insert(name.clone(), value_from_sql(value, types[idx]));
            }
            if !on_event(StreamEvent::Row(row)) {
                debug!("Query consumer stopped early");
                break;
            }
        }
        Ok(())
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .context("Failed to execute SQL batch")
    }

    fn table_schema(&mut self, table: &TableName) -> Result<Option<SchemaInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, type, \"notnull\" FROM pragma_table_info(?1, ?2)")
            .context("Failed to prepare table_info query")?;
        let schema_name = table.schema.as_deref().unwrap_or("main");
        let columns = stmt
            .query_map([table.name.as_str(), schema_name], |row| {
                let name: String = row.get(0)?;
                let decl: Option<String> = row.get(1)?;
                let not_null: i64 = row.get(2)?;
                let col = ColumnInfo::new(name, decl_type_to_data_type(decl.as_deref()));
                Ok(if not_null != 0 { col.not_null() } else { col })
            })
            .context("Failed to read table_info")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read table_info")?;
        if columns.is_empty() {
            Ok(None)
        } else {
            Ok(Some(SchemaInfo::new(columns)))
        }
    }

    fn create_table(&mut self, table: &TableName, schema: &SchemaInfo) -> Result<()> {
        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|c| {
                let mut def = quote_ident(&c.name);
                let sql_type = Self::sql_type(c.data_type);
                if !sql_type.is_empty() {
                    def.push(' ');
                    def.push_str(sql_type);
                }
                if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();
        let sql = format!("CREATE TABLE {} ({})", table.quoted(), columns.join(", "));
        debug!("CREATE TABLE: {}", sql);
        self.conn
            .execute(&sql, [])
            .with_context(|| format!("Failed to create table {}", table))?;
        Ok(())
    }

    fn drop_table(&mut self, table: &TableName) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", table.quoted());
        self.conn
            .execute(&sql, [])
            .with_context(|| format!("Failed to drop table {}", table))?;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN")
            .context("Failed to begin transaction")
    }

    fn commit(&mut self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .context("Failed to commit transaction")
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .context("Failed to roll back transaction")
    }

    fn insert_rows(&mut self, table: &TableName, columns: &[String], rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        if columns.is_empty() {
            let sql = format!("INSERT INTO {} DEFAULT VALUES", table.quoted());
            for _ in rows {
                self.conn
                    .execute(&sql, [])
                    .with_context(|| format!("Failed to insert into {}", table))?;
            }
            return Ok(());
        }

        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let chunk_size = (SQLITE_MAX_PARAMS / columns.len()).max(1);
        let null = &Value::Null;

        for chunk in rows.chunks(chunk_size) {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                table.quoted(),
                column_list,
                vec![placeholders.as_str(); chunk.len()].join(", ")
            );
            let params = chunk.iter().flat_map(|row| {
                columns
                    .iter()
                    .map(move |c| SqlValue(row.get(c).unwrap_or(null)))
            });
            let mut stmt = self
                .conn
                .prepare_cached(&sql)
                .with_context(|| format!("Failed to prepare insert into {}", table))?;
            stmt.execute(rusqlite::params_from_iter(params))
                .with_context(|| format!("Failed to insert into {}", table))?;
        }
        Ok(())
    }
}
