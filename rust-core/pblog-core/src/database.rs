//! # Database Module
//!
//! Driver abstraction plus the SQLx-backed driver for PostgreSQL and SQLite.
//!
//! ## Design Principles (SOLID)
//!
//! - **S**: Only handles talking to the database; scoping lives in `context`
//! - **O**: New backends implement `Driver` + `Connection`
//! - **D**: The connection context depends on the traits, never on SQLx
//!
//! The traits are synchronous: handlers run on worker threads, and the SQLx
//! driver drives its futures on a dedicated runtime.

use crate::error::{Error, Result};
use crate::statement::{Placeholder, Statement};
use serde::Serialize;
use sqlx::postgres::{PgArguments, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection as _, Postgres, Row as _, Sqlite, TypeInfo};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::runtime::Runtime;
use tracing::debug;

/// Database value used for statement arguments and fetched cells
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DbValue {
    /// Null value
    Null,
    /// Integer value
    Int(i64),
    /// Float value
    Float(f64),
    /// String value
    String(String),
    /// Boolean value
    Bool(bool),
    /// Binary data
    Bytes(Vec<u8>),
}

impl DbValue {
    /// Get as i64 if Int variant
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as &str if String variant
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Check for Null
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for DbValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for DbValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for DbValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for DbValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for DbValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for DbValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for DbValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for DbValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for DbValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A fetched row, keyed by column name
pub type Row = HashMap<String, DbValue>;

/// An open driver connection
///
/// Mirrors the DB-API surface: the cursor is folded into `execute`/`query`.
pub trait Connection: Send {
    /// Run a statement, returning the number of affected rows
    fn execute(&mut self, statement: &Statement) -> Result<u64>;

    /// Run a query and fetch every row
    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>>;

    /// Commit the current transaction
    fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction
    fn rollback(&mut self) -> Result<()>;

    /// Close the connection
    fn close(self: Box<Self>) -> Result<()>;
}

/// Connection factory
pub trait Driver: Send + Sync {
    /// Open a new connection
    fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Placeholder style this driver understands
    fn placeholder(&self) -> Placeholder;
}

/// Return a 50-character, time-ordered unique id
///
/// 15 digits of milliseconds since the epoch, 32 hex digits of a random
/// UUID, then `000`.
#[must_use]
pub fn next_id() -> String {
    next_id_at(SystemTime::now())
}

/// [`next_id`] for a given instant
#[must_use]
pub fn next_id_at(at: SystemTime) -> String {
    let millis = at.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    format!("{millis:015}{}000", uuid::Uuid::new_v4().simple())
}

/// Runtime driving SQLx futures for the synchronous driver surface
///
/// Lazily initialized on first use. Must not be entered from inside another
/// Tokio runtime's worker thread.
static DRIVER_RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime() -> &'static Runtime {
    DRIVER_RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("pblog-db")
            .enable_all()
            .build()
            .expect("Failed to create database runtime")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Sqlite,
    Postgres,
}

/// SQLx-backed driver for SQLite and PostgreSQL URLs
#[derive(Debug, Clone)]
pub struct SqlxDriver {
    url: String,
    backend: Backend,
}

impl SqlxDriver {
    /// Create a driver for a database URL
    ///
    /// # Example
    ///
    /// ```ignore
    /// let driver = SqlxDriver::new("sqlite::memory:")?;
    /// let driver = SqlxDriver::new("postgres://localhost/pblog")?;
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` for an unsupported URL scheme.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let backend = if url.starts_with("sqlite:") {
            Backend::Sqlite
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Backend::Postgres
        } else {
            return Err(Error::database(format!("unsupported database url: {url}")));
        };
        Ok(Self { url, backend })
    }
}

impl Driver for SqlxDriver {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let inner = match self.backend {
            Backend::Sqlite => runtime()
                .block_on(SqliteConnection::connect(&self.url))
                .map(Inner::Sqlite)
                .map_err(|e| Error::database(format!("SQLite connection failed: {e}")))?,
            Backend::Postgres => runtime()
                .block_on(PgConnection::connect(&self.url))
                .map(Inner::Postgres)
                .map_err(|e| Error::database(format!("PostgreSQL connection failed: {e}")))?,
        };
        Ok(Box::new(SqlxConnection {
            inner,
            in_transaction: false,
        }))
    }

    fn placeholder(&self) -> Placeholder {
        match self.backend {
            Backend::Sqlite => Placeholder::Qmark,
            Backend::Postgres => Placeholder::Numbered,
        }
    }
}

enum Inner {
    Sqlite(SqliteConnection),
    Postgres(PgConnection),
}

/// A SQLx connection with DB-API transaction semantics
///
/// An implicit `BEGIN` is issued before the first non-SELECT statement, so
/// writes stay pending until `commit` or `rollback`.
struct SqlxConnection {
    inner: Inner,
    in_transaction: bool,
}

impl SqlxConnection {
    fn raw(&mut self, sql: &str) -> Result<()> {
        let rt = runtime();
        match &mut self.inner {
            Inner::Sqlite(conn) => {
                rt.block_on(sqlx::query(sql).execute(&mut *conn))?;
            }
            Inner::Postgres(conn) => {
                rt.block_on(sqlx::query(sql).execute(&mut *conn))?;
            }
        }
        Ok(())
    }

    fn begin_if_needed(&mut self, statement: &Statement) -> Result<()> {
        if !self.in_transaction && !statement.is_query() {
            self.raw("BEGIN")?;
            self.in_transaction = true;
        }
        Ok(())
    }
}

impl Connection for SqlxConnection {
    fn execute(&mut self, statement: &Statement) -> Result<u64> {
        self.begin_if_needed(statement)?;
        let rt = runtime();
        let affected = match &mut self.inner {
            Inner::Sqlite(conn) => rt
                .block_on(bind_sqlite(sqlx::query(&statement.sql), &statement.args).execute(&mut *conn))
                .map_err(|e| Error::database(format!("Query error: {e}")))?
                .rows_affected(),
            Inner::Postgres(conn) => rt
                .block_on(bind_pg(sqlx::query(&statement.sql), &statement.args).execute(&mut *conn))
                .map_err(|e| Error::database(format!("Query error: {e}")))?
                .rows_affected(),
        };
        Ok(affected)
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        self.begin_if_needed(statement)?;
        let rt = runtime();
        match &mut self.inner {
            Inner::Sqlite(conn) => {
                let rows: Vec<SqliteRow> = rt
                    .block_on(
                        bind_sqlite(sqlx::query(&statement.sql), &statement.args)
                            .fetch_all(&mut *conn),
                    )
                    .map_err(|e| Error::database(format!("Query error: {e}")))?;
                Ok(rows.iter().map(sqlite_row_to_map).collect())
            }
            Inner::Postgres(conn) => {
                let rows: Vec<PgRow> = rt
                    .block_on(
                        bind_pg(sqlx::query(&statement.sql), &statement.args).fetch_all(&mut *conn),
                    )
                    .map_err(|e| Error::database(format!("Query error: {e}")))?;
                Ok(rows.iter().map(pg_row_to_map).collect())
            }
        }
    }

    fn commit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.raw("COMMIT")?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.in_transaction {
            self.in_transaction = false;
            self.raw("ROLLBACK")?;
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let rt = runtime();
        match self.inner {
            Inner::Sqlite(conn) => rt.block_on(conn.close())?,
            Inner::Postgres(conn) => rt.block_on(conn.close())?,
        }
        debug!("connection closed");
        Ok(())
    }
}

fn bind_sqlite<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    args: &[DbValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            DbValue::Null => query.bind(None::<String>),
            DbValue::Int(i) => query.bind(*i),
            DbValue::Float(f) => query.bind(*f),
            DbValue::String(s) => query.bind(s.clone()),
            DbValue::Bool(b) => query.bind(*b),
            DbValue::Bytes(b) => query.bind(b.clone()),
        };
    }
    query
}

fn bind_pg<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    args: &[DbValue],
) -> Query<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg {
            DbValue::Null => query.bind(None::<String>),
            DbValue::Int(i) => query.bind(*i),
            DbValue::Float(f) => query.bind(*f),
            DbValue::String(s) => query.bind(s.clone()),
            DbValue::Bool(b) => query.bind(*b),
            DbValue::Bytes(b) => query.bind(b.clone()),
        };
    }
    query
}

/// Convert SQLite row to HashMap
fn sqlite_row_to_map(row: &SqliteRow) -> Row {
    let mut map = HashMap::new();

    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().name();

        let value = match type_name {
            "INTEGER" | "INT" | "BIGINT" => row
                .try_get::<i64, _>(i)
                .map(DbValue::Int)
                .unwrap_or(DbValue::Null),
            "REAL" => row
                .try_get::<f64, _>(i)
                .map(DbValue::Float)
                .unwrap_or(DbValue::Null),
            "BOOLEAN" => row
                .try_get::<bool, _>(i)
                .map(DbValue::Bool)
                .unwrap_or(DbValue::Null),
            "TEXT" => row
                .try_get::<String, _>(i)
                .map(DbValue::String)
                .unwrap_or(DbValue::Null),
            "BLOB" => row
                .try_get::<Vec<u8>, _>(i)
                .map(DbValue::Bytes)
                .unwrap_or(DbValue::Null),
            _ => row
                .try_get::<i64, _>(i)
                .map(DbValue::Int)
                .or_else(|_| row.try_get::<f64, _>(i).map(DbValue::Float))
                .or_else(|_| row.try_get::<String, _>(i).map(DbValue::String))
                .unwrap_or(DbValue::Null),
        };

        map.insert(name, value);
    }

    map
}

/// Convert PostgreSQL row to HashMap
fn pg_row_to_map(row: &PgRow) -> Row {
    let mut map = HashMap::new();

    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().name();

        let value = match type_name {
            "INT2" => row
                .try_get::<i16, _>(i)
                .map(|v| DbValue::Int(i64::from(v)))
                .unwrap_or(DbValue::Null),
            "INT4" => row
                .try_get::<i32, _>(i)
                .map(|v| DbValue::Int(i64::from(v)))
                .unwrap_or(DbValue::Null),
            "INT8" => row
                .try_get::<i64, _>(i)
                .map(DbValue::Int)
                .unwrap_or(DbValue::Null),
            "FLOAT4" | "FLOAT8" => row
                .try_get::<f64, _>(i)
                .map(DbValue::Float)
                .unwrap_or(DbValue::Null),
            "BOOL" => row
                .try_get::<bool, _>(i)
                .map(DbValue::Bool)
                .unwrap_or(DbValue::Null),
            "BYTEA" => row
                .try_get::<Vec<u8>, _>(i)
                .map(DbValue::Bytes)
                .unwrap_or(DbValue::Null),
            _ => row
                .try_get::<String, _>(i)
                .map(DbValue::String)
                .unwrap_or(DbValue::Null),
        };

        map.insert(name, value);
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_id_shape() {
        let id = next_id();
        assert_eq!(id.len(), 50);
        assert!(id.ends_with("000"));
        assert!(id[..15].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_next_id_time_ordered() {
        let earlier = next_id_at(UNIX_EPOCH + std::time::Duration::from_secs(1_000));
        let later = next_id_at(UNIX_EPOCH + std::time::Duration::from_secs(2_000));
        assert!(earlier[..15] < later[..15]);
        assert_eq!(&earlier[..15], "000000001000000");
    }

    #[test]
    fn test_db_value_conversions() {
        assert_eq!(DbValue::from(18), DbValue::Int(18));
        assert_eq!(DbValue::from("Lily"), DbValue::String("Lily".to_string()));
        assert_eq!(DbValue::from(None::<i64>), DbValue::Null);
        assert_eq!(DbValue::Int(3).as_int(), Some(3));
        assert_eq!(
            serde_json::to_string(&DbValue::String("x".to_string())).unwrap(),
            "\"x\""
        );
    }

    #[test]
    fn test_unsupported_url() {
        assert!(SqlxDriver::new("mysql://localhost/pblog").is_err());
        assert_eq!(
            SqlxDriver::new("sqlite::memory:").unwrap().placeholder(),
            Placeholder::Qmark
        );
        assert_eq!(
            SqlxDriver::new("postgres://localhost/pblog").unwrap().placeholder(),
            Placeholder::Numbered
        );
    }

    #[test]
    fn test_sqlite_insert_and_fetch() {
        let driver = SqlxDriver::new("sqlite::memory:").unwrap();
        let mut conn = driver.connect().unwrap();

        conn.execute(&Statement::new(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
            vec![],
        ))
        .unwrap();
        conn.execute(&Statement::new(
            "INSERT INTO users (id, name) VALUES (?, ?)",
            vec![DbValue::Int(1), DbValue::from("Alice")],
        ))
        .unwrap();
        conn.commit().unwrap();

        let rows = conn
            .query(&Statement::new("SELECT * FROM users", vec![]))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&DbValue::from("Alice")));
        conn.close().unwrap();
    }

    #[test]
    fn test_sqlite_rollback_discards_writes() {
        let driver = SqlxDriver::new("sqlite::memory:").unwrap();
        let mut conn = driver.connect().unwrap();

        conn.execute(&Statement::new("CREATE TABLE t (v INTEGER)", vec![]))
            .unwrap();
        conn.commit().unwrap();
        conn.execute(&Statement::new("INSERT INTO t VALUES (1)", vec![]))
            .unwrap();
        conn.rollback().unwrap();

        let rows = conn
            .query(&Statement::new("SELECT * FROM t", vec![]))
            .unwrap();
        assert!(rows.is_empty());
    }
}
