//! # Connection & Transaction Context
//!
//! One `ConnectionContext` per worker thread. It owns a lazily opened driver
//! connection and a transaction depth counter, and is handed to handlers by
//! `&mut` reference.
//!
//! ## States
//!
//! - **Idle**: no connection
//! - **Open**: connection scope entered, depth 0
//! - **InTransaction(n)**: n nested transaction scopes
//!
//! The driver is only asked for a connection when the first statement runs.
//! A scope closes the connection on exit only if that scope opened it.

use crate::database::{Connection, DbValue, Driver, Row};
use crate::error::{Error, Result};
use crate::statement::{Predicate, Select, Statement, StatementBuilder};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Observable state of a [`ConnectionContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// No connection
    Idle,
    /// Connection scope entered, no transaction
    Open,
    /// Inside `n` nested transaction scopes
    InTransaction(usize),
}

/// Connection handle that defers `Driver::connect` until first use
struct LazyConnection {
    driver: Arc<dyn Driver>,
    connection: Option<Box<dyn Connection>>,
}

impl LazyConnection {
    fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            connection: None,
        }
    }

    fn get(&mut self) -> Result<&mut (dyn Connection + 'static)> {
        if self.connection.is_none() {
            let connection = self.driver.connect()?;
            info!("open connection");
            self.connection = Some(connection);
        }
        self.connection
            .as_deref_mut()
            .ok_or_else(|| Error::database("connection unavailable"))
    }

    fn commit(&mut self) -> Result<()> {
        match self.connection.as_deref_mut() {
            Some(conn) => conn.commit(),
            None => Ok(()),
        }
    }

    fn rollback(&mut self) -> Result<()> {
        match self.connection.as_deref_mut() {
            Some(conn) => conn.rollback(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self.connection.take() {
            Some(conn) => {
                info!("close connection");
                conn.close()
            }
            None => Ok(()),
        }
    }
}

/// Per-worker connection holder and transaction depth counter
pub struct ConnectionContext {
    driver: Arc<dyn Driver>,
    builder: StatementBuilder,
    connection: Option<LazyConnection>,
    depth: usize,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .field("builder", &self.builder)
            .finish_non_exhaustive()
    }
}

impl ConnectionContext {
    /// Create an idle context for a driver
    ///
    /// Statements are rendered with the driver's placeholder style.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        let builder = StatementBuilder::new(driver.placeholder());
        Self {
            driver,
            builder,
            connection: None,
            depth: 0,
        }
    }

    /// Override the statement builder
    #[must_use]
    pub const fn with_builder(mut self, builder: StatementBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// The statement builder used by the data-access helpers
    #[must_use]
    pub const fn builder(&self) -> &StatementBuilder {
        &self.builder
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ContextState {
        match (&self.connection, self.depth) {
            (None, _) => ContextState::Idle,
            (Some(_), 0) => ContextState::Open,
            (Some(_), n) => ContextState::InTransaction(n),
        }
    }

    /// Transaction nesting depth
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Whether the driver connection has actually been opened
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|lazy| lazy.connection.is_some())
    }

    /// Enter a connection scope
    ///
    /// Opens the (lazy) connection if the context is idle; the returned guard
    /// closes it on drop only in that case.
    pub fn connection(&mut self) -> ConnectionScope<'_> {
        let opened = self.open_if_idle();
        ConnectionScope { ctx: self, opened }
    }

    /// Enter a transaction scope
    ///
    /// The guard must be finished with [`TransactionScope::commit`] or
    /// [`TransactionScope::rollback`]; dropping it unfinished rolls back.
    pub fn transaction(&mut self) -> TransactionScope<'_> {
        let opened = self.open_if_idle();
        self.depth += 1;
        debug!(depth = self.depth, "enter transaction");
        TransactionScope {
            ctx: self,
            opened,
            finished: false,
        }
    }

    /// Run `f` inside a transaction scope
    ///
    /// `Ok` commits at the outermost level, `Err` rolls back. If the rollback
    /// itself fails, the transaction failure is returned instead of `f`'s
    /// error.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error, or `Error::Transaction` when commit/rollback fails.
    pub fn with_transaction<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Self) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let mut scope = self.transaction();
        match f(&mut scope) {
            Ok(value) => {
                scope.commit()?;
                Ok(value)
            }
            Err(err) => {
                scope.rollback()?;
                Err(err)
            }
        }
    }

    /// Run `f` inside a connection scope
    ///
    /// # Errors
    ///
    /// Returns `f`'s error.
    pub fn with_connection<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Self) -> std::result::Result<T, E>,
    {
        let mut scope = self.connection();
        f(&mut scope)
    }

    /// Execute a statement; outside a transaction it is committed at once
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` when the driver fails.
    pub fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let mut scope = self.connection();
        scope.run_dml(statement)
    }

    /// Execute raw SQL with positional arguments
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` when the driver fails.
    pub fn execute_sql(&mut self, sql: &str, args: Vec<DbValue>) -> Result<u64> {
        self.execute(&Statement::new(sql, args))
    }

    /// Run a query and fetch every row
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` when the driver fails.
    pub fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        let mut scope = self.connection();
        debug!(sql = %statement.sql, args = ?statement.args, "SQL");
        scope.active()?.query(statement)
    }

    /// Build and run a SELECT
    ///
    /// # Errors
    ///
    /// Returns `Error::Statement` for malformed input, `Error::Database` on
    /// driver failure.
    pub fn select(&mut self, query: &Select) -> Result<Vec<Row>> {
        let statement = self.builder.select(query)?;
        self.query(&statement)
    }

    /// First row of a SELECT, if any
    ///
    /// # Errors
    ///
    /// See [`ConnectionContext::select`].
    pub fn select_one(&mut self, query: &Select) -> Result<Option<Row>> {
        Ok(self.select(query)?.into_iter().next())
    }

    /// Single integer column of the first row
    ///
    /// # Errors
    ///
    /// Returns `Error::MultiColumns` if the row does not have exactly one
    /// column, `Error::Database` if the value is not an integer.
    pub fn select_int(&mut self, query: &Select) -> Result<Option<i64>> {
        let Some(row) = self.select_one(query)? else {
            return Ok(None);
        };
        if row.len() != 1 {
            return Err(Error::MultiColumns { count: row.len() });
        }
        match row.into_values().next() {
            Some(DbValue::Int(i)) => Ok(Some(i)),
            Some(DbValue::Null) | None => Ok(None),
            Some(other) => Err(Error::database(format!(
                "expected an integer column, got {other:?}"
            ))),
        }
    }

    /// `SELECT count(*)` over a table
    ///
    /// # Errors
    ///
    /// See [`ConnectionContext::select_int`].
    pub fn count(&mut self, table: &str, predicate: impl Into<Predicate>) -> Result<i64> {
        let query = Select::table(table)
            .columns(["count(*)"])
            .filter(predicate);
        Ok(self.select_int(&query)?.unwrap_or(0))
    }

    /// Build and run an INSERT
    ///
    /// # Errors
    ///
    /// Returns `Error::Statement` for malformed input, `Error::Database` on
    /// driver failure.
    pub fn insert<K, V, I>(&mut self, table: &str, values: I) -> Result<u64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DbValue>,
    {
        let statement = self.builder.insert(table, values)?;
        self.execute(&statement)
    }

    /// Build and run an UPDATE
    ///
    /// # Errors
    ///
    /// Returns `Error::Statement` for malformed input, `Error::Database` on
    /// driver failure.
    pub fn update<K, V, I>(
        &mut self,
        table: &str,
        predicate: impl Into<Predicate>,
        values: I,
    ) -> Result<u64>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DbValue>,
    {
        let statement = self.builder.update(table, &predicate.into(), values)?;
        self.execute(&statement)
    }

    /// Build and run a DELETE
    ///
    /// # Errors
    ///
    /// Returns `Error::Statement` for malformed input, `Error::Database` on
    /// driver failure.
    pub fn delete(
        &mut self,
        table: &str,
        predicate: impl Into<Predicate>,
        using: Option<&str>,
    ) -> Result<u64> {
        let statement = self.builder.delete(table, &predicate.into(), using)?;
        self.execute(&statement)
    }

    fn open_if_idle(&mut self) -> bool {
        if self.connection.is_some() {
            return false;
        }
        debug!("open lazy connection");
        self.connection = Some(LazyConnection::new(Arc::clone(&self.driver)));
        true
    }

    fn active(&mut self) -> Result<&mut (dyn Connection + 'static)> {
        self.connection
            .as_mut()
            .ok_or_else(|| Error::database("no connection scope is active"))?
            .get()
    }

    fn run_dml(&mut self, statement: &Statement) -> Result<u64> {
        debug!(sql = %statement.sql, args = ?statement.args, "SQL");
        let in_transaction = self.depth > 0;
        let conn = self.active()?;
        let affected = conn.execute(statement)?;
        if !in_transaction {
            debug!("auto commit");
            conn.commit()?;
        }
        Ok(affected)
    }

    fn cleanup(&mut self) {
        if let Some(mut lazy) = self.connection.take() {
            if let Err(e) = lazy.close() {
                warn!(error = %e, "closing connection failed");
            }
        }
    }

    fn exit_transaction(&mut self, success: bool, opened: bool) -> Result<()> {
        debug_assert!(self.depth > 0, "transaction depth underflow");
        self.depth = self.depth.saturating_sub(1);
        debug!(depth = self.depth, success, "exit transaction");

        let outcome = if self.depth > 0 {
            Ok(())
        } else if success {
            self.commit_outermost()
        } else {
            self.rollback_outermost()
        };

        if opened {
            self.cleanup();
        }
        outcome
    }

    fn commit_outermost(&mut self) -> Result<()> {
        let Some(lazy) = self.connection.as_mut() else {
            return Ok(());
        };
        info!("commit transaction...");
        match lazy.commit() {
            Ok(()) => {
                info!("commit ok");
                Ok(())
            }
            Err(commit_err) => {
                warn!(error = %commit_err, "commit failed, try rollback...");
                match lazy.rollback() {
                    Ok(()) => warn!("rollback ok"),
                    Err(rollback_err) => {
                        error!(error = %rollback_err, "rollback after failed commit failed");
                    }
                }
                Err(Error::Transaction {
                    message: commit_err.to_string(),
                })
            }
        }
    }

    fn rollback_outermost(&mut self) -> Result<()> {
        let Some(lazy) = self.connection.as_mut() else {
            return Ok(());
        };
        info!("rollback transaction...");
        lazy.rollback().map_err(|e| {
            error!(error = %e, "rollback failed");
            Error::Transaction {
                message: e.to_string(),
            }
        })?;
        info!("rollback ok");
        Ok(())
    }
}

/// Guard for a connection scope
///
/// Dereferences to the context. Closes the connection on drop if this scope
/// opened it.
pub struct ConnectionScope<'c> {
    ctx: &'c mut ConnectionContext,
    opened: bool,
}

impl ConnectionScope<'_> {
    /// Whether this scope opened the connection
    #[must_use]
    pub const fn opened(&self) -> bool {
        self.opened
    }
}

impl Deref for ConnectionScope<'_> {
    type Target = ConnectionContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for ConnectionScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for ConnectionScope<'_> {
    fn drop(&mut self) {
        if self.opened {
            self.ctx.cleanup();
        }
    }
}

/// Guard for a transaction scope
///
/// Dereferences to the context. Dropping it without calling `commit` or
/// `rollback` (early return, panic) rolls back.
pub struct TransactionScope<'c> {
    ctx: &'c mut ConnectionContext,
    opened: bool,
    finished: bool,
}

impl TransactionScope<'_> {
    /// Leave the scope successfully; commits at the outermost level
    ///
    /// # Errors
    ///
    /// Returns `Error::Transaction` if the commit fails (after a rollback
    /// attempt).
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.ctx.exit_transaction(true, self.opened)
    }

    /// Leave the scope unsuccessfully; rolls back at the outermost level
    ///
    /// # Errors
    ///
    /// Returns `Error::Transaction` if the rollback fails.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.ctx.exit_transaction(false, self.opened)
    }

    /// Whether this scope opened the connection
    #[must_use]
    pub const fn opened(&self) -> bool {
        self.opened
    }
}

impl Deref for TransactionScope<'_> {
    type Target = ConnectionContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for TransactionScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.ctx.exit_transaction(false, self.opened) {
                error!(error = %e, "rollback on unwind failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqlxDriver;
    use crate::testing::{Event, RecordingDriver};

    fn context(driver: &RecordingDriver) -> ConnectionContext {
        ConnectionContext::new(Arc::new(driver.clone()))
    }

    #[test]
    fn test_connection_is_lazy() {
        let driver = RecordingDriver::new();
        let mut ctx = context(&driver);

        {
            let scope = ctx.connection();
            assert!(scope.opened());
            assert_eq!(scope.state(), ContextState::Open);
            assert!(!scope.is_connected());
        }
        assert_eq!(ctx.state(), ContextState::Idle);
        assert!(driver.events().is_empty());
    }

    #[test]
    fn test_nested_transactions_commit_once() {
        let driver = RecordingDriver::new();
        let mut ctx = context(&driver);

        let mut outer = ctx.transaction();
        outer.execute_sql("INSERT INTO t VALUES (1)", vec![]).unwrap();
        {
            let mut inner = outer.transaction();
            assert_eq!(inner.state(), ContextState::InTransaction(2));
            inner.execute_sql("INSERT INTO t VALUES (2)", vec![]).unwrap();
            inner.commit().unwrap();
        }
        assert_eq!(outer.state(), ContextState::InTransaction(1));
        assert!(outer.is_connected());
        assert_eq!(driver.count(&Event::Commit), 0);

        outer.commit().unwrap();
        assert_eq!(driver.count(&Event::Commit), 1);
        assert_eq!(driver.count(&Event::Close), 1);
        assert_eq!(ctx.state(), ContextState::Idle);
    }

    #[test]
    fn test_error_in_transaction_rolls_back_and_closes() {
        let driver = RecordingDriver::new();
        let mut ctx = context(&driver);

        let result: Result<()> = ctx.with_transaction(|ctx| {
            ctx.execute_sql("INSERT INTO t VALUES (1)", vec![])?;
            Err(Error::database("boom"))
        });

        assert!(matches!(result, Err(Error::Database { .. })));
        assert_eq!(driver.count(&Event::Commit), 0);
        assert_eq!(driver.count(&Event::Rollback), 1);
        assert_eq!(driver.count(&Event::Close), 1);
        assert_eq!(ctx.state(), ContextState::Idle);
    }

    #[test]
    fn test_panic_in_transaction_rolls_back() {
        let driver = RecordingDriver::new();
        let mut ctx = context(&driver);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = ctx.with_transaction(|ctx| {
                ctx.execute_sql("INSERT INTO t VALUES (1)", vec![])?;
                panic!("handler bug");
            });
        }));

        assert!(result.is_err());
        assert_eq!(driver.count(&Event::Rollback), 1);
        assert_eq!(driver.count(&Event::Commit), 0);
        assert_eq!(driver.count(&Event::Close), 1);
    }

    #[test]
    fn test_commit_failure_falls_back_to_rollback() {
        let driver = RecordingDriver::new().fail_commit();
        let mut ctx = context(&driver);

        let result: Result<()> = ctx.with_transaction(|ctx| {
            ctx.execute_sql("INSERT INTO t VALUES (1)", vec![])?;
            Ok(())
        });

        assert!(matches!(result, Err(Error::Transaction { .. })));
        assert_eq!(driver.count(&Event::Commit), 1);
        assert_eq!(driver.count(&Event::Rollback), 1);
        assert_eq!(ctx.state(), ContextState::Idle);
    }

    #[test]
    fn test_rollback_failure_propagates() {
        let driver = RecordingDriver::new().fail_rollback();
        let mut ctx = context(&driver);

        let result: Result<()> = ctx.with_transaction(|ctx| {
            ctx.execute_sql("INSERT INTO t VALUES (1)", vec![])?;
            Err(Error::database("boom"))
        });

        assert!(matches!(result, Err(Error::Transaction { .. })));
        assert_eq!(driver.count(&Event::Close), 1);
    }

    #[test]
    fn test_auto_commit_outside_transaction() {
        let driver = RecordingDriver::new();
        let mut ctx = context(&driver);

        ctx.insert("user", [("name", "Lily")]).unwrap();
        assert_eq!(
            driver.events(),
            vec![
                Event::Connect,
                Event::Execute("INSERT INTO user (name) VALUES (?)".to_string()),
                Event::Commit,
                Event::Close,
            ]
        );
    }

    #[test]
    fn test_outer_connection_scope_is_reused() {
        let driver = RecordingDriver::new();
        let mut ctx = context(&driver);

        let mut scope = ctx.connection();
        scope.execute_sql("DELETE FROM t", vec![]).unwrap();
        scope
            .with_transaction(|ctx| ctx.execute_sql("DELETE FROM u", vec![]).map(|_| ()))
            .unwrap();
        assert!(scope.is_connected());
        assert_eq!(driver.count(&Event::Connect), 1);
        assert_eq!(driver.count(&Event::Close), 0);
        drop(scope);

        assert_eq!(driver.count(&Event::Close), 1);
        assert_eq!(ctx.state(), ContextState::Idle);
    }

    #[test]
    fn test_transaction_without_statements_never_connects() {
        let driver = RecordingDriver::new();
        let mut ctx = context(&driver);

        ctx.with_transaction(|_| Ok::<_, Error>(())).unwrap();
        assert!(driver.events().is_empty());
    }

    #[test]
    fn test_select_int_and_multi_columns() {
        let mut row = Row::new();
        row.insert("count(*)".to_string(), DbValue::Int(3));
        let driver = RecordingDriver::new().with_rows(vec![row]);
        let mut ctx = context(&driver);
        assert_eq!(ctx.count("blogs", Predicate::Nothing).unwrap(), 3);

        let mut wide = Row::new();
        wide.insert("a".to_string(), DbValue::Int(1));
        wide.insert("b".to_string(), DbValue::Int(2));
        let driver = RecordingDriver::new().with_rows(vec![wide]);
        let mut ctx = context(&driver);
        assert!(matches!(
            ctx.select_int(&Select::table("t")),
            Err(Error::MultiColumns { count: 2 })
        ));
    }

    #[test]
    fn test_sqlite_transaction_round_trip() {
        let driver = SqlxDriver::new("sqlite::memory:").unwrap();
        let mut ctx = ConnectionContext::new(Arc::new(driver));

        let names = ctx
            .with_connection(|ctx| {
                ctx.execute_sql("CREATE TABLE user (id INTEGER PRIMARY KEY, name TEXT)", vec![])?;
                ctx.with_transaction(|ctx| {
                    ctx.insert("user", [("id", DbValue::from(1)), ("name", DbValue::from("Lily"))])?;
                    ctx.insert("user", [("id", DbValue::from(2)), ("name", DbValue::from("Lilei"))])?;
                    Ok::<_, Error>(())
                })?;
                let failed: Result<()> = ctx.with_transaction(|ctx| {
                    ctx.insert("user", [("id", DbValue::from(3)), ("name", DbValue::from("Ghost"))])?;
                    Err(Error::database("abort"))
                });
                assert!(failed.is_err());
                ctx.update("user", [("id", 2)], [("name", "Lei")])?;
                ctx.select(&Select::table("user").order_by("id"))
            })
            .unwrap();

        let names: Vec<_> = names
            .iter()
            .filter_map(|row| row.get("name").and_then(DbValue::as_str))
            .collect();
        assert_eq!(names, vec!["Lily", "Lei"]);
        assert_eq!(ctx.state(), ContextState::Idle);
    }
}
