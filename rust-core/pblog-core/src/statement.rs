//! # Statement Builder
//!
//! Turns structured clause descriptions into SQL text plus a positional
//! argument list.
//!
//! ## Ordering
//!
//! - Clause order is fixed per statement kind (`SELECT … OFFSET`,
//!   `INSERT INTO … VALUES`, `UPDATE … WHERE`, `DELETE FROM … WHERE`).
//! - Arguments are pushed in the order their placeholders are emitted.
//! - Pair predicates keep the caller's order; map predicates and
//!   insert/update values are rendered in sorted column order.

use crate::database::DbValue;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Placeholder syntax understood by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placeholder {
    /// `%s` (DB-API "format" style)
    #[default]
    Format,
    /// `?`
    Qmark,
    /// `$1`, `$2`, … numbered by argument position
    Numbered,
    /// No placeholder syntax: values are inlined as SQL literals
    Inline,
}

impl Placeholder {
    /// Placeholder text for the argument at 1-based `position`
    fn token(self, position: usize) -> Option<String> {
        match self {
            Self::Format => Some("%s".to_string()),
            Self::Qmark => Some("?".to_string()),
            Self::Numbered => Some(format!("${position}")),
            Self::Inline => None,
        }
    }
}

/// SQL text plus its positional arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Statement text
    pub sql: String,
    /// Arguments, in placeholder order
    pub args: Vec<DbValue>,
}

impl Statement {
    /// Wrap raw SQL with explicit arguments
    pub fn new(sql: impl Into<String>, args: Vec<DbValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// Whether the statement only reads data
    #[must_use]
    pub fn is_query(&self) -> bool {
        let head = self.sql.trim_start();
        head.get(..6)
            .is_some_and(|verb| verb.eq_ignore_ascii_case("SELECT"))
    }
}

/// A WHERE-style predicate
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Predicate {
    /// No predicate (clause omitted)
    #[default]
    Nothing,
    /// Pre-rendered SQL, used verbatim with no arguments
    Raw(String),
    /// `(column, value)` pairs; a `None` value renders the column text as a raw fragment
    Pairs(Vec<(String, Option<DbValue>)>),
}

impl Predicate {
    /// Predicate from pre-rendered SQL
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::Raw(sql.into())
    }

    /// Predicate from ordered `column = value` pairs
    pub fn pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DbValue>,
    {
        Self::Pairs(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        )
    }

    /// Append a raw fragment (e.g. `"age > 18"`) to a pair predicate
    #[must_use]
    pub fn and_raw(self, fragment: impl Into<String>) -> Self {
        let mut pairs = match self {
            Self::Nothing => Vec::new(),
            Self::Raw(sql) => vec![(sql, None)],
            Self::Pairs(pairs) => pairs,
        };
        pairs.push((fragment.into(), None));
        Self::Pairs(pairs)
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Nothing => true,
            Self::Raw(sql) => sql.trim().is_empty(),
            Self::Pairs(pairs) => pairs.is_empty(),
        }
    }
}

impl From<&str> for Predicate {
    fn from(sql: &str) -> Self {
        Self::raw(sql)
    }
}

impl From<String> for Predicate {
    fn from(sql: String) -> Self {
        Self::Raw(sql)
    }
}

impl<K: Into<String>, V: Into<DbValue>, const N: usize> From<[(K, V); N]> for Predicate {
    fn from(pairs: [(K, V); N]) -> Self {
        Self::pairs(pairs)
    }
}

impl<K: Into<String>, V: Into<DbValue>> From<Vec<(K, V)>> for Predicate {
    fn from(pairs: Vec<(K, V)>) -> Self {
        Self::pairs(pairs)
    }
}

impl<V: Into<DbValue>> From<BTreeMap<String, V>> for Predicate {
    fn from(map: BTreeMap<String, V>) -> Self {
        Self::pairs(map)
    }
}

/// Value of a single clause
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ClauseValue {
    /// Omitted
    #[default]
    Empty,
    /// Text rendered verbatim
    Text(String),
    /// Items joined with `, `
    List(Vec<String>),
    /// Numeric value
    Number(u64),
}

impl ClauseValue {
    fn render(&self) -> Option<String> {
        match self {
            Self::Empty => None,
            Self::Text(text) if text.is_empty() => None,
            Self::Text(text) => Some(text.clone()),
            Self::List(items) if items.is_empty() => None,
            Self::List(items) => Some(items.join(", ")),
            Self::Number(n) => Some(n.to_string()),
        }
    }
}

impl From<Option<String>> for ClauseValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(Self::Empty, Self::Text)
    }
}

impl From<Option<u64>> for ClauseValue {
    fn from(value: Option<u64>) -> Self {
        value.map_or(Self::Empty, Self::Number)
    }
}

/// `(keyword, value)`; a `None` keyword renders the value alone
pub type Clause = (Option<&'static str>, ClauseValue);

/// Query description consumed by [`StatementBuilder::select`]
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    tables: Vec<String>,
    what: Vec<String>,
    filter: Predicate,
    group: Option<String>,
    order: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Select {
    /// `SELECT * FROM table`
    pub fn table(table: impl Into<String>) -> Self {
        Self::tables([table])
    }

    /// `SELECT * FROM a, b`
    pub fn tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            what: vec!["*".to_string()],
            filter: Predicate::Nothing,
            group: None,
            order: None,
            limit: None,
            offset: None,
        }
    }

    /// Replace the selected column list
    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.what = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the WHERE predicate
    #[must_use]
    pub fn filter(mut self, predicate: impl Into<Predicate>) -> Self {
        self.filter = predicate.into();
        self
    }

    /// Set GROUP BY
    #[must_use]
    pub fn group_by(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set ORDER BY
    #[must_use]
    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    /// Set LIMIT
    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set OFFSET
    #[must_use]
    pub const fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Renders statements for one placeholder style
///
/// Every method is a pure function of its arguments and the placeholder
/// style: identical input always yields byte-identical output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementBuilder {
    placeholder: Placeholder,
}

impl StatementBuilder {
    /// Create a builder for the given placeholder style
    #[must_use]
    pub const fn new(placeholder: Placeholder) -> Self {
        Self { placeholder }
    }

    /// The configured placeholder style
    #[must_use]
    pub const fn placeholder(&self) -> Placeholder {
        self.placeholder
    }

    /// Render a predicate joined by ` AND `, appending arguments to `args`
    ///
    /// Returns `None` when the predicate is empty.
    ///
    /// # Errors
    ///
    /// Returns `Error::Statement` for empty column names or values that
    /// cannot be inlined.
    pub fn build_where(
        &self,
        predicate: &Predicate,
        args: &mut Vec<DbValue>,
    ) -> Result<Option<String>> {
        if predicate.is_empty() {
            return Ok(None);
        }
        match predicate {
            Predicate::Nothing => Ok(None),
            Predicate::Raw(sql) => Ok(Some(sql.clone())),
            Predicate::Pairs(pairs) => self.render_pairs(pairs, " AND ", args),
        }
    }

    fn render_pairs(
        &self,
        pairs: &[(String, Option<DbValue>)],
        separator: &str,
        args: &mut Vec<DbValue>,
    ) -> Result<Option<String>> {
        let mut parts = Vec::with_capacity(pairs.len());
        for (column, value) in pairs {
            if column.trim().is_empty() {
                return Err(Error::statement("column name is empty"));
            }
            match value {
                None => parts.push(column.clone()),
                Some(value) => parts.push(format!("{column} = {}", self.bind(value, args)?)),
            }
        }
        Ok(if parts.is_empty() {
            None
        } else {
            Some(parts.join(separator))
        })
    }

    /// Emit a placeholder (pushing the argument) or an inline literal
    fn bind(&self, value: &DbValue, args: &mut Vec<DbValue>) -> Result<String> {
        match self.placeholder.token(args.len() + 1) {
            Some(token) => {
                args.push(value.clone());
                Ok(token)
            }
            None => literal(value),
        }
    }

    /// Join every non-empty clause with a single space, keeping list order
    #[must_use]
    pub fn build_clauses(clauses: &[Clause]) -> String {
        clauses
            .iter()
            .filter_map(|(keyword, value)| {
                let value = value.render()?;
                Some(match keyword {
                    Some(keyword) => format!("{keyword} {value}"),
                    None => value,
                })
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Build a SELECT statement
    ///
    /// # Errors
    ///
    /// Returns `Error::Statement` when no table is given or the predicate is
    /// malformed.
    pub fn select(&self, query: &Select) -> Result<Statement> {
        check_tables(&query.tables)?;
        let mut args = Vec::new();
        let filter = self.build_where(&query.filter, &mut args)?;
        let sql = Self::build_clauses(&[
            (Some("SELECT"), ClauseValue::List(query.what.clone())),
            (Some("FROM"), ClauseValue::List(query.tables.clone())),
            (Some("WHERE"), filter.into()),
            (Some("GROUP BY"), query.group.clone().into()),
            (Some("ORDER BY"), query.order.clone().into()),
            (Some("LIMIT"), query.limit.into()),
            (Some("OFFSET"), query.offset.into()),
        ]);
        Ok(Statement { sql, args })
    }

    /// Build an INSERT statement; columns are rendered in sorted order
    ///
    /// # Errors
    ///
    /// Returns `Error::Statement` for an empty table, no values, or an
    /// empty column name.
    pub fn insert<K, V, I>(&self, table: &str, values: I) -> Result<Statement>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DbValue>,
    {
        check_table(table)?;
        let values = sorted_values(values)?;
        if values.is_empty() {
            return Err(Error::statement(format!("insert into {table} has no values")));
        }

        let mut args = Vec::with_capacity(values.len());
        let mut columns = Vec::with_capacity(values.len());
        let mut slots = Vec::with_capacity(values.len());
        for (column, value) in &values {
            columns.push(column.clone());
            slots.push(self.bind(value, &mut args)?);
        }

        let sql = Self::build_clauses(&[
            (Some("INSERT INTO"), ClauseValue::Text(table.to_string())),
            (None, ClauseValue::Text(format!("({})", columns.join(", ")))),
            (Some("VALUES"), ClauseValue::Text(format!("({})", slots.join(", ")))),
        ]);
        Ok(Statement { sql, args })
    }

    /// Build an UPDATE statement; SET arguments precede WHERE arguments
    ///
    /// # Errors
    ///
    /// Returns `Error::Statement` for an empty table, no assignments, or a
    /// malformed predicate.
    pub fn update<K, V, I>(
        &self,
        table: &str,
        predicate: &Predicate,
        values: I,
    ) -> Result<Statement>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<DbValue>,
    {
        check_table(table)?;
        let values: Vec<(String, Option<DbValue>)> = sorted_values(values)?
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();

        let mut args = Vec::new();
        let assignments = self
            .render_pairs(&values, ", ", &mut args)?
            .ok_or_else(|| Error::statement(format!("update of {table} has no values")))?;
        let filter = self.build_where(predicate, &mut args)?;

        let sql = Self::build_clauses(&[
            (Some("UPDATE"), ClauseValue::Text(table.to_string())),
            (Some("SET"), ClauseValue::Text(assignments)),
            (Some("WHERE"), filter.into()),
        ]);
        Ok(Statement { sql, args })
    }

    /// Build a DELETE statement
    ///
    /// # Errors
    ///
    /// Returns `Error::Statement` for an empty table or malformed predicate.
    pub fn delete(
        &self,
        table: &str,
        predicate: &Predicate,
        using: Option<&str>,
    ) -> Result<Statement> {
        check_table(table)?;
        let mut args = Vec::new();
        let filter = self.build_where(predicate, &mut args)?;
        let sql = Self::build_clauses(&[
            (Some("DELETE FROM"), ClauseValue::Text(table.to_string())),
            (Some("USING"), using.map(str::to_string).into()),
            (Some("WHERE"), filter.into()),
        ]);
        Ok(Statement { sql, args })
    }
}

fn check_table(table: &str) -> Result<()> {
    if table.trim().is_empty() {
        return Err(Error::statement("table name is empty"));
    }
    Ok(())
}

fn check_tables(tables: &[String]) -> Result<()> {
    if tables.is_empty() {
        return Err(Error::statement("no table given"));
    }
    tables.iter().try_for_each(|t| check_table(t))
}

fn sorted_values<K, V, I>(values: I) -> Result<BTreeMap<String, DbValue>>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<DbValue>,
{
    let mut sorted = BTreeMap::new();
    for (column, value) in values {
        let column = column.into();
        if column.trim().is_empty() {
            return Err(Error::statement("column name is empty"));
        }
        if sorted.contains_key(&column) {
            return Err(Error::statement(format!("column {column} given twice")));
        }
        sorted.insert(column, value.into());
    }
    Ok(sorted)
}

/// Render a value as an SQL literal for placeholder-less drivers
///
/// # Errors
///
/// Returns `Error::Statement` for NaN or infinite floats.
pub fn literal(value: &DbValue) -> Result<String> {
    Ok(match value {
        DbValue::Null => "NULL".to_string(),
        DbValue::Int(i) => i.to_string(),
        DbValue::Float(f) if f.is_finite() => format!("{f:?}"),
        DbValue::Float(f) => {
            return Err(Error::statement(format!("cannot inline non-finite float {f}")))
        }
        DbValue::Bool(true) => "TRUE".to_string(),
        DbValue::Bool(false) => "FALSE".to_string(),
        DbValue::String(s) => format!("'{}'", s.replace('\'', "''")),
        DbValue::Bytes(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
            format!("X'{hex}'")
        }
    })
}
