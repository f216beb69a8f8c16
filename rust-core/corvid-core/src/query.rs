//! # Query Builder
//!
//! Fluent accumulator of SQL clauses and named parameter bindings.
//!
//! Builder methods consume and return the builder. Every bound value gets a
//! fresh `:param_N` placeholder from a per-builder counter, so the keys of
//! [`QueryBuilder::bindings`] are exactly the placeholders in the compiled SQL.
//!
//! Terminal methods (`get`, `first`, `count`, `paginate`, ...) borrow the
//! builder and never change its state; `first` and the aggregates compile a
//! variant of the query instead of mutating limit or select list.
//!
//! Column, table and join identifiers are trusted input and inserted as-is.

use crate::database::{Bindings, DatabasePool, DbRow, DbValue};
use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;

const OPERATORS: [&str; 11] = [
    "=", "<", ">", "<=", ">=", "<>", "!=", "LIKE", "NOT LIKE", "ILIKE", "NOT ILIKE",
];

/// Boolean joiner between WHERE clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boolean {
    /// `AND`
    And,
    /// `OR`
    Or,
}

impl fmt::Display for Boolean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

/// One WHERE condition
#[derive(Debug, Clone, PartialEq)]
pub enum WhereClause {
    /// `column op :param`
    Basic {
        /// Column expression
        column: String,
        /// Comparison operator
        operator: String,
        /// Placeholder name
        param: String,
        /// Joiner
        boolean: Boolean,
    },
    /// `first op second` (no binding)
    Column {
        /// Left column
        first: String,
        /// Comparison operator
        operator: String,
        /// Right column
        second: String,
        /// Joiner
        boolean: Boolean,
    },
    /// `column IN (...)`
    In {
        /// Column expression
        column: String,
        /// One placeholder per value
        params: Vec<String>,
        /// Joiner
        boolean: Boolean,
    },
    /// `column NOT IN (...)`
    NotIn {
        /// Column expression
        column: String,
        /// One placeholder per value
        params: Vec<String>,
        /// Joiner
        boolean: Boolean,
    },
    /// `column BETWEEN :min AND :max`
    Between {
        /// Column expression
        column: String,
        /// Lower bound placeholder
        min: String,
        /// Upper bound placeholder
        max: String,
        /// Joiner
        boolean: Boolean,
    },
    /// `column NOT BETWEEN :min AND :max`
    NotBetween {
        /// Column expression
        column: String,
        /// Lower bound placeholder
        min: String,
        /// Upper bound placeholder
        max: String,
        /// Joiner
        boolean: Boolean,
    },
    /// `column IS NULL`
    Null {
        /// Column expression
        column: String,
        /// Joiner
        boolean: Boolean,
    },
    /// `column IS NOT NULL`
    NotNull {
        /// Column expression
        column: String,
        /// Joiner
        boolean: Boolean,
    },
    /// Parenthesized group of clauses
    Nested {
        /// Inner clauses
        wheres: Vec<WhereClause>,
        /// Joiner
        boolean: Boolean,
    },
}

impl WhereClause {
    const fn boolean(&self) -> Boolean {
        match self {
            Self::Basic { boolean, .. }
            | Self::Column { boolean, .. }
            | Self::In { boolean, .. }
            | Self::NotIn { boolean, .. }
            | Self::Between { boolean, .. }
            | Self::NotBetween { boolean, .. }
            | Self::Null { boolean, .. }
            | Self::NotNull { boolean, .. }
            | Self::Nested { boolean, .. } => *boolean,
        }
    }

    /// Placeholder names this clause references, in SQL order
    fn collect_params<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Basic { param, .. } => out.push(param),
            Self::In { params, .. } | Self::NotIn { params, .. } => {
                out.extend(params.iter().map(String::as_str));
            }
            Self::Between { min, max, .. } | Self::NotBetween { min, max, .. } => {
                out.push(min);
                out.push(max);
            }
            Self::Nested { wheres, .. } => {
                for clause in wheres {
                    clause.collect_params(out);
                }
            }
            Self::Column { .. } | Self::Null { .. } | Self::NotNull { .. } => {}
        }
    }

    fn to_sql(&self) -> String {
        let placeholders = |params: &[String]| {
            params
                .iter()
                .map(|p| format!(":{p}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Self::Basic {
                column,
                operator,
                param,
                ..
            } => format!("{column} {operator} :{param}"),
            Self::Column {
                first,
                operator,
                second,
                ..
            } => format!("{first} {operator} {second}"),
            Self::In { column, params, .. } => format!("{column} IN ({})", placeholders(params)),
            Self::NotIn { column, params, .. } => {
                format!("{column} NOT IN ({})", placeholders(params))
            }
            Self::Between { column, min, max, .. } => {
                format!("{column} BETWEEN :{min} AND :{max}")
            }
            Self::NotBetween { column, min, max, .. } => {
                format!("{column} NOT BETWEEN :{min} AND :{max}")
            }
            Self::Null { column, .. } => format!("{column} IS NULL"),
            Self::NotNull { column, .. } => format!("{column} IS NOT NULL"),
            Self::Nested { wheres, .. } => format!("({})", compile_wheres(wheres)),
        }
    }
}

/// Join `clauses`, prefixing every clause but the first with its joiner
fn compile_wheres(clauses: &[WhereClause]) -> String {
    let mut sql = String::new();
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 {
            sql.push_str(&format!(" {} ", clause.boolean()));
        }
        sql.push_str(&clause.to_sql());
    }
    sql
}

/// Join flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// `INNER JOIN`
    Inner,
    /// `LEFT JOIN`
    Left,
    /// `RIGHT JOIN`
    Right,
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inner => write!(f, "INNER"),
            Self::Left => write!(f, "LEFT"),
            Self::Right => write!(f, "RIGHT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct JoinClause {
    kind: JoinKind,
    table: String,
    first: String,
    operator: String,
    second: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Order {
    Column { column: String, descending: bool },
    Random,
}

#[derive(Debug, Clone, PartialEq)]
struct HavingClause {
    column: String,
    operator: String,
    param: String,
}

/// What the SELECT list of a compiled query holds
enum Projection<'a> {
    Columns { limit: Option<u64> },
    Aggregate { function: &'a str, column: &'a str },
}

/// Fluent SQL query builder
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBuilder {
    table: String,
    columns: Vec<String>,
    distinct: bool,
    wheres: Vec<WhereClause>,
    bindings: Bindings,
    joins: Vec<JoinClause>,
    orders: Vec<Order>,
    groups: Vec<String>,
    havings: Vec<HavingClause>,
    limit: Option<u64>,
    offset: u64,
    counter: usize,
    invalid: Option<String>,
}

impl QueryBuilder {
    /// Start a query on `table`
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            distinct: false,
            wheres: Vec::new(),
            bindings: Bindings::new(),
            joins: Vec::new(),
            orders: Vec::new(),
            groups: Vec::new(),
            havings: Vec::new(),
            limit: None,
            offset: 0,
            counter: 0,
            invalid: None,
        }
    }

    /// Table the query reads from
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Bound values keyed by placeholder name
    #[must_use]
    pub const fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// WHERE clauses in declaration order
    #[must_use]
    pub fn wheres(&self) -> &[WhereClause] {
        &self.wheres
    }

    fn bind(&mut self, value: impl Into<DbValue>) -> String {
        self.counter += 1;
        let name = format!("param_{}", self.counter);
        self.bindings.insert(name.clone(), value.into());
        name
    }

    /// Keep the first reason the query cannot be compiled
    fn reject(&mut self, reason: impl Into<String>) {
        if self.invalid.is_none() {
            self.invalid = Some(reason.into());
        }
    }

    fn operator(&mut self, operator: &str) -> String {
        let normalized = operator.trim().to_ascii_uppercase();
        if !OPERATORS.contains(&normalized.as_str()) {
            self.reject(format!("unsupported operator '{operator}'"));
        }
        normalized
    }

    /// Replace the select list
    #[must_use]
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Append to the select list
    #[must_use]
    pub fn add_select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Append a raw select expression such as `COUNT(*) AS total`
    #[must_use]
    pub fn select_raw(mut self, expression: impl Into<String>) -> Self {
        self.columns.push(expression.into());
        self
    }

    /// `SELECT DISTINCT`
    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    fn push_basic(mut self, column: &str, operator: &str, value: DbValue, boolean: Boolean) -> Self {
        let operator = self.operator(operator);
        let param = self.bind(value);
        self.wheres.push(WhereClause::Basic {
            column: column.to_string(),
            operator,
            param,
            boolean,
        });
        self
    }

    /// `AND column op value`
    #[must_use]
    pub fn where_(self, column: &str, operator: &str, value: impl Into<DbValue>) -> Self {
        self.push_basic(column, operator, value.into(), Boolean::And)
    }

    /// `AND column = value`
    #[must_use]
    pub fn where_eq(self, column: &str, value: impl Into<DbValue>) -> Self {
        self.push_basic(column, "=", value.into(), Boolean::And)
    }

    /// `OR column op value`
    #[must_use]
    pub fn or_where(self, column: &str, operator: &str, value: impl Into<DbValue>) -> Self {
        self.push_basic(column, operator, value.into(), Boolean::Or)
    }

    /// `OR column = value`
    #[must_use]
    pub fn or_where_eq(self, column: &str, value: impl Into<DbValue>) -> Self {
        self.push_basic(column, "=", value.into(), Boolean::Or)
    }

    /// `AND column LIKE pattern`
    #[must_use]
    pub fn where_like(self, column: &str, pattern: impl Into<String>) -> Self {
        self.push_basic(column, "LIKE", DbValue::String(pattern.into()), Boolean::And)
    }

    /// `AND first op second`, comparing two columns
    #[must_use]
    pub fn where_column(mut self, first: &str, operator: &str, second: &str) -> Self {
        let operator = self.operator(operator);
        self.wheres.push(WhereClause::Column {
            first: first.to_string(),
            operator,
            second: second.to_string(),
            boolean: Boolean::And,
        });
        self
    }

    fn push_nested<F>(mut self, build: F, boolean: Boolean) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        let mut seed = Self::new(self.table.clone());
        seed.counter = self.counter;
        let mut inner = build(seed);

        self.counter = inner.counter;
        if let Some(reason) = inner.invalid.take() {
            self.reject(reason);
        }
        if !(inner.joins.is_empty()
            && inner.orders.is_empty()
            && inner.groups.is_empty()
            && inner.havings.is_empty())
        {
            self.reject("a nested group may only hold WHERE clauses");
        }
        if !inner.wheres.is_empty() {
            let mut params = Vec::new();
            for clause in &inner.wheres {
                clause.collect_params(&mut params);
            }
            for param in params {
                if let Some(value) = inner.bindings.remove(param) {
                    self.bindings.insert(param.to_string(), value);
                }
            }
            self.wheres.push(WhereClause::Nested {
                wheres: inner.wheres,
                boolean,
            });
        }
        self
    }

    /// `AND ( ... )` built by a closure over a fresh builder
    ///
    /// Nothing is added when the closure adds no clause.
    #[must_use]
    pub fn where_nested<F>(self, build: F) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        self.push_nested(build, Boolean::And)
    }

    /// `OR ( ... )` built by a closure over a fresh builder
    #[must_use]
    pub fn or_where_nested<F>(self, build: F) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        self.push_nested(build, Boolean::Or)
    }

    fn push_in<I, V>(mut self, column: &str, values: I, negated: bool, boolean: Boolean) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DbValue>,
    {
        let values: Vec<DbValue> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return self;
        }
        let params = values.into_iter().map(|v| self.bind(v)).collect();
        let column = column.to_string();
        self.wheres.push(if negated {
            WhereClause::NotIn {
                column,
                params,
                boolean,
            }
        } else {
            WhereClause::In {
                column,
                params,
                boolean,
            }
        });
        self
    }

    /// `AND column IN (...)`; an empty list adds nothing
    #[must_use]
    pub fn where_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DbValue>,
    {
        self.push_in(column, values, false, Boolean::And)
    }

    /// `AND column NOT IN (...)`; an empty list adds nothing
    #[must_use]
    pub fn where_not_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DbValue>,
    {
        self.push_in(column, values, true, Boolean::And)
    }

    /// `OR column IN (...)`; an empty list adds nothing
    #[must_use]
    pub fn or_where_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DbValue>,
    {
        self.push_in(column, values, false, Boolean::Or)
    }

    /// `AND column BETWEEN min AND max`
    #[must_use]
    pub fn where_between(mut self, column: &str, min: impl Into<DbValue>, max: impl Into<DbValue>) -> Self {
        let min = self.bind(min);
        let max = self.bind(max);
        self.wheres.push(WhereClause::Between {
            column: column.to_string(),
            min,
            max,
            boolean: Boolean::And,
        });
        self
    }

    /// `AND column NOT BETWEEN min AND max`
    #[must_use]
    pub fn where_not_between(
        mut self,
        column: &str,
        min: impl Into<DbValue>,
        max: impl Into<DbValue>,
    ) -> Self {
        let min = self.bind(min);
        let max = self.bind(max);
        self.wheres.push(WhereClause::NotBetween {
            column: column.to_string(),
            min,
            max,
            boolean: Boolean::And,
        });
        self
    }

    /// `AND column IS NULL`
    #[must_use]
    pub fn where_null(mut self, column: &str) -> Self {
        self.wheres.push(WhereClause::Null {
            column: column.to_string(),
            boolean: Boolean::And,
        });
        self
    }

    /// `AND column IS NOT NULL`
    #[must_use]
    pub fn where_not_null(mut self, column: &str) -> Self {
        self.wheres.push(WhereClause::NotNull {
            column: column.to_string(),
            boolean: Boolean::And,
        });
        self
    }

    /// `OR column IS NULL`
    #[must_use]
    pub fn or_where_null(mut self, column: &str) -> Self {
        self.wheres.push(WhereClause::Null {
            column: column.to_string(),
            boolean: Boolean::Or,
        });
        self
    }

    fn push_join(mut self, kind: JoinKind, table: &str, first: &str, operator: &str, second: &str) -> Self {
        let operator = self.operator(operator);
        self.joins.push(JoinClause {
            kind,
            table: table.to_string(),
            first: first.to_string(),
            operator,
            second: second.to_string(),
        });
        self
    }

    /// `INNER JOIN table ON first op second`
    #[must_use]
    pub fn join(self, table: &str, first: &str, operator: &str, second: &str) -> Self {
        self.push_join(JoinKind::Inner, table, first, operator, second)
    }

    /// `LEFT JOIN table ON first op second`
    #[must_use]
    pub fn left_join(self, table: &str, first: &str, operator: &str, second: &str) -> Self {
        self.push_join(JoinKind::Left, table, first, operator, second)
    }

    /// `RIGHT JOIN table ON first op second`
    #[must_use]
    pub fn right_join(self, table: &str, first: &str, operator: &str, second: &str) -> Self {
        self.push_join(JoinKind::Right, table, first, operator, second)
    }

    /// `ORDER BY column ASC|DESC` (anything but `desc` sorts ascending)
    #[must_use]
    pub fn order_by(mut self, column: &str, direction: &str) -> Self {
        self.orders.push(Order::Column {
            column: column.to_string(),
            descending: direction.eq_ignore_ascii_case("desc"),
        });
        self
    }

    /// `ORDER BY column DESC`
    #[must_use]
    pub fn order_by_desc(self, column: &str) -> Self {
        self.order_by(column, "desc")
    }

    /// Newest first by `column`
    #[must_use]
    pub fn latest(self, column: &str) -> Self {
        self.order_by(column, "desc")
    }

    /// Oldest first by `column`
    #[must_use]
    pub fn oldest(self, column: &str) -> Self {
        self.order_by(column, "asc")
    }

    /// `ORDER BY RANDOM()`
    #[must_use]
    pub fn in_random_order(mut self) -> Self {
        self.orders.push(Order::Random);
        self
    }

    /// `GROUP BY columns`
    #[must_use]
    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(columns.into_iter().map(Into::into));
        self
    }

    /// `HAVING column op value`
    #[must_use]
    pub fn having(mut self, column: &str, operator: &str, value: impl Into<DbValue>) -> Self {
        let operator = self.operator(operator);
        let param = self.bind(value);
        self.havings.push(HavingClause {
            column: column.to_string(),
            operator,
            param,
        });
        self
    }

    /// `LIMIT n`
    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `OFFSET n`
    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Page window: `limit(per_page)` and `offset((page - 1) * per_page)`
    ///
    /// Pages are 1-based; page 0 is treated as page 1. A window past the end
    /// of the offset range makes the query invalid.
    #[must_use]
    pub fn take(mut self, per_page: u64, page: u64) -> Self {
        match (page.max(1) - 1).checked_mul(per_page) {
            Some(offset) => self.limit(per_page).offset(offset),
            None => {
                self.reject(format!("page {page} of {per_page} rows is out of range"));
                self.limit(per_page)
            }
        }
    }

    fn check(&self) -> Result<()> {
        match &self.invalid {
            Some(reason) => Err(Error::InvalidQuery {
                reason: reason.clone(),
            }),
            None if self.table.trim().is_empty() => Err(Error::InvalidQuery {
                reason: "no table given".to_string(),
            }),
            None if self.limit.is_some_and(|l| i64::try_from(l).is_err())
                || i64::try_from(self.offset).is_err() =>
            {
                Err(Error::InvalidQuery {
                    reason: "limit and offset must fit a signed 64-bit integer".to_string(),
                })
            }
            None => Ok(()),
        }
    }

    fn where_sql(&self) -> String {
        if self.wheres.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", compile_wheres(&self.wheres))
        }
    }

    fn compile_select(&self, projection: &Projection<'_>) -> Result<String> {
        self.check()?;

        let mut sql = String::from("SELECT ");
        match projection {
            Projection::Columns { .. } => {
                if self.distinct {
                    sql.push_str("DISTINCT ");
                }
                if self.columns.is_empty() {
                    sql.push('*');
                } else {
                    sql.push_str(&self.columns.join(", "));
                }
            }
            Projection::Aggregate { function, column } => {
                sql.push_str(&format!("{function}({column}) AS aggregate"));
            }
        }
        sql.push_str(&format!(" FROM {}", self.table));

        for join in &self.joins {
            sql.push_str(&format!(
                " {} JOIN {} ON {} {} {}",
                join.kind, join.table, join.first, join.operator, join.second
            ));
        }
        sql.push_str(&self.where_sql());
        if !self.groups.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", self.groups.join(", ")));
        }
        if !self.havings.is_empty() {
            let havings: Vec<String> = self
                .havings
                .iter()
                .map(|h| format!("{} {} :{}", h.column, h.operator, h.param))
                .collect();
            sql.push_str(&format!(" HAVING {}", havings.join(" AND ")));
        }

        if let Projection::Columns { limit } = projection {
            if !self.orders.is_empty() {
                let orders: Vec<String> = self
                    .orders
                    .iter()
                    .map(|o| match o {
                        Order::Column { column, descending } => {
                            format!("{column} {}", if *descending { "DESC" } else { "ASC" })
                        }
                        Order::Random => "RANDOM()".to_string(),
                    })
                    .collect();
                sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
            }
            match limit {
                Some(limit) => sql.push_str(&format!(" LIMIT {limit}")),
                // OFFSET needs a LIMIT on SQLite and MySQL
                None if self.offset > 0 => sql.push_str(&format!(" LIMIT {}", i64::MAX)),
                None => {}
            }
            if self.offset > 0 {
                sql.push_str(&format!(" OFFSET {}", self.offset));
            }
        }
        Ok(sql)
    }

    /// Compiled SELECT statement
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` if an unsupported operator was used.
    pub fn to_sql(&self) -> Result<String> {
        self.compile_select(&Projection::Columns { limit: self.limit })
    }

    /// Fetch every matching row
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn get(&self, pool: &DatabasePool) -> Result<Vec<DbRow>> {
        let sql = self.to_sql()?;
        pool.fetch_all(&sql, &self.bindings).await
    }

    /// Fetch the first matching row
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn first(&self, pool: &DatabasePool) -> Result<Option<DbRow>> {
        let sql = self.compile_select(&Projection::Columns { limit: Some(1) })?;
        pool.fetch_optional(&sql, &self.bindings).await
    }

    /// Fetch the row whose `id` column equals `id`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn find(&self, pool: &DatabasePool, id: impl Into<DbValue>) -> Result<Option<DbRow>> {
        self.clone().where_eq("id", id).first(pool).await
    }

    /// Value of one column from the first matching row
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn value(&self, pool: &DatabasePool, column: &str) -> Result<Option<DbValue>> {
        let row = self.clone().select([column]).first(pool).await?;
        Ok(row.and_then(|mut r| r.remove(column_alias(column))))
    }

    /// One column from every matching row
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn pluck(&self, pool: &DatabasePool, column: &str) -> Result<Vec<DbValue>> {
        let rows = self.clone().select([column]).get(pool).await?;
        let key = column_alias(column);
        Ok(rows
            .into_iter()
            .map(|mut r| r.remove(key).unwrap_or(DbValue::Null))
            .collect())
    }

    /// Whether any row matches
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn exists(&self, pool: &DatabasePool) -> Result<bool> {
        Ok(self.count(pool).await? > 0)
    }

    async fn aggregate(&self, pool: &DatabasePool, function: &str, column: &str) -> Result<DbValue> {
        let sql = self.compile_select(&Projection::Aggregate { function, column })?;
        let row = pool.fetch_optional(&sql, &self.bindings).await?;
        Ok(row
            .and_then(|mut r| r.remove("aggregate"))
            .unwrap_or(DbValue::Null))
    }

    /// `COUNT(*)` over the matching rows
    ///
    /// Grouped queries count their groups.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn count(&self, pool: &DatabasePool) -> Result<i64> {
        let value = if self.groups.is_empty() {
            self.aggregate(pool, "COUNT", "*").await?
        } else {
            let sql = self.count_groups_sql()?;
            pool.fetch_optional(&sql, &self.bindings)
                .await?
                .and_then(|mut r| r.remove("aggregate"))
                .unwrap_or(DbValue::Null)
        };
        Ok(value.as_i64().unwrap_or(0))
    }

    fn count_groups_sql(&self) -> Result<String> {
        let mut window = self.clone();
        window.limit = None;
        window.offset = 0;
        window.orders.clear();
        Ok(format!(
            "SELECT COUNT(*) AS aggregate FROM ({}) AS grouped",
            window.to_sql()?
        ))
    }

    /// `SUM(column)`; `Null` when no row matches
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn sum(&self, pool: &DatabasePool, column: &str) -> Result<DbValue> {
        self.aggregate(pool, "SUM", column).await
    }

    /// `AVG(column)`; `Null` when no row matches
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn avg(&self, pool: &DatabasePool, column: &str) -> Result<DbValue> {
        self.aggregate(pool, "AVG", column).await
    }

    /// `MAX(column)`; `Null` when no row matches
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn max(&self, pool: &DatabasePool, column: &str) -> Result<DbValue> {
        self.aggregate(pool, "MAX", column).await
    }

    /// `MIN(column)`; `Null` when no row matches
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn min(&self, pool: &DatabasePool, column: &str) -> Result<DbValue> {
        self.aggregate(pool, "MIN", column).await
    }

    /// One page of rows plus pagination metadata
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn paginate(&self, pool: &DatabasePool, per_page: u64, page: u64) -> Result<Paginator<DbRow>> {
        let total = u64::try_from(self.count(pool).await?).unwrap_or(0);
        let per_page = per_page.max(1);
        let page = page.max(1);
        let data = self.clone().take(per_page, page).get(pool).await?;
        Ok(Paginator::new(data, total, per_page, page))
    }

    /// `INSERT INTO table (...) VALUES (...)`; returns whether a row was written
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn insert(&self, pool: &DatabasePool, values: &DbRow) -> Result<bool> {
        let (sql, bindings) = self.compile_insert(values)?;
        Ok(pool.execute(&sql, &bindings).await? > 0)
    }

    /// Insert a row and return its generated primary key
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn insert_get_id(&self, pool: &DatabasePool, values: &DbRow, primary_key: &str) -> Result<DbValue> {
        let (sql, bindings) = self.compile_insert(values)?;
        pool.insert_get_id(&sql, &bindings, primary_key).await
    }

    /// `UPDATE table SET ... WHERE ...`; returns the affected row count
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` (also for an empty value map) or `Error::Database`.
    pub async fn update(&self, pool: &DatabasePool, values: &DbRow) -> Result<u64> {
        let (sql, bindings) = self.compile_update(values)?;
        pool.execute(&sql, &bindings).await
    }

    /// `DELETE FROM table WHERE ...`; returns the affected row count
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidQuery` or `Error::Database`.
    pub async fn delete(&self, pool: &DatabasePool) -> Result<u64> {
        let sql = self.compile_delete()?;
        pool.execute(&sql, &self.bindings).await
    }

    fn compile_insert(&self, values: &DbRow) -> Result<(String, Bindings)> {
        self.check()?;
        if values.is_empty() {
            return Ok((
                format!("INSERT INTO {} DEFAULT VALUES", self.table),
                Bindings::new(),
            ));
        }
        let mut scratch = self.clone();
        let columns: Vec<&str> = values.keys().map(String::as_str).collect();
        let params: Vec<String> = values
            .values()
            .map(|v| format!(":{}", scratch.bind(v.clone())))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            params.join(", ")
        );
        Ok((sql, scratch.bindings))
    }

    fn compile_update(&self, values: &DbRow) -> Result<(String, Bindings)> {
        self.check()?;
        if values.is_empty() {
            return Err(Error::InvalidQuery {
                reason: "update without values".to_string(),
            });
        }
        let mut scratch = self.clone();
        let sets: Vec<String> = values
            .iter()
            .map(|(column, v)| format!("{column} = :{}", scratch.bind(v.clone())))
            .collect();
        let sql = format!("UPDATE {} SET {}{}", self.table, sets.join(", "), self.where_sql());
        Ok((sql, scratch.bindings))
    }

    fn compile_delete(&self) -> Result<String> {
        self.check()?;
        Ok(format!("DELETE FROM {}{}", self.table, self.where_sql()))
    }
}

/// Result-set key of a select expression (`users.id` → `id`, `a AS b` → `b`)
fn column_alias(column: &str) -> &str {
    let lower = column.to_ascii_lowercase();
    if let Some(pos) = lower.rfind(" as ") {
        return column[pos + 4..].trim();
    }
    column.rsplit('.').next().unwrap_or(column).trim()
}

/// One page of results with its metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paginator<T> {
    /// Rows of the current page
    pub data: Vec<T>,
    /// 1-based page number
    pub current_page: u64,
    /// Page size
    pub per_page: u64,
    /// Rows across all pages
    pub total: u64,
    /// Last page number (at least 1)
    pub last_page: u64,
    /// 1-based index of the first row on this page, `None` when empty
    pub from: Option<u64>,
    /// 1-based index of the last row on this page, `None` when empty
    pub to: Option<u64>,
}

impl<T> Paginator<T> {
    /// Assemble the envelope for `data` fetched at `page`
    pub fn new(data: Vec<T>, total: u64, per_page: u64, page: u64) -> Self {
        let per_page = per_page.max(1);
        let last_page = total.div_ceil(per_page).max(1);
        let offset = (page.max(1) - 1).saturating_mul(per_page);
        let (from, to) = if data.is_empty() {
            (None, None)
        } else {
            (
                Some(offset.saturating_add(1)),
                Some(offset.saturating_add(data.len() as u64)),
            )
        };
        Self {
            data,
            current_page: page.max(1),
            per_page,
            total,
            last_page,
            from,
            to,
        }
    }

    /// Convert the rows while keeping the metadata
    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Paginator<U> {
        Paginator {
            data: self.data.into_iter().map(f).collect(),
            current_page: self.current_page,
            per_page: self.per_page,
            total: self.total,
            last_page: self.last_page,
            from: self.from,
            to: self.to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use std::collections::BTreeSet;

    fn placeholders(sql: &str) -> BTreeSet<String> {
        Regex::new(r":(param_\d+)")
            .unwrap()
            .captures_iter(sql)
            .map(|c| c[1].to_string())
            .collect()
    }

    fn assert_bindings_match(q: &QueryBuilder) {
        let sql = q.to_sql().unwrap();
        let keys: BTreeSet<String> = q.bindings().keys().cloned().collect();
        assert_eq!(placeholders(&sql), keys, "sql: {sql}");
    }

    async fn seeded_pool(rows: i64) -> DatabasePool {
        let pool = DatabasePool::connect_sqlite("sqlite::memory:", Some(1))
            .await
            .unwrap();
        pool.execute_raw("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price INTEGER, kind TEXT)")
            .await
            .unwrap();
        let q = QueryBuilder::new("items");
        for i in 1..=rows {
            let mut row = DbRow::new();
            row.insert("name".into(), format!("item-{i}").into());
            row.insert("price".into(), (i * 10).into());
            let kind = if i % 2 == 0 { "even" } else { "odd" };
            row.insert("kind".into(), kind.into());
            q.insert(&pool, &row).await.unwrap();
        }
        pool
    }

    #[test]
    fn test_simple_select() {
        let q = QueryBuilder::new("users");
        assert_eq!(q.to_sql().unwrap(), "SELECT * FROM users");

        let q = QueryBuilder::new("users")
            .select(["id", "name"])
            .distinct()
            .where_eq("active", true)
            .order_by_desc("id")
            .limit(5)
            .offset(10);
        assert_eq!(
            q.to_sql().unwrap(),
            "SELECT DISTINCT id, name FROM users WHERE active = :param_1 ORDER BY id DESC LIMIT 5 OFFSET 10"
        );
    }

    #[test]
    fn test_boolean_joiners() {
        let q = QueryBuilder::new("users")
            .where_("age", ">", 18)
            .or_where_eq("role", "admin")
            .where_null("deleted_at");
        assert_eq!(
            q.to_sql().unwrap(),
            "SELECT * FROM users WHERE age > :param_1 OR role = :param_2 AND deleted_at IS NULL"
        );
    }

    #[test]
    fn test_nested_where_shares_counter() {
        let q = QueryBuilder::new("posts")
            .where_eq("published", true)
            .where_nested(|q| q.where_eq("author_id", 1).or_where_eq("editor_id", 2))
            .where_eq("category", "news");
        assert_eq!(
            q.to_sql().unwrap(),
            "SELECT * FROM posts WHERE published = :param_1 AND (author_id = :param_2 OR editor_id = :param_3) AND category = :param_4"
        );
        assert_eq!(q.bindings().len(), 4);
        assert_bindings_match(&q);
    }

    #[test]
    fn test_empty_nested_is_dropped() {
        let q = QueryBuilder::new("posts")
            .where_eq("a", 1)
            .or_where_nested(|q| q);
        assert_eq!(q.to_sql().unwrap(), "SELECT * FROM posts WHERE a = :param_1");
    }

    #[test]
    fn test_empty_where_in_is_noop() {
        let plain = QueryBuilder::new("users").where_eq("active", true);
        let with_empty = QueryBuilder::new("users")
            .where_eq("active", true)
            .where_in("id", Vec::<i64>::new())
            .where_not_in("id", Vec::<i64>::new());
        assert_eq!(plain.to_sql().unwrap(), with_empty.to_sql().unwrap());
        assert!(!with_empty.to_sql().unwrap().contains("IN ()"));
    }

    #[test]
    fn test_in_between_and_null_clauses() {
        let q = QueryBuilder::new("orders")
            .where_in("status", ["open", "paid"])
            .where_not_in("id", [7, 8])
            .where_between("total", 10, 100)
            .where_not_between("discount", 50, 60)
            .where_not_null("shipped_at")
            .or_where_in("priority", [1]);
        assert_eq!(
            q.to_sql().unwrap(),
            "SELECT * FROM orders WHERE status IN (:param_1, :param_2) AND id NOT IN (:param_3, :param_4) \
             AND total BETWEEN :param_5 AND :param_6 AND discount NOT BETWEEN :param_7 AND :param_8 \
             AND shipped_at IS NOT NULL OR priority IN (:param_9)"
        );
        assert_bindings_match(&q);
    }

    #[test]
    fn test_bindings_invariant_over_mixed_calls() {
        let q = QueryBuilder::new("t")
            .where_("a", "<>", 1)
            .where_in("b", [1, 2, 3])
            .where_nested(|q| q.where_between("c", 1, 2).or_where_in("d", Vec::<i64>::new()))
            .where_like("e", "%x%")
            .group_by(["a"])
            .having("COUNT(*)", ">", 1);
        let sql = q.to_sql().unwrap();
        assert_eq!(placeholders(&sql).len(), q.bindings().len());
        assert_eq!(q.bindings().len(), 8);
        assert!(sql.contains("GROUP BY a HAVING COUNT(*) > :param_8"));
    }

    #[test]
    fn test_joins_and_orders() {
        let q = QueryBuilder::new("users")
            .select(["users.id", "posts.title"])
            .join("posts", "posts.user_id", "=", "users.id")
            .left_join("avatars", "avatars.user_id", "=", "users.id")
            .right_join("teams", "teams.id", "=", "users.team_id")
            .oldest("users.created_at")
            .in_random_order();
        assert_eq!(
            q.to_sql().unwrap(),
            "SELECT users.id, posts.title FROM users \
             INNER JOIN posts ON posts.user_id = users.id \
             LEFT JOIN avatars ON avatars.user_id = users.id \
             RIGHT JOIN teams ON teams.id = users.team_id \
             ORDER BY users.created_at ASC, RANDOM()"
        );
        assert!(q.bindings().is_empty());
    }

    #[test]
    fn test_where_column() {
        let q = QueryBuilder::new("t").where_column("updated_at", ">", "created_at");
        assert_eq!(q.to_sql().unwrap(), "SELECT * FROM t WHERE updated_at > created_at");
    }

    #[test]
    fn test_take_computes_offset() {
        let q = QueryBuilder::new("t").take(10, 3);
        assert_eq!(q.to_sql().unwrap(), "SELECT * FROM t LIMIT 10 OFFSET 20");
        let q = QueryBuilder::new("t").take(10, 1);
        assert_eq!(q.to_sql().unwrap(), "SELECT * FROM t LIMIT 10");
    }

    #[test]
    fn test_take_out_of_range_is_invalid() {
        let q = QueryBuilder::new("t").take(10, u64::MAX / 2);
        assert!(matches!(q.to_sql(), Err(Error::InvalidQuery { .. })));

        let q = QueryBuilder::new("t").limit(u64::MAX);
        assert!(matches!(q.to_sql(), Err(Error::InvalidQuery { .. })));

        let page = Paginator::new(vec![1], 10, u64::MAX, u64::MAX);
        assert_eq!(page.to, Some(u64::MAX));
    }

    #[test]
    fn test_offset_without_limit_gets_open_limit() {
        let q = QueryBuilder::new("t").offset(5);
        assert_eq!(
            q.to_sql().unwrap(),
            "SELECT * FROM t LIMIT 9223372036854775807 OFFSET 5"
        );
    }

    #[test]
    fn test_nested_group_holds_only_wheres() {
        let q = QueryBuilder::new("t").where_nested(|q| q.where_eq("a", 1).having("b", ">", 2));
        assert!(matches!(q.to_sql(), Err(Error::InvalidQuery { .. })));
        assert_eq!(q.bindings().keys().collect::<Vec<_>>(), vec!["param_1"]);

        let q = QueryBuilder::new("t")
            .where_nested(|q| q.where_in("a", [1, 2]).or_where_nested(|q| q.where_between("b", 3, 4)));
        assert_eq!(
            q.to_sql().unwrap(),
            "SELECT * FROM t WHERE (a IN (:param_1, :param_2) OR (b BETWEEN :param_3 AND :param_4))"
        );
        assert_bindings_match(&q);
    }

    #[test]
    fn test_invalid_operator_surfaces_at_compile() {
        let q = QueryBuilder::new("t").where_("a", "; DROP TABLE t", 1);
        assert!(matches!(q.to_sql(), Err(Error::InvalidQuery { .. })));

        let q = QueryBuilder::new("t").where_("name", "like", "a%");
        assert_eq!(q.to_sql().unwrap(), "SELECT * FROM t WHERE name LIKE :param_1");
    }

    #[test]
    fn test_column_alias() {
        assert_eq!(column_alias("users.email"), "email");
        assert_eq!(column_alias("COUNT(*) as total"), "total");
        assert_eq!(column_alias("name"), "name");
    }

    #[test]
    fn test_paginator_metadata() {
        let page = Paginator::new((11..=20).collect::<Vec<u64>>(), 25, 10, 2);
        assert_eq!(page.total, 25);
        assert_eq!(page.last_page, 3);
        assert_eq!(page.from, Some(11));
        assert_eq!(page.to, Some(20));

        let empty = Paginator::new(Vec::<u64>::new(), 0, 10, 1);
        assert_eq!(empty.last_page, 1);
        assert_eq!(empty.from, None);
    }

    #[tokio::test]
    async fn test_get_first_and_terminals_do_not_mutate() {
        let pool = seeded_pool(5).await;
        let q = QueryBuilder::new("items").where_("price", ">=", 20).order_by("id", "asc");
        let before = q.clone();

        let rows = q.get(&pool).await.unwrap();
        assert_eq!(rows.len(), 4);

        let first = q.first(&pool).await.unwrap().unwrap();
        assert_eq!(first["name"], DbValue::String("item-2".into()));
        assert_eq!(q.count(&pool).await.unwrap(), 4);
        assert_eq!(q, before);
    }

    #[tokio::test]
    async fn test_aggregates() {
        let pool = seeded_pool(4).await;
        let q = QueryBuilder::new("items");
        assert_eq!(q.count(&pool).await.unwrap(), 4);
        assert_eq!(q.sum(&pool, "price").await.unwrap(), DbValue::Int(100));
        assert_eq!(q.avg(&pool, "price").await.unwrap(), DbValue::Float(25.0));
        assert_eq!(q.max(&pool, "price").await.unwrap(), DbValue::Int(40));
        assert_eq!(q.min(&pool, "price").await.unwrap(), DbValue::Int(10));

        let none = QueryBuilder::new("items").where_eq("kind", "none");
        assert_eq!(none.sum(&pool, "price").await.unwrap(), DbValue::Null);
        assert!(!none.exists(&pool).await.unwrap());
        assert!(q.exists(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_paginate() {
        let pool = seeded_pool(25).await;
        let page = QueryBuilder::new("items")
            .order_by("id", "asc")
            .paginate(&pool, 10, 2)
            .await
            .unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.last_page, 3);
        assert_eq!(page.from, Some(11));
        assert_eq!(page.to, Some(20));
        assert_eq!(page.data.len(), 10);
        assert_eq!(page.data[0]["id"], DbValue::Int(11));

        let last = QueryBuilder::new("items").paginate(&pool, 10, 3).await.unwrap();
        assert_eq!(last.data.len(), 5);
        assert_eq!(last.to, Some(25));
    }

    #[tokio::test]
    async fn test_paginate_page_out_of_range() {
        let pool = seeded_pool(3).await;
        let err = QueryBuilder::new("items")
            .paginate(&pool, 10, u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn test_offset_without_limit_runs() {
        let pool = seeded_pool(5).await;
        let rows = QueryBuilder::new("items")
            .order_by("id", "asc")
            .offset(2)
            .get(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["id"], DbValue::Int(3));
    }

    #[tokio::test]
    async fn test_grouped_count_counts_groups() {
        let pool = seeded_pool(5).await;
        let q = QueryBuilder::new("items").select(["kind"]).group_by(["kind"]);
        assert_eq!(q.count(&pool).await.unwrap(), 2);

        let page = q.paginate(&pool, 1, 2).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.last_page, 2);
        assert_eq!(page.data.len(), 1);
    }

    #[tokio::test]
    async fn test_pluck_value_find() {
        let pool = seeded_pool(3).await;
        let q = QueryBuilder::new("items").order_by("id", "asc");
        assert_eq!(
            q.pluck(&pool, "name").await.unwrap(),
            vec![
                DbValue::from("item-1"),
                DbValue::from("item-2"),
                DbValue::from("item-3")
            ]
        );
        assert_eq!(
            q.value(&pool, "price").await.unwrap(),
            Some(DbValue::Int(10))
        );
        let row = q.find(&pool, 2).await.unwrap().unwrap();
        assert_eq!(row["name"], DbValue::from("item-2"));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let pool = seeded_pool(4).await;
        let mut values = DbRow::new();
        values.insert("kind".into(), "sale".into());

        let updated = QueryBuilder::new("items")
            .where_in("id", [1, 2])
            .update(&pool, &values)
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let deleted = QueryBuilder::new("items")
            .where_eq("kind", "sale")
            .delete(&pool)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(QueryBuilder::new("items").count(&pool).await.unwrap(), 2);

        assert!(matches!(
            QueryBuilder::new("items").update(&pool, &DbRow::new()).await,
            Err(Error::InvalidQuery { .. })
        ));
    }
}
