//! # Models
//!
//! Active-record style entities over the query builder.
//!
//! A [`Schema`] describes a table once (primary key, casts, fillable columns,
//! timestamps and relations) and lives in a `static`. A [`Model`] is one row
//! of that table: a map of cast attribute values plus the set of columns
//! written since the last load or save.
//!
//! ```rust,ignore
//! fn users() -> &'static Schema {
//!     static SCHEMA: OnceLock<Schema> = OnceLock::new();
//!     SCHEMA.get_or_init(|| {
//!         Schema::new("users")
//!             .cast("is_admin", Cast::Bool)
//!             .fillable(["name", "email"])
//!             .has_many("posts", posts, "user_id", "id")
//!     })
//! }
//!
//! let mut user = Model::new(users());
//! user.set("name", "Ada")?;
//! user.save(&pool).await?;
//! ```

use crate::database::{DatabasePool, DbRow, DbValue, DATETIME_FORMAT};
use crate::error::{Error, Result};
use crate::json::parse_json;
use crate::query::{Paginator, QueryBuilder};
use crate::relation::{eager_load, Loaded, Relation, RelationKind, RelationSpec};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

const CREATED_AT: &str = "created_at";
const UPDATED_AT: &str = "updated_at";

/// Attribute conversion applied on read and write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cast {
    /// 64-bit integer
    Int,
    /// 64-bit float
    Float,
    /// Boolean (`1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`)
    Bool,
    /// Text
    String,
    /// JSON document (`json` and `array` casts)
    Json,
    /// Timestamp without time zone
    DateTime,
}

impl fmt::Display for Cast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Json => "json",
            Self::DateTime => "datetime",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Cast {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" => Ok(Self::Int),
            "float" | "double" | "real" => Ok(Self::Float),
            "bool" | "boolean" => Ok(Self::Bool),
            "string" => Ok(Self::String),
            "json" | "array" | "object" => Ok(Self::Json),
            "datetime" | "date" | "timestamp" => Ok(Self::DateTime),
            other => Err(Error::Config {
                message: format!("unknown cast '{other}'"),
            }),
        }
    }
}

impl Cast {
    /// Convert `value` for `column`; `Null` always stays `Null`
    ///
    /// # Errors
    ///
    /// Returns `Error::Cast` when the value has no representation in this cast.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn apply(self, column: &str, value: DbValue) -> Result<DbValue> {
        let fail = |reason: String| Error::cast(column, self, reason);
        if value.is_null() {
            return Ok(DbValue::Null);
        }
        match self {
            Self::Int => match value {
                DbValue::Int(_) => Ok(value),
                DbValue::Bool(b) => Ok(DbValue::Int(i64::from(b))),
                DbValue::Float(f) if f.is_finite() => Ok(DbValue::Int(f.trunc() as i64)),
                DbValue::String(ref s) => s
                    .trim()
                    .parse::<i64>()
                    .map(DbValue::Int)
                    .map_err(|e| fail(format!("'{s}': {e}"))),
                DbValue::Json(ref v) => v
                    .as_i64()
                    .map(DbValue::Int)
                    .ok_or_else(|| fail(format!("'{v}' is not an integer"))),
                other => Err(fail(format!("'{other}' is not an integer"))),
            },
            Self::Float => match value {
                DbValue::Float(_) => Ok(value),
                DbValue::Int(i) => Ok(DbValue::Float(i as f64)),
                DbValue::Bool(b) => Ok(DbValue::Float(if b { 1.0 } else { 0.0 })),
                DbValue::String(ref s) => s
                    .trim()
                    .parse::<f64>()
                    .map(DbValue::Float)
                    .map_err(|e| fail(format!("'{s}': {e}"))),
                DbValue::Json(ref v) => v
                    .as_f64()
                    .map(DbValue::Float)
                    .ok_or_else(|| fail(format!("'{v}' is not a number"))),
                other => Err(fail(format!("'{other}' is not a number"))),
            },
            Self::Bool => match value {
                DbValue::Bool(_) => Ok(value),
                DbValue::Int(i) => Ok(DbValue::Bool(i != 0)),
                DbValue::Float(f) => Ok(DbValue::Bool(f != 0.0)),
                DbValue::String(ref s) => match s.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(DbValue::Bool(true)),
                    "0" | "false" | "no" | "off" | "" => Ok(DbValue::Bool(false)),
                    _ => Err(fail(format!("'{s}' is not a boolean"))),
                },
                DbValue::Json(serde_json::Value::Bool(b)) => Ok(DbValue::Bool(b)),
                other => Err(fail(format!("'{other}' is not a boolean"))),
            },
            Self::String => match value {
                DbValue::String(_) => Ok(value),
                DbValue::Bytes(bytes) => String::from_utf8(bytes)
                    .map(DbValue::String)
                    .map_err(|e| fail(e.to_string())),
                other => Ok(DbValue::String(other.to_string())),
            },
            Self::Json => match value {
                DbValue::Json(_) => Ok(value),
                DbValue::String(s) => parse_json::<serde_json::Value>(&s)
                    .map(DbValue::Json)
                    .map_err(|e| fail(e.to_string())),
                DbValue::Bytes(bytes) => {
                    let text = String::from_utf8(bytes).map_err(|e| fail(e.to_string()))?;
                    parse_json::<serde_json::Value>(&text)
                        .map(DbValue::Json)
                        .map_err(|e| fail(e.to_string()))
                }
                other => Ok(DbValue::Json(other.to_json())),
            },
            Self::DateTime => match value {
                DbValue::DateTime(_) => Ok(value),
                DbValue::Int(secs) => DateTime::from_timestamp(secs, 0)
                    .map(|dt| DbValue::DateTime(dt.naive_utc()))
                    .ok_or_else(|| fail(format!("timestamp {secs} out of range"))),
                DbValue::String(ref s) => parse_datetime(s)
                    .map(DbValue::DateTime)
                    .ok_or_else(|| fail(format!("'{s}' is not a datetime"))),
                other => Err(fail(format!("'{other}' is not a datetime"))),
            },
        }
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    [DATETIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.naive_utc()))
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn now() -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Table description shared by every model of one kind
#[derive(Debug, Clone)]
pub struct Schema {
    table: String,
    primary_key: String,
    casts: BTreeMap<String, Cast>,
    fillable: Vec<String>,
    timestamps: bool,
    relations: Vec<RelationSpec>,
}

impl Schema {
    /// Schema for `table` with primary key `id`
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: "id".to_string(),
            casts: BTreeMap::new(),
            fillable: Vec::new(),
            timestamps: false,
            relations: Vec::new(),
        }
    }

    /// Override the primary key column
    #[must_use]
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    /// Declare a cast for `column`
    #[must_use]
    pub fn cast(mut self, column: impl Into<String>, cast: Cast) -> Self {
        self.casts.insert(column.into(), cast);
        self
    }

    /// Columns accepted by [`Model::fill`]
    ///
    /// Without a fillable list every column except the primary key is accepted.
    #[must_use]
    pub fn fillable<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fillable = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Maintain `created_at` and `updated_at` on save
    #[must_use]
    pub fn timestamps(mut self) -> Self {
        self.timestamps = true;
        self.casts.insert(CREATED_AT.to_string(), Cast::DateTime);
        self.casts.insert(UPDATED_AT.to_string(), Cast::DateTime);
        self
    }

    fn relate(
        mut self,
        kind: RelationKind,
        name: &str,
        related: fn() -> &'static Self,
        foreign_key: &str,
        local_key: &str,
    ) -> Self {
        self.relations.push(RelationSpec {
            name: name.to_string(),
            kind,
            related,
            foreign_key: foreign_key.to_string(),
            local_key: local_key.to_string(),
        });
        self
    }

    /// `related.foreign_key` references `self.local_key`, at most one row
    #[must_use]
    pub fn has_one(self, name: &str, related: fn() -> &'static Self, foreign_key: &str, local_key: &str) -> Self {
        self.relate(RelationKind::HasOne, name, related, foreign_key, local_key)
    }

    /// `related.foreign_key` references `self.local_key`
    #[must_use]
    pub fn has_many(self, name: &str, related: fn() -> &'static Self, foreign_key: &str, local_key: &str) -> Self {
        self.relate(RelationKind::HasMany, name, related, foreign_key, local_key)
    }

    /// `self.foreign_key` references `related.owner_key`
    #[must_use]
    pub fn belongs_to(self, name: &str, related: fn() -> &'static Self, foreign_key: &str, owner_key: &str) -> Self {
        self.relate(RelationKind::BelongsTo, name, related, foreign_key, owner_key)
    }

    /// Table name
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Primary key column
    #[must_use]
    pub fn key_name(&self) -> &str {
        &self.primary_key
    }

    /// Declared cast of `column`
    #[must_use]
    pub fn cast_of(&self, column: &str) -> Option<Cast> {
        self.casts.get(column).copied()
    }

    /// Whether [`Model::fill`] accepts `column`
    #[must_use]
    pub fn is_fillable(&self, column: &str) -> bool {
        if self.fillable.is_empty() {
            column != self.primary_key
        } else {
            self.fillable.iter().any(|c| c == column)
        }
    }

    /// Relation declared as `name`
    ///
    /// # Errors
    ///
    /// Returns `Error::RelationNotDefined` for unknown names.
    pub fn relation(&self, name: &str) -> Result<&RelationSpec> {
        self.relations
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::RelationNotDefined {
                table: self.table.clone(),
                relation: name.to_string(),
            })
    }

    /// Start a model query on this table
    #[must_use]
    pub fn query(&'static self) -> ModelQuery {
        ModelQuery {
            schema: self,
            builder: QueryBuilder::new(self.table.clone()),
            eager: Vec::new(),
        }
    }

    fn cast_value(&self, column: &str, value: DbValue) -> Result<DbValue> {
        match self.cast_of(column) {
            Some(cast) => cast.apply(column, value),
            None => Ok(value),
        }
    }
}

/// One row of a [`Schema`]'s table
#[derive(Debug, Clone)]
pub struct Model {
    schema: &'static Schema,
    attributes: DbRow,
    dirty: BTreeSet<String>,
    relations: BTreeMap<String, Loaded>,
}

impl Model {
    /// Empty, unsaved model
    #[must_use]
    pub fn new(schema: &'static Schema) -> Self {
        Self {
            schema,
            attributes: DbRow::new(),
            dirty: BTreeSet::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Model for a fetched row; nothing is dirty
    ///
    /// # Errors
    ///
    /// Returns `Error::Cast` if a stored value does not fit its cast.
    pub fn from_row(schema: &'static Schema, row: DbRow) -> Result<Self> {
        let mut attributes = DbRow::new();
        for (column, value) in row {
            let value = schema.cast_value(&column, value)?;
            attributes.insert(column, value);
        }
        Ok(Self {
            schema,
            attributes,
            dirty: BTreeSet::new(),
            relations: BTreeMap::new(),
        })
    }

    /// Schema of this model
    #[must_use]
    pub const fn schema(&self) -> &'static Schema {
        self.schema
    }

    /// Attribute value
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&DbValue> {
        self.attributes.get(column)
    }

    /// Integer attribute
    #[must_use]
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(DbValue::as_i64)
    }

    /// Float attribute
    #[must_use]
    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(DbValue::as_f64)
    }

    /// Boolean attribute
    #[must_use]
    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(DbValue::as_bool)
    }

    /// Text attribute
    #[must_use]
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(DbValue::as_str)
    }

    /// JSON attribute
    #[must_use]
    pub fn get_json(&self, column: &str) -> Option<&serde_json::Value> {
        match self.get(column) {
            Some(DbValue::Json(v)) => Some(v),
            _ => None,
        }
    }

    /// Datetime attribute
    #[must_use]
    pub fn get_datetime(&self, column: &str) -> Option<NaiveDateTime> {
        match self.get(column) {
            Some(DbValue::DateTime(dt)) => Some(*dt),
            _ => None,
        }
    }

    /// All attributes
    #[must_use]
    pub const fn attributes(&self) -> &DbRow {
        &self.attributes
    }

    /// Write an attribute through its cast
    ///
    /// The column becomes dirty only if the cast value differs from the
    /// current one. The primary key is never dirty.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cast` if the value does not fit the column's cast.
    pub fn set(&mut self, column: &str, value: impl Into<DbValue>) -> Result<&mut Self> {
        let value = self.schema.cast_value(column, value.into())?;
        if self.attributes.get(column) == Some(&value) {
            return Ok(self);
        }
        if column != self.schema.primary_key {
            self.dirty.insert(column.to_string());
        }
        self.attributes.insert(column.to_string(), value);
        Ok(self)
    }

    /// Mass-assign the fillable subset of `values`
    ///
    /// Columns outside the fillable list are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cast` on the first value that does not fit its cast.
    pub fn fill<I, K, V>(&mut self, values: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<DbValue>,
    {
        for (column, value) in values {
            let column = column.as_ref();
            if self.schema.is_fillable(column) {
                self.set(column, value)?;
            } else {
                debug!(table = %self.schema.table, column, "Skipping guarded attribute");
            }
        }
        Ok(self)
    }

    /// Whether any attribute changed since the last load or save
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Columns changed since the last load or save
    pub fn dirty(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Primary key value, `None` while unsaved
    #[must_use]
    pub fn key(&self) -> Option<&DbValue> {
        self.get(&self.schema.primary_key)
            .filter(|v| !v.is_empty_key())
    }

    /// Whether the model has a primary key value
    #[must_use]
    pub fn exists(&self) -> bool {
        self.key().is_some()
    }

    fn key_query(&self, key: &DbValue) -> QueryBuilder {
        QueryBuilder::new(self.schema.table.clone()).where_eq(&self.schema.primary_key, key.clone())
    }

    /// Insert or update the model
    ///
    /// Without a primary key every attribute is inserted and the generated key
    /// is stored. Otherwise only dirty columns are updated; a clean model
    /// returns `Ok(true)` without touching the database. Returns `Ok(false)`
    /// when the write affected no row.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` on driver failure.
    pub async fn save(&mut self, pool: &DatabasePool) -> Result<bool> {
        let pk = self.schema.primary_key.clone();

        let Some(key) = self.key().cloned() else {
            if self.schema.timestamps {
                let stamp = DbValue::DateTime(now());
                for column in [CREATED_AT, UPDATED_AT] {
                    if self.get(column).map_or(true, DbValue::is_null) {
                        self.attributes.insert(column.to_string(), stamp.clone());
                    }
                }
            }
            let values: DbRow = self
                .attributes
                .iter()
                .filter(|(column, _)| **column != pk)
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect();
            let id = QueryBuilder::new(self.schema.table.clone())
                .insert_get_id(pool, &values, &pk)
                .await?;
            debug!(table = %self.schema.table, id = %id, "Inserted model");
            if !id.is_null() {
                let id = self.schema.cast_value(&pk, id)?;
                self.attributes.insert(pk, id);
            }
            self.dirty.clear();
            return Ok(true);
        };

        if self.dirty.is_empty() {
            return Ok(true);
        }
        if self.schema.timestamps {
            self.attributes
                .insert(UPDATED_AT.to_string(), DbValue::DateTime(now()));
            self.dirty.insert(UPDATED_AT.to_string());
        }
        let values: DbRow = self
            .dirty
            .iter()
            .filter_map(|column| {
                self.attributes
                    .get(column)
                    .map(|value| (column.clone(), value.clone()))
            })
            .collect();
        let affected = self.key_query(&key).update(pool, &values).await?;
        debug!(table = %self.schema.table, key = %key, columns = values.len(), affected, "Updated model");
        if affected == 0 {
            return Ok(false);
        }
        self.dirty.clear();
        Ok(true)
    }

    /// Delete the row by primary key
    ///
    /// Returns `Ok(false)` when the model has no key or no row was deleted.
    /// The in-memory attributes are left as they were.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` on driver failure.
    pub async fn delete(&self, pool: &DatabasePool) -> Result<bool> {
        let Some(key) = self.key() else {
            return Ok(false);
        };
        let affected = self.key_query(key).delete(pool).await?;
        Ok(affected > 0)
    }

    /// Reload attributes from the database, dropping unsaved changes and cached relations
    ///
    /// Returns `Ok(false)` when the model has no key or its row is gone.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` or `Error::Cast`.
    pub async fn refresh(&mut self, pool: &DatabasePool) -> Result<bool> {
        let Some(key) = self.key() else {
            return Ok(false);
        };
        let Some(row) = self.key_query(key).first(pool).await? else {
            return Ok(false);
        };
        *self = Self::from_row(self.schema, row)?;
        Ok(true)
    }

    /// Find a model by primary key
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` or `Error::Cast`.
    pub async fn find(schema: &'static Schema, pool: &DatabasePool, id: impl Into<DbValue>) -> Result<Option<Self>> {
        schema
            .query()
            .scope(|q| q.where_eq(&schema.primary_key, id))
            .first(pool)
            .await
    }

    /// Every row of the table
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` or `Error::Cast`.
    pub async fn all(schema: &'static Schema, pool: &DatabasePool) -> Result<Vec<Self>> {
        schema.query().get(pool).await
    }

    /// Relation `name` scoped to this model
    ///
    /// # Errors
    ///
    /// Returns `Error::RelationNotDefined` for undeclared relations.
    pub fn relation(&self, name: &str) -> Result<Relation<'static>> {
        let spec = self.schema.relation(name)?;
        Ok(Relation::new(spec, self))
    }

    /// Resolve relation `name` and cache it on the model
    ///
    /// # Errors
    ///
    /// Returns `Error::RelationNotDefined`, `Error::Database` or `Error::Cast`.
    pub async fn load(&mut self, pool: &DatabasePool, name: &str) -> Result<&Loaded> {
        let loaded = self.relation(name)?.get_results(pool).await?;
        Ok(match self.relations.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(loaded);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(loaded),
        })
    }

    /// Cached relation value
    #[must_use]
    pub fn related(&self, name: &str) -> Option<&Loaded> {
        self.relations.get(name)
    }

    pub(crate) fn set_relation(&mut self, name: &str, loaded: Loaded) {
        self.relations.insert(name.to_string(), loaded);
    }

    /// Attributes and loaded relations as a JSON object
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut map: serde_json::Map<String, serde_json::Value> = self
            .attributes
            .iter()
            .map(|(column, value)| (column.clone(), value.to_json()))
            .collect();
        for (name, loaded) in &self.relations {
            map.insert(name.clone(), loaded.to_json());
        }
        serde_json::Value::Object(map)
    }
}

/// Query returning models, with optional eager loading
#[derive(Debug, Clone)]
pub struct ModelQuery {
    schema: &'static Schema,
    builder: QueryBuilder,
    eager: Vec<String>,
}

impl ModelQuery {
    /// Apply builder calls to the underlying query
    #[must_use]
    pub fn scope<F>(mut self, f: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        self.builder = f(self.builder);
        self
    }

    /// Eager load relations on every fetched model
    #[must_use]
    pub fn with<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.eager.extend(relations.into_iter().map(Into::into));
        self
    }

    /// The underlying query
    #[must_use]
    pub const fn builder(&self) -> &QueryBuilder {
        &self.builder
    }

    async fn hydrate(&self, pool: &DatabasePool, rows: Vec<DbRow>) -> Result<Vec<Model>> {
        let mut models = rows
            .into_iter()
            .map(|row| Model::from_row(self.schema, row))
            .collect::<Result<Vec<_>>>()?;
        if !models.is_empty() {
            for name in &self.eager {
                let spec = self.schema.relation(name)?;
                eager_load(spec, &mut models, pool).await?;
            }
        }
        Ok(models)
    }

    /// Fetch every matching model
    ///
    /// # Errors
    ///
    /// Returns `Error::RelationNotDefined`, `Error::Database` or `Error::Cast`.
    pub async fn get(&self, pool: &DatabasePool) -> Result<Vec<Model>> {
        let rows = self.builder.get(pool).await?;
        self.hydrate(pool, rows).await
    }

    /// Fetch the first matching model
    ///
    /// # Errors
    ///
    /// Returns `Error::RelationNotDefined`, `Error::Database` or `Error::Cast`.
    pub async fn first(&self, pool: &DatabasePool) -> Result<Option<Model>> {
        let rows: Vec<DbRow> = self.builder.first(pool).await?.into_iter().collect();
        Ok(self.hydrate(pool, rows).await?.pop())
    }

    /// Number of matching rows
    ///
    /// # Errors
    ///
    /// Returns `Error::Database`.
    pub async fn count(&self, pool: &DatabasePool) -> Result<i64> {
        self.builder.count(pool).await
    }

    /// One page of models
    ///
    /// # Errors
    ///
    /// Returns `Error::RelationNotDefined`, `Error::Database` or `Error::Cast`.
    pub async fn paginate(&self, pool: &DatabasePool, per_page: u64, page: u64) -> Result<Paginator<Model>> {
        let rows = self.builder.paginate(pool, per_page, page).await?;
        let (total, per_page, current) = (rows.total, rows.per_page, rows.current_page);
        let models = self.hydrate(pool, rows.data).await?;
        Ok(Paginator::new(models, total, per_page, current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::OnceLock;

    fn users() -> &'static Schema {
        static SCHEMA: OnceLock<Schema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::new("users")
                .cast("age", Cast::Int)
                .cast("is_admin", Cast::Bool)
                .cast("settings", Cast::Json)
                .fillable(["name", "age", "settings"])
                .timestamps()
                .has_many("posts", posts, "user_id", "id")
        })
    }

    fn posts() -> &'static Schema {
        static SCHEMA: OnceLock<Schema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::new("posts")
                .cast("published", Cast::Bool)
                .belongs_to("user", users, "user_id", "id")
        })
    }

    async fn pool() -> DatabasePool {
        let pool = DatabasePool::connect_sqlite("sqlite::memory:", Some(1))
            .await
            .unwrap();
        pool.execute_raw(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER, is_admin BOOLEAN, \
             settings TEXT, created_at DATETIME, updated_at DATETIME)",
        )
        .await
        .unwrap();
        pool.execute_raw("CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER, title TEXT, published BOOLEAN)")
            .await
            .unwrap();
        pool
    }

    fn loaded_user() -> Model {
        let row: DbRow = [
            ("id".to_string(), DbValue::Int(1)),
            ("name".to_string(), DbValue::from("Ada")),
            ("age".to_string(), DbValue::from("36")),
        ]
        .into_iter()
        .collect();
        Model::from_row(users(), row).unwrap()
    }

    #[test]
    fn test_cast_parse() {
        assert_eq!("integer".parse::<Cast>().unwrap(), Cast::Int);
        assert_eq!("array".parse::<Cast>().unwrap(), Cast::Json);
        assert!("money".parse::<Cast>().is_err());
    }

    #[test]
    fn test_cast_apply() {
        assert_eq!(Cast::Int.apply("a", "42".into()).unwrap(), DbValue::Int(42));
        assert_eq!(Cast::Bool.apply("a", "yes".into()).unwrap(), DbValue::Bool(true));
        assert_eq!(Cast::Bool.apply("a", DbValue::Int(0)).unwrap(), DbValue::Bool(false));
        assert_eq!(Cast::Float.apply("a", DbValue::Int(2)).unwrap(), DbValue::Float(2.0));
        assert_eq!(Cast::String.apply("a", DbValue::Int(7)).unwrap(), DbValue::from("7"));
        assert_eq!(
            Cast::Json.apply("a", r#"{"k":[1,2]}"#.into()).unwrap(),
            DbValue::Json(json!({"k": [1, 2]}))
        );
        assert_eq!(
            Cast::DateTime.apply("a", "2024-05-01 10:30:00".into()).unwrap(),
            DbValue::DateTime(
                NaiveDate::from_ymd_opt(2024, 5, 1)
                    .unwrap()
                    .and_hms_opt(10, 30, 0)
                    .unwrap()
            )
        );
        assert_eq!(Cast::Int.apply("a", DbValue::Null).unwrap(), DbValue::Null);
    }

    #[test]
    fn test_invalid_cast_names_column() {
        let err = Cast::Json.apply("settings", "{not json".into()).unwrap_err();
        assert!(matches!(err, Error::Cast { ref column, .. } if column == "settings"));
        assert!(Cast::Int.apply("age", "abc".into()).is_err());
        assert!(Cast::DateTime.apply("at", "yesterday".into()).is_err());
    }

    #[test]
    fn test_loaded_model_is_clean_and_cast() {
        let user = loaded_user();
        assert!(!user.is_dirty());
        assert_eq!(user.get_i64("age"), Some(36));
        assert_eq!(user.get("age"), Some(&DbValue::Int(36)));
    }

    #[test]
    fn test_dirty_tracking() {
        let mut user = loaded_user();
        user.set("name", "Ada").unwrap();
        assert!(!user.is_dirty());

        // same value after casting
        user.set("age", "36").unwrap();
        assert!(!user.is_dirty());

        user.set("age", 37).unwrap();
        assert_eq!(user.dirty().collect::<Vec<_>>(), vec!["age"]);

        user.set("id", 9).unwrap();
        assert!(!user.dirty().any(|c| c == "id"));
    }

    #[test]
    fn test_fill_respects_fillable() {
        let mut user = Model::new(users());
        user.fill([("name", DbValue::from("Grace")), ("is_admin", DbValue::Bool(true)), ("id", 5.into())])
            .unwrap();
        assert_eq!(user.get_str("name"), Some("Grace"));
        assert!(user.get("is_admin").is_none());
        assert!(user.get("id").is_none());
    }

    #[test]
    fn test_unknown_relation() {
        let user = loaded_user();
        assert!(matches!(
            user.relation("comments"),
            Err(Error::RelationNotDefined { .. })
        ));
    }

    #[test]
    fn test_to_json_includes_relations() {
        let mut user = loaded_user();
        user.set_relation("posts", Loaded::Many(Vec::new()));
        let value = user.to_json();
        assert_eq!(value["name"], json!("Ada"));
        assert_eq!(value["posts"], json!([]));
    }

    #[tokio::test]
    async fn test_insert_populates_key_and_timestamps() {
        let pool = pool().await;
        let mut user = Model::new(users());
        user.set("name", "Ada").unwrap();
        user.set("settings", json!({"theme": "dark"})).unwrap();

        assert!(user.save(&pool).await.unwrap());
        assert_eq!(user.key(), Some(&DbValue::Int(1)));
        assert!(!user.is_dirty());
        assert!(user.get_datetime("created_at").is_some());

        let found = Model::find(users(), &pool, 1).await.unwrap().unwrap();
        assert_eq!(found.get_json("settings"), Some(&json!({"theme": "dark"})));
        assert_eq!(found.get_datetime("created_at"), user.get_datetime("created_at"));
    }

    #[tokio::test]
    async fn test_update_writes_only_dirty_columns() {
        let pool = pool().await;
        let mut user = Model::new(users());
        user.fill([("name", DbValue::from("Ada")), ("age", 36.into())]).unwrap();
        user.save(&pool).await.unwrap();

        // a concurrent change to a clean column must survive our update
        pool.execute_raw("UPDATE users SET name = 'Lovelace' WHERE id = 1")
            .await
            .unwrap();
        user.set("age", 37).unwrap();
        assert!(user.save(&pool).await.unwrap());

        let fresh = Model::find(users(), &pool, 1).await.unwrap().unwrap();
        assert_eq!(fresh.get_str("name"), Some("Lovelace"));
        assert_eq!(fresh.get_i64("age"), Some(37));
    }

    #[tokio::test]
    async fn test_clean_save_does_not_touch_database() {
        let pool = pool().await;
        pool.execute_raw("INSERT INTO users (id, name) VALUES (1, 'Ada')")
            .await
            .unwrap();
        let mut user = Model::find(users(), &pool, 1).await.unwrap().unwrap();
        pool.execute_raw("DELETE FROM users").await.unwrap();

        // the row is gone, but a clean save never issues a write
        assert!(user.save(&pool).await.unwrap());

        user.set("name", "Grace").unwrap();
        assert!(!user.save(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_update_keeps_changes_dirty() {
        let pool = pool().await;
        pool.execute_raw("INSERT INTO users (id, name) VALUES (1, 'Ada')")
            .await
            .unwrap();
        let mut user = Model::find(users(), &pool, 1).await.unwrap().unwrap();
        pool.execute_raw("DELETE FROM users").await.unwrap();

        user.set("name", "Grace").unwrap();
        assert!(!user.save(&pool).await.unwrap());
        assert!(user.dirty().any(|c| c == "name"));

        pool.execute_raw("INSERT INTO users (id, name) VALUES (1, 'Ada')")
            .await
            .unwrap();
        assert!(user.save(&pool).await.unwrap());
        assert!(!user.is_dirty());

        let stored = Model::find(users(), &pool, 1).await.unwrap().unwrap();
        assert_eq!(stored.get_str("name"), Some("Grace"));
    }

    #[tokio::test]
    async fn test_delete_and_refresh() {
        let pool = pool().await;
        assert!(!Model::new(users()).delete(&pool).await.unwrap());

        let mut user = Model::new(users());
        user.set("name", "Ada").unwrap();
        user.save(&pool).await.unwrap();

        user.set("name", "Unsaved").unwrap();
        assert!(user.refresh(&pool).await.unwrap());
        assert_eq!(user.get_str("name"), Some("Ada"));
        assert!(!user.is_dirty());

        assert!(user.delete(&pool).await.unwrap());
        assert_eq!(user.get_str("name"), Some("Ada"));
        assert!(Model::find(users(), &pool, 1).await.unwrap().is_none());
        assert!(!user.refresh(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_bool_cast_roundtrips_through_sqlite() {
        let pool = pool().await;
        let mut post = Model::new(posts());
        post.set("title", "Hello").unwrap();
        post.set("published", "1").unwrap();
        post.save(&pool).await.unwrap();

        let stored = Model::find(posts(), &pool, 1).await.unwrap().unwrap();
        assert_eq!(stored.get_bool("published"), Some(true));
    }

    #[tokio::test]
    async fn test_with_eager_loads_and_load_caches() {
        let pool = pool().await;
        pool.execute_raw("INSERT INTO users (id, name) VALUES (1, 'Ada'), (2, 'Grace'), (3, 'Linus')")
            .await
            .unwrap();
        pool.execute_raw(
            "INSERT INTO posts (user_id, title) VALUES (1, 'Notes'), (2, 'COBOL'), (1, 'Engines')",
        )
        .await
        .unwrap();

        let users_with_posts = users()
            .query()
            .scope(|q| q.order_by("id", "asc"))
            .with(["posts"])
            .get(&pool)
            .await
            .unwrap();
        let counts: Vec<usize> = users_with_posts
            .iter()
            .map(|u| u.related("posts").unwrap().many().len())
            .collect();
        assert_eq!(counts, vec![2, 1, 0]);

        let mut post = Model::find(posts(), &pool, 2).await.unwrap().unwrap();
        let owner = post.load(&pool, "user").await.unwrap();
        assert_eq!(owner.one().unwrap().get_str("name"), Some("Grace"));
        assert!(post.related("user").is_some());

        let missing = users().query().with(["comments"]).get(&pool).await;
        assert!(matches!(missing, Err(Error::RelationNotDefined { .. })));
    }

    #[tokio::test]
    async fn test_model_paginate() {
        let pool = pool().await;
        for i in 0..25 {
            let mut user = Model::new(users());
            user.set("name", format!("user-{i}")).unwrap();
            user.save(&pool).await.unwrap();
        }
        let page = users()
            .query()
            .scope(|q| q.order_by("id", "asc"))
            .paginate(&pool, 10, 2)
            .await
            .unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.last_page, 3);
        assert_eq!(page.from, Some(11));
        assert_eq!(page.to, Some(20));
        assert_eq!(page.data[0].get_i64("id"), Some(11));
    }
}
