//! # Relations
//!
//! Declared associations between model schemas.
//!
//! A relation is a [`QueryBuilder`] on the related table scoped by one key
//! pair. The three kinds differ only in which side holds the key:
//!
//! | kind        | parent key column | related key column |
//! |-------------|-------------------|--------------------|
//! | `HasOne`    | `local_key`       | `foreign_key`      |
//! | `HasMany`   | `local_key`       | `foreign_key`      |
//! | `BelongsTo` | `foreign_key`     | `local_key` (owner)|
//!
//! Lazy loading ([`Relation::get_results`]) issues one query per parent.
//! Eager loading ([`eager_load`]) issues one `WHERE key IN (...)` query for a
//! batch of parents and distributes the results with [`match_models`].

use crate::database::{DatabasePool, DbValue};
use crate::error::Result;
use crate::model::{Model, Schema};
use crate::query::QueryBuilder;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Cardinality and direction of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Parent owns at most one related row
    HasOne,
    /// Parent owns any number of related rows
    HasMany,
    /// Parent holds the key of its owner
    BelongsTo,
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HasOne => write!(f, "has_one"),
            Self::HasMany => write!(f, "has_many"),
            Self::BelongsTo => write!(f, "belongs_to"),
        }
    }
}

/// Relation declared on a [`Schema`]
#[derive(Debug, Clone)]
pub struct RelationSpec {
    /// Name used by `load`, `with` and `related`
    pub name: String,
    /// Relation kind
    pub kind: RelationKind,
    /// Schema of the related model
    pub related: fn() -> &'static Schema,
    /// Key column holding the reference
    pub foreign_key: String,
    /// Referenced key column
    pub local_key: String,
}

impl RelationSpec {
    /// Column read from the parent model
    #[must_use]
    pub fn parent_key(&self) -> &str {
        match self.kind {
            RelationKind::HasOne | RelationKind::HasMany => &self.local_key,
            RelationKind::BelongsTo => &self.foreign_key,
        }
    }

    /// Column constrained on the related table
    #[must_use]
    pub fn related_key(&self) -> &str {
        match self.kind {
            RelationKind::HasOne | RelationKind::HasMany => &self.foreign_key,
            RelationKind::BelongsTo => &self.local_key,
        }
    }

    /// Schema of the related model
    #[must_use]
    pub fn related_schema(&self) -> &'static Schema {
        (self.related)()
    }

    const fn is_many(&self) -> bool {
        matches!(self.kind, RelationKind::HasMany)
    }
}

/// Resolved relation value cached on a model
#[derive(Debug, Clone)]
pub enum Loaded {
    /// `HasOne` / `BelongsTo` result
    One(Option<Box<Model>>),
    /// `HasMany` result
    Many(Vec<Model>),
}

impl Loaded {
    fn empty(spec: &RelationSpec) -> Self {
        if spec.is_many() {
            Self::Many(Vec::new())
        } else {
            Self::One(None)
        }
    }

    /// Single related model, if any
    #[must_use]
    pub fn one(&self) -> Option<&Model> {
        match self {
            Self::One(model) => model.as_deref(),
            Self::Many(_) => None,
        }
    }

    /// Related models (empty for a missing single relation)
    #[must_use]
    pub fn many(&self) -> &[Model] {
        match self {
            Self::One(Some(model)) => std::slice::from_ref(&**model),
            Self::One(None) => &[],
            Self::Many(models) => models,
        }
    }

    /// JSON form: object, `null` or array
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::One(Some(model)) => model.to_json(),
            Self::One(None) => serde_json::Value::Null,
            Self::Many(models) => models.iter().map(Model::to_json).collect(),
        }
    }
}

/// Relation bound to one parent model
#[derive(Debug, Clone)]
pub struct Relation<'a> {
    spec: &'a RelationSpec,
    parent_key: DbValue,
    query: QueryBuilder,
}

impl<'a> Relation<'a> {
    /// Scope a query on the related table to `parent`
    ///
    /// The key constraint is only added when the parent key is present.
    #[must_use]
    pub fn new(spec: &'a RelationSpec, parent: &Model) -> Self {
        let parent_key = parent
            .get(spec.parent_key())
            .cloned()
            .unwrap_or(DbValue::Null);
        let mut query = QueryBuilder::new(spec.related_schema().table());
        if !parent_key.is_empty_key() {
            query = query.where_eq(spec.related_key(), parent_key.clone());
        }
        Self {
            spec,
            parent_key,
            query,
        }
    }

    /// Declaration this relation was built from
    #[must_use]
    pub const fn spec(&self) -> &RelationSpec {
        self.spec
    }

    /// The scoped query
    #[must_use]
    pub const fn query(&self) -> &QueryBuilder {
        &self.query
    }

    /// Add further constraints to the scoped query
    #[must_use]
    pub fn scope<F>(mut self, f: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        self.query = f(self.query);
        self
    }

    /// Resolve the relation for its parent
    ///
    /// Returns an empty result without querying when the parent key is empty.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` or a cast error from the related schema.
    pub async fn get_results(&self, pool: &DatabasePool) -> Result<Loaded> {
        if self.parent_key.is_empty_key() {
            debug!(relation = %self.spec.name, "Parent key empty, skipping relation query");
            return Ok(Loaded::empty(self.spec));
        }
        let schema = self.spec.related_schema();
        if self.spec.is_many() {
            let rows = self.query.get(pool).await?;
            let models = rows
                .into_iter()
                .map(|row| Model::from_row(schema, row))
                .collect::<Result<Vec<_>>>()?;
            Ok(Loaded::Many(models))
        } else {
            let row = self.query.first(pool).await?;
            let model = row.map(|row| Model::from_row(schema, row)).transpose()?;
            Ok(Loaded::One(model.map(Box::new)))
        }
    }
}

/// Distinct, non-empty parent key values in first-seen order
fn parent_keys(spec: &RelationSpec, parents: &[Model]) -> Vec<DbValue> {
    let mut seen = HashSet::new();
    parents
        .iter()
        .filter_map(|p| p.get(spec.parent_key()))
        .filter(|v| !v.is_empty_key())
        .filter(|v| v.key_string().is_some_and(|k| seen.insert(k)))
        .cloned()
        .collect()
}

/// Query for the related rows of a batch of parents, `None` when no parent has a key
#[must_use]
pub fn eager_query(spec: &RelationSpec, parents: &[Model]) -> Option<QueryBuilder> {
    let keys = parent_keys(spec, parents);
    if keys.is_empty() {
        return None;
    }
    Some(QueryBuilder::new(spec.related_schema().table()).where_in(spec.related_key(), keys))
}

/// Distribute `results` over `parents` by key
///
/// `HasOne` and `BelongsTo` keep the last result seen for a key; `HasMany`
/// keeps every result in result order. Parents without a match get an empty
/// value, so every parent ends up with the relation loaded.
pub fn match_models(spec: &RelationSpec, parents: &mut [Model], results: Vec<Model>) {
    let related_key = spec.related_key();

    if spec.is_many() {
        let mut dictionary: HashMap<String, Vec<Model>> = HashMap::new();
        for model in results {
            if let Some(key) = model.get(related_key).and_then(DbValue::key_string) {
                dictionary.entry(key).or_default().push(model);
            }
        }
        for parent in parents.iter_mut() {
            let matched = parent
                .get(spec.parent_key())
                .and_then(DbValue::key_string)
                .and_then(|k| dictionary.get(&k).cloned())
                .unwrap_or_default();
            parent.set_relation(&spec.name, Loaded::Many(matched));
        }
    } else {
        let mut dictionary: HashMap<String, Model> = HashMap::new();
        for model in results {
            if let Some(key) = model.get(related_key).and_then(DbValue::key_string) {
                dictionary.insert(key, model);
            }
        }
        for parent in parents.iter_mut() {
            let matched = parent
                .get(spec.parent_key())
                .and_then(DbValue::key_string)
                .and_then(|k| dictionary.get(&k).cloned());
            parent.set_relation(&spec.name, Loaded::One(matched.map(Box::new)));
        }
    }
}

/// Load `spec` for every parent with a single query
///
/// # Errors
///
/// Returns `Error::Database` or a cast error from the related schema.
pub async fn eager_load(spec: &RelationSpec, parents: &mut [Model], pool: &DatabasePool) -> Result<()> {
    let Some(query) = eager_query(spec, parents) else {
        for parent in parents.iter_mut() {
            parent.set_relation(&spec.name, Loaded::empty(spec));
        }
        return Ok(());
    };
    let schema = spec.related_schema();
    let results = query
        .get(pool)
        .await?
        .into_iter()
        .map(|row| Model::from_row(schema, row))
        .collect::<Result<Vec<_>>>()?;
    debug!(relation = %spec.name, parents = parents.len(), results = results.len(), "Eager loaded relation");
    match_models(spec, parents, results);
    Ok(())
}
