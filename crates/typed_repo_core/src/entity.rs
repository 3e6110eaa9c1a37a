//! Entity contract, row records and explicit two-state references.
//!
//! # Responsibility
//! - Define what a persistable entity exposes to the engine.
//! - Carry row data between the executor and typed entities/projections.
//!
//! # Invariants
//! - A `Reference` never performs I/O on its own; `resolve()` is the only
//!   loading entry point.
//! - Reference equality compares identities, not loaded state.

use crate::catalog::EntityDescriptor;
use crate::executor::QueryExecutor;
use crate::repo::error::{RepoError, RepoResult};
use crate::session::Session;
use crate::value::{FromValue, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Field-name keyed row, plus nested rows for fetched relationships.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    values: BTreeMap<String, Value>,
    nested: BTreeMap<String, Record>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.values.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Typed read of a required field.
    ///
    /// # Errors
    /// - `InvalidData` when the field is missing or has another type.
    pub fn require<T: FromValue>(&self, field: &str) -> RepoResult<T> {
        let value = self
            .values
            .get(field)
            .ok_or_else(|| RepoError::InvalidData(format!("missing field `{field}` in row")))?;
        T::from_value(value).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "field `{field}` holds unexpected {} value",
                value.kind()
            ))
        })
    }

    pub fn nested(&self, relationship: &str) -> Option<&Record> {
        self.nested.get(relationship)
    }

    pub fn set_nested(&mut self, relationship: &str, record: Record) {
        self.nested.insert(relationship.to_string(), record);
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn nested_records(&self) -> impl Iterator<Item = (&str, &Record)> {
        self.nested.iter().map(|(name, record)| (name.as_str(), record))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.nested.is_empty()
    }

    /// Compares stored values only, ignoring nested fetched rows.
    pub(crate) fn same_values(&self, other: &Record) -> bool {
        self.values == other.values
    }

    /// Identity value of an entity row, if present and assigned.
    pub(crate) fn id(&self, descriptor: &EntityDescriptor) -> Option<i64> {
        self.values
            .get(descriptor.id.name.as_str())
            .and_then(Value::as_i64)
    }
}

/// Construction from a mapped row.
pub trait FromRecord: Sized {
    fn from_record(record: &Record) -> RepoResult<Self>;
}

/// Persistable entity type.
pub trait Entity: FromRecord + Clone + Debug {
    /// Catalog name of the entity type.
    const NAME: &'static str;

    fn descriptor() -> EntityDescriptor;

    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);

    /// Current optimistic-lock version, for versioned entities.
    fn version(&self) -> Option<i64> {
        None
    }

    fn set_version(&mut self, _version: i64) {}

    /// Full row image including identity (`Null` while transient).
    fn to_record(&self) -> Record;

    fn is_transient(&self) -> bool {
        self.id().is_none()
    }
}

/// Reference to a related entity: either just its identity or the loaded value.
#[derive(Debug, Clone)]
pub enum Reference<T> {
    Unloaded(i64),
    Loaded(Box<T>),
}

impl<T: Entity> Reference<T> {
    /// Wraps an in-memory entity, loaded.
    pub fn loaded(entity: T) -> Self {
        Self::Loaded(Box::new(entity))
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            Self::Unloaded(id) => Some(*id),
            Self::Loaded(entity) => entity.id(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    /// Returns the entity only if it is already loaded.
    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Unloaded(_) => None,
            Self::Loaded(entity) => Some(entity),
        }
    }

    /// Loads the referenced entity if needed and returns it.
    ///
    /// # Errors
    /// - `InvalidData` when the stored identity no longer exists.
    pub fn resolve(&mut self, session: &Session<'_>) -> RepoResult<&T> {
        if let Self::Unloaded(id) = *self {
            let record = QueryExecutor::new(session)
                .find_record_by_id(T::NAME, id, false)?
                .ok_or_else(|| {
                    RepoError::InvalidData(format!("{} with id {id} does not exist", T::NAME))
                })?;
            *self = Self::Loaded(Box::new(T::from_record(&record)?));
        }

        match self {
            Self::Loaded(entity) => Ok(entity),
            Self::Unloaded(id) => Err(RepoError::InvalidData(format!(
                "{} with id {id} could not be loaded",
                T::NAME
            ))),
        }
    }

    /// Reads an owning reference from a row: nested record wins over the bare id.
    pub fn from_record(record: &Record, relationship: &str) -> RepoResult<Option<Self>> {
        if let Some(nested) = record.nested(relationship) {
            return Ok(Some(Self::loaded(T::from_record(nested)?)));
        }
        match record.get(relationship) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Integer(id)) => Ok(Some(Self::Unloaded(*id))),
            Some(other) => Err(RepoError::InvalidData(format!(
                "reference `{relationship}` holds unexpected {} value",
                other.kind()
            ))),
        }
    }

    /// Writes an owning reference into a row image.
    pub fn write_into(reference: Option<&Self>, record: &mut Record, relationship: &str) {
        record.set(relationship, reference.and_then(Self::id));
        if let Some(Self::Loaded(entity)) = reference {
            record.set_nested(relationship, entity.to_record());
        }
    }
}

impl<T: Entity> PartialEq for Reference<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}
