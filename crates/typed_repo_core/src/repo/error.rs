//! Unified repository error taxonomy.
//!
//! # Responsibility
//! - Give callers one error vocabulary independent of the storage backend.
//! - Separate startup validation failures from per-call runtime failures.
//!
//! # Invariants
//! - Single-entity lookups report absence as `Ok(None)`, never as an error.
//! - Backend errors are translated at the executor boundary
//!   (see `executor::translate_backend_error`).

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug)]
pub enum RepoError {
    /// Entity type is not registered in the catalog.
    UnknownEntity(String),
    UnknownField {
        entity: String,
        field: String,
    },
    UnknownRelationship {
        entity: String,
        relationship: String,
    },
    /// A different descriptor was registered under an existing entity name.
    ConflictingRegistration(String),
    /// Catalog cross-references are inconsistent.
    InvalidCatalog(String),
    UnsupportedOperator {
        method: String,
        keyword: String,
    },
    ArityMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },
    UnknownQueryMethod {
        entity: String,
        method: String,
    },
    InvalidQuery(String),
    InvalidPage(String),
    NonUniqueResult {
        method: String,
        count: usize,
    },
    /// Optimistic-lock conflict: the stored version moved underneath the caller.
    StaleState {
        entity: String,
        id: i64,
    },
    NoActiveTransaction,
    NotPersisted(String),
    Timeout(String),
    Integrity(String),
    InvalidData(String),
    Db(DbError),
}

impl RepoError {
    /// Returns whether the error is raised while building repositories rather
    /// than while serving calls.
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownEntity(_)
                | Self::UnknownField { .. }
                | Self::UnknownRelationship { .. }
                | Self::ConflictingRegistration(_)
                | Self::InvalidCatalog(_)
                | Self::UnsupportedOperator { .. }
        )
    }

    /// Returns whether retrying the whole unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleState { .. } | Self::Timeout(_))
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntity(name) => write!(f, "unknown entity type `{name}`"),
            Self::UnknownField { entity, field } => {
                write!(f, "unknown field `{field}` on entity `{entity}`")
            }
            Self::UnknownRelationship {
                entity,
                relationship,
            } => write!(
                f,
                "unknown relationship `{relationship}` on entity `{entity}`"
            ),
            Self::ConflictingRegistration(name) => write!(
                f,
                "entity `{name}` is already registered with a different descriptor"
            ),
            Self::InvalidCatalog(message) => write!(f, "invalid entity catalog: {message}"),
            Self::UnsupportedOperator { method, keyword } => write!(
                f,
                "unsupported operator `{keyword}` in query method `{method}`"
            ),
            Self::ArityMismatch {
                method,
                expected,
                actual,
            } => write!(
                f,
                "query method `{method}` expects {expected} parameter(s), got {actual}"
            ),
            Self::TypeMismatch {
                field,
                expected,
                actual,
            } => write!(
                f,
                "field `{field}` expects {expected} values, got {actual}"
            ),
            Self::UnknownQueryMethod { entity, method } => {
                write!(f, "query method `{method}` is not registered for `{entity}`")
            }
            Self::InvalidQuery(message) => write!(f, "invalid query: {message}"),
            Self::InvalidPage(message) => write!(f, "invalid page request: {message}"),
            Self::NonUniqueResult { method, count } => write!(
                f,
                "query method `{method}` expected at most one result, got {count}"
            ),
            Self::StaleState { entity, id } => write!(
                f,
                "entity `{entity}` with id {id} was modified concurrently"
            ),
            Self::NoActiveTransaction => {
                write!(f, "pessimistic lock requested outside of a unit of work")
            }
            Self::NotPersisted(entity) => {
                write!(f, "entity `{entity}` has no identity; save it first")
            }
            Self::Timeout(message) => write!(f, "operation timed out: {message}"),
            Self::Integrity(message) => write!(f, "integrity constraint violated: {message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Sqlite(err) => crate::executor::translate_backend_error(err),
            other => Self::Db(other),
        }
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        crate::executor::translate_backend_error(value)
    }
}
