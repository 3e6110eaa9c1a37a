//! Typed repository engine over SQLite.
//! Entities are described in a catalog; repositories derive, validate and
//! run their queries against a session-bound connection.

pub mod catalog;
pub mod config;
pub mod db;
pub mod entity;
pub mod executor;
pub mod logging;
pub mod model;
pub mod query;
pub mod repo;
pub mod session;
pub mod value;

pub use catalog::{EntityCatalog, EntityDescriptor, FieldDescriptor, RelationshipDescriptor};
pub use config::{ConfigError, EngineConfig};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use entity::{Entity, FromRecord, Record, Reference};
pub use executor::{ExplicitOutput, QueryExecutor, QueryOutput, RecordStream};
pub use logging::{default_log_level, init_logging, init_logging_from_config, logging_status};
pub use query::{
    BulkOptions, CompareOp, Criteria, DerivedQuery, Direction, Example, ExampleMatcher, LockMode,
    Mutation, NullHandling, Order, Page, PageRequest, Predicate, ProjectionShape, QueryPlan, Sort,
    Specification,
};
pub use repo::{QueryMethod, RepoError, RepoResult, Repository, RepositoryDefinition};
pub use session::{Session, StatementKind, StatementTrace, UnitOfWork};
pub use value::{FieldType, FromValue, Value};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
