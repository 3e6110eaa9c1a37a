//! Repository facade over the query engine.
//!
//! # Responsibility
//! - Register and validate query methods per entity (`definition`).
//! - Expose typed CRUD, finders and bulk operations bound to a session (`facade`).
//!
//! # Invariants
//! - Query methods are derived and validated when the definition is built.
//! - Every operation reports failures through `RepoError`.

pub mod definition;
pub mod error;
pub mod facade;

pub use definition::{QueryMethod, RepositoryDefinition, RepositoryDefinitionBuilder};
pub use error::{RepoError, RepoResult};
pub use facade::{DerivedOutput, EntityStream, Repository};
