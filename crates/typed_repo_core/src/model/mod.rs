//! Sample member/team domain served by the engine.
//!
//! # Responsibility
//! - Provide concrete entities, projections and repository definitions that
//!   exercise every engine feature.
//!
//! # Invariants
//! - Descriptors match the tables created by `db::migrations`.

pub mod member;
pub mod projections;
pub mod team;

use crate::catalog::EntityCatalog;
use crate::entity::Entity;
use crate::repo::error::RepoResult;
use member::Member;
use team::Team;

/// Registers and validates the sample entities.
pub fn build_catalog() -> RepoResult<EntityCatalog> {
    let mut catalog = EntityCatalog::new();
    catalog.register(Team::descriptor())?;
    catalog.register(Member::descriptor())?;
    catalog.validate()?;
    Ok(catalog)
}
