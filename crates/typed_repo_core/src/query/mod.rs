//! Query model: predicates, plans, derivation, specifications and SQL rendering.
//!
//! # Responsibility
//! - Describe reads and bulk writes independently of how they are executed.
//! - Validate every query shape against the catalog before it runs.
//!
//! # See also
//! - `executor` for statement execution and row mapping.

pub mod derive;
pub mod plan;
pub mod predicate;
pub mod spec;
pub(crate) mod sql;

pub use derive::{Clause, Combinator, CompiledQuery, DerivedQuery, ParamSlot, Subject};
pub use plan::{
    AssignOp, Assignment, BulkOptions, Direction, LockMode, Mutation, Order, Page, PageRequest,
    ProjectionShape, QueryPlan, Sort,
};
pub use predicate::{CompareOp, Comparison, Operand, Predicate};
pub use spec::{Criteria, Example, ExampleMatcher, NullHandling, PathExpr, Root, Specification};
