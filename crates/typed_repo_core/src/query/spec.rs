//! Composable specifications, query-by-example and the criteria union.
//!
//! # Responsibility
//! - Build predicates from reusable closures (`Specification`).
//! - Build AND-of-equals predicates from partially populated probes (`Example`).
//!
//! # Invariants
//! - Nothing here touches storage; predicates are produced only when a finder
//!   asks for them.
//! - An absent specification (`None` predicate) is neutral under `and`/`or`.

use crate::catalog::{EntityCatalog, FieldDescriptor};
use crate::entity::{Entity, Record};
use crate::query::predicate::{check_operand, CompareOp, Predicate};
use crate::repo::error::RepoResult;
use crate::value::Value;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;

/// Entry point handed to specification closures.
pub struct Root<'a> {
    catalog: &'a EntityCatalog,
    entity: &'a str,
}

impl<'a> Root<'a> {
    pub(crate) fn new(catalog: &'a EntityCatalog, entity: &'a str) -> Self {
        Self { catalog, entity }
    }

    /// Resolves `field` or `relationship.field`.
    pub fn get(&self, path: &str) -> RepoResult<PathExpr> {
        let resolved = self.catalog.resolve_path(self.entity, path)?;
        Ok(PathExpr {
            path: path.to_string(),
            field: resolved.field,
        })
    }
}

/// Resolved attribute path; comparisons are type-checked on construction.
#[derive(Debug, Clone)]
pub struct PathExpr {
    path: String,
    field: FieldDescriptor,
}

impl PathExpr {
    fn compare(&self, op: CompareOp, value: Value) -> RepoResult<Predicate> {
        if op.arity() > 0 {
            check_operand(self.path.as_str(), &self.field, op, &value)?;
        }
        Ok(Predicate::compare(self.path.as_str(), op, value))
    }

    pub fn eq(&self, value: impl Into<Value>) -> RepoResult<Predicate> {
        self.compare(CompareOp::Equals, value.into())
    }

    pub fn ne(&self, value: impl Into<Value>) -> RepoResult<Predicate> {
        self.compare(CompareOp::NotEquals, value.into())
    }

    pub fn gt(&self, value: impl Into<Value>) -> RepoResult<Predicate> {
        self.compare(CompareOp::GreaterThan, value.into())
    }

    pub fn ge(&self, value: impl Into<Value>) -> RepoResult<Predicate> {
        self.compare(CompareOp::GreaterThanEqual, value.into())
    }

    pub fn lt(&self, value: impl Into<Value>) -> RepoResult<Predicate> {
        self.compare(CompareOp::LessThan, value.into())
    }

    pub fn le(&self, value: impl Into<Value>) -> RepoResult<Predicate> {
        self.compare(CompareOp::LessThanEqual, value.into())
    }

    pub fn in_list<V: Into<Value>>(&self, values: Vec<V>) -> RepoResult<Predicate> {
        self.compare(CompareOp::In, Value::from(values))
    }

    pub fn is_null(&self) -> RepoResult<Predicate> {
        self.compare(CompareOp::IsNull, Value::Null)
    }

    pub fn is_not_null(&self) -> RepoResult<Predicate> {
        self.compare(CompareOp::IsNotNull, Value::Null)
    }

    pub fn containing(&self, text: &str) -> RepoResult<Predicate> {
        self.compare(CompareOp::Containing, Value::from(text))
    }

    pub fn like(&self, pattern: &str) -> RepoResult<Predicate> {
        self.compare(CompareOp::Like, Value::from(pattern))
    }
}

type SpecFn = dyn Fn(&Root<'_>) -> RepoResult<Option<Predicate>> + Send + Sync;

/// Reusable predicate builder for entity `E`.
///
/// ```ignore
/// let spec = member_spec::team_name("teamA").and(member_spec::username("m1"));
/// let members = repository.find_all_by(spec.into(), Sort::unsorted())?;
/// ```
pub struct Specification<E> {
    build: Arc<SpecFn>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Specification<E> {
    fn clone(&self) -> Self {
        Self {
            build: Arc::clone(&self.build),
            _entity: PhantomData,
        }
    }
}

impl<E> Debug for Specification<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Specification")
    }
}

impl<E: Entity> Specification<E> {
    /// Wraps a closure; returning `Ok(None)` means "no restriction".
    pub fn new(
        build: impl Fn(&Root<'_>) -> RepoResult<Option<Predicate>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            build: Arc::new(build),
            _entity: PhantomData,
        }
    }

    /// Specification that matches every row.
    pub fn unrestricted() -> Self {
        Self::new(|_| Ok(None))
    }

    pub fn and(self, other: Specification<E>) -> Self {
        Self::new(move |root| {
            let left = (self.build)(root)?;
            let right = (other.build)(root)?;
            Ok(match (left, right) {
                (Some(left), Some(right)) => Some(left.and(right)),
                (left, right) => left.or(right),
            })
        })
    }

    pub fn or(self, other: Specification<E>) -> Self {
        Self::new(move |root| {
            let left = (self.build)(root)?;
            let right = (other.build)(root)?;
            Ok(match (left, right) {
                (Some(left), Some(right)) => Some(left.or(right)),
                (left, right) => left.or(right),
            })
        })
    }

    pub fn to_predicate(&self, catalog: &EntityCatalog) -> RepoResult<Option<Predicate>> {
        let root = Root::new(catalog, E::NAME);
        (self.build)(&root)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullHandling {
    /// Null and default-valued probe fields are left out of the predicate.
    #[default]
    Ignore,
    /// Null fields become `IS NULL`; default values are matched as-is.
    Include,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExampleMatcher {
    ignored_paths: Vec<String>,
    null_handling: NullHandling,
}

impl ExampleMatcher {
    pub fn matching() -> Self {
        Self::default()
    }

    /// Ignores `age`, `team.name`, or a whole relationship (`team`).
    pub fn with_ignore_paths(mut self, paths: &[&str]) -> Self {
        self.ignored_paths
            .extend(paths.iter().map(|path| (*path).to_string()));
        self
    }

    pub fn with_null_handling(mut self, null_handling: NullHandling) -> Self {
        self.null_handling = null_handling;
        self
    }

    fn is_ignored(&self, path: &str) -> bool {
        self.ignored_paths.iter().any(|ignored| {
            ignored == path
                || path
                    .strip_prefix(ignored.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    fn keeps(&self, field: &FieldDescriptor, value: &Value) -> bool {
        match self.null_handling {
            NullHandling::Ignore => !value.is_null() && *value != field.field_type.default_value(),
            NullHandling::Include => true,
        }
    }
}

/// Probe entity plus matcher.
#[derive(Debug, Clone)]
pub struct Example<E> {
    probe: E,
    matcher: ExampleMatcher,
}

impl<E: Entity> Example<E> {
    pub fn of(probe: E) -> Self {
        Self::with_matcher(probe, ExampleMatcher::matching())
    }

    pub fn with_matcher(probe: E, matcher: ExampleMatcher) -> Self {
        Self { probe, matcher }
    }

    pub fn probe(&self) -> &E {
        &self.probe
    }

    /// AND of equality comparisons over the probe's populated fields.
    ///
    /// Loaded references contribute their own populated fields one hop deep
    /// (`team.name`); unloaded references match on the join column.
    pub fn to_predicate(&self, catalog: &EntityCatalog) -> RepoResult<Option<Predicate>> {
        let descriptor = catalog.resolve_entity(E::NAME)?;
        let record = self.probe.to_record();
        let mut comparisons = Vec::new();

        let mut scalars = vec![descriptor.id.clone()];
        scalars.extend(descriptor.fields.iter().cloned());
        for field in &scalars {
            self.push_comparison(&mut comparisons, field.name.as_str(), field, &record);
        }

        for relationship in descriptor.relationships.iter().filter(|r| r.is_owning()) {
            if self.matcher.is_ignored(relationship.name.as_str()) {
                continue;
            }
            match record.nested(relationship.name.as_str()) {
                Some(nested) => {
                    let target = catalog.resolve_entity(relationship.target.as_str())?;
                    let mut target_fields = vec![target.id.clone()];
                    target_fields.extend(target.fields.iter().cloned());
                    for field in &target_fields {
                        let path = format!("{}.{}", relationship.name, field.name);
                        self.push_comparison(&mut comparisons, path.as_str(), field, nested);
                    }
                }
                None => {
                    if let Some(join_field) = relationship.join_field() {
                        self.push_comparison(
                            &mut comparisons,
                            relationship.name.as_str(),
                            &join_field,
                            &record,
                        );
                    }
                }
            }
        }

        Ok(Predicate::all(comparisons))
    }

    fn push_comparison(
        &self,
        comparisons: &mut Vec<Predicate>,
        path: &str,
        field: &FieldDescriptor,
        record: &Record,
    ) {
        if self.matcher.is_ignored(path) {
            return;
        }
        let value = record.get(field.name.as_str()).cloned().unwrap_or(Value::Null);
        if !self.matcher.keeps(field, &value) {
            return;
        }
        if value.is_null() {
            // A null in a non-nullable column only means the probe left it unset.
            if !field.nullable {
                return;
            }
            comparisons.push(Predicate::is_null(path));
        } else {
            comparisons.push(Predicate::eq(path, value));
        }
    }
}

/// Filter source accepted by the `find_*_by` family.
#[derive(Debug, Clone)]
pub enum Criteria<E> {
    All,
    Predicate(Predicate),
    Specification(Specification<E>),
    Example(Example<E>),
}

impl<E: Entity> Criteria<E> {
    /// Resolves to a checked predicate (`None` means every row).
    pub fn to_predicate(&self, catalog: &EntityCatalog) -> RepoResult<Option<Predicate>> {
        let predicate = match self {
            Self::All => None,
            Self::Predicate(predicate) => Some(predicate.clone()),
            Self::Specification(specification) => specification.to_predicate(catalog)?,
            Self::Example(example) => example.to_predicate(catalog)?,
        };
        if let Some(predicate) = &predicate {
            predicate.check(catalog, E::NAME)?;
        }
        Ok(predicate)
    }
}

impl<E> From<Predicate> for Criteria<E> {
    fn from(value: Predicate) -> Self {
        Self::Predicate(value)
    }
}

impl<E> From<Specification<E>> for Criteria<E> {
    fn from(value: Specification<E>) -> Self {
        Self::Specification(value)
    }
}

impl<E> From<Example<E>> for Criteria<E> {
    fn from(value: Example<E>) -> Self {
        Self::Example(value)
    }
}
