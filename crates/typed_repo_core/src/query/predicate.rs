//! Predicate trees.
//!
//! # Responsibility
//! - Represent filters as comparison leaves combined by AND/OR.
//! - Type-check comparisons against the catalog and bind positional parameters.
//!
//! # Invariants
//! - A checked predicate only compares a field with values of its declared type.
//! - `In` operands are always `Value::List`.
//! - Comparing with `Null` through `Equals`/`NotEquals` means `IS [NOT] NULL`.

use crate::catalog::{EntityCatalog, FieldDescriptor};
use crate::repo::error::{RepoError, RepoResult};
use crate::value::{FieldType, Value};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
    In,
    IsNull,
    IsNotNull,
    /// Substring match on text fields.
    Containing,
    /// Raw `LIKE` pattern on text fields.
    Like,
}

impl CompareOp {
    /// Number of bound values the operator consumes.
    pub fn arity(self) -> usize {
        match self {
            Self::IsNull | Self::IsNotNull => 0,
            _ => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::GreaterThan => "greater_than",
            Self::GreaterThanEqual => "greater_than_equal",
            Self::LessThan => "less_than",
            Self::LessThanEqual => "less_than_equal",
            Self::In => "in",
            Self::IsNull => "is_null",
            Self::IsNotNull => "is_not_null",
            Self::Containing => "containing",
            Self::Like => "like",
        }
    }

    fn requires_text(self) -> bool {
        matches!(self, Self::Containing | Self::Like)
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    None,
    Value(Value),
    /// Positional parameter, replaced by [`Predicate::bind`].
    Param(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub path: String,
    pub op: CompareOp,
    pub operand: Operand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Compare(Comparison),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn compare(path: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        let operand = if op.arity() == 0 {
            Operand::None
        } else {
            Operand::Value(value.into())
        };
        Self::Compare(Comparison {
            path: path.to_string(),
            op,
            operand,
        })
    }

    pub(crate) fn param(path: &str, op: CompareOp, index: usize) -> Self {
        let operand = if op.arity() == 0 {
            Operand::None
        } else {
            Operand::Param(index)
        };
        Self::Compare(Comparison {
            path: path.to_string(),
            op,
            operand,
        })
    }

    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Equals, value)
    }

    pub fn gt(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::GreaterThan, value)
    }

    pub fn lt(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::LessThan, value)
    }

    pub fn in_list<V: Into<Value>>(path: &str, values: Vec<V>) -> Self {
        Self::compare(path, CompareOp::In, Value::from(values))
    }

    pub fn is_null(path: &str) -> Self {
        Self::compare(path, CompareOp::IsNull, Value::Null)
    }

    pub fn containing(path: &str, text: &str) -> Self {
        Self::compare(path, CompareOp::Containing, text)
    }

    pub fn and(self, other: Predicate) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Folds predicates with AND; `None` for an empty input.
    pub fn all(predicates: impl IntoIterator<Item = Predicate>) -> Option<Self> {
        predicates.into_iter().reduce(Self::and)
    }

    /// Comparison leaves in left-to-right order.
    pub fn comparisons(&self) -> Vec<&Comparison> {
        let mut leaves = Vec::new();
        self.collect_comparisons(&mut leaves);
        leaves
    }

    fn collect_comparisons<'a>(&'a self, leaves: &mut Vec<&'a Comparison>) {
        match self {
            Self::Compare(comparison) => leaves.push(comparison),
            Self::And(left, right) | Self::Or(left, right) => {
                left.collect_comparisons(leaves);
                right.collect_comparisons(leaves);
            }
        }
    }

    /// Verifies every path resolves and every literal matches its field type.
    ///
    /// Unbound parameters are skipped; they are checked when bound.
    pub fn check(&self, catalog: &EntityCatalog, entity: &str) -> RepoResult<()> {
        for comparison in self.comparisons() {
            let resolved = catalog.resolve_path(entity, comparison.path.as_str())?;
            match &comparison.operand {
                Operand::Value(value) => {
                    check_operand(&comparison.path, &resolved.field, comparison.op, value)?
                }
                Operand::None | Operand::Param(_) => {}
            }
        }
        Ok(())
    }

    /// Replaces positional parameters with `args`.
    pub(crate) fn bind(&self, args: &[Value]) -> RepoResult<Predicate> {
        match self {
            Self::Compare(comparison) => {
                let operand = match &comparison.operand {
                    Operand::Param(index) => {
                        let value = args.get(*index).ok_or_else(|| {
                            RepoError::InvalidQuery(format!(
                                "missing argument {index} for `{}`",
                                comparison.path
                            ))
                        })?;
                        Operand::Value(value.clone())
                    }
                    other => other.clone(),
                };
                Ok(Self::Compare(Comparison {
                    path: comparison.path.clone(),
                    op: comparison.op,
                    operand,
                }))
            }
            Self::And(left, right) => Ok(Self::And(
                Box::new(left.bind(args)?),
                Box::new(right.bind(args)?),
            )),
            Self::Or(left, right) => Ok(Self::Or(
                Box::new(left.bind(args)?),
                Box::new(right.bind(args)?),
            )),
        }
    }
}

/// Checks one literal against the target field.
pub(crate) fn check_operand(
    path: &str,
    field: &FieldDescriptor,
    op: CompareOp,
    value: &Value,
) -> RepoResult<()> {
    let mismatch = |expected: String| RepoError::TypeMismatch {
        field: path.to_string(),
        expected,
        actual: value.kind().to_string(),
    };

    if op == CompareOp::In {
        let Value::List(values) = value else {
            return Err(mismatch(format!("list of {}", field.field_type)));
        };
        if let Some(bad) = values.iter().find(|item| {
            matches!(item, Value::List(_)) || !field.field_type.accepts(item)
        }) {
            return Err(RepoError::TypeMismatch {
                field: path.to_string(),
                expected: format!("list of {}", field.field_type),
                actual: format!("list containing {}", bad.kind()),
            });
        }
        return Ok(());
    }

    if op.requires_text() {
        if field.field_type != FieldType::Text || !matches!(value, Value::Text(_)) {
            return Err(mismatch(FieldType::Text.to_string()));
        }
        return Ok(());
    }

    if matches!(value, Value::List(_)) || !field.field_type.accepts(value) {
        return Err(mismatch(field.field_type.to_string()));
    }
    Ok(())
}

impl Display for Predicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compare(comparison) => match &comparison.operand {
                Operand::None => write!(f, "{} {}", comparison.path, comparison.op.as_str()),
                Operand::Value(value) => write!(
                    f,
                    "{} {} {value}",
                    comparison.path,
                    comparison.op.as_str()
                ),
                Operand::Param(index) => write!(
                    f,
                    "{} {} ?{index}",
                    comparison.path,
                    comparison.op.as_str()
                ),
            },
            Self::And(left, right) => write!(f, "({left} AND {right})"),
            Self::Or(left, right) => write!(f, "({left} OR {right})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CompareOp, Predicate};
    use crate::catalog::{EntityCatalog, EntityDescriptor};
    use crate::repo::error::RepoError;
    use crate::value::{FieldType, Value};

    fn catalog() -> EntityCatalog {
        let mut catalog = EntityCatalog::new();
        catalog
            .register(
                EntityDescriptor::builder("Team", "teams")
                    .field("name", FieldType::Text)
                    .build(),
            )
            .unwrap();
        catalog
            .register(
                EntityDescriptor::builder("Member", "members")
                    .field("username", FieldType::Text)
                    .field("age", FieldType::Integer)
                    .many_to_one("team", "Team", "team_id")
                    .build(),
            )
            .unwrap();
        catalog
    }

    #[test]
    fn well_typed_predicates_pass_check() {
        let predicate = Predicate::eq("username", "AAA")
            .and(Predicate::gt("age", 15))
            .or(Predicate::in_list("team.name", vec!["teamA", "teamB"]));
        predicate.check(&catalog(), "Member").unwrap();
        assert_eq!(predicate.comparisons().len(), 3);
    }

    #[test]
    fn mismatched_literals_are_rejected() {
        let err = Predicate::gt("age", "old")
            .check(&catalog(), "Member")
            .unwrap_err();
        assert!(matches!(err, RepoError::TypeMismatch { field, .. } if field == "age"));

        let err = Predicate::compare("age", CompareOp::Containing, 1)
            .check(&catalog(), "Member")
            .unwrap_err();
        assert!(matches!(err, RepoError::TypeMismatch { .. }));

        let err = Predicate::compare("username", CompareOp::In, "AAA")
            .check(&catalog(), "Member")
            .unwrap_err();
        assert!(matches!(err, RepoError::TypeMismatch { expected, .. } if expected == "list of text"));
    }

    #[test]
    fn bind_replaces_parameters_in_order() {
        let template = Predicate::param("username", CompareOp::Equals, 0)
            .and(Predicate::param("age", CompareOp::GreaterThan, 1));
        let bound = template
            .bind(&[Value::from("AAA"), Value::from(15)])
            .unwrap();
        assert_eq!(bound, Predicate::eq("username", "AAA").and(Predicate::gt("age", 15)));
        assert_eq!(bound.to_string(), "(username equals 'AAA' AND age greater_than 15)");
    }

    #[test]
    fn null_operators_take_no_operand() {
        let predicate = Predicate::is_null("team");
        predicate.check(&catalog(), "Member").unwrap();
        assert_eq!(predicate.to_string(), "team is_null");
    }
}
