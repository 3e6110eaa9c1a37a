//! Query derivation: clause lists from method names or builders.
//!
//! # Responsibility
//! - Turn `findByUsernameAndAgeGreaterThan`-shaped names into a tagged clause list.
//! - Compile clause lists into parameterized predicate templates validated
//!   against the catalog.
//!
//! # Invariants
//! - Operator keywords are matched by longest suffix of each clause.
//! - And/Or fold strictly left to right; there is no precedence.
//! - Every failure surfaces from `parse`/`compile`, never from `bind`, except
//!   argument count and argument type checks.

use crate::catalog::{EntityCatalog, FieldDescriptor};
use crate::query::plan::{Direction, Order, Sort};
use crate::query::predicate::{check_operand, CompareOp, Predicate};
use crate::repo::error::{RepoError, RepoResult};
use crate::value::{FieldType, Value};
use once_cell::sync::Lazy;
use regex::Regex;

/// Operator keyword sequences, longest first within each family.
const OPERATOR_KEYWORDS: &[(&[&str], CompareOp)] = &[
    (&["Is", "Greater", "Than", "Equal"], CompareOp::GreaterThanEqual),
    (&["Greater", "Than", "Equal"], CompareOp::GreaterThanEqual),
    (&["Is", "Greater", "Than"], CompareOp::GreaterThan),
    (&["Greater", "Than"], CompareOp::GreaterThan),
    (&["Is", "Less", "Than", "Equal"], CompareOp::LessThanEqual),
    (&["Less", "Than", "Equal"], CompareOp::LessThanEqual),
    (&["Is", "Less", "Than"], CompareOp::LessThan),
    (&["Less", "Than"], CompareOp::LessThan),
    (&["Is", "Not", "Null"], CompareOp::IsNotNull),
    (&["Not", "Null"], CompareOp::IsNotNull),
    (&["Is", "Null"], CompareOp::IsNull),
    (&["Null"], CompareOp::IsNull),
    (&["Is", "In"], CompareOp::In),
    (&["In"], CompareOp::In),
    (&["Is", "Containing"], CompareOp::Containing),
    (&["Containing"], CompareOp::Containing),
    (&["Contains"], CompareOp::Containing),
    (&["Is", "Like"], CompareOp::Like),
    (&["Like"], CompareOp::Like),
    (&["Is", "Not"], CompareOp::NotEquals),
    (&["Not"], CompareOp::NotEquals),
    (&["Is", "Equal"], CompareOp::Equals),
    (&["Equals"], CompareOp::Equals),
    (&["Is"], CompareOp::Equals),
];

static LIMIT_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(First|Top)(\d*)$").expect("limit keyword regex must compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Find,
    Count,
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    And,
    Or,
}

/// One `<field> <operator>` clause; `combinator` is `None` for the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub combinator: Option<Combinator>,
    pub path: String,
    pub op: CompareOp,
}

/// Structured, not yet compiled, derived query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedQuery {
    pub subject: Subject,
    pub distinct: bool,
    pub limit: Option<u32>,
    pub clauses: Vec<Clause>,
    pub sort: Sort,
}

impl DerivedQuery {
    fn with_subject(subject: Subject) -> Self {
        Self {
            subject,
            distinct: false,
            limit: None,
            clauses: Vec::new(),
            sort: Sort::unsorted(),
        }
    }

    pub fn find() -> Self {
        Self::with_subject(Subject::Find)
    }

    pub fn count() -> Self {
        Self::with_subject(Subject::Count)
    }

    pub fn exists() -> Self {
        Self::with_subject(Subject::Exists)
    }

    /// Starts the criteria; replaces any existing clauses.
    pub fn by(mut self, path: &str, op: CompareOp) -> Self {
        self.clauses = vec![Clause {
            combinator: None,
            path: path.to_string(),
            op,
        }];
        self
    }

    pub fn and(self, path: &str, op: CompareOp) -> Self {
        self.push(Combinator::And, path, op)
    }

    pub fn or(self, path: &str, op: CompareOp) -> Self {
        self.push(Combinator::Or, path, op)
    }

    fn push(mut self, combinator: Combinator, path: &str, op: CompareOp) -> Self {
        let combinator = if self.clauses.is_empty() {
            None
        } else {
            Some(combinator)
        };
        self.clauses.push(Clause {
            combinator,
            path: path.to_string(),
            op,
        });
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.sort.orders.push(order);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Number of positional arguments the clauses consume.
    pub fn arity(&self) -> usize {
        self.clauses.iter().map(|clause| clause.op.arity()).sum()
    }

    /// Parses a method name such as `findTop3ByUsernameAndAgeGreaterThanOrderByAgeDesc`.
    ///
    /// # Errors
    /// - `UnknownField` when a clause names no field of `entity`.
    /// - `UnsupportedOperator` when a clause resolves a field but ends with an
    ///   unrecognized keyword.
    /// - `InvalidQuery` for an unknown prefix or a dangling combinator.
    pub fn parse(method: &str, catalog: &EntityCatalog, entity: &str) -> RepoResult<Self> {
        let words = split_camel_case(method);
        let Some((prefix, rest)) = words.split_first() else {
            return Err(RepoError::InvalidQuery("empty query method name".to_string()));
        };

        let mut query = match prefix.as_str() {
            "find" | "read" | "get" | "query" | "search" | "stream" => Self::find(),
            "count" => Self::count(),
            "exists" => Self::exists(),
            other => {
                return Err(RepoError::InvalidQuery(format!(
                    "query method `{method}` starts with unsupported prefix `{other}`"
                )))
            }
        };

        let order_at = rest
            .windows(2)
            .position(|pair| pair[0] == "Order" && pair[1] == "By");
        let (head, order_words) = match order_at {
            Some(index) => (&rest[..index], &rest[index + 2..]),
            None => (rest, &rest[rest.len()..]),
        };

        let by_at = head.iter().position(|word| word == "By");
        let (subject_words, criteria) = match by_at {
            Some(index) => (&head[..index], Some(&head[index + 1..])),
            None => (head, None),
        };

        for word in subject_words {
            if word == "Distinct" {
                query.distinct = true;
            } else if let Some(captures) = LIMIT_WORD.captures(word) {
                let digits = captures.get(2).map_or("", |m| m.as_str());
                let limit = if digits.is_empty() {
                    1
                } else {
                    digits.parse::<u32>().map_err(|_| {
                        RepoError::InvalidQuery(format!("limit `{word}` in `{method}` is too large"))
                    })?
                };
                query.limit = Some(limit);
            }
        }

        if let Some(criteria) = criteria {
            if criteria.is_empty() && order_at.is_none() {
                return Err(RepoError::InvalidQuery(format!(
                    "query method `{method}` has no criteria after `By`"
                )));
            }
            if !criteria.is_empty() {
                query.clauses = parse_clauses(method, criteria, catalog, entity)?;
            }
        }

        if order_at.is_some() {
            query.sort = parse_order(method, order_words, catalog, entity)?;
        }

        Ok(query)
    }

    /// Validates clauses against the catalog and builds the predicate template.
    pub fn compile(
        &self,
        method: &str,
        catalog: &EntityCatalog,
        entity: &str,
    ) -> RepoResult<CompiledQuery> {
        catalog.resolve_entity(entity)?;
        self.sort.check(catalog, entity)?;

        let mut template: Option<Predicate> = None;
        let mut params = Vec::new();

        for (position, clause) in self.clauses.iter().enumerate() {
            if position > 0 && clause.combinator.is_none() {
                return Err(RepoError::InvalidQuery(format!(
                    "clause `{}` in `{method}` is missing its combinator",
                    clause.path
                )));
            }

            let resolved = catalog.resolve_path(entity, clause.path.as_str())?;
            if matches!(clause.op, CompareOp::Containing | CompareOp::Like)
                && resolved.field.field_type != FieldType::Text
            {
                return Err(RepoError::TypeMismatch {
                    field: clause.path.clone(),
                    expected: FieldType::Text.to_string(),
                    actual: resolved.field.field_type.to_string(),
                });
            }

            let leaf = Predicate::param(clause.path.as_str(), clause.op, params.len());
            if clause.op.arity() > 0 {
                params.push(ParamSlot {
                    path: clause.path.clone(),
                    op: clause.op,
                    field: resolved.field,
                });
            }

            template = Some(match (template, clause.combinator) {
                (None, _) => leaf,
                (Some(acc), Some(Combinator::Or)) => acc.or(leaf),
                (Some(acc), _) => acc.and(leaf),
            });
        }

        Ok(CompiledQuery {
            method: method.to_string(),
            entity: entity.to_string(),
            subject: self.subject,
            distinct: self.distinct,
            limit: self.limit,
            template,
            params,
            sort: self.sort.clone(),
        })
    }
}

/// Argument slot of a compiled query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSlot {
    pub path: String,
    pub op: CompareOp,
    pub field: FieldDescriptor,
}

/// Derived query validated against the catalog, ready to bind arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub method: String,
    pub entity: String,
    pub subject: Subject,
    pub distinct: bool,
    pub limit: Option<u32>,
    pub template: Option<Predicate>,
    pub params: Vec<ParamSlot>,
    pub sort: Sort,
}

impl CompiledQuery {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Binds positional arguments into the predicate template.
    ///
    /// # Errors
    /// - `ArityMismatch` when `args.len()` differs from [`Self::arity`].
    /// - `TypeMismatch` when an argument does not fit its field.
    pub fn bind(&self, args: &[Value]) -> RepoResult<Option<Predicate>> {
        if args.len() != self.arity() {
            return Err(RepoError::ArityMismatch {
                method: self.method.clone(),
                expected: self.arity(),
                actual: args.len(),
            });
        }
        for (slot, arg) in self.params.iter().zip(args) {
            check_operand(slot.path.as_str(), &slot.field, slot.op, arg)?;
        }
        self.template
            .as_ref()
            .map(|template| template.bind(args))
            .transpose()
    }
}

fn parse_clauses(
    method: &str,
    words: &[String],
    catalog: &EntityCatalog,
    entity: &str,
) -> RepoResult<Vec<Clause>> {
    let mut clauses = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut combinator = None;

    for word in words {
        let next = match word.as_str() {
            "And" => Some(Combinator::And),
            "Or" => Some(Combinator::Or),
            _ => None,
        };
        match next {
            Some(next) if !current.is_empty() => {
                clauses.push(parse_clause(method, &current, combinator, catalog, entity)?);
                current.clear();
                combinator = Some(next);
            }
            Some(_) => {
                return Err(RepoError::InvalidQuery(format!(
                    "query method `{method}` has a combinator without a preceding clause"
                )))
            }
            None => current.push(word.clone()),
        }
    }

    if current.is_empty() {
        return Err(RepoError::InvalidQuery(format!(
            "query method `{method}` ends with a dangling combinator"
        )));
    }
    clauses.push(parse_clause(method, &current, combinator, catalog, entity)?);
    Ok(clauses)
}

fn parse_clause(
    method: &str,
    words: &[String],
    combinator: Option<Combinator>,
    catalog: &EntityCatalog,
    entity: &str,
) -> RepoResult<Clause> {
    let keyword = OPERATOR_KEYWORDS
        .iter()
        .filter(|(keyword, _)| words.len() > keyword.len() && words.ends_with_words(keyword))
        .max_by_key(|(keyword, _)| keyword.len());

    if let Some((keyword, op)) = keyword {
        let field_words = &words[..words.len() - keyword.len()];
        let path = resolve_words(field_words, catalog, entity).ok_or_else(|| {
            RepoError::UnknownField {
                entity: entity.to_string(),
                field: lower_camel(field_words),
            }
        })?;
        return Ok(Clause {
            combinator,
            path,
            op: *op,
        });
    }

    if let Some(path) = resolve_words(words, catalog, entity) {
        return Ok(Clause {
            combinator,
            path,
            op: CompareOp::Equals,
        });
    }

    for split in (1..words.len()).rev() {
        if resolve_words(&words[..split], catalog, entity).is_some() {
            return Err(RepoError::UnsupportedOperator {
                method: method.to_string(),
                keyword: words[split..].concat(),
            });
        }
    }

    Err(RepoError::UnknownField {
        entity: entity.to_string(),
        field: lower_camel(words),
    })
}

fn parse_order(
    method: &str,
    words: &[String],
    catalog: &EntityCatalog,
    entity: &str,
) -> RepoResult<Sort> {
    if words.is_empty() {
        return Err(RepoError::InvalidQuery(format!(
            "query method `{method}` has no fields after `OrderBy`"
        )));
    }

    let mut sort = Sort::unsorted();
    let mut current: Vec<String> = Vec::new();
    for word in words {
        let direction = match word.as_str() {
            "Asc" => Some(Direction::Asc),
            "Desc" => Some(Direction::Desc),
            _ => None,
        };
        match direction {
            Some(direction) if !current.is_empty() => {
                sort.orders.push(order_for(&current, direction, catalog, entity)?);
                current.clear();
            }
            Some(_) => {
                return Err(RepoError::InvalidQuery(format!(
                    "query method `{method}` has a sort direction without a field"
                )))
            }
            None => current.push(word.clone()),
        }
    }
    if !current.is_empty() {
        sort.orders
            .push(order_for(&current, Direction::Asc, catalog, entity)?);
    }
    Ok(sort)
}

fn order_for(
    words: &[String],
    direction: Direction,
    catalog: &EntityCatalog,
    entity: &str,
) -> RepoResult<Order> {
    let path = resolve_words(words, catalog, entity).ok_or_else(|| RepoError::UnknownField {
        entity: entity.to_string(),
        field: lower_camel(words),
    })?;
    Ok(Order { path, direction })
}

/// Resolves camel-case words to `field` or `relationship.field`.
fn resolve_words(words: &[String], catalog: &EntityCatalog, entity: &str) -> Option<String> {
    if words.is_empty() {
        return None;
    }
    let direct = snake_case(words);
    if catalog.resolve_path(entity, direct.as_str()).is_ok() {
        return Some(direct);
    }
    (1..words.len()).find_map(|split| {
        let path = format!(
            "{}.{}",
            snake_case(&words[..split]),
            snake_case(&words[split..])
        );
        catalog
            .resolve_path(entity, path.as_str())
            .ok()
            .map(|_| path)
    })
}

trait EndsWithWords {
    fn ends_with_words(&self, keyword: &[&str]) -> bool;
}

impl EndsWithWords for [String] {
    fn ends_with_words(&self, keyword: &[&str]) -> bool {
        self.len() >= keyword.len()
            && self[self.len() - keyword.len()..]
                .iter()
                .zip(keyword)
                .all(|(word, expected)| word == expected)
    }
}

/// Splits `findByTeamName` into `["find", "By", "Team", "Name"]`.
///
/// Uppercase runs stay together (`findByURL` → `["find", "By", "URL"]`);
/// digits stick to the preceding word (`Top3`).
pub(crate) fn split_camel_case(input: &str) -> Vec<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (index, &ch) in chars.iter().enumerate() {
        let boundary = if index == 0 || !ch.is_ascii_uppercase() {
            false
        } else {
            let previous = chars[index - 1];
            let next_is_lower = chars
                .get(index + 1)
                .is_some_and(|next| next.is_ascii_lowercase());
            previous.is_ascii_lowercase()
                || previous.is_ascii_digit()
                || (previous.is_ascii_uppercase() && next_is_lower)
        };
        if boundary && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn snake_case(words: &[String]) -> String {
    words
        .iter()
        .map(|word| word.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

fn lower_camel(words: &[String]) -> String {
    let joined = words.concat();
    let mut chars = joined.chars();
    match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{split_camel_case, Combinator, DerivedQuery, Subject};
    use crate::catalog::{EntityCatalog, EntityDescriptor};
    use crate::query::plan::Direction;
    use crate::query::predicate::{CompareOp, Predicate};
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
    fn splits_camel_case_words() {
        assert_eq!(
            split_camel_case("findByUsernameAndAgeGreaterThan"),
            vec!["find", "By", "Username", "And", "Age", "Greater", "Than"]
        );
        assert_eq!(split_camel_case("findTop3ByURL"), vec!["find", "Top3", "By", "URL"]);
    }

    #[test]
    fn parses_and_with_longest_operator_suffix() {
        let query =
            DerivedQuery::parse("findByUsernameAndAgeGreaterThanEqual", &catalog(), "Member")
                .unwrap();
        assert_eq!(query.subject, Subject::Find);
        assert_eq!(query.clauses.len(), 2);
        assert_eq!(query.clauses[0].path, "username");
        assert_eq!(query.clauses[0].op, CompareOp::Equals);
        assert_eq!(query.clauses[1].combinator, Some(Combinator::And));
        assert_eq!(query.clauses[1].op, CompareOp::GreaterThanEqual);
        assert_eq!(query.arity(), 2);
    }

    #[test]
    fn resolves_nested_paths_and_ignores_subject_words() {
        let query = DerivedQuery::parse("findMemberByTeamName", &catalog(), "Member").unwrap();
        assert_eq!(query.clauses[0].path, "team.name");

        let query = DerivedQuery::parse("findLockByUsername", &catalog(), "Member").unwrap();
        assert_eq!(query.clauses[0].path, "username");
    }

    #[test]
    fn parses_limits_order_and_null_checks() {
        let query = DerivedQuery::parse(
            "findTop3ByTeamIsNullOrderByAgeDescUsername",
            &catalog(),
            "Member",
        )
        .unwrap();
        assert_eq!(query.limit, Some(3));
        assert_eq!(query.clauses[0].op, CompareOp::IsNull);
        assert_eq!(query.arity(), 0);
        assert_eq!(query.sort.orders.len(), 2);
        assert_eq!(query.sort.orders[0].direction, Direction::Desc);
        assert_eq!(query.sort.orders[1].path, "username");

        let count = DerivedQuery::parse("countByAge", &catalog(), "Member").unwrap();
        assert_eq!(count.subject, Subject::Count);
        let first = DerivedQuery::parse("findFirstByOrderByAgeAsc", &catalog(), "Member").unwrap();
        assert_eq!(first.limit, Some(1));
        assert!(first.clauses.is_empty());
        let err = DerivedQuery::parse("findByOrderBy", &catalog(), "Member").unwrap_err();
        assert!(matches!(err, RepoError::InvalidQuery(_)));
        let all = DerivedQuery::parse("findAllOrderByAgeAsc", &catalog(), "Member").unwrap();
        assert!(all.clauses.is_empty());
    }

    #[test]
    fn reports_unknown_fields_and_unsupported_operators() {
        let err = DerivedQuery::parse("findByNickname", &catalog(), "Member").unwrap_err();
        assert!(matches!(err, RepoError::UnknownField { field, .. } if field == "nickname"));

        let err = DerivedQuery::parse("findByAgeBetween", &catalog(), "Member").unwrap_err();
        assert!(matches!(err, RepoError::UnsupportedOperator { keyword, .. } if keyword == "Between"));

        let err = DerivedQuery::parse("findByUsernameAnd", &catalog(), "Member").unwrap_err();
        assert!(matches!(err, RepoError::InvalidQuery(_)));

        let err = DerivedQuery::parse("removeByUsername", &catalog(), "Member").unwrap_err();
        assert!(matches!(err, RepoError::InvalidQuery(_)));
    }

    #[test]
    fn mixed_and_or_folds_left_to_right() {
        let compiled = DerivedQuery::find()
            .by("username", CompareOp::Equals)
            .or("age", CompareOp::GreaterThan)
            .and("team", CompareOp::IsNotNull)
            .compile("custom", &catalog(), "Member")
            .unwrap();
        let bound = compiled
            .bind(&[Value::from("AAA"), Value::from(15)])
            .unwrap()
            .unwrap();
        assert_eq!(
            bound,
            Predicate::eq("username", "AAA")
                .or(Predicate::gt("age", 15))
                .and(Predicate::compare("team", CompareOp::IsNotNull, Value::Null))
        );
    }

    #[test]
    fn bind_checks_arity_and_types() {
        let compiled = DerivedQuery::parse("findByUsernameAndAgeGreaterThan", &catalog(), "Member")
            .unwrap()
            .compile("findByUsernameAndAgeGreaterThan", &catalog(), "Member")
            .unwrap();

        let err = compiled.bind(&[Value::from("AAA")]).unwrap_err();
        assert!(matches!(
            err,
            RepoError::ArityMismatch { expected: 2, actual: 1, .. }
        ));

        let err = compiled
            .bind(&[Value::from("AAA"), Value::from("fifteen")])
            .unwrap_err();
        assert!(matches!(err, RepoError::TypeMismatch { field, .. } if field == "age"));
    }

    #[test]
    fn containing_on_non_text_field_fails_at_compile() {
        let err = DerivedQuery::find()
            .by("age", CompareOp::Containing)
            .compile("findByAgeContaining", &catalog(), "Member")
            .unwrap_err();
        assert!(matches!(err, RepoError::TypeMismatch { .. }));
    }
}
