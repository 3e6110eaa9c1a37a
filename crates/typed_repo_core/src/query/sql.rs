//! SQL rendering for query plans, counts, bulk updates and explicit queries.
//!
//! # Responsibility
//! - Turn checked plans into SQLite statements plus positional bind values.
//! - Report which columns a select returns so rows can be mapped back.
//!
//! # Invariants
//! - The root table is always aliased `t0`; joined tables get `t1`, `t2`, ...
//!   in first-use order.
//! - Row selects end with `t0.<id> ASC` unless identity already sorts them,
//!   so paging over equal sort keys is stable.
//! - Values are never spliced into SQL text.

use crate::catalog::{EntityCatalog, EntityDescriptor, FieldDescriptor};
use crate::query::plan::{AssignOp, Mutation, ProjectionShape, QueryPlan, Sort};
use crate::query::predicate::{CompareOp, Comparison, Operand, Predicate};
use crate::repo::error::{RepoError, RepoResult};
use crate::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value as SqlValue;

/// One selected column: a root field or a field of a joined relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SelectedColumn {
    pub relationship: Option<String>,
    pub field: FieldDescriptor,
}

/// Rendered statement ready for `params_from_iter`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SqlStatement {
    pub sql: String,
    pub binds: Vec<SqlValue>,
    pub columns: Vec<SelectedColumn>,
}

/// What a select returns per row.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Selection<'a> {
    /// Whole entity plus the plan's fetched relationships.
    Entity,
    Projection(&'a ProjectionShape),
}

struct Join<'a> {
    relationship: String,
    alias: String,
    join_column: String,
    target: &'a EntityDescriptor,
}

/// Accumulates joins and binds while rendering one statement.
struct SelectBuilder<'a> {
    catalog: &'a EntityCatalog,
    root: &'a EntityDescriptor,
    joins: Vec<Join<'a>>,
    binds: Vec<SqlValue>,
}

impl<'a> SelectBuilder<'a> {
    fn new(catalog: &'a EntityCatalog, entity: &str) -> RepoResult<Self> {
        Ok(Self {
            catalog,
            root: catalog.resolve_entity(entity)?,
            joins: Vec::new(),
            binds: Vec::new(),
        })
    }

    fn alias_for(&mut self, relationship: &str) -> RepoResult<(String, &'a EntityDescriptor)> {
        if let Some(join) = self
            .joins
            .iter()
            .find(|join| join.relationship == relationship)
        {
            return Ok((join.alias.clone(), join.target));
        }

        let descriptor = self
            .catalog
            .resolve_relationship(self.root.name.as_str(), relationship)?;
        let join_column = descriptor.join_column.clone().ok_or_else(|| {
            RepoError::InvalidQuery(format!(
                "relationship `{relationship}` has no join column and cannot be joined"
            ))
        })?;
        let target = self.catalog.resolve_entity(descriptor.target.as_str())?;
        let alias = format!("t{}", self.joins.len() + 1);
        self.joins.push(Join {
            relationship: relationship.to_string(),
            alias: alias.clone(),
            join_column,
            target,
        });
        Ok((alias, target))
    }

    fn column(&mut self, path: &str) -> RepoResult<(String, FieldDescriptor)> {
        let resolved = self.catalog.resolve_path(self.root.name.as_str(), path)?;
        match resolved.relationship {
            None => Ok((format!("t0.{}", resolved.field.column), resolved.field)),
            Some(relationship) => {
                let (alias, _) = self.alias_for(relationship.name.as_str())?;
                Ok((format!("{alias}.{}", resolved.field.column), resolved.field))
            }
        }
    }

    fn predicate(&mut self, predicate: &Predicate) -> RepoResult<String> {
        match predicate {
            Predicate::Compare(comparison) => self.comparison(comparison),
            Predicate::And(left, right) => Ok(format!(
                "({} AND {})",
                self.predicate(left)?,
                self.predicate(right)?
            )),
            Predicate::Or(left, right) => Ok(format!(
                "({} OR {})",
                self.predicate(left)?,
                self.predicate(right)?
            )),
        }
    }

    fn comparison(&mut self, comparison: &Comparison) -> RepoResult<String> {
        let (column, _) = self.column(comparison.path.as_str())?;
        let value = match &comparison.operand {
            Operand::None => Value::Null,
            Operand::Value(value) => value.clone(),
            Operand::Param(index) => {
                return Err(RepoError::InvalidQuery(format!(
                    "parameter {index} for `{}` was never bound",
                    comparison.path
                )))
            }
        };

        let sql = match comparison.op {
            CompareOp::IsNull => format!("{column} IS NULL"),
            CompareOp::IsNotNull => format!("{column} IS NOT NULL"),
            CompareOp::Equals if value.is_null() => format!("{column} IS NULL"),
            CompareOp::NotEquals if value.is_null() => format!("{column} IS NOT NULL"),
            CompareOp::In => {
                let Value::List(items) = value else {
                    return Err(RepoError::InvalidQuery(format!(
                        "IN operand for `{}` must be a list",
                        comparison.path
                    )));
                };
                if items.is_empty() {
                    return Ok("0 = 1".to_string());
                }
                for item in &items {
                    self.binds.push(item.to_sql()?);
                }
                format!("{column} IN ({})", placeholders(items.len()))
            }
            CompareOp::Containing => {
                let text = value.as_str().unwrap_or_default();
                self.binds
                    .push(SqlValue::Text(format!("%{}%", escape_like(text))));
                format!("{column} LIKE ? ESCAPE '\\'")
            }
            op => {
                self.binds.push(value.to_sql()?);
                format!("{column} {} ?", binary_operator(op))
            }
        };
        Ok(sql)
    }

    fn order_by(&mut self, sort: &Sort) -> RepoResult<String> {
        let mut keys = Vec::with_capacity(sort.orders.len() + 1);
        let mut sorted_by_id = false;
        for order in &sort.orders {
            let (column, _) = self.column(order.path.as_str())?;
            if column == format!("t0.{}", self.root.id.column) {
                sorted_by_id = true;
            }
            keys.push(format!("{column} {}", order.direction.as_sql()));
        }
        if !sorted_by_id {
            keys.push(format!("t0.{} ASC", self.root.id.column));
        }
        Ok(format!(" ORDER BY {}", keys.join(", ")))
    }

    fn from_clause(&self) -> String {
        let mut sql = format!(" FROM {} t0", self.root.table);
        for join in &self.joins {
            sql.push_str(&format!(
                " LEFT JOIN {} {} ON {}.{} = t0.{}",
                join.target.table, join.alias, join.alias, join.target.id.column, join.join_column
            ));
        }
        sql
    }

    fn where_clause(&mut self, predicate: Option<&Predicate>) -> RepoResult<String> {
        match predicate {
            Some(predicate) => Ok(format!(" WHERE {}", self.predicate(predicate)?)),
            None => Ok(String::new()),
        }
    }
}

/// Renders the row select for `plan`.
pub(crate) fn render_select(
    catalog: &EntityCatalog,
    plan: &QueryPlan,
    selection: Selection<'_>,
) -> RepoResult<SqlStatement> {
    let mut builder = SelectBuilder::new(catalog, plan.entity.as_str())?;
    let mut columns: Vec<SelectedColumn> = Vec::new();

    let (root_fields, nested): (Vec<FieldDescriptor>, Vec<String>) = match selection {
        Selection::Entity => (builder.root.all_fields(), plan.fetch.clone()),
        Selection::Projection(shape) if shape.open => {
            let mut nested = plan.fetch.clone();
            nested.extend(shape.nested.iter().cloned());
            (builder.root.all_fields(), nested)
        }
        Selection::Projection(shape) => {
            let fields = shape
                .fields
                .iter()
                .map(|field| catalog.resolve_field(plan.entity.as_str(), field))
                .collect::<RepoResult<Vec<_>>>()?;
            (fields, shape.nested.clone())
        }
    };

    let mut select_list: Vec<String> = root_fields
        .iter()
        .map(|field| format!("t0.{}", field.column))
        .collect();
    columns.extend(root_fields.into_iter().map(|field| SelectedColumn {
        relationship: None,
        field,
    }));

    let mut seen = Vec::new();
    for relationship in nested {
        if seen.contains(&relationship) {
            continue;
        }
        let (alias, target) = builder.alias_for(relationship.as_str())?;
        for field in target.all_fields() {
            select_list.push(format!("{alias}.{}", field.column));
            columns.push(SelectedColumn {
                relationship: Some(relationship.clone()),
                field,
            });
        }
        seen.push(relationship);
    }

    let where_sql = builder.where_clause(plan.predicate.as_ref())?;
    let order_sql = builder.order_by(plan.effective_sort())?;

    let mut sql = String::from("SELECT ");
    if plan.distinct {
        sql.push_str("DISTINCT ");
    }
    sql.push_str(&select_list.join(", "));
    sql.push_str(&builder.from_clause());
    sql.push_str(&where_sql);
    sql.push_str(&order_sql);

    let mut binds = builder.binds;
    match (&plan.page, plan.limit) {
        (Some(page), limit) => {
            let offset = page.offset();
            let mut size = u64::from(page.size());
            if let Some(limit) = limit {
                size = size.min(u64::from(limit).saturating_sub(offset));
            }
            sql.push_str(" LIMIT ? OFFSET ?");
            binds.push(SqlValue::Integer(to_i64(size)));
            binds.push(SqlValue::Integer(to_i64(offset)));
        }
        (None, Some(limit)) => {
            sql.push_str(" LIMIT ?");
            binds.push(SqlValue::Integer(i64::from(limit)));
        }
        (None, None) => {}
    }

    Ok(SqlStatement {
        sql,
        binds,
        columns,
    })
}

/// Renders `SELECT COUNT(...)` over the plan's filter, ignoring sort and paging.
pub(crate) fn render_count(catalog: &EntityCatalog, plan: &QueryPlan) -> RepoResult<SqlStatement> {
    let mut builder = SelectBuilder::new(catalog, plan.entity.as_str())?;
    let where_sql = builder.where_clause(plan.predicate.as_ref())?;
    let counted = if plan.distinct {
        format!("COUNT(DISTINCT t0.{})", builder.root.id.column)
    } else {
        "COUNT(*)".to_string()
    };
    let sql = format!("SELECT {counted}{}{where_sql}", builder.from_clause());
    Ok(SqlStatement {
        sql,
        binds: builder.binds,
        columns: Vec::new(),
    })
}

/// Renders a probe returning one row when any row matches.
pub(crate) fn render_exists(catalog: &EntityCatalog, plan: &QueryPlan) -> RepoResult<SqlStatement> {
    let mut builder = SelectBuilder::new(catalog, plan.entity.as_str())?;
    let where_sql = builder.where_clause(plan.predicate.as_ref())?;
    let sql = format!("SELECT 1{}{where_sql} LIMIT 1", builder.from_clause());
    Ok(SqlStatement {
        sql,
        binds: builder.binds,
        columns: Vec::new(),
    })
}

/// Renders a set-based update; filters run in an identity subquery so joined
/// paths work with SQLite's single-table `UPDATE`.
pub(crate) fn render_update(
    catalog: &EntityCatalog,
    entity: &str,
    predicate: Option<&Predicate>,
    mutation: &Mutation,
) -> RepoResult<SqlStatement> {
    let mut builder = SelectBuilder::new(catalog, entity)?;
    let root = builder.root;

    let mut assignments = Vec::with_capacity(mutation.assignments.len());
    let mut binds = Vec::with_capacity(mutation.assignments.len());
    for assignment in &mutation.assignments {
        let field = catalog.resolve_field(entity, assignment.field.as_str())?;
        match &assignment.op {
            AssignOp::Set(value) => {
                assignments.push(format!("{} = ?", field.column));
                binds.push(value.to_sql()?);
            }
            AssignOp::Increment(delta) => {
                assignments.push(format!("{0} = {0} + ?", field.column));
                binds.push(SqlValue::Integer(*delta));
            }
        }
    }

    let mut sql = format!("UPDATE {} SET {}", root.table, assignments.join(", "));
    if predicate.is_some() {
        let where_sql = builder.where_clause(predicate)?;
        sql.push_str(&format!(
            " WHERE {} IN (SELECT t0.{}{}{where_sql})",
            root.id.column,
            root.id.column,
            builder.from_clause()
        ));
        binds.extend(builder.binds);
    }

    Ok(SqlStatement {
        sql,
        binds,
        columns: Vec::new(),
    })
}

static NAMED_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"'(?:[^']|'')*'|:([A-Za-z_][A-Za-z0-9_]*)")
        .expect("named parameter regex must compile")
});

/// Explicit SQL with `:name` parameters.
///
/// Positional arguments bind to names in first-appearance order; a name used
/// twice binds the same argument twice. List arguments expand in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExplicitSql {
    segments: Vec<String>,
    /// Name index per placeholder, in text order.
    slots: Vec<usize>,
    pub names: Vec<String>,
}

impl ExplicitSql {
    pub(crate) fn parse(sql: &str) -> Self {
        let mut segments = Vec::new();
        let mut slots = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut cursor = 0;

        for captures in NAMED_PARAM.captures_iter(sql) {
            let Some(name) = captures.get(1) else {
                continue;
            };
            let Some(whole) = captures.get(0) else {
                continue;
            };
            segments.push(sql[cursor..whole.start()].to_string());
            cursor = whole.end();

            let index = match names.iter().position(|known| known == name.as_str()) {
                Some(index) => index,
                None => {
                    names.push(name.as_str().to_string());
                    names.len() - 1
                }
            };
            slots.push(index);
        }
        segments.push(sql[cursor..].to_string());

        Self {
            segments,
            slots,
            names,
        }
    }

    pub(crate) fn arity(&self) -> usize {
        self.names.len()
    }

    pub(crate) fn is_select(&self) -> bool {
        self.segments
            .first()
            .map(|head| {
                let head = head.trim_start().to_ascii_uppercase();
                head.starts_with("SELECT") || head.starts_with("WITH")
            })
            .unwrap_or(false)
    }

    /// Produces SQLite text and binds for `args`.
    ///
    /// # Errors
    /// - `ArityMismatch` when `args.len()` differs from the distinct name count.
    pub(crate) fn render(&self, method: &str, args: &[Value]) -> RepoResult<SqlStatement> {
        if args.len() != self.arity() {
            return Err(RepoError::ArityMismatch {
                method: method.to_string(),
                expected: self.arity(),
                actual: args.len(),
            });
        }

        let mut sql = String::new();
        let mut binds = Vec::new();
        for (position, segment) in self.segments.iter().enumerate() {
            sql.push_str(segment);
            let Some(&slot) = self.slots.get(position) else {
                continue;
            };
            match &args[slot] {
                Value::List(items) => {
                    let parenthesized = segment.trim_end().ends_with('(');
                    let expanded = if items.is_empty() {
                        "NULL".to_string()
                    } else {
                        placeholders(items.len())
                    };
                    if parenthesized {
                        sql.push_str(&expanded);
                    } else {
                        sql.push_str(&format!("({expanded})"));
                    }
                    for item in items {
                        binds.push(item.to_sql()?);
                    }
                }
                value => {
                    sql.push('?');
                    binds.push(value.to_sql()?);
                }
            }
        }

        Ok(SqlStatement {
            sql,
            binds,
            columns: Vec::new(),
        })
    }
}

fn binary_operator(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Equals => "=",
        CompareOp::NotEquals => "<>",
        CompareOp::GreaterThan => ">",
        CompareOp::GreaterThanEqual => ">=",
        CompareOp::LessThan => "<",
        CompareOp::LessThanEqual => "<=",
        CompareOp::Like => "LIKE",
        CompareOp::In | CompareOp::IsNull | CompareOp::IsNotNull | CompareOp::Containing => "=",
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
