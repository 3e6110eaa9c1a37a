//! Query plans, sorting, paging, projection shapes and bulk mutations.
//!
//! # Invariants
//! - A page request never has size 0.
//! - `Page::content.len() <= page_size` and
//!   `total_pages == ceil(total_elements / page_size)`.

use crate::catalog::EntityCatalog;
use crate::query::predicate::{check_operand, CompareOp, Predicate};
use crate::repo::error::{RepoError, RepoResult};
use crate::value::{FieldType, Value};
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    /// Version counter re-checked when the unit of work commits.
    Optimistic,
    /// Write lock held until the unit of work ends.
    PessimisticWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub path: String,
    pub direction: Direction,
}

impl Order {
    pub fn asc(path: &str) -> Self {
        Self {
            path: path.to_string(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(path: &str) -> Self {
        Self {
            path: path.to_string(),
            direction: Direction::Desc,
        }
    }
}

/// Ordered list of sort keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sort {
    pub orders: Vec<Order>,
}

impl Sort {
    pub fn unsorted() -> Self {
        Self::default()
    }

    pub fn by(direction: Direction, paths: &[&str]) -> Self {
        Self {
            orders: paths
                .iter()
                .map(|path| Order {
                    path: (*path).to_string(),
                    direction,
                })
                .collect(),
        }
    }

    pub fn and(mut self, other: Sort) -> Self {
        self.orders.extend(other.orders);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn check(&self, catalog: &EntityCatalog, entity: &str) -> RepoResult<()> {
        for order in &self.orders {
            catalog.resolve_path(entity, order.path.as_str())?;
        }
        Ok(())
    }
}

/// Zero-based page index plus page size and optional sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    page: u32,
    size: u32,
    sort: Sort,
}

impl PageRequest {
    /// # Errors
    /// - `InvalidPage` when `size` is 0.
    pub fn of(page: u32, size: u32) -> RepoResult<Self> {
        if size == 0 {
            return Err(RepoError::InvalidPage("page size must be at least 1".to_string()));
        }
        Ok(Self {
            page,
            size,
            sort: Sort::unsorted(),
        })
    }

    pub fn sorted(page: u32, size: u32, sort: Sort) -> RepoResult<Self> {
        Ok(Self::of(page, size)?.with_sort(sort))
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn sort(&self) -> &Sort {
        &self.sort
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page.saturating_add(1),
            size: self.size,
            sort: self.sort.clone(),
        }
    }

    /// Caps the size to `max_size`.
    pub(crate) fn clamped(&self, max_size: u32) -> Self {
        Self {
            page: self.page,
            size: self.size.min(max_size.max(1)),
            sort: self.sort.clone(),
        }
    }
}

/// One page of results plus totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub page_index: u32,
    pub page_size: u32,
    pub total_elements: u64,
    pub total_pages: u64,
    pub is_first: bool,
    pub is_last: bool,
    pub has_next: bool,
    pub has_previous: bool,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, request: &PageRequest, total_elements: u64) -> Self {
        let page_size = request.size();
        let total_pages = total_elements.div_ceil(u64::from(page_size));
        let page_index = request.page();
        let has_next = u64::from(page_index) + 1 < total_pages;
        Self {
            content,
            page_index,
            page_size,
            total_elements,
            total_pages,
            is_first: page_index == 0,
            is_last: !has_next,
            has_next,
            has_previous: page_index > 0,
        }
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Converts the content while keeping paging metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            page_index: self.page_index,
            page_size: self.page_size,
            total_elements: self.total_elements,
            total_pages: self.total_pages,
            is_first: self.is_first,
            is_last: self.is_last,
            has_next: self.has_next,
            has_previous: self.has_previous,
        }
    }

    pub(crate) fn try_map<U>(self, f: impl FnMut(T) -> RepoResult<U>) -> RepoResult<Page<U>> {
        let content = self.content.into_iter().map(f).collect::<RepoResult<Vec<U>>>()?;
        Ok(Page {
            content,
            page_index: self.page_index,
            page_size: self.page_size,
            total_elements: self.total_elements,
            total_pages: self.total_pages,
            is_first: self.is_first,
            is_last: self.is_last,
            has_next: self.has_next,
            has_previous: self.has_previous,
        })
    }
}

/// Requested projection of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProjectionShape {
    /// Root scalar fields.
    pub fields: Vec<String>,
    /// Owning relationships exposed as nested views; fetched in full.
    pub nested: Vec<String>,
    /// Derived from arbitrary entity state; fetches the whole entity.
    pub open: bool,
}

impl ProjectionShape {
    pub fn closed(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|field| (*field).to_string()).collect(),
            nested: Vec::new(),
            open: false,
        }
    }

    pub fn open() -> Self {
        Self {
            open: true,
            ..Self::default()
        }
    }

    pub fn with_nested(mut self, relationship: &str) -> Self {
        self.nested.push(relationship.to_string());
        self
    }

    pub fn check(&self, catalog: &EntityCatalog, entity: &str) -> RepoResult<()> {
        for field in &self.fields {
            catalog.resolve_field(entity, field)?;
        }
        for relationship in &self.nested {
            let descriptor = catalog.resolve_relationship(entity, relationship)?;
            if !descriptor.is_owning() {
                return Err(RepoError::InvalidQuery(format!(
                    "projection can only nest owning relationships, `{relationship}` is inverse"
                )));
            }
        }
        Ok(())
    }
}

/// Everything the executor needs to run one read.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub entity: String,
    pub predicate: Option<Predicate>,
    pub sort: Sort,
    pub page: Option<PageRequest>,
    pub limit: Option<u32>,
    pub distinct: bool,
    pub lock: LockMode,
    /// Relationships loaded in the same statement.
    pub fetch: Vec<String>,
    /// Skip tracking results in the persistence context.
    pub read_only: bool,
    pub deadline: Option<Instant>,
}

impl QueryPlan {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            predicate: None,
            sort: Sort::unsorted(),
            page: None,
            limit: None,
            distinct: false,
            lock: LockMode::None,
            fetch: Vec::new(),
            read_only: false,
            deadline: None,
        }
    }

    pub fn filter(mut self, predicate: Option<Predicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn sorted(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn paged(mut self, page: PageRequest) -> Self {
        self.page = Some(page);
        self
    }

    pub fn limited(mut self, limit: Option<u32>) -> Self {
        self.limit = limit;
        self
    }

    pub fn locked(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    pub fn fetching(mut self, relationship: &str) -> Self {
        self.fetch.push(relationship.to_string());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Page sort wins over the plan sort when both are present.
    pub fn effective_sort(&self) -> &Sort {
        match &self.page {
            Some(page) if !page.sort().is_empty() => page.sort(),
            _ => &self.sort,
        }
    }

    pub fn check(&self, catalog: &EntityCatalog) -> RepoResult<()> {
        let entity = self.entity.as_str();
        catalog.resolve_entity(entity)?;
        if let Some(predicate) = &self.predicate {
            predicate.check(catalog, entity)?;
        }
        self.effective_sort().check(catalog, entity)?;
        for relationship in &self.fetch {
            let descriptor = catalog.resolve_relationship(entity, relationship)?;
            if !descriptor.is_owning() {
                return Err(RepoError::InvalidQuery(format!(
                    "fetch hints can only load owning relationships, `{relationship}` is inverse"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOp {
    Set(Value),
    Increment(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub field: String,
    pub op: AssignOp,
}

/// Set-based field mutation applied by bulk updates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Mutation {
    pub assignments: Vec<Assignment>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.assignments.push(Assignment {
            field: field.to_string(),
            op: AssignOp::Set(value.into()),
        });
        self
    }

    pub fn increment(mut self, field: &str, delta: i64) -> Self {
        self.assignments.push(Assignment {
            field: field.to_string(),
            op: AssignOp::Increment(delta),
        });
        self
    }

    pub fn check(&self, catalog: &EntityCatalog, entity: &str) -> RepoResult<()> {
        if self.assignments.is_empty() {
            return Err(RepoError::InvalidQuery("bulk mutation has no assignments".to_string()));
        }
        let descriptor = catalog.resolve_entity(entity)?;
        for assignment in &self.assignments {
            let field = catalog.resolve_field(entity, assignment.field.as_str())?;
            if field.name == descriptor.id.name {
                return Err(RepoError::InvalidQuery(
                    "bulk mutation cannot change identity".to_string(),
                ));
            }
            match &assignment.op {
                AssignOp::Set(value) => {
                    if value.is_null() && !field.nullable {
                        return Err(RepoError::TypeMismatch {
                            field: field.name,
                            expected: "non-null value".to_string(),
                            actual: value.kind().to_string(),
                        });
                    }
                    check_operand(&field.name, &field, CompareOp::Equals, value)?;
                }
                AssignOp::Increment(_) => {
                    if field.field_type != FieldType::Integer {
                        return Err(RepoError::TypeMismatch {
                            field: field.name,
                            expected: FieldType::Integer.to_string(),
                            actual: field.field_type.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Options for set-based updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkOptions {
    /// Clear the persistence context after the update so later reads see
    /// the new column values. Off by default: callers must clear it themselves.
    pub clear_context: bool,
}

#[cfg(test)]
mod tests {
    use super::{Direction, Page, PageRequest, QueryPlan, Sort};
    use crate::repo::error::RepoError;

    #[test]
    fn zero_page_size_is_rejected() {
        assert!(matches!(PageRequest::of(0, 0), Err(RepoError::InvalidPage(_))));
    }

    #[test]
    fn page_math_matches_ceil_division() {
        let request = PageRequest::of(0, 3).unwrap();
        let page = Page::new(vec![1, 2, 3], &request, 5);
        assert_eq!(page.total_pages, 2);
        assert!(page.is_first);
        assert!(page.has_next);
        assert!(!page.is_last);

        let last = Page::new(vec![4, 5], &request.next(), 5);
        assert!(!last.has_next);
        assert!(last.is_last);
        assert!(last.has_previous);

        let empty = Page::<i32>::new(vec![], &request, 0);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next);
    }

    #[test]
    fn page_map_keeps_metadata_and_serializes() {
        let request = PageRequest::of(1, 2).unwrap();
        let page = Page::new(vec![3, 4], &request, 5).map(|value| value * 10);
        assert_eq!(page.content, vec![30, 40]);
        assert_eq!(page.page_size, 2);

        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["total_pages"], 3);
        assert_eq!(json["page_index"], 1);
        assert_eq!(json["has_next"], true);
    }

    #[test]
    fn page_sort_overrides_plan_sort() {
        let plan = QueryPlan::new("Member")
            .sorted(Sort::by(Direction::Asc, &["age"]))
            .paged(PageRequest::sorted(0, 3, Sort::by(Direction::Desc, &["username"])).unwrap());
        assert_eq!(plan.effective_sort().orders[0].path, "username");

        let unsorted_page = QueryPlan::new("Member")
            .sorted(Sort::by(Direction::Asc, &["age"]))
            .paged(PageRequest::of(0, 3).unwrap());
        assert_eq!(unsorted_page.effective_sort().orders[0].path, "age");
    }
}
