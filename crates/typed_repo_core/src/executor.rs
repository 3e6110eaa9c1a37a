//! Query executor: runs plans against SQLite and maps rows back to records.
//!
//! # Responsibility
//! - Execute selects, pages, projections, counts, streams, bulk updates,
//!   explicit statements and single-row writes.
//! - Enforce lock-mode discipline and the persistence context of the open
//!   unit of work.
//! - Translate backend errors into `RepoError` at this boundary.
//!
//! # Invariants
//! - Every statement checks the call deadline first and is recorded as a
//!   `StatementTrace` on the session.
//! - Entity rows read inside a unit of work resolve through the identity
//!   map, so a tracked row is returned as tracked (read-your-writes).
//! - Bulk updates never touch tracked copies; clearing them is opt-in.

use crate::catalog::{EntityCatalog, EntityDescriptor, FieldDescriptor};
use crate::db::DbError;
use crate::entity::Record;
use crate::query::plan::{BulkOptions, LockMode, Mutation, Page, PageRequest, ProjectionShape, QueryPlan};
use crate::query::predicate::{check_operand, CompareOp, Predicate};
use crate::query::sql::{
    render_count, render_exists, render_select, render_update, ExplicitSql, SelectedColumn,
    Selection, SqlStatement,
};
use crate::repo::error::{RepoError, RepoResult};
use crate::session::{Session, StatementKind, StatementTrace};
use crate::value::Value;
use log::{debug, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, ErrorCode, OptionalExtension, Row};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

/// Result of [`QueryExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutput {
    Rows(Vec<Record>),
    Page(Page<Record>),
}

/// Result of [`QueryExecutor::execute_explicit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExplicitOutput {
    /// Rows keyed by result column name.
    Rows(Vec<Record>),
    Affected(usize),
}

/// Stateless executor bound to one session.
#[derive(Clone, Copy)]
pub struct QueryExecutor<'s, 'conn> {
    session: &'s Session<'conn>,
}

impl<'s, 'conn> QueryExecutor<'s, 'conn> {
    pub fn new(session: &'s Session<'conn>) -> Self {
        Self { session }
    }

    /// Runs `plan`; a page request yields `QueryOutput::Page`.
    pub fn execute(&self, plan: &QueryPlan) -> RepoResult<QueryOutput> {
        if plan.page.is_some() {
            return Ok(QueryOutput::Page(self.execute_page(plan)?));
        }
        Ok(QueryOutput::Rows(self.fetch(plan)?))
    }

    /// Entity rows for `plan`, ignoring any page request.
    pub fn fetch(&self, plan: &QueryPlan) -> RepoResult<Vec<Record>> {
        let mut unpaged = plan.clone();
        unpaged.page = None;
        self.select_entities(&unpaged)
    }

    /// Page of entity rows plus totals; the count query is skipped when the
    /// content already determines the total.
    ///
    /// # Errors
    /// - `InvalidPage` when the plan carries no page request.
    pub fn execute_page(&self, plan: &QueryPlan) -> RepoResult<Page<Record>> {
        self.page_with(plan, |paged| self.select_entities(paged))
    }

    /// Projected rows. Closed shapes select only their columns; nested
    /// relationships and open shapes load whole entities.
    pub fn execute_projection(
        &self,
        plan: &QueryPlan,
        shape: &ProjectionShape,
    ) -> RepoResult<Vec<Record>> {
        let mut unpaged = plan.clone();
        unpaged.page = None;
        self.select_projection(&unpaged, shape)
    }

    pub fn execute_projection_page(
        &self,
        plan: &QueryPlan,
        shape: &ProjectionShape,
    ) -> RepoResult<Page<Record>> {
        self.page_with(plan, |paged| self.select_projection(paged, shape))
    }

    pub fn count(&self, plan: &QueryPlan) -> RepoResult<u64> {
        let catalog = self.session.catalog();
        plan.check(catalog)?;
        self.check_lock(plan)?;
        let statement = render_count(catalog, plan)?;
        let deadline = self.deadline_for(plan.deadline);
        let counts = self.run_query(StatementKind::Count, &statement, plan.lock, deadline, |row| {
            Ok(row.get::<_, i64>(0)?)
        })?;
        let total = counts
            .first()
            .copied()
            .map_or(0, |count| u64::try_from(count).unwrap_or(0));
        Ok(match plan.limit {
            Some(limit) => total.min(u64::from(limit)),
            None => total,
        })
    }

    pub fn exists(&self, plan: &QueryPlan) -> RepoResult<bool> {
        let catalog = self.session.catalog();
        plan.check(catalog)?;
        self.check_lock(plan)?;
        let statement = render_exists(catalog, plan)?;
        let deadline = self.deadline_for(plan.deadline);
        let rows = self.run_query(StatementKind::Exists, &statement, plan.lock, deadline, |_| Ok(()))?;
        Ok(!rows.is_empty())
    }

    /// Applies `mutation` to every row matching the plan's predicate.
    ///
    /// Tracked copies of affected rows keep their old values until the
    /// caller clears the session or sets `options.clear_context`.
    pub fn execute_bulk(
        &self,
        plan: &QueryPlan,
        mutation: &Mutation,
        options: BulkOptions,
    ) -> RepoResult<usize> {
        let catalog = self.session.catalog();
        plan.check(catalog)?;
        mutation.check(catalog, plan.entity.as_str())?;
        let statement = render_update(catalog, plan.entity.as_str(), plan.predicate.as_ref(), mutation)?;
        let deadline = self.deadline_for(plan.deadline);

        let affected = self
            .session
            .write_scope(|| self.run_update(StatementKind::BulkUpdate, &statement, deadline))?;
        debug!(
            "event=bulk_update module=executor status=ok entity={} affected={} clear_context={}",
            plan.entity, affected, options.clear_context
        );
        if options.clear_context {
            self.session.clear();
        }
        Ok(affected)
    }

    /// Runs explicit SQL with `:name` parameters bound positionally in
    /// first-appearance order.
    pub fn execute_explicit(
        &self,
        method: &str,
        sql: &str,
        args: &[Value],
        options: BulkOptions,
    ) -> RepoResult<ExplicitOutput> {
        self.run_explicit(method, &ExplicitSql::parse(sql), args, options)
    }

    pub(crate) fn run_explicit(
        &self,
        method: &str,
        explicit: &ExplicitSql,
        args: &[Value],
        options: BulkOptions,
    ) -> RepoResult<ExplicitOutput> {
        let statement = explicit.render(method, args)?;
        let deadline = self.deadline_for(None);

        if explicit.is_select() {
            return self
                .run_named_columns(&statement, deadline)
                .map(ExplicitOutput::Rows);
        }

        let affected = self
            .session
            .write_scope(|| self.run_update(StatementKind::Explicit, &statement, deadline))?;
        debug!(
            "event=explicit_update module=executor status=ok method={method} affected={affected} clear_context={}",
            options.clear_context
        );
        if options.clear_context {
            self.session.clear();
        }
        Ok(ExplicitOutput::Affected(affected))
    }

    /// Lazily reads entity rows in chunks of `fetch_size`.
    ///
    /// Each chunk is a separate statement; calling `stream` again restarts
    /// from the first row.
    pub fn stream(&self, plan: &QueryPlan) -> RepoResult<RecordStream<'s, 'conn>> {
        plan.check(self.session.catalog())?;
        let chunk_size = self.session.config().fetch_size.max(1);
        let mut base = plan.clone();
        base.page = None;
        Ok(RecordStream {
            executor: *self,
            plan: base,
            chunk_size,
            next_chunk: 0,
            buffer: VecDeque::new(),
            finished: false,
        })
    }

    /// Loads one entity row by identity, preferring the tracked copy.
    pub fn find_record_by_id(
        &self,
        entity: &str,
        id: i64,
        read_only: bool,
    ) -> RepoResult<Option<Record>> {
        if let Some(tracked) = self
            .session
            .with_context(|context| context.get(entity, id).cloned())
        {
            return Ok(Some(tracked));
        }
        let descriptor = self.session.catalog().resolve_entity(entity)?;
        let plan = QueryPlan::new(entity)
            .filter(Some(Predicate::eq(descriptor.id.name.as_str(), id)))
            .read_only(read_only);
        Ok(self.select_entities(&plan)?.into_iter().next())
    }

    /// Inserts one row; assigns identity (unless supplied) and the initial version.
    pub(crate) fn insert(&self, entity: &str, record: &Record) -> RepoResult<Record> {
        let descriptor = self.session.catalog().resolve_entity(entity)?;
        let deadline = self.deadline_for(None);
        let stored = self.session.write_scope(|| self.insert_row(descriptor, record, deadline))?;
        self.track(descriptor, &stored);
        Ok(stored)
    }

    /// Updates a persistent row, inserting it under its identity when absent.
    ///
    /// # Errors
    /// - `NotPersisted` when the record carries no identity.
    /// - `StaleState` when a versioned row was changed by someone else.
    pub(crate) fn merge(&self, entity: &str, record: &Record) -> RepoResult<Record> {
        let descriptor = self.session.catalog().resolve_entity(entity)?;
        let id = record
            .id(descriptor)
            .ok_or_else(|| RepoError::NotPersisted(entity.to_string()))?;

        let unchanged = self.session.with_context(|context| {
            context
                .get(entity, id)
                .is_some_and(|snapshot| snapshot.same_values(record))
        });
        if unchanged {
            debug!("event=entity_update module=executor status=skipped entity={entity} reason=unchanged");
            return Ok(record.clone());
        }

        let deadline = self.deadline_for(None);
        let stored = self
            .session
            .write_scope(|| self.update_row(descriptor, id, record, deadline))?;
        self.track(descriptor, &stored);
        Ok(stored)
    }

    /// Deletes one row by identity; returns whether a row was removed.
    pub(crate) fn delete(&self, entity: &str, id: i64, version: Option<i64>) -> RepoResult<bool> {
        let descriptor = self.session.catalog().resolve_entity(entity)?;
        let deadline = self.deadline_for(None);

        let mut sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            descriptor.table, descriptor.id.column
        );
        let mut binds = vec![SqlValue::Integer(id)];
        if let (Some(column), Some(version)) = (&descriptor.version, version) {
            sql.push_str(&format!(" AND {} = ?", column.column));
            binds.push(SqlValue::Integer(version));
        }
        let statement = SqlStatement {
            sql,
            binds,
            columns: Vec::new(),
        };

        let removed = self.session.write_scope(|| {
            let removed = self.run_update(StatementKind::Delete, &statement, deadline)?;
            if removed == 0 && version.is_some() && self.row_exists(descriptor, id)? {
                return Err(RepoError::StaleState {
                    entity: entity.to_string(),
                    id,
                });
            }
            Ok(removed > 0)
        })?;
        self.session
            .with_context(|context| context.evict(entity, id));
        Ok(removed)
    }

    fn page_with(
        &self,
        plan: &QueryPlan,
        select: impl Fn(&QueryPlan) -> RepoResult<Vec<Record>>,
    ) -> RepoResult<Page<Record>> {
        let request = plan
            .page
            .as_ref()
            .ok_or_else(|| RepoError::InvalidPage("plan carries no page request".to_string()))?
            .clamped(self.session.config().max_page_size);
        let mut paged = plan.clone();
        paged.page = Some(request.clone());

        let content = select(&paged)?;
        let size = u64::from(request.size());
        let len = content.len() as u64;
        let offset = request.offset();

        let total = if offset == 0 && len < size {
            len
        } else if len > 0 && len < size {
            offset + len
        } else {
            let mut counting = paged.clone();
            counting.page = None;
            self.count(&counting)?
        };
        let total = match plan.limit {
            Some(limit) => total.min(u64::from(limit)),
            None => total,
        };

        debug!(
            "event=page_query module=executor status=ok entity={} page={} size={} total={}",
            plan.entity,
            request.page(),
            request.size(),
            total
        );
        Ok(Page::new(content, &request, total))
    }

    fn select_entities(&self, plan: &QueryPlan) -> RepoResult<Vec<Record>> {
        let catalog = self.session.catalog();
        plan.check(catalog)?;
        self.check_lock(plan)?;
        let descriptor = catalog.resolve_entity(plan.entity.as_str())?;
        let statement = render_select(catalog, plan, Selection::Entity)?;
        let deadline = self.deadline_for(plan.deadline);
        let columns = statement.columns.clone();

        let rows = self.run_query(StatementKind::Select, &statement, plan.lock, deadline, |row| {
            map_row(row, &columns)
        })?;

        let records = self.attach_records(descriptor, rows, plan.lock, plan.read_only);
        debug!(
            "event=select module=executor status=ok entity={} rows={} lock={:?} read_only={}",
            plan.entity,
            records.len(),
            plan.lock,
            plan.read_only
        );
        Ok(records)
    }

    /// Resolves freshly read entity rows through the identity map.
    ///
    /// Outside a unit of work, or for read-only reads, rows pass through
    /// untouched. Optimistic reads register the version they saw.
    pub(crate) fn attach_records(
        &self,
        descriptor: &EntityDescriptor,
        rows: Vec<Record>,
        lock: LockMode,
        read_only: bool,
    ) -> Vec<Record> {
        if !self.session.in_transaction() {
            if lock == LockMode::Optimistic {
                debug!(
                    "event=optimistic_read module=executor status=skipped entity={} reason=no_unit_of_work",
                    descriptor.name
                );
            }
            return rows;
        }
        let entity = descriptor.name.as_str();
        let version_field = descriptor.version.as_ref().map(|field| field.name.as_str());

        let mut records = Vec::with_capacity(rows.len());
        for fresh in rows {
            let Some(id) = fresh.id(descriptor) else {
                records.push(fresh);
                continue;
            };
            if lock == LockMode::Optimistic {
                if let Some(version) = version_field
                    .and_then(|field| fresh.get(field))
                    .and_then(Value::as_i64)
                {
                    self.session
                        .with_context(|context| context.expect_version(entity, id, version));
                }
            }
            if read_only {
                records.push(fresh);
                continue;
            }
            let record = self.session.with_context(|context| match context.get(entity, id) {
                Some(tracked) => {
                    let mut tracked = tracked.clone();
                    for (relationship, nested) in fresh.nested_records() {
                        if tracked.nested(relationship).is_none() {
                            tracked.set_nested(relationship, nested.clone());
                        }
                    }
                    tracked
                }
                None => {
                    context.track(entity, id, fresh.clone());
                    fresh
                }
            });
            records.push(record);
        }
        records
    }

    fn select_projection(&self, plan: &QueryPlan, shape: &ProjectionShape) -> RepoResult<Vec<Record>> {
        let catalog = self.session.catalog();
        plan.check(catalog)?;
        shape.check(catalog, plan.entity.as_str())?;
        self.check_lock(plan)?;
        let statement = render_select(catalog, plan, Selection::Projection(shape))?;
        let deadline = self.deadline_for(plan.deadline);
        let columns = statement.columns.clone();
        let rows = self.run_query(StatementKind::Select, &statement, plan.lock, deadline, |row| {
            map_row(row, &columns)
        })?;
        debug!(
            "event=projection module=executor status=ok entity={} rows={} columns={} open={}",
            plan.entity,
            rows.len(),
            columns.len(),
            shape.open
        );
        Ok(rows)
    }

    fn check_lock(&self, plan: &QueryPlan) -> RepoResult<()> {
        self.require_lock_scope(plan.lock, plan.entity.as_str())
    }

    /// `PessimisticWrite` is only honoured inside a unit of work.
    pub(crate) fn require_lock_scope(&self, lock: LockMode, entity: &str) -> RepoResult<()> {
        if lock == LockMode::PessimisticWrite && !self.session.in_transaction() {
            warn!(
                "event=lock_rejected module=executor status=error entity={entity} lock=pessimistic_write"
            );
            return Err(RepoError::NoActiveTransaction);
        }
        Ok(())
    }

    fn insert_row(
        &self,
        descriptor: &EntityDescriptor,
        record: &Record,
        deadline: Option<Instant>,
    ) -> RepoResult<Record> {
        ensure_references_persisted(self.session.catalog(), descriptor, record)?;

        let mut stored = record.clone();
        if let Some(version) = &descriptor.version {
            stored.set(version.name.as_str(), 0);
        }

        let mut columns = Vec::new();
        let mut binds = Vec::new();
        let supplied_id = record.id(descriptor);
        if let Some(id) = supplied_id {
            columns.push(descriptor.id.column.clone());
            binds.push(SqlValue::Integer(id));
        }
        for field in descriptor.persistent_fields() {
            let value = stored.get(field.name.as_str()).cloned().unwrap_or(Value::Null);
            check_stored_value(&field, &value)?;
            columns.push(field.column.clone());
            binds.push(value.to_sql()?);
        }

        let statement = SqlStatement {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                descriptor.table,
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            ),
            binds,
            columns: Vec::new(),
        };
        self.run_update(StatementKind::Insert, &statement, deadline)?;

        let id = supplied_id.unwrap_or_else(|| self.session.connection().last_insert_rowid());
        stored.set(descriptor.id.name.as_str(), id);
        debug!(
            "event=entity_insert module=executor status=ok entity={} id={id}",
            descriptor.name
        );
        Ok(stored)
    }

    fn update_row(
        &self,
        descriptor: &EntityDescriptor,
        id: i64,
        record: &Record,
        deadline: Option<Instant>,
    ) -> RepoResult<Record> {
        ensure_references_persisted(self.session.catalog(), descriptor, record)?;

        let mut assignments = Vec::new();
        let mut binds = Vec::new();
        for field in descriptor.fields.iter().cloned().chain(
            descriptor
                .relationships
                .iter()
                .filter_map(|relationship| relationship.join_field()),
        ) {
            let value = record.get(field.name.as_str()).cloned().unwrap_or(Value::Null);
            check_stored_value(&field, &value)?;
            assignments.push(format!("{} = ?", field.column));
            binds.push(value.to_sql()?);
        }

        let mut stored = record.clone();
        let mut sql = format!("UPDATE {} SET ", descriptor.table);
        let expected_version = match &descriptor.version {
            Some(version) => {
                let current = record
                    .get(version.name.as_str())
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                assignments.push(format!("{0} = {0} + 1", version.column));
                stored.set(version.name.as_str(), current + 1);
                Some((version.column.clone(), current))
            }
            None => None,
        };
        sql.push_str(&assignments.join(", "));
        sql.push_str(&format!(" WHERE {} = ?", descriptor.id.column));
        binds.push(SqlValue::Integer(id));
        if let Some((column, current)) = &expected_version {
            sql.push_str(&format!(" AND {column} = ?"));
            binds.push(SqlValue::Integer(*current));
        }

        let statement = SqlStatement {
            sql,
            binds,
            columns: Vec::new(),
        };
        let changed = self.run_update(StatementKind::Update, &statement, deadline)?;
        if changed == 0 {
            if expected_version.is_some() && self.row_exists(descriptor, id)? {
                warn!(
                    "event=entity_update module=executor status=error entity={} id={id} error_code=stale_state",
                    descriptor.name
                );
                return Err(RepoError::StaleState {
                    entity: descriptor.name.clone(),
                    id,
                });
            }
            return self.insert_row(descriptor, record, deadline);
        }

        if let Some((_, current)) = expected_version {
            self.session.with_context(|context| {
                context.advance_version(descriptor.name.as_str(), id, current + 1)
            });
        }
        debug!(
            "event=entity_update module=executor status=ok entity={} id={id}",
            descriptor.name
        );
        Ok(stored)
    }

    fn row_exists(&self, descriptor: &EntityDescriptor, id: i64) -> RepoResult<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE {} = ?1",
            descriptor.table, descriptor.id.column
        );
        let found = self
            .session
            .connection()
            .query_row(&sql, [id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn track(&self, descriptor: &EntityDescriptor, record: &Record) {
        if !self.session.in_transaction() {
            return;
        }
        if let Some(id) = record.id(descriptor) {
            self.session.with_context(|context| {
                context.track(descriptor.name.as_str(), id, record.clone())
            });
        }
    }

    fn deadline_for(&self, plan_deadline: Option<Instant>) -> Option<Instant> {
        match (plan_deadline, self.session.call_deadline()) {
            (Some(left), Some(right)) => Some(left.min(right)),
            (left, right) => left.or(right),
        }
    }

    fn run_query<T>(
        &self,
        kind: StatementKind,
        statement: &SqlStatement,
        lock: LockMode,
        deadline: Option<Instant>,
        mut map: impl FnMut(&Row<'_>) -> RepoResult<T>,
    ) -> RepoResult<Vec<T>> {
        self.session.check_deadline(deadline)?;
        self.trace(kind, statement, lock);

        let conn = self.session.connection();
        let mut stmt = conn.prepare(&statement.sql)?;
        let mut rows = stmt.query(params_from_iter(statement.binds.iter()))?;
        let mut mapped = Vec::new();
        while let Some(row) = rows.next()? {
            mapped.push(map(row)?);
        }
        Ok(mapped)
    }

    fn run_named_columns(
        &self,
        statement: &SqlStatement,
        deadline: Option<Instant>,
    ) -> RepoResult<Vec<Record>> {
        self.session.check_deadline(deadline)?;
        let conn = self.session.connection();
        let mut stmt = conn.prepare(&statement.sql)?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        self.session.record_statement(StatementTrace {
            kind: StatementKind::Explicit,
            sql: statement.sql.clone(),
            columns: names.clone(),
            lock: LockMode::None,
        });

        let mut rows = stmt.query(params_from_iter(statement.binds.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (index, name) in names.iter().enumerate() {
                let value = Value::from_sql_untyped(row.get::<_, SqlValue>(index)?)?;
                record.set(name.as_str(), value);
            }
            records.push(record);
        }
        Ok(records)
    }

    fn run_update(
        &self,
        kind: StatementKind,
        statement: &SqlStatement,
        deadline: Option<Instant>,
    ) -> RepoResult<usize> {
        self.session.check_deadline(deadline)?;
        self.trace(kind, statement, LockMode::None);
        let changed = self
            .session
            .connection()
            .execute(&statement.sql, params_from_iter(statement.binds.iter()))?;
        Ok(changed)
    }

    fn trace(&self, kind: StatementKind, statement: &SqlStatement, lock: LockMode) {
        let columns: Vec<String> = statement.columns.iter().map(column_path).collect();
        debug!(
            "event=statement module=executor status=start kind={kind:?} binds={} columns={}",
            statement.binds.len(),
            columns.len()
        );
        self.session.record_statement(StatementTrace {
            kind,
            sql: statement.sql.clone(),
            columns,
            lock,
        });
    }
}

/// Iterator over entity rows fetched `fetch_size` at a time.
pub struct RecordStream<'s, 'conn> {
    executor: QueryExecutor<'s, 'conn>,
    plan: QueryPlan,
    chunk_size: u32,
    next_chunk: u32,
    buffer: VecDeque<Record>,
    finished: bool,
}

impl RecordStream<'_, '_> {
    fn fill(&mut self) -> RepoResult<()> {
        let request =
            PageRequest::of(self.next_chunk, self.chunk_size)?.with_sort(self.plan.sort.clone());
        if let Some(limit) = self.plan.limit {
            if request.offset() >= u64::from(limit) {
                self.finished = true;
                return Ok(());
            }
        }
        let mut chunk_plan = self.plan.clone();
        chunk_plan.page = Some(request);
        let chunk = self.executor.select_entities(&chunk_plan)?;
        if chunk.len() < self.chunk_size as usize {
            self.finished = true;
        }
        self.next_chunk += 1;
        self.buffer.extend(chunk);
        Ok(())
    }
}

impl Iterator for RecordStream<'_, '_> {
    type Item = RepoResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.finished {
            if let Err(err) = self.fill() {
                self.finished = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Maps backend failures onto the engine's error taxonomy.
///
/// | SQLite code | `RepoError` |
/// |---|---|
/// | `DatabaseBusy`, `DatabaseLocked`, `OperationInterrupted` | `Timeout` |
/// | `ConstraintViolation` | `Integrity` |
/// | anything else | `Db` |
pub(crate) fn translate_backend_error(err: rusqlite::Error) -> RepoError {
    let translated = match &err {
        rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::OperationInterrupted => {
                Some(RepoError::Timeout(err.to_string()))
            }
            ErrorCode::ConstraintViolation => Some(RepoError::Integrity(
                message.clone().unwrap_or_else(|| err.to_string()),
            )),
            _ => None,
        },
        _ => None,
    };
    match translated {
        Some(translated) => {
            warn!(
                "event=backend_error module=executor status=error translated={}",
                error_label(&translated)
            );
            translated
        }
        None => RepoError::Db(DbError::Sqlite(err)),
    }
}

fn error_label(err: &RepoError) -> &'static str {
    match err {
        RepoError::Timeout(_) => "timeout",
        RepoError::Integrity(_) => "integrity",
        _ => "other",
    }
}

fn map_row(row: &Row<'_>, columns: &[SelectedColumn]) -> RepoResult<Record> {
    let mut record = Record::new();
    let mut nested: BTreeMap<&str, Record> = BTreeMap::new();
    for (index, column) in columns.iter().enumerate() {
        let value = Value::from_sql(row.get::<_, SqlValue>(index)?, column.field.field_type)?;
        match &column.relationship {
            None => record.set(column.field.name.as_str(), value),
            Some(relationship) => nested
                .entry(relationship.as_str())
                .or_default()
                .set(column.field.name.as_str(), value),
        }
    }
    for (relationship, related) in nested {
        // A left join without a match yields an all-null related row.
        if related.values().all(|(_, value)| value.is_null()) {
            continue;
        }
        record.set_nested(relationship, related);
    }
    Ok(record)
}

fn column_path(column: &SelectedColumn) -> String {
    match &column.relationship {
        Some(relationship) => format!("{relationship}.{}", column.field.name),
        None => column.field.name.clone(),
    }
}

fn check_stored_value(field: &FieldDescriptor, value: &Value) -> RepoResult<()> {
    if value.is_null() {
        return Ok(());
    }
    check_operand(field.name.as_str(), field, CompareOp::Equals, value)
}

fn ensure_references_persisted(
    catalog: &EntityCatalog,
    descriptor: &EntityDescriptor,
    record: &Record,
) -> RepoResult<()> {
    for relationship in descriptor.relationships.iter().filter(|r| r.is_owning()) {
        let Some(nested) = record.nested(relationship.name.as_str()) else {
            continue;
        };
        let target = catalog.resolve_entity(relationship.target.as_str())?;
        if nested.id(target).is_none() {
            warn!(
                "event=entity_write module=executor status=error entity={} relationship={} error_code=not_persisted",
                descriptor.name, relationship.name
            );
            return Err(RepoError::NotPersisted(relationship.target.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{translate_backend_error, QueryExecutor};
    use crate::catalog::{EntityCatalog, EntityDescriptor};
    use crate::config::EngineConfig;
    use crate::entity::Record;
    use crate::repo::error::RepoError;
    use crate::session::Session;
    use crate::value::{FieldType, Value};
    use rusqlite::ffi;
    use rusqlite::Connection;
    use std::sync::Arc;

    fn squad_catalog() -> Arc<EntityCatalog> {
        let mut catalog = EntityCatalog::new();
        catalog
            .register(
                EntityDescriptor::builder("Squad", "squads")
                    .id("squad_pk")
                    .field("name", FieldType::Text)
                    .build(),
            )
            .unwrap();
        catalog
            .register(
                EntityDescriptor::builder("Player", "players")
                    .field("nick", FieldType::Text)
                    .many_to_one("squad", "Squad", "squad_id")
                    .build(),
            )
            .unwrap();
        catalog.validate().unwrap();
        Arc::new(catalog)
    }

    #[test]
    fn loaded_reference_is_checked_against_target_identity_name() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE squads (squad_pk INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE players (
                 id INTEGER PRIMARY KEY,
                 nick TEXT NOT NULL,
                 squad_id INTEGER NULL REFERENCES squads(squad_pk)
             );",
        )
        .unwrap();
        let session = Session::new(&conn, squad_catalog(), &EngineConfig::default());
        let executor = QueryExecutor::new(&session);

        let squad = executor.insert("Squad", &Record::new().with("name", "red")).unwrap();
        let squad_pk = squad.get("squad_pk").and_then(Value::as_i64).unwrap();

        let mut player = Record::new().with("nick", "p1").with("squad", squad_pk);
        player.set_nested("squad", squad);
        let stored = executor.insert("Player", &player).unwrap();
        assert_eq!(stored.get("squad"), Some(&Value::Integer(squad_pk)));

        let mut orphan = Record::new().with("nick", "p2");
        orphan.set_nested("squad", Record::new().with("name", "blue"));
        let err = executor.insert("Player", &orphan).unwrap_err();
        assert!(matches!(err, RepoError::NotPersisted(target) if target == "Squad"));
    }

    #[test]
    fn busy_and_locked_map_to_timeout() {
        let busy = rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_BUSY), None);
        assert!(matches!(translate_backend_error(busy), RepoError::Timeout(_)));
        let locked = rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_LOCKED), None);
        assert!(matches!(translate_backend_error(locked), RepoError::Timeout(_)));
    }

    #[test]
    fn constraint_violations_map_to_integrity() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER NOT NULL);").unwrap();
        let err = conn
            .execute("INSERT INTO t (v) VALUES (NULL)", [])
            .unwrap_err();
        assert!(matches!(translate_backend_error(err), RepoError::Integrity(_)));
    }

    #[test]
    fn other_failures_stay_backend_errors() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn.execute("SELECT * FROM missing", []).unwrap_err();
        assert!(matches!(translate_backend_error(err), RepoError::Db(_)));
    }
}
