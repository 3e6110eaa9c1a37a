//! Sessions, units of work and the persistence context.
//!
//! # Responsibility
//! - Carry the connection, catalog and config through every repository call.
//! - Scope transactions explicitly: `Session::begin()` returns a `UnitOfWork`
//!   that rolls back unless committed.
//! - Track entities read or written inside a unit of work (identity map plus
//!   snapshots) and the optimistic-lock versions to re-check at commit.
//!
//! # Invariants
//! - At most one unit of work is open per session.
//! - The persistence context is empty whenever no unit of work is open.
//! - A unit of work ends exactly once: commit, rollback or drop.

use crate::catalog::EntityCatalog;
use crate::config::EngineConfig;
use crate::entity::Record;
use crate::query::plan::LockMode;
use crate::repo::error::{RepoError, RepoResult};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Count,
    Exists,
    Insert,
    Update,
    Delete,
    BulkUpdate,
    Explicit,
}

/// Diagnostic record of one executed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementTrace {
    pub kind: StatementKind,
    pub sql: String,
    /// Selected field paths (`username`, `team.name`), empty for writes.
    pub columns: Vec<String>,
    pub lock: LockMode,
}

type EntityKey = (String, i64);

/// Identity map of the open unit of work.
#[derive(Debug, Default)]
pub(crate) struct PersistenceContext {
    snapshots: HashMap<EntityKey, Record>,
    optimistic: HashMap<EntityKey, i64>,
}

impl PersistenceContext {
    pub(crate) fn get(&self, entity: &str, id: i64) -> Option<&Record> {
        self.snapshots.get(&(entity.to_string(), id))
    }

    pub(crate) fn track(&mut self, entity: &str, id: i64, record: Record) {
        self.snapshots.insert((entity.to_string(), id), record);
    }

    pub(crate) fn evict(&mut self, entity: &str, id: i64) {
        let key = (entity.to_string(), id);
        self.snapshots.remove(&key);
        self.optimistic.remove(&key);
    }

    /// Remembers the version seen by an optimistic read; the first read wins.
    pub(crate) fn expect_version(&mut self, entity: &str, id: i64, version: i64) {
        self.optimistic
            .entry((entity.to_string(), id))
            .or_insert(version);
    }

    /// Moves the expectation forward after this unit's own versioned write.
    pub(crate) fn advance_version(&mut self, entity: &str, id: i64, version: i64) {
        if let Some(expected) = self.optimistic.get_mut(&(entity.to_string(), id)) {
            *expected = version;
        }
    }

    fn clear(&mut self) {
        self.snapshots.clear();
        self.optimistic.clear();
    }

    fn clear_snapshots(&mut self) {
        self.snapshots.clear();
    }

    fn len(&self) -> usize {
        self.snapshots.len()
    }
}

/// Explicit session handle passed to repositories and the executor.
pub struct Session<'conn> {
    conn: &'conn Connection,
    catalog: Arc<EntityCatalog>,
    config: EngineConfig,
    context: RefCell<PersistenceContext>,
    unit: RefCell<Option<Uuid>>,
    deadline: Cell<Option<Instant>>,
    statements: RefCell<Vec<StatementTrace>>,
}

impl<'conn> Session<'conn> {
    pub fn new(conn: &'conn Connection, catalog: Arc<EntityCatalog>, config: &EngineConfig) -> Self {
        Self {
            conn,
            catalog,
            config: config.clone(),
            context: RefCell::new(PersistenceContext::default()),
            unit: RefCell::new(None),
            deadline: Cell::new(None),
            statements: RefCell::new(Vec::new()),
        }
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn connection(&self) -> &'conn Connection {
        self.conn
    }

    pub fn in_transaction(&self) -> bool {
        self.unit.borrow().is_some()
    }

    /// Opens a unit of work with `BEGIN IMMEDIATE`.
    ///
    /// # Errors
    /// - `InvalidQuery` when a unit of work is already open on this session.
    /// - `Timeout` when another connection holds the write lock past the busy timeout.
    pub fn begin(&self) -> RepoResult<UnitOfWork<'_, 'conn>> {
        if self.in_transaction() {
            return Err(RepoError::InvalidQuery(
                "a unit of work is already open on this session".to_string(),
            ));
        }
        self.check_deadline(self.call_deadline())?;

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let id = Uuid::new_v4();
        *self.unit.borrow_mut() = Some(id);
        info!("event=uow_begin module=session status=ok unit_id={id}");
        Ok(UnitOfWork {
            session: self,
            tx: Some(tx),
            id,
        })
    }

    /// Deadline applied to every later statement; `None` clears it.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.deadline.set(deadline);
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.deadline.set(Some(Instant::now() + timeout));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.get()
    }

    /// Earliest of the session deadline and the configured per-call budget.
    pub(crate) fn call_deadline(&self) -> Option<Instant> {
        let budget = self
            .config
            .query_timeout()
            .map(|timeout| Instant::now() + timeout);
        match (self.deadline.get(), budget) {
            (Some(left), Some(right)) => Some(left.min(right)),
            (left, right) => left.or(right),
        }
    }

    pub(crate) fn check_deadline(&self, deadline: Option<Instant>) -> RepoResult<()> {
        match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                warn!("event=deadline_exceeded module=session status=error");
                Err(RepoError::Timeout("deadline exceeded before statement".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Drops every tracked entity. Required after bulk updates when later
    /// reads must observe the new column values.
    ///
    /// Versions recorded by optimistic reads are kept and still verified
    /// when the unit of work commits.
    pub fn clear(&self) {
        let mut context = self.context.borrow_mut();
        if context.len() > 0 {
            debug!(
                "event=context_clear module=session status=ok evicted={}",
                context.len()
            );
        }
        context.clear_snapshots();
    }

    pub fn is_tracked(&self, entity: &str, id: i64) -> bool {
        self.context.borrow().get(entity, id).is_some()
    }

    pub fn tracked_count(&self) -> usize {
        self.context.borrow().len()
    }

    pub(crate) fn with_context<T>(&self, f: impl FnOnce(&mut PersistenceContext) -> T) -> T {
        f(&mut self.context.borrow_mut())
    }

    pub(crate) fn record_statement(&self, trace: StatementTrace) {
        self.statements.borrow_mut().push(trace);
    }

    /// Every statement executed through this session, oldest first.
    pub fn statements(&self) -> Vec<StatementTrace> {
        self.statements.borrow().clone()
    }

    pub fn last_statement(&self) -> Option<StatementTrace> {
        self.statements.borrow().last().cloned()
    }

    pub fn clear_statements(&self) {
        self.statements.borrow_mut().clear();
    }

    /// Runs `work` inside the open unit of work, or in a per-call transaction.
    /// Nested scopes join the enclosing transaction.
    pub(crate) fn write_scope<T>(&self, work: impl FnOnce() -> RepoResult<T>) -> RepoResult<T> {
        if self.in_transaction() || !self.conn.is_autocommit() {
            return work();
        }
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let value = work()?;
        tx.commit()?;
        Ok(value)
    }

    fn verify_optimistic(&self) -> RepoResult<()> {
        let expectations: Vec<(EntityKey, i64)> = self
            .context
            .borrow()
            .optimistic
            .iter()
            .map(|(key, version)| (key.clone(), *version))
            .collect();

        for ((entity, id), expected) in expectations {
            let descriptor = self.catalog.resolve_entity(entity.as_str())?;
            let Some(version) = &descriptor.version else {
                continue;
            };
            let sql = format!(
                "SELECT {} FROM {} WHERE {} = ?1",
                version.column, descriptor.table, descriptor.id.column
            );
            let current: Option<i64> = self
                .conn
                .query_row(&sql, params![id], |row| row.get(0))
                .optional()?;
            if current != Some(expected) {
                warn!(
                    "event=optimistic_check module=session status=error entity={entity} id={id} expected={expected}"
                );
                return Err(RepoError::StaleState { entity, id });
            }
        }
        Ok(())
    }

    fn end_unit(&self) {
        self.context.borrow_mut().clear();
        *self.unit.borrow_mut() = None;
    }
}

/// Transactional scope over a session; rolls back on drop unless committed.
pub struct UnitOfWork<'s, 'conn> {
    session: &'s Session<'conn>,
    tx: Option<Transaction<'conn>>,
    id: Uuid,
}

impl<'s, 'conn> UnitOfWork<'s, 'conn> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session(&self) -> &'s Session<'conn> {
        self.session
    }

    /// Re-checks optimistic versions, then commits.
    ///
    /// # Errors
    /// - `StaleState` when a version read under `LockMode::Optimistic` changed;
    ///   the whole unit is rolled back.
    pub fn commit(mut self) -> RepoResult<()> {
        self.session.verify_optimistic()?;
        let Some(tx) = self.tx.take() else {
            return Err(RepoError::NoActiveTransaction);
        };
        let result = tx.commit().map_err(RepoError::from);
        self.session.end_unit();
        match &result {
            Ok(()) => info!("event=uow_commit module=session status=ok unit_id={}", self.id),
            Err(err) => warn!(
                "event=uow_commit module=session status=error unit_id={} error={err}",
                self.id
            ),
        }
        result
    }

    pub fn rollback(mut self) -> RepoResult<()> {
        let Some(tx) = self.tx.take() else {
            return Err(RepoError::NoActiveTransaction);
        };
        let result = tx.rollback().map_err(RepoError::from);
        self.session.end_unit();
        info!("event=uow_rollback module=session status=ok unit_id={}", self.id);
        result
    }
}

impl Drop for UnitOfWork<'_, '_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(err) = tx.rollback() {
                warn!(
                    "event=uow_rollback module=session status=error unit_id={} error={err}",
                    self.id
                );
            } else {
                info!(
                    "event=uow_rollback module=session status=ok unit_id={} reason=dropped",
                    self.id
                );
            }
            self.session.end_unit();
        }
    }
}
