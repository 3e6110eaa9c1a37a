//! Typed repository facade bound to one session.
//!
//! # Responsibility
//! - Offer CRUD, criteria finders and registered query methods for entity `E`.
//! - Convert between typed entities and executor records.
//!
//! # Invariants
//! - Single-entity lookups report absence as `Ok(None)`.
//! - Registered methods are looked up, never derived, at call time.

use crate::catalog::{Cardinality, EntityDescriptor};
use crate::entity::{Entity, FromRecord, Record};
use crate::executor::{ExplicitOutput, QueryExecutor, RecordStream};
use crate::query::derive::{CompiledQuery, DerivedQuery, Subject};
use crate::query::plan::{BulkOptions, Mutation, Page, PageRequest, ProjectionShape, QueryPlan, Sort};
use crate::query::predicate::Predicate;
use crate::query::spec::Criteria;
use crate::repo::definition::{CompiledBody, CompiledMethod, RepositoryDefinition};
use crate::repo::error::{RepoError, RepoResult};
use crate::session::Session;
use crate::value::{FromValue, Value};
use log::debug;
use std::marker::PhantomData;

/// Result of an ad hoc derived query, shaped by its subject.
#[derive(Debug, Clone, PartialEq)]
pub enum DerivedOutput<E> {
    List(Vec<E>),
    Count(u64),
    Exists(bool),
}

/// Typed view over a [`RecordStream`].
pub struct EntityStream<'s, 'conn, E> {
    records: RecordStream<'s, 'conn>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Iterator for EntityStream<'_, '_, E> {
    type Item = RepoResult<E>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records
            .next()
            .map(|record| record.and_then(|record| E::from_record(&record)))
    }
}

/// Repository for entity `E`, valid while its session lives.
pub struct Repository<'s, 'conn, E> {
    definition: &'s RepositoryDefinition<E>,
    session: &'s Session<'conn>,
}

impl<'s, 'conn, E: Entity> Repository<'s, 'conn, E> {
    pub(crate) fn new(definition: &'s RepositoryDefinition<E>, session: &'s Session<'conn>) -> Self {
        Self {
            definition,
            session,
        }
    }

    pub fn session(&self) -> &'s Session<'conn> {
        self.session
    }

    pub fn executor(&self) -> QueryExecutor<'s, 'conn> {
        QueryExecutor::new(self.session)
    }

    fn descriptor(&self) -> RepoResult<&EntityDescriptor> {
        self.session.catalog().resolve_entity(E::NAME)
    }

    /// Inserts a transient entity or merges a persistent one.
    ///
    /// Returns the stored state with identity and version assigned.
    pub fn save(&self, entity: &E) -> RepoResult<E> {
        let record = entity.to_record();
        let stored = if entity.is_transient() {
            self.executor().insert(E::NAME, &record)?
        } else {
            self.executor().merge(E::NAME, &record)?
        };
        E::from_record(&stored)
    }

    /// Saves every entity in one transaction.
    pub fn save_all(&self, entities: &[E]) -> RepoResult<Vec<E>> {
        self.session
            .write_scope(|| entities.iter().map(|entity| self.save(entity)).collect())
    }

    pub fn find_by_id(&self, id: i64) -> RepoResult<Option<E>> {
        self.executor()
            .find_record_by_id(E::NAME, id, false)?
            .map(|record| E::from_record(&record))
            .transpose()
    }

    pub fn exists_by_id(&self, id: i64) -> RepoResult<bool> {
        let descriptor = self.descriptor()?;
        let plan = self.plan(Some(Predicate::eq(descriptor.id.name.as_str(), id)));
        self.executor().exists(&plan)
    }

    pub fn find_all(&self) -> RepoResult<Vec<E>> {
        self.find_all_by(Criteria::All, Sort::unsorted())
    }

    pub fn find_all_sorted(&self, sort: Sort) -> RepoResult<Vec<E>> {
        self.find_all_by(Criteria::All, sort)
    }

    pub fn find_all_page(&self, page: PageRequest) -> RepoResult<Page<E>> {
        self.find_page_by(Criteria::All, page)
    }

    /// Rows matching a predicate, specification or example.
    pub fn find_all_by(&self, criteria: Criteria<E>, sort: Sort) -> RepoResult<Vec<E>> {
        let predicate = criteria.to_predicate(self.session.catalog())?;
        let plan = self.plan(predicate).sorted(sort);
        to_entities(self.executor().fetch(&plan)?)
    }

    pub fn find_page_by(&self, criteria: Criteria<E>, page: PageRequest) -> RepoResult<Page<E>> {
        let predicate = criteria.to_predicate(self.session.catalog())?;
        let plan = self.plan(predicate).paged(page);
        self.executor()
            .execute_page(&plan)?
            .try_map(|record| E::from_record(&record))
    }

    pub fn count(&self) -> RepoResult<u64> {
        self.count_matching(Criteria::All)
    }

    pub fn count_matching(&self, criteria: Criteria<E>) -> RepoResult<u64> {
        let predicate = criteria.to_predicate(self.session.catalog())?;
        self.executor().count(&self.plan(predicate))
    }

    /// Deletes a persistent entity, checking its version when it has one.
    ///
    /// # Errors
    /// - `NotPersisted` for a transient entity.
    /// - `StaleState` when the stored version moved.
    pub fn delete(&self, entity: &E) -> RepoResult<()> {
        let id = entity
            .id()
            .ok_or_else(|| RepoError::NotPersisted(E::NAME.to_string()))?;
        self.executor().delete(E::NAME, id, entity.version())?;
        Ok(())
    }

    /// Returns whether a row was removed; a missing row is not an error.
    pub fn delete_by_id(&self, id: i64) -> RepoResult<bool> {
        self.executor().delete(E::NAME, id, None)
    }

    /// Runs a registered finder returning every match (empty when none).
    pub fn find_list(&self, method: &str, args: &[Value]) -> RepoResult<Vec<E>> {
        let registered = self.definition.method(method)?;
        match &registered.body {
            CompiledBody::Derived(query) => {
                let plan = self.method_plan(registered, query, args)?;
                to_entities(self.executor().fetch(&plan)?)
            }
            CompiledBody::Explicit(_) => {
                let rows = self.explicit_rows(registered, args)?;
                let descriptor = self.descriptor()?;
                let records = rows
                    .iter()
                    .map(|row| record_from_columns(descriptor, row))
                    .collect::<RepoResult<Vec<_>>>()?;
                let attached = self.executor().attach_records(
                    descriptor,
                    records,
                    registered.lock,
                    registered.read_only,
                );
                to_entities(attached)
            }
            CompiledBody::Modifying(_) => Err(not_a_finder(registered)),
        }
    }

    /// Runs a registered finder expecting at most one match.
    ///
    /// # Errors
    /// - `NonUniqueResult` when more than one row matches.
    pub fn find_one(&self, method: &str, args: &[Value]) -> RepoResult<Option<E>> {
        let mut found = self.find_list(method, args)?;
        if found.len() > 1 {
            return Err(RepoError::NonUniqueResult {
                method: method.to_string(),
                count: found.len(),
            });
        }
        Ok(found.pop())
    }

    /// Runs a registered derived finder one page at a time.
    pub fn find_page(&self, method: &str, args: &[Value], page: PageRequest) -> RepoResult<Page<E>> {
        let registered = self.definition.method(method)?;
        let query = derived_body(registered)?;
        let plan = self.method_plan(registered, query, args)?.paged(page);
        self.executor()
            .execute_page(&plan)?
            .try_map(|record| E::from_record(&record))
    }

    /// Runs a registered derived finder into projection `P` chosen per call.
    pub fn find_projected<P: FromRecord>(
        &self,
        method: &str,
        args: &[Value],
        shape: &ProjectionShape,
    ) -> RepoResult<Vec<P>> {
        let registered = self.definition.method(method)?;
        let query = derived_body(registered)?;
        let plan = self.method_plan(registered, query, args)?;
        self.executor()
            .execute_projection(&plan, shape)?
            .iter()
            .map(P::from_record)
            .collect()
    }

    /// Runs a registered explicit query into DTO rows keyed by column name.
    pub fn query<D: FromRecord>(&self, method: &str, args: &[Value]) -> RepoResult<Vec<D>> {
        let registered = self.definition.method(method)?;
        self.explicit_rows(registered, args)?
            .iter()
            .map(D::from_record)
            .collect()
    }

    /// Runs a registered single-column explicit query.
    ///
    /// # Errors
    /// - `InvalidQuery` when a row carries more than one column.
    /// - `InvalidData` when a value does not convert to `T`.
    pub fn query_scalars<T: FromValue>(&self, method: &str, args: &[Value]) -> RepoResult<Vec<T>> {
        let registered = self.definition.method(method)?;
        let mut scalars = Vec::new();
        for row in self.explicit_rows(registered, args)? {
            let mut values = row.values();
            let (Some((column, value)), None) = (values.next(), values.next()) else {
                return Err(RepoError::InvalidQuery(format!(
                    "query method `{method}` must select exactly one column"
                )));
            };
            let scalar = T::from_value(value).ok_or_else(|| {
                RepoError::InvalidData(format!(
                    "column `{column}` holds unexpected {} value",
                    value.kind()
                ))
            })?;
            scalars.push(scalar);
        }
        Ok(scalars)
    }

    pub fn count_by(&self, method: &str, args: &[Value]) -> RepoResult<u64> {
        let registered = self.definition.method(method)?;
        let query = derived_body(registered)?;
        let plan = self.method_plan(registered, query, args)?;
        self.executor().count(&plan)
    }

    pub fn exists_by(&self, method: &str, args: &[Value]) -> RepoResult<bool> {
        let registered = self.definition.method(method)?;
        let query = derived_body(registered)?;
        let plan = self.method_plan(registered, query, args)?;
        self.executor().exists(&plan)
    }

    /// Lazily iterates a registered derived finder in `fetch_size` chunks.
    pub fn stream(&self, method: &str, args: &[Value]) -> RepoResult<EntityStream<'s, 'conn, E>> {
        let registered = self.definition.method(method)?;
        let query = derived_body(registered)?;
        let plan = self.method_plan(registered, query, args)?;
        Ok(EntityStream {
            records: self.executor().stream(&plan)?,
            _entity: PhantomData,
        })
    }

    /// Compiles and runs a builder-form query that was not registered.
    pub fn derive_query(&self, query: &DerivedQuery, args: &[Value]) -> RepoResult<DerivedOutput<E>> {
        let compiled = query.compile("derive_query", self.session.catalog(), E::NAME)?;
        let plan = QueryPlan::new(E::NAME)
            .filter(compiled.bind(args)?)
            .sorted(compiled.sort.clone())
            .limited(compiled.limit);
        let plan = QueryPlan {
            distinct: compiled.distinct,
            ..plan
        };
        Ok(match compiled.subject {
            Subject::Find => DerivedOutput::List(to_entities(self.executor().fetch(&plan)?)?),
            Subject::Count => DerivedOutput::Count(self.executor().count(&plan)?),
            Subject::Exists => DerivedOutput::Exists(self.executor().exists(&plan)?),
        })
    }

    /// Set-based update of every row matching `criteria`.
    ///
    /// Entities already tracked by the session keep their old values unless
    /// `options.clear_context` is set or the caller clears the session.
    pub fn execute_bulk(
        &self,
        criteria: Criteria<E>,
        mutation: &Mutation,
        options: BulkOptions,
    ) -> RepoResult<usize> {
        let predicate = criteria.to_predicate(self.session.catalog())?;
        self.executor()
            .execute_bulk(&self.plan(predicate), mutation, options)
    }

    /// Runs a registered modifying statement; returns the affected row count.
    pub fn execute_modifying(&self, method: &str, args: &[Value]) -> RepoResult<usize> {
        let registered = self.definition.method(method)?;
        let CompiledBody::Modifying(sql) = &registered.body else {
            return Err(RepoError::InvalidQuery(format!(
                "query method `{method}` is not a modifying statement"
            )));
        };
        let options = BulkOptions {
            clear_context: registered.clear_automatically,
        };
        match self.executor().run_explicit(method, sql, args, options)? {
            ExplicitOutput::Affected(affected) => Ok(affected),
            ExplicitOutput::Rows(rows) => Ok(rows.len()),
        }
    }

    /// Loads entities of `T` related to `entity` through `relationship`.
    ///
    /// To-one relationships yield zero or one entity; inverse relationships
    /// yield every row whose owning reference points at `entity`.
    pub fn find_related<T: Entity>(&self, entity: &E, relationship: &str) -> RepoResult<Vec<T>> {
        let catalog = self.session.catalog();
        let resolved = catalog.resolve_relationship(E::NAME, relationship)?;
        if resolved.target != T::NAME {
            return Err(RepoError::InvalidQuery(format!(
                "`{}.{relationship}` targets `{}`, not `{}`",
                E::NAME,
                resolved.target,
                T::NAME
            )));
        }

        let records = match resolved.cardinality {
            Cardinality::ManyToOne => {
                let Some(related_id) = entity
                    .to_record()
                    .get(relationship)
                    .and_then(Value::as_i64)
                else {
                    return Ok(Vec::new());
                };
                self.executor()
                    .find_record_by_id(T::NAME, related_id, false)?
                    .into_iter()
                    .collect()
            }
            Cardinality::OneToMany => {
                let id = entity
                    .id()
                    .ok_or_else(|| RepoError::NotPersisted(E::NAME.to_string()))?;
                let mapped_by = resolved.mapped_by.as_deref().ok_or_else(|| {
                    RepoError::InvalidCatalog(format!(
                        "`{}.{relationship}` has no owning side",
                        E::NAME
                    ))
                })?;
                let plan = QueryPlan::new(T::NAME).filter(Some(Predicate::eq(mapped_by, id)));
                self.executor().fetch(&plan)?
            }
        };
        debug!(
            "event=find_related module=repo status=ok entity={} relationship={relationship} rows={}",
            E::NAME,
            records.len()
        );
        records.iter().map(T::from_record).collect()
    }

    fn plan(&self, predicate: Option<Predicate>) -> QueryPlan {
        QueryPlan::new(E::NAME).filter(predicate)
    }

    fn method_plan(
        &self,
        registered: &CompiledMethod,
        query: &CompiledQuery,
        args: &[Value],
    ) -> RepoResult<QueryPlan> {
        let mut plan = QueryPlan::new(E::NAME)
            .filter(query.bind(args)?)
            .sorted(query.sort.clone())
            .limited(query.limit)
            .locked(registered.lock)
            .read_only(registered.read_only);
        plan.distinct = query.distinct;
        for relationship in &registered.fetch {
            plan = plan.fetching(relationship);
        }
        Ok(plan)
    }

    fn explicit_rows(&self, registered: &CompiledMethod, args: &[Value]) -> RepoResult<Vec<Record>> {
        let CompiledBody::Explicit(sql) = &registered.body else {
            return Err(RepoError::InvalidQuery(format!(
                "query method `{}` is not an explicit select",
                registered.name
            )));
        };
        self.executor().require_lock_scope(registered.lock, E::NAME)?;
        match self.executor().run_explicit(
            registered.name.as_str(),
            sql,
            args,
            BulkOptions::default(),
        )? {
            ExplicitOutput::Rows(rows) => Ok(rows),
            ExplicitOutput::Affected(_) => Err(RepoError::InvalidQuery(format!(
                "query method `{}` does not return rows",
                registered.name
            ))),
        }
    }
}

fn derived_body(registered: &CompiledMethod) -> RepoResult<&CompiledQuery> {
    match &registered.body {
        CompiledBody::Derived(query) => Ok(query),
        _ => Err(RepoError::InvalidQuery(format!(
            "query method `{}` is {}, not derived",
            registered.name,
            registered.kind()
        ))),
    }
}

fn not_a_finder(registered: &CompiledMethod) -> RepoError {
    RepoError::InvalidQuery(format!(
        "query method `{}` is a modifying statement; use execute_modifying",
        registered.name
    ))
}

fn to_entities<E: FromRecord>(records: Vec<Record>) -> RepoResult<Vec<E>> {
    records.iter().map(E::from_record).collect()
}

/// Re-keys an explicit result row from column names to field names.
fn record_from_columns(descriptor: &EntityDescriptor, row: &Record) -> RepoResult<Record> {
    let mut record = Record::new();
    for (column, value) in row.values() {
        let Some(field) = descriptor.field_for_column(column) else {
            continue;
        };
        let typed = Value::from_sql(value.to_sql()?, field.field_type)?;
        record.set(field.name.as_str(), typed);
    }
    Ok(record)
}
