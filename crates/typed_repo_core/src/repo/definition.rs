//! Repository definitions: query methods registered and validated at startup.
//!
//! # Responsibility
//! - Collect the query methods of one entity repository.
//! - Derive, compile and validate every method once, before any call runs.
//!
//! # Invariants
//! - A built definition never fails on method lookup for a registered name.
//! - Named queries declared on the entity descriptor replace derivation for
//!   methods of the same name.

use crate::catalog::EntityCatalog;
use crate::entity::Entity;
use crate::query::derive::{CompiledQuery, DerivedQuery};
use crate::query::plan::LockMode;
use crate::query::sql::ExplicitSql;
use crate::repo::error::{RepoError, RepoResult};
use crate::repo::facade::Repository;
use crate::session::Session;
use crate::value::Value;
use log::{debug, info};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum MethodSource {
    /// Derive from the method name.
    Derived,
    /// Pre-built clause list.
    Built(DerivedQuery),
    Explicit(String),
    Modifying(String),
}

/// Declaration of one query method plus its execution hints.
#[derive(Debug, Clone)]
pub struct QueryMethod {
    name: String,
    source: MethodSource,
    lock: LockMode,
    fetch: Vec<String>,
    read_only: bool,
    params: Option<Vec<String>>,
    clear_automatically: bool,
}

impl QueryMethod {
    fn with_source(name: &str, source: MethodSource) -> Self {
        Self {
            name: name.to_string(),
            source,
            lock: LockMode::None,
            fetch: Vec::new(),
            read_only: false,
            params: None,
            clear_automatically: false,
        }
    }

    /// Method whose query is derived from its name (`findByUsernameAndAgeGreaterThan`).
    pub fn derived(name: &str) -> Self {
        Self::with_source(name, MethodSource::Derived)
    }

    /// Method backed by a builder-form clause list.
    pub fn built(name: &str, query: DerivedQuery) -> Self {
        Self::with_source(name, MethodSource::Built(query))
    }

    /// Read query written in SQL with `:name` parameters.
    pub fn explicit(name: &str, sql: &str) -> Self {
        Self::with_source(name, MethodSource::Explicit(sql.to_string()))
    }

    /// Write statement written in SQL with `:name` parameters.
    pub fn modifying(name: &str, sql: &str) -> Self {
        Self::with_source(name, MethodSource::Modifying(sql.to_string()))
    }

    pub fn lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    /// Loads `relationship` in the same statement.
    pub fn fetch(mut self, relationship: &str) -> Self {
        self.fetch.push(relationship.to_string());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Declared parameter names, checked against the query at build time.
    pub fn params(mut self, names: &[&str]) -> Self {
        self.params = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    /// Clears the persistence context after a modifying method runs.
    pub fn clear_automatically(mut self) -> Self {
        self.clear_automatically = true;
        self
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum CompiledBody {
    Derived(CompiledQuery),
    Explicit(ExplicitSql),
    Modifying(ExplicitSql),
}

/// Query method after validation.
#[derive(Debug, Clone)]
pub(crate) struct CompiledMethod {
    pub(crate) name: String,
    pub(crate) body: CompiledBody,
    pub(crate) lock: LockMode,
    pub(crate) fetch: Vec<String>,
    pub(crate) read_only: bool,
    pub(crate) clear_automatically: bool,
}

impl CompiledMethod {
    pub(crate) fn arity(&self) -> usize {
        match &self.body {
            CompiledBody::Derived(query) => query.arity(),
            CompiledBody::Explicit(sql) | CompiledBody::Modifying(sql) => sql.arity(),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match &self.body {
            CompiledBody::Derived(_) => "derived",
            CompiledBody::Explicit(_) => "explicit",
            CompiledBody::Modifying(_) => "modifying",
        }
    }
}

/// Validated set of query methods for entity `E`.
pub struct RepositoryDefinition<E> {
    catalog: Arc<EntityCatalog>,
    methods: BTreeMap<String, CompiledMethod>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> RepositoryDefinition<E> {
    pub fn builder(catalog: Arc<EntityCatalog>) -> RepositoryDefinitionBuilder<E> {
        RepositoryDefinitionBuilder {
            catalog,
            methods: Vec::new(),
            _entity: PhantomData,
        }
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Parameter count a registered method expects.
    pub fn arity(&self, name: &str) -> RepoResult<usize> {
        self.method(name).map(CompiledMethod::arity)
    }

    pub(crate) fn method(&self, name: &str) -> RepoResult<&CompiledMethod> {
        self.methods
            .get(name)
            .ok_or_else(|| RepoError::UnknownQueryMethod {
                entity: E::NAME.to_string(),
                method: name.to_string(),
            })
    }

    /// Prepares every explicit statement once so malformed SQL fails at startup.
    ///
    /// # Errors
    /// - `InvalidQuery` naming the method whose SQL does not prepare.
    pub fn validate_against(&self, conn: &Connection) -> RepoResult<()> {
        for method in self.methods.values() {
            let (CompiledBody::Explicit(sql) | CompiledBody::Modifying(sql)) = &method.body else {
                continue;
            };
            // One-element lists render as `(?)`, valid for both scalar and IN slots.
            let probe_args = vec![Value::List(vec![Value::Null]); sql.arity()];
            let statement = sql.render(method.name.as_str(), &probe_args)?;
            conn.prepare(&statement.sql).map_err(|err| {
                RepoError::InvalidQuery(format!(
                    "query method `{}` does not prepare: {err}",
                    method.name
                ))
            })?;
        }
        info!(
            "event=repository_validate module=repo status=ok entity={} methods={}",
            E::NAME,
            self.methods.len()
        );
        Ok(())
    }

    /// Binds the definition to a session for calls.
    pub fn bind<'s, 'conn>(&'s self, session: &'s Session<'conn>) -> Repository<'s, 'conn, E> {
        Repository::new(self, session)
    }
}

pub struct RepositoryDefinitionBuilder<E> {
    catalog: Arc<EntityCatalog>,
    methods: Vec<QueryMethod>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> RepositoryDefinitionBuilder<E> {
    pub fn method(mut self, method: QueryMethod) -> Self {
        self.methods.push(method);
        self
    }

    /// Shorthand for a name-derived method without hints.
    pub fn derived(self, name: &str) -> Self {
        self.method(QueryMethod::derived(name))
    }

    /// Compiles every method against the catalog.
    ///
    /// # Errors
    /// - `UnknownEntity` when `E` is not registered.
    /// - `UnknownField` / `UnsupportedOperator` from derivation.
    /// - `ArityMismatch` when declared parameters disagree with the query.
    /// - `InvalidQuery` for duplicate names and invalid fetch hints.
    pub fn build(self) -> RepoResult<RepositoryDefinition<E>> {
        let descriptor = self.catalog.resolve_entity(E::NAME)?;
        let mut methods = BTreeMap::new();

        for method in self.methods {
            if methods.contains_key(method.name.as_str()) {
                return Err(RepoError::InvalidQuery(format!(
                    "query method `{}` is registered twice for `{}`",
                    method.name,
                    E::NAME
                )));
            }

            for relationship in &method.fetch {
                let resolved = self.catalog.resolve_relationship(E::NAME, relationship)?;
                if !resolved.is_owning() {
                    return Err(RepoError::InvalidQuery(format!(
                        "query method `{}` fetches inverse relationship `{relationship}`",
                        method.name
                    )));
                }
            }

            let named = descriptor.named_query(method.name.as_str());
            let body = match (&method.source, named) {
                (MethodSource::Derived, Some(sql)) => {
                    debug!(
                        "event=query_method module=repo status=ok entity={} method={} source=named",
                        E::NAME,
                        method.name
                    );
                    CompiledBody::Explicit(ExplicitSql::parse(sql))
                }
                (MethodSource::Derived, None) => CompiledBody::Derived(
                    DerivedQuery::parse(method.name.as_str(), &self.catalog, E::NAME)?
                        .compile(method.name.as_str(), &self.catalog, E::NAME)?,
                ),
                (MethodSource::Built(query), _) => CompiledBody::Derived(query.compile(
                    method.name.as_str(),
                    &self.catalog,
                    E::NAME,
                )?),
                (MethodSource::Explicit(sql), _) => CompiledBody::Explicit(ExplicitSql::parse(sql)),
                (MethodSource::Modifying(sql), _) => {
                    CompiledBody::Modifying(ExplicitSql::parse(sql))
                }
            };

            check_declared_params(&method, &body)?;

            let compiled = CompiledMethod {
                name: method.name.clone(),
                body,
                lock: method.lock,
                fetch: method.fetch,
                read_only: method.read_only,
                clear_automatically: method.clear_automatically,
            };
            debug!(
                "event=query_method module=repo status=ok entity={} method={} kind={} arity={}",
                E::NAME,
                compiled.name,
                compiled.kind(),
                compiled.arity()
            );
            methods.insert(method.name, compiled);
        }

        info!(
            "event=repository_build module=repo status=ok entity={} methods={}",
            E::NAME,
            methods.len()
        );
        Ok(RepositoryDefinition {
            catalog: self.catalog,
            methods,
            _entity: PhantomData,
        })
    }
}

fn check_declared_params(method: &QueryMethod, body: &CompiledBody) -> RepoResult<()> {
    let Some(declared) = &method.params else {
        return Ok(());
    };
    let mismatch = |expected: usize| RepoError::ArityMismatch {
        method: method.name.clone(),
        expected,
        actual: declared.len(),
    };
    match body {
        CompiledBody::Derived(query) => {
            if declared.len() != query.arity() {
                return Err(mismatch(query.arity()));
            }
        }
        CompiledBody::Explicit(sql) | CompiledBody::Modifying(sql) => {
            let matches = declared.len() == sql.names.len()
                && sql.names.iter().all(|name| declared.contains(name));
            if !matches {
                return Err(mismatch(sql.arity()));
            }
        }
    }
    Ok(())
}
