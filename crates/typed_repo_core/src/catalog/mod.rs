//! Entity catalog: registry of entity types, fields and relationships.
//!
//! # Responsibility
//! - Describe how each entity maps onto its table and columns.
//! - Resolve field names, relationship names and one-hop paths.
//!
//! # Invariants
//! - Registration happens at startup; the catalog is read-only afterwards and
//!   shared as `Arc<EntityCatalog>`.
//! - Registering an identical descriptor twice is a no-op.
//! - Paths cross at most one to-one relationship (`team.name`).

use crate::repo::error::{RepoError, RepoResult};
use crate::value::FieldType;
use log::debug;
use std::collections::BTreeMap;

/// Column-backed attribute of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub column: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldDescriptor {
    fn new(name: &str, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            column: name.to_string(),
            field_type,
            nullable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Owning side: the source table holds the join column.
    ManyToOne,
    /// Inverse side: lookup only, `mapped_by` names the owning field.
    OneToMany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    /// Join column on the source table (`ManyToOne` only).
    pub join_column: Option<String>,
    /// Owning relationship name on the target (`OneToMany` only).
    pub mapped_by: Option<String>,
}

impl RelationshipDescriptor {
    pub fn is_owning(&self) -> bool {
        self.cardinality == Cardinality::ManyToOne
    }

    /// Field view of the join column, used to compare and persist references.
    pub fn join_field(&self) -> Option<FieldDescriptor> {
        self.join_column.as_ref().map(|column| FieldDescriptor {
            name: self.name.clone(),
            column: column.clone(),
            field_type: FieldType::Integer,
            nullable: true,
        })
    }
}

/// Table mapping of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    pub id: FieldDescriptor,
    pub version: Option<FieldDescriptor>,
    pub fields: Vec<FieldDescriptor>,
    pub relationships: Vec<RelationshipDescriptor>,
    /// Explicit queries declared on the entity, keyed by method name.
    pub named_queries: BTreeMap<String, String>,
}

impl EntityDescriptor {
    pub fn builder(name: &str, table: &str) -> EntityDescriptorBuilder {
        EntityDescriptorBuilder {
            descriptor: EntityDescriptor {
                name: name.to_string(),
                table: table.to_string(),
                id: FieldDescriptor::new("id", FieldType::Integer, false),
                version: None,
                fields: Vec::new(),
                relationships: Vec::new(),
                named_queries: BTreeMap::new(),
            },
        }
    }

    /// Looks up a directly stored attribute: identity, version, scalar field or
    /// the join column of an owning relationship.
    pub fn field(&self, name: &str) -> Option<FieldDescriptor> {
        if self.id.name == name {
            return Some(self.id.clone());
        }
        if let Some(version) = self.version.as_ref().filter(|field| field.name == name) {
            return Some(version.clone());
        }
        if let Some(field) = self.fields.iter().find(|field| field.name == name) {
            return Some(field.clone());
        }
        self.relationships
            .iter()
            .find(|relationship| relationship.name == name)
            .and_then(RelationshipDescriptor::join_field)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships
            .iter()
            .find(|relationship| relationship.name == name)
    }

    /// Stored attributes written on insert/update, excluding the identity.
    pub fn persistent_fields(&self) -> Vec<FieldDescriptor> {
        let mut fields = self.fields.clone();
        fields.extend(
            self.relationships
                .iter()
                .filter_map(RelationshipDescriptor::join_field),
        );
        if let Some(version) = &self.version {
            fields.push(version.clone());
        }
        fields
    }

    /// All stored attributes in select order, identity first.
    pub fn all_fields(&self) -> Vec<FieldDescriptor> {
        let mut fields = vec![self.id.clone()];
        fields.extend(self.persistent_fields());
        fields
    }

    /// Reverse column lookup used when mapping explicit query results.
    pub fn field_for_column(&self, column: &str) -> Option<FieldDescriptor> {
        self.all_fields()
            .into_iter()
            .find(|field| field.column.eq_ignore_ascii_case(column))
    }

    pub fn named_query(&self, method: &str) -> Option<&str> {
        self.named_queries.get(method).map(String::as_str)
    }
}

pub struct EntityDescriptorBuilder {
    descriptor: EntityDescriptor,
}

impl EntityDescriptorBuilder {
    /// Overrides the identity column (defaults to `id`).
    pub fn id(mut self, name: &str) -> Self {
        self.descriptor.id = FieldDescriptor::new(name, FieldType::Integer, false);
        self
    }

    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.descriptor
            .fields
            .push(FieldDescriptor::new(name, field_type, false));
        self
    }

    pub fn nullable_field(mut self, name: &str, field_type: FieldType) -> Self {
        self.descriptor
            .fields
            .push(FieldDescriptor::new(name, field_type, true));
        self
    }

    /// Declares the optimistic-lock version counter column.
    pub fn version(mut self, name: &str) -> Self {
        self.descriptor.version = Some(FieldDescriptor::new(name, FieldType::Integer, false));
        self
    }

    pub fn many_to_one(mut self, name: &str, target: &str, join_column: &str) -> Self {
        self.descriptor.relationships.push(RelationshipDescriptor {
            name: name.to_string(),
            target: target.to_string(),
            cardinality: Cardinality::ManyToOne,
            join_column: Some(join_column.to_string()),
            mapped_by: None,
        });
        self
    }

    pub fn one_to_many(mut self, name: &str, target: &str, mapped_by: &str) -> Self {
        self.descriptor.relationships.push(RelationshipDescriptor {
            name: name.to_string(),
            target: target.to_string(),
            cardinality: Cardinality::OneToMany,
            join_column: None,
            mapped_by: Some(mapped_by.to_string()),
        });
        self
    }

    /// Declares an explicit query resolved before derivation for `method`.
    pub fn named_query(mut self, method: &str, sql: &str) -> Self {
        self.descriptor
            .named_queries
            .insert(method.to_string(), sql.to_string());
        self
    }

    pub fn build(self) -> EntityDescriptor {
        self.descriptor
    }
}

/// Resolved field path, optionally one hop through an owning relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: String,
    pub relationship: Option<RelationshipDescriptor>,
    pub field: FieldDescriptor,
}

/// Registry of entity descriptors.
#[derive(Debug, Default)]
pub struct EntityCatalog {
    entities: BTreeMap<String, EntityDescriptor>,
}

impl EntityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one descriptor.
    ///
    /// # Errors
    /// - `ConflictingRegistration` when a different descriptor already uses the name.
    pub fn register(&mut self, descriptor: EntityDescriptor) -> RepoResult<()> {
        if let Some(existing) = self.entities.get(descriptor.name.as_str()) {
            if *existing == descriptor {
                debug!(
                    "event=catalog_register module=catalog status=ok entity={} idempotent=true",
                    descriptor.name
                );
                return Ok(());
            }
            return Err(RepoError::ConflictingRegistration(descriptor.name));
        }

        debug!(
            "event=catalog_register module=catalog status=ok entity={} table={} fields={}",
            descriptor.name,
            descriptor.table,
            descriptor.fields.len()
        );
        self.entities.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entity_names(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    pub fn resolve_entity(&self, entity: &str) -> RepoResult<&EntityDescriptor> {
        self.entities
            .get(entity)
            .ok_or_else(|| RepoError::UnknownEntity(entity.to_string()))
    }

    pub fn resolve_field(&self, entity: &str, name: &str) -> RepoResult<FieldDescriptor> {
        self.resolve_entity(entity)?
            .field(name)
            .ok_or_else(|| RepoError::UnknownField {
                entity: entity.to_string(),
                field: name.to_string(),
            })
    }

    pub fn resolve_relationship(
        &self,
        entity: &str,
        name: &str,
    ) -> RepoResult<RelationshipDescriptor> {
        self.resolve_entity(entity)?
            .relationship(name)
            .cloned()
            .ok_or_else(|| RepoError::UnknownRelationship {
                entity: entity.to_string(),
                relationship: name.to_string(),
            })
    }

    /// Resolves `field` or `relationship.field`.
    ///
    /// Only owning (to-one) relationships can be traversed.
    pub fn resolve_path(&self, entity: &str, path: &str) -> RepoResult<ResolvedPath> {
        let Some((head, tail)) = path.split_once('.') else {
            let field = self.resolve_field(entity, path)?;
            return Ok(ResolvedPath {
                path: path.to_string(),
                relationship: None,
                field,
            });
        };

        let relationship = self.resolve_relationship(entity, head)?;
        if !relationship.is_owning() {
            return Err(RepoError::UnknownField {
                entity: entity.to_string(),
                field: path.to_string(),
            });
        }
        let field = self
            .resolve_field(relationship.target.as_str(), tail)
            .map_err(|_| RepoError::UnknownField {
                entity: entity.to_string(),
                field: path.to_string(),
            })?;

        Ok(ResolvedPath {
            path: path.to_string(),
            relationship: Some(relationship),
            field,
        })
    }

    /// Checks cross-entity references once all descriptors are registered.
    pub fn validate(&self) -> RepoResult<()> {
        for descriptor in self.entities.values() {
            for relationship in &descriptor.relationships {
                let target = self
                    .entities
                    .get(relationship.target.as_str())
                    .ok_or_else(|| {
                        RepoError::InvalidCatalog(format!(
                            "`{}.{}` targets unregistered entity `{}`",
                            descriptor.name, relationship.name, relationship.target
                        ))
                    })?;

                if let Some(mapped_by) = &relationship.mapped_by {
                    let owning = target.relationship(mapped_by).filter(|owning| {
                        owning.is_owning() && owning.target == descriptor.name
                    });
                    if owning.is_none() {
                        return Err(RepoError::InvalidCatalog(format!(
                            "`{}.{}` is mapped by `{}.{}`, which is not an owning reference back",
                            descriptor.name, relationship.name, target.name, mapped_by
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{EntityCatalog, EntityDescriptor};
    use crate::repo::error::RepoError;
    use crate::value::FieldType;

    fn team() -> EntityDescriptor {
        EntityDescriptor::builder("Team", "teams")
            .field("name", FieldType::Text)
            .one_to_many("members", "Member", "team")
            .build()
    }

    fn member() -> EntityDescriptor {
        EntityDescriptor::builder("Member", "members")
            .field("username", FieldType::Text)
            .field("age", FieldType::Integer)
            .many_to_one("team", "Team", "team_id")
            .version("version")
            .build()
    }

    fn catalog() -> EntityCatalog {
        let mut catalog = EntityCatalog::new();
        catalog.register(team()).unwrap();
        catalog.register(member()).unwrap();
        catalog
    }

    #[test]
    fn resolves_fields_identity_and_join_columns() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve_field("Member", "age").unwrap().field_type,
            FieldType::Integer
        );
        assert_eq!(catalog.resolve_field("Member", "id").unwrap().column, "id");
        assert_eq!(
            catalog.resolve_field("Member", "team").unwrap().column,
            "team_id"
        );
        let err = catalog.resolve_field("Member", "nickname").unwrap_err();
        assert!(matches!(err, RepoError::UnknownField { .. }));
    }

    #[test]
    fn resolves_one_hop_paths_through_owning_side_only() {
        let catalog = catalog();
        let path = catalog.resolve_path("Member", "team.name").unwrap();
        assert_eq!(path.field.name, "name");
        assert_eq!(path.relationship.unwrap().target, "Team");

        let inverse = catalog.resolve_path("Team", "members.username");
        assert!(matches!(inverse, Err(RepoError::UnknownField { .. })));

        let missing = catalog.resolve_relationship("Member", "club");
        assert!(matches!(
            missing,
            Err(RepoError::UnknownRelationship { .. })
        ));
    }

    #[test]
    fn re_registration_is_idempotent_but_conflicts_are_rejected() {
        let mut catalog = catalog();
        let before = catalog.resolve_field("Member", "username").unwrap();
        catalog.register(member()).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.resolve_field("Member", "username").unwrap(), before);

        let conflicting = EntityDescriptor::builder("Member", "people").build();
        assert!(matches!(
            catalog.register(conflicting),
            Err(RepoError::ConflictingRegistration(name)) if name == "Member"
        ));
    }

    #[test]
    fn validate_rejects_dangling_targets_and_bad_mapped_by() {
        let mut dangling = EntityCatalog::new();
        dangling.register(member()).unwrap();
        assert!(matches!(
            dangling.validate(),
            Err(RepoError::InvalidCatalog(_))
        ));

        let mut bad_mapped_by = EntityCatalog::new();
        bad_mapped_by.register(member()).unwrap();
        bad_mapped_by
            .register(
                EntityDescriptor::builder("Team", "teams")
                    .field("name", FieldType::Text)
                    .one_to_many("members", "Member", "club")
                    .build(),
            )
            .unwrap();
        assert!(matches!(
            bad_mapped_by.validate(),
            Err(RepoError::InvalidCatalog(_))
        ));

        assert!(catalog().validate().is_ok());
    }
}
