//! `Member` entity, its reusable specifications and repository definition.
//!
//! # Invariants
//! - `version` is owned by the engine: it starts at 0 on insert and grows by
//!   one per versioned update.
//! - `team` is the owning side; `Team::members` is lookup only.

use crate::catalog::{EntityCatalog, EntityDescriptor};
use crate::entity::{Entity, FromRecord, Record, Reference};
use crate::model::team::Team;
use crate::query::derive::DerivedQuery;
use crate::query::plan::{Direction, LockMode, QueryPlan, Sort};
use crate::query::spec::Specification;
use crate::repo::definition::{QueryMethod, RepositoryDefinition};
use crate::repo::error::RepoResult;
use crate::repo::facade::Repository;
use crate::value::FieldType;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: Option<i64>,
    pub username: String,
    pub age: i64,
    pub team: Option<Reference<Team>>,
    pub version: i64,
}

impl Member {
    pub fn new(username: &str, age: i64) -> Self {
        Self {
            id: None,
            username: username.to_string(),
            age,
            team: None,
            version: 0,
        }
    }

    pub fn with_team(mut self, team: &Team) -> Self {
        self.change_team(team);
        self
    }

    pub fn change_team(&mut self, team: &Team) {
        self.team = Some(Reference::loaded(team.clone()));
    }

    pub fn team_id(&self) -> Option<i64> {
        self.team.as_ref().and_then(Reference::id)
    }
}

impl FromRecord for Member {
    fn from_record(record: &Record) -> RepoResult<Self> {
        Ok(Self {
            id: record.require("id")?,
            username: record.require("username")?,
            age: record.require("age")?,
            team: Reference::from_record(record, "team")?,
            version: record.require("version")?,
        })
    }
}

impl Entity for Member {
    const NAME: &'static str = "Member";

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::builder(Self::NAME, "members")
            .field("username", FieldType::Text)
            .field("age", FieldType::Integer)
            .many_to_one("team", Team::NAME, "team_id")
            .version("version")
            .named_query(
                "findByUsername",
                "SELECT * FROM members WHERE username = :username",
            )
            .build()
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn version(&self) -> Option<i64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn to_record(&self) -> Record {
        let mut record = Record::new()
            .with("id", self.id)
            .with("username", self.username.as_str())
            .with("age", self.age)
            .with("version", self.version);
        Reference::write_into(self.team.as_ref(), &mut record, "team");
        record
    }
}

/// Reusable member specifications. An empty argument means "no restriction".
pub mod member_spec {
    use super::Member;
    use crate::query::spec::Specification;

    pub fn username(username: &str) -> Specification<Member> {
        let username = username.to_string();
        Specification::new(move |root| {
            if username.is_empty() {
                return Ok(None);
            }
            root.get("username")?.eq(username.as_str()).map(Some)
        })
    }

    pub fn team_name(team_name: &str) -> Specification<Member> {
        let team_name = team_name.to_string();
        Specification::new(move |root| {
            if team_name.is_empty() {
                return Ok(None);
            }
            root.get("team.name")?.eq(team_name.as_str()).map(Some)
        })
    }
}

/// Members older than `age`.
pub fn older_than(age: i64) -> Specification<Member> {
    Specification::new(move |root| root.get("age")?.gt(age).map(Some))
}

/// Query methods of the member repository.
pub fn member_repository_definition(
    catalog: Arc<EntityCatalog>,
) -> RepoResult<RepositoryDefinition<Member>> {
    RepositoryDefinition::builder(catalog)
        .derived("findByUsernameAndAgeGreaterThan")
        .derived("findByUsername")
        .derived("findTop3ByOrderByAgeDesc")
        .derived("findListByUsername")
        .derived("findMemberByUsername")
        .derived("findByAge")
        .derived("findByTeamName")
        .derived("findByUsernameContaining")
        .derived("findByAgeIn")
        .derived("findByTeamIsNull")
        .derived("findDistinctByAgeGreaterThanEqualOrderByUsernameAsc")
        .derived("countByAge")
        .derived("existsByUsername")
        .derived("findProjectionsByUsername")
        .method(
            QueryMethod::explicit(
                "findUser",
                "SELECT * FROM members WHERE username = :username AND age = :age",
            )
            .params(&["username", "age"]),
        )
        .method(QueryMethod::explicit(
            "findUsernameList",
            "SELECT username FROM members ORDER BY id",
        ))
        .method(QueryMethod::explicit(
            "findMemberDto",
            "SELECT m.id AS id, m.username AS username, t.name AS team_name \
             FROM members m JOIN teams t ON t.id = m.team_id ORDER BY m.id",
        ))
        .method(
            QueryMethod::explicit(
                "findByNames",
                "SELECT * FROM members WHERE username IN :names ORDER BY id",
            )
            .params(&["names"]),
        )
        .method(
            QueryMethod::modifying(
                "bulkAgePlus",
                "UPDATE members SET age = age + 1 WHERE age >= :age",
            )
            .params(&["age"])
            .clear_automatically(),
        )
        .method(QueryMethod::built("findMemberFetchJoin", DerivedQuery::find()).fetch("team"))
        .method(QueryMethod::derived("findEntityGraphByUsername").fetch("team"))
        .method(QueryMethod::derived("findReadOnlyByUsername").read_only())
        .method(QueryMethod::derived("findLockByUsername").lock(LockMode::PessimisticWrite))
        .method(QueryMethod::derived("findOptimisticByUsername").lock(LockMode::Optimistic))
        .build()
}

/// Hand-written additions to the member repository.
pub trait MemberRepositoryCustom {
    /// Every member ordered by identity, read with a plan built by hand.
    fn find_member_custom(&self) -> RepoResult<Vec<Member>>;
}

impl MemberRepositoryCustom for Repository<'_, '_, Member> {
    fn find_member_custom(&self) -> RepoResult<Vec<Member>> {
        let plan = QueryPlan::new(Member::NAME).sorted(Sort::by(Direction::Asc, &["id"]));
        self.executor()
            .fetch(&plan)?
            .iter()
            .map(Member::from_record)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{member_spec, Member};
    use crate::entity::{Entity, FromRecord, Reference};
    use crate::model::build_catalog;
    use crate::model::team::Team;
    use crate::value::Value;

    #[test]
    fn record_round_trip_keeps_loaded_team() {
        let mut team = Team::new("teamA");
        team.id = Some(7);
        let member = Member::new("member1", 10).with_team(&team);

        let record = member.to_record();
        assert_eq!(record.get("team"), Some(&Value::Integer(7)));
        assert_eq!(record.get("id"), Some(&Value::Null));

        let mut stored = record.clone();
        stored.set("id", 1);
        let restored = Member::from_record(&stored).unwrap();
        assert_eq!(restored.id, Some(1));
        assert!(restored.team.as_ref().is_some_and(Reference::is_loaded));
        assert_eq!(restored.team_id(), Some(7));
    }

    #[test]
    fn specifications_resolve_paths_and_skip_empty_arguments() {
        let catalog = build_catalog().unwrap();
        let predicate = member_spec::username("m1")
            .and(member_spec::team_name("teamA"))
            .to_predicate(&catalog)
            .unwrap()
            .unwrap();
        assert_eq!(predicate.comparisons().len(), 2);

        let unrestricted = member_spec::username("").to_predicate(&catalog).unwrap();
        assert!(unrestricted.is_none());
    }

    #[test]
    fn descriptor_declares_named_query_and_version() {
        let descriptor = Member::descriptor();
        assert!(descriptor.named_query("findByUsername").is_some());
        assert_eq!(descriptor.version.unwrap().name, "version");
    }
}
