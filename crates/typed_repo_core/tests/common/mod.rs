#![allow(dead_code)]

use rusqlite::Connection;
use std::sync::Arc;
use typed_repo_core::model::build_catalog;
use typed_repo_core::model::member::{member_repository_definition, Member};
use typed_repo_core::model::team::Team;
use typed_repo_core::{
    open_db_in_memory, EngineConfig, EntityCatalog, Repository, RepositoryDefinition,
};

pub struct Fixture {
    pub conn: Connection,
    pub catalog: Arc<EntityCatalog>,
    pub members: RepositoryDefinition<Member>,
    pub teams: RepositoryDefinition<Team>,
    pub config: EngineConfig,
}

pub fn fixture() -> Fixture {
    fixture_with(EngineConfig::default())
}

pub fn fixture_with(config: EngineConfig) -> Fixture {
    let conn = open_db_in_memory(&config).unwrap();
    definitions(conn, config)
}

pub fn definitions(conn: Connection, config: EngineConfig) -> Fixture {
    let catalog = Arc::new(build_catalog().unwrap());
    let members = member_repository_definition(Arc::clone(&catalog)).unwrap();
    members.validate_against(&conn).unwrap();
    let teams = RepositoryDefinition::<Team>::builder(Arc::clone(&catalog))
        .build()
        .unwrap();
    Fixture {
        conn,
        catalog,
        members,
        teams,
        config,
    }
}

/// Saves `teamA`, `teamB` and one member per `(username, age, team index)`.
pub fn seed(
    teams: &Repository<'_, '_, Team>,
    members: &Repository<'_, '_, Member>,
    rows: &[(&str, i64, Option<usize>)],
) -> (Vec<Team>, Vec<Member>) {
    let saved_teams = vec![
        teams.save(&Team::new("teamA")).unwrap(),
        teams.save(&Team::new("teamB")).unwrap(),
    ];
    let saved_members = rows
        .iter()
        .map(|(username, age, team)| {
            let mut member = Member::new(username, *age);
            if let Some(index) = team {
                member.change_team(&saved_teams[*index]);
            }
            members.save(&member).unwrap()
        })
        .collect();
    (saved_teams, saved_members)
}
