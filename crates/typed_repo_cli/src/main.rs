//! CLI smoke entry point.
//!
//! # Responsibility
//! - Verify `typed_repo_core` wiring end to end: config, logging, storage,
//!   repository definition and one paged query.
//! - Keep output deterministic for quick local sanity checks.

use log::info;
use std::error::Error;
use std::sync::Arc;
use typed_repo_core::model::build_catalog;
use typed_repo_core::model::member::{member_repository_definition, Member};
use typed_repo_core::model::team::Team;
use typed_repo_core::{
    core_version, init_logging_from_config, open_db_in_memory, Direction, EngineConfig, Entity,
    PageRequest, RepositoryDefinition, Session, Sort,
};

const DEFAULT_CONFIG_PATH: &str = "typed_repo.toml";

fn main() -> Result<(), Box<dyn Error>> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = EngineConfig::load(&config_path)?;

    let log_dir = std::env::temp_dir().join("typed_repo_logs");
    init_logging_from_config(&config, &log_dir.to_string_lossy())?;

    let conn = open_db_in_memory(&config)?;
    let catalog = Arc::new(build_catalog()?);
    let members = member_repository_definition(Arc::clone(&catalog))?;
    members.validate_against(&conn)?;
    let teams = RepositoryDefinition::<Team>::builder(Arc::clone(&catalog)).build()?;

    let session = Session::new(&conn, catalog, &config);
    let team_repo = teams.bind(&session);
    let member_repo = members.bind(&session);

    let team = team_repo.save(&Team::new("teamA"))?;
    for (index, age) in [10, 19, 20, 21, 40].into_iter().enumerate() {
        member_repo.save(&Member::new(&format!("member{}", index + 1), age).with_team(&team))?;
    }

    let request = PageRequest::sorted(0, 3, Sort::by(Direction::Desc, &["age"]))?;
    let page = member_repo.find_all_page(request)?;
    info!(
        "event=cli_smoke module=cli status=ok entity={} total={}",
        Member::NAME,
        page.total_elements
    );

    println!("typed_repo_core version={}", core_version());
    println!(
        "page={} size={} total_elements={} total_pages={}",
        page.page_index, page.page_size, page.total_elements, page.total_pages
    );
    for member in &page.content {
        println!("member username={} age={}", member.username, member.age);
    }
    Ok(())
}
