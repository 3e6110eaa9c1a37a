//! Member projections and DTOs.

use crate::entity::{FromRecord, Record};
use crate::query::plan::ProjectionShape;
use crate::repo::error::RepoResult;

/// Closed projection of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernameOnly {
    pub username: String,
}

impl UsernameOnly {
    pub fn shape() -> ProjectionShape {
        ProjectionShape::closed(&["username"])
    }
}

impl FromRecord for UsernameOnly {
    fn from_record(record: &Record) -> RepoResult<Self> {
        Ok(Self {
            username: record.require("username")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamInfo {
    pub name: String,
}

/// Closed root projection with the whole team nested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedClosedProjection {
    pub username: String,
    pub team: Option<TeamInfo>,
}

impl NestedClosedProjection {
    pub fn shape() -> ProjectionShape {
        ProjectionShape::closed(&["username"]).with_nested("team")
    }
}

impl FromRecord for NestedClosedProjection {
    fn from_record(record: &Record) -> RepoResult<Self> {
        let team = record
            .nested("team")
            .map(|team| team.require("name").map(|name| TeamInfo { name }))
            .transpose()?;
        Ok(Self {
            username: record.require("username")?,
            team,
        })
    }
}

/// Open projection computed from full entity state: `"<username> <age> <team>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernameSummary {
    pub summary: String,
}

impl UsernameSummary {
    pub fn shape() -> ProjectionShape {
        ProjectionShape::open().with_nested("team")
    }
}

impl FromRecord for UsernameSummary {
    fn from_record(record: &Record) -> RepoResult<Self> {
        let username: String = record.require("username")?;
        let age: i64 = record.require("age")?;
        let team = match record.nested("team") {
            Some(team) => team.require::<String>("name")?,
            None => "-".to_string(),
        };
        Ok(Self {
            summary: format!("{username} {age} {team}"),
        })
    }
}

/// Row of the `findMemberDto` explicit join query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDto {
    pub id: i64,
    pub username: String,
    pub team_name: String,
}

impl FromRecord for MemberDto {
    fn from_record(record: &Record) -> RepoResult<Self> {
        Ok(Self {
            id: record.require("id")?,
            username: record.require("username")?,
            team_name: record.require("team_name")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{NestedClosedProjection, UsernameSummary};
    use crate::entity::{FromRecord, Record};

    #[test]
    fn nested_projection_tolerates_missing_team() {
        let record = Record::new().with("username", "m1");
        let projection = NestedClosedProjection::from_record(&record).unwrap();
        assert_eq!(projection.team, None);
    }

    #[test]
    fn open_projection_formats_entity_state() {
        let mut record = Record::new().with("username", "m1").with("age", 10);
        record.set_nested("team", Record::new().with("name", "teamA"));
        let summary = UsernameSummary::from_record(&record).unwrap();
        assert_eq!(summary.summary, "m1 10 teamA");
    }
}
