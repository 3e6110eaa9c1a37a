//! `Team` entity: inverse side of the member/team relationship.

use crate::catalog::EntityDescriptor;
use crate::entity::{Entity, FromRecord, Record};
use crate::repo::error::RepoResult;
use crate::value::FieldType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
        }
    }
}

impl FromRecord for Team {
    fn from_record(record: &Record) -> RepoResult<Self> {
        Ok(Self {
            id: record.require("id")?,
            name: record.require("name")?,
        })
    }
}

impl Entity for Team {
    const NAME: &'static str = "Team";

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::builder(Self::NAME, "teams")
            .field("name", FieldType::Text)
            .one_to_many("members", "Member", "team")
            .build()
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("name", self.name.as_str())
    }
}
