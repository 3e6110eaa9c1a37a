mod common;

use common::{fixture, seed};
use std::sync::Arc;
use typed_repo_core::model::member::member_spec;
use typed_repo_core::{
    BulkOptions, Criteria, Mutation, Predicate, RepoError, Session, StatementKind, Value,
};

const AGES: [(&str, i64, Option<usize>); 5] = [
    ("member1", 10, Some(0)),
    ("member2", 19, Some(0)),
    ("member3", 20, Some(0)),
    ("member4", 21, Some(1)),
    ("member5", 40, Some(1)),
];

#[test]
fn bulk_update_returns_affected_rows() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    seed(&teams, &members, &AGES);

    let affected = members
        .execute_bulk(
            Predicate::gt("age", 20).into(),
            &Mutation::new().increment("age", 1),
            BulkOptions::default(),
        )
        .unwrap();
    assert_eq!(affected, 2);
    assert_eq!(session.last_statement().unwrap().kind, StatementKind::BulkUpdate);

    let ages: Vec<i64> = members
        .find_all()
        .unwrap()
        .iter()
        .map(|member| member.age)
        .collect();
    assert_eq!(ages, vec![10, 19, 20, 22, 41]);
}

#[test]
fn bulk_update_through_relationship_filter() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    seed(&teams, &members, &AGES);

    let affected = members
        .execute_bulk(
            member_spec::team_name("teamB").into(),
            &Mutation::new().set("username", "moved"),
            BulkOptions::default(),
        )
        .unwrap();
    assert_eq!(affected, 2);
    assert_eq!(
        members
            .count_by("countByAge", &[Value::from(40)])
            .unwrap(),
        1
    );
    let moved = members
        .find_list("findListByUsername", &[Value::from("moved")])
        .unwrap();
    assert_eq!(moved.len(), 2);
}

#[test]
fn bulk_update_rejects_unknown_or_wrongly_typed_fields() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let members = fx.members.bind(&session);

    let err = members
        .execute_bulk(
            Criteria::All,
            &Mutation::new().set("nickname", "x"),
            BulkOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::UnknownField { .. }));

    let err = members
        .execute_bulk(
            Criteria::All,
            &Mutation::new().set("age", "old"),
            BulkOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::TypeMismatch { .. }));
}

#[test]
fn registered_modifying_query_counts_rows() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    seed(&teams, &members, &AGES);

    let affected = members
        .execute_modifying("bulkAgePlus", &[Value::from(20)])
        .unwrap();
    assert_eq!(affected, 3);
    assert_eq!(members.count_by("countByAge", &[Value::from(41)]).unwrap(), 1);

    let err = members.find_list("bulkAgePlus", &[Value::from(20)]).unwrap_err();
    assert!(matches!(err, RepoError::InvalidQuery(_)));
}

#[test]
fn tracked_entities_stay_stale_until_the_session_is_cleared() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    let (_, saved) = seed(&teams, &members, &AGES);
    let id = saved[4].id.unwrap();

    let unit = session.begin().unwrap();
    let before = members.find_by_id(id).unwrap().unwrap();
    assert_eq!(before.age, 40);
    assert!(session.is_tracked("Member", id));

    members
        .execute_bulk(
            Predicate::gt("age", 20).into(),
            &Mutation::new().increment("age", 1),
            BulkOptions::default(),
        )
        .unwrap();
    let stale = members.find_by_id(id).unwrap().unwrap();
    assert_eq!(stale.age, 40);

    session.clear();
    let fresh = members.find_by_id(id).unwrap().unwrap();
    assert_eq!(fresh.age, 41);
    unit.commit().unwrap();
}

#[test]
fn clear_automatically_evicts_tracked_entities() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    let (_, saved) = seed(&teams, &members, &AGES);
    let id = saved[4].id.unwrap();

    let unit = session.begin().unwrap();
    members.find_by_id(id).unwrap();
    assert!(session.tracked_count() > 0);

    let affected = members
        .execute_modifying("bulkAgePlus", &[Value::from(20)])
        .unwrap();
    assert_eq!(affected, 3);
    assert_eq!(session.tracked_count(), 0);
    assert_eq!(members.find_by_id(id).unwrap().unwrap().age, 41);
    unit.commit().unwrap();
}

#[test]
fn bulk_update_inside_a_rolled_back_unit_is_undone() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    seed(&teams, &members, &AGES);

    let unit = session.begin().unwrap();
    let options = BulkOptions {
        clear_context: true,
    };
    members
        .execute_bulk(Criteria::All, &Mutation::new().set("age", 0), options)
        .unwrap();
    unit.rollback().unwrap();

    assert_eq!(members.count_by("countByAge", &[Value::from(0)]).unwrap(), 0);
}
