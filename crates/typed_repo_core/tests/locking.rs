mod common;

use common::{definitions, fixture, seed};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use typed_repo_core::model::member::Member;
use typed_repo_core::{
    open_db, BulkOptions, EngineConfig, LockMode, QueryExecutor, QueryMethod, QueryPlan,
    RepoError, RepositoryDefinition, Session, StatementKind, Value,
};

#[test]
fn pessimistic_lock_requires_a_unit_of_work() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    seed(&teams, &members, &[("m1", 10, None)]);

    let err = members
        .find_list("findLockByUsername", &[Value::from("m1")])
        .unwrap_err();
    assert!(matches!(err, RepoError::NoActiveTransaction));

    let unit = session.begin().unwrap();
    let locked = members
        .find_list("findLockByUsername", &[Value::from("m1")])
        .unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(
        session.last_statement().unwrap().lock,
        LockMode::PessimisticWrite
    );
    unit.commit().unwrap();
}

#[test]
fn pessimistic_lock_is_enforced_on_explicit_and_aggregate_reads() {
    let fx = fixture();
    let locked = RepositoryDefinition::<Member>::builder(Arc::clone(&fx.catalog))
        .method(
            QueryMethod::explicit(
                "findLockedByUsername",
                "SELECT * FROM members WHERE username = :username",
            )
            .params(&["username"])
            .lock(LockMode::PessimisticWrite),
        )
        .build()
        .unwrap();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = locked.bind(&session);
    seed(&teams, &fx.members.bind(&session), &[("m1", 10, None)]);

    let plan = QueryPlan::new("Member").locked(LockMode::PessimisticWrite);
    let executor = QueryExecutor::new(&session);
    session.clear_statements();

    let err = members
        .find_list("findLockedByUsername", &[Value::from("m1")])
        .unwrap_err();
    assert!(matches!(err, RepoError::NoActiveTransaction));
    let err = executor.count(&plan).unwrap_err();
    assert!(matches!(err, RepoError::NoActiveTransaction));
    let err = executor.exists(&plan).unwrap_err();
    assert!(matches!(err, RepoError::NoActiveTransaction));
    assert!(session.statements().is_empty());

    let unit = session.begin().unwrap();
    let found = members
        .find_list("findLockedByUsername", &[Value::from("m1")])
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(executor.count(&plan).unwrap(), 1);
    assert!(executor.exists(&plan).unwrap());
    unit.commit().unwrap();
}

#[test]
fn optimistic_read_outside_a_unit_is_not_tracked() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    let (_, saved) = seed(&teams, &members, &[("m1", 10, None)]);

    let found = members
        .find_list("findOptimisticByUsername", &[Value::from("m1")])
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(!session.is_tracked("Member", saved[0].id.unwrap()));
    assert_eq!(session.tracked_count(), 0);
}

#[test]
fn clearing_the_session_keeps_optimistic_expectations() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    let (_, saved) = seed(&teams, &members, &[("m1", 10, None)]);
    let id = saved[0].id.unwrap();

    let unit = session.begin().unwrap();
    members
        .find_list("findOptimisticByUsername", &[Value::from("m1")])
        .unwrap();
    session.clear();
    assert_eq!(session.tracked_count(), 0);
    members
        .executor()
        .execute_explicit(
            "bumpVersion",
            "UPDATE members SET version = version + 1 WHERE id = :id",
            &[Value::from(id)],
            BulkOptions::default(),
        )
        .unwrap();

    let err = unit.commit().unwrap_err();
    assert!(matches!(err, RepoError::StaleState { id: stale, .. } if stale == id));
}

#[test]
fn optimistic_read_fails_commit_when_version_moved() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    let (_, saved) = seed(&teams, &members, &[("m1", 10, None)]);
    let id = saved[0].id.unwrap();

    let unit = session.begin().unwrap();
    members
        .find_list("findOptimisticByUsername", &[Value::from("m1")])
        .unwrap();
    members
        .executor()
        .execute_explicit(
            "bumpVersion",
            "UPDATE members SET version = version + 1 WHERE id = :id",
            &[Value::from(id)],
            BulkOptions::default(),
        )
        .unwrap();

    let err = unit.commit().unwrap_err();
    assert!(matches!(err, RepoError::StaleState { id: stale, .. } if stale == id));
    assert!(!session.in_transaction());
    assert_eq!(members.find_by_id(id).unwrap().unwrap().version, 0);
}

#[test]
fn optimistic_read_commits_when_version_is_unchanged() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    seed(&teams, &members, &[("m1", 10, None)]);

    let unit = session.begin().unwrap();
    let found = members
        .find_list("findOptimisticByUsername", &[Value::from("m1")])
        .unwrap();
    assert_eq!(found.len(), 1);
    unit.commit().unwrap();
}

#[test]
fn stale_copies_cannot_overwrite_or_delete() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    let (_, saved) = seed(&teams, &members, &[("m1", 10, None)]);

    let mut first = saved[0].clone();
    first.age = 11;
    let current = members.save(&first).unwrap();
    assert_eq!(current.version, 1);

    let mut stale = saved[0].clone();
    stale.age = 12;
    let err = members.save(&stale).unwrap_err();
    assert!(matches!(err, RepoError::StaleState { .. }));

    let err = members.delete(&saved[0]).unwrap_err();
    assert!(matches!(err, RepoError::StaleState { .. }));

    members.delete(&current).unwrap();
    assert_eq!(members.count().unwrap(), 0);
}

#[test]
fn dropped_unit_rolls_back_and_commit_persists() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let members = fx.members.bind(&session);

    {
        let _unit = session.begin().unwrap();
        members.save(&Member::new("lost", 1)).unwrap();
        assert_eq!(members.count().unwrap(), 1);
    }
    assert!(!session.in_transaction());
    assert_eq!(members.count().unwrap(), 0);

    let unit = session.begin().unwrap();
    let err = session.begin().err().unwrap();
    assert!(matches!(err, RepoError::InvalidQuery(_)));
    members
        .save_all(&[Member::new("kept1", 1), Member::new("kept2", 2)])
        .unwrap();
    unit.commit().unwrap();
    assert_eq!(members.count().unwrap(), 2);
    assert_eq!(session.tracked_count(), 0);
}

#[test]
fn unit_of_work_returns_the_tracked_instance_and_skips_clean_saves() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    let (_, saved) = seed(&teams, &members, &[("m1", 10, Some(0))]);
    let id = saved[0].id.unwrap();

    let unit = session.begin().unwrap();
    let first = members.find_by_id(id).unwrap().unwrap();
    session.clear_statements();
    let second = members.find_by_id(id).unwrap().unwrap();
    assert_eq!(first, second);
    assert!(session.statements().is_empty());

    members.save(&second).unwrap();
    assert!(session
        .statements()
        .iter()
        .all(|trace| trace.kind != StatementKind::Update));
    unit.commit().unwrap();
}

#[test]
fn read_only_hint_skips_tracking() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let teams = fx.teams.bind(&session);
    let members = fx.members.bind(&session);
    let (_, saved) = seed(&teams, &members, &[("m1", 10, None)]);

    let unit = session.begin().unwrap();
    let found = members
        .find_list("findReadOnlyByUsername", &[Value::from("m1")])
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(!session.is_tracked("Member", saved[0].id.unwrap()));

    members
        .find_list("findMemberByUsername", &[Value::from("m1")])
        .unwrap();
    assert!(session.is_tracked("Member", saved[0].id.unwrap()));
    unit.rollback().unwrap();
}

#[test]
fn expired_deadline_fails_before_running() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let members = fx.members.bind(&session);

    session.set_deadline(Some(Instant::now()));
    let err = members.find_all().unwrap_err();
    assert!(matches!(err, RepoError::Timeout(_)));

    session.set_deadline(None);
    assert!(members.find_all().unwrap().is_empty());

    session.set_timeout(Duration::from_secs(30));
    assert_eq!(members.count().unwrap(), 0);
}

#[test]
fn lock_wait_beyond_busy_timeout_is_a_timeout() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("typed_repo.db");
    let config = EngineConfig {
        busy_timeout_ms: 50,
        ..EngineConfig::default()
    };

    let holder = definitions(open_db(&path, &config).unwrap(), config.clone());
    let waiter = definitions(open_db(&path, &config).unwrap(), config.clone());

    let holding = Session::new(&holder.conn, Arc::clone(&holder.catalog), &holder.config);
    let waiting = Session::new(&waiter.conn, Arc::clone(&waiter.catalog), &waiter.config);

    let unit = holding.begin().unwrap();
    holder
        .members
        .bind(&holding)
        .save(&Member::new("m1", 10))
        .unwrap();

    let err = waiting.begin().err().unwrap();
    assert!(matches!(err, RepoError::Timeout(_)));

    let err = waiter
        .members
        .bind(&waiting)
        .save(&Member::new("m2", 20))
        .unwrap_err();
    assert!(matches!(err, RepoError::Timeout(_)));

    unit.commit().unwrap();
    assert_eq!(waiter.members.bind(&waiting).count().unwrap(), 1);
}

#[test]
fn constraint_violations_are_integrity_errors() {
    let fx = fixture();
    let session = Session::new(&fx.conn, Arc::clone(&fx.catalog), &fx.config);
    let members = fx.members.bind(&session);

    let err = members
        .executor()
        .execute_explicit(
            "insertOrphan",
            "INSERT INTO members (username, age, team_id, version) VALUES (:name, 1, 999, 0)",
            &[Value::from("orphan")],
            BulkOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, RepoError::Integrity(_)));
    assert_eq!(members.count().unwrap(), 0);
}
