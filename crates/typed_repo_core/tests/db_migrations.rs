use rusqlite::Connection;
use typed_repo_core::db::migrations::{current_user_version, latest_version};
use typed_repo_core::db::{open_db, open_db_in_memory, DbError};
use typed_repo_core::EngineConfig;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory(&EngineConfig::default()).unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    assert_table_exists(&conn, "teams");
    assert_table_exists(&conn, "members");
    let foreign_keys: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(foreign_keys, 1);
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("typed_repo.db");

    let conn_first = open_db(&path, &EngineConfig::default()).unwrap();
    assert_eq!(schema_version(&conn_first), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path, &EngineConfig::default()).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version());
    assert_table_exists(&conn_second, "members");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path, &EngineConfig::default()).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn member_lookup_indexes_are_created() {
    let conn = open_db_in_memory(&EngineConfig::default()).unwrap();

    assert_eq!(current_user_version(&conn).unwrap(), latest_version());
    for index in ["idx_members_username", "idx_members_team_id", "idx_members_age"] {
        assert_index_exists(&conn, index);
    }
}

#[test]
fn database_at_first_version_is_upgraded_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v1.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(include_str!("../src/db/migrations/0001_init.sql"))
        .unwrap();
    conn.execute_batch("PRAGMA user_version = 1;").unwrap();
    conn.execute(
        "INSERT INTO members (username, age, version) VALUES ('kept', 7, 0)",
        [],
    )
    .unwrap();
    drop(conn);

    let conn = open_db(&path, &EngineConfig::default()).unwrap();
    assert_eq!(current_user_version(&conn).unwrap(), latest_version());
    assert_index_exists(&conn, "idx_members_age");
    let kept: i64 = conn
        .query_row("SELECT COUNT(*) FROM members WHERE username = 'kept'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(kept, 1);
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}

fn assert_index_exists(conn: &Connection, index_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'index' AND name = ?1
            );",
            [index_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "index {index_name} does not exist");
}
