//! Connection bootstrap.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON`, the configured busy timeout
//!   and every migration applied.

use super::migrations::apply_migrations;
use super::DbResult;
use crate::config::EngineConfig;
use log::{error, info};
use rusqlite::Connection;
use std::path::Path;
use std::time::Instant;

/// Opens (or creates) a database file and migrates it.
pub fn open_db(path: impl AsRef<Path>, config: &EngineConfig) -> DbResult<Connection> {
    open_with("file", config, || Connection::open(path))
}

/// Opens a private in-memory database and migrates it.
pub fn open_db_in_memory(config: &EngineConfig) -> DbResult<Connection> {
    open_with("memory", config, Connection::open_in_memory)
}

fn open_with(
    mode: &str,
    config: &EngineConfig,
    open: impl FnOnce() -> rusqlite::Result<Connection>,
) -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode={mode}");

    let result = open()
        .map_err(Into::into)
        .and_then(|mut conn| bootstrap_connection(&mut conn, config).map(|()| conn));

    match &result {
        Ok(_) => info!(
            "event=db_open module=db status=ok mode={mode} duration_ms={}",
            started_at.elapsed().as_millis()
        ),
        Err(err) => error!(
            "event=db_open module=db status=error mode={mode} duration_ms={} error={}",
            started_at.elapsed().as_millis(),
            err
        ),
    }
    result
}

fn bootstrap_connection(conn: &mut Connection, config: &EngineConfig) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(config.busy_timeout())?;
    apply_migrations(conn)?;
    Ok(())
}
