//! Connection bootstrap for aligned-volume databases.
//!
//! # Responsibility
//! - Open the database file backing one aligned volume, creating it when
//!   absent.
//! - Configure connection pragmas required by core behavior.
//! - Trigger metadata migrations before returning a usable connection.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON`.
//! - Returned connections have migrations fully applied.

use super::migrations::apply_migrations;
use super::{DbError, DbResult};
use crate::naming::is_valid_identifier;
use log::{error, info};
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

/// Opens the database holding one aligned volume's tables, creating the
/// volume file under `root_dir` when it does not exist yet.
///
/// One aligned volume maps to one database file named `{name}.db`.
///
/// # Side effects
/// - Creates `root_dir` when missing.
/// - Performs connection bootstrap and migration checks.
pub fn create_or_select_database(name: &str, root_dir: impl AsRef<Path>) -> DbResult<Connection> {
    if !is_valid_identifier(name) {
        return Err(DbError::InvalidVolumeName(name.to_string()));
    }

    let root_dir = root_dir.as_ref();
    std::fs::create_dir_all(root_dir).map_err(DbError::Io)?;

    info!("event=volume_select module=db status=start aligned_volume={name}");
    open_db(root_dir.join(format!("{name}.db")))
}

/// Opens a database file and applies all pending migrations.
///
/// # Side effects
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(path: impl AsRef<Path>) -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode=file");

    let mut conn = match Connection::open(path) {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode=file duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    finish_bootstrap(&mut conn, "file", started_at)?;
    Ok(conn)
}

/// Opens an in-memory database and applies all pending migrations.
///
/// Intended for tests; carries the exact metadata schema of a file-backed
/// volume.
pub fn open_db_in_memory() -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode=memory");

    let mut conn = match Connection::open_in_memory() {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode=memory duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    finish_bootstrap(&mut conn, "memory", started_at)?;
    Ok(conn)
}

fn finish_bootstrap(conn: &mut Connection, mode: &str, started_at: Instant) -> DbResult<()> {
    match bootstrap_connection(conn) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={mode} duration_ms={}",
                started_at.elapsed().as_millis()
            );
            Ok(())
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={mode} duration_ms={} error_code=db_bootstrap_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn bootstrap_connection(conn: &mut Connection) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    apply_migrations(conn)?;
    Ok(())
}
