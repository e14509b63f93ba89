//! Schema migration runner for the permission database.
//!
//! Migrations are embedded at compile time via [`include_str!`] and applied
//! in version order, each inside its own transaction. The `schema_version`
//! table records what has been applied; re-running is a no-op.

use rusqlite::{Connection, params};
use tracing::info;

use crate::errors::{PermissionError, Result};

/// `(version, description, sql)`, ascending by version.
const MIGRATIONS: &[(u32, &str, &str)] = &[(1, "origins and grants", include_str!("v001_schema.sql"))];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT    NOT NULL,
    description TEXT
)";

fn migration_error(context: impl std::fmt::Display, e: &rusqlite::Error) -> PermissionError {
    PermissionError::Migration {
        message: format!("{context}: {e}"),
    }
}

/// Bring the schema up to date. Returns how many migrations ran.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    conn.execute_batch(VERSION_TABLE)
        .map_err(|e| migration_error("schema_version", &e))?;
    let current = current_version(conn)?;

    let mut applied = 0;
    for &(version, description, sql) in MIGRATIONS.iter().filter(|(v, ..)| *v > current) {
        info!(version, description, "applying permission schema migration");
        let context = format!("v{version} ({description})");
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| migration_error(&context, &e))?;
        let _ = tx
            .execute_batch(sql)
            .and_then(|()| {
                tx.execute(
                    "INSERT INTO schema_version (version, applied_at, description) \
                     VALUES (?1, datetime('now'), ?2)",
                    params![version, description],
                )
            })
            .map_err(|e| migration_error(&context, &e))?;
        tx.commit().map_err(|e| migration_error(&context, &e))?;
        applied += 1;
    }
    Ok(applied)
}

/// Highest applied version, 0 on a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
        row.get(0)
    })
    .map_err(|e| migration_error("schema_version", &e))
}

/// Version the code expects.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |&(v, ..)| v)
}
