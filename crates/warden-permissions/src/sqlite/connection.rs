//! r2d2 pool over `SQLite`. Every pooled connection gets the same pragmas.

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::Result;

/// Pool of grant-database connections.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

const FILE_POOL_SIZE: u32 = 4;
const BUSY_TIMEOUT_MS: u32 = 5_000;
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct GrantPragmas;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for GrantPragmas {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}; PRAGMA foreign_keys = ON;"
        ))
    }
}

fn pool(manager: SqliteConnectionManager, size: u32) -> Result<ConnectionPool> {
    Ok(Pool::builder()
        .max_size(size)
        .connection_timeout(CHECKOUT_TIMEOUT)
        .connection_customizer(Box::new(GrantPragmas))
        .build(manager)?)
}

/// Pool over the database file at `path`.
pub fn open_file(path: &Path) -> Result<ConnectionPool> {
    pool(SqliteConnectionManager::file(path), FILE_POOL_SIZE)
}

/// Single-connection pool over a private in-memory database. Each in-memory
/// connection is its own database, so the pool must never grow.
pub fn open_memory() -> Result<ConnectionPool> {
    pool(SqliteConnectionManager::memory(), 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_pool_applies_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_file(&dir.path().join("grants.db")).unwrap();
        let conn = pool.get().unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        let fk: bool = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
        let busy: u32 = conn.query_row("PRAGMA busy_timeout", [], |r| r.get(0)).unwrap();
        assert_eq!(mode, "wal");
        assert!(fk);
        assert_eq!(busy, BUSY_TIMEOUT_MS);
    }

    #[test]
    fn memory_pool_never_grows() {
        assert_eq!(open_memory().unwrap().max_size(), 1);
    }
}
