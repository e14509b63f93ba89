//! `SQLite`-backed [`GrantRepository`].

pub mod connection;
pub mod migrations;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::warn;
use warden_core::{CapabilityScope, Origin};

use crate::errors::{PermissionError, Result};
use crate::grant::{Grant, GrantStatus, OriginPermissionRecord};
use crate::repository::GrantRepository;

use self::connection::ConnectionPool;

/// Durable grant storage. Survives restarts.
#[derive(Clone, Debug)]
pub struct SqliteGrantRepository {
    pool: ConnectionPool,
}

impl SqliteGrantRepository {
    /// Open (or create) the database at `path` and apply migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| PermissionError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        Self::from_pool(connection::open_file(path)?)
    }

    /// In-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::from_pool(connection::open_memory()?)
    }

    fn from_pool(pool: ConnectionPool) -> Result<Self> {
        let conn = pool.get()?;
        let _ = migrations::run_migrations(&conn)?;
        drop(conn);
        Ok(Self { pool })
    }
}

fn now_text() -> String {
    Utc::now().to_rfc3339()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PermissionError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn ensure_origin(conn: &Connection, origin: &Origin) -> Result<()> {
    let now = now_text();
    let _ = conn.execute(
        "INSERT INTO origins (origin, created_at, updated_at) VALUES (?1, ?2, ?2)
         ON CONFLICT(origin) DO UPDATE SET updated_at = excluded.updated_at",
        params![origin.as_str(), now],
    )?;
    Ok(())
}

struct GrantRow {
    scope: String,
    status: String,
    granted_at: String,
    expires_at: Option<String>,
    bound_context: Option<String>,
}

impl GrantRow {
    fn into_grant(self) -> Result<Option<(CapabilityScope, Grant)>> {
        let Ok(scope) = self.scope.parse::<CapabilityScope>() else {
            warn!(scope = %self.scope, "skipping grant for unknown scope");
            return Ok(None);
        };
        let status = GrantStatus::parse(&self.status)
            .ok_or_else(|| PermissionError::Corrupt(format!("bad status {:?}", self.status)))?;
        let grant = Grant {
            status,
            granted_at: parse_time(&self.granted_at)?,
            expires_at: self.expires_at.as_deref().map(parse_time).transpose()?,
            bound_context: self.bound_context,
        };
        Ok(Some((scope, grant)))
    }
}

fn load_record(conn: &Connection, origin: &Origin) -> Result<Option<OriginPermissionRecord>> {
    let tools: Option<Option<String>> = conn
        .query_row(
            "SELECT allowed_tools FROM origins WHERE origin = ?1",
            params![origin.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(tools) = tools else {
        return Ok(None);
    };
    let allowed_tools = tools
        .map(|json| serde_json::from_str::<BTreeSet<String>>(&json))
        .transpose()?;

    let mut stmt = conn.prepare(
        "SELECT scope, status, granted_at, expires_at, bound_context
         FROM grants WHERE origin = ?1",
    )?;
    let rows = stmt.query_map(params![origin.as_str()], |row| {
        Ok(GrantRow {
            scope: row.get(0)?,
            status: row.get(1)?,
            granted_at: row.get(2)?,
            expires_at: row.get(3)?,
            bound_context: row.get(4)?,
        })
    })?;

    let mut scopes = BTreeMap::new();
    for row in rows {
        if let Some((scope, grant)) = row?.into_grant()? {
            let _ = scopes.insert(scope, grant);
        }
    }
    Ok(Some(OriginPermissionRecord {
        origin: origin.clone(),
        scopes,
        allowed_tools,
    }))
}

impl GrantRepository for SqliteGrantRepository {
    fn load(&self, origin: &Origin) -> Result<Option<OriginPermissionRecord>> {
        let conn = self.pool.get()?;
        load_record(&conn, origin)
    }

    fn put_grant(&self, origin: &Origin, scope: CapabilityScope, grant: &Grant) -> Result<()> {
        let conn = self.pool.get()?;
        if grant.status == GrantStatus::NotGranted {
            let _ = conn.execute(
                "DELETE FROM grants WHERE origin = ?1 AND scope = ?2",
                params![origin.as_str(), scope.as_str()],
            )?;
            return Ok(());
        }
        let tx = conn.unchecked_transaction()?;
        ensure_origin(&tx, origin)?;
        let _ = tx.execute(
            "INSERT INTO grants (origin, scope, status, granted_at, expires_at, bound_context)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(origin, scope) DO UPDATE SET
               status = excluded.status,
               granted_at = excluded.granted_at,
               expires_at = excluded.expires_at,
               bound_context = excluded.bound_context",
            params![
                origin.as_str(),
                scope.as_str(),
                grant.status.as_str(),
                grant.granted_at.to_rfc3339(),
                grant.expires_at.map(|t| t.to_rfc3339()),
                grant.bound_context,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_grant(&self, origin: &Origin, scope: CapabilityScope) -> Result<bool> {
        let changed = self.pool.get()?.execute(
            "DELETE FROM grants WHERE origin = ?1 AND scope = ?2",
            params![origin.as_str(), scope.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn set_allowed_tools(&self, origin: &Origin, tools: Option<&BTreeSet<String>>) -> Result<()> {
        let conn = self.pool.get()?;
        let json = tools.map(serde_json::to_string).transpose()?;
        let tx = conn.unchecked_transaction()?;
        ensure_origin(&tx, origin)?;
        let _ = tx.execute(
            "UPDATE origins SET allowed_tools = ?2 WHERE origin = ?1",
            params![origin.as_str(), json],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_origin(&self, origin: &Origin) -> Result<bool> {
        let changed = self.pool.get()?.execute(
            "DELETE FROM origins WHERE origin = ?1",
            params![origin.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn delete_context_grants(&self, context: &str) -> Result<usize> {
        Ok(self.pool.get()?.execute(
            "DELETE FROM grants WHERE bound_context = ?1",
            params![context],
        )?)
    }

    fn list(&self) -> Result<Vec<OriginPermissionRecord>> {
        let conn = self.pool.get()?;
        let origins: Vec<String> = conn
            .prepare("SELECT origin FROM origins ORDER BY origin")?
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        let mut records = Vec::with_capacity(origins.len());
        for raw in origins {
            let origin = Origin::parse(&raw)
                .map_err(|e| PermissionError::Corrupt(e.to_string()))?;
            if let Some(record) = load_record(&conn, &origin)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;

    fn origin() -> Origin {
        Origin::parse("https://a.example").unwrap()
    }

    #[test]
    fn bad_timestamp_is_corrupt() {
        assert_matches!(parse_time("yesterday"), Err(PermissionError::Corrupt(msg)) if msg.contains("yesterday"));
        assert!(parse_time("2026-01-01T00:00:00Z").is_ok());
    }

    #[test]
    fn grants_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.db");
        let now = Utc::now();
        {
            let repo = SqliteGrantRepository::open(&path).unwrap();
            repo.put_grant(&origin(), CapabilityScope::GenerateText, &Grant::always(now))
                .unwrap();
            repo.put_grant(
                &origin(),
                CapabilityScope::BrowserRead,
                &Grant::once(now, Duration::minutes(10), Some("tab-1".into())),
            )
            .unwrap();
            repo.set_allowed_tools(&origin(), Some(&BTreeSet::from(["srv/y".to_string()])))
                .unwrap();
        }
        let repo = SqliteGrantRepository::open(&path).unwrap();
        let record = repo.load(&origin()).unwrap().unwrap();
        assert_eq!(
            record.scopes[&CapabilityScope::GenerateText].status,
            GrantStatus::GrantedAlways
        );
        let once = &record.scopes[&CapabilityScope::BrowserRead];
        assert_eq!(once.bound_context.as_deref(), Some("tab-1"));
        assert_eq!(
            once.expires_at.unwrap().timestamp(),
            (now + Duration::minutes(10)).timestamp()
        );
        assert!(record.tool_allowed("srv/y"));
        assert!(!record.tool_allowed("srv/x"));
    }

    #[test]
    fn upsert_keeps_one_row_per_scope() {
        let repo = SqliteGrantRepository::in_memory().unwrap();
        let now = Utc::now();
        repo.put_grant(&origin(), CapabilityScope::ToolCall, &Grant::denied(now)).unwrap();
        repo.put_grant(&origin(), CapabilityScope::ToolCall, &Grant::always(now)).unwrap();
        let record = repo.load(&origin()).unwrap().unwrap();
        assert_eq!(record.scopes.len(), 1);
        assert_eq!(record.scopes[&CapabilityScope::ToolCall].status, GrantStatus::GrantedAlways);
    }

    #[test]
    fn delete_origin_cascades() {
        let repo = SqliteGrantRepository::in_memory().unwrap();
        repo.put_grant(&origin(), CapabilityScope::WebFetch, &Grant::always(Utc::now()))
            .unwrap();
        assert!(repo.delete_origin(&origin()).unwrap());
        assert!(repo.load(&origin()).unwrap().is_none());
        let count: i64 = repo
            .pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM grants", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(!repo.delete_origin(&origin()).unwrap());
    }

    #[test]
    fn context_grants_are_deleted() {
        let repo = SqliteGrantRepository::in_memory().unwrap();
        let now = Utc::now();
        repo.put_grant(
            &origin(),
            CapabilityScope::BrowserRead,
            &Grant::once(now, Duration::minutes(5), Some("conn_1".into())),
        )
        .unwrap();
        repo.put_grant(&origin(), CapabilityScope::WebFetch, &Grant::always(now)).unwrap();
        assert_eq!(repo.delete_context_grants("conn_1").unwrap(), 1);
        let record = repo.load(&origin()).unwrap().unwrap();
        assert!(!record.scopes.contains_key(&CapabilityScope::BrowserRead));
    }

    #[test]
    fn allowlist_can_be_cleared() {
        let repo = SqliteGrantRepository::in_memory().unwrap();
        repo.set_allowed_tools(&origin(), Some(&BTreeSet::new())).unwrap();
        assert!(!repo.load(&origin()).unwrap().unwrap().tool_allowed("srv/x"));
        repo.set_allowed_tools(&origin(), None).unwrap();
        assert!(repo.load(&origin()).unwrap().unwrap().tool_allowed("srv/x"));
    }

    #[test]
    fn list_returns_every_origin() {
        let repo = SqliteGrantRepository::in_memory().unwrap();
        let b = Origin::parse("https://b.example").unwrap();
        repo.put_grant(&origin(), CapabilityScope::ListTools, &Grant::always(Utc::now()))
            .unwrap();
        repo.put_grant(&b, CapabilityScope::ListTools, &Grant::denied(Utc::now()))
            .unwrap();
        let records = repo.list().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].origin, origin());
    }
}
