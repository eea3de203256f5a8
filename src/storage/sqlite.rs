//! SQLite-backed persistence for `database` storage mode.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::cache_index::CacheHandle;
use crate::key_pool::UpstreamKey;
use crate::types::{Credential, Message};

pub fn build_pool(db_path: &Path) -> anyhow::Result<Pool<SqliteConnectionManager>> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let manager = SqliteConnectionManager::file(db_path);
    let pool = Pool::builder().max_size(8).build(manager)?;
    init_schema(&pool)?;
    Ok(pool)
}

/// Idempotent schema creation. No versioned migration engine is used.
pub fn init_schema(pool: &Pool<SqliteConnectionManager>) -> anyhow::Result<()> {
    let conn = pool.get()?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS upstream_keys (
            id TEXT PRIMARY KEY,
            secret TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            expires_at TEXT,
            context_completion_enabled INTEGER NOT NULL DEFAULT 0,
            last_used_at TEXT
        );

        CREATE TABLE IF NOT EXISTS contexts (
            credential TEXT PRIMARY KEY,
            turns_json TEXT NOT NULL,
            last_used TEXT NOT NULL,
            created TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_handles (
            id TEXT PRIMARY KEY,
            upstream_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            owning_key_id TEXT NOT NULL,
            credential TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cache_handles_credential_hash
            ON cache_handles (credential, content_hash);
        "#,
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────
// Contexts
// ─────────────────────────────────────────────────────────────────────────

pub fn load_context(
    pool: &Pool<SqliteConnectionManager>,
    credential: &Credential,
) -> anyhow::Result<Vec<Message>> {
    let conn = pool.get()?;
    let result: rusqlite::Result<String> = conn.query_row(
        "SELECT turns_json FROM contexts WHERE credential = ?1",
        params![credential.as_str()],
        |row| row.get(0),
    );
    match result {
        Ok(json) => Ok(serde_json::from_str(&json)?),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub fn save_context(
    pool: &Pool<SqliteConnectionManager>,
    credential: &Credential,
    turns: &[Message],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let conn = pool.get()?;
    let json = serde_json::to_string(turns)?;
    conn.execute(
        "INSERT INTO contexts (credential, turns_json, last_used, created)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(credential) DO UPDATE SET turns_json = excluded.turns_json, last_used = excluded.last_used",
        params![credential.as_str(), json, now.to_rfc3339()],
    )?;
    Ok(())
}

pub fn delete_context(
    pool: &Pool<SqliteConnectionManager>,
    credential: &Credential,
) -> anyhow::Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "DELETE FROM contexts WHERE credential = ?1",
        params![credential.as_str()],
    )?;
    Ok(())
}

pub fn sweep_expired_contexts(
    pool: &Pool<SqliteConnectionManager>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> anyhow::Result<usize> {
    let conn = pool.get()?;
    let cutoff = now - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
    let removed = conn.execute(
        "DELETE FROM contexts WHERE last_used < ?1",
        params![cutoff.to_rfc3339()],
    )?;
    Ok(removed)
}

// ─────────────────────────────────────────────────────────────────────────
// Upstream keys
// ─────────────────────────────────────────────────────────────────────────

pub fn load_keys(pool: &Pool<SqliteConnectionManager>) -> anyhow::Result<Vec<UpstreamKey>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, secret, description, enabled, created_at, expires_at,
                context_completion_enabled, last_used_at
         FROM upstream_keys",
    )?;
    let rows = stmt.query_map([], |row| {
        let created_at: String = row.get(4)?;
        let expires_at: Option<String> = row.get(5)?;
        let last_used_at: Option<String> = row.get(7)?;
        Ok(UpstreamKey {
            id: row.get(0)?,
            secret: row.get(1)?,
            description: row.get(2)?,
            enabled: row.get::<_, i64>(3)? != 0,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            expires_at: expires_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
            context_completion_enabled: row.get::<_, i64>(6)? != 0,
            last_used_at: last_used_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn upsert_key(pool: &Pool<SqliteConnectionManager>, key: &UpstreamKey) -> anyhow::Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO upstream_keys
            (id, secret, description, enabled, created_at, expires_at, context_completion_enabled, last_used_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            secret = excluded.secret,
            description = excluded.description,
            enabled = excluded.enabled,
            expires_at = excluded.expires_at,
            context_completion_enabled = excluded.context_completion_enabled,
            last_used_at = excluded.last_used_at",
        params![
            key.id,
            key.secret,
            key.description,
            key.enabled as i64,
            key.created_at.to_rfc3339(),
            key.expires_at.map(|d| d.to_rfc3339()),
            key.context_completion_enabled as i64,
            key.last_used_at.map(|d| d.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn delete_key(pool: &Pool<SqliteConnectionManager>, id: &str) -> anyhow::Result<()> {
    let conn = pool.get()?;
    conn.execute("DELETE FROM upstream_keys WHERE id = ?1", params![id])?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────
// Cache handles
// ─────────────────────────────────────────────────────────────────────────

pub fn load_cache_handles(pool: &Pool<SqliteConnectionManager>) -> anyhow::Result<Vec<CacheHandle>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, upstream_id, content_hash, owning_key_id, credential, created_at, expires_at
         FROM cache_handles",
    )?;
    let rows = stmt.query_map([], |row| {
        let created_at: String = row.get(5)?;
        let expires_at: String = row.get(6)?;
        Ok(CacheHandle {
            local_id: row.get(0)?,
            upstream_cache_id: row.get(1)?,
            content_hash: row.get(2)?,
            owning_key_id: row.get(3)?,
            credential: Credential::new(row.get::<_, String>(4)?),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            expires_at: DateTime::parse_from_rfc3339(&expires_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn insert_cache_handle(
    pool: &Pool<SqliteConnectionManager>,
    handle: &CacheHandle,
) -> anyhow::Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO cache_handles
            (id, upstream_id, content_hash, owning_key_id, credential, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            handle.local_id,
            handle.upstream_cache_id,
            handle.content_hash,
            handle.owning_key_id,
            handle.credential.as_str(),
            handle.created_at.to_rfc3339(),
            handle.expires_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn delete_cache_handle(pool: &Pool<SqliteConnectionManager>, local_id: &str) -> anyhow::Result<()> {
    let conn = pool.get()?;
    conn.execute("DELETE FROM cache_handles WHERE id = ?1", params![local_id])?;
    Ok(())
}

pub fn expire_cache_handle(pool: &Pool<SqliteConnectionManager>, local_id: &str) -> anyhow::Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE cache_handles SET expires_at = ?2 WHERE id = ?1",
        params![local_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}
