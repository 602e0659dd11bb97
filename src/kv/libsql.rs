use super::KvStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ::libsql::{Builder, Connection, params};
use std::{path::Path, time::Duration};

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS kv_expires_at ON kv(expires_at);
        "#,
    )
    .await?;
    Ok(())
}

/// KV table in a local libsql database. `expires_at` holds the retention
/// deadline in unix milliseconds; rows past it read as missing.
#[derive(Clone)]
pub struct LibsqlKv {
    conn: Connection,
}

impl LibsqlKv {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating kv directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening kv DB {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Deletes rows whose retention deadline has passed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let removed = self
            .conn
            .execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
            .await
            .context("purging expired kv rows")?;
        Ok(removed)
    }
}

#[async_trait]
impl KvStore for LibsqlKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp_millis();
        let stmt = self
            .conn
            .prepare(
                r#"
                SELECT value
                FROM kv
                WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                "#,
            )
            .await?;
        let mut rows = stmt.query(params![key, now]).await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(row.get::<String>(0)?))
    }

    async fn put(&self, key: &str, value: &str, retain_for: Option<Duration>) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let expires_at: Option<i64> =
            retain_for.map(|retain| now.saturating_add(retain.as_millis() as i64));
        self.conn
            .execute(
                r#"
                INSERT INTO kv (key, value, expires_at, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                "#,
                params![key, value, expires_at, now],
            )
            .await
            .with_context(|| format!("writing kv row {key}"))?;
        let purged = self.purge_expired().await?;
        if purged > 0 {
            tracing::debug!(purged, "purged expired kv rows");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .await
            .with_context(|| format!("deleting kv row {key}"))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "libsql"
    }
}
