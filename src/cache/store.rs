//! SQLite-backed durable layer of the tool cache.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::{CacheEntry, Fingerprint};
use crate::error::CacheError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tool_cache (
    fingerprint TEXT PRIMARY KEY,
    tool        TEXT NOT NULL,
    payload     TEXT NOT NULL,
    inserted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tool_cache_tool ON tool_cache(tool);
"#;

#[derive(Clone)]
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    pub async fn open(path: &str) -> Result<Self, CacheError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(path = path, "Tool cache opened");
        Ok(Self { pool })
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let row = sqlx::query("SELECT payload, inserted_at FROM tool_cache WHERE fingerprint = ?1")
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: Value = serde_json::from_str(&row.get::<String, _>("payload"))?;
        let inserted_at = DateTime::parse_from_rfc3339(&row.get::<String, _>("inserted_at"))
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(CacheEntry {
            payload,
            inserted_at,
        }))
    }

    /// Upserts one entry. Concurrent writers of the same key: last one wins.
    pub async fn put(
        &self,
        fingerprint: &Fingerprint,
        tool: &str,
        payload: &Value,
        inserted_at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO tool_cache (fingerprint, tool, payload, inserted_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(fingerprint) DO UPDATE SET
                tool = excluded.tool,
                payload = excluded.payload,
                inserted_at = excluded.inserted_at",
        )
        .bind(fingerprint.as_str())
        .bind(tool)
        .bind(serde_json::to_string(payload)?)
        .bind(inserted_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, CacheError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tool_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Per-tool entry counts, largest first.
    pub async fn count_by_tool(&self) -> Result<Vec<(String, u64)>, CacheError> {
        let rows = sqlx::query(
            "SELECT tool, COUNT(*) AS n FROM tool_cache GROUP BY tool ORDER BY n DESC, tool",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("tool"), r.get::<i64, _>("n") as u64))
            .collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let store = SqliteCacheStore::open(path.to_str().unwrap()).await.unwrap();

        let fp = Fingerprint::of("search", &json!({"q": "rust"}));
        assert!(store.get(&fp).await.unwrap().is_none());

        store.put(&fp, "search", &json!({"hits": 3}), Utc::now()).await.unwrap();
        store.put(&fp, "search", &json!({"hits": 4}), Utc::now()).await.unwrap();

        let entry = store.get(&fp).await.unwrap().unwrap();
        assert_eq!(entry.payload, json!({"hits": 4}));
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(
            store.count_by_tool().await.unwrap(),
            vec![("search".to_string(), 1)]
        );
        store.close().await;
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let fp = Fingerprint::of("browse", &json!({"url": "https://example.com"}));

        let store = SqliteCacheStore::open(path.to_str().unwrap()).await.unwrap();
        store.put(&fp, "browse", &json!("page"), Utc::now()).await.unwrap();
        store.close().await;

        let reopened = SqliteCacheStore::open(path.to_str().unwrap()).await.unwrap();
        assert_eq!(reopened.get(&fp).await.unwrap().unwrap().payload, json!("page"));
    }
}
