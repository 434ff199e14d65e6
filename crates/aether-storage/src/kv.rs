// SQLite-backed KvStore
//
// One table, (namespace, key) primary key, JSON text values. Values are
// whole-row replaced on put; scans are ordered by key so callers get
// deterministic iteration.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use aether_core::{KernelError, KvStore, Result};

/// KvStore over a single SQLite file
#[derive(Clone)]
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    /// Open (or create) the database file and ensure the schema exists
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| KernelError::storage(format!("open {}: {e}", path.as_ref().display())))?;
        let kv = Self { pool };
        kv.migrate().await?;
        info!(path = %path.as_ref().display(), "kv store opened");
        Ok(kv)
    }

    /// In-memory database, for tests
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            // A single pinned connection; dropping it would drop the database
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| KernelError::storage(e.to_string()))?;
        let kv = Self { pool };
        kv.migrate().await?;
        Ok(kv)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key       TEXT NOT NULL,
                value     TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| KernelError::storage(format!("migrate: {e}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let serialized =
            serde_json::to_string(&value).map_err(|e| KernelError::storage(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO kv (namespace, key, value) VALUES ($1, $2, $3)
            ON CONFLICT (namespace, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(serialized)
        .execute(&self.pool)
        .await
        .map_err(|e| KernelError::storage(format!("put {namespace}/{key}: {e}")))?;
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM kv WHERE namespace = $1 AND key = $2")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| KernelError::storage(format!("get {namespace}/{key}: {e}")))?;
        row.map(|row| {
            let raw: String = row.get("value");
            serde_json::from_str(&raw).map_err(|e| KernelError::storage(e.to_string()))
        })
        .transpose()
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv WHERE namespace = $1 AND key = $2")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| KernelError::storage(format!("delete {namespace}/{key}: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query("SELECT key, value FROM kv WHERE namespace = $1 ORDER BY key")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| KernelError::storage(format!("list {namespace}: {e}")))?;
        rows.into_iter()
            .map(|row| {
                let key: String = row.get("key");
                let raw: String = row.get("value");
                let value =
                    serde_json::from_str(&raw).map_err(|e| KernelError::storage(e.to_string()))?;
                Ok((key, value))
            })
            .collect()
    }

    async fn list_prefix(&self, namespace: &str, prefix: &str) -> Result<Vec<(String, Value)>> {
        // LIKE with escaped wildcards, anchored at the start
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let rows = sqlx::query(
            r#"
            SELECT key, value FROM kv
            WHERE namespace = $1 AND key LIKE $2 ESCAPE '\'
            ORDER BY key
            "#,
        )
        .bind(namespace)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KernelError::storage(format!("list_prefix {namespace}: {e}")))?;
        rows.into_iter()
            .map(|row| {
                let key: String = row.get("key");
                let raw: String = row.get("value");
                let value =
                    serde_json::from_str(&raw).map_err(|e| KernelError::storage(e.to_string()))?;
                Ok((key, value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trip_and_replace() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        kv.put("memory", "a", json!({"v": 1})).await.unwrap();
        kv.put("memory", "a", json!({"v": 2})).await.unwrap();
        assert_eq!(kv.get("memory", "a").await.unwrap(), Some(json!({"v": 2})));
        assert!(kv.delete("memory", "a").await.unwrap());
        assert_eq!(kv.get("memory", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_is_ordered_and_namespaced() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        kv.put("users", "b", json!(2)).await.unwrap();
        kv.put("users", "a", json!(1)).await.unwrap();
        kv.put("apps", "c", json!(3)).await.unwrap();

        let rows = kv.list("users").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "a");
        assert_eq!(rows[1].0, "b");
    }

    #[tokio::test]
    async fn prefix_scan_escapes_like_wildcards() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        kv.put("idx", "a_1", json!(null)).await.unwrap();
        kv.put("idx", "ax1", json!(null)).await.unwrap();
        // "_" in the prefix must match literally, not as a wildcard
        let rows = kv.list_prefix("idx", "a_").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "a_1");
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = std::env::temp_dir().join(format!("aether-kv-{}", uuid::Uuid::now_v7()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("test.db");

        {
            let kv = SqliteKv::open(&path).await.unwrap();
            kv.put("memory", "persisted", json!("yes")).await.unwrap();
        }
        let kv = SqliteKv::open(&path).await.unwrap();
        assert_eq!(
            kv.get("memory", "persisted").await.unwrap(),
            Some(json!("yes"))
        );
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
