use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::Result;

/// Durable string key-value store. Values are opaque to the store; writes to
/// the same key are last-writer-wins.
pub trait KeyValueStore: Send + Sync {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn delete<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Keys starting with `prefix`, in lexical order.
    fn keys<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>>;
}

pub struct SqliteKeyValueStore {
    pool: SqlitePool,
}

impl SqliteKeyValueStore {
    pub async fn open(path: &Path) -> Result<Self> {
        debug!(
            event = "sqlite.open",
            db_path = %path.display(),
            create_if_missing = true,
            "sqlite.open"
        );
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                error!(
                    event = "io.sqlite.connect_failed",
                    db_path = %path.display(),
                    error = %e,
                    "io.sqlite.connect_failed"
                );
                e
            })?;

        sqlx::migrate!().run(&pool).await.map_err(|e| {
            error!(
                event = "io.sqlite.migrate_failed",
                db_path = %path.display(),
                error = %e,
                "io.sqlite.migrate_failed"
            );
            e
        })?;
        Ok(Self { pool })
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|r| r.get::<String, _>("value")))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO kv (key, value, updated_at)
                VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM kv WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn keys<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(async move {
            // substr() instead of LIKE: keys may contain '%' or '_'.
            let rows = sqlx::query(
                r#"
                SELECT key
                FROM kv
                WHERE substr(key, 1, length(?1)) = ?1
                ORDER BY key
                "#,
            )
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(|r| r.get::<String, _>("key")).collect())
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    inner: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.inner.lock().await.get(key).cloned()) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.inner.lock().await.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.inner.lock().await.remove(key);
            Ok(())
        })
    }

    fn keys<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .await
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_store_is_last_writer_wins_and_survives_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("kv.sqlite");

        let store = SqliteKeyValueStore::open(&path).await.unwrap();
        store.set("queue/a", "1".to_string()).await.unwrap();
        store.set("queue/a", "2".to_string()).await.unwrap();
        store.set("progress/a-f1", "x".to_string()).await.unwrap();
        store.set("progress/a_%", "y".to_string()).await.unwrap();
        drop(store);

        let store = SqliteKeyValueStore::open(&path).await.unwrap();
        assert_eq!(store.get("queue/a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(
            store.keys("progress/").await.unwrap(),
            vec!["progress/a-f1".to_string(), "progress/a_%".to_string()]
        );
        assert_eq!(store.keys("progress/a_").await.unwrap().len(), 1);

        store.delete("queue/a").await.unwrap();
        assert!(store.get("queue/a").await.unwrap().is_none());
        store.delete("queue/missing").await.unwrap();
    }

    #[tokio::test]
    async fn memory_store_filters_by_prefix() {
        let store = MemoryKeyValueStore::new();
        store.set("queue/q1", "{}".to_string()).await.unwrap();
        store.set("progress/q1-f", "{}".to_string()).await.unwrap();
        assert_eq!(store.keys("queue/").await.unwrap(), vec!["queue/q1"]);
        assert_eq!(store.len().await, 2);
    }
}
