use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::RwLock;

pub type DbPool = SqlitePool;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Transactional key-value storage used by the checkpoint store and the
/// persistent cache tier. Entries are grouped by namespace; values are
/// opaque bytes.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    async fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), KvError>;
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), KvError>;
    /// Returns all entries in a namespace, ordered by key.
    async fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, KvError>;
}

pub async fn init_db(database_url: &str) -> Result<DbPool, sqlx::Error> {
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct KvRow {
    key: String,
    value: Vec<u8>,
}

/// SQLite-backed store. The production implementation.
pub struct SqliteKv {
    pool: DbPool,
}

impl SqliteKv {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let value = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT value FROM kv_entries WHERE namespace = ? AND key = ?",
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), KvError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (namespace, key, value, updated_at)
            VALUES (?, ?, ?, datetime('now'))
            ON CONFLICT(namespace, key)
            DO UPDATE SET value = excluded.value, updated_at = datetime('now')
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), KvError> {
        sqlx::query("DELETE FROM kv_entries WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let rows = sqlx::query_as::<_, KvRow>(
            "SELECT key, value FROM kv_entries WHERE namespace = ? ORDER BY key",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| (r.key, r.value)).collect())
    }
}

/// In-memory store for runs without a DATABASE_URL. Nothing survives the
/// process; resume and the persistent cache tier degrade accordingly.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), KvError> {
        let mut entries = self.entries.write().await;
        entries.insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.write().await;
        entries.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn scan(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let entries = self.entries.read().await;
        let mut matched: Vec<(String, Vec<u8>)> = entries
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matched)
    }
}
