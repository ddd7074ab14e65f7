use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{Pool, Sqlite};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage quota exceeded")]
    QuotaExceeded,

    #[error("Storage unavailable")]
    Unavailable,
}

/// String key/value storage with the semantics of a browser's local storage:
/// last writer wins, values are opaque strings.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Device-local storage backed by the `continuity_store` table.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    db: Pool<Sqlite>,
}

impl SqliteStorage {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KeyValueStorage for SqliteStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM continuity_store WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.db)
                .await?;
        Ok(value)
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO continuity_store (key, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key)
            DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM continuity_store WHERE key = ?")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // substr keeps `%` and `_` in keys from acting as LIKE wildcards
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM continuity_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.db)
        .await?;
        Ok(keys)
    }
}

/// In-process storage. Backs the store when the database cannot be opened;
/// an optional quota makes writes fail the way a full browser store does.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.write().await;
        if let Some(quota) = self.quota_bytes {
            let used: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(StorageError::QuotaExceeded);
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.write().await.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .items
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn sqlite_storage() -> SqliteStorage {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        crate::db::migrate(&pool).await.expect("schema");
        SqliteStorage::new(pool)
    }

    #[tokio::test]
    async fn sqlite_round_trips_and_overwrites() {
        let storage = sqlite_storage().await;
        assert_eq!(storage.get_item("a").await.unwrap(), None);

        storage.set_item("a", "1").await.unwrap();
        storage.set_item("a", "2").await.unwrap();
        assert_eq!(storage.get_item("a").await.unwrap().as_deref(), Some("2"));

        storage.remove_item("a").await.unwrap();
        storage.remove_item("a").await.unwrap();
        assert_eq!(storage.get_item("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_prefix_scan_treats_wildcards_literally() {
        let storage = sqlite_storage().await;
        storage.set_item("p:100%:x", "1").await.unwrap();
        storage.set_item("p:100a:x", "2").await.unwrap();
        storage.set_item("q:1", "3").await.unwrap();

        assert_eq!(storage.keys_with_prefix("p:100%").await.unwrap(), vec!["p:100%:x"]);
        assert_eq!(storage.keys_with_prefix("p:").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn memory_quota_rejects_oversized_writes() {
        let storage = MemoryStorage::with_quota(10);
        storage.set_item("k", "12345").await.unwrap();
        assert!(matches!(
            storage.set_item("j", "1234567").await,
            Err(StorageError::QuotaExceeded)
        ));
        // replacing an existing key only counts the new value
        storage.set_item("k", "123456789").await.unwrap();
    }
}
