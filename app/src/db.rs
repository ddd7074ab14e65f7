use std::str::FromStr;
use std::sync::Arc;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use tracing::{info, warn};

use crate::storage::{KeyValueStorage, MemoryStorage, SqliteStorage};

/// Opens the continuity backend. If the database cannot be opened, the app
/// keeps running on in-process storage that forgets everything on exit.
pub async fn open_storage(database_url: &str) -> Arc<dyn KeyValueStorage> {
    match init_db(database_url).await {
        Ok(pool) => {
            info!("Database initialized");
            Arc::new(SqliteStorage::new(pool))
        }
        Err(err) => {
            warn!(
                "Could not open database {}: {}; watch history will not persist",
                database_url, err
            );
            Arc::new(MemoryStorage::new())
        }
    }
}

pub async fn init_db(database_url: &str) -> anyhow::Result<Pool<Sqlite>> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;

    Ok(pool)
}

pub async fn migrate(pool: &Pool<Sqlite>) -> anyhow::Result<()> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS continuity_store (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Database migrations completed");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unopenable_database_degrades_to_memory() {
        let storage = open_storage("sqlite:///streamshelf-missing-dir/nested/shelf.db").await;

        storage.set_item("streamshelf:last:8123", "{}").await.unwrap();
        assert_eq!(
            storage.get_item("streamshelf:last:8123").await.unwrap().as_deref(),
            Some("{}")
        );
    }

    #[tokio::test]
    async fn database_url_opens_sqlite() {
        let storage = open_storage("sqlite::memory:").await;
        assert_eq!(storage.keys_with_prefix("streamshelf:").await.unwrap(), Vec::<String>::new());
    }
}
