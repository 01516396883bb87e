//! Store access: connection pool, schema bootstrap, instance registry and
//! read-side query handlers.

pub mod instances;
pub mod queries;
pub mod schema;

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::errors::QanResult;

pub struct ConnectionManager {
    pool: SqlitePool,
}

impl ConnectionManager {
    pub async fn new(database_path: &str, max_connections: u32) -> QanResult<Self> {
        let pool = create_pool(database_path, max_connections).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn create_pool(database_path: &str, max_connections: u32) -> QanResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(database_path)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30))
        .pragma("cache_size", "10000")
        .pragma("temp_store", "memory")
        .pragma("foreign_keys", "ON")
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    // Verify the connection before handing the pool out.
    sqlx::query("SELECT 1").fetch_one(&pool).await?;

    Ok(pool)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_creation_and_query() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        let manager = ConnectionManager::new(path.to_str().unwrap(), 2)
            .await
            .unwrap();

        let row: (i64,) = sqlx::query_as("SELECT 41 + 1")
            .fetch_one(manager.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 42);

        manager.close().await;
    }
}
