//! Idempotent schema setup for both databases.
//!
//! The backend database holds indexed documents, their passages, an FTS5
//! index over passage text, and passage vectors. The cache database holds
//! only `cache_entries`.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create both databases from config. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let backend = db::connect(&config.db.path).await?;
    migrate_backend(&backend).await?;
    backend.close().await;

    let cache = db::connect(&config.cache.path).await?;
    migrate_cache(&cache).await?;
    cache.close().await;
    Ok(())
}

pub async fn migrate_backend(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            handle TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            display_name TEXT,
            page_count INTEGER NOT NULL,
            passage_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            activated_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS passages (
            handle TEXT NOT NULL,
            id TEXT NOT NULL,
            text TEXT NOT NULL,
            source_page INTEGER NOT NULL,
            passage_class TEXT NOT NULL,
            position INTEGER NOT NULL,
            hash TEXT NOT NULL,
            PRIMARY KEY (handle, id),
            FOREIGN KEY (handle) REFERENCES documents(handle) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS passage_vectors (
            handle TEXT NOT NULL,
            passage_id TEXT NOT NULL,
            dims INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (handle, passage_id),
            FOREIGN KEY (handle) REFERENCES documents(handle) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='passages_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE passages_fts USING fts5(
                passage_id UNINDEXED,
                handle UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_document_id ON documents(document_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_passages_handle_position ON passages(handle, position)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn migrate_cache(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            document_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            status TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            backend_handle TEXT,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        run_migrations(&config).await.unwrap();
        run_migrations(&config).await.unwrap();

        let pool = db::connect(&config.db.path).await.unwrap();
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        for t in ["documents", "passage_vectors", "passages", "passages_fts"] {
            assert!(tables.iter().any(|n| n == t), "missing table {}", t);
        }
        pool.close().await;
    }
}
