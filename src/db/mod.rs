//! Database module for persistent storage.
//!
//! Provides async SQLite database access using SQLx for the banned-IP
//! table. The engine keeps an in-memory mirror of this table; the durable
//! copy is authoritative across restarts.

mod bans;

pub use bans::{Ban, BanRepository};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid timestamp in banned_ips: {0}")]
    InvalidTimestamp(String),
}

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connection acquire timeout - prevents connection storms from blocking indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum time a connection can remain idle before being closed.
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a new database connection, running migrations if needed.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let options = if path == ":memory:" {
            // In-memory mode with shared cache for pool compatibility
            SqliteConnectOptions::new()
                .filename("file::memory:")
                .shared_cache(true)
                .create_if_missing(true)
        } else {
            // Create parent directory if it doesn't exist
            if let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                tracing::warn!(path = %parent.display(), error = %e, "Failed to create database directory");
            }

            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        };

        // Incremental auto-vacuum so compact() can reclaim freed pages.
        let options = options.auto_vacuum(SqliteAutoVacuum::Incremental);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .idle_timeout(Some(Self::IDLE_TIMEOUT))
            .test_before_acquire(true)
            .connect_with(options)
            .await?;

        info!(path = %path, "Database connected");

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Get reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run embedded migrations.
    /// Checks for the table and runs the full migration if missing.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
        async fn table_exists(pool: &SqlitePool, table: &str) -> bool {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
            )
            .bind(table)
            .fetch_one(pool)
            .await
            .unwrap_or(false)
        }

        if !table_exists(pool, "banned_ips").await {
            Self::run_migration_file(pool, include_str!("../../migrations/001_init.sql")).await;
            info!("Database migrations applied (001_init)");
        } else {
            info!("Database already initialized");
        }

        Ok(())
    }

    /// Run a single migration file, executing each statement.
    async fn run_migration_file(pool: &SqlitePool, migration: &str) {
        for statement in migration.split(';') {
            // Remove leading comments and whitespace to get actual SQL
            let mut sql_lines: Vec<&str> = Vec::new();
            for line in statement.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with("--") {
                    continue;
                }
                sql_lines.push(line);
            }

            if sql_lines.is_empty() {
                continue;
            }

            let sql = sql_lines.join("\n");

            if let Err(e) = sqlx::query(&sql).execute(pool).await {
                let err_str = e.to_string();
                if !err_str.contains("already exists") {
                    tracing::warn!(sql = %sql, error = %e, "Migration statement failed");
                }
            }
        }
    }

    /// Reclaim pages freed by deleted bans. Best-effort.
    pub async fn compact(&self) -> Result<(), DbError> {
        sqlx::query("PRAGMA incremental_vacuum")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Get ban repository.
    pub fn bans(&self) -> BanRepository<'_> {
        BanRepository::new(&self.pool)
    }
}
