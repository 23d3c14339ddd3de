use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://")
            && !path_part.starts_with(':')
        {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// In-memory database on a single connection, for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feature_windows (
                instrument TEXT NOT NULL,
                family TEXT NOT NULL,
                latest_json TEXT NOT NULL,
                latest_observed_at INTEGER NOT NULL,
                stats_json TEXT NOT NULL,
                last_update INTEGER NOT NULL,
                event_count INTEGER NOT NULL,
                exported_at INTEGER NOT NULL,
                PRIMARY KEY (instrument, family)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create feature_windows table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS predictions (
                id TEXT PRIMARY KEY,
                instrument TEXT NOT NULL,
                decision_time INTEGER NOT NULL,
                target TEXT NOT NULL,
                value REAL NOT NULL,
                confidence REAL NOT NULL,
                probability_up REAL NOT NULL,
                model_version TEXT NOT NULL,
                feature_vector_ref TEXT NOT NULL,
                lead_model TEXT NOT NULL,
                degraded INTEGER NOT NULL,
                payload_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create predictions table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_predictions_instrument_time ON predictions (instrument, decision_time);",
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create predictions index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS explanations (
                prediction_id TEXT PRIMARY KEY,
                feature_vector_ref TEXT NOT NULL,
                model_version TEXT NOT NULL,
                baseline_value REAL NOT NULL,
                method TEXT NOT NULL,
                attributions_json TEXT NOT NULL,
                generated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create explanations table")?;

        info!("Database schema initialized");
        Ok(())
    }
}
