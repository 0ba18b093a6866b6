//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. Task snapshots are written far
//! more often than they are read, so every write, including the sequence
//! counter, goes through a single writer connection while listings use a
//! multi-connection reader pool.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use conveyor_types::config::DatabaseSettings;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: Multi-connection pool (up to 8) for concurrent SELECT queries.
/// - `writer`: Single-connection pool for serialized INSERT/UPDATE.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open both pools and run the embedded migrations on the writer.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts)
            .await?;

        // Reader connections are read-only, so the schema must exist first.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        tracing::debug!(url = database_url, "database pool ready");
        Ok(Self { reader, writer })
    }
}

/// Conveyor's data directory: `CONVEYOR_DATA_DIR`, else `~/.conveyor`.
pub fn data_dir() -> PathBuf {
    match std::env::var_os("CONVEYOR_DATA_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conveyor"),
    }
}

/// `sqlite://{data_dir}/conveyor.db`.
pub fn default_database_url(data_dir: &Path) -> String {
    format!("sqlite://{}/conveyor.db", data_dir.display())
}

/// The configured URL, or the default under `data_dir`.
pub fn database_url(settings: &DatabaseSettings, data_dir: &Path) -> String {
    settings
        .url
        .clone()
        .unwrap_or_else(|| default_database_url(data_dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(dir: &tempfile::TempDir, file: &str) -> DatabasePool {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join(file).display());
        DatabasePool::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_pool_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir, "test.db").await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(
            table_names,
            vec!["task_sequences", "workflow_definitions", "workflow_tasks"]
        );
    }

    #[tokio::test]
    async fn test_pool_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir, "test_wal.db").await;

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();

        assert_eq!(result.0.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_reader_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir, "test_ro.db").await;

        let result = sqlx::query("INSERT INTO task_sequences (name, seq) VALUES ('x', 1)")
            .execute(&pool.reader)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn configured_url_wins_over_default() {
        let dir = Path::new("/var/lib/conveyor");
        let mut settings = DatabaseSettings::default();
        assert_eq!(
            database_url(&settings, dir),
            "sqlite:///var/lib/conveyor/conveyor.db"
        );

        settings.url = Some("sqlite://:memory:".to_string());
        assert_eq!(database_url(&settings, dir), "sqlite://:memory:");
    }
}
