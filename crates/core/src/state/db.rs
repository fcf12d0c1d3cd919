//! # Checkpoint Database
//!
//! SQLite database backing [`SqliteCheckpointStore`](super::SqliteCheckpointStore).
//! Schema changes go through numbered migrations tracked in `schema_version`.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Shared SQLite connection with migrations applied
pub struct RelayDb {
    conn: Arc<Mutex<Connection>>,
}

impl RelayDb {
    /// Open or create a database at `path`
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open checkpoint database: {:?}", path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a shared connection for use by other modules
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Current schema version
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let version = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        if current_version < SCHEMA_VERSION {
            tracing::info!(
                from = current_version,
                to = SCHEMA_VERSION,
                "Checkpoint database migrated"
            );
        }

        Ok(())
    }

    /// Migration to version 1 - checkpoints keyed by name
    fn migrate_v1(conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                name TEXT PRIMARY KEY,
                stage_key TEXT NOT NULL,
                saved_at TEXT NOT NULL,
                state TEXT NOT NULL
            )
            "#,
            [],
        )?;
        Ok(())
    }
}
