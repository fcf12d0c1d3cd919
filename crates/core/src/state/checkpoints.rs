//! # Checkpoints
//!
//! Durable per-stage snapshots of the pipeline context, written after every
//! successful (or redo-healed) stage and read back only to resume. Each
//! checkpoint is self-contained, so stores overwrite or create one blob per
//! stage key without any multi-key transaction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;

use super::db::RelayDb;

const CHECKPOINT_PREFIX: &str = "checkpoint_";

/// Deterministic blob name for a stage
pub fn checkpoint_name(stage_key: &str) -> String {
    format!("{CHECKPOINT_PREFIX}{stage_key}")
}

/// A snapshot of the context taken right after a stage completed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// `checkpoint_<stage_key>`
    pub name: String,
    pub stage_key: String,
    pub saved_at: DateTime<Utc>,
    /// Serialized context
    pub state: serde_json::Value,
}

impl Checkpoint {
    pub fn new(stage_key: &str, state: serde_json::Value) -> Self {
        Self {
            name: checkpoint_name(stage_key),
            stage_key: stage_key.to_string(),
            saved_at: Utc::now(),
            state,
        }
    }
}

/// Keyed blob storage for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Overwrite or create the checkpoint for `checkpoint.stage_key`
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn load(&self, stage_key: &str) -> Result<Option<Checkpoint>>;

    /// Every stored checkpoint, oldest first
    async fn list(&self) -> Result<Vec<Checkpoint>>;

    /// Delete every checkpoint
    async fn clear(&self) -> Result<()>;
}

/// Find where to resume: scans `stage_keys` from the end for the newest
/// existing checkpoint and returns the index right after it.
pub async fn resume_point(
    store: &dyn CheckpointStore,
    stage_keys: &[String],
) -> Result<Option<(usize, Checkpoint)>> {
    for (index, key) in stage_keys.iter().enumerate().rev() {
        if let Some(checkpoint) = store.load(key).await? {
            return Ok(Some((index + 1, checkpoint)));
        }
    }
    Ok(None)
}

/// One `checkpoint_<stage>.json` file per stage in a directory
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, stage_key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", checkpoint_name(stage_key)))
    }

    async fn checkpoint_files(&self) -> Result<Vec<PathBuf>> {
        if !fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read directory: {:?}", self.dir))?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(CHECKPOINT_PREFIX) && name.ends_with(".json") {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    async fn read(path: &Path) -> Result<Checkpoint> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read checkpoint: {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Corrupt checkpoint: {:?}", path))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", self.dir))?;

        let path = self.path_for(&checkpoint.stage_key);
        let content = serde_json::to_string_pretty(checkpoint)?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write checkpoint: {:?}", path))?;

        tracing::debug!(path = ?path, stage = %checkpoint.stage_key, "Checkpoint written");
        Ok(())
    }

    async fn load(&self, stage_key: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(stage_key);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Self::read(&path).await.map(Some)
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for path in self.checkpoint_files().await? {
            match Self::read(&path).await {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => tracing::warn!(path = ?path, "Skipping unreadable checkpoint: {:#}", e),
            }
        }
        checkpoints.sort_by_key(|c| c.saved_at);
        Ok(checkpoints)
    }

    async fn clear(&self) -> Result<()> {
        for path in self.checkpoint_files().await? {
            fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to remove checkpoint: {:?}", path))?;
        }
        Ok(())
    }
}

/// Checkpoints stored as rows of a SQLite table
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteCheckpointStore {
    /// Create from a shared RelayDb connection
    pub fn new(db: &RelayDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn row_to_checkpoint(row: &rusqlite::Row) -> rusqlite::Result<Checkpoint> {
        let saved_at: String = row.get(2)?;
        let state: String = row.get(3)?;

        Ok(Checkpoint {
            name: row.get(0)?,
            stage_key: row.get(1)?,
            saved_at: DateTime::parse_from_rfc3339(&saved_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt_column(2, e))?,
            state: serde_json::from_str(&state).map_err(|e| corrupt_column(3, e))?,
        })
    }
}

fn corrupt_column<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let state = serde_json::to_string(&checkpoint.state)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO checkpoints (name, stage_key, saved_at, state)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                checkpoint.name,
                checkpoint.stage_key,
                checkpoint.saved_at.to_rfc3339(),
                state,
            ],
        )
        .context("Failed to save checkpoint")?;

        tracing::debug!(name = %checkpoint.name, "Checkpoint row written");
        Ok(())
    }

    async fn load(&self, stage_key: &str) -> Result<Option<Checkpoint>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.query_row(
            "SELECT name, stage_key, saved_at, state FROM checkpoints WHERE name = ?1",
            params![checkpoint_name(stage_key)],
            Self::row_to_checkpoint,
        )
        .optional()
        .with_context(|| format!("Corrupt checkpoint row: {}", checkpoint_name(stage_key)))
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            "SELECT name, stage_key, saved_at, state FROM checkpoints ORDER BY saved_at ASC",
        )?;
        let checkpoints = stmt
            .query_map([], Self::row_to_checkpoint)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list checkpoints")?;

        Ok(checkpoints)
    }

    async fn clear(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        conn.execute("DELETE FROM checkpoints", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys() -> Vec<String> {
        ["a", "b", "c"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_checkpoint_name() {
        let checkpoint = Checkpoint::new("sim_run", json!({}));
        assert_eq!(checkpoint.name, "checkpoint_sim_run");
    }

    #[tokio::test]
    async fn test_file_store_overwrites_by_stage() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));

        store.save(&Checkpoint::new("a", json!({"v": 1}))).await.unwrap();
        store.save(&Checkpoint::new("a", json!({"v": 2}))).await.unwrap();

        let loaded = store.load("a").await.unwrap().unwrap();
        assert_eq!(loaded.state["v"], 2);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(dir.path().join("checkpoints/checkpoint_a.json").exists());
    }

    #[tokio::test]
    async fn test_file_store_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nothing-here"));

        assert!(store.load("a").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
        assert!(resume_point(&store, &keys()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_point_picks_latest_stage() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&Checkpoint::new("a", json!({"at": "a"}))).await.unwrap();
        store.save(&Checkpoint::new("b", json!({"at": "b"}))).await.unwrap();

        let (index, checkpoint) = resume_point(&store, &keys()).await.unwrap().unwrap();

        assert_eq!(index, 2);
        assert_eq!(checkpoint.state["at"], "b");
    }

    #[tokio::test]
    async fn test_file_store_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&Checkpoint::new("a", json!({}))).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        store.clear().await.unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_sqlite_store_round_trip() {
        let db = RelayDb::open_in_memory().unwrap();
        let store = SqliteCheckpointStore::new(&db);

        store.save(&Checkpoint::new("a", json!({"v": 1}))).await.unwrap();
        store.save(&Checkpoint::new("c", json!({"v": 3}))).await.unwrap();
        store.save(&Checkpoint::new("a", json!({"v": 10}))).await.unwrap();

        assert_eq!(store.load("a").await.unwrap().unwrap().state["v"], 10);
        assert!(store.load("b").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 2);

        let (index, _) = resume_point(&store, &keys()).await.unwrap().unwrap();
        assert_eq!(index, 3);

        store.clear().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_corrupt_row_is_reported() {
        let db = RelayDb::open_in_memory().unwrap();
        let store = SqliteCheckpointStore::new(&db);
        store.save(&Checkpoint::new("a", json!({"v": 1}))).await.unwrap();
        db.connection()
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO checkpoints (name, stage_key, saved_at, state) VALUES (?1, ?2, ?3, ?4)",
                params!["checkpoint_b", "b", "yesterday", "{}"],
            )
            .unwrap();
        db.connection()
            .lock()
            .unwrap()
            .execute(
                "UPDATE checkpoints SET state = '{not json' WHERE name = 'checkpoint_a'",
                [],
            )
            .unwrap();

        let err = store.load("a").await.unwrap_err();
        assert!(format!("{:#}", err).contains("Corrupt checkpoint row: checkpoint_a"));
        assert!(store.load("b").await.is_err());
        assert!(store.list().await.is_err());
        assert!(resume_point(&store, &keys()).await.is_err());
    }
}
