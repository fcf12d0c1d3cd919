//! # IO Utilities
//!
//! File system layout of a project directory:
//!
//! ```text
//! <output_dir>/<YYYYmmdd_HHMMSS>_<id>/
//!     checkpoints/checkpoint_<stage>.json   (or checkpoints.db)
//!     context.json
//!     <artifact paths>
//! ```

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::context::Artifact;

/// Final context written on completion
pub const CONTEXT_FILE: &str = "context.json";
/// Subdirectory holding checkpoint files
pub const CHECKPOINT_DIR: &str = "checkpoints";
/// SQLite checkpoint database file
pub const CHECKPOINT_DB: &str = "checkpoints.db";

/// Create a fresh, timestamped project directory under `output_dir`
pub async fn create_project_dir(output_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let path = output_dir
        .as_ref()
        .join(format!("{}_{}", stamp, &suffix[..8]));

    fs::create_dir_all(&path)
        .await
        .with_context(|| format!("Failed to create project directory: {:?}", path))?;
    tracing::info!(path = ?path, "Created project directory");
    Ok(path)
}

pub fn checkpoint_dir(project_dir: impl AsRef<Path>) -> PathBuf {
    project_dir.as_ref().join(CHECKPOINT_DIR)
}

pub fn checkpoint_db_path(project_dir: impl AsRef<Path>) -> PathBuf {
    project_dir.as_ref().join(CHECKPOINT_DB)
}

/// Write every artifact below `project_dir`, returning the written paths.
///
/// Absolute paths and paths with `..` components are rejected before
/// anything is written.
pub async fn write_artifacts(project_dir: impl AsRef<Path>, artifacts: &[Artifact]) -> Result<Vec<PathBuf>> {
    let project_dir = project_dir.as_ref();

    for artifact in artifacts {
        let escapes = artifact
            .relative_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || artifact.relative_path.as_os_str().is_empty() {
            bail!(
                "Artifact path must stay inside the project directory: {:?}",
                artifact.relative_path
            );
        }
    }

    let mut written = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let path = project_dir.join(&artifact.relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &artifact.content)
            .await
            .with_context(|| format!("Failed to write artifact: {:?}", path))?;
        written.push(path);
    }

    Ok(written)
}
