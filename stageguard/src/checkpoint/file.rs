//! JSON-file checkpoint store.
//!
//! Layout under the store directory:
//!
//! ```text
//! <dir>/<run_id>.json                       active checkpoint
//! <dir>/archive/<run_id>-<timestamp>.json   archived checkpoints
//! ```
//!
//! Writes go to a temporary file in the same directory which is fsynced and
//! then renamed over the target, so a crash leaves either the old or the new
//! checkpoint, never a torn one.

use super::{Checkpoint, CheckpointStore};
use crate::errors::CheckpointIoError;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const ARCHIVE_DIR: &str = "archive";
const EXTENSION: &str = "json";

/// Stores one JSON file per run.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `dir`. The directory is created lazily.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the active checkpoint of `run_id`.
    pub fn path_for(&self, run_id: &str) -> Result<PathBuf, CheckpointIoError> {
        validate_run_id(run_id)?;
        Ok(self.dir.join(format!("{run_id}.{EXTENSION}")))
    }

    /// Archived checkpoint files of `run_id`, oldest first.
    pub fn archived_paths(&self, run_id: &str) -> Result<Vec<PathBuf>, CheckpointIoError> {
        validate_run_id(run_id)?;
        let archive_dir = self.dir.join(ARCHIVE_DIR);
        if !archive_dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{run_id}-");
        let entries = fs::read_dir(&archive_dir).map_err(|e| {
            CheckpointIoError::new(run_id, "archive", e.to_string()).with_path(&archive_dir)
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn write_atomic(&self, run_id: &str, path: &Path, contents: &str) -> Result<(), CheckpointIoError> {
        let io_err = |e: std::io::Error| {
            CheckpointIoError::new(run_id, "save", e.to_string()).with_path(path)
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut temp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        temp.write_all(contents.as_bytes()).map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

fn validate_run_id(run_id: &str) -> Result<(), CheckpointIoError> {
    let valid = !run_id.is_empty()
        && run_id != "."
        && run_id != ".."
        && !run_id.contains(['/', '\\'])
        && run_id != ARCHIVE_DIR;
    if valid {
        Ok(())
    } else {
        Err(CheckpointIoError::new(
            run_id,
            "resolve",
            "run id must be a non-empty file name",
        ))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointIoError> {
        let path = self.path_for(run_id)?;
        let json = checkpoint.to_json().map_err(|e| {
            CheckpointIoError::new(run_id, "save", e.to_string()).with_path(&path)
        })?;
        self.write_atomic(run_id, &path, &json)?;
        debug!(run_id = %run_id, path = %path.display(), sequence = checkpoint.sequence, "Checkpoint written");
        Ok(())
    }

    fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointIoError> {
        let path = self.path_for(run_id)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointIoError::new(run_id, "load", e.to_string()).with_path(&path))
            }
        };
        Checkpoint::from_json(&contents)
            .map(Some)
            .map_err(|e| CheckpointIoError::new(run_id, "load", e.to_string()).with_path(&path))
    }

    fn archive(&self, run_id: &str) -> Result<(), CheckpointIoError> {
        let path = self.path_for(run_id)?;
        if !path.exists() {
            return Ok(());
        }
        let archive_dir = self.dir.join(ARCHIVE_DIR);
        let target = archive_dir.join(format!(
            "{run_id}-{}.{EXTENSION}",
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
        ));
        let io_err = |e: std::io::Error| {
            CheckpointIoError::new(run_id, "archive", e.to_string()).with_path(&target)
        };
        fs::create_dir_all(&archive_dir).map_err(io_err)?;
        fs::rename(&path, &target).map_err(io_err)?;
        debug!(run_id = %run_id, path = %target.display(), "Checkpoint archived");
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<String>, CheckpointIoError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            CheckpointIoError::new("*", "list", e.to_string()).with_path(&self.dir)
        })?;
        let mut runs: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == EXTENSION))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        runs.sort();
        Ok(runs)
    }
}
