//! Playlist persistence to disk.
//!
//! Keeps the previous file as a backup and moves unreadable files aside so
//! they can be inspected later.

use crate::flat::LoadReport;
use crate::set::PlaylistSet;
use serde_json::Value;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Largest playlist file that will be read (10 MB).
const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create playlist directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to write playlist file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to read playlist file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("corrupt playlist file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("playlist file too large ({size} bytes, max {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct PlaylistStore {
    path: PathBuf,
    backup_path: PathBuf,
    corrupt_path: PathBuf,
}

impl PlaylistStore {
    pub fn new(data_dir: &Path) -> Self {
        Self::at(data_dir.join("playlists.json"))
    }

    /// Store at an explicit file, with backup and corrupt copies beside it.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "playlists".to_string());
        Self {
            backup_path: path.with_file_name(format!("{stem}.backup.json")),
            corrupt_path: path.with_file_name(format!("{stem}.corrupt.json")),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write every flat playlist of `set`, keeping the previous file as backup.
    pub fn save(&self, set: &PlaylistSet) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, &self.backup_path) {
                tracing::warn!(error = %e, "failed to back up playlists; continuing anyway");
            }
        }

        let file = fs::File::create(&self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &set.save_to()).map_err(|e| {
            StoreError::Write {
                path: self.path.clone(),
                source: io::Error::other(e),
            }
        })?;

        tracing::debug!(
            playlists = set.len(),
            path = %self.path.display(),
            "saved playlists"
        );
        Ok(())
    }

    /// Load into `set`, replacing its flat playlists.
    ///
    /// A missing file leaves the set untouched. A corrupt file is moved
    /// aside and the backup is tried before giving up with an empty report.
    pub fn load(&self, set: &mut PlaylistSet) -> StoreResult<LoadReport> {
        if !self.path.exists() {
            return Ok(LoadReport::default());
        }

        match self.read_document(&self.path) {
            Ok(doc) => self.apply(set, &doc, &self.path),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %self.path.display(),
                    "playlist file is corrupt or unreadable"
                );
                if let Err(move_err) = fs::rename(&self.path, &self.corrupt_path) {
                    tracing::warn!(error = %move_err, "failed to preserve corrupt playlist file");
                }

                if self.backup_path.exists() {
                    tracing::info!(path = %self.backup_path.display(), "attempting to recover from backup");
                    match self.read_document(&self.backup_path) {
                        Ok(doc) => return self.apply(set, &doc, &self.backup_path),
                        Err(backup_err) => {
                            tracing::warn!(error = %backup_err, "backup also corrupt; starting fresh");
                        }
                    }
                }
                Ok(LoadReport::default())
            }
        }
    }

    fn apply(&self, set: &mut PlaylistSet, doc: &Value, path: &Path) -> StoreResult<LoadReport> {
        let report = set.load_from(doc).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        tracing::debug!(
            playlists = set.len(),
            entries = report.loaded,
            skipped = report.issues.len(),
            path = %path.display(),
            "loaded playlists"
        );
        Ok(report)
    }

    fn read_document(&self, path: &Path) -> StoreResult<Value> {
        let metadata = fs::metadata(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if metadata.len() > MAX_FILE_SIZE {
            return Err(StoreError::FileTooLarge {
                size: metadata.len(),
                max: MAX_FILE_SIZE,
            });
        }

        let file = fs::File::open(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: Value = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        if !doc.is_array() {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: "expected an array of playlists".to_string(),
            });
        }
        Ok(doc)
    }
}
