//! Background-session handle
//!
//! When the player exits with detach enabled, the audio process keeps
//! playing and a small handle file records how to find it again. The next
//! startup consumes the handle exactly once: whether reattachment succeeds
//! or not, the file is removed, so a stale handle can never be retried
//! against the wrong process.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// On-disk record of a detached audio session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundSessionHandle {
    /// Control socket of the still-running audio process
    pub socket_path: PathBuf,
    /// Source reference the process was playing at detach time
    pub source: String,
    /// Track identity at detach time
    pub track_id: String,
    pub created_at: DateTime<Utc>,
}

impl BackgroundSessionHandle {
    pub fn new(socket_path: PathBuf, source: String, track_id: String) -> Self {
        Self {
            socket_path,
            source,
            track_id,
            created_at: Utc::now(),
        }
    }
}

/// Loads, stores and clears the handle file.
#[derive(Debug, Clone)]
pub struct HandleStore {
    path: PathBuf,
}

impl HandleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and remove the handle file. Unreadable or malformed files are
    /// treated the same as absent ones.
    pub fn take(&self) -> Option<BackgroundSessionHandle> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), "could not read session handle: {e}");
                return None;
            }
        };
        self.clear();
        match serde_json::from_str(&raw) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(path = %self.path.display(), "discarding malformed session handle: {e}");
                None
            }
        }
    }

    pub fn store(&self, handle: &BackgroundSessionHandle) -> crate::error::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let doc = serde_json::to_string_pretty(handle)?;
        std::fs::write(&self.path, doc)?;
        debug!(path = %self.path.display(), "recorded background session handle");
        Ok(())
    }

    pub fn clear(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "could not remove session handle: {e}");
            }
        }
    }
}
