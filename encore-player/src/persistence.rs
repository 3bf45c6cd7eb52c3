//! Durable session snapshots
//!
//! The session is persisted as a versioned JSON document in the per-user
//! config directory. Writes go through a temp file and an atomic rename so
//! a crash mid-write can never corrupt the previous snapshot. Progress-only
//! updates are debounced (coalesced into at most one write per window);
//! structural changes (track, queue, modes) flush immediately.
//!
//! Loading is deliberately forgiving: a missing, corrupt, or
//! schema-mismatched file is a cold start, never a crash, and a restored
//! session always comes back paused.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use encore_common::model::Session;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Snapshot schema version. Mismatched snapshots are discarded wholesale;
/// there is no migration path.
pub const SCHEMA_VERSION: u32 = 1;

/// On-disk snapshot document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub schema_version: u32,
    #[serde(flatten)]
    pub session: Session,
    pub last_updated: DateTime<Utc>,
}

/// What kind of change a save carries, deciding its write policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    /// Progress-only delta; coalesced into the debounce window
    Progress,
    /// Track/queue/mode change; flushed immediately
    Structural,
}

#[derive(Default)]
struct Pending {
    snapshot: Option<Session>,
    flush_task: Option<JoinHandle<()>>,
}

struct Inner {
    path: PathBuf,
    debounce: Duration,
    pending: Mutex<Pending>,
}

/// Debounced, crash-safe session snapshot writer/loader.
#[derive(Clone)]
pub struct SessionPersistence {
    inner: Arc<Inner>,
}

impl SessionPersistence {
    pub fn new(path: PathBuf, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                debounce,
                pending: Mutex::new(Pending::default()),
            }),
        }
    }

    /// Record a new snapshot and schedule (or perform) its write.
    pub async fn save(&self, session: &Session, kind: SaveKind) {
        let normalized = normalize(session);
        match kind {
            SaveKind::Structural => {
                // An immediate write supersedes any pending debounced flush.
                let stale = {
                    let mut pending = self.inner.pending.lock().expect("persistence lock");
                    pending.snapshot = Some(normalized);
                    pending.flush_task.take()
                };
                if let Some(task) = stale {
                    task.abort();
                }
                write_pending(&self.inner).await;
            }
            SaveKind::Progress => {
                let mut pending = self.inner.pending.lock().expect("persistence lock");
                pending.snapshot = Some(normalized);
                if pending.flush_task.is_none() {
                    // First progress update of a window opens the timer;
                    // later ones just refresh the snapshot it will write.
                    let inner = Arc::clone(&self.inner);
                    let debounce = self.inner.debounce;
                    pending.flush_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(debounce).await;
                        write_pending(&inner).await;
                        inner
                            .pending
                            .lock()
                            .expect("persistence lock")
                            .flush_task = None;
                    }));
                }
            }
        }
    }

    /// Force the latest snapshot to disk, synchronously. Shutdown path.
    pub fn flush_sync(&self) {
        let (snapshot, stale) = {
            let mut pending = self.inner.pending.lock().expect("persistence lock");
            (pending.snapshot.clone(), pending.flush_task.take())
        };
        if let Some(task) = stale {
            task.abort();
        }
        let Some(session) = snapshot else { return };
        if let Err(e) = write_document_sync(&self.inner.path, &session) {
            warn!(path = %self.inner.path.display(), "final session flush failed: {e}");
        }
    }

    /// Load the persisted session, if a usable snapshot exists.
    ///
    /// Any failure is a cold start: missing file, unreadable file, parse
    /// error, or schema mismatch all return None.
    pub fn load(&self) -> Option<Session> {
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.inner.path.display(), "no persisted session");
                return None;
            }
            Err(e) => {
                warn!(path = %self.inner.path.display(), "could not read persisted session: {e}");
                return None;
            }
        };

        let doc: PersistedSession = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.inner.path.display(), "discarding corrupt persisted session: {e}");
                return None;
            }
        };

        if doc.schema_version != SCHEMA_VERSION {
            warn!(
                found = doc.schema_version,
                expected = SCHEMA_VERSION,
                "discarding persisted session with mismatched schema"
            );
            return None;
        }

        Some(normalize(&doc.session))
    }

    /// Remove the snapshot file. Missing file is fine.
    pub fn clear(&self) {
        if let Err(e) = std::fs::remove_file(&self.inner.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.inner.path.display(), "could not remove persisted session: {e}");
            }
        }
    }

    /// The snapshot path (for logging).
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

/// Transient flags never survive a restart: restored sessions come back
/// paused, not loading, with no stale error text.
fn normalize(session: &Session) -> Session {
    let mut s = session.clone();
    s.is_playing = false;
    s.loading = false;
    s.last_error = None;
    s
}

async fn write_pending(inner: &Inner) {
    let snapshot = inner
        .pending
        .lock()
        .expect("persistence lock")
        .snapshot
        .clone();
    let Some(session) = snapshot else { return };
    if let Err(e) = write_document(&inner.path, &session).await {
        // State stays in memory; the next save retries the write.
        warn!(path = %inner.path.display(), "session save failed: {e}");
    }
}

fn document(session: &Session) -> PersistedSession {
    PersistedSession {
        schema_version: SCHEMA_VERSION,
        session: session.clone(),
        last_updated: Utc::now(),
    }
}

async fn write_document(path: &Path, session: &Session) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(&document(session))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &body).await?;
    if tokio::fs::rename(&tmp, path).await.is_err() {
        // Some platforms refuse to rename over an existing file.
        let _ = tokio::fs::remove_file(path).await;
        tokio::fs::rename(&tmp, path).await?;
    }
    Ok(())
}

fn write_document_sync(path: &Path, session: &Session) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(&document(session))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    std::fs::write(&tmp, &body)?;
    if std::fs::rename(&tmp, path).is_err() {
        let _ = std::fs::remove_file(path);
        std::fs::rename(&tmp, path)?;
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
