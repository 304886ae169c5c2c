//! Private directory holding decoded file payloads while a command runs.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("file payload '{name}' is not valid base64: {source}")]
    Decode {
        name: String,
        source: base64::DecodeError,
    },
    #[error("failed to write staged file {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub original_name: String,
    pub storage_path: PathBuf,
    pub created_at: SystemTime,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct TempFileStore {
    root: PathBuf,
    counter: AtomicU64,
}

impl TempFileStore {
    /// Creates (if needed) and claims the staging directory.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            root,
            counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decodes every payload first, then writes them. Nothing is left on disk
    /// when this returns an error.
    pub async fn stage(&self, files: &BTreeMap<String, String>) -> Result<StagedFiles, StagingError> {
        let mut decoded = Vec::with_capacity(files.len());
        for (name, content) in files {
            let bytes = STANDARD
                .decode(content.trim())
                .map_err(|source| StagingError::Decode {
                    name: name.clone(),
                    source,
                })?;
            decoded.push((name, bytes));
        }

        let mut staged = StagedFiles::empty();
        for (name, bytes) in decoded {
            let path = self.root.join(self.unique_name(name));
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|source| StagingError::Write {
                    path: path.clone(),
                    source,
                })?;
            debug!(
                target: "connector::staging",
                original = %name,
                path = %path.display(),
                bytes = bytes.len(),
                "staged file"
            );
            staged.files.push(StagedFile {
                original_name: name.clone(),
                storage_path: path,
                created_at: SystemTime::now(),
            });
        }
        Ok(staged)
    }

    fn unique_name(&self, original: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{nanos}-{seq}_{}", sanitize_file_name(original))
    }

    /// Deletes regular files whose modification time is older than `max_age`.
    /// Only a failure to list the directory is returned; per-entry failures
    /// are logged and counted.
    pub async fn cleanup_old_files(&self, max_age: Duration) -> io::Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let now = SystemTime::now();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(target: "connector::staging", path = %path.display(), error = %err, "unable to stat staged entry");
                    report.failed += 1;
                    continue;
                }
            };
            if metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    trace!(target: "connector::staging", path = %path.display(), "removed expired file");
                    report.removed += 1;
                }
                Err(err) => {
                    warn!(target: "connector::staging", path = %path.display(), error = %err, "failed to remove expired file");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Starts the periodic age-based sweep. The first pass runs one `interval`
/// after start.
pub fn spawn_sweeper(
    store: Arc<TempFileStore>,
    interval: Duration,
    retention: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match store.cleanup_old_files(retention).await {
                Ok(report) if report.removed > 0 || report.failed > 0 => info!(
                    target: "connector::staging",
                    removed = report.removed,
                    failed = report.failed,
                    "staging sweep finished"
                ),
                Ok(_) => debug!(target: "connector::staging", "staging sweep found nothing to remove"),
                Err(err) => warn!(
                    target: "connector::staging",
                    root = %store.root().display(),
                    error = %err,
                    "staging sweep could not read directory"
                ),
            }
        }
        debug!(target: "connector::staging", "staging sweeper stopped");
    })
}

/// Files staged for one invocation. Dropping the value deletes them.
#[derive(Debug)]
pub struct StagedFiles {
    files: Vec<StagedFile>,
}

impl StagedFiles {
    fn empty() -> Self {
        Self { files: Vec::new() }
    }

    pub fn files(&self) -> &[StagedFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Deletes every staged file. Safe to call more than once.
    pub fn release(&mut self) {
        for file in self.files.drain(..) {
            match std::fs::remove_file(&file.storage_path) {
                Ok(()) => {
                    trace!(target: "connector::staging", path = %file.storage_path.display(), "released staged file");
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(
                    target: "connector::staging",
                    path = %file.storage_path.display(),
                    error = %err,
                    "failed to release staged file"
                ),
            }
        }
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        self.release();
    }
}

/// Keeps only the final path component of a caller supplied name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    match base {
        "" | "." | ".." => "file".to_string(),
        other => other.to_string(),
    }
}
