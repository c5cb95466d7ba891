//! Per-unit scratch directories.
//!
//! Each unit of work gets its own uniquely named directory, so concurrent
//! units on one machine never collide. A unit that crashed may have left its
//! directory behind, so creating a workspace first sweeps old ones away.

use std::{
    fs,
    time::{Duration, SystemTime},
};

use tempfile::TempDir;

use crate::prelude::*;

/// Workspaces older than this are assumed abandoned. It must exceed the
/// longest stage (compression may run for an hour).
pub const STALE_AFTER: Duration = Duration::from_secs(2 * 60 * 60);

/// A scratch directory, deleted on drop.
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    /// Create a workspace in the system temporary directory.
    pub fn create(prefix: &str) -> Result<Self> {
        Self::create_in(&std::env::temp_dir(), prefix, STALE_AFTER)
    }

    /// Create a workspace under `parent`, first removing workspaces with the
    /// same prefix that are older than `stale_after`.
    #[instrument(level = "debug", skip(parent), fields(parent = %parent.display()))]
    pub fn create_in(parent: &Path, prefix: &str, stale_after: Duration) -> Result<Self> {
        let swept = sweep_stale(parent, prefix, stale_after);
        if swept > 0 {
            info!(swept, "Removed abandoned workspaces");
        }
        let dir = TempDir::with_prefix_in(format!("{prefix}-"), parent)
            .with_context(|| format!("failed to create workspace in {:?}", parent.display()))?;
        let path = dir.path().to_owned();
        debug!(path = %path.display(), "Created workspace");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A path for `name` inside the workspace.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(err) = dir.close() {
                error!(
                    directory = ?self.path.display(),
                    "failed to delete workspace: {}",
                    err
                );
            }
        }
    }
}

/// Remove old workspaces for `prefix`. Returns how many were removed.
fn sweep_stale(parent: &Path, prefix: &str, stale_after: Duration) -> usize {
    let Ok(entries) = fs::read_dir(parent) else {
        return 0;
    };
    let prefix = format!("{prefix}-");
    let now = SystemTime::now();
    let mut swept = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if !metadata.is_dir() || age < stale_after {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => swept += 1,
            Err(err) => warn!(
                path = %entry.path().display(),
                "failed to remove abandoned workspace: {}",
                err
            ),
        }
    }
    swept
}
