use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Prefix of the directories created under a scratch root.
pub const WORKDIR_PREFIX: &str = "spreader-";

/// Directory a job runs in, and whether this job owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    path: PathBuf,
    created: bool,
}

/// What [`WorkDir::finish`] did with the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The directory was supplied by the caller and is never touched.
    NotOwned,
    Removed,
    /// Kept for inspection after a failure.
    Kept,
    /// Removal stopped short; these entries are still on disk.
    Partial(Vec<PathBuf>),
}

impl WorkDir {
    /// Pick the working directory for a job: `cwd` when given, otherwise a
    /// fresh directory under `scratch_root`, otherwise the worker's own.
    pub fn resolve(cwd: Option<&Path>, scratch_root: Option<&Path>) -> io::Result<Self> {
        if let Some(cwd) = cwd {
            return Ok(Self::borrowed(cwd));
        }
        match scratch_root {
            Some(root) => Self::create_in(root),
            None => Ok(Self::borrowed(std::env::current_dir()?)),
        }
    }

    /// Create `spreader-<uuid>` under `root`, readable by the owner only.
    pub fn create_in(root: &Path) -> io::Result<Self> {
        let path = root.join(format!("{}{}", WORKDIR_PREFIX, Uuid::new_v4()));
        DirBuilder::new().mode(0o700).create(&path)?;
        tracing::debug!(path = %path.display(), "Created work directory");
        Ok(Self {
            path,
            created: true,
        })
    }

    fn borrowed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            created: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when this directory was created for the job.
    pub fn is_owned(&self) -> bool {
        self.created
    }

    /// `path` itself if absolute, otherwise joined onto this directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.path.join(path)
        }
    }

    /// Remove the directory if this job created it, unless the job failed
    /// and failed directories are to be kept.
    pub fn finish(self, failed: bool, cleanup_after_error: bool) -> CleanupOutcome {
        if !self.created {
            return CleanupOutcome::NotOwned;
        }
        if failed && !cleanup_after_error {
            tracing::warn!(
                path = %self.path.display(),
                "Process exited with errors or was terminated, work directory not removed"
            );
            return CleanupOutcome::Kept;
        }

        let mut leftovers = Vec::new();
        remove_tree(&self.path, &mut leftovers);
        if leftovers.is_empty() {
            tracing::debug!(path = %self.path.display(), "Removed work directory");
            CleanupOutcome::Removed
        } else {
            CleanupOutcome::Partial(leftovers)
        }
    }
}

/// Remove everything under `path` that can be removed. Entries that fail are
/// logged and collected; their parents are left in place.
fn remove_tree(path: &Path, leftovers: &mut Vec<PathBuf>) {
    let is_dir = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta.is_dir(),
        Err(e) => {
            log_failure(path, "stat", &e);
            leftovers.push(path.to_path_buf());
            return;
        }
    };

    if !is_dir {
        if let Err(e) = std::fs::remove_file(path) {
            log_failure(path, "remove_file", &e);
            leftovers.push(path.to_path_buf());
        }
        return;
    }

    match std::fs::read_dir(path) {
        Ok(entries) => {
            for entry in entries {
                match entry {
                    Ok(entry) => remove_tree(&entry.path(), leftovers),
                    Err(e) => {
                        log_failure(path, "read_dir", &e);
                        leftovers.push(path.to_path_buf());
                    }
                }
            }
        }
        Err(e) => log_failure(path, "read_dir", &e),
    }

    if let Err(e) = std::fs::remove_dir(path) {
        log_failure(path, "remove_dir", &e);
        leftovers.push(path.to_path_buf());
    }
}

fn log_failure(path: &Path, op: &str, err: &io::Error) {
    tracing::warn!(
        path = %path.display(),
        op,
        error = %err,
        "Failed to remove work directory entry, parent directory will not be removed"
    );
}
