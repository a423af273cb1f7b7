//! Per-worker scratch directories.
//!
//! Every worker gets its own subtree under the scratch root, and every source
//! gets a fresh directory inside it. A [`ScratchDir`] removes itself when
//! dropped, so acquisition cleans up on every exit path.

use std::path::{Component, Path, PathBuf};

use tokio::fs;

use crate::acquire::{sha256_hex, AcquisitionError};

#[derive(Debug, Clone)]
pub struct WorkspaceAllocator {
    root: PathBuf,
    worker_id: String,
}

impl WorkspaceAllocator {
    pub fn new(root: impl Into<PathBuf>, worker_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            worker_id: worker_id.into(),
        }
    }

    /// Allocator keyed by the current process id.
    pub fn for_current_process(root: impl Into<PathBuf>) -> Self {
        Self::new(root, format!("pid{}", std::process::id()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn worker_root(&self) -> PathBuf {
        self.root.join(format!("worker-{}", path_safe(&self.worker_id)))
    }

    /// Hands out an empty directory for `source_id`, wiping whatever a previous
    /// run of this worker left behind.
    pub async fn acquire(&self, source_id: &str) -> Result<ScratchDir, AcquisitionError> {
        let worker_root = self.worker_root();
        let path = worker_root.join(scratch_name(source_id));
        ensure_within(&worker_root, &path)?;

        if fs::try_exists(&path)
            .await
            .map_err(|source| AcquisitionError::filesystem(&path, source))?
        {
            fs::remove_dir_all(&path)
                .await
                .map_err(|source| AcquisitionError::filesystem(&path, source))?;
        }
        fs::create_dir_all(&path)
            .await
            .map_err(|source| AcquisitionError::filesystem(&path, source))?;

        tracing::debug!(path = %path.display(), "allocated scratch directory");
        Ok(ScratchDir {
            path,
            released: false,
        })
    }
}

#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    released: bool,
}

impl ScratchDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the directory now and reports the outcome instead of logging it.
    pub fn release(mut self) -> std::io::Result<()> {
        self.released = true;
        remove_if_present(&self.path)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = remove_if_present(&self.path) {
            tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "failed to clean up scratch directory"
            );
        }
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Directory name for a source: readable prefix plus a digest of the raw id,
/// so ids that sanitize alike (`acme.1`, `acme_1`) stay apart.
fn scratch_name(source_id: &str) -> String {
    let digest = sha256_hex(source_id.as_bytes());
    format!("{}-{}", path_safe(source_id), &digest[..12])
}

pub(crate) fn path_safe(input: &str) -> String {
    let cleaned = input
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn ensure_within(root: &Path, candidate: &Path) -> Result<(), AcquisitionError> {
    let escapes = candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if escapes || !candidate.starts_with(root) || candidate == root {
        return Err(AcquisitionError::ScratchEscape {
            path: candidate.to_path_buf(),
            root: root.to_path_buf(),
        });
    }
    Ok(())
}
