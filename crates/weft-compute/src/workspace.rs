//! Per-task workspace directories.

use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

/// The six subdirectories every task workspace owns.
const SUBDIRS: [&str; 6] = ["train", "test", "untargeted_test", "model", "pred", "perf"];

/// Mode requested for workspace directories; the effective mode is this
/// intersected with the process umask.  Containers run with arbitrary UIDs
/// and must be able to write into their mounts.
const DIR_MODE: u32 = 0o777;

/// A task's private directory tree under `<data_root>/<task_uuid>`.
///
/// Opening the workspace first wipes any leftover state from a previous
/// attempt at the same task, which is what makes handler retries
/// idempotent.  The tree is removed when the workspace is dropped, so
/// cleanup runs on success, failure and cancellation alike.
#[derive(Debug)]
pub struct TaskWorkspace {
    root: PathBuf,
    armed: bool,
}

impl TaskWorkspace {
    /// Create `<data_root>/<task_uuid>` and its six subdirectories,
    /// discarding any pre-existing tree for the same task.
    pub fn open(data_root: &Path, task_uuid: Uuid) -> io::Result<Self> {
        let root = data_root.join(task_uuid.to_string());
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }

        create_dir_mode(&root)?;
        for sub in SUBDIRS {
            create_dir_mode(&root.join(sub))?;
        }

        Ok(Self { root, armed: true })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn train_dir(&self) -> PathBuf {
        self.root.join("train")
    }

    pub fn test_dir(&self) -> PathBuf {
        self.root.join("test")
    }

    pub fn untargeted_test_dir(&self) -> PathBuf {
        self.root.join("untargeted_test")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join("model")
    }

    pub fn pred_dir(&self) -> PathBuf {
        self.root.join("pred")
    }

    pub fn perf_dir(&self) -> PathBuf {
        self.root.join("perf")
    }

    /// Where the packed model artifact is staged before upload.
    pub fn model_archive_path(&self) -> PathBuf {
        self.root.join("model.tar.gz")
    }

    /// Remove the tree now, surfacing the io error.
    pub fn close(mut self) -> io::Result<()> {
        self.armed = false;
        std::fs::remove_dir_all(&self.root)
    }
}

impl Drop for TaskWorkspace {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                warn!(root = %self.root.display(), error = %e, "failed to remove task workspace");
            }
        }
    }
}

#[cfg(unix)]
fn create_dir_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().mode(DIR_MODE).create(path)
}

#[cfg(not(unix))]
fn create_dir_mode(path: &Path) -> io::Result<()> {
    std::fs::create_dir(path)
}
