//! # Run Lock
//!
//! Exclusive run-scoped lock on the output directory.
//!
//! Two overlapping invocations writing into the same directory could
//! interleave temp files and renames; the lock makes the second invocation
//! fail fast instead. The guard releases the lock on every exit path,
//! including panics and fatal errors, via `Drop`.

use crate::constants::RUN_LOCK_FILE;
use crate::error::{Diagnostic, Stage};
use anyhow::Context;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Guard holding the exclusive lock for the run's duration
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock file inside `output_dir`, failing if another run
    /// holds it
    pub fn acquire(output_dir: &Path) -> Result<Self, Diagnostic> {
        let path = output_dir.join(RUN_LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("cannot open lock file {}", path.display()))
            .map_err(|e| {
                Diagnostic::new(Stage::Preflight, path.display().to_string(), e)
                    .with_suggestions(["Check permissions on the output directory"])
            })?;

        file.try_lock_exclusive()
            .with_context(|| format!("cannot acquire exclusive lock on {}", path.display()))
            .map_err(|e| {
                Diagnostic::new(Stage::Preflight, path.display().to_string(), e)
                    .with_suggestions([
                        "Another run may be active against this output directory; wait for it to finish",
                        "Remove the lock file only if you are certain no other run is in progress",
                    ])
            })?;

        debug!("Acquired run lock at {}", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // The lock itself is released when the file handle closes; removing
        // the file is best effort tidiness.
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
        debug!("Released run lock at {}", self.path.display());
    }
}
