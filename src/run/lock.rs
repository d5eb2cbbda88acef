//! Exclusive lock files.
//!
//! Only one caller may progress a run at a time. The lock is a `.lock` file
//! created with `create_new`, so a second resume racing the first observes
//! `RunBusy` instead of duplicating work. The file is removed when the guard
//! drops. Share redemption uses the same primitive per token.
use super::RunPaths;
use crate::error::IntakeError;
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Lock file held for the lifetime of the guard.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Create `path` exclusively. `Ok(None)` means another holder has it.
    pub fn try_acquire(path: PathBuf) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("create {}", path.display())),
        };
        writeln!(file, "{}", std::process::id())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(Some(Self { path }))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %err, "failed to release lock");
        }
    }
}

/// Execution authority over one run.
#[derive(Debug)]
pub struct RunLock {
    _file: FileLock,
}

impl RunLock {
    /// Take the lock or fail with `RunBusy` when another authority holds it.
    pub fn acquire(paths: &RunPaths, run_id: &str) -> Result<Self> {
        match FileLock::try_acquire(paths.lock_path())? {
            Some(file) => Ok(Self { _file: file }),
            None => Err(IntakeError::RunBusy {
                run_id: run_id.to_string(),
            }
            .into()),
        }
    }
}
