//! Durable run state: the run record, step outputs, and checkpoints.
//!
//! Nothing about a suspended run lives in memory. Every function here reads or
//! writes the run directory directly so a resume can happen in another process.
use super::{Checkpoint, Run, RunPaths, RunsRoot};
use crate::error::IntakeError;
use crate::util::{read_json, sha256_hex, write_bytes_atomic, write_json_atomic};
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;

pub fn run_exists(root: &RunsRoot, run_id: &str) -> bool {
    root.run(run_id).run_path().is_file()
}

/// Load the run record, mapping a missing record to `RunNotFound`.
pub fn load_run(root: &RunsRoot, run_id: &str) -> Result<Run> {
    let paths = root.run(run_id);
    let path = paths.run_path();
    if !path.is_file() {
        return Err(IntakeError::RunNotFound {
            run_id: run_id.to_string(),
        }
        .into());
    }
    read_json(&path)
}

pub fn save_run(paths: &RunPaths, run: &Run) -> Result<()> {
    write_json_atomic(&paths.run_path(), run).context("persist run record")
}

/// Persist a step's `data` map and return its reference and hash.
pub fn write_step_output(paths: &RunPaths, output_ref: &str, data: &Value) -> Result<String> {
    let mut bytes = serde_json::to_vec(data).context("serialize step output")?;
    bytes.push(b'\n');
    let hash = sha256_hex(&bytes);
    write_bytes_atomic(&paths.resolve(output_ref), &bytes)?;
    Ok(hash)
}

/// Load a persisted step output, verifying it still matches its recorded hash.
pub fn load_step_output(paths: &RunPaths, output_ref: &str, expected_hash: &str) -> Result<Value> {
    let path = paths.resolve(output_ref);
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let actual = sha256_hex(&bytes);
    if actual != expected_hash {
        anyhow::bail!(
            "step output {} changed on disk (expected {expected_hash}, found {actual})",
            path.display()
        );
    }
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

pub fn write_checkpoint(paths: &RunPaths, checkpoint: &Checkpoint) -> Result<()> {
    write_json_atomic(&paths.resume_state_path(), checkpoint).context("persist checkpoint")
}

pub fn load_checkpoint(paths: &RunPaths) -> Result<Option<Checkpoint>> {
    let path = paths.resume_state_path();
    if !path.is_file() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

/// Move the checkpoint into `archive/` once a resume has taken ownership of it.
pub fn archive_checkpoint(paths: &RunPaths, attempt: u32) -> Result<()> {
    let source = paths.resume_state_path();
    if !source.is_file() {
        return Ok(());
    }
    let dest = paths.archived_checkpoint_path(attempt);
    fs::create_dir_all(paths.archive_dir())
        .with_context(|| format!("create {}", paths.archive_dir().display()))?;
    fs::rename(&source, &dest)
        .with_context(|| format!("archive {} to {}", source.display(), dest.display()))?;
    Ok(())
}

/// Drop the checkpoint of a run that reached a terminal state.
pub fn remove_checkpoint(paths: &RunPaths) -> Result<()> {
    let path = paths.resume_state_path();
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
