use super::{absolute_input, emit};
use crate::audit::{AuditKind, HashKey, SanitizedPayload};
use crate::context::RunContext;
use crate::error::IntakeError;
use crate::evidence;
use crate::run::{
    archive_checkpoint, load_checkpoint, load_run, load_step_output, save_run, validate_run_id,
    Checkpoint, Run, RunLock, RunPaths, RunStatus,
};
use crate::watch::fingerprint_file;
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::info;

/// Re-enter a run suspended for correction, re-running the plan from the
/// input step against `input`.
pub(super) fn resume(ctx: &RunContext, run_id: &str, input: &Path) -> Result<Run> {
    validate_run_id(run_id)?;
    ensure_resumable(&load_run(&ctx.root, run_id)?)?;
    let paths = ctx.root.run(run_id);
    let _lock = RunLock::acquire(&paths, run_id)?;
    // Another resume may have won the race between the first check and the lock.
    let mut run = load_run(&ctx.root, run_id)?;
    ensure_resumable(&run)?;
    let checkpoint = load_checkpoint(&paths)?
        .ok_or_else(|| anyhow!("run {run_id} is suspended without a checkpoint"))?;

    let input = absolute_input(input);
    let fingerprint = fingerprint_file(&input).ok();
    archive_checkpoint(&paths, run.resume_attempt_count)?;
    run.resume_attempt_count += 1;
    run.input_path = input.display().to_string();
    run.input_fingerprint = fingerprint.clone();
    run.transition(RunStatus::Running, ctx.now()?)?;
    save_run(&paths, &run)?;

    let from_step = checkpoint.resume_from_step;
    let mut payload = SanitizedPayload::default();
    if let Some(fingerprint) = &fingerprint {
        payload = payload.with_hash(HashKey::FileHash, fingerprint);
    }
    emit(ctx, &run, AuditKind::Resumed, Some(from_step), payload)?;
    evidence::write_manifest(&paths, &run)?;
    info!(
        run_id,
        attempt = run.resume_attempt_count,
        from_step = from_step + 1,
        "run resumed"
    );

    let upstream = upstream_for(&paths, &checkpoint, from_step)?;
    super::execute::execute(ctx, &paths, run, from_step, upstream)
}

fn ensure_resumable(run: &Run) -> Result<(), IntakeError> {
    if run.status != RunStatus::SuspendedForCorrection {
        return Err(IntakeError::NotResumable {
            run_id: run.run_id.clone(),
            status: run.status,
        });
    }
    Ok(())
}

/// Retained output of the step just before the re-entry point.
fn upstream_for(
    paths: &RunPaths,
    checkpoint: &Checkpoint,
    from_step: usize,
) -> Result<Map<String, Value>> {
    let Some(previous) = from_step.checked_sub(1) else {
        return Ok(Map::new());
    };
    let artifact = checkpoint
        .artifacts
        .iter()
        .find(|artifact| artifact.step_index == previous)
        .ok_or_else(|| anyhow!("checkpoint has no retained output for step {}", previous + 1))?;
    match load_step_output(paths, &artifact.output_ref, &artifact.output_hash)? {
        Value::Object(data) => Ok(data),
        _ => Err(anyhow!("retained output {} is not an object", artifact.output_ref)),
    }
}
