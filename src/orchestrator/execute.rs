//! Step loop, suspension, and gate resolution.
use super::{emit, outcome_text, refresh_evidence, DecisionRequest};
use crate::approval::{
    self, ApprovalDecision, ApprovalRecord, ApprovalRequest, RecordOutcome,
    APPROVAL_SCHEMA_VERSION, SYSTEM_REVIEWER,
};
use crate::audit::{AuditKind, CountKey, SanitizedPayload};
use crate::context::RunContext;
use crate::evidence;
use crate::run::{
    load_checkpoint, load_step_output, remove_checkpoint, save_run, step_result_from,
    write_checkpoint, write_step_output, ArtifactRef, Checkpoint, FailureContext, Run, RunPaths,
    RunStatus, CHECKPOINT_SCHEMA_VERSION,
};
use crate::share::{self, ShareLimits};
use crate::tool::{OutputArtifact, ToolInput, ToolKind};
use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Drive `run` from `from_step`; infrastructure errors end the run `failed`.
///
/// Returns `Err` only when the failure itself could not be recorded.
pub(super) fn execute(
    ctx: &RunContext,
    paths: &RunPaths,
    mut run: Run,
    from_step: usize,
    upstream: Map<String, Value>,
) -> Result<Run> {
    match drive(ctx, paths, &mut run, from_step, upstream) {
        Ok(()) => Ok(run),
        Err(err) => {
            warn!(run_id = %run.run_id, error = %format!("{err:#}"), "run failed");
            fail_run(ctx, paths, &mut run, err)?;
            Ok(run)
        }
    }
}

fn drive(
    ctx: &RunContext,
    paths: &RunPaths,
    run: &mut Run,
    from_step: usize,
    mut upstream: Map<String, Value>,
) -> Result<()> {
    for step_index in from_step..run.plan.len() {
        let step = run.plan.steps[step_index].clone();
        emit(
            ctx,
            run,
            AuditKind::StepStart,
            Some(step_index),
            SanitizedPayload::for_tool(step.tool),
        )?;

        let mut args = step.args.clone();
        if step.reads_input {
            args.insert("input".to_string(), Value::String(run.input_path.clone()));
        }
        let input = ToolInput { args, upstream };
        let result = ctx
            .registry
            .invoke(step.tool.as_str(), &input)
            .with_context(|| format!("invoke {} at step {}", step.tool, step_index + 1))?;
        result.check_shape(step.tool)?;

        let attempt = run.resume_attempt_count;
        let output_ref = RunPaths::step_output_ref(step_index, attempt, step.tool.as_str());
        let output_hash =
            write_step_output(paths, &output_ref, &Value::Object(result.data.clone()))?;
        emit(
            ctx,
            run,
            AuditKind::StepEnd,
            Some(step_index),
            SanitizedPayload::for_step_end(step.tool, &result, &output_hash),
        )?;
        let now = ctx.now()?;
        run.append_result(step_result_from(
            step_index,
            attempt,
            step.tool.as_str(),
            &result,
            output_ref,
            output_hash,
            now,
        ));
        run.updated_at_epoch_ms = now;
        save_run(paths, run)?;

        if !result.blockers.is_empty() {
            return suspend_for_approval(ctx, paths, run, step_index);
        }
        upstream = result.data;
    }
    complete(ctx, paths, run)
}

fn complete(ctx: &RunContext, paths: &RunPaths, run: &mut Run) -> Result<()> {
    let artifacts = collect_artifacts(ctx, paths, run)?;
    evidence::write_outputs(paths, &artifacts)?;
    let records = run
        .effective_results()
        .last()
        .map(|result| load_step_output(paths, &result.output_ref, &result.output_hash))
        .transpose()?
        .and_then(|data| data.get("record_count").and_then(Value::as_u64));

    run.transition(RunStatus::Completed, ctx.now()?)?;
    remove_checkpoint(paths)?;
    save_run(paths, run)?;
    let mut payload = SanitizedPayload::default();
    if let Some(records) = records {
        payload = payload.with_count(CountKey::RecordCount, records);
    }
    emit(ctx, run, AuditKind::RunCompleted, None, payload)?;
    refresh_evidence(paths, run)?;
    info!(run_id = %run.run_id, "run completed");
    Ok(())
}

/// Halt on blockers: persist the checkpoint and hand off to the approval gate.
fn suspend_for_approval(
    ctx: &RunContext,
    paths: &RunPaths,
    run: &mut Run,
    step_index: usize,
) -> Result<()> {
    let blocking = run
        .step_results
        .last()
        .cloned()
        .ok_or_else(|| anyhow!("suspension without a step result"))?;
    let failure = FailureContext {
        step_index,
        tool: blocking.tool.clone(),
        blockers: blocking.blockers.clone(),
        output_ref: blocking.output_ref.clone(),
        output_hash: blocking.output_hash.clone(),
    };
    let now = ctx.now()?;
    run.transition(RunStatus::SuspendedForApproval, now)?;
    run.approval_encounters += 1;
    run.approval_status = Some("pending".to_string());

    let mut artifacts = collect_artifacts(ctx, paths, run)?;
    artifacts.push(evidence::blocker_report(&failure));
    evidence::write_outputs(paths, &artifacts)?;
    let mut review_material = artifacts
        .iter()
        .map(|artifact| format!("outputs/{}", artifact.name))
        .collect::<Vec<_>>();
    review_material.sort();
    approval::write_request(
        paths,
        &ApprovalRequest {
            schema_version: APPROVAL_SCHEMA_VERSION,
            run_id: run.run_id.clone(),
            encounter: run.approval_encounters,
            attempt: run.resume_attempt_count,
            failure: failure.clone(),
            review_material,
            requested_at_epoch_ms: now,
        },
    )?;
    write_checkpoint(paths, &checkpoint_for(run, Some(failure), now))?;
    save_run(paths, run)?;

    let tool = ToolKind::from_name(&blocking.tool)?;
    emit(
        ctx,
        run,
        AuditKind::ApprovalRequested,
        Some(step_index),
        SanitizedPayload::for_tool(tool)
            .with_count(CountKey::BlockerCount, blocking.blockers.len() as u64)
            .with_note(&blocking.blockers.join("; ")),
    )?;
    emit(
        ctx,
        run,
        AuditKind::Suspended,
        Some(step_index),
        SanitizedPayload::default().with_note("awaiting approval"),
    )?;
    refresh_evidence(paths, run)?;
    info!(
        run_id = %run.run_id,
        step = step_index + 1,
        blockers = blocking.blockers.len(),
        "run suspended for approval"
    );

    if run.resume_attempt_count >= ctx.config.max_resume_attempts {
        warn!(
            run_id = %run.run_id,
            attempts = run.resume_attempt_count,
            "resume attempts exhausted"
        );
        return apply_decision(
            ctx,
            paths,
            run,
            &DecisionRequest {
                decision: ApprovalDecision::Rejected,
                reviewer: SYSTEM_REVIEWER.to_string(),
                comment: Some("resume attempts exhausted".to_string()),
            },
        );
    }
    if !ctx.config.require_approval {
        return apply_decision(
            ctx,
            paths,
            run,
            &DecisionRequest {
                decision: ApprovalDecision::Approved,
                reviewer: SYSTEM_REVIEWER.to_string(),
                comment: None,
            },
        );
    }
    Ok(())
}

/// Resolve the pending encounter. The caller holds the run lock and has
/// checked that the run is suspended for approval.
pub(super) fn apply_decision(
    ctx: &RunContext,
    paths: &RunPaths,
    run: &mut Run,
    request: &DecisionRequest,
) -> Result<()> {
    let now = ctx.now()?;
    let comment = request
        .comment
        .as_deref()
        .map(str::trim)
        .filter(|comment| !comment.is_empty())
        .map(str::to_string);
    let record = ApprovalRecord {
        schema_version: APPROVAL_SCHEMA_VERSION,
        run_id: run.run_id.clone(),
        encounter: run.approval_encounters,
        attempt: run.resume_attempt_count,
        reviewer: request.reviewer.trim().to_string(),
        decision: request.decision,
        comment,
        decided_at_epoch_ms: now,
    };
    // A record left by an interrupted resolution is finished rather than refused.
    let record = match approval::record_decision(paths, &record)? {
        RecordOutcome::Created => record,
        RecordOutcome::AlreadyRecorded(existing) => existing,
    };

    match record.decision {
        ApprovalDecision::Approved => {
            let issued = share::shares_for_run(&ctx.root, &run.run_id)?
                .into_iter()
                .find(|share| share.approval_encounter == record.encounter);
            let share = match issued {
                Some(share) => share,
                None => share::issue_share(
                    &ctx.root,
                    run,
                    &record,
                    ShareLimits {
                        ttl_secs: ctx.config.share_ttl_secs,
                        max_access: ctx.config.share_max_access,
                    },
                    now,
                )?,
            };
            run.transition(RunStatus::SuspendedForCorrection, now)?;
            run.approval_status = Some(ApprovalDecision::Approved.to_string());
            save_run(paths, run)?;
            emit(
                ctx,
                run,
                AuditKind::ApprovalResolved,
                None,
                SanitizedPayload::default().with_decision(record.decision),
            )?;
            emit(
                ctx,
                run,
                AuditKind::ShareIssued,
                None,
                SanitizedPayload::default().with_note(&share.artifact),
            )?;
            let mut checkpoint = load_checkpoint(paths)?
                .ok_or_else(|| anyhow!("run {} has no checkpoint to update", run.run_id))?;
            checkpoint.status = run.status;
            write_checkpoint(paths, &checkpoint)?;
            emit(
                ctx,
                run,
                AuditKind::Suspended,
                None,
                SanitizedPayload::default().with_note("awaiting corrected input"),
            )?;
            refresh_evidence(paths, run)?;
            info!(
                run_id = %run.run_id,
                reviewer = %record.reviewer,
                "approved; awaiting correction"
            );
        }
        ApprovalDecision::Rejected => {
            run.transition(RunStatus::Rejected, now)?;
            run.approval_status = Some(ApprovalDecision::Rejected.to_string());
            run.failure_reason = Some(match &record.comment {
                Some(comment) => format!("rejected by {}: {comment}", record.reviewer),
                None => format!("rejected by {}", record.reviewer),
            });
            remove_checkpoint(paths)?;
            save_run(paths, run)?;
            emit(
                ctx,
                run,
                AuditKind::ApprovalResolved,
                None,
                SanitizedPayload::default().with_decision(record.decision),
            )?;
            emit(ctx, run, AuditKind::RunRejected, None, SanitizedPayload::default())?;
            refresh_evidence(paths, run)?;
            info!(run_id = %run.run_id, reviewer = %record.reviewer, "run rejected");
        }
    }
    Ok(())
}

/// Mark the run `failed` after an infrastructure error or malformed output.
fn fail_run(ctx: &RunContext, paths: &RunPaths, run: &mut Run, err: anyhow::Error) -> Result<()> {
    if !run.status.can_transition_to(RunStatus::Failed) {
        return Err(err);
    }
    let reason = format!("{err:#}");
    run.transition(RunStatus::Failed, ctx.now()?)?;
    run.failure_reason = Some(reason.clone());
    remove_checkpoint(paths)?;
    save_run(paths, run)?;
    emit(
        ctx,
        run,
        AuditKind::RunFailed,
        None,
        SanitizedPayload::default().with_note(&reason),
    )?;
    evidence::write_summary(paths, run, &outcome_text(run))?;
    evidence::write_manifest(paths, run)
}

fn checkpoint_for(run: &Run, failure: Option<FailureContext>, now_ms: u128) -> Checkpoint {
    let effective = run.effective_results();
    Checkpoint {
        schema_version: CHECKPOINT_SCHEMA_VERSION,
        run_id: run.run_id.clone(),
        status: run.status,
        last_completed_step: effective
            .iter()
            .filter(|result| !result.is_blocked())
            .map(|result| result.step_index)
            .max(),
        resume_from_step: run.plan.first_input_step(),
        artifacts: effective
            .iter()
            .map(|result| ArtifactRef {
                step_index: result.step_index,
                output_ref: result.output_ref.clone(),
                output_hash: result.output_hash.clone(),
            })
            .collect(),
        failure,
        resume_attempt_count: run.resume_attempt_count,
        input_fingerprint: run.input_fingerprint.clone(),
        suspended_at_epoch_ms: now_ms,
    }
}

/// Output artifacts rendered by each tool from its persisted data.
fn collect_artifacts(
    ctx: &RunContext,
    paths: &RunPaths,
    run: &Run,
) -> Result<Vec<OutputArtifact>> {
    let mut artifacts = Vec::new();
    for result in run.effective_results() {
        let kind = ToolKind::from_name(&result.tool)?;
        let data = load_step_output(paths, &result.output_ref, &result.output_hash)?;
        if let Value::Object(data) = data {
            artifacts.extend(ctx.registry.get(kind)?.artifacts(&data));
        }
    }
    Ok(artifacts)
}
