//! Run orchestrator: the only component that mutates runs.
//!
//! Entry points (`start`, `resume`, `resolve_approval`, `abandon`) are
//! synchronous and drive a run until it completes, fails, or suspends. Each
//! one holds the run's execution-authority lock for its whole duration and
//! re-reads the run record under that lock, so nothing about a suspended run
//! needs to survive in memory between calls.
use crate::approval::{self, ApprovalDecision, ApprovalRecord};
use crate::audit::{
    dedupe_events, status_trail, AuditEvent, AuditKind, HashKey, SanitizedPayload,
};
use crate::context::RunContext;
use crate::error::IntakeError;
use crate::evidence::{self, Manifest};
use crate::plan::{DeterministicPlanner, Planner};
use crate::run::{
    load_checkpoint, load_run, remove_checkpoint, run_exists, save_run, validate_run_id, Run,
    RunLock, RunPaths, RunStatus,
};
use crate::share::{shares_for_run, SecureShareReference};
use crate::watch::fingerprint_file;
use anyhow::{Context, Result};
use serde_json::Map;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

mod execute;
mod resume;

/// Inputs for a fresh run.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub workflow: String,
    pub run_id: String,
    pub input: PathBuf,
}

/// What an operator sees of a run beyond its manifest.
#[derive(Debug, Clone)]
pub struct RunHistory {
    pub manifest: Manifest,
    pub status_trail: Vec<RunStatus>,
    pub approvals: Vec<ApprovalRecord>,
    pub shares: Vec<SecureShareReference>,
}

/// Operator decision delivered out-of-band.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub decision: ApprovalDecision,
    pub reviewer: String,
    pub comment: Option<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    ctx: RunContext,
}

impl Orchestrator {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Create a run, emit its plan, and execute it from the first step.
    pub fn start(&self, request: &StartRequest) -> Result<Run> {
        validate_run_id(&request.run_id)?;
        let plan = DeterministicPlanner.plan(
            &request.workflow,
            &self.ctx.registry,
            &self.ctx.config,
        )?;
        let exists = || IntakeError::RunExists {
            run_id: request.run_id.clone(),
        };
        if run_exists(&self.ctx.root, &request.run_id) {
            return Err(exists().into());
        }
        let paths = self.ctx.root.run(&request.run_id);
        let _lock = RunLock::acquire(&paths, &request.run_id)?;
        if run_exists(&self.ctx.root, &request.run_id) {
            return Err(exists().into());
        }

        let now = self.ctx.now()?;
        let input = absolute_input(&request.input);
        let mut run = Run::new(
            request.run_id.clone(),
            request.workflow.clone(),
            plan,
            self.ctx.config.handling(),
            input.display().to_string(),
            now,
        );
        run.input_fingerprint = fingerprint_file(&input).ok();
        save_run(&paths, &run)?;
        evidence::write_plan(&paths, &run)?;
        evidence::write_manifest(&paths, &run)?;

        run.transition(RunStatus::Running, now)?;
        save_run(&paths, &run)?;
        let mut payload = SanitizedPayload::default();
        if let Some(fingerprint) = &run.input_fingerprint {
            payload = payload.with_hash(HashKey::FileHash, fingerprint);
        }
        emit(&self.ctx, &run, AuditKind::RunStarted, None, payload)?;
        evidence::write_manifest(&paths, &run)?;
        info!(run_id = %run.run_id, workflow = %run.workflow, "run started");

        execute::execute(&self.ctx, &paths, run, 0, Map::new())
    }

    /// Re-enter a run suspended for correction with a corrected input.
    pub fn resume(&self, run_id: &str, input: &Path) -> Result<Run> {
        resume::resume(&self.ctx, run_id, input)
    }

    /// Record a reviewer decision for the pending gate encounter.
    ///
    /// Repeating the decision already on file is a no-op; contradicting it is
    /// an `ApprovalConflict`.
    pub fn resolve_approval(&self, run_id: &str, request: &DecisionRequest) -> Result<Run> {
        validate_run_id(run_id)?;
        let paths = self.ctx.root.run(run_id);
        load_run(&self.ctx.root, run_id)?;
        let _lock = RunLock::acquire(&paths, run_id)?;
        let mut run = load_run(&self.ctx.root, run_id)?;
        if run.status != RunStatus::SuspendedForApproval {
            if let Some(existing) = approval::load_record(&paths, run.approval_encounters)? {
                if existing.decision == request.decision {
                    debug!(run_id, decision = %request.decision, "decision already recorded");
                    return Ok(run);
                }
                return Err(IntakeError::ApprovalConflict {
                    run_id: run_id.to_string(),
                    existing: existing.decision.to_string(),
                }
                .into());
            }
            return Err(IntakeError::NoPendingApproval {
                run_id: run_id.to_string(),
                status: run.status,
            }
            .into());
        }
        execute::apply_decision(&self.ctx, &paths, &mut run, request)?;
        Ok(run)
    }

    /// Cancel a suspended run. The run ends `failed` and the cancellation is audited.
    pub fn abandon(&self, run_id: &str, reason: &str) -> Result<Run> {
        validate_run_id(run_id)?;
        let paths = self.ctx.root.run(run_id);
        load_run(&self.ctx.root, run_id)?;
        let _lock = RunLock::acquire(&paths, run_id)?;
        let mut run = load_run(&self.ctx.root, run_id)?;
        if !run.status.is_suspended() {
            return Err(IntakeError::NotSuspended {
                run_id: run_id.to_string(),
                status: run.status,
            }
            .into());
        }
        let now = self.ctx.now()?;
        run.transition(RunStatus::Failed, now)?;
        run.failure_reason = Some(format!("abandoned: {}", reason.trim()));
        remove_checkpoint(&paths)?;
        save_run(&paths, &run)?;
        emit(
            &self.ctx,
            &run,
            AuditKind::Abandoned,
            None,
            SanitizedPayload::default().with_note(reason),
        )?;
        refresh_evidence(&paths, &run)?;
        info!(run_id, "run abandoned");
        Ok(run)
    }

    /// Abandon suspended runs older than the configured suspension TTL.
    pub fn expire_stale(&self) -> Result<Vec<String>> {
        let Some(ttl_secs) = self.ctx.config.suspension_ttl_secs else {
            return Ok(Vec::new());
        };
        let now = self.ctx.now()?;
        let ttl_ms = u128::from(ttl_secs) * 1000;
        let mut expired = Vec::new();
        for run_id in list_runs(&self.ctx)? {
            match self.expire_if_stale(&run_id, now, ttl_ms) {
                Ok(true) => expired.push(run_id),
                Ok(false) => {}
                Err(err) if crate::error::protocol_violation(&err).is_some() => {
                    debug!(run_id, error = %err, "skipping expiry");
                }
                // One unreadable run must not stop the sweep.
                Err(err) => warn!(run_id, error = %format!("{err:#}"), "expiry check failed"),
            }
        }
        Ok(expired)
    }

    fn expire_if_stale(&self, run_id: &str, now: u128, ttl_ms: u128) -> Result<bool> {
        let run = load_run(&self.ctx.root, run_id)?;
        if !run.status.is_suspended() {
            return Ok(false);
        }
        let since = load_checkpoint(&self.ctx.root.run(run_id))?
            .map(|checkpoint| checkpoint.suspended_at_epoch_ms)
            .unwrap_or(run.updated_at_epoch_ms);
        if now.saturating_sub(since) < ttl_ms {
            return Ok(false);
        }
        self.abandon(run_id, "suspension expired")?;
        Ok(true)
    }

    pub fn status(&self, run_id: &str) -> Result<Manifest> {
        validate_run_id(run_id)?;
        let run = load_run(&self.ctx.root, run_id)?;
        Ok(evidence::manifest_for(&run))
    }

    /// Manifest plus the status trail read back from the audit log.
    pub fn history(&self, run_id: &str) -> Result<RunHistory> {
        let manifest = self.status(run_id)?;
        let events = dedupe_events(self.ctx.audit.events(run_id)?);
        Ok(RunHistory {
            manifest,
            status_trail: status_trail(&events),
            approvals: approval::load_records(&self.ctx.root.run(run_id))?,
            shares: shares_for_run(&self.ctx.root, run_id)?,
        })
    }
}

/// Run ids with a run record, sorted.
pub fn list_runs(ctx: &RunContext) -> Result<Vec<String>> {
    let dir = ctx.root.runs_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        if let Some(name) = entry.file_name().to_str() {
            if run_exists(&ctx.root, name) {
                ids.push(name.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

fn absolute_input(input: &Path) -> PathBuf {
    fs::canonicalize(input).unwrap_or_else(|_| input.to_path_buf())
}

fn emit(
    ctx: &RunContext,
    run: &Run,
    kind: AuditKind,
    step_index: Option<usize>,
    payload: SanitizedPayload,
) -> Result<()> {
    let event = AuditEvent {
        timestamp_epoch_ms: ctx.now()?,
        run_id: run.run_id.clone(),
        attempt: run.resume_attempt_count,
        step_index,
        kind,
        status: run.status,
        payload,
    };
    ctx.emit(&event)
        .with_context(|| format!("append {kind} event for {}", run.run_id))
}

/// Staff-facing outcome text for the run's current status.
fn outcome_text(run: &Run) -> String {
    match run.status {
        RunStatus::Pending | RunStatus::Running => "Run in progress.".to_string(),
        RunStatus::SuspendedForApproval => {
            let blocked = run
                .step_results
                .last()
                .map(|result| {
                    format!(
                        "Step {} (`{}`) reported blockers: {}.",
                        result.step_index + 1,
                        result.tool,
                        result.blockers.join("; ")
                    )
                })
                .unwrap_or_default();
            format!(
                "Suspended for approval. {blocked}\n\nReview `approval_request.json` and \
                 `outputs/`, then record a decision with `intake decide --run-id {} \
                 --decision approved|rejected --reviewer <name>`.",
                run.run_id
            )
        }
        RunStatus::SuspendedForCorrection => format!(
            "Approved; the error report was shared with the partner.\n\nWaiting for a \
             corrected file in `uploads/{id}/` or `intake resume --run-id {id} --input <file>`.",
            id = run.run_id
        ),
        RunStatus::Completed => format!(
            "Completed: all {} steps finished without blockers.",
            run.plan.len()
        ),
        RunStatus::Rejected => format!(
            "Rejected: {}.",
            run.failure_reason.as_deref().unwrap_or("no reason recorded")
        ),
        RunStatus::Failed => format!(
            "Failed: {}.\n\nRetry with a new run id once the cause is fixed.",
            run.failure_reason.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn refresh_evidence(paths: &RunPaths, run: &Run) -> Result<()> {
    evidence::write_summary(paths, run, &outcome_text(run))?;
    evidence::write_manifest(paths, run)
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
