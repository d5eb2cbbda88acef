//! Run records and their status machine.
//!
//! A [`Run`] is the unit of orchestration. It is persisted as `run.json` in the
//! run directory and mutated only by the orchestrator; everything an operator
//! needs to reconstruct its history lives next to it in the evidence bundle.
use crate::error::IntakeError;
use crate::plan::Plan;
use crate::tool::ToolResult;
use serde::{Deserialize, Serialize};
use std::fmt;

mod lock;
mod paths;
mod store;

pub use lock::{FileLock, RunLock};
pub use paths::{validate_run_id, RunPaths, RunsRoot};
pub use store::{
    archive_checkpoint, load_checkpoint, load_run, load_step_output, remove_checkpoint,
    run_exists, save_run, write_checkpoint, write_step_output,
};

/// Current schema version for `run.json`.
pub const RUN_SCHEMA_VERSION: u32 = 1;
/// Current schema version for `resume_state.json`.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    SuspendedForApproval,
    SuspendedForCorrection,
    Completed,
    Rejected,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::SuspendedForApproval => "suspended_for_approval",
            RunStatus::SuspendedForCorrection => "suspended_for_correction",
            RunStatus::Completed => "completed",
            RunStatus::Rejected => "rejected",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Rejected | RunStatus::Failed
        )
    }

    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            RunStatus::SuspendedForApproval | RunStatus::SuspendedForCorrection
        )
    }

    /// Whether `self -> next` is a legal edge.
    ///
    /// Status only moves forward, except for the corrected-resubmission loop
    /// `suspended_for_correction -> running`. A resumed run may block again,
    /// which re-enters `suspended_for_approval` from `running`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, SuspendedForApproval | Completed | Failed) => true,
            (SuspendedForApproval, SuspendedForCorrection | Rejected | Failed) => true,
            (SuspendedForCorrection, Running | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one tool invocation, immutable once appended to a run.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StepResult {
    pub step_index: usize,
    pub tool: String,
    pub attempt: u32,
    pub ok: bool,
    pub summary: String,
    pub warnings: Vec<String>,
    pub blockers: Vec<String>,
    /// Reference to the persisted `data` map, relative to the run directory.
    pub output_ref: String,
    /// SHA-256 of the persisted output bytes.
    pub output_hash: String,
    pub finished_at_epoch_ms: u128,
}

impl StepResult {
    pub fn is_blocked(&self) -> bool {
        !self.blockers.is_empty()
    }
}

/// Why the run stopped, carried in the checkpoint while suspended.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FailureContext {
    pub step_index: usize,
    pub tool: String,
    pub blockers: Vec<String>,
    /// Output reference of the blocking step (for example the violation list).
    pub output_ref: String,
    pub output_hash: String,
}

/// Minimal state needed to resume a suspended run.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub run_id: String,
    pub status: RunStatus,
    /// Index of the last step that completed without blockers, if any.
    pub last_completed_step: Option<usize>,
    /// Step at which a resume re-enters the plan.
    pub resume_from_step: usize,
    /// Retained step outputs by reference: `(step_index, output_ref, output_hash)`.
    pub artifacts: Vec<ArtifactRef>,
    pub failure: Option<FailureContext>,
    pub resume_attempt_count: u32,
    /// Fingerprint of the last input consumed by this run.
    pub input_fingerprint: Option<String>,
    pub suspended_at_epoch_ms: u128,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ArtifactRef {
    pub step_index: usize,
    pub output_ref: String,
    pub output_hash: String,
}

/// Declared handling metadata copied into the manifest.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct DataHandling {
    pub data_classification: String,
    pub pii_handling: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Run {
    pub schema_version: u32,
    pub run_id: String,
    pub workflow: String,
    pub status: RunStatus,
    pub plan: Plan,
    pub step_results: Vec<StepResult>,
    pub handling: DataHandling,
    /// Path of the input currently feeding the plan.
    pub input_path: String,
    pub input_fingerprint: Option<String>,
    pub resume_attempt_count: u32,
    /// Number of approval gate encounters so far.
    pub approval_encounters: u32,
    pub approval_status: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at_epoch_ms: u128,
    pub updated_at_epoch_ms: u128,
}

impl Run {
    pub fn new(
        run_id: String,
        workflow: String,
        plan: Plan,
        handling: DataHandling,
        input_path: String,
        now_ms: u128,
    ) -> Self {
        Self {
            schema_version: RUN_SCHEMA_VERSION,
            run_id,
            workflow,
            status: RunStatus::Pending,
            plan,
            step_results: Vec::new(),
            handling,
            input_path,
            input_fingerprint: None,
            resume_attempt_count: 0,
            approval_encounters: 0,
            approval_status: None,
            failure_reason: None,
            created_at_epoch_ms: now_ms,
            updated_at_epoch_ms: now_ms,
        }
    }

    /// Move to `next`, rejecting edges outside the status machine.
    pub fn transition(&mut self, next: RunStatus, now_ms: u128) -> Result<(), IntakeError> {
        if !self.status.can_transition_to(next) {
            return Err(IntakeError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at_epoch_ms = now_ms;
        Ok(())
    }

    /// Append a finished step. Results are never edited after this point.
    pub fn append_result(&mut self, result: StepResult) {
        self.step_results.push(result);
    }

    /// Results of the current attempt, in plan order.
    pub fn current_results(&self) -> impl Iterator<Item = &StepResult> {
        let attempt = self.resume_attempt_count;
        self.step_results
            .iter()
            .filter(move |result| result.attempt == attempt)
    }

    /// Latest result for a plan position across attempts.
    pub fn latest_result_for(&self, step_index: usize) -> Option<&StepResult> {
        self.step_results
            .iter()
            .rev()
            .find(|result| result.step_index == step_index)
    }

    /// Result standing for each plan position: retained results before the
    /// input step, current-attempt results from it onward.
    pub fn effective_results(&self) -> Vec<&StepResult> {
        let first_input = self.plan.first_input_step();
        (0..self.plan.len())
            .filter_map(|idx| {
                if idx < first_input {
                    self.latest_result_for(idx)
                } else {
                    self.current_results().find(|result| result.step_index == idx)
                }
            })
            .collect()
    }

    pub fn resume_available(&self) -> bool {
        self.status == RunStatus::SuspendedForCorrection
    }
}

/// Convert tool output into a step result once its data has been persisted.
pub fn step_result_from(
    step_index: usize,
    attempt: u32,
    tool: &str,
    result: &ToolResult,
    output_ref: String,
    output_hash: String,
    now_ms: u128,
) -> StepResult {
    StepResult {
        step_index,
        tool: tool.to_string(),
        attempt,
        ok: result.ok,
        summary: result.summary.clone(),
        warnings: result.warnings.clone(),
        blockers: result.blockers.clone(),
        output_ref,
        output_hash,
        finished_at_epoch_ms: now_ms,
    }
}
