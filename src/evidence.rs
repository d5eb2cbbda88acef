//! Evidence bundle writer.
//!
//! Every function here is a pure rendering of the run state it is given; the
//! same state always yields the same bytes. Callers decide when to write; the
//! writer never touches the audit log.
use crate::run::{FailureContext, Run, RunPaths, RunStatus};
use crate::tool::{csv_line, OutputArtifact};
use crate::util::{write_bytes_atomic, write_json_atomic};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Manifest {
    pub schema_version: u32,
    pub run_id: String,
    pub workflow: String,
    pub status: RunStatus,
    pub data_classification: String,
    pub pii_handling: String,
    pub approval_status: Option<String>,
    pub resume_available: bool,
    pub resume_attempt_count: u32,
    pub steps_recorded: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Epoch milliseconds.
    pub created_at: u128,
    /// Epoch milliseconds.
    pub updated_at: u128,
}

pub fn manifest_for(run: &Run) -> Manifest {
    Manifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        run_id: run.run_id.clone(),
        workflow: run.workflow.clone(),
        status: run.status,
        data_classification: run.handling.data_classification.clone(),
        pii_handling: run.handling.pii_handling.clone(),
        approval_status: run.approval_status.clone(),
        resume_available: run.resume_available(),
        resume_attempt_count: run.resume_attempt_count,
        steps_recorded: run.step_results.len(),
        failure_reason: run.failure_reason.clone(),
        created_at: run.created_at_epoch_ms,
        updated_at: run.updated_at_epoch_ms,
    }
}

/// Overwrite `manifest.json` with the run's latest state.
pub fn write_manifest(paths: &RunPaths, run: &Run) -> Result<()> {
    write_json_atomic(&paths.manifest_path(), &manifest_for(run)).context("write manifest")
}

pub fn render_plan(run: &Run) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Plan: {}\n\n", run.run_id));
    out.push_str(&format!("Workflow: `{}`\n\n", run.workflow));
    for (idx, step) in run.plan.steps.iter().enumerate() {
        out.push_str(&format!("{}. `{}`", idx + 1, step.tool));
        if step.reads_input {
            out.push_str(" (reads run input)");
        }
        out.push('\n');
        for (key, value) in &step.args {
            out.push_str(&format!("   - {key}: `{value}`\n"));
        }
    }
    out
}

pub fn write_plan(paths: &RunPaths, run: &Run) -> Result<()> {
    write_bytes_atomic(&paths.plan_path(), render_plan(run).as_bytes()).context("write plan")
}

/// Staff-facing summary: status, step table, and the outcome note.
pub fn render_summary(run: &Run, outcome: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Run summary: {}\n\n", run.run_id));
    out.push_str(&format!("- Status: `{}`\n", run.status));
    out.push_str(&format!("- Workflow: `{}`\n", run.workflow));
    out.push_str(&format!(
        "- Data classification: {} (PII handling: {})\n",
        run.handling.data_classification, run.handling.pii_handling
    ));
    out.push_str(&format!("- Resume attempts: {}\n", run.resume_attempt_count));
    if let Some(approval) = &run.approval_status {
        out.push_str(&format!("- Approval: {approval}\n"));
    }
    out.push_str("\n## Steps\n\n");
    if run.step_results.is_empty() {
        out.push_str("No steps executed.\n");
    } else {
        out.push_str("| Attempt | Step | Tool | Outcome | Summary |\n");
        out.push_str("|---|---|---|---|---|\n");
        for result in &run.step_results {
            let outcome = if result.ok { "ok" } else { "blocked" };
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                result.attempt,
                result.step_index + 1,
                result.tool,
                outcome,
                result.summary.replace('|', "/")
            ));
        }
    }
    out.push_str("\n## Outcome\n\n");
    out.push_str(&format!("{}\n", outcome.trim_end()));
    out
}

pub fn write_summary(paths: &RunPaths, run: &Run, outcome: &str) -> Result<()> {
    write_bytes_atomic(&paths.summary_path(), render_summary(run, outcome).as_bytes())
        .context("write summary")
}

/// Blockers that halted the run, one line each.
pub fn blocker_report(failure: &FailureContext) -> OutputArtifact {
    let mut out = csv_line(["step", "tool", "blocker"]);
    let step = (failure.step_index + 1).to_string();
    for blocker in &failure.blockers {
        out.push_str(&csv_line([step.as_str(), failure.tool.as_str(), blocker.as_str()]));
    }
    OutputArtifact {
        name: "blocker_report.csv".to_string(),
        bytes: out.into_bytes(),
    }
}

/// Materialize structured outputs, one file per kind.
///
/// Files from earlier attempts whose kind is no longer produced are removed so
/// `outputs/` always matches the run's current results.
pub fn write_outputs(paths: &RunPaths, artifacts: &[OutputArtifact]) -> Result<()> {
    let dir = paths.outputs_dir();
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let keep = artifacts
        .iter()
        .map(|artifact| artifact.name.as_str())
        .collect::<BTreeSet<_>>();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry.with_context(|| format!("read {}", dir.display()))?.path();
        let stale = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| !keep.contains(name));
        if stale && path.is_file() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
    }
    for artifact in artifacts {
        write_bytes_atomic(&paths.output_path(&artifact.name), &artifact.bytes)?;
    }
    Ok(())
}
