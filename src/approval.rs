//! Approval gate records.
//!
//! Each gate encounter owns one immutable record under `approvals/<n>.json`.
//! The record is created with an exclusive open, so the first decision wins
//! and a contradicting second decision is a conflict rather than an overwrite.
use crate::error::IntakeError;
use crate::run::{FailureContext, RunPaths};
use crate::util::{create_json_exclusive, read_json, write_json_atomic};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::str::FromStr;

pub const APPROVAL_SCHEMA_VERSION: u32 = 1;
/// Reviewer recorded for decisions the system takes without a human.
pub const SYSTEM_REVIEWER: &str = "system";

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" | "approve" => Ok(ApprovalDecision::Approved),
            "rejected" | "reject" => Ok(ApprovalDecision::Rejected),
            other => Err(format!(
                "unknown decision `{other}` (expected approved or rejected)"
            )),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ApprovalRecord {
    pub schema_version: u32,
    pub run_id: String,
    /// Gate encounter this record resolves (1-based).
    pub encounter: u32,
    pub attempt: u32,
    pub reviewer: String,
    pub decision: ApprovalDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub decided_at_epoch_ms: u128,
}

/// Review material for the pending encounter, written to `approval_request.json`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub schema_version: u32,
    pub run_id: String,
    pub encounter: u32,
    pub attempt: u32,
    pub failure: FailureContext,
    /// Run-relative paths of the reports a reviewer should read.
    pub review_material: Vec<String>,
    pub requested_at_epoch_ms: u128,
}

/// Result of trying to record a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    /// The same decision was already on file.
    AlreadyRecorded(ApprovalRecord),
}

pub fn write_request(paths: &RunPaths, request: &ApprovalRequest) -> Result<()> {
    write_json_atomic(&paths.approval_request_path(), request).context("persist approval request")
}

pub fn load_request(paths: &RunPaths) -> Result<Option<ApprovalRequest>> {
    let path = paths.approval_request_path();
    if !path.is_file() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

/// Create the record for `record.encounter`, or report what is already there.
pub fn record_decision(paths: &RunPaths, record: &ApprovalRecord) -> Result<RecordOutcome> {
    let path = paths.approval_record_path(record.encounter);
    if create_json_exclusive(&path, record)? {
        return Ok(RecordOutcome::Created);
    }
    let existing: ApprovalRecord = read_json(&path)?;
    if existing.decision == record.decision {
        return Ok(RecordOutcome::AlreadyRecorded(existing));
    }
    Err(IntakeError::ApprovalConflict {
        run_id: record.run_id.clone(),
        existing: existing.decision.to_string(),
    }
    .into())
}

pub fn load_record(paths: &RunPaths, encounter: u32) -> Result<Option<ApprovalRecord>> {
    let path = paths.approval_record_path(encounter);
    if !path.is_file() {
        return Ok(None);
    }
    read_json(&path).map(Some)
}

/// Every record on file for a run, ordered by encounter.
pub fn load_records(paths: &RunPaths) -> Result<Vec<ApprovalRecord>> {
    let dir = paths.approvals_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            records.push(read_json::<ApprovalRecord>(&path)?);
        }
    }
    records.sort_by_key(|record| record.encounter);
    Ok(records)
}
