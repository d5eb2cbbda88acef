//! Append-only audit trail of everything a run does.
//!
//! One JSON object per line in each run's `tool_calls.jsonl`. The log itself
//! is format-agnostic: what may be written is decided by the caller through
//! [`SanitizedPayload`], whose schema admits only counters, hashes,
//! enumerated values, and a short note.
use crate::run::RunStatus;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

mod log;
mod payload;

pub use log::FileAuditLog;
#[cfg(test)]
pub use log::MemoryAuditLog;
pub use payload::{CountKey, HashKey, SanitizedPayload};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    RunStarted,
    StepStart,
    StepEnd,
    ApprovalRequested,
    ApprovalResolved,
    Suspended,
    Resumed,
    ShareIssued,
    RunCompleted,
    RunRejected,
    RunFailed,
    Abandoned,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::RunStarted => "run_started",
            AuditKind::StepStart => "step_start",
            AuditKind::StepEnd => "step_end",
            AuditKind::ApprovalRequested => "approval_requested",
            AuditKind::ApprovalResolved => "approval_resolved",
            AuditKind::Suspended => "suspended",
            AuditKind::Resumed => "resumed",
            AuditKind::ShareIssued => "share_issued",
            AuditKind::RunCompleted => "run_completed",
            AuditKind::RunRejected => "run_rejected",
            AuditKind::RunFailed => "run_failed",
            AuditKind::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AuditEvent {
    pub timestamp_epoch_ms: u128,
    pub run_id: String,
    /// Resume attempt the event belongs to (0 for the initial execution).
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub kind: AuditKind,
    /// Run status after the event.
    pub status: RunStatus,
    #[serde(default)]
    pub payload: SanitizedPayload,
}

/// Identity used to recognize redelivered events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DedupeKey {
    pub run_id: String,
    pub attempt: u32,
    pub step_index: Option<usize>,
    pub kind: AuditKind,
    pub status: RunStatus,
}

impl AuditEvent {
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            run_id: self.run_id.clone(),
            attempt: self.attempt,
            step_index: self.step_index,
            kind: self.kind,
            status: self.status,
        }
    }
}

/// Durable, ordered sink for audit events.
///
/// `append` must not return before the event is on durable storage, and must
/// not wait on anything besides that write.
pub trait AuditLog: Send + Sync {
    fn append(&self, event: &AuditEvent) -> Result<()>;

    /// Events recorded for one run, in append order, duplicates included.
    fn events(&self, run_id: &str) -> Result<Vec<AuditEvent>>;
}

/// Drop redelivered events, keeping the first occurrence of each key.
pub fn dedupe_events(events: Vec<AuditEvent>) -> Vec<AuditEvent> {
    let mut seen = BTreeSet::new();
    events
        .into_iter()
        .filter(|event| seen.insert(event.dedupe_key()))
        .collect()
}

/// Status sequence as observed in the log, one entry per distinct event.
pub fn status_trail(events: &[AuditEvent]) -> Vec<RunStatus> {
    let mut trail: Vec<RunStatus> = Vec::new();
    for event in events {
        if trail.last() != Some(&event.status) {
            trail.push(event.status);
        }
    }
    trail
}
