//! Protocol-violation errors.
//!
//! Infrastructure failures travel as plain `anyhow` errors. The variants here
//! are the synchronous rejections an operator or trigger can receive while the
//! run state stays untouched; callers classify them with
//! [`protocol_violation`].
use crate::run::RunStatus;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntakeError {
    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },
    #[error("run {run_id} already exists (retry with a new run id)")]
    RunExists { run_id: String },
    #[error("run {run_id} is {status} and cannot be resumed")]
    NotResumable { run_id: String, status: RunStatus },
    #[error("run {run_id} is {status}; only suspended runs can be abandoned")]
    NotSuspended { run_id: String, status: RunStatus },
    #[error("run {run_id} is being progressed by another execution")]
    RunBusy { run_id: String },
    #[error("approval for run {run_id} already resolved as {existing}")]
    ApprovalConflict { run_id: String, existing: String },
    #[error("run {run_id} has no pending approval (status {status})")]
    NoPendingApproval { run_id: String, status: RunStatus },
    #[error("unknown tool `{name}`")]
    UnknownTool { name: String },
    #[error("unknown workflow `{name}` (expected `intake`)")]
    UnknownWorkflow { name: String },
    #[error("tool {tool} returned malformed output: {reason}")]
    MalformedToolOutput { tool: String, reason: String },
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error("invalid run id `{run_id}` (allowed: letters, digits, '.', '_', '-')")]
    InvalidRunId { run_id: String },
    #[error("no shareable artifact for run {run_id}")]
    NothingToShare { run_id: String },
    #[error("share {token} not found")]
    ShareNotFound { token: String },
    #[error("share {token} expired")]
    ShareExpired { token: String },
    #[error("share {token} reached its access limit")]
    ShareExhausted { token: String },
    #[error("share {token} is being redeemed by another caller")]
    ShareBusy { token: String },
}

/// Return the protocol violation carried by `err`, if any.
pub fn protocol_violation(err: &anyhow::Error) -> Option<&IntakeError> {
    err.downcast_ref::<IntakeError>()
}
