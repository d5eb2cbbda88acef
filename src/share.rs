//! Secure share references for partner-facing artifacts.
//!
//! A share is issued only from an `approved` [`ApprovalRecord`]; there is no
//! other constructor. Issuing copies the artifact into the partner-accessible
//! folder, writes a token record, and opens the run's correction drop folder.
use crate::approval::{ApprovalDecision, ApprovalRecord};
use crate::error::IntakeError;
use crate::run::{FileLock, Run, RunsRoot};
use crate::util::{create_json_exclusive, read_json, write_json_atomic};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

pub const SHARE_SCHEMA_VERSION: u32 = 1;

const SHARE_LOCK_ATTEMPTS: u32 = 500;
const SHARE_LOCK_BACKOFF: Duration = Duration::from_millis(10);

/// Shareable outputs in order of preference.
const SHAREABLE_OUTPUTS: [&str; 3] = [
    "partner_error_report.csv",
    "validation_report.csv",
    "blocker_report.csv",
];

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecureShareReference {
    pub schema_version: u32,
    pub token: String,
    pub run_id: String,
    /// Encounter of the approval that authorized this share.
    pub approval_encounter: u32,
    /// Artifact path relative to the runs root.
    pub artifact: String,
    pub created_at_epoch_ms: u128,
    pub expires_at_epoch_ms: u128,
    pub access_count: u32,
    pub max_access: u32,
}

/// Settings that bound a share's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct ShareLimits {
    pub ttl_secs: u64,
    pub max_access: u32,
}

pub fn issue_share(
    root: &RunsRoot,
    run: &Run,
    approval: &ApprovalRecord,
    limits: ShareLimits,
    now_ms: u128,
) -> Result<SecureShareReference> {
    if approval.decision != ApprovalDecision::Approved || approval.run_id != run.run_id {
        return Err(anyhow!(
            "share for run {} requires an approved decision for that run",
            run.run_id
        ));
    }
    let paths = root.run(&run.run_id);
    let (name, source) = SHAREABLE_OUTPUTS
        .iter()
        .map(|name| (*name, paths.output_path(name)))
        .find(|(_, path)| path.is_file())
        .ok_or_else(|| IntakeError::NothingToShare {
            run_id: run.run_id.clone(),
        })?;

    let partner_dir = root.share_partner_dir(&run.run_id);
    fs::create_dir_all(&partner_dir)
        .with_context(|| format!("create {}", partner_dir.display()))?;
    let dest = partner_dir.join(name);
    fs::copy(&source, &dest)
        .with_context(|| format!("copy {} to {}", source.display(), dest.display()))?;

    let upload_dir = root.upload_dir(&run.run_id);
    fs::create_dir_all(&upload_dir)
        .with_context(|| format!("create {}", upload_dir.display()))?;

    let share = SecureShareReference {
        schema_version: SHARE_SCHEMA_VERSION,
        token: Uuid::new_v4().to_string(),
        run_id: run.run_id.clone(),
        approval_encounter: approval.encounter,
        artifact: format!("shares/partner/{}/{name}", run.run_id),
        created_at_epoch_ms: now_ms,
        expires_at_epoch_ms: now_ms + u128::from(limits.ttl_secs) * 1000,
        access_count: 0,
        max_access: limits.max_access,
    };
    let record_path = root.share_record_path(&share.token);
    if !create_json_exclusive(&record_path, &share)? {
        return Err(anyhow!("share token collision at {}", record_path.display()));
    }
    Ok(share)
}

/// Redeem a token: enforce expiry and the access ceiling, then count the access.
pub fn open_share(
    root: &RunsRoot,
    token: &str,
    now_ms: u128,
) -> Result<(SecureShareReference, PathBuf)> {
    let not_found = || IntakeError::ShareNotFound {
        token: token.to_string(),
    };
    // Only canonical uuids name a record, which also keeps tokens out of path syntax.
    let parsed = Uuid::parse_str(token).map_err(|_| not_found())?;
    if parsed.to_string() != token {
        return Err(not_found().into());
    }
    let record_path = root.share_record_path(token);
    if !record_path.is_file() {
        return Err(not_found().into());
    }
    let _lock = lock_share(root, token)?;
    let mut share: SecureShareReference = read_json(&record_path)?;
    if now_ms >= share.expires_at_epoch_ms {
        return Err(IntakeError::ShareExpired {
            token: token.to_string(),
        }
        .into());
    }
    if share.access_count >= share.max_access {
        return Err(IntakeError::ShareExhausted {
            token: token.to_string(),
        }
        .into());
    }
    share.access_count += 1;
    write_json_atomic(&record_path, &share)?;
    let artifact = root.root().join(&share.artifact);
    Ok((share, artifact))
}

/// Wait for the token's redemption lock, giving up with `ShareBusy`.
fn lock_share(root: &RunsRoot, token: &str) -> Result<FileLock> {
    let path = root.share_lock_path(token);
    for _ in 0..SHARE_LOCK_ATTEMPTS {
        if let Some(lock) = FileLock::try_acquire(path.clone())? {
            return Ok(lock);
        }
        thread::sleep(SHARE_LOCK_BACKOFF);
    }
    Err(IntakeError::ShareBusy {
        token: token.to_string(),
    }
    .into())
}

/// Shares issued for one run, ordered by creation time.
pub fn shares_for_run(root: &RunsRoot, run_id: &str) -> Result<Vec<SecureShareReference>> {
    let dir = root.share_tokens_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut shares = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read {}", dir.display()))?
            .path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let share: SecureShareReference = read_json(&path)?;
        if share.run_id == run_id {
            shares.push(share);
        }
    }
    shares.sort_by(|a, b| {
        a.created_at_epoch_ms
            .cmp(&b.created_at_epoch_ms)
            .then_with(|| a.token.cmp(&b.token))
    });
    Ok(shares)
}
