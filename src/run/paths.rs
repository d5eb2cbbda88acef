//! Typed paths into the runs root and a single run's evidence bundle.
//!
//! Centralizing path construction keeps the bundle layout in one place so the
//! orchestrator, evidence writer, and trigger agree on where things live.
use crate::error::IntakeError;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Root directory holding every run, share, and drop-off folder.
#[derive(Debug, Clone)]
pub struct RunsRoot {
    root: PathBuf,
}

impl RunsRoot {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the optional `intake.json` config path.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("intake.json")
    }

    /// Return the directory holding one folder per run id.
    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run(&self, run_id: &str) -> RunPaths {
        RunPaths {
            dir: self.runs_dir().join(run_id),
        }
    }

    /// Return the `shares/` directory.
    pub fn shares_dir(&self) -> PathBuf {
        self.root.join("shares")
    }

    /// Return the partner-accessible copy location for a run.
    pub fn share_partner_dir(&self, run_id: &str) -> PathBuf {
        self.shares_dir().join("partner").join(run_id)
    }

    /// Return the `shares/tokens/` directory of share records.
    pub fn share_tokens_dir(&self) -> PathBuf {
        self.shares_dir().join("tokens")
    }

    pub fn share_record_path(&self, token: &str) -> PathBuf {
        self.share_tokens_dir().join(format!("{token}.json"))
    }

    /// Return the lock serializing redemptions of one token.
    pub fn share_lock_path(&self, token: &str) -> PathBuf {
        self.share_tokens_dir().join(format!("{token}.lock"))
    }

    /// Return the `uploads/` directory watched for corrected files.
    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    /// Return the `incoming/` directory whose `<partner>/<period>/` folders
    /// start new runs.
    pub fn incoming_dir(&self) -> PathBuf {
        self.root.join("incoming")
    }

    /// Return the drop-off folder for corrected files of one run.
    pub fn upload_dir(&self, run_id: &str) -> PathBuf {
        self.uploads_dir().join(run_id)
    }
}

/// Paths inside one run directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    dir: PathBuf,
}

impl RunPaths {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the authoritative `run.json` record path.
    pub fn run_path(&self) -> PathBuf {
        self.dir.join("run.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    pub fn plan_path(&self) -> PathBuf {
        self.dir.join("plan.md")
    }

    /// Return the append-only audit trail path.
    pub fn tool_calls_path(&self) -> PathBuf {
        self.dir.join("tool_calls.jsonl")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join("summary.md")
    }

    /// Return the checkpoint path, present only while suspended.
    pub fn resume_state_path(&self) -> PathBuf {
        self.dir.join("resume_state.json")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.dir.join("outputs")
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.outputs_dir().join(name)
    }

    /// Return the relative reference for a persisted step output.
    pub fn step_output_ref(step_index: usize, attempt: u32, tool: &str) -> String {
        format!("steps/{step_index:02}-{tool}.a{attempt}.json")
    }

    pub fn approvals_dir(&self) -> PathBuf {
        self.dir.join("approvals")
    }

    /// Return the immutable record path for one gate encounter.
    pub fn approval_record_path(&self, encounter: u32) -> PathBuf {
        self.approvals_dir().join(format!("{encounter}.json"))
    }

    pub fn approval_request_path(&self) -> PathBuf {
        self.dir.join("approval_request.json")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.dir.join("archive")
    }

    pub fn archived_checkpoint_path(&self, attempt: u32) -> PathBuf {
        self.archive_dir()
            .join(format!("resume_state.{attempt}.json"))
    }

    /// Return the execution-authority lock path.
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(".lock")
    }

    /// Resolve a run-relative reference to an absolute path.
    pub fn resolve(&self, rel: &str) -> PathBuf {
        self.dir.join(rel)
    }
}

fn run_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("run id regex"))
}

/// Reject run ids that could escape the runs root or collide with bundle files.
pub fn validate_run_id(run_id: &str) -> Result<(), IntakeError> {
    if run_id_pattern().is_match(run_id) && !run_id.contains("..") {
        return Ok(());
    }
    Err(IntakeError::InvalidRunId {
        run_id: run_id.to_string(),
    })
}
