//! CLI argument parsing for the intake orchestrator.
//!
//! Every command takes the runs root through `--root`; handlers live in
//! `workflow` and only translate arguments into orchestrator calls.
use crate::approval::ApprovalDecision;
use crate::plan::DETERMINISTIC_MODE;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_ROOT: &str = "./runs";

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "intake",
    version,
    about = "Partner data-intake run orchestrator",
    after_help = "Examples:\n  intake run intake --input partner.csv --partner acme --period Q1\n  intake status --run-id acme-Q1-deterministic --json\n  intake decide --run-id acme-Q1-deterministic --decision approved --reviewer dana\n  intake resume --run-id acme-Q1-deterministic --input fixed.csv\n  intake watch --poll-interval 5",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Runs root holding run directories, shares, and uploads
    #[arg(long, global = true, value_name = "DIR", default_value = DEFAULT_ROOT)]
    pub root: PathBuf,

    /// Log at debug level (overrides the default filter, not RUST_LOG)
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Resume(ResumeArgs),
    Watch(WatchArgs),
    Status(StatusArgs),
    Decide(DecideArgs),
    Review(ReviewArgs),
    Abandon(AbandonArgs),
    Share(ShareArgs),
}

#[derive(Parser, Debug)]
#[command(about = "Start a run and drive it until it completes, fails, or suspends")]
pub struct RunArgs {
    /// Workflow to plan (only `intake` is defined)
    pub workflow: String,

    /// Partner file to ingest
    #[arg(long, value_name = "PATH")]
    pub input: PathBuf,

    /// Explicit run id (defaults to <partner>-<period>-<mode>)
    #[arg(long, value_name = "ID")]
    pub run_id: Option<String>,

    #[arg(long, value_name = "NAME", default_value = "demo")]
    pub partner: String,

    #[arg(long, value_name = "PERIOD", default_value = "Q1")]
    pub period: String,

    #[arg(long, value_name = "MODE", default_value = DETERMINISTIC_MODE)]
    pub mode: String,
}

impl RunArgs {
    pub fn resolved_run_id(&self) -> String {
        self.run_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}-{}", self.partner, self.period, self.mode))
    }
}

#[derive(Parser, Debug)]
#[command(about = "Resume a run suspended for correction with a corrected file")]
pub struct ResumeArgs {
    #[arg(long, value_name = "ID")]
    pub run_id: String,

    /// Corrected partner file
    #[arg(long, value_name = "PATH")]
    pub input: PathBuf,
}

#[derive(Parser, Debug)]
#[command(about = "Start runs from new partner files and resume runs from corrected ones")]
pub struct WatchArgs {
    /// Uploads folder of corrected files (defaults to <root>/uploads)
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Folder of initial <partner>/<period>/ uploads (defaults to <root>/incoming)
    #[arg(long, value_name = "DIR")]
    pub incoming: Option<PathBuf>,

    /// Seconds between rescans (defaults to the configured interval)
    #[arg(long, value_name = "SECONDS")]
    pub poll_interval: Option<u64>,

    /// Rescan on a timer instead of using filesystem notifications
    #[arg(long)]
    pub poll: bool,

    /// Scan once, wait for dispatched resumes, and exit
    #[arg(long)]
    pub once: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Show a run's manifest")]
pub struct StatusArgs {
    #[arg(long, value_name = "ID")]
    pub run_id: String,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Record an approval decision for a suspended run")]
pub struct DecideArgs {
    #[arg(long, value_name = "ID")]
    pub run_id: String,

    /// approved or rejected
    #[arg(long, value_name = "DECISION")]
    pub decision: ApprovalDecision,

    #[arg(long, value_name = "NAME")]
    pub reviewer: String,

    #[arg(long, value_name = "TEXT")]
    pub comment: Option<String>,
}

#[derive(Parser, Debug)]
#[command(about = "Review a suspended run interactively")]
pub struct ReviewArgs {
    #[arg(long, value_name = "ID")]
    pub run_id: String,

    /// Reviewer name (prompted when omitted)
    #[arg(long, value_name = "NAME")]
    pub reviewer: Option<String>,
}

#[derive(Parser, Debug)]
#[command(about = "Cancel a suspended run")]
pub struct AbandonArgs {
    #[arg(long, value_name = "ID")]
    pub run_id: String,

    #[arg(long, value_name = "TEXT")]
    pub reason: String,
}

#[derive(Parser, Debug)]
#[command(about = "Redeem a secure share token and print the artifact path")]
pub struct ShareArgs {
    #[arg(long, value_name = "TOKEN")]
    pub token: String,
}
