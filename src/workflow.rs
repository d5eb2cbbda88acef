use crate::approval::{self, ApprovalDecision};
use crate::cli::{
    AbandonArgs, DecideArgs, ResumeArgs, ReviewArgs, RunArgs, ShareArgs, StatusArgs, WatchArgs,
};
use crate::context::RunContext;
use crate::error::IntakeError;
use crate::orchestrator::{DecisionRequest, Orchestrator, StartRequest};
use crate::run::{validate_run_id, Run, RunStatus, RunsRoot};
use crate::share;
use crate::util::display_path;
use crate::watch::{self, WatchOptions};
use anyhow::{anyhow, Context, Result};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// What a command left behind, mapped to the process exit code by `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RunFailed,
}

impl Outcome {
    fn of(run: &Run) -> Self {
        if run.status == RunStatus::Failed {
            Outcome::RunFailed
        } else {
            Outcome::Success
        }
    }
}

fn orchestrator(root: &Path) -> Result<Orchestrator> {
    let ctx = RunContext::open(RunsRoot::new(root.to_path_buf()))?;
    Ok(Orchestrator::new(ctx))
}

fn report(orchestrator: &Orchestrator, run: &Run) -> Outcome {
    let paths = orchestrator.context().root.run(&run.run_id);
    println!("run {}: {}", run.run_id, run.status);
    if let Some(reason) = &run.failure_reason {
        println!("  reason: {reason}");
    }
    println!("  evidence: {}", display_path(paths.dir(), None));
    Outcome::of(run)
}

pub fn run_start(root: &Path, args: RunArgs) -> Result<Outcome> {
    let orchestrator = orchestrator(root)?;
    let run = orchestrator.start(&StartRequest {
        workflow: args.workflow.clone(),
        run_id: args.resolved_run_id(),
        input: args.input.clone(),
    })?;
    Ok(report(&orchestrator, &run))
}

pub fn run_resume(root: &Path, args: ResumeArgs) -> Result<Outcome> {
    let orchestrator = orchestrator(root)?;
    let run = orchestrator.resume(&args.run_id, &args.input)?;
    Ok(report(&orchestrator, &run))
}

pub fn run_watch(root: &Path, args: WatchArgs) -> Result<Outcome> {
    let orchestrator = orchestrator(root)?;
    let ctx = orchestrator.context();
    let options = WatchOptions {
        incoming_dir: args.incoming.unwrap_or_else(|| ctx.root.incoming_dir()),
        uploads_dir: args.dir.unwrap_or_else(|| ctx.root.uploads_dir()),
        poll_interval: Duration::from_secs(
            args.poll_interval
                .unwrap_or(ctx.config.poll_interval_secs)
                .max(1),
        ),
        force_poll: args.poll,
        once: args.once,
    };
    watch::watch(&orchestrator, &options, &AtomicBool::new(false))?;
    Ok(Outcome::Success)
}

pub fn run_status(root: &Path, args: StatusArgs) -> Result<Outcome> {
    let orchestrator = orchestrator(root)?;
    if args.json {
        let manifest = orchestrator.status(&args.run_id)?;
        let text = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
        println!("{text}");
    } else {
        let history = orchestrator.history(&args.run_id)?;
        let manifest = &history.manifest;
        let mut line = format!("run {}: {}", manifest.run_id, manifest.status);
        if let Some(approval) = &manifest.approval_status {
            line.push_str(&format!(" (approval {approval})"));
        }
        if manifest.resume_available {
            line.push_str("; awaiting corrected file");
        }
        println!("{line}");
        if let Some(reason) = &manifest.failure_reason {
            println!("  reason: {reason}");
        }
        let trail = history
            .status_trail
            .iter()
            .map(RunStatus::as_str)
            .collect::<Vec<_>>();
        println!("  history: {}", trail.join(" -> "));
        for record in &history.approvals {
            println!(
                "  approval {}: {} by {} (attempt {})",
                record.encounter, record.decision, record.reviewer, record.attempt
            );
        }
        for share in &history.shares {
            println!(
                "  share {}: {} ({}/{} accesses)",
                share.token, share.artifact, share.access_count, share.max_access
            );
        }
    }
    Ok(Outcome::Success)
}

pub fn run_decide(root: &Path, args: DecideArgs) -> Result<Outcome> {
    let orchestrator = orchestrator(root)?;
    let run = orchestrator.resolve_approval(
        &args.run_id,
        &DecisionRequest {
            decision: args.decision,
            reviewer: args.reviewer,
            comment: args.comment,
        },
    )?;
    Ok(report(&orchestrator, &run))
}

/// Prompt adapter over `decide`: shows the review material and asks for a decision.
pub fn run_review(root: &Path, args: ReviewArgs) -> Result<Outcome> {
    let orchestrator = orchestrator(root)?;
    validate_run_id(&args.run_id)?;
    let paths = orchestrator.context().root.run(&args.run_id);
    let request = approval::load_request(&paths)?.ok_or_else(|| {
        anyhow!("run {} has no approval request on file", args.run_id)
    })?;
    let manifest = orchestrator.status(&args.run_id)?;
    if manifest.status != RunStatus::SuspendedForApproval {
        return Err(IntakeError::NoPendingApproval {
            run_id: args.run_id.clone(),
            status: manifest.status,
        }
        .into());
    }

    println!("Run {} (attempt {})", request.run_id, request.attempt);
    println!(
        "Step {} (`{}`) reported:",
        request.failure.step_index + 1,
        request.failure.tool
    );
    for blocker in &request.failure.blockers {
        println!("  - {blocker}");
    }
    println!("Review material:");
    for material in &request.review_material {
        println!(
            "  {}",
            display_path(&paths.resolve(material), Some(orchestrator.context().root.root()))
        );
    }

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let reviewer = match args.reviewer {
        Some(reviewer) => reviewer,
        None => prompt_nonempty(&mut input, "Reviewer name: ")?,
    };
    let decision = loop {
        let answer = prompt(&mut input, "Approve sharing the error report? [y/n]: ")?;
        match answer.to_ascii_lowercase().as_str() {
            "y" | "yes" => break ApprovalDecision::Approved,
            "n" | "no" => break ApprovalDecision::Rejected,
            _ => println!("Please answer y or n."),
        }
    };
    let comment = match decision {
        ApprovalDecision::Rejected => Some(prompt_nonempty(&mut input, "Rejection reason: ")?),
        ApprovalDecision::Approved => {
            Some(prompt(&mut input, "Comment (optional): ")?).filter(|text| !text.is_empty())
        }
    };

    let run = orchestrator.resolve_approval(
        &args.run_id,
        &DecisionRequest {
            decision,
            reviewer,
            comment,
        },
    )?;
    Ok(report(&orchestrator, &run))
}

fn prompt(input: &mut impl BufRead, question: &str) -> Result<String> {
    print!("{question}");
    io::stdout().flush().context("flush stdout")?;
    let mut line = String::new();
    if input.read_line(&mut line).context("read stdin")? == 0 {
        return Err(anyhow!("input closed before a decision was made"));
    }
    Ok(line.trim().to_string())
}

fn prompt_nonempty(input: &mut impl BufRead, question: &str) -> Result<String> {
    loop {
        let answer = prompt(input, question)?;
        if !answer.is_empty() {
            return Ok(answer);
        }
        println!("A value is required.");
    }
}

pub fn run_abandon(root: &Path, args: AbandonArgs) -> Result<Outcome> {
    let orchestrator = orchestrator(root)?;
    let run = orchestrator.abandon(&args.run_id, &args.reason)?;
    report(&orchestrator, &run);
    // Requested cancellation exits 0 even though the run ends `failed`.
    Ok(Outcome::Success)
}

pub fn run_share(root: &Path, args: ShareArgs) -> Result<Outcome> {
    let orchestrator = orchestrator(root)?;
    let ctx = orchestrator.context();
    let (share, artifact) = share::open_share(&ctx.root, &args.token, ctx.now()?)?;
    println!("{}", display_path(&artifact, None));
    eprintln!(
        "share for run {}: access {}/{}",
        share.run_id, share.access_count, share.max_access
    );
    Ok(Outcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn prompt_trims_and_detects_closed_input() {
        let mut input = Cursor::new("  yes \n");
        assert_eq!(prompt(&mut input, "").unwrap(), "yes");
        assert!(prompt(&mut input, "").is_err());
    }

    #[test]
    fn nonempty_prompt_skips_blank_lines() {
        let mut input = Cursor::new("\n  \nmissing zip\n");
        assert_eq!(prompt_nonempty(&mut input, "").unwrap(), "missing zip");
    }
}
