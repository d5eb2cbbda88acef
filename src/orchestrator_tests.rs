use super::*;
use crate::audit::status_trail;
use crate::config::IntakeConfig;
use crate::share::shares_for_run;
use crate::testing::{Harness, CLEAN_CSV, MISSING_FIELD_CSV};
use crate::tool::{Tool, ToolInput, ToolKind, ToolRegistry, ToolResult};
use anyhow::anyhow;
use std::sync::Arc;
use std::thread;

fn kinds(events: &[AuditEvent]) -> Vec<AuditKind> {
    events.iter().map(|event| event.kind).collect()
}

fn resolved_decision(event: &AuditEvent) -> Option<ApprovalDecision> {
    (event.kind == AuditKind::ApprovalResolved)
        .then_some(event.payload.decision)
        .flatten()
}

fn violation(err: &anyhow::Error) -> &IntakeError {
    crate::error::protocol_violation(err).expect("protocol violation")
}

fn assert_trail_follows_status_machine(events: &[AuditEvent]) {
    let trail = status_trail(events);
    for pair in trail.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "illegal step {} -> {} in {trail:?}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn clean_file_completes_without_approval() {
    let harness = Harness::standard();
    let run = harness.start("acme-Q1", CLEAN_CSV);

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_results.len(), 3);
    assert!(run.step_results.iter().all(|result| result.ok));
    let paths = harness.paths("acme-Q1");
    assert!(paths.output_path("canonical.csv").is_file());
    assert!(paths.output_path("validation_report.csv").is_file());
    assert!(!paths.resume_state_path().exists());
    assert!(!paths.lock_path().exists());

    let events = harness.events("acme-Q1");
    assert_eq!(events.first().map(|event| event.kind), Some(AuditKind::RunStarted));
    assert_eq!(events.last().map(|event| event.kind), Some(AuditKind::RunCompleted));
    assert!(!kinds(&events).contains(&AuditKind::ApprovalRequested));
    assert_eq!(
        status_trail(&events),
        vec![RunStatus::Running, RunStatus::Completed]
    );

    let manifest = harness.orchestrator.status("acme-Q1").unwrap();
    assert_eq!(manifest.status, RunStatus::Completed);
    assert!(!manifest.resume_available);
}

#[test]
fn blocked_run_suspends_then_resumes_after_approval() {
    let harness = Harness::standard();
    let run = harness.start("acme-Q2", MISSING_FIELD_CSV);
    assert_eq!(run.status, RunStatus::SuspendedForApproval);
    assert_eq!(run.approval_status.as_deref(), Some("pending"));
    let paths = harness.paths("acme-Q2");
    assert!(paths.approval_request_path().is_file());
    assert!(paths.output_path("partner_error_report.csv").is_file());
    assert!(paths.output_path("blocker_report.csv").is_file());
    assert!(!paths.output_path("canonical.csv").exists());

    let checkpoint = load_checkpoint(&paths).unwrap().expect("checkpoint");
    assert_eq!(checkpoint.status, RunStatus::SuspendedForApproval);
    assert_eq!(checkpoint.last_completed_step, Some(0));
    assert_eq!(checkpoint.resume_from_step, 0);
    let failure = checkpoint.failure.expect("failure context");
    assert_eq!(failure.step_index, 1);
    assert_eq!(failure.blockers, vec!["1 errors found".to_string()]);

    let approved = harness.decide("acme-Q2", ApprovalDecision::Approved).unwrap();
    assert_eq!(approved.status, RunStatus::SuspendedForCorrection);
    assert!(approved.resume_available());
    let shares = shares_for_run(harness.root(), "acme-Q2").unwrap();
    assert_eq!(shares.len(), 1);
    assert_eq!(
        shares[0].artifact,
        "shares/partner/acme-Q2/partner_error_report.csv"
    );
    assert!(harness.root().upload_dir("acme-Q2").is_dir());

    let resumed = harness.resume("acme-Q2", "fixed.csv", CLEAN_CSV).unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.resume_attempt_count, 1);
    assert_eq!(resumed.current_results().count(), 3);
    assert!(resumed.input_path.ends_with("fixed.csv"));
    assert!(paths.archived_checkpoint_path(0).is_file());
    assert!(!paths.resume_state_path().exists());
    assert!(!paths.output_path("partner_error_report.csv").exists());
    assert!(paths.output_path("canonical.csv").is_file());

    let events = harness.events("acme-Q2");
    assert_eq!(
        status_trail(&events),
        vec![
            RunStatus::Running,
            RunStatus::SuspendedForApproval,
            RunStatus::SuspendedForCorrection,
            RunStatus::Running,
            RunStatus::Completed,
        ]
    );
    let resumed_event = events
        .iter()
        .find(|event| event.kind == AuditKind::Resumed)
        .expect("resumed event");
    assert_eq!(resumed_event.attempt, 1);
    assert_eq!(resumed_event.step_index, Some(0));
}

#[test]
fn rejection_ends_run_without_share() {
    let harness = Harness::standard();
    harness.start("acme-Q3", MISSING_FIELD_CSV);
    let rejected = harness.decide("acme-Q3", ApprovalDecision::Rejected).unwrap();

    assert_eq!(rejected.status, RunStatus::Rejected);
    assert_eq!(
        rejected.failure_reason.as_deref(),
        Some("rejected by dana: checked")
    );
    assert!(shares_for_run(harness.root(), "acme-Q3").unwrap().is_empty());
    assert!(!harness.root().upload_dir("acme-Q3").exists());
    assert!(!harness.paths("acme-Q3").resume_state_path().exists());

    let err = harness.resume("acme-Q3", "late.csv", CLEAN_CSV).unwrap_err();
    assert!(matches!(violation(&err), IntakeError::NotResumable { .. }));
    let events = harness.events("acme-Q3");
    assert!(!kinds(&events).contains(&AuditKind::ShareIssued));
    assert_eq!(events.last().map(|event| event.kind), Some(AuditKind::RunRejected));
}

#[test]
fn still_broken_resubmission_reenters_the_gate() {
    let harness = Harness::standard();
    harness.start("acme-Q4", MISSING_FIELD_CSV);
    harness.decide("acme-Q4", ApprovalDecision::Approved).unwrap();
    let again = harness
        .resume("acme-Q4", "retry.csv", MISSING_FIELD_CSV)
        .unwrap();
    assert_eq!(again.status, RunStatus::SuspendedForApproval);
    assert_eq!(again.approval_encounters, 2);
    assert_eq!(again.resume_attempt_count, 1);

    let approved = harness.decide("acme-Q4", ApprovalDecision::Approved).unwrap();
    assert_eq!(approved.status, RunStatus::SuspendedForCorrection);
    assert_eq!(shares_for_run(harness.root(), "acme-Q4").unwrap().len(), 2);
    let completed = harness.resume("acme-Q4", "final.csv", CLEAN_CSV).unwrap();
    assert_eq!(completed.status, RunStatus::Completed);
    assert_eq!(completed.resume_attempt_count, 2);
    assert_trail_follows_status_machine(&harness.events("acme-Q4"));
}

#[test]
fn every_share_follows_an_approval() {
    let harness = Harness::standard();
    harness.start("acme-Q5", MISSING_FIELD_CSV);
    harness.decide("acme-Q5", ApprovalDecision::Approved).unwrap();
    harness
        .resume("acme-Q5", "retry.csv", MISSING_FIELD_CSV)
        .unwrap();
    harness.decide("acme-Q5", ApprovalDecision::Approved).unwrap();

    let events = harness.events("acme-Q5");
    let mut approvals = 0;
    let mut shares = 0;
    for event in &events {
        if resolved_decision(event) == Some(ApprovalDecision::Approved) {
            approvals += 1;
        }
        if event.kind == AuditKind::ShareIssued {
            shares += 1;
            assert!(shares <= approvals, "share issued before its approval");
        }
    }
    assert_eq!(shares, 2);
    assert_trail_follows_status_machine(&events);
}

#[test]
fn repeated_decision_is_a_no_op_and_contradiction_conflicts() {
    let harness = Harness::standard();
    harness.start("acme-Q6", MISSING_FIELD_CSV);
    harness.decide("acme-Q6", ApprovalDecision::Approved).unwrap();
    let again = harness.decide("acme-Q6", ApprovalDecision::Approved).unwrap();
    assert_eq!(again.status, RunStatus::SuspendedForCorrection);
    assert_eq!(shares_for_run(harness.root(), "acme-Q6").unwrap().len(), 1);

    let err = harness
        .decide("acme-Q6", ApprovalDecision::Rejected)
        .unwrap_err();
    assert!(matches!(violation(&err), IntakeError::ApprovalConflict { .. }));
    let run = load_run(harness.root(), "acme-Q6").unwrap();
    assert_eq!(run.status, RunStatus::SuspendedForCorrection);
}

#[test]
fn decision_without_pending_gate_is_refused() {
    let harness = Harness::standard();
    harness.start("acme-Q7", CLEAN_CSV);
    let err = harness
        .decide("acme-Q7", ApprovalDecision::Approved)
        .unwrap_err();
    assert!(matches!(violation(&err), IntakeError::NoPendingApproval { .. }));
    let err = harness
        .decide("missing-run", ApprovalDecision::Approved)
        .unwrap_err();
    assert!(matches!(violation(&err), IntakeError::RunNotFound { .. }));
}

#[test]
fn duplicate_run_id_is_refused() {
    let harness = Harness::standard();
    harness.start("acme-Q8", CLEAN_CSV);
    let err = harness
        .orchestrator
        .start(&StartRequest {
            workflow: "intake".to_string(),
            run_id: "acme-Q8".to_string(),
            input: harness.write_input("other.csv", CLEAN_CSV),
        })
        .unwrap_err();
    assert!(matches!(violation(&err), IntakeError::RunExists { .. }));
}

#[test]
fn unknown_workflow_creates_nothing() {
    let harness = Harness::standard();
    let err = harness
        .orchestrator
        .start(&StartRequest {
            workflow: "payroll".to_string(),
            run_id: "acme-Q9".to_string(),
            input: harness.write_input("in.csv", CLEAN_CSV),
        })
        .unwrap_err();
    assert!(matches!(violation(&err), IntakeError::UnknownWorkflow { .. }));
    assert!(!harness.paths("acme-Q9").dir().exists());
}

#[test]
fn unsupported_input_blocks_at_ingest() {
    let harness = Harness::standard();
    let input = harness.write_input("scan.pdf", "%PDF-1.4");
    let run = harness
        .orchestrator
        .start(&StartRequest {
            workflow: "intake".to_string(),
            run_id: "acme-pdf".to_string(),
            input,
        })
        .unwrap();
    assert_eq!(run.status, RunStatus::SuspendedForApproval);
    assert_eq!(run.step_results.len(), 1);
    assert_eq!(run.step_results[0].summary, "Unsupported file format: pdf");

    let approved = harness
        .decide("acme-pdf", ApprovalDecision::Approved)
        .unwrap();
    assert_eq!(approved.status, RunStatus::SuspendedForCorrection);
    let shares = shares_for_run(harness.root(), "acme-pdf").unwrap();
    assert_eq!(
        shares[0].artifact,
        "shares/partner/acme-pdf/blocker_report.csv"
    );
}

struct FailingValidate;

impl Tool for FailingValidate {
    fn kind(&self) -> ToolKind {
        ToolKind::Validate
    }

    fn invoke(&self, _input: &ToolInput) -> anyhow::Result<ToolResult> {
        Err(anyhow!("validation backend unavailable"))
    }
}

struct InconsistentValidate;

impl Tool for InconsistentValidate {
    fn kind(&self) -> ToolKind {
        ToolKind::Validate
    }

    fn invoke(&self, _input: &ToolInput) -> anyhow::Result<ToolResult> {
        let mut result = ToolResult::success("looks fine", Map::new());
        result.blockers.push("but not really".to_string());
        Ok(result)
    }
}

#[test]
fn tool_error_fails_the_run() {
    let harness =
        Harness::with_registry(ToolRegistry::standard().with_tool(Box::new(FailingValidate)));
    let run = harness.start("acme-err", CLEAN_CSV);
    assert_eq!(run.status, RunStatus::Failed);
    let reason = run.failure_reason.expect("failure reason");
    assert!(reason.contains("validation backend unavailable"), "{reason}");
    assert_eq!(run.step_results.len(), 1);

    let events = harness.events("acme-err");
    assert_eq!(events.last().map(|event| event.kind), Some(AuditKind::RunFailed));
    assert!(!harness.paths("acme-err").lock_path().exists());
    let summary = fs::read_to_string(harness.paths("acme-err").summary_path()).unwrap();
    assert!(summary.contains("Retry with a new run id"));
}

#[test]
fn malformed_tool_output_fails_the_run() {
    let harness =
        Harness::with_registry(ToolRegistry::standard().with_tool(Box::new(InconsistentValidate)));
    let run = harness.start("acme-bad", CLEAN_CSV);
    assert_eq!(run.status, RunStatus::Failed);
    let reason = run.failure_reason.expect("failure reason");
    assert!(reason.contains("ok=true with blockers"), "{reason}");
}

#[test]
fn exhausted_resume_attempts_reject_the_run() {
    let harness = Harness::with_config(IntakeConfig {
        max_resume_attempts: 1,
        ..IntakeConfig::default()
    });
    harness.start("acme-max", MISSING_FIELD_CSV);
    harness.decide("acme-max", ApprovalDecision::Approved).unwrap();
    let run = harness
        .resume("acme-max", "retry.csv", MISSING_FIELD_CSV)
        .unwrap();

    assert_eq!(run.status, RunStatus::Rejected);
    assert_eq!(
        run.failure_reason.as_deref(),
        Some("rejected by system: resume attempts exhausted")
    );
    let records = approval::load_records(&harness.paths("acme-max")).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].reviewer, "system");
    assert_trail_follows_status_machine(&harness.events("acme-max"));
}

#[test]
fn approval_can_be_automatic() {
    let harness = Harness::with_config(IntakeConfig {
        require_approval: false,
        ..IntakeConfig::default()
    });
    let run = harness.start("acme-auto", MISSING_FIELD_CSV);
    assert_eq!(run.status, RunStatus::SuspendedForCorrection);
    let records = approval::load_records(&harness.paths("acme-auto")).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reviewer, "system");
    assert_eq!(records[0].decision, ApprovalDecision::Approved);
    assert_eq!(shares_for_run(harness.root(), "acme-auto").unwrap().len(), 1);
}

#[test]
fn abandon_fails_only_suspended_runs() {
    let harness = Harness::standard();
    harness.start("acme-ab", MISSING_FIELD_CSV);
    let run = harness
        .orchestrator
        .abandon("acme-ab", "partner withdrew")
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.failure_reason.as_deref(),
        Some("abandoned: partner withdrew")
    );
    assert!(!harness.paths("acme-ab").resume_state_path().exists());
    let events = harness.events("acme-ab");
    assert_eq!(events.last().map(|event| event.kind), Some(AuditKind::Abandoned));

    harness.start("acme-done", CLEAN_CSV);
    let err = harness.orchestrator.abandon("acme-done", "why").unwrap_err();
    assert!(matches!(violation(&err), IntakeError::NotSuspended { .. }));
}

#[test]
fn stale_suspensions_expire() {
    let harness = Harness::with_config(IntakeConfig {
        suspension_ttl_secs: Some(60),
        ..IntakeConfig::default()
    });
    harness.start("acme-old", MISSING_FIELD_CSV);
    harness.start("acme-ok", CLEAN_CSV);
    assert!(harness.orchestrator.expire_stale().unwrap().is_empty());

    harness.clock.advance_ms(61_000);
    assert_eq!(
        harness.orchestrator.expire_stale().unwrap(),
        vec!["acme-old".to_string()]
    );
    let run = load_run(harness.root(), "acme-old").unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        load_run(harness.root(), "acme-ok").unwrap().status,
        RunStatus::Completed
    );
}

#[test]
fn unreadable_run_does_not_stop_the_expiry_sweep() {
    let harness = Harness::with_config(IntakeConfig {
        suspension_ttl_secs: Some(60),
        ..IntakeConfig::default()
    });
    harness.start("acme-a", MISSING_FIELD_CSV);
    harness.start("acme-z", MISSING_FIELD_CSV);
    fs::write(harness.paths("acme-a").run_path(), "{ not json").unwrap();

    harness.clock.advance_ms(61_000);
    assert_eq!(
        harness.orchestrator.expire_stale().unwrap(),
        vec!["acme-z".to_string()]
    );
}

#[test]
fn held_lock_reports_busy_and_leaves_run_untouched() {
    let harness = Harness::standard();
    harness.start("acme-busy", MISSING_FIELD_CSV);
    let paths = harness.paths("acme-busy");
    let lock = RunLock::acquire(&paths, "acme-busy").unwrap();

    let err = harness
        .decide("acme-busy", ApprovalDecision::Approved)
        .unwrap_err();
    assert!(matches!(violation(&err), IntakeError::RunBusy { .. }));
    assert_eq!(
        load_run(harness.root(), "acme-busy").unwrap().status,
        RunStatus::SuspendedForApproval
    );
    drop(lock);
    harness.decide("acme-busy", ApprovalDecision::Approved).unwrap();
}

#[test]
fn concurrent_resumes_run_once() {
    let harness = Harness::standard();
    harness.start("acme-race", MISSING_FIELD_CSV);
    harness.decide("acme-race", ApprovalDecision::Approved).unwrap();
    let input = harness.write_input("fixed.csv", CLEAN_CSV);

    let orchestrator = Arc::new(harness.orchestrator.clone());
    let handles = (0..4)
        .map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            let input = input.clone();
            thread::spawn(move || orchestrator.resume("acme-race", &input))
        })
        .collect::<Vec<_>>();
    let outcomes = handles
        .into_iter()
        .map(|handle| handle.join().expect("resume thread"))
        .collect::<Vec<_>>();

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    for err in outcomes.iter().filter_map(|outcome| outcome.as_ref().err()) {
        assert!(matches!(
            violation(err),
            IntakeError::RunBusy { .. } | IntakeError::NotResumable { .. }
        ));
    }
    let run = load_run(harness.root(), "acme-race").unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.resume_attempt_count, 1);
    let resumed = harness
        .events("acme-race")
        .into_iter()
        .filter(|event| event.kind == AuditKind::Resumed)
        .count();
    assert_eq!(resumed, 1);
}

#[test]
fn listed_runs_are_sorted() {
    let harness = Harness::standard();
    harness.start("b-run", CLEAN_CSV);
    harness.start("a-run", CLEAN_CSV);
    assert_eq!(
        list_runs(harness.orchestrator.context()).unwrap(),
        vec!["a-run".to_string(), "b-run".to_string()]
    );
}

#[test]
fn history_reports_trail_approvals_and_shares() {
    let harness = Harness::standard();
    harness.start("acme-hist", MISSING_FIELD_CSV);
    harness
        .decide("acme-hist", ApprovalDecision::Approved)
        .unwrap();

    let history = harness.orchestrator.history("acme-hist").unwrap();
    assert_eq!(history.manifest.status, RunStatus::SuspendedForCorrection);
    assert_eq!(
        history.status_trail.last(),
        Some(&RunStatus::SuspendedForCorrection)
    );
    assert_eq!(history.approvals.len(), 1);
    assert_eq!(history.approvals[0].reviewer, "dana");
    assert_eq!(history.shares.len(), 1);
}

#[test]
fn interrupted_approval_reuses_the_issued_share() {
    let harness = Harness::standard();
    let run = harness.start("acme-crash", MISSING_FIELD_CSV);
    let paths = harness.paths("acme-crash");
    let record = approval::ApprovalRecord {
        schema_version: approval::APPROVAL_SCHEMA_VERSION,
        run_id: "acme-crash".to_string(),
        encounter: run.approval_encounters,
        attempt: 0,
        reviewer: "dana".to_string(),
        decision: ApprovalDecision::Approved,
        comment: None,
        decided_at_epoch_ms: 1,
    };
    // Decision and share written, run record never advanced.
    approval::record_decision(&paths, &record).unwrap();
    let limits = crate::share::ShareLimits {
        ttl_secs: 60,
        max_access: 1,
    };
    let issued = crate::share::issue_share(harness.root(), &run, &record, limits, 1).unwrap();

    let resumed = harness
        .decide("acme-crash", ApprovalDecision::Approved)
        .unwrap();
    assert_eq!(resumed.status, RunStatus::SuspendedForCorrection);
    assert_eq!(
        shares_for_run(harness.root(), "acme-crash").unwrap(),
        vec![issued]
    );
}
