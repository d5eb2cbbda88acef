//! End-to-end runs through the `intake` binary.
//!
//! Each test drives one operator story against a scratch runs root and checks
//! the evidence bundle, which is the only record an operator is promised.

mod common;

use common::{assert_success, Workspace, CLEAN_CSV, MISSING_FIELD_CSV};
use std::fs;

fn event_kinds(events: &[serde_json::Value]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| event["kind"].as_str().map(str::to_string))
        .collect()
}

#[test]
fn clean_file_completes_with_full_evidence() {
    let ws = Workspace::new();
    let input = ws.write_input("acme.csv", CLEAN_CSV);
    let out = ws.start("acme-Q1", &input);
    assert_success(&out);
    assert!(out.stdout.contains("run acme-Q1: completed"), "{}", out.stdout);

    let dir = ws.run_dir("acme-Q1");
    for name in [
        "manifest.json",
        "plan.md",
        "tool_calls.jsonl",
        "summary.md",
        "run.json",
        "outputs/canonical.csv",
        "outputs/validation_report.csv",
    ] {
        assert!(dir.join(name).is_file(), "missing {name}");
    }
    assert!(!dir.join("resume_state.json").exists());

    let manifest = ws.manifest("acme-Q1");
    assert_eq!(manifest["status"], "completed");
    assert_eq!(manifest["data_classification"], "Internal");
    assert_eq!(manifest["pii_handling"], "redacted");
    assert_eq!(manifest["resume_available"], false);
    assert!(manifest["approval_status"].is_null());

    let log = fs::read_to_string(dir.join("tool_calls.jsonl")).unwrap();
    assert!(!log.contains("Lovelace"), "row contents leaked into audit log");
    let kinds = event_kinds(&ws.audit_events("acme-Q1"));
    assert_eq!(kinds.first().map(String::as_str), Some("run_started"));
    assert_eq!(kinds.last().map(String::as_str), Some("run_completed"));

    let canonical = fs::read_to_string(dir.join("outputs/canonical.csv")).unwrap();
    assert!(canonical.starts_with("participant_id,"));
    assert!(canonical.contains("P000001"));
}

#[test]
fn run_id_defaults_from_partner_and_period() {
    let ws = Workspace::new();
    let input = ws.write_input("acme.csv", CLEAN_CSV);
    let out = ws.intake(&[
        "run",
        "intake",
        "--partner",
        "acme",
        "--period",
        "Q2",
        "--input",
        input.to_str().unwrap(),
    ]);
    assert_success(&out);
    assert_eq!(ws.manifest("acme-Q2-deterministic")["status"], "completed");
}

#[test]
fn approved_correction_arrives_through_the_drop_folder() {
    let ws = Workspace::new();
    let input = ws.write_input("acme.csv", MISSING_FIELD_CSV);
    assert_success(&ws.start("acme-Q1", &input));
    let manifest = ws.manifest("acme-Q1");
    assert_eq!(manifest["status"], "suspended_for_approval");
    assert_eq!(manifest["approval_status"], "pending");
    let dir = ws.run_dir("acme-Q1");
    assert!(dir.join("resume_state.json").is_file());
    assert!(dir.join("approval_request.json").is_file());
    let summary = fs::read_to_string(dir.join("summary.md")).unwrap();
    assert!(summary.contains("Suspended for approval"));

    assert_success(&ws.decide("acme-Q1", "approved"));
    let manifest = ws.manifest("acme-Q1");
    assert_eq!(manifest["status"], "suspended_for_correction");
    assert_eq!(manifest["resume_available"], true);
    let status = ws.intake(&["status", "--run-id", "acme-Q1"]);
    assert_success(&status);
    assert!(status.stdout.contains("awaiting corrected file"), "{}", status.stdout);
    assert!(status.stdout.contains("approval 1: approved by dana"), "{}", status.stdout);
    let shared = ws
        .root()
        .join("shares/partner/acme-Q1/partner_error_report.csv");
    let report = fs::read_to_string(&shared).unwrap();
    assert!(report.contains("Required field last_name is empty"));

    ws.upload("acme-Q1", "fixed.csv", CLEAN_CSV);
    assert_success(&ws.intake(&["watch", "--once", "--poll"]));
    let manifest = ws.manifest("acme-Q1");
    assert_eq!(manifest["status"], "completed");
    assert_eq!(manifest["resume_attempt_count"], 1);
    assert!(!dir.join("resume_state.json").exists());
    assert!(dir.join("archive").is_dir());

    let kinds = event_kinds(&ws.audit_events("acme-Q1"));
    for expected in [
        "approval_requested",
        "approval_resolved",
        "share_issued",
        "suspended",
        "resumed",
        "run_completed",
    ] {
        assert!(kinds.iter().any(|kind| kind == expected), "no {expected} event");
    }
}

#[test]
fn rejected_run_cannot_resume() {
    let ws = Workspace::new();
    let input = ws.write_input("acme.csv", MISSING_FIELD_CSV);
    assert_success(&ws.start("acme-Q1", &input));
    assert_success(&ws.decide("acme-Q1", "rejected"));
    let manifest = ws.manifest("acme-Q1");
    assert_eq!(manifest["status"], "rejected");
    assert_eq!(manifest["approval_status"], "rejected");
    assert!(!ws.root().join("shares/partner/acme-Q1").exists());
    let summary = fs::read_to_string(ws.run_dir("acme-Q1").join("summary.md")).unwrap();
    assert!(summary.contains("rejected by dana: reviewed"));

    let fixed = ws.write_input("fixed.csv", CLEAN_CSV);
    let out = ws.resume("acme-Q1", &fixed);
    assert_eq!(out.code, Some(2), "{}", out.stderr);
    assert!(out.stderr.contains("cannot be resumed"), "{}", out.stderr);
    assert_eq!(ws.manifest("acme-Q1")["status"], "rejected");
}

#[test]
fn second_broken_file_returns_to_the_gate() {
    let ws = Workspace::new();
    let input = ws.write_input("acme.csv", MISSING_FIELD_CSV);
    assert_success(&ws.start("acme-Q1", &input));
    assert_success(&ws.decide("acme-Q1", "approved"));

    let retry = ws.write_input("retry.csv", MISSING_FIELD_CSV);
    assert_success(&ws.resume("acme-Q1", &retry));
    let manifest = ws.manifest("acme-Q1");
    assert_eq!(manifest["status"], "suspended_for_approval");
    assert_eq!(manifest["resume_attempt_count"], 1);

    assert_success(&ws.decide("acme-Q1", "approved"));
    let fixed = ws.write_input("fixed.csv", CLEAN_CSV);
    assert_success(&ws.resume("acme-Q1", &fixed));
    let manifest = ws.manifest("acme-Q1");
    assert_eq!(manifest["status"], "completed");
    assert_eq!(manifest["resume_attempt_count"], 2);
    let approvals = fs::read_dir(ws.run_dir("acme-Q1").join("approvals"))
        .unwrap()
        .count();
    assert_eq!(approvals, 2);
}

#[test]
fn protocol_violations_exit_with_two() {
    let ws = Workspace::new();
    let input = ws.write_input("acme.csv", CLEAN_CSV);
    assert_success(&ws.start("acme-Q1", &input));

    let duplicate = ws.start("acme-Q1", &input);
    assert_eq!(duplicate.code, Some(2), "{}", duplicate.stderr);
    let unknown = ws.intake(&[
        "run",
        "payroll",
        "--run-id",
        "acme-Q9",
        "--input",
        input.to_str().unwrap(),
    ]);
    assert_eq!(unknown.code, Some(2), "{}", unknown.stderr);
    let decide = ws.decide("acme-Q1", "approved");
    assert_eq!(decide.code, Some(2), "{}", decide.stderr);
}

#[test]
fn share_token_redeems_until_expiry_or_limit() {
    let ws = Workspace::new();
    fs::create_dir_all(ws.root()).unwrap();
    fs::write(
        ws.root().join("intake.json"),
        r#"{"schema_version": 1, "share_max_access": 1}"#,
    )
    .unwrap();
    let input = ws.write_input("acme.csv", MISSING_FIELD_CSV);
    assert_success(&ws.start("acme-Q1", &input));
    assert_success(&ws.decide("acme-Q1", "approved"));

    let tokens = fs::read_dir(ws.root().join("shares/tokens"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect::<Vec<_>>();
    assert_eq!(tokens.len(), 1);
    let token = tokens[0].file_stem().unwrap().to_str().unwrap().to_string();

    let first = ws.intake(&["share", "--token", &token]);
    assert_success(&first);
    assert!(first.stdout.trim_end().ends_with("partner_error_report.csv"));
    let second = ws.intake(&["share", "--token", &token]);
    assert_eq!(second.code, Some(2), "{}", second.stderr);
}

#[test]
fn abandon_cancels_a_suspended_run() {
    let ws = Workspace::new();
    let input = ws.write_input("acme.csv", MISSING_FIELD_CSV);
    assert_success(&ws.start("acme-Q1", &input));
    assert_success(&ws.intake(&[
        "abandon",
        "--run-id",
        "acme-Q1",
        "--reason",
        "partner withdrew",
    ]));
    let manifest = ws.manifest("acme-Q1");
    assert_eq!(manifest["status"], "failed");
    let kinds = event_kinds(&ws.audit_events("acme-Q1"));
    assert_eq!(kinds.last().map(String::as_str), Some("abandoned"));

    let status = ws.intake(&["status", "--run-id", "acme-Q1", "--json"]);
    assert_success(&status);
    let json: serde_json::Value = serde_json::from_str(&status.stdout).unwrap();
    assert_eq!(json["status"], "failed");
}

#[test]
fn initial_upload_starts_a_run_from_the_watch_loop() {
    let ws = Workspace::new();
    let period = ws.root().join("incoming/acme/Q2");
    fs::create_dir_all(&period).unwrap();
    fs::write(period.join("partner.csv"), CLEAN_CSV).unwrap();

    assert_success(&ws.intake(&["watch", "--once", "--poll"]));
    let manifest = ws.manifest("acme-Q2-deterministic");
    assert_eq!(manifest["status"], "completed");

    // The same drop on a later pass names a run that already exists.
    assert_success(&ws.intake(&["watch", "--once", "--poll"]));
    let kinds = event_kinds(&ws.audit_events("acme-Q2-deterministic"));
    assert_eq!(kinds.iter().filter(|kind| *kind == "run_started").count(), 1);
}
