//! Shared test infrastructure for integration tests.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

pub const CLEAN_CSV: &str = "First Name,Last Name,Date of Birth,ZIP Code,State\n\
Ada,Lovelace,12/10/1815,98101,WA\n\
Alan,Turing,06/23/1912,99201,WA\n";

pub const MISSING_FIELD_CSV: &str = "First Name,Last Name,Date of Birth,ZIP Code,State\n\
Ada,Lovelace,12/10/1815,98101,WA\n\
Alan,,06/23/1912,99201,WA\n";

/// Scratch runs root plus an inbox for partner files.
pub struct Workspace {
    pub dir: TempDir,
}

/// Exit status and output of one `intake` invocation.
#[derive(Debug)]
pub struct Invocation {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for Invocation {
    fn from(output: Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("intake")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root().join("runs").join(run_id)
    }

    pub fn write_input(&self, name: &str, contents: &str) -> PathBuf {
        let inbox = self.dir.path().join("inbox");
        fs::create_dir_all(&inbox).expect("create inbox");
        let path = inbox.join(name);
        fs::write(&path, contents).expect("write input");
        path
    }

    /// Drop a corrected file where the partner would.
    pub fn upload(&self, run_id: &str, name: &str, contents: &str) -> PathBuf {
        let dir = self.root().join("uploads").join(run_id);
        assert!(dir.is_dir(), "drop folder missing for {run_id}");
        let path = dir.join(name);
        fs::write(&path, contents).expect("write upload");
        path
    }

    pub fn intake(&self, args: &[&str]) -> Invocation {
        Command::new(env!("CARGO_BIN_EXE_intake"))
            .arg("--root")
            .arg(self.root())
            .args(args)
            .env("RUST_LOG", "intake=debug")
            .output()
            .expect("spawn intake")
            .into()
    }

    pub fn start(&self, run_id: &str, input: &Path) -> Invocation {
        self.intake(&[
            "run",
            "intake",
            "--run-id",
            run_id,
            "--input",
            input.to_str().expect("utf-8 path"),
        ])
    }

    pub fn decide(&self, run_id: &str, decision: &str) -> Invocation {
        self.intake(&[
            "decide",
            "--run-id",
            run_id,
            "--decision",
            decision,
            "--reviewer",
            "dana",
            "--comment",
            "reviewed",
        ])
    }

    pub fn resume(&self, run_id: &str, input: &Path) -> Invocation {
        self.intake(&[
            "resume",
            "--run-id",
            run_id,
            "--input",
            input.to_str().expect("utf-8 path"),
        ])
    }

    pub fn manifest(&self, run_id: &str) -> Value {
        let path = self.run_dir(run_id).join("manifest.json");
        let text = fs::read_to_string(&path).expect("read manifest");
        serde_json::from_str(&text).expect("parse manifest")
    }

    pub fn audit_events(&self, run_id: &str) -> Vec<Value> {
        let path = self.run_dir(run_id).join("tool_calls.jsonl");
        fs::read_to_string(&path)
            .expect("read audit log")
            .lines()
            .map(|line| serde_json::from_str(line).expect("audit line is JSON"))
            .collect()
    }
}

pub fn assert_success(invocation: &Invocation) {
    assert_eq!(
        invocation.code,
        Some(0),
        "stdout:\n{}\nstderr:\n{}",
        invocation.stdout,
        invocation.stderr
    );
}
