//! Fixtures shared by unit tests that drive whole runs.
use crate::approval::ApprovalDecision;
use crate::audit::{AuditEvent, AuditLog, MemoryAuditLog};
use crate::config::IntakeConfig;
use crate::context::{FixedClock, RunContext};
use crate::orchestrator::{DecisionRequest, Orchestrator, StartRequest};
use crate::plan::INTAKE_WORKFLOW;
use crate::run::{Run, RunPaths, RunsRoot};
use crate::tool::ToolRegistry;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const CLEAN_CSV: &str = "first_name,last_name,date_of_birth,zip_code,state\n\
Ada,Lovelace,12/10/1815,98101,WA\n\
Alan,Turing,06/23/1912,99201,WA\n";

pub const MISSING_FIELD_CSV: &str = "first_name,last_name,date_of_birth,zip_code,state\n\
Ada,Lovelace,12/10/1815,98101,WA\n\
Alan,,06/23/1912,99201,WA\n";

/// Still broken after a correction, in a different row than [`MISSING_FIELD_CSV`].
pub const MISSING_FIRST_NAME_CSV: &str = "first_name,last_name,date_of_birth,zip_code,state\n\
,Lovelace,12/10/1815,98101,WA\n\
Alan,Turing,06/23/1912,99201,WA\n";

pub struct Harness {
    pub dir: TempDir,
    pub orchestrator: Orchestrator,
    pub audit: Arc<MemoryAuditLog>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn standard() -> Self {
        Self::build(IntakeConfig::default(), ToolRegistry::standard())
    }

    pub fn with_config(config: IntakeConfig) -> Self {
        Self::build(config, ToolRegistry::standard())
    }

    pub fn with_registry(registry: ToolRegistry) -> Self {
        Self::build(IntakeConfig::default(), registry)
    }

    fn build(config: IntakeConfig, registry: ToolRegistry) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit = Arc::new(MemoryAuditLog::new());
        let clock = Arc::new(FixedClock::at(1_700_000_000_000));
        let ctx = RunContext {
            root: RunsRoot::new(dir.path().join("intake")),
            config,
            audit: audit.clone(),
            clock: clock.clone(),
            registry: Arc::new(registry),
        };
        Self {
            dir,
            orchestrator: Orchestrator::new(ctx),
            audit,
            clock,
        }
    }

    pub fn root(&self) -> &RunsRoot {
        &self.orchestrator.context().root
    }

    pub fn paths(&self, run_id: &str) -> RunPaths {
        self.root().run(run_id)
    }

    pub fn write_input(&self, name: &str, contents: &str) -> PathBuf {
        let dir = self.dir.path().join("inbox");
        fs::create_dir_all(&dir).expect("create inbox");
        let path = dir.join(name);
        fs::write(&path, contents).expect("write input");
        path
    }

    pub fn start(&self, run_id: &str, contents: &str) -> Run {
        let input = self.write_input(&format!("{run_id}.csv"), contents);
        self.orchestrator
            .start(&StartRequest {
                workflow: INTAKE_WORKFLOW.to_string(),
                run_id: run_id.to_string(),
                input,
            })
            .expect("start run")
    }

    pub fn decide(&self, run_id: &str, decision: ApprovalDecision) -> anyhow::Result<Run> {
        self.orchestrator.resolve_approval(
            run_id,
            &DecisionRequest {
                decision,
                reviewer: "dana".to_string(),
                comment: Some("checked".to_string()),
            },
        )
    }

    pub fn resume(&self, run_id: &str, name: &str, contents: &str) -> anyhow::Result<Run> {
        let input = self.write_input(name, contents);
        self.orchestrator.resume(run_id, &input)
    }

    pub fn events(&self, run_id: &str) -> Vec<AuditEvent> {
        self.audit.events(run_id).expect("events")
    }
}
