//! Plans: the ordered tool steps a run executes.
//!
//! A plan is produced once when the run starts and stored in `run.json`. Steps
//! are declared by name and resolved against the [`ToolRegistry`] here, so a
//! plan that names an unregistered tool never reaches execution.
use crate::config::IntakeConfig;
use crate::error::IntakeError;
use crate::tool::{ToolKind, ToolRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const INTAKE_WORKFLOW: &str = "intake";

/// Planner mode recorded in default run ids.
pub const DETERMINISTIC_MODE: &str = "deterministic";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PlanStep {
    pub tool: ToolKind,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// The run's current input path is supplied to this step as `input`.
    #[serde(default)]
    pub reads_input: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Resolve declared `(tool name, args, reads_input)` entries into a plan.
    pub fn resolve(
        declared: Vec<(String, Map<String, Value>, bool)>,
        registry: &ToolRegistry,
    ) -> Result<Self, IntakeError> {
        let steps = declared
            .into_iter()
            .map(|(name, args, reads_input)| {
                Ok(PlanStep {
                    tool: registry.resolve(&name)?,
                    args,
                    reads_input,
                })
            })
            .collect::<Result<Vec<_>, IntakeError>>()?;
        Ok(Self { steps })
    }

    /// First step that consumes the run input; a resume re-enters here.
    pub fn first_input_step(&self) -> usize {
        self.steps
            .iter()
            .position(|step| step.reads_input)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Strategy that turns a workflow name into a plan.
pub trait Planner {
    fn plan(
        &self,
        workflow: &str,
        registry: &ToolRegistry,
        config: &IntakeConfig,
    ) -> Result<Plan, IntakeError>;
}

/// Fixed plan per known workflow.
pub struct DeterministicPlanner;

impl Planner for DeterministicPlanner {
    fn plan(
        &self,
        workflow: &str,
        registry: &ToolRegistry,
        config: &IntakeConfig,
    ) -> Result<Plan, IntakeError> {
        if workflow != INTAKE_WORKFLOW {
            return Err(IntakeError::UnknownWorkflow {
                name: workflow.to_string(),
            });
        }
        let mut validate_args = Map::new();
        validate_args.insert(
            "required_fields".to_string(),
            Value::Array(
                config
                    .required_fields
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );
        Plan::resolve(
            vec![
                ("ingest".to_string(), Map::new(), true),
                ("validate".to_string(), validate_args, false),
                ("canonicalize".to_string(), Map::new(), false),
            ],
            registry,
        )
    }
}
