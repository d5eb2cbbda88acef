//! Tool protocol: the uniform contract every plan step is invoked through.
//!
//! Tool names form a closed set ([`ToolKind`]). The [`ToolRegistry`] maps each
//! kind to an implementation once at startup, and plans resolve names against
//! it so an unknown tool is rejected before a run starts rather than midway.
use crate::error::IntakeError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

mod canonicalize;
mod ingest;
mod validate;

pub use canonicalize::CanonicalizeTool;
pub use ingest::IngestTool;
pub use validate::{ValidateTool, DEFAULT_REQUIRED_FIELDS};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Ingest,
    Validate,
    Canonicalize,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [ToolKind::Ingest, ToolKind::Validate, ToolKind::Canonicalize];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Ingest => "ingest",
            ToolKind::Validate => "validate",
            ToolKind::Canonicalize => "canonicalize",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, IntakeError> {
        ToolKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| IntakeError::UnknownTool {
                name: name.to_string(),
            })
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of one invocation.
///
/// `blockers` carry business-rule failures; they are ordinary values, never
/// errors. `data` is opaque to the orchestrator beyond forwarding it.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct ToolResult {
    pub ok: bool,
    pub summary: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
}

impl ToolResult {
    pub fn success(summary: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            ok: true,
            summary: summary.into(),
            data,
            warnings: Vec::new(),
            blockers: Vec::new(),
        }
    }

    pub fn blocked(summary: impl Into<String>, blockers: Vec<String>) -> Self {
        Self {
            ok: false,
            summary: summary.into(),
            data: Map::new(),
            warnings: Vec::new(),
            blockers,
        }
    }

    /// Reject results whose success flag disagrees with their blockers.
    pub fn check_shape(&self, tool: ToolKind) -> Result<(), IntakeError> {
        let reason = match (self.ok, self.blockers.is_empty()) {
            (false, true) => "ok=false without blockers",
            (true, false) => "ok=true with blockers",
            _ if self.summary.trim().is_empty() => "empty summary",
            _ => return Ok(()),
        };
        Err(IntakeError::MalformedToolOutput {
            tool: tool.to_string(),
            reason: reason.to_string(),
        })
    }
}

/// Arguments for one invocation plus the previous step's `data`.
#[derive(Debug, Clone, Default)]
pub struct ToolInput {
    pub args: Map<String, Value>,
    pub upstream: Map<String, Value>,
}

impl ToolInput {
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

/// A structured artifact a tool wants materialized under `outputs/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub trait Tool: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// Run the tool. `Err` means an infrastructure fault, not a business failure.
    fn invoke(&self, input: &ToolInput) -> Result<ToolResult>;

    /// Render structured outputs from this tool's persisted `data`.
    fn artifacts(&self, _data: &Map<String, Value>) -> Vec<OutputArtifact> {
        Vec::new()
    }
}

/// Static map from tool kind to implementation, built once at startup.
pub struct ToolRegistry {
    tools: BTreeMap<ToolKind, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Registry with the reference intake tools.
    pub fn standard() -> Self {
        Self::empty()
            .with_tool(Box::new(IngestTool))
            .with_tool(Box::new(ValidateTool))
            .with_tool(Box::new(CanonicalizeTool))
    }

    pub fn with_tool(mut self, tool: Box<dyn Tool>) -> Self {
        self.tools.insert(tool.kind(), tool);
        self
    }

    /// Resolve a declared tool name, rejecting names with no registration.
    pub fn resolve(&self, name: &str) -> Result<ToolKind, IntakeError> {
        let kind = ToolKind::from_name(name)?;
        if self.tools.contains_key(&kind) {
            Ok(kind)
        } else {
            Err(IntakeError::UnknownTool {
                name: name.to_string(),
            })
        }
    }

    pub fn get(&self, kind: ToolKind) -> Result<&dyn Tool, IntakeError> {
        self.tools
            .get(&kind)
            .map(|tool| tool.as_ref())
            .ok_or_else(|| IntakeError::UnknownTool {
                name: kind.to_string(),
            })
    }

    /// Invoke by name: the protocol's `invoke(name, args)` entry point.
    pub fn invoke(&self, name: &str, input: &ToolInput) -> Result<ToolResult> {
        let kind = self.resolve(name)?;
        self.get(kind)?.invoke(input)
    }
}

pub(crate) fn count_value(count: usize) -> Value {
    Value::from(count as u64)
}

/// Staged rows handed over by the previous step.
pub(crate) fn upstream_rows(upstream: &Map<String, Value>) -> Result<&[Value]> {
    upstream
        .get("rows")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| anyhow::anyhow!("upstream step produced no `rows`"))
}

/// One CSV record with minimal quoting, newline-terminated.
pub(crate) fn csv_line<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut line = fields
        .into_iter()
        .map(|field| {
            if field.contains([',', '"', '\n', '\r']) {
                format!("\"{}\"", field.replace('"', "\"\""))
            } else {
                field.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}
