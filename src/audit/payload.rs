//! The restricted payload schema for audit events.
//!
//! Builders pull only whitelisted counters and well-formed hashes out of tool
//! data. Anything else a tool produced, rows and field values included, has no
//! slot to land in.
use crate::approval::ApprovalDecision;
use crate::tool::{ToolKind, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const NOTE_MAX_CHARS: usize = 120;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CountKey {
    RowCount,
    ErrorCount,
    WarningCount,
    RecordCount,
    BlockerCount,
    ViolationCount,
}

impl CountKey {
    /// Tool data key each counter is read from.
    fn source_key(&self) -> Option<&'static str> {
        match self {
            CountKey::RowCount => Some("row_count"),
            CountKey::ErrorCount => Some("error_count"),
            CountKey::WarningCount => Some("warning_count"),
            CountKey::RecordCount => Some("record_count"),
            CountKey::ViolationCount => Some("total_violations"),
            CountKey::BlockerCount => None,
        }
    }

    const FROM_DATA: [CountKey; 5] = [
        CountKey::RowCount,
        CountKey::ErrorCount,
        CountKey::WarningCount,
        CountKey::RecordCount,
        CountKey::ViolationCount,
    ];
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HashKey {
    FileHash,
    OutputHash,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct SanitizedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counts: BTreeMap<CountKey, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hashes: BTreeMap<HashKey, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SanitizedPayload {
    pub fn for_tool(tool: ToolKind) -> Self {
        Self {
            tool: Some(tool),
            ..Self::default()
        }
    }

    /// Metadata for `step_end`: outcome, whitelisted counts, and hashes.
    pub fn for_step_end(tool: ToolKind, result: &ToolResult, output_hash: &str) -> Self {
        let mut payload = Self::for_tool(tool);
        payload.ok = Some(result.ok);
        payload.counts = extract_counts(&result.data);
        payload
            .counts
            .insert(CountKey::BlockerCount, result.blockers.len() as u64);
        if let Some(hash) = result.data.get("file_hash").and_then(Value::as_str) {
            payload = payload.with_hash(HashKey::FileHash, hash);
        }
        payload.with_hash(HashKey::OutputHash, output_hash)
    }

    pub fn with_count(mut self, key: CountKey, value: u64) -> Self {
        self.counts.insert(key, value);
        self
    }

    /// Record a hash only if it is a SHA-256 lowercase hex digest.
    pub fn with_hash(mut self, key: HashKey, value: &str) -> Self {
        if is_sha256_hex(value) {
            self.hashes.insert(key, value.to_string());
        }
        self
    }

    pub fn with_decision(mut self, decision: ApprovalDecision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_note(mut self, note: &str) -> Self {
        let note = sanitize_note(note);
        self.note = (!note.is_empty()).then_some(note);
        self
    }
}

fn extract_counts(data: &Map<String, Value>) -> BTreeMap<CountKey, u64> {
    CountKey::FROM_DATA
        .into_iter()
        .filter_map(|key| {
            let source = key.source_key()?;
            data.get(source).and_then(Value::as_u64).map(|n| (key, n))
        })
        .collect()
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Strip control characters and cap the note length.
pub fn sanitize_note(note: &str) -> String {
    note.chars()
        .filter(|ch| !ch.is_control())
        .take(NOTE_MAX_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}
