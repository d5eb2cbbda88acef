//! Reference canonicalization tool: validated rows into canonical records.
use super::{
    count_value, csv_line, upstream_rows, OutputArtifact, Tool, ToolInput, ToolKind, ToolResult,
};
use anyhow::Result;
use serde_json::{Map, Value};

/// Partner spellings folded onto canonical field names.
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("dob", "date_of_birth"),
    ("birth_date", "date_of_birth"),
    ("address_line_1", "address_1"),
    ("address_line_2", "address_2"),
    ("zip", "zip_code"),
    ("postal_code", "zip_code"),
    ("phone_number", "phone"),
    ("email_address", "email"),
];

pub struct CanonicalizeTool;

impl Tool for CanonicalizeTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Canonicalize
    }

    fn invoke(&self, input: &ToolInput) -> Result<ToolResult> {
        let rows = upstream_rows(&input.upstream)?;
        let staged_columns = input
            .upstream
            .get("columns")
            .and_then(Value::as_array)
            .map(|cols| cols.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();

        let mut columns = vec!["participant_id".to_string()];
        for column in &staged_columns {
            let canonical = canonical_name(column).to_string();
            if !columns.contains(&canonical) {
                columns.push(canonical);
            }
        }

        let records = rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let mut record = Map::new();
                record.insert(
                    "participant_id".to_string(),
                    Value::String(participant_id(idx)),
                );
                for column in &staged_columns {
                    let value = row.get(*column).cloned().unwrap_or(Value::Null);
                    record
                        .entry(canonical_name(column).to_string())
                        .or_insert(value);
                }
                Value::Object(record)
            })
            .collect::<Vec<_>>();

        let mut data = Map::new();
        data.insert("record_count".to_string(), count_value(records.len()));
        data.insert(
            "columns".to_string(),
            Value::Array(columns.into_iter().map(Value::String).collect()),
        );
        let summary = format!("Canonicalized {} records", records.len());
        data.insert("rows".to_string(), Value::Array(records));
        Ok(ToolResult::success(summary, data))
    }

    fn artifacts(&self, data: &Map<String, Value>) -> Vec<OutputArtifact> {
        let columns = data
            .get("columns")
            .and_then(Value::as_array)
            .map(|cols| cols.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();
        let rows = data
            .get("rows")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut out = csv_line(columns.iter().copied());
        for row in rows {
            let cells = columns
                .iter()
                .map(|column| row.get(*column).and_then(Value::as_str).unwrap_or(""));
            out.push_str(&csv_line(cells));
        }
        vec![OutputArtifact {
            name: "canonical.csv".to_string(),
            bytes: out.into_bytes(),
        }]
    }
}

fn canonical_name(field: &str) -> &str {
    FIELD_ALIASES
        .iter()
        .find(|(alias, _)| *alias == field)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(field)
}

/// Stable id by staged row position: `P000001`, `P000002`, ...
fn participant_id(row_index: usize) -> String {
    format!("P{:06}", row_index + 1)
}
