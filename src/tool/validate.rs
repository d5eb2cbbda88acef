//! Reference validation tool.
//!
//! Violations never carry field values, only `row_index`, `field`, `severity`,
//! and `message`, so the redacted report can travel anywhere the run's
//! evidence does.
use super::{
    count_value, csv_line, upstream_rows, OutputArtifact, Tool, ToolInput, ToolKind, ToolResult,
};
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const DEFAULT_REQUIRED_FIELDS: [&str; 3] = ["first_name", "last_name", "date_of_birth"];

pub struct ValidateTool;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Violation {
    pub row_index: usize,
    pub field: String,
    pub severity: Severity,
    pub message: String,
}

impl Tool for ValidateTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Validate
    }

    fn invoke(&self, input: &ToolInput) -> Result<ToolResult> {
        let rows = upstream_rows(&input.upstream)?;
        let columns = input
            .upstream
            .get("columns")
            .and_then(Value::as_array)
            .map(|cols| {
                cols.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let required = required_fields(&input.args);

        let violations = rows
            .iter()
            .enumerate()
            .flat_map(|(idx, row)| check_row(idx, row, &columns, &required))
            .collect::<Vec<_>>();
        let error_count = violations
            .iter()
            .filter(|v| v.severity == Severity::Error)
            .count();
        let warning_count = violations.len() - error_count;

        let mut data = Map::new();
        data.insert("error_count".to_string(), count_value(error_count));
        data.insert("warning_count".to_string(), count_value(warning_count));
        data.insert("total_violations".to_string(), count_value(violations.len()));
        data.insert("row_count".to_string(), count_value(rows.len()));
        data.insert("violations".to_string(), serde_json::to_value(&violations)?);
        data.insert("columns".to_string(), columns_value(&columns));
        data.insert("rows".to_string(), Value::Array(rows.to_vec()));

        Ok(ToolResult {
            ok: error_count == 0,
            summary: format!("Validation complete: {error_count} errors, {warning_count} warnings"),
            data,
            warnings: if warning_count > 0 {
                vec![format!("{warning_count} warnings found")]
            } else {
                Vec::new()
            },
            blockers: if error_count > 0 {
                vec![format!("{error_count} errors found")]
            } else {
                Vec::new()
            },
        })
    }

    fn artifacts(&self, data: &Map<String, Value>) -> Vec<OutputArtifact> {
        let violations: Vec<Violation> = data
            .get("violations")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();

        let mut report = csv_line(["row_index", "field", "severity", "message"]);
        for v in &violations {
            let severity = match v.severity {
                Severity::Error => "Error",
                Severity::Warning => "Warning",
            };
            report.push_str(&csv_line([
                v.row_index.to_string().as_str(),
                v.field.as_str(),
                severity,
                v.message.as_str(),
            ]));
        }
        let mut artifacts = vec![OutputArtifact {
            name: "validation_report.csv".to_string(),
            bytes: report.into_bytes(),
        }];

        let mut errors_by_row: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for v in violations.iter().filter(|v| v.severity == Severity::Error) {
            errors_by_row
                .entry(v.row_index)
                .or_default()
                .push(v.message.as_str());
        }
        if !errors_by_row.is_empty() {
            artifacts.push(OutputArtifact {
                name: "partner_error_report.csv".to_string(),
                bytes: partner_error_report(data, &errors_by_row).into_bytes(),
            });
        }
        artifacts
    }
}

/// Full rows with errors plus what to fix, for the partner to correct.
fn partner_error_report(
    data: &Map<String, Value>,
    errors_by_row: &BTreeMap<usize, Vec<&str>>,
) -> String {
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

    let mut header = vec!["row_index"];
    header.extend(columns.iter().copied());
    header.push("errors");
    let mut out = csv_line(header);
    for (row_index, messages) in errors_by_row {
        let row = rows.get(*row_index);
        let mut cells = vec![row_index.to_string()];
        for column in &columns {
            let value = row
                .and_then(|row| row.get(*column))
                .and_then(Value::as_str)
                .unwrap_or("");
            cells.push(value.to_string());
        }
        cells.push(messages.join("; "));
        out.push_str(&csv_line(cells.iter().map(String::as_str)));
    }
    out
}

fn required_fields(args: &Map<String, Value>) -> Vec<String> {
    match args.get("required_fields").and_then(Value::as_array) {
        Some(fields) => fields
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        None => DEFAULT_REQUIRED_FIELDS.iter().map(|f| f.to_string()).collect(),
    }
}

fn columns_value(columns: &[String]) -> Value {
    Value::Array(columns.iter().cloned().map(Value::String).collect())
}

fn cell<'a>(row: &'a Value, field: &str) -> Option<&'a str> {
    row.get(field).and_then(Value::as_str).map(str::trim)
}

fn check_row(idx: usize, row: &Value, columns: &[String], required: &[String]) -> Vec<Violation> {
    let mut out = Vec::new();
    let mut push = |field: &str, severity: Severity, message: String| {
        out.push(Violation {
            row_index: idx,
            field: field.to_string(),
            severity,
            message,
        });
    };

    for field in required {
        if !columns.iter().any(|c| c == field) {
            push(field, Severity::Error, format!("Required field {field} is missing from file"));
        } else if cell(row, field).unwrap_or("").is_empty() {
            push(field, Severity::Error, format!("Required field {field} is empty"));
        }
    }

    if let Some(zip) = cell(row, "zip_code").filter(|zip| !zip.is_empty()) {
        if let Some(message) = zip_format_error(zip) {
            push("zip_code", Severity::Error, message.to_string());
        }
        let state = cell(row, "state").unwrap_or("");
        if state.eq_ignore_ascii_case("WA") && !(zip.starts_with("98") || zip.starts_with("99")) {
            push(
                "zip_code",
                Severity::Warning,
                "Zip code may not match WA state (WA zips typically start with 98 or 99)."
                    .to_string(),
            );
        }
    }

    for column in columns.iter().filter(|c| !required.contains(c)) {
        if cell(row, column).unwrap_or("").is_empty() {
            push(column, Severity::Warning, format!("Optional field {column} is empty"));
        }
    }
    out
}

fn zip_format_error(zip: &str) -> Option<&'static str> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if zip == "00000" || zip == "00000-0000" {
        return Some("Invalid zip code: all zeros");
    }
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"^\d{5}(-\d{4})?$").expect("regex for zip codes"));
    if pattern.is_match(zip) {
        None
    } else {
        Some("Invalid zip code format: must be 5 digits or 5+4 format (e.g., 12345 or 12345-6789).")
    }
}
