//! Reference ingest tool: delimited partner files into staged rows.
//!
//! Header names are normalized (`First Name` -> `first_name`) so later steps
//! can address fields without knowing the partner's spelling.
use super::{count_value, Tool, ToolInput, ToolKind, ToolResult};
use crate::util::sha256_hex;
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

pub struct IngestTool;

impl Tool for IngestTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Ingest
    }

    fn invoke(&self, input: &ToolInput) -> Result<ToolResult> {
        let path = input
            .arg_str("input")
            .ok_or_else(|| anyhow!("ingest requires an `input` argument"))?;
        let path = Path::new(path);
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        if !matches!(extension.as_deref(), Some("csv" | "txt")) {
            let found = extension.unwrap_or_else(|| "<none>".to_string());
            return Ok(ToolResult::blocked(
                format!("Unsupported file format: {found}"),
                vec![format!("file format {found} not supported, expected CSV")],
            ));
        }
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                return Ok(ToolResult::blocked(
                    format!("Could not read {}", path.display()),
                    vec![format!("input file unreadable: {}", err.kind())],
                ));
            }
        };
        let file_hash = sha256_hex(&bytes);
        let text = String::from_utf8_lossy(&bytes);
        let Some(table) = parse_table(&text) else {
            return Ok(ToolResult::blocked(
                "File has no header row",
                vec!["file has no header row".to_string()],
            ));
        };

        let rows = table
            .rows
            .iter()
            .map(|cells| {
                let mut row = Map::new();
                for (idx, column) in table.columns.iter().enumerate() {
                    let cell = cells.get(idx).map(|cell| cell.trim()).unwrap_or("");
                    row.insert(column.clone(), Value::String(cell.to_string()));
                }
                Value::Object(row)
            })
            .collect::<Vec<_>>();

        let mut data = Map::new();
        data.insert("row_count".to_string(), count_value(rows.len()));
        data.insert(
            "columns".to_string(),
            Value::Array(table.columns.iter().cloned().map(Value::String).collect()),
        );
        data.insert("file_hash".to_string(), Value::String(file_hash));
        data.insert(
            "delimiter".to_string(),
            Value::String(table.delimiter.to_string()),
        );
        let summary = format!("Ingested {} rows", rows.len());
        data.insert("rows".to_string(), Value::Array(rows));
        Ok(ToolResult::success(summary, data))
    }
}

struct Table {
    delimiter: char,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

fn parse_table(text: &str) -> Option<Table> {
    let mut lines = text
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty());
    let header = lines.next()?.trim_start_matches('\u{feff}');
    let delimiter = if header.matches(';').count() > header.matches(',').count() {
        ';'
    } else {
        ','
    };
    let columns = split_record(header, delimiter)
        .iter()
        .map(|name| normalize_header(name))
        .collect::<Vec<_>>();
    if columns.iter().all(String::is_empty) {
        return None;
    }
    let rows = lines.map(|line| split_record(line, delimiter)).collect();
    Some(Table {
        delimiter,
        columns,
        rows,
    })
}

/// Split one record, honoring double-quoted fields and `""` escapes.
fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            c if c == delimiter && !quoted => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Lowercase, trim, and collapse non-alphanumeric runs into `_`.
pub(crate) fn normalize_header(name: &str) -> String {
    let mut out = String::new();
    let mut pending_sep = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}
