//! Output formatting for CLI commands.

use serde::{Deserialize, Serialize};

use crate::cli::args::{OutputFormat, PilumArgs};
use crate::error::Result;
use crate::segment::FlushReport;

/// Result of an ingest run.
#[derive(Debug, Serialize)]
pub struct IngestResult {
    pub collection_id: u64,
    pub partition_id: u64,
    pub rows_inserted: usize,
    pub rows_deleted: usize,
    pub segments_flushed: usize,
    pub bytes_written: u64,
    pub duration_ms: u64,
    pub segments: Vec<FlushReport>,
}

/// Header and leading rows of a segment file.
#[derive(Debug, Serialize, Deserialize)]
pub struct SegmentInspection {
    pub file_name: String,
    pub file_size: u64,
    pub segment_id: u64,
    pub dimension: u32,
    pub row_count: u64,
    pub created_at: String,
    pub rows: Vec<RowSummary>,
}

/// One row as shown by `inspect`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RowSummary {
    pub id: u64,
    pub head: Vec<f32>,
    pub attributes: usize,
}

/// Summary of one collection in the manifest.
#[derive(Debug, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub collection_id: u64,
    pub name: String,
    pub version: u64,
    pub partitions: usize,
    pub segments: usize,
    pub segment_files: usize,
    pub rows: u64,
    pub size: u64,
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize>(message: &str, result: &T, args: &PilumArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output in human-readable format.
fn output_human<T: Serialize>(message: &str, result: &T, args: &PilumArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!();
    }

    let value = serde_json::to_value(result)?;
    match &value {
        serde_json::Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    println!();
                }
                print_object(item, 0);
            }
        }
        _ => print_object(&value, 0),
    }
    Ok(())
}

fn print_object(value: &serde_json::Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                match val {
                    serde_json::Value::Array(items)
                        if items.iter().any(serde_json::Value::is_object) =>
                    {
                        println!("{pad}{key}:");
                        for item in items {
                            print_object(item, indent + 1);
                            println!();
                        }
                    }
                    serde_json::Value::Object(_) => {
                        println!("{pad}{key}:");
                        print_object(val, indent + 1);
                    }
                    _ => println!("{pad}{key}: {}", format_field(key, val)),
                }
            }
        }
        _ => println!("{pad}{}", format_value(value)),
    }
}

/// Output in JSON format.
fn output_json<T: Serialize>(result: &T, args: &PilumArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };

    println!("{json}");
    Ok(())
}

/// Byte counts are shown with units, everything else as is.
fn format_field(key: &str, value: &serde_json::Value) -> String {
    let is_bytes = key == "size" || key.ends_with("_size") || key.starts_with("bytes_");
    match value.as_u64() {
        Some(bytes) if is_bytes => format_bytes(bytes),
        _ => format_value(value),
    }
}

/// Format a JSON value for display.
fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(arr) => {
            let formatted_values = arr.iter().map(format_value).collect::<Vec<_>>().join(", ");
            format!("[{formatted_values}]")
        }
        serde_json::Value::Object(_) => "[object]".to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

/// Format bytes into human-readable format.
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    let unit = UNITS[unit_index];
    if unit_index == 0 {
        format!("{bytes} {unit}")
    } else {
        format!("{size:.1} {unit}")
    }
}
