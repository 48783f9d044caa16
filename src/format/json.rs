//! JSON and JSON Lines output formatters

use serde::Serialize;
use serde_json::json;

use super::ReportFormatter;
use crate::database::ListingEntry;
use crate::scan::ScanReport;
use crate::DisassemblyError;

/// Serializable scan summary
#[derive(Serialize)]
struct ReportJson {
    /// Start address of the scan
    start: String,
    /// Scan limit (exclusive)
    limit: String,
    /// Cursor after the last step
    end: String,
    /// Decode mode
    mode: String,
    /// Why the scan stopped
    reason: String,
    /// Instructions created as real items
    code: usize,
    /// Instructions attached as comments
    manual: usize,
    /// Steps with no usable result
    undecoded: usize,
}

/// Serializable listing entry
#[derive(Serialize)]
struct EntryJson {
    /// Address of the entry
    address: String,
    /// Item kind, absent for bare comments
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    /// Size of the item in bytes
    length: usize,
    /// Forced display text
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    /// Attached comment
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

/// Serializable scan output for JSON
#[derive(Serialize)]
struct OutputJson {
    report: ReportJson,
    listing: Vec<EntryJson>,
}

fn report_to_json(report: &ScanReport) -> ReportJson {
    ReportJson {
        start: format!("0x{:x}", report.start),
        limit: format!("0x{:x}", report.limit),
        end: format!("0x{:x}", report.end),
        mode: report.mode.to_string(),
        reason: report.reason.to_string(),
        code: report.result.real,
        manual: report.result.annotated,
        undecoded: report.result.undecoded,
    }
}

fn entry_to_json(entry: &ListingEntry) -> EntryJson {
    EntryJson {
        address: format!("0x{:x}", entry.address),
        kind: entry.kind.map(|k| k.to_string()),
        length: entry.length,
        text: entry.text.clone(),
        comment: entry.comment.clone(),
    }
}

fn json_error(e: serde_json::Error) -> DisassemblyError {
    DisassemblyError::Generic(format!("JSON serialization error: {}", e))
}

impl ReportFormatter for super::JsonFormatter {
    fn format(&self, report: &ScanReport, listing: &[ListingEntry]) -> Result<String, DisassemblyError> {
        let output = OutputJson {
            report: report_to_json(report),
            listing: listing.iter().map(entry_to_json).collect(),
        };
        serde_json::to_string_pretty(&output).map_err(json_error)
    }
}

impl ReportFormatter for super::JsonLinesFormatter {
    fn format(&self, report: &ScanReport, listing: &[ListingEntry]) -> Result<String, DisassemblyError> {
        let mut output = String::new();

        let header = json!({ "type": "report", "report": report_to_json(report) });
        output.push_str(&serde_json::to_string(&header).map_err(json_error)?);
        output.push('\n');

        for entry in listing {
            let line = json!({ "type": "entry", "entry": entry_to_json(entry) });
            output.push_str(&serde_json::to_string(&line).map_err(json_error)?);
            output.push('\n');
        }

        Ok(output)
    }
}
