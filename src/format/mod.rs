//! Output formats for scan reports and the resulting database listing

mod csv;
mod json;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::database::ListingEntry;
use crate::scan::ScanReport;
use crate::DisassemblyError;

/// Supported output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output (default)
    Text,
    /// JSON format (hierarchical)
    Json,
    /// JSON Lines format (one JSON object per line)
    JsonLines,
    /// CSV format (listing only)
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for scan output
pub trait ReportFormatter {
    /// Render a report together with the listing entries it produced
    fn format(&self, report: &ScanReport, listing: &[ListingEntry]) -> Result<String, DisassemblyError>;
}

/// Format output in plain text
pub struct TextFormatter;

/// Format output in JSON
pub struct JsonFormatter;

/// Format output in JSON Lines
pub struct JsonLinesFormatter;

/// Format the listing in CSV
pub struct CsvFormatter;

impl ReportFormatter for TextFormatter {
    fn format(&self, report: &ScanReport, listing: &[ListingEntry]) -> Result<String, DisassemblyError> {
        let mut output = String::new();

        output.push_str(&format!(
            "Scan at 0x{:x} ({} mode, limit 0x{:x}): {} at 0x{:x}\n",
            report.start, report.mode, report.limit, report.reason, report.end
        ));
        output.push_str(&format!("{}\n\n", report.status_line()));

        for entry in listing {
            let body = match (&entry.text, &entry.comment) {
                (Some(text), Some(comment)) => format!("{:<40} ; {}", text, comment),
                (Some(text), None) => text.clone(),
                (None, Some(comment)) => format!("{:<40} ; {}", "", comment),
                (None, None) => String::new(),
            };
            let kind = entry.kind.map(|k| k.to_string()).unwrap_or_else(|| "-".to_string());
            output.push_str(&format!(
                "0x{:08x}: {:<11} {:>2}  {}\n",
                entry.address,
                kind,
                entry.length,
                body.trim_end()
            ));
        }

        Ok(output)
    }
}
