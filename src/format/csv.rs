//! CSV output formatter

use ::csv::Writer;

use super::ReportFormatter;
use crate::database::ListingEntry;
use crate::scan::ScanReport;
use crate::DisassemblyError;

fn csv_error(e: impl std::fmt::Display) -> DisassemblyError {
    DisassemblyError::Generic(format!("CSV serialization error: {}", e))
}

impl ReportFormatter for super::CsvFormatter {
    fn format(&self, report: &ScanReport, listing: &[ListingEntry]) -> Result<String, DisassemblyError> {
        let mut wtr = Writer::from_writer(Vec::new());
        let scan_start = format!("0x{:x}", report.start);

        wtr.write_record(["scan_start", "address", "kind", "length", "text", "comment"])
            .map_err(csv_error)?;

        for entry in listing {
            let address = format!("0x{:x}", entry.address);
            let kind = entry.kind.map(|k| k.to_string()).unwrap_or_default();
            let length = entry.length.to_string();
            wtr.write_record([
                scan_start.as_str(),
                address.as_str(),
                kind.as_str(),
                length.as_str(),
                entry.text.as_deref().unwrap_or(""),
                entry.comment.as_deref().unwrap_or(""),
            ])
            .map_err(csv_error)?;
        }

        let bytes = wtr.into_inner().map_err(csv_error)?;
        String::from_utf8(bytes).map_err(csv_error)
    }
}
