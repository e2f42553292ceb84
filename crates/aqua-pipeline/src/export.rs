use std::collections::HashMap;

use anyhow::{Context, Result};
use aqua_core::AnalysisRecord;
use chrono::TimeZone;
use csv::{QuoteStyle, Terminator, WriterBuilder};

pub const CSV_HEADER: [&str; 5] = ["Date", "Species", "Location", "Project", "Notes"];

/// Render records as CSV. Fields are written verbatim: embedded commas or
/// newlines are not quoted.
pub fn export_csv<Tz: TimeZone>(
    records: &[AnalysisRecord],
    project_names: &HashMap<String, String>,
    tz: &Tz,
) -> Result<String> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Never)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(CSV_HEADER).context("writing csv header")?;
    for record in records {
        let date = record
            .timestamp
            .with_timezone(tz)
            .date_naive()
            .format("%Y-%m-%d")
            .to_string();
        let project = if record.project_id.is_empty() {
            ""
        } else {
            project_names
                .get(&record.project_id)
                .map(String::as_str)
                .unwrap_or(record.project_id.as_str())
        };
        writer
            .write_record([
                date.as_str(),
                record.species.as_str(),
                record.location.as_deref().unwrap_or_default(),
                project,
                record.notes.as_deref().unwrap_or_default(),
            ])
            .with_context(|| format!("writing csv row for {}", record.id))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flushing csv writer: {e}"))?;
    String::from_utf8(bytes).context("csv output is not utf-8")
}
