//! Text rendering of run outcomes for the CLI.

use std::fmt::Write;

use crate::events::Event;
use crate::results::ResultsRecord;
use crate::Result;

pub const RETRY_MESSAGE: &str =
    "There was an error running the test. Check your internet connection and try again.";

/// Two-column table of a record's metrics, or the retry message for an
/// invalid record.
pub fn render_table(record: &ResultsRecord) -> String {
    if !record.is_valid() {
        return render_failure(record.failure().unwrap_or("unknown failure"));
    }

    let width = record
        .metrics()
        .keys()
        .map(|k| k.len())
        .max()
        .unwrap_or(0)
        .max("metric".len());

    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  value", "metric", width = width);
    let _ = writeln!(out, "{}", "-".repeat(width + 8));
    for (name, value) in record.metrics() {
        let _ = writeln!(out, "{:<width$}  {}", name, value, width = width);
    }
    let _ = writeln!(
        out,
        "recorded {} ({})",
        record.recorded_at().format("%Y-%m-%d %H:%M:%S UTC"),
        record.id().short()
    );
    out
}

pub fn render_failure(reason: &str) -> String {
    format!("{}\n  reason: {}\n", RETRY_MESSAGE, reason)
}

pub fn render_json(record: &ResultsRecord) -> Result<String> {
    Ok(serde_json::to_string_pretty(record)?)
}

/// One-line description of a bus event.
pub fn describe(event: &Event) -> String {
    match event {
        Event::PhaseChanged { from, to } => format!("phase: {} -> {}", from, to),
        Event::TestCompleted(record) => format!("test completed ({})", record.id().short()),
        Event::TestFailed { reason } => format!("test failed: {}", reason),
        Event::ReportRouter(receipt) => format!(
            "results uploaded (set {}, result {})",
            receipt.set_id, receipt.result_id
        ),
    }
}
