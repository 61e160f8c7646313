//! JSON-lines ingestion of raw occurrences.

use std::io::BufRead;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::occurrence::NewOccurrence;
use crate::storage::SqliteStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    /// Lines that did not parse as an occurrence.
    pub rejected: usize,
}

/// Record one occurrence per non-blank line of `reader`.
///
/// Lines that fail to parse are logged and skipped. A storage failure stops
/// the import; everything recorded before it stays.
pub fn ingest_jsonl<R: BufRead>(store: &SqliteStore, reader: R) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.with_context(|| format!("failed to read line {line_no}"))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let new: NewOccurrence = match serde_json::from_str(line) {
            Ok(o) => o,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed occurrence");
                report.rejected += 1;
                continue;
            }
        };
        store
            .record_occurrence(&new)
            .with_context(|| format!("failed to record occurrence on line {line_no}"))?;
        report.accepted += 1;
    }
    info!(accepted = report.accepted, rejected = report.rejected, "ingest finished");
    Ok(report)
}
