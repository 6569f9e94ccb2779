//! Subject backfill from a recovery file.
//!
//! Each line is `{"message_identifier": ..., "subject": ...}`. Only messages
//! whose subject is still NULL are touched, so the command can be re-run.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::db::LeadDb;
use crate::error::PipelineError;
use crate::threading::normalize::normalize_message_id;

#[derive(Debug, Deserialize)]
struct SubjectRecord {
    #[serde(default)]
    message_identifier: Option<String>,
    #[serde(default)]
    subject: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub lines: u64,
    pub updated: u64,
    /// Identifier unknown, or the message already had a subject.
    pub unchanged: u64,
    pub skipped: u64,
}

/// Unfold a header value: runs of CR, LF, TAB and spaces become one space.
pub fn unfold_subject(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn backfill_subjects(
    db: &LeadDb,
    path: &Path,
    batch_size: usize,
) -> Result<BackfillReport, PipelineError> {
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let batch_size = batch_size.max(1);

    let mut report = BackfillReport::default();
    let mut batch: Vec<(String, String)> = Vec::with_capacity(batch_size);
    let mut buf = Vec::new();
    let mut line_no = 0u64;

    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| PipelineError::io(path, e))?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let record = match parse_subject_line(line_no, &buf) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(err) => {
                log::warn!("Skipping subject record: {}", err);
                report.lines += 1;
                report.skipped += 1;
                continue;
            }
        };
        report.lines += 1;

        let identifier = normalize_message_id(record.message_identifier.as_deref());
        let subject = record.subject.as_deref().map(unfold_subject);
        match (identifier, subject) {
            (Some(identifier), Some(subject)) => batch.push((identifier, subject)),
            _ => {
                log::debug!("Line {}: no usable identifier or subject", line_no);
                report.skipped += 1;
            }
        }

        if batch.len() >= batch_size {
            apply_batch(db, &mut batch, &mut report)?;
        }
    }
    if !batch.is_empty() {
        apply_batch(db, &mut batch, &mut report)?;
    }

    log::info!(
        "Subject backfill: {} updated, {} unchanged, {} skipped",
        report.updated,
        report.unchanged,
        report.skipped
    );
    Ok(report)
}

/// Decode one raw line. Blank lines yield `None`.
fn parse_subject_line(line_no: u64, raw: &[u8]) -> Result<Option<SubjectRecord>, PipelineError> {
    let line = std::str::from_utf8(raw)
        .map_err(|source| PipelineError::InvalidEncoding { line: line_no, source })?;
    if line.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|source| PipelineError::RecordParse { line: line_no, source })
}

fn apply_batch(
    db: &LeadDb,
    batch: &mut Vec<(String, String)>,
    report: &mut BackfillReport,
) -> Result<(), PipelineError> {
    let updated = db.with_transaction(|tx| -> Result<u64, PipelineError> {
        let mut updated = 0;
        for (identifier, subject) in batch.iter() {
            if tx.backfill_subject(identifier, subject)? {
                updated += 1;
            }
        }
        Ok(updated)
    })?;
    report.updated += updated;
    report.unchanged += batch.len() as u64 - updated;
    batch.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::{seed_contact, seed_message, test_db};

    #[test]
    fn test_unfold_subject() {
        assert_eq!(unfold_subject("Quote\r\n\tfor March"), "Quote for March");
        assert_eq!(unfold_subject("  plain  "), "plain");
    }

    #[test]
    fn test_backfill_fills_only_missing_subjects() {
        let db = test_db();
        let alice = seed_contact(&db, "alice@example.com");
        let missing = seed_message(&db, alice, Some("<1@x>"), "2024-09-01T08:00:00Z", None, None, Default::default());
        seed_message(&db, alice, Some("<2@x>"), "2024-09-01T09:00:00Z", Some("Kept"), None, Default::default());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subjects.ndjson");
        std::fs::write(
            &path,
            concat!(
                "{\"message_identifier\": \"1@x\", \"subject\": \"Quote\\r\\n for March\"}\n",
                "{\"message_identifier\": \"<2@x>\", \"subject\": \"Overwritten?\"}\n",
                "{\"message_identifier\": \"<9@x>\", \"subject\": \"Unknown\"}\n",
                "garbage\n",
            ),
        )
        .unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(b"{\"message_identifier\": \"<1@x>\", \"subject\": \"\xff\"}\n");
        std::fs::write(&path, bytes).unwrap();

        let report = backfill_subjects(&db, &path, 2).unwrap();
        assert_eq!(report.lines, 5);
        assert_eq!(report.updated, 1);
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.skipped, 2, "garbage and a non-UTF-8 line");

        let (rows, _) = db.load_graph_rows().unwrap();
        let first = rows.iter().find(|r| r.id == missing).unwrap();
        assert_eq!(first.subject.as_deref(), Some("Quote for March"));
        assert_eq!(rows[1].subject.as_deref(), Some("Kept"));
    }
}
