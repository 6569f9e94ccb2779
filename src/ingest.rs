//! Streaming, resumable ingestion of newline-delimited JSON message records.
//!
//! Lines are read one at a time and committed in batches. Each batch commit
//! also writes the source's checkpoint, so a restart skips exactly the lines
//! that were committed. Storing an identifier that already exists is a no-op.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{to_db_timestamp, IngestCheckpoint, LeadDb, MessageMetadata, NewMessage};
use crate::error::PipelineError;

/// One line of the source file.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRecord {
    #[serde(default)]
    pub message_identifier: Option<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub references: Option<References>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub sent_at: Option<String>,
    #[serde(default)]
    pub from_email: Option<String>,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: SourceHeaders,
}

/// `references` as the raw space-separated header or as a pre-split list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum References {
    Header(String),
    List(Vec<String>),
}

impl References {
    pub fn into_vec(self) -> Vec<String> {
        let raw: Vec<String> = match self {
            References::Header(header) => vec![header],
            References::List(list) => list,
        };
        raw.iter()
            .flat_map(|s| s.split_whitespace())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceHeaders {
    #[serde(default)]
    pub list_unsubscribe: Option<String>,
    #[serde(default)]
    pub precedence: Option<String>,
    #[serde(default)]
    pub auto_response_suppress: Option<String>,
    #[serde(default)]
    pub auto_submitted: Option<String>,
}

/// Parse a send time: RFC3339, RFC2822, or `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub fn parse_sent_at(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// A validated record ready to be stored.
struct ParsedRecord {
    sender_email: String,
    sender_name: Option<String>,
    message: NewMessage,
}

/// Decode and parse one raw line. Blank lines yield `None`.
fn parse_raw_line(line_no: u64, raw: &[u8]) -> Result<Option<ParsedRecord>, PipelineError> {
    let line = std::str::from_utf8(raw)
        .map_err(|source| PipelineError::InvalidEncoding { line: line_no, source })?;
    if line.trim().is_empty() {
        return Ok(None);
    }
    parse_line(line_no, line).map(Some)
}

fn parse_line(line_no: u64, line: &str) -> Result<ParsedRecord, PipelineError> {
    let record: SourceRecord = serde_json::from_str(line)
        .map_err(|source| PipelineError::RecordParse { line: line_no, source })?;

    let sender_email = non_empty(record.from_email)
        .map(|e| e.to_lowercase())
        .ok_or(PipelineError::MissingSender { line: line_no })?;

    let raw_sent_at = record.sent_at.unwrap_or_default();
    let sent_at = parse_sent_at(&raw_sent_at).ok_or_else(|| PipelineError::InvalidTimestamp {
        line: line_no,
        value: raw_sent_at.clone(),
    })?;

    let metadata = MessageMetadata {
        in_reply_to: non_empty(record.in_reply_to),
        references: record.references.map(References::into_vec).unwrap_or_default(),
        list_unsubscribe: non_empty(record.headers.list_unsubscribe),
        precedence: non_empty(record.headers.precedence),
        auto_response_suppress: non_empty(record.headers.auto_response_suppress),
        auto_submitted: non_empty(record.headers.auto_submitted),
    };

    Ok(ParsedRecord {
        sender_email,
        sender_name: non_empty(record.from_name),
        message: NewMessage {
            message_identifier: non_empty(record.message_identifier),
            sent_at: to_db_timestamp(&sent_at),
            subject: record.subject,
            body: record.body,
            metadata,
        },
    })
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub source_key: String,
    /// Lines skipped because an earlier run already committed them.
    pub resumed_from: u64,
    /// Lines handled in this run (stored, duplicate, blank or skipped).
    pub lines_processed: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub batches: u64,
    pub stopped_early: bool,
}

#[derive(Default)]
struct BatchOutcome {
    inserted: u64,
    duplicates: u64,
    skipped: u64,
    last_identifier: Option<String>,
}

/// Default checkpoint key for a file: its canonical path.
pub fn source_key_for(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

pub fn ingest_file(
    db: &LeadDb,
    path: &Path,
    source_key: Option<&str>,
    batch_size: usize,
    stop: &AtomicBool,
) -> Result<IngestReport, PipelineError> {
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let key = source_key
        .map(str::to_string)
        .unwrap_or_else(|| source_key_for(path));
    log::info!("Ingesting {} (source key {})", path.display(), key);
    ingest_reader(db, BufReader::new(file), &key, batch_size, stop)
}

/// Ingest from any buffered reader. Only one batch of lines is held at a time.
pub fn ingest_reader<R: BufRead>(
    db: &LeadDb,
    mut reader: R,
    source_key: &str,
    batch_size: usize,
    stop: &AtomicBool,
) -> Result<IngestReport, PipelineError> {
    let mut checkpoint = db.get_checkpoint(source_key)?.unwrap_or_else(|| IngestCheckpoint {
        source_key: source_key.to_string(),
        ..Default::default()
    });
    let mut report = IngestReport {
        source_key: source_key.to_string(),
        resumed_from: checkpoint.processed_count,
        ..Default::default()
    };
    if checkpoint.processed_count > 0 {
        log::info!(
            "Resuming {} after {} committed lines",
            source_key,
            checkpoint.processed_count
        );
    }

    let batch_size = batch_size.max(1);
    let mut batch: Vec<(u64, Vec<u8>)> = Vec::with_capacity(batch_size);
    let mut buf = Vec::new();
    let mut line_no = 0u64;

    // Raw bytes: a line that is not UTF-8 is one bad record, not a broken stream.
    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| PipelineError::io(source_key, e))?;
        if read == 0 {
            break;
        }
        line_no += 1;
        if line_no <= checkpoint.processed_count {
            continue;
        }
        if stop.load(Ordering::SeqCst) {
            report.stopped_early = true;
            break;
        }

        batch.push((line_no, trim_line_ending(&buf).to_vec()));
        if batch.len() >= batch_size {
            commit_batch(db, &mut checkpoint, &mut batch, &mut report)?;
        }
    }

    if !batch.is_empty() {
        commit_batch(db, &mut checkpoint, &mut batch, &mut report)?;
    }

    log::info!(
        "Ingest of {}: {} inserted, {} duplicates, {} skipped in {} batches{}",
        source_key,
        report.inserted,
        report.duplicates,
        report.skipped,
        report.batches,
        if report.stopped_early { " (stopped early)" } else { "" }
    );
    Ok(report)
}

/// Store one batch and advance the checkpoint in the same transaction.
fn commit_batch(
    db: &LeadDb,
    checkpoint: &mut IngestCheckpoint,
    batch: &mut Vec<(u64, Vec<u8>)>,
    report: &mut IngestReport,
) -> Result<(), PipelineError> {
    let lines = batch.len() as u64;
    let outcome = db.with_transaction(|tx| -> Result<BatchOutcome, PipelineError> {
        let mut outcome = BatchOutcome::default();
        for (line_no, raw) in batch.iter() {
            let parsed = match parse_raw_line(*line_no, raw) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => continue,
                Err(e) if e.is_skippable() => {
                    log::warn!("Skipping record: {}", e);
                    outcome.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let contact_id = tx.upsert_contact(&parsed.sender_email, parsed.sender_name.as_deref())?;
            match tx.insert_message_with_thread(contact_id, &parsed.message)? {
                Some(_) => outcome.inserted += 1,
                None => outcome.duplicates += 1,
            }
            if parsed.message.message_identifier.is_some() {
                outcome.last_identifier = parsed.message.message_identifier;
            }
        }

        let next = IngestCheckpoint {
            source_key: checkpoint.source_key.clone(),
            processed_count: checkpoint.processed_count + lines,
            last_message_identifier: outcome
                .last_identifier
                .clone()
                .or_else(|| checkpoint.last_message_identifier.clone()),
            skipped_count: checkpoint.skipped_count + outcome.skipped,
        };
        tx.save_checkpoint(&next)?;
        Ok(outcome)
    })?;

    checkpoint.processed_count += lines;
    checkpoint.skipped_count += outcome.skipped;
    if outcome.last_identifier.is_some() {
        checkpoint.last_message_identifier = outcome.last_identifier;
    }

    report.lines_processed += lines;
    report.inserted += outcome.inserted;
    report.duplicates += outcome.duplicates;
    report.skipped += outcome.skipped;
    report.batches += 1;
    batch.clear();

    log::debug!(
        "Committed batch: {} lines, checkpoint at {}",
        lines,
        checkpoint.processed_count
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use std::io::{Cursor, Read};

    const SOURCE: &str = r#"{"message_identifier": "<1@x>", "sent_at": "2024-09-01T08:00:00+09:00", "from_email": "Alice@Example.com", "from_name": "Alice Tanaka", "subject": "Quote", "body": "¥100,000"}
{"message_identifier": "<2@x>", "in_reply_to": "<1@x>", "references": "<0@x> <1@x>", "sent_at": "Sun, 01 Sep 2024 10:00:00 +0000", "from_email": "bob@example.com", "subject": "Re: Quote"}

not json at all
{"message_identifier": "<3@x>", "sent_at": "yesterday", "from_email": "bob@example.com"}
{"message_identifier": "<4@x>", "sent_at": "2024-09-01 12:00:00"}
{"message_identifier": "<5@x>", "references": ["<1@x>", "<2@x>"], "sent_at": "2024-09-01 12:30:00", "from_email": "bob@example.com", "headers": {"precedence": "bulk"}}
"#;

    fn ingest(db: &LeadDb, input: &str, batch_size: usize) -> IngestReport {
        let stop = AtomicBool::new(false);
        ingest_reader(db, Cursor::new(input.as_bytes()), "test-source", batch_size, &stop).unwrap()
    }

    #[test]
    fn test_ingest_counts_and_skips() {
        let db = test_db();
        let report = ingest(&db, SOURCE, 2);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.skipped, 3, "bad JSON, bad timestamp, missing sender");
        assert_eq!(report.lines_processed, 7);
        assert_eq!(report.batches, 4);

        let counts = db.counts().unwrap();
        assert_eq!(counts.contacts, 2);
        assert_eq!(counts.messages, 3);
        assert_eq!(counts.threads, 3, "every message starts in its own thread");

        let checkpoint = db.get_checkpoint("test-source").unwrap().unwrap();
        assert_eq!(checkpoint.processed_count, 7);
        assert_eq!(checkpoint.skipped_count, 3);
        assert_eq!(checkpoint.last_message_identifier.as_deref(), Some("<5@x>"));
    }

    #[test]
    fn test_ingest_normalizes_fields() {
        let db = test_db();
        ingest(&db, SOURCE, 100);
        let (rows, malformed) = db.load_graph_rows().unwrap();
        assert_eq!(malformed, 0);
        assert_eq!(rows[0].sent_at, "2024-08-31T23:00:00Z", "converted to UTC");
        assert_eq!(rows[1].references, vec!["<0@x>".to_string(), "<1@x>".to_string()]);
        assert_eq!(rows[1].in_reply_to.as_deref(), Some("<1@x>"));
        assert_eq!(rows[2].references.len(), 2);

        let alice = db.upsert_contact("alice@example.com", None).unwrap();
        let contact = db.get_contact(alice).unwrap().unwrap();
        assert_eq!(contact.name.as_deref(), Some("Alice Tanaka"));
    }

    #[test]
    fn test_resume_skips_committed_lines() {
        let db = test_db();
        let first = ingest(&db, SOURCE, 100);
        assert_eq!(first.inserted, 3);

        let mut longer = SOURCE.to_string();
        longer.push_str(
            r#"{"message_identifier": "<6@x>", "sent_at": "2024-09-02T08:00:00Z", "from_email": "alice@example.com"}"#,
        );
        longer.push('\n');
        let second = ingest(&db, &longer, 100);
        assert_eq!(second.resumed_from, 7);
        assert_eq!(second.inserted, 1);
        assert_eq!(second.skipped, 0, "committed lines are not re-parsed");
        assert_eq!(db.counts().unwrap().messages, 4);
    }

    #[test]
    fn test_reingest_without_checkpoint_is_noop() {
        let db = test_db();
        ingest(&db, SOURCE, 100);
        assert!(db.delete_checkpoint("test-source").unwrap());

        let again = ingest(&db, SOURCE, 100);
        assert_eq!(again.inserted, 0);
        assert_eq!(again.duplicates, 3);
        assert_eq!(db.counts().unwrap().messages, 3);
    }

    #[test]
    fn test_stop_flag_halts_before_next_record() {
        let db = test_db();
        let stop = AtomicBool::new(true);
        let report = ingest_reader(&db, Cursor::new(SOURCE.as_bytes()), "test-source", 100, &stop).unwrap();
        assert!(report.stopped_early);
        assert_eq!(report.lines_processed, 0);
        assert!(db.get_checkpoint("test-source").unwrap().is_none());
    }

    /// Sets `stop` once `remaining` full lines have been read.
    struct StopAfterLines<'a> {
        inner: Cursor<Vec<u8>>,
        stop: &'a AtomicBool,
        remaining: usize,
    }

    impl Read for StopAfterLines<'_> {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read(out)
        }
    }

    impl BufRead for StopAfterLines<'_> {
        fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
            self.inner.fill_buf()
        }

        fn consume(&mut self, amt: usize) {
            let pos = self.inner.position() as usize;
            let newlines = self.inner.get_ref()[pos..pos + amt]
                .iter()
                .filter(|b| **b == b'\n')
                .count();
            self.remaining = self.remaining.saturating_sub(newlines);
            if self.remaining == 0 {
                self.stop.store(true, Ordering::SeqCst);
            }
            self.inner.consume(amt);
        }
    }

    fn numbered_records(n: usize) -> String {
        (1..=n)
            .map(|i| {
                format!(
                    r#"{{"message_identifier": "<{i}@x>", "sent_at": "2024-09-01T08:{i:02}:00Z", "from_email": "alice@example.com"}}"#
                ) + "\n"
            })
            .collect()
    }

    #[test]
    fn test_stop_mid_run_commits_open_batch_and_resumes() {
        let db = test_db();
        let source = numbered_records(5);
        let stop = AtomicBool::new(false);
        let reader = StopAfterLines {
            inner: Cursor::new(source.clone().into_bytes()),
            stop: &stop,
            remaining: 4,
        };

        // Stop is raised while line 4 is read: lines 1-2 are a full batch and
        // line 3 sits in the open batch, which is still committed.
        let first = ingest_reader(&db, reader, "test-source", 2, &stop).unwrap();
        assert!(first.stopped_early);
        assert_eq!(first.lines_processed, 3);
        assert_eq!(first.batches, 2);
        assert_eq!(first.inserted, 3);

        let checkpoint = db.get_checkpoint("test-source").unwrap().unwrap();
        assert_eq!(checkpoint.processed_count, 3);
        assert_eq!(checkpoint.last_message_identifier.as_deref(), Some("<3@x>"));
        assert_eq!(db.counts().unwrap().messages, 3);

        let second = ingest(&db, &source, 2);
        assert_eq!(second.resumed_from, 3);
        assert_eq!(second.inserted, 2);
        assert_eq!(second.duplicates, 0, "committed lines are not read again");
        assert_eq!(db.counts().unwrap().messages, 5);
    }

    #[test]
    fn test_non_utf8_line_is_skipped_not_fatal() {
        let db = test_db();
        let mut source = Vec::new();
        source.extend_from_slice(
            br#"{"message_identifier": "<1@x>", "sent_at": "2024-09-01T08:00:00Z", "from_email": "alice@example.com"}"#,
        );
        source.push(b'\n');
        source.extend_from_slice(b"{\"subject\": \"\xff\xfe broken\"}\r\n");
        source.extend_from_slice(
            br#"{"message_identifier": "<3@x>", "sent_at": "2024-09-01T09:00:00Z", "from_email": "bob@example.com"}"#,
        );

        let stop = AtomicBool::new(false);
        let report = ingest_reader(&db, Cursor::new(source.clone()), "test-source", 1, &stop).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.lines_processed, 3);
        assert_eq!(db.counts().unwrap().messages, 2);

        let checkpoint = db.get_checkpoint("test-source").unwrap().unwrap();
        assert_eq!(checkpoint.processed_count, 3);
        assert_eq!(checkpoint.skipped_count, 1);

        // Resuming past the bad line succeeds and stores nothing new.
        let again = ingest_reader(&db, Cursor::new(source), "test-source", 1, &stop).unwrap();
        assert_eq!(again.resumed_from, 3);
        assert_eq!(again.lines_processed, 0);
    }

    #[test]
    fn test_parse_sent_at_formats() {
        assert!(parse_sent_at("2024-09-01T08:00:00Z").is_some());
        assert!(parse_sent_at("Sun, 1 Sep 2024 08:00:00 +0900").is_some());
        assert!(parse_sent_at("2024-09-01 08:00:00").is_some());
        assert!(parse_sent_at("").is_none());
        assert!(parse_sent_at("tomorrow").is_none());
    }
}
