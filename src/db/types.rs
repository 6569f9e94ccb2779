//! Shared type definitions for the database layer.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Malformed JSON in {column}: {source}")]
    Json {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Format a timestamp the way every `*_at` column stores it.
///
/// UTC, second precision, `Z` suffix: lexicographic order equals time order,
/// so SQL `MAX()` over these columns is a chronological max.
pub fn to_db_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp. Accepts RFC3339 and the bare SQLite datetime form.
pub fn parse_db_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn now_timestamp() -> String {
    to_db_timestamp(&Utc::now())
}

/// Thread visibility. Only `Active` threads are scored and aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Ignored,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Active => "active",
            ThreadStatus::Ignored => "ignored",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ThreadStatus::Active),
            "ignored" => Some(ThreadStatus::Ignored),
            _ => None,
        }
    }
}

/// Which scoring branch produced a thread's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreType {
    Conversation,
    Monologue,
    SpamKeyword,
    Blacklisted,
}

/// A row from the `contacts` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbContact {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub closeness_score: f64,
    pub last_contacted_at: Option<String>,
}

/// JSON stored in `threads.metadata`.
///
/// Active threads carry their scoring features; ignored threads carry the
/// name of the filter that ignored them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_value: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_values: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_qty: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_senders: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_gap_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_type: Option<ScoreType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignored_by: Option<String>,
}

/// A row from the `threads` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbThread {
    pub id: i64,
    pub contact_id: i64,
    pub subject: Option<String>,
    pub message_count: i64,
    pub last_message_at: Option<String>,
    pub status: ThreadStatus,
    pub score: f64,
    pub metadata: ThreadMetadata,
}

/// Header data kept in `messages.metadata`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_unsubscribe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precedence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_response_suppress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_submitted: Option<String>,
}

/// A message about to be stored by ingestion.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_identifier: Option<String>,
    pub sent_at: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub metadata: MessageMetadata,
}

/// The slice of a message row needed to build the reference graph (no body).
#[derive(Debug, Clone)]
pub struct GraphMessageRow {
    pub id: i64,
    pub thread_id: i64,
    pub contact_id: i64,
    pub message_identifier: Option<String>,
    pub sent_at: String,
    pub subject: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

/// One member message of a thread, as read by the filter chain and scoring.
#[derive(Debug, Clone)]
pub struct ThreadMember {
    pub message_id: i64,
    pub contact_id: i64,
    pub sent_at: String,
    pub body: Option<String>,
    pub metadata: MessageMetadata,
}

/// A thread with its owner's address and its members sorted by send time.
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    pub thread: DbThread,
    pub owner_email: String,
    pub members: Vec<ThreadMember>,
}

/// Entry kinds of the administrator ignore list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IgnoreKind {
    Email,
    Domain,
}

impl IgnoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreKind::Email => "email",
            IgnoreKind::Domain => "domain",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "email" => Some(IgnoreKind::Email),
            "domain" => Some(IgnoreKind::Domain),
            _ => None,
        }
    }
}

/// A row from `ignore_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreEntry {
    pub id: i64,
    pub value: String,
    pub kind: IgnoreKind,
}

/// A row from `ingest_checkpoints`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestCheckpoint {
    pub source_key: String,
    pub processed_count: u64,
    pub last_message_identifier: Option<String>,
    pub skipped_count: u64,
}

/// A row from `pipeline_runs`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPipelineRun {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub report_json: Option<String>,
}

/// Row counts shown by `pastlead status`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCounts {
    pub contacts: i64,
    pub messages: i64,
    pub threads: i64,
    pub active_threads: i64,
    pub ignored_threads: i64,
    pub ignore_list_entries: i64,
}
