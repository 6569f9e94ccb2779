//! Filter chain: marks reconstructed threads as ignored.
//!
//! Filters are plain functions registered by name and evaluated in
//! registration order. A filter can only vote to ignore a thread. Each page
//! of threads is reset to active and re-evaluated in the same transaction,
//! so readers never see a reset thread that has not been filtered yet, and
//! within a run a thread's status never goes from ignored back to active.

use std::collections::{BTreeMap, HashSet};

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::db::{IgnoreEntry, IgnoreKind, LeadDb, MessageMetadata, ThreadSnapshot, ThreadStatus};
use crate::error::PipelineError;

/// Built-in system-sender conventions, matched case-insensitively against the full address.
pub const DEFAULT_BLACKLIST_PATTERNS: &[&str] = &[
    r"no-?reply",
    r"donotreply",
    r"do-not-reply",
    r"notification",
    r"alert",
    r"info@",
    r"support@",
    r"newsletter",
    r"magazine",
    r"mailmag",
    r"news@",
    r"update@",
    r"press@",
    r"editor@",
    r"seminar",
    r"survey",
    r"auto-?confirm",
    r"account@",
    r"admin@",
    r"service@",
    r"system@",
    r"bounce",
    r"mailer-daemon",
    r"campaign",
    r"mag2",
    r"checker",
];

/// `Precedence:` values that mark list or automated traffic.
const BULK_PRECEDENCE: &[&str] = &["bulk", "list", "junk", "auto_reply"];

/// Compile sender patterns case-insensitively. Any invalid pattern is an error.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, PipelineError> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| PipelineError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect()
}

/// Extract domain from an email address.
pub fn extract_domain(email_addr: &str) -> String {
    if let Some(at_pos) = email_addr.rfind('@') {
        email_addr[at_pos + 1..].to_lowercase()
    } else {
        String::new()
    }
}

/// Sender blacklist: built-in patterns, configured patterns and ignore-list entries.
#[derive(Debug, Clone)]
pub struct Blacklist {
    patterns: Vec<Regex>,
    emails: HashSet<String>,
    domains: HashSet<String>,
}

impl Blacklist {
    pub fn new(extra_patterns: &[String], entries: &[IgnoreEntry]) -> Result<Self, PipelineError> {
        let all: Vec<String> = DEFAULT_BLACKLIST_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra_patterns.iter().cloned())
            .collect();
        let mut blacklist = Self {
            patterns: compile_patterns(&all)?,
            emails: HashSet::new(),
            domains: HashSet::new(),
        };
        for entry in entries {
            let value = entry.value.trim().to_lowercase();
            match entry.kind {
                IgnoreKind::Email => blacklist.emails.insert(value),
                IgnoreKind::Domain => blacklist.domains.insert(value.trim_start_matches('@').to_string()),
            };
        }
        Ok(blacklist)
    }

    pub fn matches(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        if self.emails.contains(&email) {
            return true;
        }
        let domain = extract_domain(&email);
        if !domain.is_empty() {
            let listed = self.domains.iter().any(|d| {
                domain == *d || domain.strip_suffix(d.as_str()).is_some_and(|rest| rest.ends_with('.'))
            });
            if listed {
                return true;
            }
        }
        self.patterns.iter().any(|re| re.is_match(&email))
    }
}

/// Inputs shared by all filters in one run.
pub struct FilterContext {
    pub min_messages: i64,
    pub volume_ceiling: i64,
    pub blacklist: Blacklist,
}

/// Returns true when the thread should be ignored.
pub type FilterFn = fn(&ThreadSnapshot, &FilterContext) -> bool;

pub struct FilterEntry {
    pub name: &'static str,
    pub filter: FilterFn,
}

#[derive(Default)]
pub struct FilterChain {
    filters: Vec<FilterEntry>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, filter: FilterFn) {
        self.filters.push(FilterEntry { name, filter });
    }

    /// The standard chain, in evaluation order.
    pub fn standard() -> Self {
        let mut chain = Self::new();
        chain.register("low_volume", filter_low_volume);
        chain.register("automated_bulk", filter_automated_bulk);
        chain.register("blacklisted_sender", filter_blacklisted_sender);
        chain.register("single_participant", filter_single_participant);
        chain.register("volume_ceiling", filter_volume_ceiling);
        chain
    }

    /// Name of the first filter that ignores the thread, if any.
    pub fn evaluate(&self, snapshot: &ThreadSnapshot, ctx: &FilterContext) -> Option<&'static str> {
        self.filters
            .iter()
            .find(|entry| (entry.filter)(snapshot, ctx))
            .map(|entry| entry.name)
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

fn filter_low_volume(snapshot: &ThreadSnapshot, ctx: &FilterContext) -> bool {
    snapshot.thread.message_count < ctx.min_messages
}

fn filter_automated_bulk(snapshot: &ThreadSnapshot, _ctx: &FilterContext) -> bool {
    snapshot.members.iter().any(|m| is_automated(&m.metadata))
}

fn filter_blacklisted_sender(snapshot: &ThreadSnapshot, ctx: &FilterContext) -> bool {
    ctx.blacklist.matches(&snapshot.owner_email)
}

fn filter_single_participant(snapshot: &ThreadSnapshot, _ctx: &FilterContext) -> bool {
    let participants: HashSet<i64> = snapshot.members.iter().map(|m| m.contact_id).collect();
    participants.len() < 2
}

fn filter_volume_ceiling(snapshot: &ThreadSnapshot, ctx: &FilterContext) -> bool {
    snapshot.thread.message_count > ctx.volume_ceiling
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Header signals of mailing-list or machine-generated mail.
pub fn is_automated(meta: &MessageMetadata) -> bool {
    if non_empty(&meta.list_unsubscribe).is_some() || non_empty(&meta.auto_response_suppress).is_some() {
        return true;
    }
    if let Some(precedence) = non_empty(&meta.precedence) {
        let precedence = precedence.to_lowercase();
        if BULK_PRECEDENCE.contains(&precedence.as_str()) {
            return true;
        }
    }
    non_empty(&meta.auto_submitted).is_some_and(|v| !v.eq_ignore_ascii_case("no"))
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterReport {
    pub threads_checked: usize,
    pub threads_ignored: usize,
    pub by_filter: BTreeMap<String, usize>,
}

/// Evaluate the chain over every thread, one transaction per page.
///
/// Each thread is written as either ignored (with the filter name) or active
/// in the same commit, which also clears a previous run's ignore marker.
pub fn run_filters(
    db: &LeadDb,
    chain: &FilterChain,
    ctx: &FilterContext,
    page_size: usize,
) -> Result<FilterReport, PipelineError> {
    let mut report = FilterReport::default();
    let mut after_id = 0;
    let mut reactivated = 0;

    loop {
        let ids = db.thread_ids_page(after_id, page_size, None)?;
        let Some(&last) = ids.last() else {
            break;
        };
        after_id = last;

        db.with_transaction(|tx| -> Result<(), PipelineError> {
            for snapshot in tx.load_thread_snapshots(&ids)? {
                report.threads_checked += 1;
                match chain.evaluate(&snapshot, ctx) {
                    Some(name) => {
                        tx.mark_thread_ignored(snapshot.thread.id, name)?;
                        report.threads_ignored += 1;
                        *report.by_filter.entry(name.to_string()).or_insert(0) += 1;
                    }
                    None if snapshot.thread.status == ThreadStatus::Ignored => {
                        tx.reactivate_thread(snapshot.thread.id)?;
                        reactivated += 1;
                    }
                    None => {}
                }
            }
            Ok(())
        })?;
    }

    log::debug!("{} previously ignored threads are active again", reactivated);
    log::info!(
        "Filter chain: {} of {} threads ignored {:?}",
        report.threads_ignored,
        report.threads_checked,
        report.by_filter
    );
    Ok(report)
}
