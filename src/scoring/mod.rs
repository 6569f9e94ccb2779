//! Scoring stage: features and score for every active thread.

pub mod engine;
pub mod features;

use serde::Serialize;

use crate::db::{LeadDb, ScoreType, ThreadMetadata, ThreadSnapshot, ThreadStatus};
use crate::error::PipelineError;
use crate::filters::Blacklist;

pub use self::engine::{ScoreInput, ScoreResult, ScoringEngine, DEFAULT_SPAM_KEYWORDS};
pub use self::features::{extract_amounts, extract_features, ThreadFeatures};

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringReport {
    pub threads_scored: usize,
    pub conversations: usize,
    pub monologues: usize,
    pub spam_keyword: usize,
    pub blacklisted: usize,
    pub max_score: f64,
}

impl ScoringReport {
    fn record(&mut self, result: &ScoreResult) {
        self.threads_scored += 1;
        match result.score_type {
            ScoreType::Conversation => self.conversations += 1,
            ScoreType::Monologue => self.monologues += 1,
            ScoreType::SpamKeyword => self.spam_keyword += 1,
            ScoreType::Blacklisted => self.blacklisted += 1,
        }
        self.max_score = self.max_score.max(result.score);
    }
}

/// Score one thread and build the metadata stored next to the score.
pub fn score_snapshot(
    engine: &ScoringEngine,
    blacklist: &Blacklist,
    snapshot: &ThreadSnapshot,
) -> (ScoreResult, ThreadMetadata) {
    let features = extract_features(snapshot);
    let latest_body = snapshot.members.last().and_then(|m| m.body.as_deref());
    let result = engine.score(&ScoreInput {
        features: &features,
        latest_body,
        owner_blacklisted: blacklist.matches(&snapshot.owner_email),
    });
    let metadata = ThreadMetadata {
        estimated_value: Some(features.estimated_value),
        all_values: features.all_values,
        message_qty: Some(features.message_qty),
        unique_senders: Some(features.unique_senders),
        mean_gap_secs: features.mean_gap_secs,
        score_type: Some(result.score_type),
        ignored_by: None,
    };
    (result, metadata)
}

/// Score all active threads, one transaction per page.
pub fn run_scoring(
    db: &LeadDb,
    engine: &ScoringEngine,
    blacklist: &Blacklist,
    page_size: usize,
) -> Result<ScoringReport, PipelineError> {
    let mut report = ScoringReport::default();
    let mut after_id = 0;

    loop {
        let ids = db.thread_ids_page(after_id, page_size, Some(ThreadStatus::Active))?;
        let Some(&last) = ids.last() else {
            break;
        };
        after_id = last;

        db.with_transaction(|tx| -> Result<(), PipelineError> {
            for snapshot in tx.load_thread_snapshots(&ids)? {
                let (result, metadata) = score_snapshot(engine, blacklist, &snapshot);
                tx.set_thread_score(snapshot.thread.id, result.score, &metadata)?;
                report.record(&result);
            }
            Ok(())
        })?;
    }

    log::info!(
        "Scored {} threads: {} conversation, {} monologue, {} spam footer, {} blacklisted (max {:.2})",
        report.threads_scored,
        report.conversations,
        report.monologues,
        report.spam_keyword,
        report.blacklisted,
        report.max_score
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::{seed_contact, seed_message, test_db};
    use crate::types::ScoringConstants;

    fn setup() -> (ScoringEngine, Blacklist) {
        (
            ScoringEngine::new(ScoringConstants::default(), None),
            Blacklist::new(&[], &[]).unwrap(),
        )
    }

    #[test]
    fn test_run_scoring_worked_example() {
        let db = test_db();
        let alice = seed_contact(&db, "alice@example.com");
        let bob = seed_contact(&db, "bob@example.com");
        let m1 = seed_message(&db, alice, Some("<1@x>"), "2024-09-01T08:00:00Z", Some("Quote"), Some("ご予算は¥100,000でしょうか"), Default::default());
        let m2 = seed_message(&db, bob, Some("<2@x>"), "2024-09-01T10:00:00Z", Some("Re: Quote"), Some("50000円で承知しました"), Default::default());
        let m3 = seed_message(&db, alice, Some("<3@x>"), "2024-09-01T12:00:00Z", Some("Re: Quote"), Some("ありがとうございます"), Default::default());
        let thread_id = db.get_message_thread_id(m1).unwrap().unwrap();
        for m in [m2, m3] {
            db.assign_message_thread(m, thread_id).unwrap();
        }
        db.delete_empty_threads().unwrap();
        db.refresh_thread_stats().unwrap();

        let (engine, blacklist) = setup();
        let report = run_scoring(&db, &engine, &blacklist, 10).unwrap();
        assert_eq!(report.threads_scored, 1);
        assert_eq!(report.conversations, 1);

        let thread = db.get_thread(thread_id).unwrap().unwrap();
        assert_eq!(thread.score, 15.6);
        assert_eq!(thread.metadata.estimated_value, Some(100_000));
        assert_eq!(thread.metadata.all_values, vec![100_000, 50_000]);
        assert_eq!(thread.metadata.unique_senders, Some(2));
        assert_eq!(thread.metadata.message_qty, Some(3));
        assert_eq!(thread.metadata.score_type, Some(ScoreType::Conversation));
    }

    #[test]
    fn test_run_scoring_spam_footer_example() {
        let db = test_db();
        let shop = seed_contact(&db, "tanaka@shop.example");
        let mut ids = Vec::new();
        for i in 0..6 {
            let body = if i == 5 { "Click here to unsubscribe" } else { "Weekly update" };
            ids.push(seed_message(
                &db,
                shop,
                Some(format!("<{i}@shop>").as_str()),
                &format!("2024-09-0{}T08:00:00Z", i + 1),
                Some("Weekly"),
                Some(body),
                Default::default(),
            ));
        }
        let thread_id = db.get_message_thread_id(ids[0]).unwrap().unwrap();
        for &m in &ids[1..] {
            db.assign_message_thread(m, thread_id).unwrap();
        }
        db.delete_empty_threads().unwrap();
        db.refresh_thread_stats().unwrap();

        let (engine, blacklist) = setup();
        run_scoring(&db, &engine, &blacklist, 10).unwrap();
        let thread = db.get_thread(thread_id).unwrap().unwrap();
        assert_eq!(thread.score, 0.0);
        assert_eq!(thread.metadata.score_type, Some(ScoreType::SpamKeyword));
    }

    #[test]
    fn test_rescoring_is_idempotent() {
        let db = test_db();
        let alice = seed_contact(&db, "alice@example.com");
        let m1 = seed_message(&db, alice, Some("<1@x>"), "2024-09-01T08:00:00Z", None, Some("300万円"), Default::default());
        let thread_id = db.get_message_thread_id(m1).unwrap().unwrap();

        let (engine, blacklist) = setup();
        run_scoring(&db, &engine, &blacklist, 10).unwrap();
        let first = db.get_thread(thread_id).unwrap().unwrap();
        run_scoring(&db, &engine, &blacklist, 10).unwrap();
        let second = db.get_thread(thread_id).unwrap().unwrap();
        assert_eq!(first.score, second.score);
        assert_eq!(first.metadata, second.metadata);
        assert_eq!(first.score, 1.0);
    }
}
