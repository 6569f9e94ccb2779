//! Contact aggregation: closeness from active thread scores.
//!
//! Full recompute every run. Reset and rebuild share one transaction so no
//! reader ever sees the zeroed intermediate state.

use serde::Serialize;

use crate::db::LeadDb;
use crate::error::PipelineError;

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationReport {
    pub contacts_reset: usize,
    pub contacts_scored: usize,
}

/// `closeness_score = MAX(score)` and `last_contacted_at = MAX(last_message_at)`
/// over each contact's active threads; everyone else ends at 0 / NULL.
pub fn aggregate_contacts(db: &LeadDb) -> Result<AggregationReport, PipelineError> {
    let report = db.with_transaction(|tx| -> Result<AggregationReport, PipelineError> {
        let contacts_reset = tx.reset_closeness()?;
        let rollup = tx.active_thread_rollup()?;
        for (contact_id, score, last_at) in &rollup {
            tx.set_closeness(*contact_id, *score, last_at.as_deref())?;
        }
        Ok(AggregationReport {
            contacts_reset,
            contacts_scored: rollup.len(),
        })
    })?;

    log::info!(
        "Closeness recomputed: {} contacts with active threads out of {}",
        report.contacts_scored,
        report.contacts_reset
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::{seed_contact, seed_message, test_db};
    use crate::db::ThreadMetadata;

    fn scored_thread(db: &LeadDb, contact: i64, identifier: &str, sent_at: &str, score: f64) -> i64 {
        let message = seed_message(db, contact, Some(identifier), sent_at, None, None, Default::default());
        let thread_id = db.get_message_thread_id(message).unwrap().unwrap();
        db.set_thread_score(thread_id, score, &ThreadMetadata::default()).unwrap();
        thread_id
    }

    #[test]
    fn test_closeness_is_max_of_active_threads() {
        let db = test_db();
        let alice = seed_contact(&db, "alice@example.com");
        scored_thread(&db, alice, "<1@x>", "2024-09-01T08:00:00Z", 4.5);
        scored_thread(&db, alice, "<2@x>", "2024-10-01T08:00:00Z", 12.25);
        let ignored = scored_thread(&db, alice, "<3@x>", "2024-11-01T08:00:00Z", 99.0);
        db.mark_thread_ignored(ignored, "automated_bulk").unwrap();

        let report = aggregate_contacts(&db).unwrap();
        assert_eq!(report.contacts_scored, 1);

        let contact = db.get_contact(alice).unwrap().unwrap();
        assert_eq!(contact.closeness_score, 12.25, "MAX, not SUM, and ignored threads excluded");
        assert_eq!(contact.last_contacted_at.as_deref(), Some("2024-10-01T08:00:00Z"));
    }

    #[test]
    fn test_contacts_without_active_threads_reset_to_zero() {
        let db = test_db();
        let bob = seed_contact(&db, "bob@example.com");
        db.set_closeness(bob, 7.0, Some("2024-01-01T00:00:00Z")).unwrap();
        let thread = scored_thread(&db, bob, "<1@x>", "2024-09-01T08:00:00Z", 3.0);
        db.mark_thread_ignored(thread, "low_volume").unwrap();

        aggregate_contacts(&db).unwrap();
        let contact = db.get_contact(bob).unwrap().unwrap();
        assert_eq!(contact.closeness_score, 0.0);
        assert_eq!(contact.last_contacted_at, None);
    }
}
