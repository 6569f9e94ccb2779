//! Per-thread feature extraction: monetary amounts, participants, cadence.

use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::db::{parse_db_timestamp, ThreadSnapshot};

/// How many of the largest distinct amounts are kept in thread metadata.
pub const MAX_KEPT_VALUES: usize = 5;

// Compile-once regex patterns via OnceLock.
fn re_yen_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]{1,3}(?:,[0-9]{3})+|[0-9]+)\s*円").unwrap())
}

fn re_yen_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"¥\s*([0-9]{1,3}(?:,[0-9]{3})+|[0-9]+)").unwrap())
}

fn re_large_unit() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]{1,3}(?:,[0-9]{3})+|[0-9]+)\s*(万|億)\s*円?").unwrap())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadFeatures {
    /// Largest amount found, 0 when none.
    pub estimated_value: u64,
    /// Up to five largest distinct amounts, descending.
    pub all_values: Vec<u64>,
    pub message_qty: usize,
    pub unique_senders: usize,
    /// Mean gap between consecutive send times; `None` with fewer than two timestamps.
    pub mean_gap_secs: Option<f64>,
}

fn parse_amount(digits: &str) -> Option<u64> {
    digits.replace(',', "").parse().ok()
}

/// All positive yen amounts mentioned in `text`.
///
/// Full-width digits and `￥` are folded with NFKC first. Amounts that
/// overflow are dropped.
pub fn extract_amounts(text: &str) -> BTreeSet<u64> {
    let text: String = text.nfkc().collect();
    let mut values = BTreeSet::new();

    for re in [re_yen_suffix(), re_yen_prefix()] {
        for caps in re.captures_iter(&text) {
            if let Some(value) = parse_amount(&caps[1]) {
                values.insert(value);
            }
        }
    }

    for caps in re_large_unit().captures_iter(&text) {
        let multiplier: u64 = if &caps[2] == "億" { 100_000_000 } else { 10_000 };
        match parse_amount(&caps[1]).and_then(|v| v.checked_mul(multiplier)) {
            Some(value) => {
                values.insert(value);
            }
            None => log::debug!("Dropped out-of-range amount '{}'", &caps[0]),
        }
    }

    values.remove(&0);
    values
}

pub fn extract_features(snapshot: &ThreadSnapshot) -> ThreadFeatures {
    let mut amounts = BTreeSet::new();
    for member in &snapshot.members {
        if let Some(body) = member.body.as_deref() {
            amounts.extend(extract_amounts(body));
        }
    }

    let senders: HashSet<i64> = snapshot.members.iter().map(|m| m.contact_id).collect();

    let mut times: Vec<i64> = snapshot
        .members
        .iter()
        .filter_map(|m| parse_db_timestamp(&m.sent_at))
        .map(|dt| dt.timestamp())
        .collect();
    times.sort_unstable();
    let mean_gap_secs = if times.len() > 1 {
        let span = times[times.len() - 1] - times[0];
        Some(span as f64 / (times.len() - 1) as f64)
    } else {
        None
    };

    ThreadFeatures {
        estimated_value: amounts.last().copied().unwrap_or(0),
        all_values: amounts.iter().rev().take(MAX_KEPT_VALUES).copied().collect(),
        message_qty: snapshot.members.len(),
        unique_senders: senders.len(),
        mean_gap_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yen_suffix_and_prefix() {
        let values = extract_amounts("見積額は50000円です。別案は¥100,000、予備費 1,200 円。");
        assert_eq!(values.into_iter().collect::<Vec<_>>(), vec![1_200, 50_000, 100_000]);
    }

    #[test]
    fn test_large_units_apply_multiplier() {
        let values = extract_amounts("予算は300万円、全体で2億");
        assert!(values.contains(&3_000_000));
        assert!(values.contains(&200_000_000));
    }

    #[test]
    fn test_full_width_forms_are_folded() {
        let values = extract_amounts("￥５，０００");
        assert!(values.contains(&5_000), "got {:?}", values);
    }

    #[test]
    fn test_plain_numbers_are_not_money() {
        assert!(extract_amounts("Meeting at 10:30 in room 402, call 03-1234-5678").is_empty());
        assert!(extract_amounts("0円").is_empty());
    }

    #[test]
    fn test_overflowing_amount_is_dropped() {
        let values = extract_amounts("99999999999999999999億円");
        assert!(values.is_empty());
    }
}
