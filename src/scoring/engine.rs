//! The lead score formula.
//!
//! Conversation (two or more senders):
//!   volume    = qty                                  if qty <= cap
//!             = cap + ln(qty - cap + 1) * log_weight  otherwise
//!   financial = log10(value) * financial_weight       if value > 0
//!   score     = (volume + financial) * density(mean gap)
//!
//! Monologue (one sender): base, plus a bonus when money is mentioned, capped;
//! zero when the latest message carries a spam footer keyword.
//!
//! A blacklisted owner zeroes the score in either mode.

use crate::db::ScoreType;
use crate::types::ScoringConstants;

use super::features::ThreadFeatures;

/// Footer keywords of newsletters and automated notices.
pub const DEFAULT_SPAM_KEYWORDS: &[&str] = &[
    "unsubscribe",
    "opt-out",
    "配信停止",
    "送信専用",
    "解除",
    "donotreply",
    "no-reply",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreResult {
    pub score: f64,
    pub score_type: ScoreType,
}

/// Everything the formula needs besides the features.
pub struct ScoreInput<'a> {
    pub features: &'a ThreadFeatures,
    /// Body of the most recent member.
    pub latest_body: Option<&'a str>,
    pub owner_blacklisted: bool,
}

pub struct ScoringEngine {
    constants: ScoringConstants,
    spam_keywords: Vec<String>,
}

impl ScoringEngine {
    /// `spam_keywords` replaces the default footer set when given.
    pub fn new(constants: ScoringConstants, spam_keywords: Option<&[String]>) -> Self {
        let spam_keywords = match spam_keywords {
            Some(keywords) => keywords.iter().map(|k| k.to_lowercase()).collect(),
            None => DEFAULT_SPAM_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        };
        Self {
            constants,
            spam_keywords,
        }
    }

    pub fn score(&self, input: &ScoreInput<'_>) -> ScoreResult {
        let (raw, score_type) = if input.features.unique_senders >= 2 {
            (self.conversation_score(input.features), ScoreType::Conversation)
        } else if self.has_spam_footer(input.latest_body) {
            (0.0, ScoreType::SpamKeyword)
        } else {
            (self.monologue_score(input.features), ScoreType::Monologue)
        };

        if input.owner_blacklisted {
            return ScoreResult {
                score: 0.0,
                score_type: ScoreType::Blacklisted,
            };
        }

        ScoreResult {
            score: round2(raw),
            score_type,
        }
    }

    fn conversation_score(&self, f: &ThreadFeatures) -> f64 {
        let c = &self.constants;
        let qty = f.message_qty as f64;
        let cap = c.volume_linear_cap as f64;
        let volume = if f.message_qty <= c.volume_linear_cap {
            qty
        } else {
            cap + (qty - cap + 1.0).ln() * c.volume_log_weight
        };
        let financial = if f.estimated_value > 0 {
            (f.estimated_value as f64).log10() * c.financial_weight
        } else {
            0.0
        };
        (volume + financial) * self.density_multiplier(f.mean_gap_secs)
    }

    fn density_multiplier(&self, mean_gap_secs: Option<f64>) -> f64 {
        let Some(gap) = mean_gap_secs else {
            return 1.0;
        };
        let c = &self.constants;
        if let Some(step) = c.density_ladder.iter().find(|s| gap < s.max_gap_secs) {
            return step.multiplier;
        }
        if gap > c.sparse_gap_secs {
            c.sparse_multiplier
        } else {
            1.0
        }
    }

    fn monologue_score(&self, f: &ThreadFeatures) -> f64 {
        let c = &self.constants;
        let mut score = c.monologue_base;
        if f.estimated_value > 0 {
            score += c.monologue_value_bonus;
        }
        score.min(c.monologue_cap)
    }

    fn has_spam_footer(&self, body: Option<&str>) -> bool {
        let Some(body) = body else {
            return false;
        };
        let lower = body.to_lowercase();
        self.spam_keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
