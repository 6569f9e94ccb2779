//! Identity normalization for message identifiers and subjects.

use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

fn re_reply_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(?:re|fwd|fw|aw|antw|回复|回覆|転送|返信)[:：]\s*").unwrap())
}

fn re_bracket_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\[(].*?[\])]").unwrap())
}

/// Normalize a raw message identifier into a graph key.
///
/// Trims whitespace and one pair of enclosing angle brackets. Returns `None`
/// for absent input and for malformed identifiers (empty after stripping, or
/// containing internal whitespace), so callers give such records a key of
/// their own instead of letting them collide.
pub fn normalize_message_id(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    let inner = trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
        .trim();
    if inner.is_empty() || inner.chars().any(char::is_whitespace) {
        return None;
    }
    Some(inner.to_string())
}

/// Normalize a subject for display and comparison.
///
/// Applies NFKC (folds full-width forms such as `Ｒｅ：`), removes the first
/// bracketed or parenthesized tag, then one leading reply/forward marker,
/// trimming after each step.
pub fn normalize_subject(raw: Option<&str>) -> Option<String> {
    let folded: String = raw?.nfkc().collect();
    let untagged = re_bracket_tag().replacen(folded.trim(), 1, "");
    let unmarked = re_reply_marker().replace(untagged.trim(), "");
    Some(unmarked.trim().to_string())
}

/// Key used by the subject pruner: normalized, lower-cased, whitespace removed.
pub fn subject_compare_key(raw: Option<&str>) -> String {
    normalize_subject(raw)
        .unwrap_or_default()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_strips_brackets_and_whitespace() {
        assert_eq!(normalize_message_id(Some("  <abc@mail.example>  ")).as_deref(), Some("abc@mail.example"));
        assert_eq!(normalize_message_id(Some("abc@mail.example")).as_deref(), Some("abc@mail.example"));
        assert_eq!(normalize_message_id(Some("< abc@mail.example >")).as_deref(), Some("abc@mail.example"));
    }

    #[test]
    fn test_message_id_absent_or_malformed() {
        assert_eq!(normalize_message_id(None), None);
        assert_eq!(normalize_message_id(Some("")), None);
        assert_eq!(normalize_message_id(Some("<>")), None);
        assert_eq!(normalize_message_id(Some("two parts@x")), None);
    }

    #[test]
    fn test_subject_strips_one_marker() {
        assert_eq!(normalize_subject(Some("Re: Quote request")).as_deref(), Some("Quote request"));
        assert_eq!(normalize_subject(Some("FWD: Quote request")).as_deref(), Some("Quote request"));
        assert_eq!(normalize_subject(Some("Re: Re: Quote")).as_deref(), Some("Re: Quote"));
        assert_eq!(normalize_subject(Some("回复：见积")).as_deref(), Some("见积"));
        assert_eq!(normalize_subject(Some("返信: お見積り")).as_deref(), Some("お見積り"));
        assert_eq!(normalize_subject(Some("Ｒｅ：Quote")).as_deref(), Some("Quote"));
    }

    #[test]
    fn test_subject_strips_bracket_tag() {
        assert_eq!(normalize_subject(Some("[sales-ml] Re: Quote")).as_deref(), Some("Quote"));
        assert_eq!(normalize_subject(Some("Re: (urgent) Quote")).as_deref(), Some("Quote"));
        assert_eq!(normalize_subject(None), None);
    }

    #[test]
    fn test_compare_key_ignores_case_and_spaces() {
        assert_eq!(subject_compare_key(Some("Re: Project  Kickoff")), "projectkickoff");
        assert_eq!(subject_compare_key(None), "");
    }
}
