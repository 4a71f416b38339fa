//! Input validation and name synthesis.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ValidationError;

pub const MAX_SESSION_NAME_LEN: usize = 100;
pub const MAX_NOTE_LEN: usize = 1000;
pub const MAX_TAG_LEN: usize = 50;
pub const MAX_TAGS_PER_SESSION: usize = 20;

static SESSION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9 _\-.]+$").expect("session name pattern"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("tag pattern"));

/// Strip disallowed characters and clamp to the maximum length. The result
/// may be empty; callers fall back to [`default_session_name`].
pub fn sanitize_session_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.'))
        .collect();
    let trimmed = cleaned.trim();
    trimmed.chars().take(MAX_SESSION_NAME_LEN).collect()
}

/// Accepts iff `1 <= len <= 100` and every character is in the allowed set.
pub fn validate_session_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.chars().count() > MAX_SESSION_NAME_LEN {
        return Err(ValidationError::SessionNameInvalid);
    }
    if !SESSION_NAME_RE.is_match(name) {
        return Err(ValidationError::SessionNameInvalid);
    }
    Ok(())
}

/// Synthesized name for sessions started without one: `Session_YYYY-MM-DD_HHMM`.
pub fn default_session_name(now: DateTime<Utc>) -> String {
    format!("Session_{}", now.format("%Y-%m-%d_%H%M"))
}

/// Display name for a finalized segment:
/// `{session_name}_{YYYY-MM-DD}_{HHMM}_partNNN`, NNN zero-padded from 001.
pub fn segment_display_name(session_name: &str, at: DateTime<Utc>, sequence_index: u32) -> String {
    format!(
        "{}_{}_part{:03}",
        session_name,
        at.format("%Y-%m-%d_%H%M"),
        sequence_index
    )
}

pub fn validate_note(note: &str) -> Result<(), ValidationError> {
    if note.chars().count() > MAX_NOTE_LEN {
        return Err(ValidationError::NoteTooLong);
    }
    Ok(())
}

pub fn validate_tag(tag: &str) -> Result<(), ValidationError> {
    let len = tag.chars().count();
    if len == 0 || len > MAX_TAG_LEN || !TAG_RE.is_match(tag) {
        return Err(ValidationError::TagInvalid(tag.to_string()));
    }
    Ok(())
}

/// Validate a batch of tags being added to a session that already carries
/// `existing_count` tags. A tag repeated inside the batch is rejected;
/// overlap with already-present tags is resolved by set union later.
pub fn validate_tags(tags: &[String], existing_count: usize) -> Result<(), ValidationError> {
    let mut seen = std::collections::HashSet::new();
    for tag in tags {
        validate_tag(tag)?;
        if !seen.insert(tag.as_str()) {
            return Err(ValidationError::DuplicateTag(tag.clone()));
        }
    }
    if existing_count + seen.len() > MAX_TAGS_PER_SESSION {
        return Err(ValidationError::TooManyTags);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accepts_plain_names() {
        for name in ["Goblin Ambush", "Campaign 5", "a", "one.two-three_4"] {
            assert!(validate_session_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_empty_long_and_illegal_names() {
        assert!(validate_session_name("").is_err());
        assert!(validate_session_name(&"x".repeat(101)).is_err());
        assert!(validate_session_name("bad/name").is_err());
        assert!(validate_session_name("emoji 🎲").is_err());
        assert!(validate_session_name(&"y".repeat(100)).is_ok());
    }

    #[test]
    fn sanitize_strips_and_clamps() {
        assert_eq!(sanitize_session_name("Goblin <Ambush>!"), "Goblin Ambush");
        assert_eq!(sanitize_session_name("  spaced  "), "spaced");
        assert_eq!(sanitize_session_name("///"), "");
        assert_eq!(sanitize_session_name(&"z".repeat(200)).len(), 100);
    }

    #[test]
    fn default_name_matches_expected_shape() {
        let at = Utc.with_ymd_and_hms(2025, 3, 7, 21, 5, 30).unwrap();
        let name = default_session_name(at);
        assert_eq!(name, "Session_2025-03-07_2105");
        assert!(validate_session_name(&name).is_ok());
    }

    #[test]
    fn segment_names_are_zero_padded() {
        let at = Utc.with_ymd_and_hms(2025, 3, 7, 21, 5, 0).unwrap();
        assert_eq!(
            segment_display_name("Campaign 5", at, 1),
            "Campaign 5_2025-03-07_2105_part001"
        );
        assert_eq!(
            segment_display_name("Campaign 5", at, 42),
            "Campaign 5_2025-03-07_2105_part042"
        );
    }

    #[test]
    fn note_limit_is_one_thousand_chars() {
        assert!(validate_note(&"n".repeat(1000)).is_ok());
        assert!(validate_note(&"n".repeat(1001)).is_err());
    }

    #[test]
    fn tag_rules() {
        assert!(validate_tag("one-shot_2").is_ok());
        assert!(validate_tag("").is_err());
        assert!(validate_tag("has space").is_err());
        assert!(validate_tag(&"t".repeat(51)).is_err());
    }

    #[test]
    fn tag_batches_reject_duplicates_and_overflow() {
        let tags = vec!["alpha".to_string(), "alpha".to_string()];
        assert!(matches!(
            validate_tags(&tags, 0),
            Err(ValidationError::DuplicateTag(_))
        ));

        let many: Vec<String> = (0..5).map(|i| format!("tag{i}")).collect();
        assert!(validate_tags(&many, 16).is_err());
        assert!(validate_tags(&many, 15).is_ok());
    }
}
