//! Deterministic task priority scoring.
//!
//! Pure function of (source, title, description): a base weight per source,
//! additive keyword boosts, and a small bonus for short descriptions (easier
//! to finish unattended). Clamped to [0, 100].

use crate::core::models::TaskSource;
use regex::Regex;
use std::sync::OnceLock;

const MAX_SHORT_DESCRIPTION_BONUS: f64 = 15.0;
const SHORT_DESCRIPTION_CHARS: usize = 200;

fn source_weight(source: TaskSource) -> f64 {
    match source {
        TaskSource::Manual => 40.0,
        TaskSource::QueueFile => 35.0,
        TaskSource::Issue => 30.0,
        TaskSource::AutoTemplate => 25.0,
        TaskSource::CodeComment => 20.0,
        TaskSource::Markdown => 15.0,
    }
}

fn keyword_rules() -> &'static [(Regex, f64)] {
    static RULES: OnceLock<Vec<(Regex, f64)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"(?i)\b(security|vulnerability)\b", 30.0),
            (r"(?i)\b(bug|fix|crash|error)\b", 25.0),
            (r"(?i)\bfixme\b", 20.0),
            (r"(?i)\bperformance\b", 15.0),
            (r"(?i)\b(hack|xxx)\b", 15.0),
            (r"(?i)\b(refactor|cleanup)\b", 10.0),
            (r"(?i)\btest\b", 8.0),
            (r"(?i)\bdocs\b", 5.0),
        ]
        .iter()
        .map(|(pat, boost)| (Regex::new(pat).unwrap(), *boost))
        .collect()
    })
}

/// Score in [0, 100]. Every matching keyword rule adds its boost.
pub fn score(source: TaskSource, title: &str, description: &str) -> f64 {
    let mut total = source_weight(source);

    let text = format!("{} {}", title, description);
    for (pattern, boost) in keyword_rules() {
        if pattern.is_match(&text) {
            total += boost;
        }
    }

    let desc_len = description.chars().count();
    if desc_len < SHORT_DESCRIPTION_CHARS {
        let ratio = 1.0 - desc_len as f64 / SHORT_DESCRIPTION_CHARS as f64;
        total += MAX_SHORT_DESCRIPTION_BONUS * ratio;
    }

    total.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_base_ordering() {
        let s = |src| score(src, "plain task", &"x".repeat(300));
        assert_eq!(s(TaskSource::Manual), 40.0);
        assert_eq!(s(TaskSource::QueueFile), 35.0);
        assert_eq!(s(TaskSource::Issue), 30.0);
        assert_eq!(s(TaskSource::AutoTemplate), 25.0);
        assert_eq!(s(TaskSource::CodeComment), 20.0);
        assert_eq!(s(TaskSource::Markdown), 15.0);
    }

    #[test]
    fn keyword_boosts_are_additive() {
        let long = "x".repeat(300);
        let base = score(TaskSource::Manual, "plain task", &long);
        let boosted = score(TaskSource::Manual, "fix security bug", &long);
        // security +30, bug|fix +25 (one rule, matched once)
        assert_eq!(boosted, base + 55.0);
    }

    #[test]
    fn keywords_match_case_insensitively_in_description() {
        let long_tail = "y".repeat(250);
        let with = score(
            TaskSource::CodeComment,
            "tidy module",
            &format!("FIXME left over. {}", long_tail),
        );
        let without = score(TaskSource::CodeComment, "tidy module", &long_tail);
        assert_eq!(with, without + 20.0);
    }

    #[test]
    fn short_description_bonus_scales_linearly() {
        // Empty description: full +15 bonus.
        assert_eq!(score(TaskSource::Markdown, "plain", ""), 15.0 + 15.0);
        // Half the threshold: half the bonus.
        let half = "z".repeat(100);
        assert_eq!(score(TaskSource::Markdown, "plain", &half), 15.0 + 7.5);
        // At/over threshold: nothing.
        let full = "z".repeat(200);
        assert_eq!(score(TaskSource::Markdown, "plain", &full), 15.0);
    }

    #[test]
    fn clamped_to_hundred() {
        let p = score(
            TaskSource::Manual,
            "fix security vulnerability bug crash FIXME HACK performance refactor test docs",
            "",
        );
        assert_eq!(p, 100.0);
    }

    #[test]
    fn never_negative() {
        let p = score(TaskSource::Markdown, "plain", &"q".repeat(1000));
        assert!(p >= 0.0);
    }
}
