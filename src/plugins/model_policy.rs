//! Model tier selection policy.
//!
//! Difficulty is classified from task text; the base tier mapping can be
//! upgraded when quota would otherwise go to waste (window closing with
//! surplus, or a long idle stretch ahead) and is always downgraded when the
//! chosen tier's quota does not admit another message. An operator-forced
//! tier skips classification and upgrade but still obeys downgrade.

use crate::core::config::Config;
use crate::core::error::MagpieError;
use crate::core::models::{ModelTier, RequestedModel, Task};
use crate::plugins::quota::QuotaLedger;
use crate::plugins::schedule::{longest_predicted_idle_within, ActivityPattern};
use chrono::{DateTime, Local, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Difficulty {
    Simple,
    Medium,
    Complex,
}

const COMPLEX_KEYWORDS: &[&str] = &[
    "security",
    "vulnerability",
    "architecture",
    "migration",
    "performance",
];

const SIMPLE_KEYWORDS: &[&str] = &[
    "docs",
    "lint",
    "format",
    "typo",
    "clean",
    "dead code",
    "changelog",
];

/// Classify from title + description. Complex keywords win over simple ones.
pub fn classify(title: &str, description: &str) -> Difficulty {
    let text = format!("{} {}", title, description).to_lowercase();
    if COMPLEX_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return Difficulty::Complex;
    }
    if SIMPLE_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return Difficulty::Simple;
    }
    Difficulty::Medium
}

pub fn base_tier(difficulty: Difficulty) -> ModelTier {
    match difficulty {
        Difficulty::Simple => ModelTier::Haiku,
        Difficulty::Medium => ModelTier::Sonnet,
        Difficulty::Complex => ModelTier::Opus,
    }
}

// Upgrade thresholds
const WINDOW_CLOSING_HOURS: f64 = 1.5;
const WINDOW_CLOSING_MIN_REMAINING: f64 = 0.30;
const LONG_IDLE_MINUTES: i64 = 6 * 60;
const LONG_IDLE_HORIZON_HOURS: i64 = 8;
const LONG_IDLE_MIN_REMAINING: f64 = 0.40;

/// Why the policy moved off the base tier; propagated into logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierAdjustment {
    None,
    Upgraded(String),
    Downgraded(u32),
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub tier: ModelTier,
    pub difficulty: Difficulty,
    pub adjustment: TierAdjustment,
}

fn should_upgrade(
    tier: ModelTier,
    ledger: &QuotaLedger,
    pattern: &ActivityPattern,
    now_utc: DateTime<Utc>,
    now_local: DateTime<Local>,
) -> Result<Option<String>, MagpieError> {
    let remaining = ledger.remaining(now_utc, tier)? as f64;
    let limit = ledger.limit(tier) as f64;
    if limit <= 0.0 {
        return Ok(None);
    }

    let hours_left = ledger.window_hours_left(now_utc)?;
    if hours_left < WINDOW_CLOSING_HOURS && remaining >= WINDOW_CLOSING_MIN_REMAINING * limit {
        return Ok(Some(format!(
            "window ending in {:.1}h with {:.0}% of {} remaining",
            hours_left,
            remaining / limit * 100.0,
            tier.alias()
        )));
    }

    if remaining >= LONG_IDLE_MIN_REMAINING * limit {
        let idle = longest_predicted_idle_within(pattern, now_local, LONG_IDLE_HORIZON_HOURS);
        if idle >= LONG_IDLE_MINUTES {
            return Ok(Some(format!(
                "{}h idle predicted with {:.0}% of {} remaining",
                idle / 60,
                remaining / limit * 100.0,
                tier.alias()
            )));
        }
    }

    Ok(None)
}

/// Pick the tier for a task, or `None` when no tier's quota admits dispatch
/// this tick.
pub fn select_tier(
    task: &Task,
    cfg: &Config,
    ledger: &QuotaLedger,
    pattern: &ActivityPattern,
    now_utc: DateTime<Utc>,
    now_local: DateTime<Local>,
) -> Result<Option<Selection>, MagpieError> {
    let difficulty = classify(&task.title, &task.description);
    let forced = match task.requested_model.resolve()? {
        RequestedModel::Tier(t) => Some(t),
        RequestedModel::Auto => {
            if cfg.assistant.auto_select_model {
                None
            } else {
                Some(cfg.assistant.default_tier()?)
            }
        }
    };

    let mut adjustment = TierAdjustment::None;
    let mut tier = match forced {
        Some(t) => t,
        None => {
            let base = base_tier(difficulty);
            match should_upgrade(base, ledger, pattern, now_utc, now_local)? {
                Some(reason) => {
                    adjustment = TierAdjustment::Upgraded(reason);
                    base.upgraded()
                }
                None => base,
            }
        }
    };

    // Downgrade when not admitted, at most two steps.
    let mut steps = 0u32;
    while !ledger.admits(now_utc, tier)? {
        if steps == 2 {
            return Ok(None);
        }
        match tier.downgraded() {
            Some(lower) => {
                tier = lower;
                steps += 1;
            }
            None => return Ok(None),
        }
    }
    if steps > 0 {
        adjustment = TierAdjustment::Downgraded(steps);
    }

    Ok(Some(Selection {
        tier,
        difficulty,
        adjustment,
    }))
}
