//! Quota accounting for the rolling message window.
//!
//! Counts are estimates: the upstream service does not expose per-model
//! message counts, so the ledger tracks its own consumption, reserves a
//! safety margin for interactive use, and accepts operator corrections (or
//! automatic syncs against the usage endpoint) as authoritative overrides.

use crate::cli::{QuotaCli, QuotaCommand};
use crate::core::config::Config;
use crate::core::error::MagpieError;
use crate::core::models::{ModelTier, QuotaWindowRow, ALL_TIERS};
use crate::core::store::Store;
use chrono::{DateTime, Duration, Utc};
use colored::Colorize;
use serde_json::Value as JsonValue;
use std::path::PathBuf;

/// Per-tier message accounting within the open window.
pub struct QuotaLedger<'a> {
    store: &'a Store,
    cfg: &'a Config,
}

impl<'a> QuotaLedger<'a> {
    pub fn new(store: &'a Store, cfg: &'a Config) -> QuotaLedger<'a> {
        QuotaLedger { store, cfg }
    }

    pub fn limit(&self, tier: ModelTier) -> i64 {
        self.cfg.quota.limits.limit(tier)
    }

    /// The limit minus the interactive safety reserve; what autonomous
    /// dispatch may actually spend.
    pub fn effective_limit(&self, tier: ModelTier) -> i64 {
        let margin = self.cfg.quota.safety_margin.clamp(0.0, 1.0);
        ((self.limit(tier) as f64) * (1.0 - margin)).floor() as i64
    }

    pub fn window(&self, now: DateTime<Utc>) -> Result<QuotaWindowRow, MagpieError> {
        self.store.ensure_quota_window(now)
    }

    pub fn roll_if_due(&self, now: DateTime<Utc>) -> Result<bool, MagpieError> {
        self.store
            .roll_quota_window_if_due(now, self.cfg.quota.window_hours)
    }

    pub fn consumed(&self, now: DateTime<Utc>, tier: ModelTier) -> Result<i64, MagpieError> {
        Ok(self.window(now)?.used(tier))
    }

    pub fn remaining(&self, now: DateTime<Utc>, tier: ModelTier) -> Result<i64, MagpieError> {
        Ok((self.effective_limit(tier) - self.consumed(now, tier)?).max(0))
    }

    pub fn admits(&self, now: DateTime<Utc>, tier: ModelTier) -> Result<bool, MagpieError> {
        Ok(self.remaining(now, tier)? >= 1)
    }

    /// Decrement-then-dispatch: called before the executor starts.
    pub fn consume(&self, tier: ModelTier, n: i64, now: DateTime<Utc>) -> Result<(), MagpieError> {
        self.store.add_quota_consumption(tier, n, now)
    }

    /// Undo a consume when dispatch failed before the assistant ran.
    pub fn refund(&self, tier: ModelTier, n: i64, now: DateTime<Utc>) -> Result<(), MagpieError> {
        self.store.add_quota_consumption(tier, -n, now)
    }

    /// Operator-provided remaining count becomes authoritative: consumed is
    /// set so `remaining()` reproduces it.
    pub fn correct(
        &self,
        tier: ModelTier,
        remaining: i64,
        now: DateTime<Utc>,
    ) -> Result<(), MagpieError> {
        self.window(now)?;
        let consumed = (self.effective_limit(tier) - remaining).max(0);
        self.store.set_quota_consumed(tier, consumed, remaining, now)
    }

    pub fn window_ends_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, MagpieError> {
        Ok(self.window(now)?.window_started_at + Duration::hours(self.cfg.quota.window_hours))
    }

    pub fn window_hours_left(&self, now: DateTime<Utc>) -> Result<f64, MagpieError> {
        let ends = self.window_ends_at(now)?;
        Ok(((ends - now).num_seconds() as f64 / 3600.0).max(0.0))
    }

    /// Pull utilization from the usage endpoint and fold it in as a
    /// correction on every tier. Failures are returned for the caller to
    /// log; the next auto-sync retries.
    pub fn sync_from_upstream(&self, now: DateTime<Utc>) -> Result<(), MagpieError> {
        let snapshot = fetch_usage()?;
        let fraction_left = (1.0 - snapshot.session_pct / 100.0).clamp(0.0, 1.0);
        for tier in ALL_TIERS {
            let remaining = (self.effective_limit(tier) as f64 * fraction_left).round() as i64;
            self.correct(tier, remaining, now)?;
        }
        tracing::debug!(
            session_pct = snapshot.session_pct,
            week_all_pct = ?snapshot.week_all_pct,
            week_sonnet_pct = ?snapshot.week_sonnet_pct,
            "applied upstream quota correction"
        );
        Ok(())
    }
}

// --- Upstream usage endpoint ---
//
// The same data the assistant's /usage command displays, read from the
// OAuth usage endpoint with the token the assistant CLI maintains. The
// endpoint is undocumented; every failure degrades to "keep last known
// values".

const USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";
const BETA_HEADER: &str = "oauth-2025-04-20";
const USER_AGENT: &str = "claude-code/2.1.45";
const SYNC_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct UsageSnapshot {
    /// "Current session X%" utilization of the rolling window.
    pub session_pct: f64,
    pub week_all_pct: Option<f64>,
    pub week_sonnet_pct: Option<f64>,
}

fn credentials_file() -> Result<PathBuf, MagpieError> {
    let home = std::env::var("HOME")
        .map_err(|_| MagpieError::Upstream("HOME environment variable missing".into()))?;
    Ok(PathBuf::from(home).join(".claude").join(".credentials.json"))
}

fn read_oauth_token() -> Result<String, MagpieError> {
    let path = credentials_file()?;
    let content = std::fs::read_to_string(&path)
        .map_err(|e| MagpieError::Upstream(format!("{}: {}", path.display(), e)))?;
    let data: JsonValue = serde_json::from_str(&content)
        .map_err(|e| MagpieError::Upstream(format!("credentials parse: {}", e)))?;
    data.get("claudeAiOauth")
        .and_then(|o| o.get("accessToken"))
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| MagpieError::Upstream("no access token in credentials".into()))
}

fn pct(data: &JsonValue, key: &str) -> Option<f64> {
    data.get(key)?.get("utilization")?.as_f64()
}

pub fn fetch_usage() -> Result<UsageSnapshot, MagpieError> {
    let token = read_oauth_token()?;
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(SYNC_TIMEOUT_SECS))
        .build()
        .map_err(|e| MagpieError::Upstream(e.to_string()))?;
    let data: JsonValue = client
        .get(USAGE_URL)
        .header("Authorization", format!("Bearer {}", token))
        .header("anthropic-beta", BETA_HEADER)
        .header("Accept", "application/json")
        .header("User-Agent", USER_AGENT)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.json())
        .map_err(|e| MagpieError::Upstream(e.to_string()))?;

    Ok(UsageSnapshot {
        session_pct: pct(&data, "five_hour").unwrap_or(0.0),
        week_all_pct: pct(&data, "seven_day"),
        week_sonnet_pct: pct(&data, "seven_day_sonnet"),
    })
}

// --- CLI ---

pub fn run_quota_cli(store: &Store, cfg: &Config, cli: QuotaCli) -> Result<(), MagpieError> {
    let ledger = QuotaLedger::new(store, cfg);
    match cli.command {
        QuotaCommand::Show => show_quota(&ledger, cfg),
        QuotaCommand::Correct { model, remaining } => {
            let tier = ModelTier::parse(&model)?;
            let now = Utc::now();
            ledger.correct(tier, remaining, now)?;
            println!(
                "Correction applied: {} now has {} messages remaining for autonomous use.",
                tier.alias(),
                ledger.remaining(now, tier)?
            );
            Ok(())
        }
        QuotaCommand::Sync => {
            let now = Utc::now();
            match ledger.sync_from_upstream(now) {
                Ok(()) => show_quota(&ledger, cfg),
                Err(e) => {
                    eprintln!(
                        "Sync failed: {}. Check ~/.claude/.credentials.json and network access.",
                        e
                    );
                    Err(e)
                }
            }
        }
        QuotaCommand::History { days } => show_history(store, days),
    }
}

fn show_quota(ledger: &QuotaLedger, cfg: &Config) -> Result<(), MagpieError> {
    let now = Utc::now();
    ledger.roll_if_due(now)?;
    let window = ledger.window(now)?;
    let ends = ledger.window_ends_at(now)?;

    println!("{}", "Quota Status".bold());
    println!("{}", "=".repeat(60));
    println!(
        "Window: {} - {} ({:.1}h left)",
        window.window_started_at.format("%H:%M"),
        ends.format("%H:%M"),
        ledger.window_hours_left(now)?
    );
    if let Some(at) = window.last_correction_at {
        println!("Last correction: {}", at.format("%Y-%m-%d %H:%M"));
    }
    println!();
    println!("  {:<8}  {:>6}  {:>6}  {:>14}", "Model", "Limit", "Used", "Remaining");
    println!("  {}", "-".repeat(40));
    for tier in ALL_TIERS {
        let limit = ledger.limit(tier);
        let used = ledger.consumed(now, tier)?;
        let remaining = ledger.remaining(now, tier)?;
        let pct = if limit > 0 {
            remaining as f64 / limit as f64 * 100.0
        } else {
            0.0
        };
        println!(
            "  {:<8}  {:>6}  {:>6}  {:>7} ({:>3.0}%)",
            tier.alias(),
            limit,
            used,
            remaining,
            pct
        );
    }
    println!();
    let default_tier = cfg.assistant.default_tier()?;
    let reserved = ledger.limit(default_tier) - ledger.effective_limit(default_tier);
    println!(
        "Safety margin: {} messages reserved for interactive use ({})",
        reserved,
        default_tier.alias()
    );
    Ok(())
}

fn show_history(store: &Store, days: i64) -> Result<(), MagpieError> {
    let since = Utc::now() - Duration::days(days);
    let records = store.usage_since(since)?;

    if records.is_empty() {
        println!("No usage records in the last {} day(s).", days);
    } else {
        println!(
            "{:<20}  {:<8}  {:>8}  {:>8}  {:>9}  {:>4}",
            "Date", "Model", "Input", "Output", "Cost ($)", "Auto"
        );
        println!("{}", "-".repeat(68));
        let mut total_input = 0i64;
        let mut total_output = 0i64;
        let mut total_cost = 0.0f64;
        for r in &records {
            println!(
                "{:<20}  {:<8}  {:>8}  {:>8}  {:>9.4}  {:>4}",
                r.ts.format("%Y-%m-%d %H:%M:%S"),
                r.model,
                r.input_tokens,
                r.output_tokens,
                r.cost_usd,
                if r.autonomous { "Y" } else { "" }
            );
            total_input += r.input_tokens;
            total_output += r.output_tokens;
            total_cost += r.cost_usd;
        }
        println!("{}", "-".repeat(68));
        println!(
            "{:<20}  {:<8}  {:>8}  {:>8}  {:>9.4}",
            "TOTAL", "", total_input, total_output, total_cost
        );
    }

    let corrections = store.list_quota_corrections(5)?;
    if !corrections.is_empty() {
        println!();
        println!("Recent corrections:");
        for (model, remaining, at) in corrections {
            println!(
                "  {}  {} -> {} remaining",
                at.format("%Y-%m-%d %H:%M"),
                model,
                remaining
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Store, Config) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path());
        store.initialize().unwrap();
        (tmp, store, Config::default())
    }

    #[test]
    fn effective_limit_applies_safety_margin() {
        let (_tmp, store, cfg) = fixture();
        let ledger = QuotaLedger::new(&store, &cfg);
        // 225 * 0.85 = 191.25 -> 191
        assert_eq!(ledger.effective_limit(ModelTier::Sonnet), 191);
        assert_eq!(ledger.effective_limit(ModelTier::Haiku), 425);
        assert_eq!(ledger.effective_limit(ModelTier::Opus), 42);
    }

    #[test]
    fn consume_and_refund_are_monotonic_within_window() {
        let (_tmp, store, cfg) = fixture();
        let ledger = QuotaLedger::new(&store, &cfg);
        let now = Utc::now();
        assert_eq!(ledger.consumed(now, ModelTier::Sonnet).unwrap(), 0);
        ledger.consume(ModelTier::Sonnet, 3, now).unwrap();
        assert_eq!(ledger.consumed(now, ModelTier::Sonnet).unwrap(), 3);
        ledger.refund(ModelTier::Sonnet, 1, now).unwrap();
        assert_eq!(ledger.consumed(now, ModelTier::Sonnet).unwrap(), 2);
        // Refund clamps at zero rather than going negative.
        ledger.refund(ModelTier::Sonnet, 10, now).unwrap();
        assert_eq!(ledger.consumed(now, ModelTier::Sonnet).unwrap(), 0);
    }

    #[test]
    fn admits_respects_margin_boundary() {
        let (_tmp, store, cfg) = fixture();
        let ledger = QuotaLedger::new(&store, &cfg);
        let now = Utc::now();
        let eff = ledger.effective_limit(ModelTier::Sonnet);
        ledger.consume(ModelTier::Sonnet, eff - 1, now).unwrap();
        assert!(ledger.admits(now, ModelTier::Sonnet).unwrap());
        ledger.consume(ModelTier::Sonnet, 1, now).unwrap();
        assert!(!ledger.admits(now, ModelTier::Sonnet).unwrap());
        assert_eq!(ledger.remaining(now, ModelTier::Sonnet).unwrap(), 0);
    }

    #[test]
    fn window_rolls_by_whole_windows_and_resets_counts() {
        let (_tmp, store, cfg) = fixture();
        let ledger = QuotaLedger::new(&store, &cfg);
        let start = Utc::now() - Duration::hours(12);
        store.ensure_quota_window(start).unwrap();
        ledger.consume(ModelTier::Haiku, 7, start).unwrap();

        let now = Utc::now();
        assert!(ledger.roll_if_due(now).unwrap());
        let window = ledger.window(now).unwrap();
        assert_eq!(window.haiku_used, 0);
        // Advanced by two whole 5-hour windows: start + 10h, within 5h of now.
        let age = now - window.window_started_at;
        assert!(age >= Duration::hours(0) && age < Duration::hours(5));
        // Not due again immediately.
        assert!(!ledger.roll_if_due(now).unwrap());
    }

    #[test]
    fn correction_makes_remaining_authoritative() {
        let (_tmp, store, cfg) = fixture();
        let ledger = QuotaLedger::new(&store, &cfg);
        let now = Utc::now();
        ledger.consume(ModelTier::Sonnet, 100, now).unwrap();
        ledger.correct(ModelTier::Sonnet, 150, now).unwrap();
        assert_eq!(ledger.remaining(now, ModelTier::Sonnet).unwrap(), 150);
        let window = ledger.window(now).unwrap();
        assert!(window.last_correction_at.is_some());
        let corrections = store.list_quota_corrections(5).unwrap();
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].1, 150);
    }

    #[test]
    fn correction_beyond_limit_clamps_consumed_to_zero() {
        let (_tmp, store, cfg) = fixture();
        let ledger = QuotaLedger::new(&store, &cfg);
        let now = Utc::now();
        ledger.correct(ModelTier::Opus, 9999, now).unwrap();
        assert_eq!(ledger.consumed(now, ModelTier::Opus).unwrap(), 0);
    }
}
