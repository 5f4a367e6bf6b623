//! Weekly activity pattern learning and idle prediction.
//!
//! Presence samples are folded into a per-(weekday, hour) probability grid
//! over the retention window, Laplace-smoothed so sparse buckets stay near
//! 0.5 instead of swinging to the extremes. The predictor walks the grid in
//! 15-minute steps to answer two questions the scheduler asks every tick:
//! when is the operator likely back, and how long is the idle stretch ahead.

use crate::cli::{ScheduleCli, ScheduleCommand};
use crate::core::config::Config;
use crate::core::error::MagpieError;
use crate::core::models::UsageSample;
use crate::core::store::Store;
use chrono::{DateTime, Datelike, Duration, Local, Timelike, Utc};
use colored::Colorize;
use std::cell::RefCell;

/// Days of samples the pattern learns from.
pub const RETENTION_DAYS: i64 = 14;
/// Probability at or above which a bucket counts as "operator active".
pub const ACTIVE_PROBABILITY_THRESHOLD: f64 = 0.5;
/// Probability below which a bucket counts as "operator away".
pub const IDLE_PROBABILITY_THRESHOLD: f64 = 0.3;
/// Grid walk resolution.
pub const STEP_MINUTES: i64 = 15;
/// How far ahead the return search looks.
pub const RETURN_SEARCH_HOURS: i64 = 8;

/// Learned weekly heatmap: probability of the operator being active per
/// (weekday 0–6 Monday-based, hour 0–23).
#[derive(Debug, Clone)]
pub struct ActivityPattern {
    prob: [[f64; 24]; 7],
    samples: [[u32; 24]; 7],
}

impl ActivityPattern {
    /// Laplace-smoothed (α = 1) mean of `active` flags per bucket; an
    /// unobserved bucket sits at 0.5.
    pub fn learn(samples: &[UsageSample]) -> ActivityPattern {
        let mut active = [[0u32; 24]; 7];
        let mut total = [[0u32; 24]; 7];
        for sample in samples {
            let local = sample.ts.with_timezone(&Local);
            let dow = local.weekday().num_days_from_monday() as usize;
            let hour = local.hour() as usize;
            total[dow][hour] += 1;
            if sample.active {
                active[dow][hour] += 1;
            }
        }
        let mut prob = [[0.5f64; 24]; 7];
        for dow in 0..7 {
            for hour in 0..24 {
                prob[dow][hour] =
                    (active[dow][hour] as f64 + 1.0) / (total[dow][hour] as f64 + 2.0);
            }
        }
        ActivityPattern {
            prob,
            samples: total,
        }
    }

    /// Uniform pattern; useful as a stand-in before any samples exist.
    pub fn uniform(p: f64) -> ActivityPattern {
        ActivityPattern {
            prob: [[p; 24]; 7],
            samples: [[0; 24]; 7],
        }
    }

    pub fn probability(&self, weekday: usize, hour: usize) -> f64 {
        self.prob[weekday % 7][hour % 24]
    }

    pub fn probability_at(&self, t: DateTime<Local>) -> f64 {
        self.probability(t.weekday().num_days_from_monday() as usize, t.hour() as usize)
    }

    pub fn sample_count(&self, weekday: usize, hour: usize) -> u32 {
        self.samples[weekday % 7][hour % 24]
    }
}

/// Smallest Δ (in minutes, 15-minute steps up to 8 hours) until the pattern
/// says the operator is likely active; `None` means no return in sight.
pub fn minutes_until_likely_return(
    pattern: &ActivityPattern,
    now: DateTime<Local>,
) -> Option<i64> {
    let steps = RETURN_SEARCH_HOURS * 60 / STEP_MINUTES;
    for step in 0..=steps {
        let delta = step * STEP_MINUTES;
        if pattern.probability_at(now + Duration::minutes(delta)) >= ACTIVE_PROBABILITY_THRESHOLD {
            return Some(delta);
        }
    }
    None
}

/// Longest contiguous run of 15-minute buckets under the idle threshold
/// within the horizon, in minutes.
pub fn longest_predicted_idle_within(
    pattern: &ActivityPattern,
    now: DateTime<Local>,
    horizon_hours: i64,
) -> i64 {
    let steps = horizon_hours * 60 / STEP_MINUTES;
    let mut best = 0i64;
    let mut run = 0i64;
    for step in 0..steps {
        let t = now + Duration::minutes(step * STEP_MINUTES);
        if pattern.probability_at(t) < IDLE_PROBABILITY_THRESHOLD {
            run += STEP_MINUTES;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}

#[derive(Debug, Clone)]
pub struct IdleWindow {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub confidence: f64,
}

impl IdleWindow {
    pub fn duration_hours(&self) -> f64 {
        (self.end - self.start).num_minutes() as f64 / 60.0
    }
}

/// Contiguous idle stretches within the horizon, for the `schedule predict`
/// display.
pub fn predict_idle_windows(
    pattern: &ActivityPattern,
    now: DateTime<Local>,
    horizon_hours: i64,
) -> Vec<IdleWindow> {
    let steps = horizon_hours * 60 / STEP_MINUTES;
    let mut windows = Vec::new();
    let mut open: Option<(DateTime<Local>, Vec<f64>)> = None;
    for step in 0..steps {
        let t = now + Duration::minutes(step * STEP_MINUTES);
        let p = pattern.probability_at(t);
        if p < IDLE_PROBABILITY_THRESHOLD {
            open.get_or_insert_with(|| (t, Vec::new())).1.push(1.0 - p);
        } else if let Some((start, confidences)) = open.take() {
            let end = t;
            windows.push(IdleWindow {
                start,
                end,
                confidence: confidences.iter().sum::<f64>() / confidences.len() as f64,
            });
        }
    }
    if let Some((start, confidences)) = open.take() {
        windows.push(IdleWindow {
            start,
            end: now + Duration::minutes(steps * STEP_MINUTES),
            confidence: confidences.iter().sum::<f64>() / confidences.len() as f64,
        });
    }
    windows
}

/// Lazily learned, per-process cached pattern. The scheduler refreshes it
/// when stale rather than on every sample.
pub struct PatternCache {
    inner: RefCell<Option<(DateTime<Utc>, ActivityPattern)>>,
    fixed: Option<ActivityPattern>,
}

const CACHE_TTL_MINUTES: i64 = 15;

impl PatternCache {
    pub fn new() -> PatternCache {
        PatternCache {
            inner: RefCell::new(None),
            fixed: None,
        }
    }

    /// A cache pinned to one pattern; prediction-only paths and tests use
    /// this to bypass sample learning.
    pub fn pinned(pattern: ActivityPattern) -> PatternCache {
        PatternCache {
            inner: RefCell::new(None),
            fixed: Some(pattern),
        }
    }

    pub fn get(&self, store: &Store, now: DateTime<Utc>) -> Result<ActivityPattern, MagpieError> {
        if let Some(p) = &self.fixed {
            return Ok(p.clone());
        }
        if let Some((at, pattern)) = self.inner.borrow().as_ref() {
            if now - *at < Duration::minutes(CACHE_TTL_MINUTES) {
                return Ok(pattern.clone());
            }
        }
        let samples = store.samples_since(now - Duration::days(RETENTION_DAYS))?;
        let pattern = ActivityPattern::learn(&samples);
        *self.inner.borrow_mut() = Some((now, pattern.clone()));
        Ok(pattern)
    }
}

impl Default for PatternCache {
    fn default() -> Self {
        PatternCache::new()
    }
}

// --- CLI ---

pub fn run_schedule_cli(store: &Store, cfg: &Config, cli: ScheduleCli) -> Result<(), MagpieError> {
    match cli.command {
        ScheduleCommand::Show => show_patterns(store),
        ScheduleCommand::Predict { hours } => predict_idle(store, cfg, hours),
    }
}

/// 7x24 terminal heatmap of the learned pattern.
fn show_patterns(store: &Store) -> Result<(), MagpieError> {
    let now = Utc::now();
    let samples = store.samples_since(now - Duration::days(RETENTION_DAYS))?;
    let pattern = ActivityPattern::learn(&samples);

    let day_names = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    let header: String = (0..24).map(|h| format!("{:>3}", h)).collect();
    println!("     {}", header);

    for (dow, name) in day_names.iter().enumerate() {
        let mut row = String::new();
        for hour in 0..24 {
            let glyph = if pattern.sample_count(dow, hour) == 0 {
                "  ·"
            } else {
                let p = pattern.probability(dow, hour);
                if p < 0.25 {
                    "  ░"
                } else if p < 0.50 {
                    "  ▒"
                } else if p < 0.75 {
                    "  ▓"
                } else {
                    "  █"
                }
            };
            row.push_str(glyph);
        }
        println!("{:>4} {}", name, row);
    }

    println!();
    println!("Legend: · no data  ░ <25%  ▒ <50%  ▓ <75%  █ >=75%");
    Ok(())
}

/// Idle windows ahead plus an estimate of the quota wasted if nothing is
/// scheduled into them.
fn predict_idle(store: &Store, cfg: &Config, hours: i64) -> Result<(), MagpieError> {
    let now_utc = Utc::now();
    let now = Local::now();
    let samples = store.samples_since(now_utc - Duration::days(RETENTION_DAYS))?;
    let pattern = ActivityPattern::learn(&samples);
    let windows = predict_idle_windows(&pattern, now, hours);

    println!("Idle window predictions (next {}h):", hours);
    println!();

    if windows.is_empty() {
        println!("  No idle windows predicted - operator appears continuously active.");
        return Ok(());
    }

    for (i, w) in windows.iter().enumerate() {
        println!(
            "  {}. {} - {}  ({:.1}h, confidence {:.0}%)",
            i + 1,
            w.start.format("%a %H:%M"),
            w.end.format("%a %H:%M"),
            w.duration_hours(),
            w.confidence * 100.0
        );
    }

    let idle_hours: f64 = windows.iter().map(|w| w.duration_hours()).sum();
    let tier = cfg.assistant.default_tier()?;
    let messages_per_hour =
        cfg.quota.limits.limit(tier) as f64 / cfg.quota.window_hours.max(1) as f64;
    let wasted_messages = (idle_hours * messages_per_hour) as i64;
    let wasted_value = wasted_messages as f64 * tier.avg_message_cost();

    println!();
    println!("Estimated waste if no autonomous work is scheduled:");
    println!("  Idle hours:       {:.1}", idle_hours);
    println!("  Wasted messages:  ~{}", wasted_messages);
    println!("  Wasted value:     ~${:.2}", wasted_value);

    match minutes_until_likely_return(&pattern, now) {
        Some(mins) => {
            let at = now + Duration::minutes(mins);
            println!();
            println!(
                "Predicted next return: {} ({})",
                at.format("%a %H:%M"),
                format!("in {}m", mins).bright_cyan()
            );
        }
        None => {
            println!();
            println!("Predicted next return: none within {}h", RETURN_SEARCH_HOURS);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(ts: DateTime<Utc>, active: bool) -> UsageSample {
        UsageSample { ts, active }
    }

    #[test]
    fn laplace_smoothing_on_empty_bucket() {
        let pattern = ActivityPattern::learn(&[]);
        for dow in 0..7 {
            for hour in 0..24 {
                assert!((pattern.probability(dow, hour) - 0.5).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn bucket_probability_is_smoothed_mean() {
        // Fixed local hour in mid-winter so week offsets cross no DST edge.
        let base = Local.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(); // a Monday
        let dow = base.weekday().num_days_from_monday() as usize;
        let hour = base.hour() as usize;

        let mut samples = Vec::new();
        for day in 0..3 {
            let ts = (base + Duration::days(day * 7)).with_timezone(&Utc);
            samples.push(sample(ts, true));
        }
        samples.push(sample(base.with_timezone(&Utc) + Duration::minutes(10), false));

        let pattern = ActivityPattern::learn(&samples);
        // 3 active of 4 samples, smoothed: (3+1)/(4+2)
        assert!((pattern.probability(dow, hour) - 4.0 / 6.0).abs() < 1e-9);
        assert_eq!(pattern.sample_count(dow, hour), 4);
    }

    #[test]
    fn return_search_finds_nothing_in_flat_idle_pattern() {
        let pattern = ActivityPattern::uniform(0.1);
        let now = Local::now();
        assert_eq!(minutes_until_likely_return(&pattern, now), None);
    }

    #[test]
    fn return_search_reports_zero_when_currently_active_bucket() {
        let pattern = ActivityPattern::uniform(0.9);
        let now = Local::now();
        assert_eq!(minutes_until_likely_return(&pattern, now), Some(0));
    }

    #[test]
    fn longest_idle_spans_whole_horizon_when_flat() {
        let pattern = ActivityPattern::uniform(0.1);
        let now = Local::now();
        assert_eq!(longest_predicted_idle_within(&pattern, now, 8), 8 * 60);
    }

    #[test]
    fn longest_idle_zero_when_always_active() {
        let pattern = ActivityPattern::uniform(0.9);
        let now = Local::now();
        assert_eq!(longest_predicted_idle_within(&pattern, now, 8), 0);
    }

    #[test]
    fn idle_run_broken_by_active_bucket() {
        // Active exactly during one hour ~2h from now; the longest idle run
        // is whichever side of that hour is larger.
        let now = Local::now();
        let active_at = now + Duration::hours(2);
        let mut pattern = ActivityPattern::uniform(0.1);
        let dow = active_at.weekday().num_days_from_monday() as usize;
        let hour = active_at.hour() as usize;
        pattern.prob[dow][hour] = 0.9;

        let longest = longest_predicted_idle_within(&pattern, now, 6);
        assert!(longest < 6 * 60);
        assert!(longest >= 3 * 60, "longest={}", longest);
    }

    #[test]
    fn idle_windows_group_contiguous_steps() {
        let pattern = ActivityPattern::uniform(0.1);
        let now = Local::now();
        let windows = predict_idle_windows(&pattern, now, 4);
        assert_eq!(windows.len(), 1);
        assert!((windows[0].duration_hours() - 4.0).abs() < 1e-9);
        assert!(windows[0].confidence > 0.85);
    }
}
