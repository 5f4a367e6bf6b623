//! Daily and per-task USD budget accounting.
//!
//! Autonomous spend is summed per UTC day from the usage log; a task is
//! admitted only when its estimate fits both the per-task cap and what is
//! left of the daily cap.

use crate::core::config::Config;
use crate::core::error::MagpieError;
use crate::core::models::ModelTier;
use crate::core::store::Store;
use chrono::{DateTime, Utc};

pub struct BudgetBook<'a> {
    store: &'a Store,
    cfg: &'a Config,
}

impl<'a> BudgetBook<'a> {
    pub fn new(store: &'a Store, cfg: &'a Config) -> BudgetBook<'a> {
        BudgetBook { store, cfg }
    }

    pub fn daily_spent(&self, now: DateTime<Utc>) -> Result<f64, MagpieError> {
        self.store.daily_autonomous_cost(now.date_naive())
    }

    pub fn admits_task(&self, est_usd: f64, now: DateTime<Utc>) -> Result<bool, MagpieError> {
        if est_usd > self.cfg.budget.max_task_usd {
            return Ok(false);
        }
        Ok(self.daily_spent(now)? + est_usd <= self.cfg.budget.max_daily_usd)
    }

    /// Budget handed to a single execution: the per-task cap, shrunk to
    /// whatever is left of today's allowance.
    pub fn task_budget(&self, now: DateTime<Utc>) -> Result<f64, MagpieError> {
        let daily_remaining = (self.cfg.budget.max_daily_usd - self.daily_spent(now)?).max(0.0);
        Ok(self.cfg.budget.max_task_usd.min(daily_remaining))
    }

    /// Record actual spend after a dispatch.
    pub fn record(
        &self,
        now: DateTime<Utc>,
        tier: ModelTier,
        input_tokens: i64,
        output_tokens: i64,
        cost_usd: f64,
        task_id: Option<i64>,
    ) -> Result<(), MagpieError> {
        self.store.insert_usage(
            now,
            tier.alias(),
            input_tokens,
            output_tokens,
            cost_usd,
            task_id,
            true,
        )?;
        Ok(())
    }
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
    fn admits_until_daily_cap() {
        let (_tmp, store, cfg) = fixture();
        let book = BudgetBook::new(&store, &cfg);
        let now = Utc::now();

        assert!(book.admits_task(1.0, now).unwrap());
        // Spend 9.50 of the 10.00 daily cap.
        book.record(now, ModelTier::Sonnet, 100_000, 20_000, 9.5, Some(1))
            .unwrap();
        assert!((book.daily_spent(now).unwrap() - 9.5).abs() < 1e-9);
        assert!(book.admits_task(0.5, now).unwrap());
        assert!(!book.admits_task(0.6, now).unwrap());
    }

    #[test]
    fn per_task_cap_applies_regardless_of_daily_headroom() {
        let (_tmp, store, cfg) = fixture();
        let book = BudgetBook::new(&store, &cfg);
        let now = Utc::now();
        // max_task_usd default is 2.0
        assert!(!book.admits_task(2.5, now).unwrap());
    }

    #[test]
    fn task_budget_shrinks_with_daily_spend() {
        let (_tmp, store, cfg) = fixture();
        let book = BudgetBook::new(&store, &cfg);
        let now = Utc::now();
        assert!((book.task_budget(now).unwrap() - 2.0).abs() < 1e-9);
        book.record(now, ModelTier::Opus, 0, 0, 9.2, None).unwrap();
        assert!((book.task_budget(now).unwrap() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn interactive_usage_not_counted() {
        let (_tmp, store, cfg) = fixture();
        let now = Utc::now();
        store
            .insert_usage(now, "sonnet", 1000, 200, 5.0, None, false)
            .unwrap();
        let book = BudgetBook::new(&store, &cfg);
        assert_eq!(book.daily_spent(now).unwrap(), 0.0);
    }
}
