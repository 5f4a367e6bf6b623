//! Six-gate scheduler scenarios, end to end against a real store with the
//! presence probe and the executor stubbed at their capability seams.

use chrono::{Duration, Local, Utc};
use std::cell::RefCell;
use std::rc::Rc;
use tempfile::TempDir;
use wise_magpie::core::config::Config;
use wise_magpie::core::error::MagpieError;
use wise_magpie::core::models::{
    ModelTier, NewTask, RequestedModel, Task, TaskSource, TaskStatus,
};
use wise_magpie::core::store::Store;
use wise_magpie::plugins::activity::{ActivityMonitor, UserPresenceProbe};
use wise_magpie::plugins::daemon::{Scheduler, SkipReason, TickOutcome};
use wise_magpie::plugins::executor::{ExecOutcome, FailureKind, TaskRunner};
use wise_magpie::plugins::quota::QuotaLedger;
use wise_magpie::plugins::schedule::{ActivityPattern, PatternCache};

struct FixedProbe(bool);

impl UserPresenceProbe for FixedProbe {
    fn user_active(&self) -> bool {
        self.0
    }
}

#[derive(Clone, Default)]
struct RunnerLog {
    calls: Rc<RefCell<Vec<(i64, ModelTier)>>>,
}

/// Stub executor: records the dispatch and reports success.
struct OkRunner {
    log: RunnerLog,
}

impl TaskRunner for OkRunner {
    fn run(
        &self,
        task: &Task,
        tier: ModelTier,
        _max_budget_usd: f64,
    ) -> Result<ExecOutcome, MagpieError> {
        self.log.calls.borrow_mut().push((task.id, tier));
        Ok(ExecOutcome::Ok {
            summary: "All changes committed.".to_string(),
            cost_usd: 0.05,
            input_tokens: 1200,
            output_tokens: 300,
            duration_secs: 2.5,
            branch_name: format!("assistant/task-{}", task.id),
        })
    }
}

struct FailRunner {
    log: RunnerLog,
}

impl TaskRunner for FailRunner {
    fn run(
        &self,
        task: &Task,
        tier: ModelTier,
        _max_budget_usd: f64,
    ) -> Result<ExecOutcome, MagpieError> {
        self.log.calls.borrow_mut().push((task.id, tier));
        Ok(ExecOutcome::Failed {
            kind: FailureKind::NonZeroExit,
            detail: "assistant exited 1".to_string(),
            branch_name: None,
        })
    }
}

struct Fixture {
    _tmp: TempDir,
    store: Store,
    cfg: Config,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().expect("tempdir");
    let store = Store::open(tmp.path());
    store.initialize().unwrap();
    Fixture {
        _tmp: tmp,
        store,
        cfg: Config::default(),
    }
}

fn add_pending(store: &Store, title: &str, priority: f64) -> Task {
    store
        .create_task(
            &NewTask {
                title: title.to_string(),
                description: String::new(),
                source: TaskSource::Manual,
                source_ref: None,
                requested_model: RequestedModel::Auto,
                priority,
                work_dir: ".".to_string(),
            },
            Utc::now(),
        )
        .unwrap()
}

fn idle_for(store: &Store, minutes: i64) {
    store
        .record_usage_sample(Utc::now() - Duration::minutes(minutes), true)
        .unwrap();
}

/// A pattern that trips neither the return check (never >= 0.5) nor the
/// long-idle upgrade (never < 0.3).
fn neutral_pattern() -> ActivityPattern {
    ActivityPattern::uniform(0.4)
}

fn scheduler<'a>(
    fx: &'a Fixture,
    active: bool,
    pattern: ActivityPattern,
    runner: Box<dyn TaskRunner + 'a>,
) -> Scheduler<'a> {
    Scheduler::new(
        &fx.cfg,
        &fx.store,
        ActivityMonitor::new(Box::new(FixedProbe(active))),
        PatternCache::pinned(pattern),
        runner,
    )
}

#[test]
fn happy_path_dispatches_sonnet_and_awaits_review() {
    let fx = fixture();
    let now = Utc::now();
    idle_for(&fx.store, 31);
    let task = add_pending(&fx.store, "Fix login bug", 65.0);

    // Window is fresh with sonnet at 10 of 225 consumed.
    fx.store.ensure_quota_window(now).unwrap();
    fx.store.add_quota_consumption(ModelTier::Sonnet, 10, now).unwrap();

    let log = RunnerLog::default();
    let mut sched = scheduler(
        &fx,
        false,
        neutral_pattern(),
        Box::new(OkRunner { log: log.clone() }),
    );
    let outcome = sched.tick(now, Local::now()).unwrap();

    assert_eq!(
        outcome,
        TickOutcome::Completed {
            task_id: task.id,
            tier: ModelTier::Sonnet
        }
    );
    assert_eq!(*log.calls.borrow(), vec![(task.id, ModelTier::Sonnet)]);

    let task = fx.store.get_task(task.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::AwaitingReview);
    assert_eq!(task.model, "sonnet");
    assert_eq!(
        task.branch_name.as_deref(),
        Some(format!("assistant/task-{}", task.id).as_str())
    );
    assert_eq!(task.result_summary, "All changes committed.");
    assert!((task.actual_cost_usd - 0.05).abs() < 1e-9);

    // Consumed 10 -> 11, and the spend was recorded against the budget.
    let window = fx.store.ensure_quota_window(now).unwrap();
    assert_eq!(window.sonnet_used, 11);
    let usage = fx.store.usage_since(now - Duration::minutes(1)).unwrap();
    assert_eq!(usage.len(), 1);
    assert!(usage[0].autonomous);
    assert_eq!(usage[0].task_id, Some(task.id));
}

#[test]
fn gate1_user_active_skips() {
    let fx = fixture();
    idle_for(&fx.store, 120);
    add_pending(&fx.store, "Fix login bug", 65.0);

    let log = RunnerLog::default();
    let mut sched = scheduler(
        &fx,
        true,
        neutral_pattern(),
        Box::new(OkRunner { log: log.clone() }),
    );
    let outcome = sched.tick(Utc::now(), Local::now()).unwrap();
    assert_eq!(outcome, TickOutcome::Skipped(SkipReason::UserActive));
    assert!(log.calls.borrow().is_empty());
}

#[test]
fn gate2_idle_too_short_skips() {
    let fx = fixture();
    idle_for(&fx.store, 10); // threshold is 30
    add_pending(&fx.store, "Fix login bug", 65.0);

    let mut sched = scheduler(
        &fx,
        false,
        neutral_pattern(),
        Box::new(OkRunner {
            log: RunnerLog::default(),
        }),
    );
    let outcome = sched.tick(Utc::now(), Local::now()).unwrap();
    assert!(matches!(
        outcome,
        TickOutcome::Skipped(SkipReason::IdleTooShort { .. })
    ));
}

#[test]
fn gate3_return_imminent_leaves_task_and_quota_untouched() {
    let fx = fixture();
    let now = Utc::now();
    idle_for(&fx.store, 31);
    let task = add_pending(&fx.store, "Fix login bug", 65.0);
    fx.store.ensure_quota_window(now).unwrap();
    fx.store.add_quota_consumption(ModelTier::Sonnet, 10, now).unwrap();

    // Every bucket active: predicted return in 0 minutes, inside the
    // 15-minute buffer.
    let log = RunnerLog::default();
    let mut sched = scheduler(
        &fx,
        false,
        ActivityPattern::uniform(0.9),
        Box::new(OkRunner { log: log.clone() }),
    );
    let outcome = sched.tick(now, Local::now()).unwrap();

    assert!(matches!(
        outcome,
        TickOutcome::Skipped(SkipReason::ReturnImminent { .. })
    ));
    assert!(log.calls.borrow().is_empty());
    let task = fx.store.get_task(task.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(
        fx.store.ensure_quota_window(now).unwrap().sonnet_used,
        10,
        "consumed must be unchanged"
    );
}

#[test]
fn gate4_budget_exhausted_skips() {
    let fx = fixture();
    let now = Utc::now();
    idle_for(&fx.store, 31);
    add_pending(&fx.store, "Fix login bug", 65.0);
    // Burn the whole daily budget.
    fx.store
        .insert_usage(now, "sonnet", 0, 0, 10.0, None, true)
        .unwrap();

    let mut sched = scheduler(
        &fx,
        false,
        neutral_pattern(),
        Box::new(OkRunner {
            log: RunnerLog::default(),
        }),
    );
    let outcome = sched.tick(now, Local::now()).unwrap();
    assert_eq!(outcome, TickOutcome::Skipped(SkipReason::BudgetExhausted));
}

#[test]
fn gate5_no_pending_task_skips() {
    let fx = fixture();
    idle_for(&fx.store, 31);
    let mut sched = scheduler(
        &fx,
        false,
        neutral_pattern(),
        Box::new(OkRunner {
            log: RunnerLog::default(),
        }),
    );
    let outcome = sched.tick(Utc::now(), Local::now()).unwrap();
    assert_eq!(outcome, TickOutcome::Skipped(SkipReason::NoPendingTask));
}

#[test]
fn downgrade_dispatches_haiku_when_sonnet_exhausted() {
    let fx = fixture();
    let now = Utc::now();
    idle_for(&fx.store, 31);
    let task = add_pending(&fx.store, "Fix login bug", 65.0);

    let ledger = QuotaLedger::new(&fx.store, &fx.cfg);
    ledger.correct(ModelTier::Sonnet, 0, now).unwrap();

    let log = RunnerLog::default();
    let mut sched = scheduler(
        &fx,
        false,
        neutral_pattern(),
        Box::new(OkRunner { log: log.clone() }),
    );
    let outcome = sched.tick(now, Local::now()).unwrap();

    assert_eq!(
        outcome,
        TickOutcome::Completed {
            task_id: task.id,
            tier: ModelTier::Haiku
        }
    );
    assert_eq!(*log.calls.borrow(), vec![(task.id, ModelTier::Haiku)]);
    assert_eq!(fx.store.ensure_quota_window(now).unwrap().haiku_used, 1);
}

#[test]
fn quota_headroom_upgrade_dispatches_opus() {
    let fx = fixture();
    let now = Utc::now();
    idle_for(&fx.store, 31);
    let task = add_pending(&fx.store, "Fix login bug", 65.0);

    // One hour left in the window, sonnet at 50% of its limit remaining.
    fx.store
        .ensure_quota_window(now - Duration::hours(4))
        .unwrap();
    let ledger = QuotaLedger::new(&fx.store, &fx.cfg);
    ledger.correct(ModelTier::Sonnet, 112, now).unwrap();

    let log = RunnerLog::default();
    let mut sched = scheduler(
        &fx,
        false,
        neutral_pattern(),
        Box::new(OkRunner { log: log.clone() }),
    );
    let outcome = sched.tick(now, Local::now()).unwrap();

    assert_eq!(
        outcome,
        TickOutcome::Completed {
            task_id: task.id,
            tier: ModelTier::Opus
        }
    );
    assert_eq!(fx.store.ensure_quota_window(now).unwrap().opus_used, 1);
}

#[test]
fn no_admitted_tier_releases_task() {
    let fx = fixture();
    let now = Utc::now();
    idle_for(&fx.store, 31);
    let task = add_pending(&fx.store, "Fix login bug", 65.0);

    let ledger = QuotaLedger::new(&fx.store, &fx.cfg);
    for tier in [ModelTier::Opus, ModelTier::Sonnet, ModelTier::Haiku] {
        ledger.correct(tier, 0, now).unwrap();
    }

    let log = RunnerLog::default();
    let mut sched = scheduler(
        &fx,
        false,
        neutral_pattern(),
        Box::new(OkRunner { log: log.clone() }),
    );
    let outcome = sched.tick(now, Local::now()).unwrap();

    assert_eq!(outcome, TickOutcome::Skipped(SkipReason::QuotaExhausted));
    assert!(log.calls.borrow().is_empty());
    let task = fx.store.get_task(task.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending, "task returned to queue");
}

#[test]
fn failed_execution_refunds_quota_and_marks_failed() {
    let fx = fixture();
    let now = Utc::now();
    idle_for(&fx.store, 31);
    let task = add_pending(&fx.store, "Fix login bug", 65.0);
    fx.store.ensure_quota_window(now).unwrap();
    fx.store.add_quota_consumption(ModelTier::Sonnet, 10, now).unwrap();

    let log = RunnerLog::default();
    let mut sched = scheduler(
        &fx,
        false,
        neutral_pattern(),
        Box::new(FailRunner { log: log.clone() }),
    );
    let outcome = sched.tick(now, Local::now()).unwrap();

    assert_eq!(
        outcome,
        TickOutcome::Failed {
            task_id: task.id,
            tier: ModelTier::Sonnet
        }
    );
    let task = fx.store.get_task(task.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.result_summary.contains("non_zero_exit"));
    assert!(task.branch_name.is_none());
    // Refunded: back to the pre-dispatch count.
    assert_eq!(fx.store.ensure_quota_window(now).unwrap().sonnet_used, 10);
    // No spend recorded for the failure.
    assert!(fx
        .store
        .usage_since(now - Duration::minutes(1))
        .unwrap()
        .is_empty());
}

#[test]
fn crash_recovery_sweep_makes_orphan_claimable() {
    let fx = fixture();
    let now = Utc::now();
    idle_for(&fx.store, 31);
    add_pending(&fx.store, "Fix login bug", 65.0);

    // Orphaned `running` row from a dead daemon.
    let orphan = fx.store.claim_next_pending(now).unwrap().unwrap();
    assert_eq!(fx.store.sweep_orphan_running().unwrap(), 1);

    let log = RunnerLog::default();
    let mut sched = scheduler(
        &fx,
        false,
        neutral_pattern(),
        Box::new(OkRunner { log: log.clone() }),
    );
    let outcome = sched.tick(now, Local::now()).unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Completed {
            task_id: orphan.id,
            tier: ModelTier::Sonnet
        }
    );
}

#[test]
fn completed_auto_template_task_stamps_its_run() {
    let fx = fixture();
    let now = Utc::now();
    idle_for(&fx.store, 31);
    let task = fx
        .store
        .create_task(
            &NewTask {
                title: "Run test suite".to_string(),
                description: String::new(),
                source: TaskSource::AutoTemplate,
                source_ref: Some(format!("run_tests:{}", now.date_naive())),
                requested_model: RequestedModel::Auto,
                priority: 25.0,
                work_dir: ".".to_string(),
            },
            now,
        )
        .unwrap();

    let log = RunnerLog::default();
    let mut sched = scheduler(
        &fx,
        false,
        neutral_pattern(),
        Box::new(OkRunner { log: log.clone() }),
    );
    let outcome = sched.tick(now, Local::now()).unwrap();
    assert!(matches!(outcome, TickOutcome::Completed { task_id, .. } if task_id == task.id));
    assert!(fx
        .store
        .template_last_completed("run_tests")
        .unwrap()
        .is_some());
}
