//! The daemon: singleton lifecycle, signal handling, and the six-gate
//! scheduler loop.
//!
//! One long-lived process per config directory, enforced by an exclusive
//! file lock on the pid file. Each tick samples presence, rolls the quota
//! window, walks the admission gates in order, and dispatches at most one
//! task synchronously. Every error inside a tick is caught at the loop
//! boundary; only `Fatal` aborts the daemon.

use crate::core::config::{self, Config};
use crate::core::error::MagpieError;
use crate::core::models::{ModelTier, TaskSource, TaskStatus, ALL_TIERS};
use crate::core::store::Store;
use crate::plugins::activity::{ActivityMonitor, ProcessScanProbe};
use crate::plugins::budget::BudgetBook;
use crate::plugins::executor::{AssistantExecutor, ExecOutcome, TaskRunner};
use crate::plugins::model_policy::{select_tier, TierAdjustment};
use crate::plugins::quota::QuotaLedger;
use crate::plugins::schedule::{minutes_until_likely_return, PatternCache};
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use colored::Colorize;
use fs2::FileExt;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

/// Poll-sleep granularity; bounds how long a shutdown signal waits between
/// ticks. A running task is never interrupted (the executor's own 30-minute
/// subprocess cap bounds that wait).
const SHUTDOWN_SLEEP_SLICE: Duration = Duration::from_millis(250);
/// Samples older than this are dropped; comfortably past the learning
/// retention window.
const SAMPLE_PRUNE_DAYS: i64 = 30;
/// Marks the re-exec'd background child so logging skips the stderr tee.
const DAEMONIZED_ENV: &str = "WISE_MAGPIE_DAEMONIZED";

// --- Shutdown signal flag ---

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

extern "C" fn handle_shutdown(_sig: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<(), MagpieError> {
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGTERM, Signal::SIGINT] {
        unsafe {
            sigaction(sig, &action)
                .map_err(|e| MagpieError::Fatal(format!("sigaction({:?}): {}", sig, e)))?;
        }
    }
    Ok(())
}

// --- Singleton lock ---

/// Exclusive advisory lock on the pid file. The lock dies with its owner,
/// so stale pid files from crashed daemons reclaim automatically.
pub struct DaemonLock {
    _file: File,
    path: PathBuf,
}

impl DaemonLock {
    pub fn acquire(config_root: &Path) -> Result<DaemonLock, MagpieError> {
        std::fs::create_dir_all(config_root)?;
        let path = config::pid_path(config_root);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            let pid = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
                .unwrap_or(0);
            return Err(MagpieError::AlreadyRunning(pid));
        }
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(DaemonLock { _file: file, path })
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Pid of the live daemon for this config dir, if any.
pub fn live_daemon_pid(config_root: &Path) -> Option<u32> {
    let pid: u32 = std::fs::read_to_string(config::pid_path(config_root))
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if pid == 0 {
        return None;
    }
    // Signal 0: existence check only.
    kill(Pid::from_raw(pid as i32), None).ok()?;
    Some(pid)
}

// --- Logging ---

struct TeeWriter {
    file: Arc<Mutex<File>>,
    stderr: bool,
}

impl io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut f) = self.file.lock() {
            let _ = f.write_all(buf);
        }
        if self.stderr {
            let _ = io::stderr().write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Ok(mut f) = self.file.lock() {
            let _ = f.flush();
        }
        Ok(())
    }
}

fn init_logging(config_root: &Path, tee_stderr: bool) -> Result<(), MagpieError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(config::log_path(config_root))?;
    let file = Arc::new(Mutex::new(file));
    let make_writer = BoxMakeWriter::new(move || TeeWriter {
        file: file.clone(),
        stderr: tee_stderr,
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}

// --- Tick outcome ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UserActive,
    IdleTooShort { idle_minutes: i64 },
    ReturnImminent { minutes: i64 },
    BudgetExhausted,
    NoPendingTask,
    QuotaExhausted,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::UserActive => write!(f, "user_active"),
            SkipReason::IdleTooShort { idle_minutes } => {
                write!(f, "idle_too_short ({}m)", idle_minutes)
            }
            SkipReason::ReturnImminent { minutes } => {
                write!(f, "return_imminent ({}m)", minutes)
            }
            SkipReason::BudgetExhausted => write!(f, "budget_exhausted"),
            SkipReason::NoPendingTask => write!(f, "no_pending_task"),
            SkipReason::QuotaExhausted => write!(f, "quota_exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Completed { task_id: i64, tier: ModelTier },
    Failed { task_id: i64, tier: ModelTier },
}

// --- Scheduler ---

pub struct Scheduler<'a> {
    cfg: &'a Config,
    store: &'a Store,
    monitor: ActivityMonitor,
    pattern_cache: PatternCache,
    runner: Box<dyn TaskRunner + 'a>,
    last_sync_at: Option<DateTime<Utc>>,
    last_prune_at: Option<DateTime<Utc>>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        cfg: &'a Config,
        store: &'a Store,
        monitor: ActivityMonitor,
        pattern_cache: PatternCache,
        runner: Box<dyn TaskRunner + 'a>,
    ) -> Scheduler<'a> {
        Scheduler {
            cfg,
            store,
            monitor,
            pattern_cache,
            runner,
            last_sync_at: None,
            last_prune_at: None,
        }
    }

    /// One pass through the six admission gates, dispatching at most one
    /// task. State observations happen after the window roll and before
    /// dispatch.
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        now_local: DateTime<Local>,
    ) -> Result<TickOutcome, MagpieError> {
        self.monitor.begin_tick();
        let active = self.monitor.record_sample(self.store, now)?;

        let ledger = QuotaLedger::new(self.store, self.cfg);
        if ledger.roll_if_due(now)? {
            info!("quota window rolled");
        }
        self.maybe_prune_samples(now)?;
        self.store.touch_last_tick(now)?;

        // Gate 1: operator present right now.
        if active {
            return Ok(TickOutcome::Skipped(SkipReason::UserActive));
        }

        // Gate 2: idle long enough.
        let idle_minutes = self.monitor.idle_minutes(self.store, now)?;
        if idle_minutes < self.cfg.activity.idle_threshold_minutes as f64 {
            return Ok(TickOutcome::Skipped(SkipReason::IdleTooShort {
                idle_minutes: idle_minutes as i64,
            }));
        }

        // Gate 3: predicted return too close.
        let pattern = self.pattern_cache.get(self.store, now)?;
        if let Some(minutes) = minutes_until_likely_return(&pattern, now_local) {
            if minutes < self.cfg.activity.return_buffer_minutes {
                return Ok(TickOutcome::Skipped(SkipReason::ReturnImminent { minutes }));
            }
        }

        // Gate 4: daily budget.
        let budget = BudgetBook::new(self.store, self.cfg);
        let coarse_estimate = self.cfg.assistant.default_tier()?.avg_message_cost();
        if !budget.admits_task(coarse_estimate, now)? {
            return Ok(TickOutcome::Skipped(SkipReason::BudgetExhausted));
        }

        // Gate 5: claim work. The claim is atomic and refuses to double-run,
        // which is gate 6; anything beyond one running task here is a bug.
        let Some(task) = self.store.claim_next_pending(now)? else {
            return Ok(TickOutcome::Skipped(SkipReason::NoPendingTask));
        };
        let running = self.store.count_by_status(TaskStatus::Running)?;
        if running > 1 {
            error!(running, "invariant violation: more than one running task");
        }

        // Model selection; tier-accurate budget re-check before any spend.
        let selection = select_tier(&task, self.cfg, &ledger, &pattern, now, now_local)?;
        let Some(selection) = selection else {
            self.store.release_task(task.id)?;
            info!(task_id = task.id, "no tier admitted; task returned to queue");
            return Ok(TickOutcome::Skipped(SkipReason::QuotaExhausted));
        };
        if !budget.admits_task(selection.tier.avg_message_cost(), now)? {
            self.store.release_task(task.id)?;
            return Ok(TickOutcome::Skipped(SkipReason::BudgetExhausted));
        }

        match &selection.adjustment {
            TierAdjustment::Upgraded(reason) => {
                info!(task_id = task.id, tier = selection.tier.alias(), %reason, "tier upgraded");
            }
            TierAdjustment::Downgraded(steps) => {
                info!(task_id = task.id, tier = selection.tier.alias(), steps, "tier downgraded");
            }
            TierAdjustment::None => {}
        }

        // Decrement-then-dispatch; refunded on any failure path.
        self.store.set_task_model(task.id, selection.tier)?;
        ledger.consume(selection.tier, 1, now)?;
        let task_budget = budget.task_budget(now)?;
        info!(
            task_id = task.id,
            title = %task.title,
            tier = selection.tier.alias(),
            "dispatching task"
        );

        match self.runner.run(&task, selection.tier, task_budget) {
            Ok(ExecOutcome::Ok {
                summary,
                cost_usd,
                input_tokens,
                output_tokens,
                duration_secs,
                branch_name,
            }) => {
                let finished = Utc::now();
                self.store.set_task_branch(task.id, Some(&branch_name))?;
                self.store
                    .update_task_status(task.id, TaskStatus::Completed, finished)?;
                self.store
                    .update_task_status(task.id, TaskStatus::AwaitingReview, finished)?;
                self.store.set_task_result(task.id, &summary, cost_usd)?;
                budget.record(
                    finished,
                    selection.tier,
                    input_tokens,
                    output_tokens,
                    cost_usd,
                    Some(task.id),
                )?;
                if task.source == TaskSource::AutoTemplate {
                    if let Some(task_type) =
                        task.source_ref.as_deref().and_then(|r| r.split(':').next())
                    {
                        self.store.stamp_template_run(task_type, finished)?;
                    }
                }
                info!(
                    task_id = task.id,
                    branch = %branch_name,
                    cost_usd,
                    duration_secs,
                    "task awaiting review"
                );
                Ok(TickOutcome::Completed {
                    task_id: task.id,
                    tier: selection.tier,
                })
            }
            Ok(ExecOutcome::Failed {
                kind,
                detail,
                branch_name,
            }) => {
                let finished = Utc::now();
                ledger.refund(selection.tier, 1, finished)?;
                self.store
                    .update_task_status(task.id, TaskStatus::Failed, finished)?;
                let summary = match &branch_name {
                    Some(branch) => {
                        format!("{}: {} (work branch {} kept)", kind.as_str(), detail, branch)
                    }
                    None => format!("{}: {}", kind.as_str(), detail),
                };
                self.store.set_task_result(task.id, &summary, 0.0)?;
                warn!(task_id = task.id, kind = kind.as_str(), "task failed");
                Ok(TickOutcome::Failed {
                    task_id: task.id,
                    tier: selection.tier,
                })
            }
            Err(e) => {
                // Dispatch never reached the assistant; refund and fail the
                // task with the error text.
                let finished = Utc::now();
                ledger.refund(selection.tier, 1, finished)?;
                self.store
                    .update_task_status(task.id, TaskStatus::Failed, finished)?;
                self.store
                    .set_task_result(task.id, &format!("dispatch error: {}", e), 0.0)?;
                error!(task_id = task.id, error = %e, "dispatch failed");
                Ok(TickOutcome::Failed {
                    task_id: task.id,
                    tier: selection.tier,
                })
            }
        }
    }

    fn maybe_prune_samples(&mut self, now: DateTime<Utc>) -> Result<(), MagpieError> {
        let due = match self.last_prune_at {
            None => true,
            Some(at) => now - at >= ChronoDuration::days(1),
        };
        if due {
            let n = self
                .store
                .prune_samples_before(now - ChronoDuration::days(SAMPLE_PRUNE_DAYS))?;
            if n > 0 {
                debug!(pruned = n, "dropped old presence samples");
            }
            self.last_prune_at = Some(now);
        }
        Ok(())
    }

    /// Upstream quota sync at the configured cadence; failures log and wait
    /// for the next interval.
    fn maybe_sync(&mut self, now: DateTime<Utc>) {
        let interval = self.cfg.daemon.auto_sync_interval_minutes;
        if interval <= 0 {
            return;
        }
        let due = match self.last_sync_at {
            None => true,
            Some(at) => now - at >= ChronoDuration::minutes(interval),
        };
        if !due {
            return;
        }
        self.last_sync_at = Some(now);
        let ledger = QuotaLedger::new(self.store, self.cfg);
        match ledger.sync_from_upstream(now) {
            Ok(()) => info!("quota synced from upstream"),
            Err(e) => warn!(error = %e, "quota sync failed; will retry next interval"),
        }
    }

    pub fn run_loop(&mut self) -> Result<(), MagpieError> {
        let poll = Duration::from_secs(self.cfg.daemon.poll_interval.max(1));
        while !shutdown_requested() {
            match self.tick(Utc::now(), Local::now()) {
                Ok(TickOutcome::Skipped(reason)) => debug!(%reason, "tick skipped"),
                Ok(TickOutcome::Completed { task_id, tier }) => {
                    debug!(task_id, tier = tier.alias(), "tick dispatched")
                }
                Ok(TickOutcome::Failed { task_id, tier }) => {
                    debug!(task_id, tier = tier.alias(), "tick dispatched (failed)")
                }
                Err(e @ MagpieError::Fatal(_)) => return Err(e),
                Err(e) => error!(error = %e, "error in daemon tick"),
            }
            self.maybe_sync(Utc::now());

            let mut slept = Duration::ZERO;
            while slept < poll && !shutdown_requested() {
                std::thread::sleep(SHUTDOWN_SLEEP_SLICE);
                slept += SHUTDOWN_SLEEP_SLICE;
            }
        }
        Ok(())
    }
}

// --- Daemon lifecycle commands ---

pub fn start(config_root: &Path, cfg: &Config, foreground: bool) -> Result<(), MagpieError> {
    if !foreground {
        return spawn_background(config_root);
    }

    let lock = DaemonLock::acquire(config_root)?;
    let daemonized = std::env::var(DAEMONIZED_ENV).is_ok();
    init_logging(config_root, !daemonized)?;

    let store = Store::open(config_root);
    store.initialize()?;
    let swept = store.sweep_orphan_running()?;
    if swept > 0 {
        info!(swept, "returned orphaned running tasks to pending");
    }
    store.write_daemon_meta(std::process::id(), Utc::now())?;
    install_signal_handlers()?;
    info!(
        pid = std::process::id(),
        poll_interval = cfg.daemon.poll_interval,
        "daemon started"
    );

    let monitor = ActivityMonitor::new(Box::new(ProcessScanProbe::default()));
    let runner = AssistantExecutor::new(config_root, cfg);
    let mut scheduler = Scheduler::new(
        cfg,
        &store,
        monitor,
        PatternCache::new(),
        Box::new(runner),
    );
    let result = scheduler.run_loop();
    info!("daemon shutting down");
    drop(lock);
    result
}

/// Re-exec ourselves detached, stdio pointed at the log file.
fn spawn_background(config_root: &Path) -> Result<(), MagpieError> {
    if let Some(pid) = live_daemon_pid(config_root) {
        return Err(MagpieError::AlreadyRunning(pid));
    }
    std::fs::create_dir_all(config_root)?;
    let log_path = config::log_path(config_root);
    let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
    let exe = std::env::current_exe()?;

    let mut cmd = Command::new(exe);
    cmd.arg("start")
        .arg("--foreground")
        .env(config::CONFIG_DIR_ENV, config_root)
        .env(DAEMONIZED_ENV, "1")
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd.spawn()?;

    println!("Daemon started (PID {})", child.id());
    println!("Log: {}", log_path.display());
    Ok(())
}

pub fn stop(config_root: &Path) -> Result<(), MagpieError> {
    let Some(pid) = live_daemon_pid(config_root) else {
        println!("Daemon is not running");
        return Ok(());
    };
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| MagpieError::Precondition(format!("could not signal pid {}: {}", pid, e)))?;
    println!("Sent SIGTERM to daemon (PID {})", pid);

    for _ in 0..20 {
        if live_daemon_pid(config_root).is_none() {
            println!("Daemon stopped");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(500));
    }
    println!("Daemon is finishing its current task; it will exit when done.");
    Ok(())
}

pub fn status(config_root: &Path, cfg: &Config, store: &Store) -> Result<(), MagpieError> {
    match live_daemon_pid(config_root) {
        Some(pid) => println!("Daemon:   {} (PID {})", "running".green(), pid),
        None => println!("Daemon:   {}", "stopped".dimmed()),
    }
    if let Some(meta) = store.daemon_meta()? {
        if let Some(tick) = meta.last_tick_at {
            println!("          last tick {}", tick.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }

    let now = Utc::now();
    let ledger = QuotaLedger::new(store, cfg);
    ledger.roll_if_due(now)?;
    let parts: Vec<String> = ALL_TIERS
        .iter()
        .map(|tier| {
            let remaining = ledger.remaining(now, *tier).unwrap_or(0);
            format!("{} {}", tier.alias(), remaining)
        })
        .collect();
    println!("Quota:    {} remaining for autonomous use", parts.join(", "));

    let budget = BudgetBook::new(store, cfg);
    println!(
        "Budget:   ${:.2} of ${:.2} spent today",
        budget.daily_spent(now)?,
        cfg.budget.max_daily_usd
    );

    let running = store.count_by_status(TaskStatus::Running)?;
    let pending = store.count_by_status(TaskStatus::Pending)?;
    let review = store.count_by_status(TaskStatus::AwaitingReview)?;
    let failed = store.count_by_status(TaskStatus::Failed)?;
    println!(
        "Tasks:    {} running, {} pending, {} awaiting review, {} failed",
        running, pending, review, failed
    );
    if running > 0 {
        for t in store.list_tasks(Some(TaskStatus::Running))? {
            println!("          > #{}: {}", t.id, t.title);
        }
    }

    let monitor = ActivityMonitor::new(Box::new(ProcessScanProbe::default()));
    if monitor.is_active() {
        println!("Activity: operator active");
    } else {
        let idle = monitor.idle_minutes(store, now)?;
        if idle.is_finite() {
            println!("Activity: idle ({:.0}m)", idle);
        } else {
            println!("Activity: idle (no samples yet)");
        }
    }
    Ok(())
}
