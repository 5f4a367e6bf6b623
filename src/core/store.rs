//! Serialized access to the wise-magpie database (the thin waist).
//!
//! Every component reads and mutates persistent state through [`Store`].
//! Same-database access is serialized with a per-path in-process lock on
//! top of SQLite's WAL + busy timeout, so the daemon and concurrently
//! running CLI commands (task add, quota correct, review) never interleave
//! destructively. The store never calls back into other subsystems; the
//! scheduler polls it.

use crate::core::db;
use crate::core::error::MagpieError;
use crate::core::models::{
    DaemonMeta, ModelTier, NewTask, QuotaWindowRow, RequestedModelField, Task, TaskSource,
    TaskStatus, UsageRecord, UsageSample,
};
use crate::core::schemas;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

pub struct Store {
    root: PathBuf,
}

// --- Timestamp helpers ---
// Fixed-width RFC 3339 with microseconds and a literal Z, so lexicographic
// ordering in SQL matches chronological ordering.

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, MagpieError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MagpieError::Fatal(format!("bad timestamp in database: {}: {}", s, e)))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, MagpieError> {
    s.map(|v| parse_ts(&v)).transpose()
}

// Serialize operations per database path. Cross-process writers are handled
// by SQLite itself (WAL + busy timeout); this keeps same-process callers
// from interleaving multi-statement operations.
fn db_lock_map() -> &'static Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> {
    static DB_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    DB_LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn get_db_lock(db_path: &Path) -> Result<Arc<Mutex<()>>, MagpieError> {
    let mut map = db_lock_map()
        .lock()
        .map_err(|_| MagpieError::Fatal("store lock map poisoned".into()))?;
    Ok(map
        .entry(db_path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone())
}

impl Store {
    /// `root` is the config directory; the database file lives inside it.
    pub fn open(root: &Path) -> Store {
        Store {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn db_path(&self) -> PathBuf {
        self.root.join(schemas::DB_FILE_NAME)
    }

    pub fn initialize(&self) -> Result<(), MagpieError> {
        std::fs::create_dir_all(&self.root)?;
        self.with_conn(|conn| {
            for schema in schemas::ALL_SCHEMAS {
                conn.execute_batch(schema)?;
            }
            Ok(())
        })
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, MagpieError>
    where
        F: FnOnce(&mut Connection) -> Result<R, MagpieError>,
    {
        let db_path = self.db_path();
        let lock = get_db_lock(&db_path)?;
        let _guard = lock
            .lock()
            .map_err(|_| MagpieError::Fatal("store lock poisoned".into()))?;
        let mut conn = db::db_connect(&db_path)?;
        f(&mut conn)
    }

    // --- Tasks ---

    pub fn create_task(&self, new: &NewTask, now: DateTime<Utc>) -> Result<Task, MagpieError> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (title, description, source, source_ref, requested_model, \
                 priority, status, work_dir, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
                params![
                    new.title,
                    new.description,
                    new.source.as_str(),
                    new.source_ref,
                    new.requested_model.as_str(),
                    new.priority,
                    new.work_dir,
                    fmt_ts(now),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_task(id)?
            .ok_or_else(|| MagpieError::Fatal("task vanished after insert".into()))
    }

    /// Insert a scanned candidate; returns `None` when the `(source,
    /// source_ref)` unique index rejects it (already known).
    pub fn create_task_if_new(
        &self,
        new: &NewTask,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, MagpieError> {
        match self.create_task(new, now) {
            Ok(task) => Ok(Some(task)),
            Err(MagpieError::Sqlite(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>, MagpieError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                    params![id],
                    row_to_task,
                )
                .optional()?;
            row.map(finish_task_row).transpose()
        })
    }

    /// All tasks (newest first), or tasks in one status (highest priority
    /// first, FIFO on ties).
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, MagpieError> {
        self.with_conn(|conn| {
            let (sql, args): (String, Vec<String>) = match status {
                Some(s) => (
                    format!(
                        "SELECT {} FROM tasks WHERE status = ?1 ORDER BY priority DESC, id ASC",
                        TASK_COLUMNS
                    ),
                    vec![s.as_str().to_string()],
                ),
                None => (
                    format!("SELECT {} FROM tasks ORDER BY id DESC", TASK_COLUMNS),
                    Vec::new(),
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                args.iter().map(|a| a as &dyn rusqlite::types::ToSql).collect();
            let rows = stmt.query_map(&params_ref[..], row_to_task)?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(finish_task_row(row?)?);
            }
            Ok(tasks)
        })
    }

    pub fn count_by_status(&self, status: TaskStatus) -> Result<i64, MagpieError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                params![status.as_str()],
                |r| r.get(0),
            )?)
        })
    }

    pub fn task_exists(&self, source: TaskSource, source_ref: &str) -> Result<bool, MagpieError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE source = ?1 AND source_ref = ?2",
                params![source.as_str(), source_ref],
                |r| r.get(0),
            )?;
            Ok(n > 0)
        })
    }

    /// Apply a legal status transition, stamping timestamps as appropriate.
    pub fn update_task_status(
        &self,
        id: i64,
        next: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), MagpieError> {
        self.with_conn(|conn| {
            let current: String = conn
                .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })
                .optional()?
                .ok_or_else(|| MagpieError::NotFound(format!("task #{}", id)))?;
            let current = TaskStatus::parse(&current)?;
            if !current.can_transition_to(next) {
                return Err(MagpieError::Precondition(format!(
                    "illegal task transition for #{}: {} -> {}",
                    id,
                    current.as_str(),
                    next.as_str()
                )));
            }
            match next {
                TaskStatus::Running => {
                    conn.execute(
                        "UPDATE tasks SET status = ?1, started_at = ?2 WHERE id = ?3",
                        params![next.as_str(), fmt_ts(now), id],
                    )?;
                }
                TaskStatus::Completed | TaskStatus::Failed if current == TaskStatus::Running => {
                    conn.execute(
                        "UPDATE tasks SET status = ?1, finished_at = ?2 WHERE id = ?3",
                        params![next.as_str(), fmt_ts(now), id],
                    )?;
                }
                _ => {
                    conn.execute(
                        "UPDATE tasks SET status = ?1 WHERE id = ?2",
                        params![next.as_str(), id],
                    )?;
                }
            }
            Ok(())
        })
    }

    pub fn set_task_branch(&self, id: i64, branch: Option<&str>) -> Result<(), MagpieError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET branch_name = ?1 WHERE id = ?2",
                params![branch, id],
            )?;
            Ok(())
        })
    }

    pub fn set_task_model(&self, id: i64, tier: ModelTier) -> Result<(), MagpieError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET model = ?1 WHERE id = ?2",
                params![tier.alias(), id],
            )?;
            Ok(())
        })
    }

    pub fn set_task_result(
        &self,
        id: i64,
        summary: &str,
        cost_usd: f64,
    ) -> Result<(), MagpieError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET result_summary = ?1, actual_cost_usd = ?2 WHERE id = ?3",
                params![summary, cost_usd, id],
            )?;
            Ok(())
        })
    }

    /// Return a claimed-but-undispatchable task to the queue (e.g. no tier
    /// admitted this tick). Not a retry; retry_count stays put.
    pub fn release_task(&self, id: i64) -> Result<(), MagpieError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE tasks SET status = 'pending', started_at = NULL \
                 WHERE id = ?1 AND status = 'running'",
                params![id],
            )?;
            if n == 0 {
                return Err(MagpieError::Precondition(format!(
                    "task #{} is not running; cannot release",
                    id
                )));
            }
            Ok(())
        })
    }

    pub fn delete_task(&self, id: i64) -> Result<Task, MagpieError> {
        let task = self
            .get_task(id)?
            .ok_or_else(|| MagpieError::NotFound(format!("task #{}", id)))?;
        if task.status == TaskStatus::Running {
            return Err(MagpieError::TaskBusy(id));
        }
        self.with_conn(|conn| {
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
            Ok(())
        })?;
        Ok(task)
    }

    /// Atomically claim the highest-priority pending task (FIFO on ties) and
    /// mark it running. Returns `None` when the queue is empty or another
    /// task is already running; the immediate transaction makes this safe
    /// against any concurrent writer and doubles as the at-most-one-running
    /// guard.
    pub fn claim_next_pending(&self, now: DateTime<Utc>) -> Result<Option<Task>, MagpieError> {
        let claimed = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let running: i64 = tx.query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = 'running'",
                [],
                |r| r.get(0),
            )?;
            if running > 0 {
                return Ok(None);
            }
            let id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM tasks WHERE status = 'pending' \
                     ORDER BY priority DESC, id ASC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(id) = id else {
                return Ok(None);
            };
            let n = tx.execute(
                "UPDATE tasks SET status = 'running', started_at = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
                params![fmt_ts(now), id],
            )?;
            if n != 1 {
                return Ok(None);
            }
            tx.commit()?;
            Ok(Some(id))
        })?;
        match claimed {
            Some(id) => self.get_task(id),
            None => Ok(None),
        }
    }

    /// Startup crash recovery: any task left `running` by an aborted daemon
    /// goes back to `pending` with retry_count unchanged.
    pub fn sweep_orphan_running(&self) -> Result<usize, MagpieError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE tasks SET status = 'pending', started_at = NULL \
                 WHERE status = 'running'",
                [],
            )?;
            Ok(n)
        })
    }

    // --- Usage samples (activity observations) ---

    pub fn record_usage_sample(
        &self,
        ts: DateTime<Utc>,
        active: bool,
    ) -> Result<(), MagpieError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_samples (ts, active) VALUES (?1, ?2)",
                params![fmt_ts(ts), active as i64],
            )?;
            Ok(())
        })
    }

    pub fn last_active_sample_at(&self) -> Result<Option<DateTime<Utc>>, MagpieError> {
        self.with_conn(|conn| {
            let ts: Option<String> = conn
                .query_row(
                    "SELECT ts FROM usage_samples WHERE active = 1 ORDER BY ts DESC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?;
            parse_ts_opt(ts)
        })
    }

    pub fn samples_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageSample>, MagpieError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT ts, active FROM usage_samples WHERE ts >= ?1 ORDER BY ts")?;
            let rows = stmt.query_map(params![fmt_ts(since)], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?;
            let mut samples = Vec::new();
            for row in rows {
                let (ts, active) = row?;
                samples.push(UsageSample {
                    ts: parse_ts(&ts)?,
                    active: active != 0,
                });
            }
            Ok(samples)
        })
    }

    pub fn prune_samples_before(&self, cutoff: DateTime<Utc>) -> Result<usize, MagpieError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM usage_samples WHERE ts < ?1",
                params![fmt_ts(cutoff)],
            )?;
            Ok(n)
        })
    }

    // --- Quota window ---

    /// Fetch the open window, creating it (started now) on first use.
    pub fn ensure_quota_window(&self, now: DateTime<Utc>) -> Result<QuotaWindowRow, MagpieError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO quota_window (id, window_started_at) VALUES (1, ?1)",
                params![fmt_ts(now)],
            )?;
            read_quota_window(conn)
        })
    }

    /// Roll the window when `now - started >= window_hours`, advancing the
    /// start by whole windows and zeroing every per-model count. Returns
    /// whether a roll happened.
    pub fn roll_quota_window_if_due(
        &self,
        now: DateTime<Utc>,
        window_hours: i64,
    ) -> Result<bool, MagpieError> {
        let window = self.ensure_quota_window(now)?;
        let length = Duration::hours(window_hours.max(1));
        if now - window.window_started_at < length {
            return Ok(false);
        }
        let mut start = window.window_started_at;
        while now - start >= length {
            start += length;
        }
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE quota_window SET window_started_at = ?1, \
                 opus_used = 0, sonnet_used = 0, haiku_used = 0 WHERE id = 1",
                params![fmt_ts(start)],
            )?;
            Ok(())
        })?;
        Ok(true)
    }

    /// Adjust a tier's consumed count by `delta` (negative for refunds),
    /// clamped at zero. Creates the window on first use.
    pub fn add_quota_consumption(
        &self,
        tier: ModelTier,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<(), MagpieError> {
        let column = tier_column(tier);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO quota_window (id, window_started_at) VALUES (1, ?1)",
                params![fmt_ts(now)],
            )?;
            conn.execute(
                &format!(
                    "UPDATE quota_window SET {col} = MAX(0, {col} + ?1) WHERE id = 1",
                    col = column
                ),
                params![delta],
            )?;
            Ok(())
        })
    }

    /// Overwrite a tier's consumed count (operator or upstream correction)
    /// and record the correction for audit.
    pub fn set_quota_consumed(
        &self,
        tier: ModelTier,
        consumed: i64,
        remaining: i64,
        now: DateTime<Utc>,
    ) -> Result<(), MagpieError> {
        let column = tier_column(tier);
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "UPDATE quota_window SET {col} = ?1, last_correction_at = ?2 WHERE id = 1",
                    col = column
                ),
                params![consumed.max(0), fmt_ts(now)],
            )?;
            conn.execute(
                "INSERT INTO quota_corrections (model, remaining, corrected_at) \
                 VALUES (?1, ?2, ?3)",
                params![tier.alias(), remaining, fmt_ts(now)],
            )?;
            Ok(())
        })
    }

    pub fn list_quota_corrections(
        &self,
        limit: i64,
    ) -> Result<Vec<(String, i64, DateTime<Utc>)>, MagpieError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model, remaining, corrected_at FROM quota_corrections \
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (model, remaining, at) = row?;
                out.push((model, remaining, parse_ts(&at)?));
            }
            Ok(out)
        })
    }

    // --- Usage log (spend) ---

    pub fn insert_usage(
        &self,
        ts: DateTime<Utc>,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
        cost_usd: f64,
        task_id: Option<i64>,
        autonomous: bool,
    ) -> Result<i64, MagpieError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_log (ts, model, input_tokens, output_tokens, cost_usd, \
                 task_id, autonomous) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    fmt_ts(ts),
                    model,
                    input_tokens,
                    output_tokens,
                    cost_usd,
                    task_id,
                    autonomous as i64
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn usage_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageRecord>, MagpieError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ts, model, input_tokens, output_tokens, cost_usd, task_id, \
                 autonomous FROM usage_log WHERE ts >= ?1 ORDER BY ts",
            )?;
            let rows = stmt.query_map(params![fmt_ts(since)], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, f64>(5)?,
                    r.get::<_, Option<i64>>(6)?,
                    r.get::<_, i64>(7)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, ts, model, input_tokens, output_tokens, cost_usd, task_id, autonomous) =
                    row?;
                out.push(UsageRecord {
                    id,
                    ts: parse_ts(&ts)?,
                    model,
                    input_tokens,
                    output_tokens,
                    cost_usd,
                    task_id,
                    autonomous: autonomous != 0,
                });
            }
            Ok(out)
        })
    }

    /// Total autonomous spend for one UTC day.
    pub fn daily_autonomous_cost(&self, day: NaiveDate) -> Result<f64, MagpieError> {
        let start = format!("{}T00:00:00", day);
        let end = format!("{}T00:00:00", day + Duration::days(1));
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_log \
                 WHERE autonomous = 1 AND ts >= ?1 AND ts < ?2",
                params![start, end],
                |r| r.get(0),
            )?)
        })
    }

    // --- Auto-template runs ---

    pub fn template_last_completed(
        &self,
        task_type: &str,
    ) -> Result<Option<DateTime<Utc>>, MagpieError> {
        self.with_conn(|conn| {
            let ts: Option<String> = conn
                .query_row(
                    "SELECT last_completed_at FROM auto_template_runs WHERE task_type = ?1",
                    params![task_type],
                    |r| r.get(0),
                )
                .optional()?;
            parse_ts_opt(ts)
        })
    }

    pub fn stamp_template_run(
        &self,
        task_type: &str,
        now: DateTime<Utc>,
    ) -> Result<(), MagpieError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auto_template_runs (task_type, last_completed_at) VALUES (?1, ?2) \
                 ON CONFLICT(task_type) DO UPDATE SET last_completed_at = excluded.last_completed_at",
                params![task_type, fmt_ts(now)],
            )?;
            Ok(())
        })
    }

    // --- Daemon metadata ---

    pub fn write_daemon_meta(&self, pid: u32, started_at: DateTime<Utc>) -> Result<(), MagpieError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO daemon_meta (id, pid, started_at, last_tick_at) \
                 VALUES (1, ?1, ?2, NULL) \
                 ON CONFLICT(id) DO UPDATE SET pid = excluded.pid, \
                 started_at = excluded.started_at, last_tick_at = NULL",
                params![pid, fmt_ts(started_at)],
            )?;
            Ok(())
        })
    }

    pub fn touch_last_tick(&self, now: DateTime<Utc>) -> Result<(), MagpieError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE daemon_meta SET last_tick_at = ?1 WHERE id = 1",
                params![fmt_ts(now)],
            )?;
            Ok(())
        })
    }

    pub fn daemon_meta(&self) -> Result<Option<DaemonMeta>, MagpieError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT pid, started_at, last_tick_at FROM daemon_meta WHERE id = 1",
                    [],
                    |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(pid, started_at, last_tick_at)| {
                Ok(DaemonMeta {
                    pid: pid as u32,
                    started_at: parse_ts(&started_at)?,
                    last_tick_at: parse_ts_opt(last_tick_at)?,
                })
            })
            .transpose()
        })
    }
}

// --- Row mapping ---

const TASK_COLUMNS: &str = "id, title, description, source, source_ref, requested_model, model, \
     priority, status, work_dir, branch_name, retry_count, result_summary, actual_cost_usd, \
     created_at, started_at, finished_at";

struct RawTaskRow {
    id: i64,
    title: String,
    description: String,
    source: String,
    source_ref: Option<String>,
    requested_model: String,
    model: String,
    priority: f64,
    status: String,
    work_dir: String,
    branch_name: Option<String>,
    retry_count: i64,
    result_summary: String,
    actual_cost_usd: f64,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTaskRow> {
    Ok(RawTaskRow {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        source: row.get(3)?,
        source_ref: row.get(4)?,
        requested_model: row.get(5)?,
        model: row.get(6)?,
        priority: row.get(7)?,
        status: row.get(8)?,
        work_dir: row.get(9)?,
        branch_name: row.get(10)?,
        retry_count: row.get(11)?,
        result_summary: row.get(12)?,
        actual_cost_usd: row.get(13)?,
        created_at: row.get(14)?,
        started_at: row.get(15)?,
        finished_at: row.get(16)?,
    })
}

fn finish_task_row(raw: RawTaskRow) -> Result<Task, MagpieError> {
    Ok(Task {
        id: raw.id,
        title: raw.title,
        description: raw.description,
        source: TaskSource::parse(&raw.source)?,
        source_ref: raw.source_ref,
        requested_model: RequestedModelField(raw.requested_model),
        model: raw.model,
        priority: raw.priority,
        status: TaskStatus::parse(&raw.status)?,
        work_dir: raw.work_dir,
        branch_name: raw.branch_name,
        retry_count: raw.retry_count,
        result_summary: raw.result_summary,
        actual_cost_usd: raw.actual_cost_usd,
        created_at: parse_ts(&raw.created_at)?,
        started_at: parse_ts_opt(raw.started_at)?,
        finished_at: parse_ts_opt(raw.finished_at)?,
    })
}

fn tier_column(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Opus => "opus_used",
        ModelTier::Sonnet => "sonnet_used",
        ModelTier::Haiku => "haiku_used",
    }
}

fn read_quota_window(conn: &Connection) -> Result<QuotaWindowRow, MagpieError> {
    let row = conn.query_row(
        "SELECT window_started_at, opus_used, sonnet_used, haiku_used, last_correction_at \
         FROM quota_window WHERE id = 1",
        [],
        |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        },
    )?;
    Ok(QuotaWindowRow {
        window_started_at: parse_ts(&row.0)?,
        opus_used: row.1,
        sonnet_used: row.2,
        haiku_used: row.3,
        last_correction_at: parse_ts_opt(row.4)?,
    })
}
