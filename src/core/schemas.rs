//! Centralized schema definitions for the wise-magpie database.
//!
//! All persistent state lives in one SQLite file (`assistant-tasks.db`) in
//! the config directory. Each table is owned by exactly one subsystem;
//! everything goes through `core::store`.

pub const DB_FILE_NAME: &str = "assistant-tasks.db";
pub const PID_FILE_NAME: &str = "assistant.pid";
pub const LOG_FILE_NAME: &str = "assistant.log";
pub const EXTERNAL_EVENTS_NAME: &str = "external.events.jsonl";

pub const TASKS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        source TEXT NOT NULL DEFAULT 'manual',
        source_ref TEXT,
        requested_model TEXT NOT NULL DEFAULT 'auto',
        model TEXT NOT NULL DEFAULT '',
        priority REAL NOT NULL DEFAULT 0.0,
        status TEXT NOT NULL DEFAULT 'pending',
        work_dir TEXT NOT NULL DEFAULT '',
        branch_name TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        result_summary TEXT NOT NULL DEFAULT '',
        actual_cost_usd REAL NOT NULL DEFAULT 0.0,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT
    )
";

/// Dedup guarantee for scanned tasks: at most one row per (source, source_ref)
/// when a source_ref exists. Manual tasks carry a NULL source_ref and are
/// exempt.
pub const TASKS_DEDUP_INDEX: &str = "
    CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_source_ref
    ON tasks(source, source_ref) WHERE source_ref IS NOT NULL
";

pub const TASKS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)";

/// Singleton row (id = 1): the open rolling quota window with per-model
/// consumption counts.
pub const QUOTA_WINDOW_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS quota_window (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        window_started_at TEXT NOT NULL,
        opus_used INTEGER NOT NULL DEFAULT 0,
        sonnet_used INTEGER NOT NULL DEFAULT 0,
        haiku_used INTEGER NOT NULL DEFAULT 0,
        last_correction_at TEXT
    )
";

pub const QUOTA_CORRECTIONS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS quota_corrections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model TEXT NOT NULL,
        remaining INTEGER NOT NULL,
        corrected_at TEXT NOT NULL
    )
";

pub const USAGE_LOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS usage_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        model TEXT NOT NULL DEFAULT '',
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        cost_usd REAL NOT NULL DEFAULT 0.0,
        task_id INTEGER,
        autonomous INTEGER NOT NULL DEFAULT 0
    )
";

pub const USAGE_LOG_TS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_usage_ts ON usage_log(ts)";

pub const USAGE_SAMPLES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS usage_samples (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        active INTEGER NOT NULL
    )
";

pub const USAGE_SAMPLES_TS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_samples_ts ON usage_samples(ts)";

/// Last completion timestamp per auto-template type; drives interval gating.
pub const AUTO_TEMPLATE_RUNS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS auto_template_runs (
        task_type TEXT PRIMARY KEY,
        last_completed_at TEXT NOT NULL
    )
";

/// Singleton row (id = 1): daemon liveness metadata.
pub const DAEMON_META_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS daemon_meta (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        pid INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        last_tick_at TEXT
    )
";

pub const ALL_SCHEMAS: &[&str] = &[
    TASKS_SCHEMA,
    TASKS_DEDUP_INDEX,
    TASKS_STATUS_INDEX,
    QUOTA_WINDOW_SCHEMA,
    QUOTA_CORRECTIONS_SCHEMA,
    USAGE_LOG_SCHEMA,
    USAGE_LOG_TS_INDEX,
    USAGE_SAMPLES_SCHEMA,
    USAGE_SAMPLES_TS_INDEX,
    AUTO_TEMPLATE_RUNS_SCHEMA,
    DAEMON_META_SCHEMA,
];
