//! Error types for wise-magpie operations.
//!
//! One canonical error enum is used everywhere; the CLI boundary maps each
//! variant to a process exit code (0 success, 1 user error, 2 precondition
//! failure, 3 external tool missing). Variants auto-convert from standard
//! library and rusqlite errors via `From` so `?` works throughout.

use std::io;
use thiserror::Error;

/// Canonical error type for all wise-magpie operations.
#[derive(Error, Debug)]
pub enum MagpieError {
    /// SQLite database error (auto-converts from `rusqlite::Error`)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Missing or malformed configuration
    #[error("config error: {0}")]
    Config(String),

    /// A command precondition does not hold; no state was changed
    #[error("{0}")]
    Precondition(String),

    /// A second daemon instance was refused by the singleton lock
    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    /// The working tree has uncommitted changes
    #[error("working tree is dirty: {0}")]
    DirtyWorkingTree(String),

    /// Operation refused because the task is currently running
    #[error("task #{0} is running; stop the daemon or wait for it to finish")]
    TaskBusy(i64),

    /// The assistant CLI binary is not on PATH
    #[error("assistant CLI `{0}` not found on PATH")]
    AssistantNotFound(String),

    /// The version-control binary is not on PATH
    #[error("`git` not found on PATH")]
    VcsNotFound,

    /// Resource not found (task id, config file, ...)
    #[error("not found: {0}")]
    NotFound(String),

    /// Quota sync against the upstream usage endpoint failed; retried later
    #[error("upstream sync failed: {0}")]
    Upstream(String),

    /// Unrecoverable state; the daemon aborts
    #[error("fatal: {0}")]
    Fatal(String),
}

impl MagpieError {
    /// Map the error kind to the CLI exit code contract.
    pub fn exit_code(&self) -> u8 {
        match self {
            MagpieError::Precondition(_)
            | MagpieError::AlreadyRunning(_)
            | MagpieError::DirtyWorkingTree(_)
            | MagpieError::TaskBusy(_) => 2,
            MagpieError::AssistantNotFound(_) | MagpieError::VcsNotFound => 3,
            _ => 1,
        }
    }
}
