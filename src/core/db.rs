//! Database connection primitives.
//!
//! - WAL mode for cross-process concurrency (CLI commands run while the
//!   daemon holds its own connections)
//! - Foreign keys enforced
//! - 5-second busy timeout for lock contention

use crate::core::error::MagpieError;
use rusqlite::Connection;
use std::path::Path;

/// Establish a SQLite connection with the standard configuration.
///
/// Do not call this directly for state access; go through
/// [`crate::core::store::Store`], which serializes same-database writers.
pub fn db_connect(db_path: &Path) -> Result<Connection, MagpieError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}
