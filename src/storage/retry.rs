//! Lock-aware retry wrapper for embedded-database statements.
//!
//! SQLite under WAL can surface transient `database is locked` / `busy`
//! errors during checkpoints and cross-handle contention. Every exec,
//! query, and transaction in the storage layer goes through this module
//! so callers only ever see success or a terminal error. The cap
//! (1000 attempts x 25 ms) deliberately survives long WAL checkpoints.

use std::thread::sleep;
use std::time::Duration;

use rand::Rng;
use rusqlite::{Connection, OptionalExtension, Row, ToSql, Transaction};
use tracing::trace;

use crate::config::{RETRY_BACKOFF_CAP, RETRY_MAX_ATTEMPTS};
use crate::error::{Error, Result};

/// Classify an error as transient lock contention.
pub fn is_retryable(err: &rusqlite::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("database is locked")
        || msg.contains("database table is locked")
        || msg.contains("busy")
        || msg.contains("locked")
}

/// Linear backoff capped at `RETRY_BACKOFF_CAP`, plus up to 50% jitter.
fn backoff(attempt: u32) -> Duration {
    let base = Duration::from_millis(u64::from(attempt)).min(RETRY_BACKOFF_CAP);
    let jitter_cap = base.as_micros() as u64 / 2;
    let jitter = if jitter_cap > 0 {
        rand::thread_rng().gen_range(0..=jitter_cap)
    } else {
        0
    };
    base + Duration::from_micros(jitter)
}

/// Run an operation, retrying on transient lock errors.
pub fn with_retry<T, F>(mut op: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    let mut attempt: u32 = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && attempt < RETRY_MAX_ATTEMPTS => {
                attempt += 1;
                if attempt % 100 == 0 {
                    trace!(attempt, "still retrying locked statement");
                }
                sleep(backoff(attempt));
            }
            Err(err) => return Err(Error::Db(err)),
        }
    }
}

/// Execute a statement, returning the affected row count.
pub fn exec(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<usize> {
    with_retry(|| conn.execute(sql, params))
}

/// Execute a multi-statement batch (no parameters).
pub fn exec_batch(conn: &Connection, sql: &str) -> Result<()> {
    with_retry(|| conn.execute_batch(sql))
}

/// Run a single-row query.
pub fn query_row<T, F>(conn: &Connection, sql: &str, params: &[&dyn ToSql], f: F) -> Result<T>
where
    F: Fn(&Row<'_>) -> rusqlite::Result<T>,
{
    with_retry(|| conn.query_row(sql, params, &f))
}

/// Run a single-row query that may match nothing.
pub fn query_opt<T, F>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
    f: F,
) -> Result<Option<T>>
where
    F: Fn(&Row<'_>) -> rusqlite::Result<T>,
{
    with_retry(|| conn.query_row(sql, params, &f).optional())
}

/// Collect every row of a query.
pub fn query_all<T, F>(conn: &Connection, sql: &str, params: &[&dyn ToSql], f: F) -> Result<Vec<T>>
where
    F: Fn(&Row<'_>) -> rusqlite::Result<T>,
{
    with_retry(|| {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, &f)?;
        rows.collect::<rusqlite::Result<Vec<T>>>()
    })
}

/// Run `f` inside a transaction; commit on Ok, roll back on Err. The
/// whole body is retried when the failure was transient contention.
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: Fn(&Transaction<'_>) -> rusqlite::Result<T>,
{
    with_retry(|| {
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    })
}
