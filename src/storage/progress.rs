//! Durable fetch cursors: `(provider, group) -> last fetched article`.
//!
//! Advances are monotonic; the only way to move a cursor backwards is
//! the explicit rescan marker (-1), which forces date-based planning
//! from the epoch on the next fetch round.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;

use crate::error::Result;
use crate::storage::retry;

/// Cursor value that forces a full rescan of the group.
pub const RESCAN_MARKER: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub provider: String,
    pub newsgroup: String,
    pub last_article: i64,
    pub last_fetched: String,
}

#[derive(Debug)]
pub struct ProgressStore {
    conn: Mutex<Connection>,
}

impl ProgressStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 30_000)?;
        retry::exec_batch(
            &conn,
            "CREATE TABLE IF NOT EXISTS progress (
                provider TEXT NOT NULL,
                newsgroup TEXT NOT NULL,
                last_article INTEGER NOT NULL DEFAULT 0,
                last_fetched TEXT NOT NULL,
                UNIQUE (provider, newsgroup)
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Last fetched article number, 0 when the pair was never seen.
    pub fn last_article(&self, provider: &str, newsgroup: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("progress store poisoned");
        let last = retry::query_opt(
            &conn,
            "SELECT last_article FROM progress WHERE provider = ?1 AND newsgroup = ?2",
            &[&provider, &newsgroup],
            |row| row.get(0),
        )?;
        Ok(last.unwrap_or(0))
    }

    /// Advance the cursor. Never moves backwards: the stored value is
    /// the max of the existing and new positions.
    pub fn advance(&self, provider: &str, newsgroup: &str, last_article: i64) -> Result<()> {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let conn = self.conn.lock().expect("progress store poisoned");
        retry::exec(
            &conn,
            "INSERT INTO progress (provider, newsgroup, last_article, last_fetched)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (provider, newsgroup) DO UPDATE SET
                last_article = MAX(progress.last_article, excluded.last_article),
                last_fetched = excluded.last_fetched",
            &[&provider, &newsgroup, &last_article, &now],
        )?;
        Ok(())
    }

    /// Force the rescan marker, overriding monotonicity.
    pub fn mark_rescan(&self, provider: &str, newsgroup: &str) -> Result<()> {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let conn = self.conn.lock().expect("progress store poisoned");
        retry::exec(
            &conn,
            "INSERT INTO progress (provider, newsgroup, last_article, last_fetched)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (provider, newsgroup) DO UPDATE SET
                last_article = excluded.last_article,
                last_fetched = excluded.last_fetched",
            &[&provider, &newsgroup, &RESCAN_MARKER, &now],
        )?;
        Ok(())
    }

    pub fn all_records(&self) -> Result<Vec<ProgressRecord>> {
        let conn = self.conn.lock().expect("progress store poisoned");
        retry::query_all(
            &conn,
            "SELECT provider, newsgroup, last_article, last_fetched
             FROM progress ORDER BY provider, newsgroup",
            &[],
            |row| {
                Ok(ProgressRecord {
                    provider: row.get(0)?,
                    newsgroup: row.get(1)?,
                    last_article: row.get(2)?,
                    last_fetched: row.get(3)?,
                })
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, ProgressStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::open(&dir.path().join("progress.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_unknown_pair_is_zero() {
        let (_dir, store) = open_temp();
        assert_eq!(store.last_article("prov", "alt.test").unwrap(), 0);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let (_dir, store) = open_temp();
        store.advance("prov", "alt.test", 100).unwrap();
        assert_eq!(store.last_article("prov", "alt.test").unwrap(), 100);

        // A lower position never rewinds the cursor.
        store.advance("prov", "alt.test", 40).unwrap();
        assert_eq!(store.last_article("prov", "alt.test").unwrap(), 100);

        store.advance("prov", "alt.test", 150).unwrap();
        assert_eq!(store.last_article("prov", "alt.test").unwrap(), 150);
    }

    #[test]
    fn test_rescan_marker_overrides() {
        let (_dir, store) = open_temp();
        store.advance("prov", "alt.test", 100).unwrap();
        store.mark_rescan("prov", "alt.test").unwrap();
        assert_eq!(store.last_article("prov", "alt.test").unwrap(), RESCAN_MARKER);
    }

    #[test]
    fn test_pairs_are_independent() {
        let (_dir, store) = open_temp();
        store.advance("a", "alt.test", 10).unwrap();
        store.advance("b", "alt.test", 20).unwrap();
        store.advance("a", "alt.other", 30).unwrap();
        assert_eq!(store.last_article("a", "alt.test").unwrap(), 10);
        assert_eq!(store.last_article("b", "alt.test").unwrap(), 20);
        assert_eq!(store.all_records().unwrap().len(), 3);
    }
}
