//! The main store: one long-lived database holding newsgroup metadata
//! and counters, provider definitions, hierarchy aggregates, the
//! outbound post queue, and process status.
//!
//! Counters here are eventually consistent with the per-group stores:
//! the batch orchestrator bumps them once per committed batch.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::config::ProviderConfig;
use crate::error::Result;
use crate::storage::migrations::{MigrationRunner, Scope};
use crate::storage::retry;

/// Process lifecycle states persisted in `system_status`.
pub const STATE_RUNNING: &str = "running";
pub const STATE_SHUTTING_DOWN: &str = "shutting_down";
pub const STATE_CLEAN_SHUTDOWN: &str = "clean_shutdown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Newsgroup {
    pub id: i64,
    pub name: String,
    pub hierarchy: String,
    pub description: String,
    pub active: bool,
    pub message_count: i64,
    pub last_article: i64,
    pub high_water: i64,
    pub low_water: i64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostQueueEntry {
    pub id: i64,
    pub newsgroup_id: i64,
    pub message_id: String,
}

/// The hierarchy of a group is its first dotted component.
pub fn hierarchy_of(group: &str) -> &str {
    group.split('.').next().unwrap_or(group)
}

fn now_string() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug)]
pub struct MainStore {
    conn: Mutex<Connection>,
}

impl MainStore {
    /// Open (creating directories as needed), migrate, and transition
    /// the status row to `running`. A previous state other than
    /// `clean_shutdown` logs a recovery warning but is not repaired.
    pub fn open(path: &Path, runner: &MigrationRunner) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "busy_timeout", 30_000)?;
        runner.apply(&conn, Scope::Main)?;

        let previous: Option<String> = retry::query_opt(
            &conn,
            "SELECT state FROM system_status WHERE id = 1",
            &[],
            |row| row.get(0),
        )?;
        match previous.as_deref() {
            None => {}
            Some(STATE_CLEAN_SHUTDOWN) => {}
            Some(state) => {
                warn!(state, "previous run did not shut down cleanly");
            }
        }
        retry::exec(
            &conn,
            "INSERT OR REPLACE INTO system_status (id, state, last_heartbeat)
             VALUES (1, ?1, ?2)",
            &[&STATE_RUNNING, &now_string()],
        )?;

        info!(path = %path.display(), "main store open");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn heartbeat(&self) -> Result<()> {
        let conn = self.conn.lock().expect("main store poisoned");
        retry::exec(
            &conn,
            "UPDATE system_status SET last_heartbeat = ?1 WHERE id = 1",
            &[&now_string()],
        )?;
        Ok(())
    }

    pub fn set_state(&self, state: &str) -> Result<()> {
        let conn = self.conn.lock().expect("main store poisoned");
        retry::exec(
            &conn,
            "UPDATE system_status SET state = ?1, last_heartbeat = ?2 WHERE id = 1",
            &[&state, &now_string()],
        )?;
        Ok(())
    }

    pub fn state(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("main store poisoned");
        retry::query_opt(
            &conn,
            "SELECT state FROM system_status WHERE id = 1",
            &[],
            |row| row.get(0),
        )
    }

    /// Make sure a newsgroup row exists; returns its id.
    pub fn ensure_newsgroup(&self, name: &str) -> Result<i64> {
        let now = now_string();
        let hierarchy = hierarchy_of(name);
        let conn = self.conn.lock().expect("main store poisoned");
        retry::exec(
            &conn,
            "INSERT OR IGNORE INTO newsgroups (name, hierarchy, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            &[&name, &hierarchy, &now],
        )?;
        retry::query_row(
            &conn,
            "SELECT id FROM newsgroups WHERE name = ?1",
            &[&name],
            |row| row.get(0),
        )
    }

    pub fn get_newsgroup(&self, name: &str) -> Result<Option<Newsgroup>> {
        let conn = self.conn.lock().expect("main store poisoned");
        retry::query_opt(
            &conn,
            "SELECT id, name, hierarchy, description, active, message_count,
                    last_article, high_water, low_water, status
             FROM newsgroups WHERE name = ?1",
            &[&name],
            |row| {
                Ok(Newsgroup {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    hierarchy: row.get(2)?,
                    description: row.get(3)?,
                    active: row.get::<_, i64>(4)? != 0,
                    message_count: row.get(5)?,
                    last_article: row.get(6)?,
                    high_water: row.get(7)?,
                    low_water: row.get(8)?,
                    status: row.get(9)?,
                })
            },
        )
    }

    /// Batch-commit counter update: `message_count += batch`,
    /// `last_article = max(last_article, max_article_num)`.
    pub fn bump_group_counters(
        &self,
        name: &str,
        batch_size: i64,
        max_article_num: i64,
    ) -> Result<()> {
        let now = now_string();
        let hierarchy = hierarchy_of(name);
        let conn = self.conn.lock().expect("main store poisoned");
        retry::exec(
            &conn,
            "INSERT INTO newsgroups (name, hierarchy, message_count, last_article, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (name) DO UPDATE SET
                message_count = newsgroups.message_count + excluded.message_count,
                last_article = MAX(newsgroups.last_article, excluded.last_article),
                updated_at = excluded.updated_at",
            &[&name, &hierarchy, &batch_size, &max_article_num, &now],
        )?;
        // Hierarchy cache learns about the delta cheaply; the periodic
        // aggregation recomputes the real counts.
        retry::exec(
            &conn,
            "INSERT INTO hierarchies (name, last_updated) VALUES (?1, ?2)
             ON CONFLICT (name) DO UPDATE SET last_updated = excluded.last_updated",
            &[&hierarchy, &now],
        )?;
        Ok(())
    }

    /// Remote watermarks observed at GROUP selection time.
    pub fn update_watermarks(&self, name: &str, low: i64, high: i64) -> Result<()> {
        let now = now_string();
        let conn = self.conn.lock().expect("main store poisoned");
        retry::exec(
            &conn,
            "UPDATE newsgroups SET low_water = ?2, high_water = MAX(high_water, ?3),
                    updated_at = ?4
             WHERE name = ?1",
            &[&name, &low, &high, &now],
        )?;
        Ok(())
    }

    /// Recompute hierarchy aggregates from the newsgroups table.
    pub fn refresh_hierarchies(&self) -> Result<()> {
        let now = now_string();
        let conn = self.conn.lock().expect("main store poisoned");
        retry::exec(
            &conn,
            "INSERT INTO hierarchies (name, group_count, last_updated)
             SELECT hierarchy, COUNT(*), ?1 FROM newsgroups
             WHERE hierarchy != '' GROUP BY hierarchy
             ON CONFLICT (name) DO UPDATE SET
                group_count = excluded.group_count,
                last_updated = excluded.last_updated",
            &[&now],
        )?;
        Ok(())
    }

    /// Active group names, optionally restricted to a dotted prefix
    /// (the trailing `*` of the CLI wildcard is already stripped).
    pub fn list_active_groups(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("main store poisoned");
        match prefix {
            Some(prefix) => {
                let pattern = format!("{}%", prefix.replace('%', ""));
                retry::query_all(
                    &conn,
                    "SELECT name FROM newsgroups WHERE active = 1 AND name LIKE ?1 ORDER BY name",
                    &[&pattern],
                    |row| row.get(0),
                )
            }
            None => retry::query_all(
                &conn,
                "SELECT name FROM newsgroups WHERE active = 1 ORDER BY name",
                &[],
                |row| row.get(0),
            ),
        }
    }

    /// Mirror a provider definition from config into the store.
    pub fn upsert_provider(&self, p: &ProviderConfig) -> Result<()> {
        let conn = self.conn.lock().expect("main store poisoned");
        retry::exec(
            &conn,
            "INSERT INTO providers (name, host, port, ssl, username, password,
                                    max_conns, enabled, priority, max_art_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (name) DO UPDATE SET
                host = excluded.host, port = excluded.port, ssl = excluded.ssl,
                username = excluded.username, password = excluded.password,
                max_conns = excluded.max_conns, enabled = excluded.enabled,
                priority = excluded.priority, max_art_size = excluded.max_art_size",
            &[
                &p.name,
                &p.host,
                &(p.port as i64),
                &(p.ssl as i64),
                &p.username,
                &p.password,
                &(p.max_conns as i64),
                &(p.enabled as i64),
                &(p.priority as i64),
                &(p.max_art_size as i64),
            ],
        )?;
        Ok(())
    }

    /// Queue an outbound post for the post-queue worker.
    pub fn insert_post_queue_entry(&self, newsgroup_id: i64, message_id: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("main store poisoned");
        retry::exec(
            &conn,
            "INSERT INTO post_queue (newsgroup_id, message_id, queued_at)
             VALUES (?1, ?2, ?3)",
            &[&newsgroup_id, &message_id, &now_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn pending_post_queue(&self, limit: i64) -> Result<Vec<PostQueueEntry>> {
        let conn = self.conn.lock().expect("main store poisoned");
        retry::query_all(
            &conn,
            "SELECT id, newsgroup_id, message_id FROM post_queue
             WHERE posted_to_remote = 0 ORDER BY id LIMIT ?1",
            &[&limit],
            |row| {
                Ok(PostQueueEntry {
                    id: row.get(0)?,
                    newsgroup_id: row.get(1)?,
                    message_id: row.get(2)?,
                })
            },
        )
    }

    pub fn mark_posted(&self, entry_id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("main store poisoned");
        retry::exec(
            &conn,
            "UPDATE post_queue SET posted_to_remote = 1 WHERE id = ?1",
            &[&entry_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, MainStore) {
        let dir = tempfile::tempdir().unwrap();
        let runner = MigrationRunner::new();
        let store = MainStore::open(&dir.path().join("cfg").join("pugleaf.sq3"), &runner).unwrap();
        (dir, store)
    }

    #[test]
    fn test_hierarchy_of() {
        assert_eq!(hierarchy_of("alt.binaries.test"), "alt");
        assert_eq!(hierarchy_of("comp"), "comp");
    }

    #[test]
    fn test_open_sets_running_state() {
        let (_dir, store) = open_temp();
        assert_eq!(store.state().unwrap().as_deref(), Some(STATE_RUNNING));
    }

    #[test]
    fn test_ensure_newsgroup_is_idempotent() {
        let (_dir, store) = open_temp();
        let id1 = store.ensure_newsgroup("alt.test").unwrap();
        let id2 = store.ensure_newsgroup("alt.test").unwrap();
        assert_eq!(id1, id2);
        let group = store.get_newsgroup("alt.test").unwrap().unwrap();
        assert_eq!(group.hierarchy, "alt");
        assert_eq!(group.message_count, 0);
    }

    #[test]
    fn test_bump_group_counters() {
        let (_dir, store) = open_temp();
        store.ensure_newsgroup("alt.test").unwrap();
        store.bump_group_counters("alt.test", 10, 42).unwrap();
        store.bump_group_counters("alt.test", 5, 40).unwrap();
        let group = store.get_newsgroup("alt.test").unwrap().unwrap();
        assert_eq!(group.message_count, 15);
        // last_article never decreases.
        assert_eq!(group.last_article, 42);
    }

    #[test]
    fn test_bump_creates_missing_row() {
        let (_dir, store) = open_temp();
        store.bump_group_counters("misc.new", 3, 3).unwrap();
        let group = store.get_newsgroup("misc.new").unwrap().unwrap();
        assert_eq!(group.message_count, 3);
        assert_eq!(group.hierarchy, "misc");
    }

    #[test]
    fn test_refresh_hierarchies_counts_groups() {
        let (_dir, store) = open_temp();
        store.ensure_newsgroup("alt.one").unwrap();
        store.ensure_newsgroup("alt.two").unwrap();
        store.ensure_newsgroup("comp.lang").unwrap();
        store.refresh_hierarchies().unwrap();
        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT group_count FROM hierarchies WHERE name = 'alt'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_list_active_groups_prefix() {
        let (_dir, store) = open_temp();
        store.ensure_newsgroup("alt.one").unwrap();
        store.ensure_newsgroup("alt.two").unwrap();
        store.ensure_newsgroup("comp.lang").unwrap();
        let all = store.list_active_groups(None).unwrap();
        assert_eq!(all.len(), 3);
        let alt = store.list_active_groups(Some("alt.")).unwrap();
        assert_eq!(alt, vec!["alt.one".to_string(), "alt.two".to_string()]);
    }

    #[test]
    fn test_post_queue_lifecycle() {
        let (_dir, store) = open_temp();
        let gid = store.ensure_newsgroup("alt.test").unwrap();
        let entry_id = store.insert_post_queue_entry(gid, "<p@x>").unwrap();
        let pending = store.pending_post_queue(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, "<p@x>");
        store.mark_posted(entry_id).unwrap();
        assert!(store.pending_post_queue(10).unwrap().is_empty());
    }

    #[test]
    fn test_shutdown_state_machine() {
        let (_dir, store) = open_temp();
        store.set_state(STATE_SHUTTING_DOWN).unwrap();
        assert_eq!(store.state().unwrap().as_deref(), Some(STATE_SHUTTING_DOWN));
        store.set_state(STATE_CLEAN_SHUTDOWN).unwrap();
        assert_eq!(store.state().unwrap().as_deref(), Some(STATE_CLEAN_SHUTDOWN));
    }
}
