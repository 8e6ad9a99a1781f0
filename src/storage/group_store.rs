//! Per-group database lifecycle.
//!
//! `get_group_dbs` is the only way to acquire a group handle. An entry
//! is placed in the registry as not-ready under the registry lock, then
//! the directory/open/pragma/migration work runs on the caller's stack
//! with the lock released; concurrent callers for the same group
//! busy-wait with a short nap until the entry is ready. Handles are
//! reference counted; the cleanup cron closes only idle, unreferenced
//! handles, and force-closes the oldest when the open cap is reached.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{
    CLEANUP_INTERVAL, FORCED_CLOSE_FRACTION, MAX_OPEN_DATABASES, OPEN_WAIT_NAP,
};
use crate::error::{Error, Result};
use crate::storage::migrations::MigrationRunner;
use crate::storage::paths;

/// An open per-group database.
#[derive(Debug)]
pub struct GroupDbs {
    pub name: String,
    conn: Mutex<Connection>,
}

impl GroupDbs {
    /// Run `f` with the group's connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("group db poisoned");
        f(&conn)
    }

    /// Run `f` with a mutable connection (for transactions).
    pub fn with_conn_mut<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("group db poisoned");
        f(&mut conn)
    }
}

#[derive(Debug)]
enum EntryState {
    /// Some task is running the open sequence.
    Opening,
    Ready(Arc<GroupDbs>),
}

#[derive(Debug)]
struct GroupEntry {
    state: Mutex<EntryState>,
    in_use: AtomicI64,
    last_used: Mutex<Instant>,
}

/// Registry of lazily opened group databases.
#[derive(Debug)]
pub struct GroupStores {
    shard_root: PathBuf,
    registry: Mutex<HashMap<String, Arc<GroupEntry>>>,
    open_count: AtomicUsize,
    idle_timeout: Duration,
    runner: Arc<MigrationRunner>,
}

/// RAII handle; dropping it releases the reference and refreshes the
/// idle timestamp. It never closes the database.
pub struct GroupGuard {
    entry: Arc<GroupEntry>,
    dbs: Arc<GroupDbs>,
}

impl std::ops::Deref for GroupGuard {
    type Target = GroupDbs;

    fn deref(&self) -> &Self::Target {
        &self.dbs
    }
}

impl GroupGuard {
    /// Clone the inner handle; the guard still owns the reference count.
    pub fn dbs(&self) -> Arc<GroupDbs> {
        self.dbs.clone()
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        *self.entry.last_used.lock().expect("entry poisoned") = Instant::now();
        self.entry.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GroupStores {
    pub fn new(shard_root: PathBuf, idle_timeout: Duration, runner: Arc<MigrationRunner>) -> Self {
        Self {
            shard_root,
            registry: Mutex::new(HashMap::new()),
            open_count: AtomicUsize::new(0),
            idle_timeout,
            runner,
        }
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Acquire a handle for `group`, opening its database on demand.
    pub fn get_group_dbs(&self, group: &str) -> Result<GroupGuard> {
        if group.is_empty() {
            return Err(Error::ConfigMissing("group store"));
        }

        loop {
            enum Claim {
                Opener(Arc<GroupEntry>),
                Existing(Arc<GroupEntry>),
            }

            let claim = {
                let mut registry = self.registry.lock().expect("registry poisoned");
                match registry.get(group) {
                    Some(entry) => Claim::Existing(entry.clone()),
                    None => {
                        let entry = Arc::new(GroupEntry {
                            state: Mutex::new(EntryState::Opening),
                            in_use: AtomicI64::new(0),
                            last_used: Mutex::new(Instant::now()),
                        });
                        registry.insert(group.to_string(), entry.clone());
                        Claim::Opener(entry)
                    }
                }
            };

            match claim {
                Claim::Opener(entry) => {
                    // Open on this stack, registry lock released.
                    match self.open_group(group) {
                        Ok(dbs) => {
                            let dbs = Arc::new(dbs);
                            *entry.state.lock().expect("entry poisoned") =
                                EntryState::Ready(dbs.clone());
                            entry.in_use.fetch_add(1, Ordering::SeqCst);
                            self.open_count.fetch_add(1, Ordering::SeqCst);
                            return Ok(GroupGuard { entry, dbs });
                        }
                        Err(e) => {
                            // Withdraw the placeholder so later callers retry.
                            self.registry
                                .lock()
                                .expect("registry poisoned")
                                .remove(group);
                            return Err(e);
                        }
                    }
                }
                Claim::Existing(entry) => {
                    let ready = {
                        let state = entry.state.lock().expect("entry poisoned");
                        match &*state {
                            EntryState::Ready(dbs) => Some(dbs.clone()),
                            EntryState::Opening => None,
                        }
                    };
                    match ready {
                        Some(dbs) => {
                            entry.in_use.fetch_add(1, Ordering::SeqCst);
                            *entry.last_used.lock().expect("entry poisoned") = Instant::now();
                            return Ok(GroupGuard { entry, dbs });
                        }
                        None => {
                            // Another caller is still initializing.
                            std::thread::sleep(OPEN_WAIT_NAP);
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Directory, file, pragmas, migrations.
    fn open_group(&self, group: &str) -> Result<GroupDbs> {
        let path = paths::group_db_path(&self.shard_root, group);
        let dir = path
            .parent()
            .ok_or(Error::ConfigMissing("group shard root"))?;
        std::fs::create_dir_all(dir)?;

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "busy_timeout", 30_000)?;
        self.runner.apply_group(&conn, group)?;

        debug!(group, path = %path.display(), "group database open");
        Ok(GroupDbs {
            name: group.to_string(),
            conn: Mutex::new(conn),
        })
    }

    /// Close idle handles. Under the open cap, anything unreferenced and
    /// idle past the timeout goes; at the cap, the oldest unreferenced
    /// entries are force-closed, up to 20% of the cap.
    pub fn cleanup_idle_groups(&self) {
        let over_cap = self.open_count() >= MAX_OPEN_DATABASES;

        // Collect candidates without holding the registry lock while
        // closing.
        let mut idle: Vec<(String, Arc<GroupEntry>, Duration)> = {
            let registry = self.registry.lock().expect("registry poisoned");
            registry
                .iter()
                .filter(|(_, e)| e.in_use.load(Ordering::SeqCst) == 0)
                .filter(|(_, e)| matches!(*e.state.lock().expect("entry poisoned"), EntryState::Ready(_)))
                .map(|(name, e)| {
                    let age = e.last_used.lock().expect("entry poisoned").elapsed();
                    (name.clone(), e.clone(), age)
                })
                .collect()
        };

        let victims: Vec<String> = if over_cap {
            idle.sort_by(|a, b| b.2.cmp(&a.2));
            let budget = ((MAX_OPEN_DATABASES as f64) * FORCED_CLOSE_FRACTION) as usize;
            idle.into_iter()
                .take(budget.max(1))
                .map(|(name, _, _)| name)
                .collect()
        } else {
            idle.into_iter()
                .filter(|(_, _, age)| *age > self.idle_timeout)
                .map(|(name, _, _)| name)
                .collect()
        };

        if victims.is_empty() {
            return;
        }

        let mut closed = 0usize;
        {
            let mut registry = self.registry.lock().expect("registry poisoned");
            for name in victims {
                // Re-check under the lock: a fetch may have grabbed it.
                let still_idle = registry
                    .get(&name)
                    .map(|e| e.in_use.load(Ordering::SeqCst) == 0)
                    .unwrap_or(false);
                if still_idle {
                    registry.remove(&name);
                    self.open_count.fetch_sub(1, Ordering::SeqCst);
                    closed += 1;
                }
            }
        }
        if closed > 0 {
            info!(closed, open = self.open_count(), over_cap, "closed idle group databases");
        }
    }

    /// Background cron wrapper around `cleanup_idle_groups`.
    pub fn spawn_cleanup(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let stores = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                        let stores = stores.clone();
                        // Registry locks are short but the close itself
                        // can touch the file system.
                        let result = tokio::task::spawn_blocking(move || {
                            stores.cleanup_idle_groups();
                        })
                        .await;
                        if result.is_err() {
                            warn!("group cleanup task panicked");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp(idle: Duration) -> (tempfile::TempDir, Arc<GroupStores>) {
        let dir = tempfile::tempdir().unwrap();
        let stores = Arc::new(GroupStores::new(
            dir.path().join("db"),
            idle,
            Arc::new(MigrationRunner::new()),
        ));
        (dir, stores)
    }

    #[test]
    fn test_open_creates_shard_layout() {
        let (dir, stores) = open_temp(Duration::from_secs(3600));
        let guard = stores.get_group_dbs("alt.test").unwrap();
        assert_eq!(guard.name, "alt.test");
        let expected = paths::group_db_path(&dir.path().join("db"), "alt.test");
        assert!(expected.exists());
        assert_eq!(stores.open_count(), 1);
    }

    #[test]
    fn test_reacquire_shares_entry() {
        let (_dir, stores) = open_temp(Duration::from_secs(3600));
        let a = stores.get_group_dbs("alt.test").unwrap();
        let b = stores.get_group_dbs("alt.test").unwrap();
        assert!(Arc::ptr_eq(&a.dbs(), &b.dbs()));
        assert_eq!(stores.open_count(), 1);
    }

    #[test]
    fn test_cleanup_respects_in_use() {
        let (_dir, stores) = open_temp(Duration::from_millis(0));
        let guard = stores.get_group_dbs("alt.test").unwrap();
        stores.cleanup_idle_groups();
        // Held guard keeps the entry alive despite the zero timeout.
        assert_eq!(stores.open_count(), 1);
        drop(guard);
        stores.cleanup_idle_groups();
        assert_eq!(stores.open_count(), 0);
    }

    #[test]
    fn test_cleanup_keeps_fresh_entries() {
        let (_dir, stores) = open_temp(Duration::from_secs(3600));
        drop(stores.get_group_dbs("alt.test").unwrap());
        stores.cleanup_idle_groups();
        assert_eq!(stores.open_count(), 1);
    }

    #[test]
    fn test_group_schema_applied() {
        let (_dir, stores) = open_temp(Duration::from_secs(3600));
        let guard = stores.get_group_dbs("alt.test").unwrap();
        let count = guard
            .with_conn(|conn| {
                Ok(conn
                    .query_row("SELECT COUNT(*) FROM articles", [], |r| r.get::<_, i64>(0))
                    .unwrap())
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_empty_group_name_is_config_missing() {
        let (_dir, stores) = open_temp(Duration::from_secs(3600));
        assert!(matches!(
            stores.get_group_dbs(""),
            Err(Error::ConfigMissing(_))
        ));
    }
}
