//! Storage aggregate: the main store, per-group stores, progress,
//! history, and the process-wide singletons (hash registry, thread
//! memory cache, shutdown channel).
//!
//! Lifecycle: `Database::open` initializes everything once (guarded by
//! a global flag), `shutdown` flips the watch channel, drains history,
//! and walks the status row through `shutting_down` to
//! `clean_shutdown`. The init guard is permanent: a process gets one
//! `Database` for its lifetime, and re-init after shutdown is not
//! permitted.

pub mod articles;
pub mod group_store;
pub mod history;
pub mod main_store;
pub mod migrations;
pub mod paths;
pub mod progress;
pub mod retry;
pub mod threads;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::cache::{ThreadMemCache, ThreadMeta};
use crate::config::{
    PathsConfig, DB_IDLE_TIMEOUT, HEARTBEAT_INTERVAL, HIERARCHY_REFRESH_INTERVAL,
};
use crate::error::{Error, Result};
use crate::storage::articles::OverviewRow;
use crate::storage::group_store::{GroupGuard, GroupStores};
use crate::storage::history::HistoryStore;
use crate::storage::main_store::{MainStore, STATE_CLEAN_SHUTDOWN, STATE_SHUTTING_DOWN};
use crate::storage::migrations::MigrationRunner;
use crate::storage::paths::HashRegistry;
use crate::storage::progress::ProgressStore;
use crate::storage::threads::CachedTreeNode;

/// Init-once guard for the process-wide singletons. Set when `open`
/// succeeds and never cleared afterwards; `shutdown` does not release
/// it, so a second `open` in the same process always fails.
static INIT: AtomicBool = AtomicBool::new(false);

/// In-memory Message-ID -> (article number, thread root) cache, per
/// group. Populated by committed batches, consulted when resolving
/// reply references before falling back to the database.
#[derive(Default, Debug)]
pub struct MsgIdCache {
    groups: Mutex<HashMap<String, HashMap<String, (i64, i64)>>>,
}

impl MsgIdCache {
    pub fn insert(&self, group: &str, message_id: &str, article_num: i64, root: i64) {
        let mut groups = self.groups.lock().expect("msgid cache poisoned");
        groups
            .entry(group.to_string())
            .or_default()
            .insert(message_id.to_string(), (article_num, root));
    }

    pub fn get(&self, group: &str, message_id: &str) -> Option<(i64, i64)> {
        let groups = self.groups.lock().expect("msgid cache poisoned");
        groups.get(group)?.get(message_id).copied()
    }

    pub fn clear_group(&self, group: &str) {
        self.groups
            .lock()
            .expect("msgid cache poisoned")
            .remove(group);
    }
}

/// A thread listing entry served to the rendering layer: the root's
/// overview plus the cached summary.
#[derive(Debug, Clone)]
pub struct ForumThread {
    pub root: OverviewRow,
    pub meta: ThreadMeta,
}

pub struct DatabaseOptions {
    /// Idle age before unused group handles close. The fetcher uses an
    /// aggressive value since it walks many groups.
    pub idle_timeout: Duration,
    /// `--useshorthashlen`, fixed on first use.
    pub short_hash_len: Option<usize>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DB_IDLE_TIMEOUT,
            short_hash_len: None,
        }
    }
}

#[derive(Debug)]
pub struct Database {
    pub paths: PathsConfig,
    pub main: MainStore,
    pub progress: ProgressStore,
    pub history: Arc<HistoryStore>,
    pub groups: Arc<GroupStores>,
    pub hash_registry: Arc<HashRegistry>,
    pub thread_cache: Arc<ThreadMemCache>,
    pub msgid_cache: MsgIdCache,
    shutdown_tx: watch::Sender<bool>,
}

impl Database {
    /// Open every store. At most one successful open per process: a
    /// second call fails even after the first instance shut down.
    pub fn open(paths: PathsConfig, opts: DatabaseOptions) -> Result<Arc<Self>> {
        if INIT
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Validation(
                "database was already initialized in this process".into(),
            ));
        }

        let opened = (|| -> Result<Arc<Self>> {
            let runner = Arc::new(MigrationRunner::new());
            let main = MainStore::open(&paths.main_db_path(), &runner)?;
            let progress = ProgressStore::open(&paths.progress_db_path())?;
            let history = HistoryStore::open(&paths.history_db_path(), opts.short_hash_len)?;
            let groups = Arc::new(GroupStores::new(
                paths.shard_root(),
                opts.idle_timeout,
                runner,
            ));
            let (shutdown_tx, _) = watch::channel(false);

            Ok(Arc::new(Self {
                paths,
                main,
                progress,
                history,
                groups,
                hash_registry: Arc::new(HashRegistry::new()),
                thread_cache: Arc::new(ThreadMemCache::new()),
                msgid_cache: MsgIdCache::default(),
                shutdown_tx,
            }))
        })();

        match opened {
            Ok(db) => Ok(db),
            Err(e) => {
                // A failed open never initialized anything; releasing
                // the guard here lets the caller fix the flag or path
                // and try again. Only a successful open pins it.
                INIT.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Spawn the cron loops: heartbeat, idle-group cleanup, cache and
    /// registry sweepers, and the history writer. Requires a tokio
    /// runtime.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let shutdown = self.subscribe_shutdown();
        self.groups.spawn_cleanup(shutdown.clone());
        self.thread_cache.spawn_sweeper(shutdown.clone());
        self.hash_registry.spawn_sweeper(shutdown.clone());
        self.history.spawn_writer(shutdown.clone());

        let db = self.clone();
        let mut heartbeat_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                        if let Err(e) = db.main.heartbeat() {
                            error!(error = %e, "heartbeat update failed");
                        }
                    }
                    _ = heartbeat_shutdown.changed() => {
                        if *heartbeat_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let db = self.clone();
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HIERARCHY_REFRESH_INTERVAL) => {
                        if let Err(e) = db.main.refresh_hierarchies() {
                            error!(error = %e, "hierarchy aggregation failed");
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

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Signal shutdown, drain pending history writes, and persist the
    /// clean state. The init guard stays set: a shut-down process does
    /// not get a second `Database`.
    pub async fn shutdown(&self) -> Result<()> {
        self.main.set_state(STATE_SHUTTING_DOWN)?;
        let _ = self.shutdown_tx.send(true);
        self.history.wait_quiescent().await;
        self.main.set_state(STATE_CLEAN_SHUTDOWN)?;
        info!("storage shut down cleanly");
        Ok(())
    }

    /// Acquire the per-group store handle (opening it on demand). Keeps
    /// the hash registry warm for reverse shard lookups.
    pub fn get_group_dbs(&self, group: &str) -> Result<GroupGuard> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        self.hash_registry.group_to_hash(group);
        self.groups.get_group_dbs(group)
    }

    // --- read API for the rendering layer --------------------------------

    /// Paginated thread listing: window-cache first, durable refresh on
    /// miss. Returns the page plus the durable total thread count.
    pub fn get_cached_threads(
        &self,
        group: &str,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<ForumThread>, i64)> {
        let dbs = self.get_group_dbs(group)?;
        let (metas, total) = match self.thread_cache.get(group, page, page_size) {
            Some(hit) => hit,
            None => self.thread_cache.refresh(&dbs, page, page_size)?,
        };
        let mut threads = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some(root) = articles::get_overview_by_article_num(&dbs, meta.root)? {
                threads.push(ForumThread { root, meta });
            }
        }
        Ok((threads, total))
    }

    /// Paginated replies of a single thread, arrival-ordered.
    pub fn get_cached_thread_replies(
        &self,
        group: &str,
        root: i64,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<OverviewRow>> {
        let dbs = self.get_group_dbs(group)?;
        threads::get_cached_thread_replies(&dbs, root, page, page_size)
    }

    pub fn get_overview_by_article_num(
        &self,
        group: &str,
        article_num: i64,
    ) -> Result<Option<OverviewRow>> {
        let dbs = self.get_group_dbs(group)?;
        articles::get_overview_by_article_num(&dbs, article_num)
    }

    pub fn get_article_by_num(
        &self,
        group: &str,
        article_num: i64,
    ) -> Result<Option<articles::ArticleRow>> {
        let dbs = self.get_group_dbs(group)?;
        articles::get_article_by_num(&dbs, article_num)
    }

    pub fn get_article_by_message_id(
        &self,
        group: &str,
        message_id: &str,
    ) -> Result<Option<articles::ArticleRow>> {
        let dbs = self.get_group_dbs(group)?;
        articles::get_article_by_message_id(&dbs, message_id)
    }

    /// Flattened, pre-ordered thread tree for rendering.
    pub fn build_thread_tree(&self, group: &str, root: i64) -> Result<Vec<CachedTreeNode>> {
        let dbs = self.get_group_dbs(group)?;
        threads::get_or_build_tree(&dbs, root)
    }

    // --- spam / hide mutators --------------------------------------------

    pub fn increment_article_spam(&self, group: &str, article_num: i64) -> Result<()> {
        let dbs = self.get_group_dbs(group)?;
        articles::increment_article_spam(&dbs, article_num)
    }

    pub fn decrement_article_spam(&self, group: &str, article_num: i64) -> Result<()> {
        let dbs = self.get_group_dbs(group)?;
        articles::decrement_article_spam(&dbs, article_num)
    }

    pub fn increment_article_hide(&self, group: &str, article_num: i64) -> Result<()> {
        let dbs = self.get_group_dbs(group)?;
        articles::increment_article_hide(&dbs, article_num)?;
        self.thread_cache.invalidate(group);
        Ok(())
    }

    pub fn unhide_article(&self, group: &str, article_num: i64) -> Result<()> {
        let dbs = self.get_group_dbs(group)?;
        articles::unhide_article(&dbs, article_num)?;
        self.thread_cache.invalidate(group);
        Ok(())
    }

    pub fn has_user_flagged_spam(
        &self,
        group: &str,
        article_num: i64,
        user_id: i64,
    ) -> Result<bool> {
        let dbs = self.get_group_dbs(group)?;
        articles::has_user_flagged_spam(&dbs, article_num, user_id)
    }

    pub fn record_user_spam_flag(
        &self,
        group: &str,
        article_num: i64,
        user_id: i64,
    ) -> Result<()> {
        let dbs = self.get_group_dbs(group)?;
        articles::record_user_spam_flag(&dbs, article_num, user_id)
    }

    /// Post intake for the excluded posting surface.
    pub fn insert_post_queue_entry(&self, newsgroup_id: i64, message_id: &str) -> Result<i64> {
        self.main.insert_post_queue_entry(newsgroup_id, message_id)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::INIT;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    /// Serializes tests that claim the process-wide database slot.
    pub(crate) static DB_SLOT: Mutex<()> = Mutex::new(());

    /// Releases the init guard between tests. The guard is intentionally
    /// permanent in production; tests hold `DB_SLOT` and clear it so
    /// each one can open its own temp store.
    pub(crate) fn reset_init() {
        INIT.store(false, Ordering::SeqCst);
    }
}
