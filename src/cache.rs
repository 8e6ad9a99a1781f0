//! In-memory thread cache: a per-group window of thread roots backed by
//! the durable `thread_cache` table.
//!
//! The window holds about six pages of roots centered on the requested
//! page; the durable total is stored alongside but independently of the
//! window so pagination controls stay correct even at the window edge.
//! A sweeper drops whole groups once their expiry passes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::{
    THREAD_CACHE_SWEEP_INTERVAL, THREAD_CACHE_TTL, THREAD_WINDOW_LOOKBEHIND, THREAD_WINDOW_PAGES,
};
use crate::error::Result;
use crate::storage::group_store::GroupDbs;
use crate::storage::threads::{self, ThreadCacheRow};

/// Metadata held per thread root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMeta {
    pub root: i64,
    pub root_date: String,
    pub message_count: i64,
    pub child_articles: Vec<i64>,
    pub last_child_number: i64,
    pub last_activity: String,
}

impl From<&ThreadCacheRow> for ThreadMeta {
    fn from(row: &ThreadCacheRow) -> Self {
        Self {
            root: row.thread_root,
            root_date: row.root_date.clone(),
            message_count: row.message_count,
            child_articles: row.child_list(),
            last_child_number: row.last_child_number,
            last_activity: row.last_activity.clone(),
        }
    }
}

#[derive(Debug)]
struct GroupWindow {
    /// Thread roots ordered by last activity, newest first.
    roots: Vec<i64>,
    meta: HashMap<i64, ThreadMeta>,
    /// Index (in threads, not pages) of `roots[0]` within the full
    /// durable ordering.
    window_offset: usize,
    /// Durable total, kept independently of the window.
    total_threads: i64,
    expiry: Instant,
}

#[derive(Default, Debug)]
pub struct ThreadMemCache {
    groups: RwLock<HashMap<String, GroupWindow>>,
}

impl ThreadMemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a page from the window. Misses when the group is absent,
    /// expired, the page falls outside the window, or any root on the
    /// page lost its metadata.
    pub fn get(&self, group: &str, page: usize, page_size: usize) -> Option<(Vec<ThreadMeta>, i64)> {
        let groups = self.groups.read().expect("thread cache poisoned");
        let window = groups.get(group)?;
        if Instant::now() >= window.expiry {
            return None;
        }

        let start = page.saturating_sub(1) * page_size;
        if start < window.window_offset {
            return None;
        }
        let local_start = start - window.window_offset;
        if local_start >= window.roots.len() && start < window.total_threads as usize {
            return None;
        }

        let slice: Vec<i64> = window
            .roots
            .iter()
            .skip(local_start)
            .take(page_size)
            .copied()
            .collect();
        let mut metas = Vec::with_capacity(slice.len());
        for root in slice {
            // Metadata missing for any root forces a refresh.
            metas.push(window.meta.get(&root)?.clone());
        }
        trace!(group, page, hits = metas.len(), "thread cache hit");
        Some((metas, window.total_threads))
    }

    /// Reload the window around `page` from the durable table and serve
    /// from it.
    pub fn refresh(
        &self,
        dbs: &GroupDbs,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<ThreadMeta>, i64)> {
        let window_len = THREAD_WINDOW_PAGES * page_size;
        let offset = (page.saturating_sub(1) * page_size)
            .saturating_sub(THREAD_WINDOW_LOOKBEHIND * page_size);

        let rows = threads::query_thread_cache_window(dbs, window_len as i64, offset as i64)?;
        let total = threads::thread_cache_total(dbs)?;

        let now = Instant::now();
        let mut roots = Vec::with_capacity(rows.len());
        let mut meta = HashMap::with_capacity(rows.len());
        for row in &rows {
            roots.push(row.thread_root);
            meta.insert(row.thread_root, ThreadMeta::from(row));
        }

        let window = GroupWindow {
            roots,
            meta,
            window_offset: offset,
            total_threads: total,
            expiry: now + THREAD_CACHE_TTL,
        };

        let start = (page.saturating_sub(1) * page_size).saturating_sub(offset);
        let metas: Vec<ThreadMeta> = window
            .roots
            .iter()
            .skip(start)
            .take(page_size)
            .filter_map(|root| window.meta.get(root).cloned())
            .collect();

        self.groups
            .write()
            .expect("thread cache poisoned")
            .insert(dbs.name.clone(), window);
        debug!(group = %dbs.name, page, total, "thread cache window refreshed");
        Ok((metas, total))
    }

    /// Drop a group's window entirely.
    pub fn invalidate(&self, group: &str) {
        self.groups
            .write()
            .expect("thread cache poisoned")
            .remove(group);
    }

    /// Drop one root's metadata; the next `get` touching it misses.
    pub fn invalidate_root(&self, group: &str, root: i64) {
        let mut groups = self.groups.write().expect("thread cache poisoned");
        if let Some(window) = groups.get_mut(group) {
            window.meta.remove(&root);
        }
    }

    /// Mirror a committed thread-cache row: update metadata and move the
    /// root to the head of the activity ordering.
    pub fn update_thread_metadata(&self, group: &str, row: &ThreadCacheRow) {
        let mut groups = self.groups.write().expect("thread cache poisoned");
        let Some(window) = groups.get_mut(group) else {
            return;
        };
        let root = row.thread_root;
        let was_known = window.meta.contains_key(&root);
        window.meta.insert(root, ThreadMeta::from(row));
        window.roots.retain(|r| *r != root);
        window.roots.insert(0, root);
        if !was_known {
            window.total_threads += 1;
        }
    }

    /// Drop expired groups.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut groups = self.groups.write().expect("thread cache poisoned");
        let before = groups.len();
        groups.retain(|_, window| window.expiry > now);
        let dropped = before - groups.len();
        if dropped > 0 {
            trace!(dropped, "thread cache sweep");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(THREAD_CACHE_SWEEP_INTERVAL) => cache.sweep(),
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
    use crate::storage::articles::{insert_article_batch, parse_utc, test_article};
    use crate::storage::group_store::GroupStores;
    use crate::storage::migrations::MigrationRunner;
    use crate::storage::threads::insert_thread_roots;
    use std::time::Duration;

    fn open_group(n_roots: usize) -> (tempfile::TempDir, crate::storage::group_store::GroupGuard) {
        let dir = tempfile::tempdir().unwrap();
        let stores = GroupStores::new(
            dir.path().join("db"),
            Duration::from_secs(3600),
            Arc::new(MigrationRunner::new()),
        );
        let guard = stores.get_group_dbs("alt.test").unwrap();

        let articles: Vec<_> = (0..n_roots)
            .map(|i| {
                test_article(
                    &format!("<r{i}@x>"),
                    "",
                    &format!("2024-01-01 {:02}:00:00", i % 24),
                )
            })
            .collect();
        insert_article_batch(&guard, &articles).unwrap();
        let roots: Vec<(i64, chrono::DateTime<chrono::Utc>)> = (0..n_roots)
            .map(|i| {
                (
                    i as i64 + 1,
                    parse_utc(&format!("2024-01-01 {:02}:00:00", i % 24)).unwrap(),
                )
            })
            .collect();
        insert_thread_roots(&guard, &roots).unwrap();
        (dir, guard)
    }

    #[test]
    fn test_miss_then_hit() {
        let (_dir, dbs) = open_group(5);
        let cache = ThreadMemCache::new();
        assert!(cache.get("alt.test", 1, 2).is_none());

        let (metas, total) = cache.refresh(&dbs, 1, 2).unwrap();
        assert_eq!(metas.len(), 2);
        assert_eq!(total, 5);

        let (metas, total) = cache.get("alt.test", 1, 2).unwrap();
        assert_eq!(metas.len(), 2);
        assert_eq!(total, 5);
        // Page 2 is inside the 6-page window too.
        assert!(cache.get("alt.test", 2, 2).is_some());
    }

    #[test]
    fn test_empty_group_has_stable_total() {
        let (_dir, dbs) = open_group(0);
        let cache = ThreadMemCache::new();
        let (metas, total) = cache.refresh(&dbs, 1, 10).unwrap();
        assert!(metas.is_empty());
        assert_eq!(total, 0);
        let (metas, total) = cache.get("alt.test", 1, 10).unwrap();
        assert!(metas.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_page_outside_window_misses() {
        let (_dir, dbs) = open_group(30);
        let cache = ThreadMemCache::new();
        // Window of 6 pages x 2 = 12 roots starting at offset 0.
        cache.refresh(&dbs, 1, 2).unwrap();
        assert!(cache.get("alt.test", 1, 2).is_some());
        assert!(cache.get("alt.test", 6, 2).is_some());
        // Page 10 starts at thread 18, outside the window.
        assert!(cache.get("alt.test", 10, 2).is_none());
    }

    #[test]
    fn test_invalidate_root_forces_miss() {
        let (_dir, dbs) = open_group(4);
        let cache = ThreadMemCache::new();
        cache.refresh(&dbs, 1, 4).unwrap();
        let (metas, _) = cache.get("alt.test", 1, 4).unwrap();
        let victim = metas[0].root;
        cache.invalidate_root("alt.test", victim);
        assert!(cache.get("alt.test", 1, 4).is_none());
    }

    #[test]
    fn test_invalidate_group() {
        let (_dir, dbs) = open_group(2);
        let cache = ThreadMemCache::new();
        cache.refresh(&dbs, 1, 2).unwrap();
        cache.invalidate("alt.test");
        assert!(cache.get("alt.test", 1, 2).is_none());
    }

    #[test]
    fn test_update_thread_metadata_moves_to_head() {
        let (_dir, dbs) = open_group(3);
        let cache = ThreadMemCache::new();
        cache.refresh(&dbs, 1, 3).unwrap();

        let row = ThreadCacheRow {
            thread_root: 1,
            root_date: "2024-01-01 00:00:00".into(),
            message_count: 2,
            child_articles: "9".into(),
            last_child_number: 9,
            last_activity: "2024-02-01 00:00:00".into(),
            created_at: "2024-01-01 00:00:00".into(),
        };
        cache.update_thread_metadata("alt.test", &row);

        let (metas, total) = cache.get("alt.test", 1, 3).unwrap();
        assert_eq!(metas[0].root, 1);
        assert_eq!(metas[0].message_count, 2);
        assert_eq!(metas[0].child_articles, vec![9]);
        // Known root: total unchanged.
        assert_eq!(total, 3);
    }
}
