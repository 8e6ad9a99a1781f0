//! Thread edges, the durable per-group thread cache, and cached render
//! trees.
//!
//! A thread root is encoded as a self-edge (`parent_article` NULL,
//! `child_article` = root, depth 0). Every threaded reply has exactly
//! one edge with itself as child; articles whose references never
//! resolve stay orphans and get no edge at all.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::ToSql;

use crate::error::Result;
use crate::storage::articles::{format_utc, OverviewRow};
use crate::storage::group_store::GroupDbs;
use crate::storage::retry;

/// A durable `thread_cache` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadCacheRow {
    pub thread_root: i64,
    pub root_date: String,
    pub message_count: i64,
    /// Comma-separated reply article numbers, insertion-ordered.
    pub child_articles: String,
    pub last_child_number: i64,
    pub last_activity: String,
    pub created_at: String,
}

impl ThreadCacheRow {
    pub fn child_list(&self) -> Vec<i64> {
        if self.child_articles.is_empty() {
            return Vec::new();
        }
        self.child_articles
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect()
    }
}

/// A resolved reply ready for threading.
#[derive(Debug, Clone)]
pub struct ReplyEdge {
    pub child: i64,
    pub root: i64,
    pub parent: i64,
    pub child_date: DateTime<Utc>,
}

/// Pending thread-cache append for one root.
#[derive(Debug, Clone, Default)]
pub struct ThreadCacheUpdate {
    /// New children in arrival order, with their dates.
    pub new_children: Vec<(i64, DateTime<Utc>)>,
}

/// One node of a flattened, pre-ordered thread tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedTreeNode {
    pub thread_root: i64,
    pub article_num: i64,
    pub parent_article: Option<i64>,
    pub depth: i64,
    pub child_count: i64,
    pub descendant_count: i64,
    /// Position encoded as `0.i1.i2...`.
    pub tree_path: String,
    pub sort_order: i64,
}

fn cache_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadCacheRow> {
    Ok(ThreadCacheRow {
        thread_root: row.get(0)?,
        root_date: row.get(1)?,
        message_count: row.get(2)?,
        child_articles: row.get(3)?,
        last_child_number: row.get(4)?,
        last_activity: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const CACHE_COLUMNS: &str = "thread_root, root_date, message_count, child_articles, \
     last_child_number, last_activity, created_at";

/// Insert self-edges for new thread roots and seed their cache rows.
pub fn insert_thread_roots(dbs: &GroupDbs, roots: &[(i64, DateTime<Utc>)]) -> Result<()> {
    if roots.is_empty() {
        return Ok(());
    }
    dbs.with_conn_mut(|conn| {
        retry::transaction(conn, |tx| {
            let mut edge = tx.prepare_cached(
                "INSERT OR IGNORE INTO threads
                   (root_article, parent_article, child_article, depth, thread_order)
                 VALUES (?1, NULL, ?1, 0, 0)",
            )?;
            for (root, _) in roots {
                edge.execute([root])?;
            }
            Ok(())
        })
    })?;

    // Cache rows are seeded after the edge commit; a crash in between
    // leaves them to be created lazily by the next batch update.
    let now = format_utc(Utc::now());
    dbs.with_conn_mut(|conn| {
        retry::transaction(conn, |tx| {
            let mut seed = tx.prepare_cached(
                "INSERT OR IGNORE INTO thread_cache
                   (thread_root, root_date, message_count, child_articles,
                    last_child_number, last_activity, created_at)
                 VALUES (?1, ?2, 1, '', 0, ?2, ?3)",
            )?;
            for (root, date) in roots {
                seed.execute(rusqlite::params![root, format_utc(*date), now])?;
            }
            Ok(())
        })
    })
}

/// Insert reply edges. Depth derives from the parent's edge (1 when the
/// parent edge is the root self-edge or is missing); thread order is
/// the arrival position within the root.
pub fn insert_reply_edges(dbs: &GroupDbs, replies: &[ReplyEdge]) -> Result<()> {
    if replies.is_empty() {
        return Ok(());
    }
    dbs.with_conn_mut(|conn| {
        retry::transaction(conn, |tx| {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO threads
                   (root_article, parent_article, child_article, depth, thread_order)
                 VALUES (?1, ?2, ?3,
                         COALESCE((SELECT depth + 1 FROM threads WHERE child_article = ?2), 1),
                         (SELECT COUNT(*) FROM threads WHERE root_article = ?1))",
            )?;
            for reply in replies {
                insert.execute(rusqlite::params![reply.root, reply.parent, reply.child])?;
            }
            Ok(())
        })
    })
}

/// Root of the thread containing `article_num`, if it is threaded.
pub fn thread_root_of(dbs: &GroupDbs, article_num: i64) -> Result<Option<i64>> {
    dbs.with_conn(|conn| {
        retry::query_opt(
            conn,
            "SELECT root_article FROM threads WHERE child_article = ?1",
            &[&article_num],
            |row| row.get(0),
        )
    })
}

/// Apply accumulated reply-count deltas in a single CASE update.
pub fn batch_update_reply_counts(dbs: &GroupDbs, deltas: &HashMap<String, i64>) -> Result<()> {
    if deltas.is_empty() {
        return Ok(());
    }
    let pairs: Vec<(&String, &i64)> = deltas.iter().collect();

    let mut sql = String::from("UPDATE articles SET reply_count = CASE message_id ");
    for _ in &pairs {
        sql.push_str("WHEN ? THEN reply_count + ? ");
    }
    sql.push_str("ELSE reply_count END WHERE message_id IN (");
    sql.push_str(&vec!["?"; pairs.len()].join(","));
    sql.push(')');

    let mut params: Vec<&dyn ToSql> = Vec::with_capacity(pairs.len() * 3);
    for (id, delta) in &pairs {
        params.push(*id as &dyn ToSql);
        params.push(*delta as &dyn ToSql);
    }
    for (id, _) in &pairs {
        params.push(*id as &dyn ToSql);
    }

    dbs.with_conn(|conn| retry::exec(conn, &sql, &params).map(|_| ()))
}

/// Append new children to the cache rows of touched roots, one
/// transaction for the whole set. Absent rows are seeded from the first
/// update. Returns the resulting rows for the in-memory mirror.
pub fn batch_update_thread_cache(
    dbs: &GroupDbs,
    updates: &HashMap<i64, ThreadCacheUpdate>,
) -> Result<Vec<ThreadCacheRow>> {
    if updates.is_empty() {
        return Ok(Vec::new());
    }
    let now = format_utc(Utc::now());
    dbs.with_conn_mut(|conn| {
        retry::transaction(conn, |tx| {
            let mut results = Vec::with_capacity(updates.len());
            for (root, update) in updates {
                if update.new_children.is_empty() {
                    continue;
                }
                let existing: Option<ThreadCacheRow> = tx
                    .query_row(
                        &format!("SELECT {CACHE_COLUMNS} FROM thread_cache WHERE thread_root = ?1"),
                        [root],
                        cache_row,
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                let max_new_date = update
                    .new_children
                    .iter()
                    .map(|(_, date)| *date)
                    .max()
                    .map(format_utc)
                    .unwrap_or_else(|| now.clone());
                let appended: Vec<String> = update
                    .new_children
                    .iter()
                    .map(|(num, _)| num.to_string())
                    .collect();
                let last_child = update
                    .new_children
                    .last()
                    .map(|(num, _)| *num)
                    .unwrap_or(0);

                let row = match existing {
                    Some(mut row) => {
                        let mut children = row.child_articles.clone();
                        if !children.is_empty() {
                            children.push(',');
                        }
                        children.push_str(&appended.join(","));
                        row.message_count += update.new_children.len() as i64;
                        row.child_articles = children;
                        row.last_child_number = last_child;
                        if max_new_date > row.last_activity {
                            row.last_activity = max_new_date;
                        }
                        tx.execute(
                            "UPDATE thread_cache SET message_count = ?2, child_articles = ?3,
                                    last_child_number = ?4, last_activity = ?5
                             WHERE thread_root = ?1",
                            rusqlite::params![
                                row.thread_root,
                                row.message_count,
                                row.child_articles,
                                row.last_child_number,
                                row.last_activity,
                            ],
                        )?;
                        row
                    }
                    None => {
                        // Seed from the root article's date when the
                        // root predates the cache table.
                        let root_date: String = tx
                            .query_row(
                                "SELECT date_sent FROM articles WHERE article_num = ?1",
                                [root],
                                |r| r.get(0),
                            )
                            .unwrap_or_else(|_| now.clone());
                        let last_activity = if max_new_date > root_date {
                            max_new_date.clone()
                        } else {
                            root_date.clone()
                        };
                        let row = ThreadCacheRow {
                            thread_root: *root,
                            root_date,
                            message_count: 1 + update.new_children.len() as i64,
                            child_articles: appended.join(","),
                            last_child_number: last_child,
                            last_activity,
                            created_at: now.clone(),
                        };
                        tx.execute(
                            "INSERT INTO thread_cache
                               (thread_root, root_date, message_count, child_articles,
                                last_child_number, last_activity, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            rusqlite::params![
                                row.thread_root,
                                row.root_date,
                                row.message_count,
                                row.child_articles,
                                row.last_child_number,
                                row.last_activity,
                                row.created_at,
                            ],
                        )?;
                        row
                    }
                };
                results.push(row);
            }
            Ok(results)
        })
    })
}

/// A window of cache rows, newest activity first, hidden roots
/// filtered out.
pub fn query_thread_cache_window(
    dbs: &GroupDbs,
    limit: i64,
    offset: i64,
) -> Result<Vec<ThreadCacheRow>> {
    dbs.with_conn(|conn| {
        retry::query_all(
            conn,
            "SELECT tc.thread_root, tc.root_date, tc.message_count, tc.child_articles,
                    tc.last_child_number, tc.last_activity, tc.created_at
             FROM thread_cache tc
             JOIN articles a ON a.article_num = tc.thread_root
             WHERE a.hide = 0
             ORDER BY tc.last_activity DESC
             LIMIT ?1 OFFSET ?2",
            &[&limit, &offset],
            cache_row,
        )
    })
}

/// Durable total thread count, independent of any window.
pub fn thread_cache_total(dbs: &GroupDbs) -> Result<i64> {
    dbs.with_conn(|conn| {
        retry::query_row(
            conn,
            "SELECT COUNT(*) FROM thread_cache tc
             JOIN articles a ON a.article_num = tc.thread_root
             WHERE a.hide = 0",
            &[],
            |row| row.get(0),
        )
    })
}

pub fn get_thread_cache_row(dbs: &GroupDbs, root: i64) -> Result<Option<ThreadCacheRow>> {
    dbs.with_conn(|conn| {
        retry::query_opt(
            conn,
            &format!("SELECT {CACHE_COLUMNS} FROM thread_cache WHERE thread_root = ?1"),
            &[&root],
            cache_row,
        )
    })
}

/// Paginated replies of one thread, in child-list (arrival) order.
pub fn get_cached_thread_replies(
    dbs: &GroupDbs,
    root: i64,
    page: usize,
    page_size: usize,
) -> Result<Vec<OverviewRow>> {
    let Some(row) = get_thread_cache_row(dbs, root)? else {
        return Ok(Vec::new());
    };
    let children = row.child_list();
    let start = page.saturating_sub(1) * page_size;
    let slice: Vec<i64> = children.into_iter().skip(start).take(page_size).collect();
    let mut replies = Vec::with_capacity(slice.len());
    for num in slice {
        if let Some(overview) = crate::storage::articles::get_overview_by_article_num(dbs, num)? {
            replies.push(overview);
        }
    }
    Ok(replies)
}

/// Build the flattened tree for a thread from its edges: siblings
/// ordered by `date_sent` then article number, preorder traversal,
/// `descendant_count` aggregated bottom-up.
pub fn build_thread_tree(dbs: &GroupDbs, root: i64) -> Result<Vec<CachedTreeNode>> {
    // (child, parent, date) for every member of the thread.
    let members: Vec<(i64, Option<i64>, String)> = dbs.with_conn(|conn| {
        retry::query_all(
            conn,
            "SELECT t.child_article, t.parent_article, COALESCE(a.date_sent, '')
             FROM threads t
             LEFT JOIN articles a ON a.article_num = t.child_article
             WHERE t.root_article = ?1",
            &[&root],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
    })?;
    if members.is_empty() {
        return Ok(Vec::new());
    }

    let mut children: HashMap<i64, Vec<(i64, String)>> = HashMap::new();
    for (child, parent, date) in &members {
        if let Some(parent) = parent {
            children
                .entry(*parent)
                .or_default()
                .push((*child, date.clone()));
        }
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    }

    // Iterative preorder with explicit paths; depth-first so the
    // flattened order is render order.
    let mut nodes: Vec<CachedTreeNode> = Vec::with_capacity(members.len());
    let mut stack: Vec<(i64, Option<i64>, i64, String)> = vec![(root, None, 0, "0".to_string())];
    while let Some((article, parent, depth, path)) = stack.pop() {
        let kids = children.get(&article).cloned().unwrap_or_default();
        nodes.push(CachedTreeNode {
            thread_root: root,
            article_num: article,
            parent_article: parent,
            depth,
            child_count: kids.len() as i64,
            descendant_count: 0,
            tree_path: path.clone(),
            sort_order: 0,
        });
        for (idx, (kid, _)) in kids.iter().enumerate().rev() {
            stack.push((*kid, Some(article), depth + 1, format!("{path}.{idx}")));
        }
    }
    for (order, node) in nodes.iter_mut().enumerate() {
        node.sort_order = order as i64;
    }

    // descendant_count = sum over children of (1 + their descendants);
    // walk deepest-first so children are final before their parents.
    let mut descendants: HashMap<i64, i64> = HashMap::new();
    let mut by_depth: Vec<&CachedTreeNode> = nodes.iter().collect();
    by_depth.sort_by(|a, b| b.depth.cmp(&a.depth));
    let parent_of: HashMap<i64, Option<i64>> = nodes
        .iter()
        .map(|n| (n.article_num, n.parent_article))
        .collect();
    for node in by_depth {
        let own = descendants.get(&node.article_num).copied().unwrap_or(0);
        if let Some(Some(parent)) = parent_of.get(&node.article_num) {
            *descendants.entry(*parent).or_insert(0) += 1 + own;
        }
    }
    for node in nodes.iter_mut() {
        node.descendant_count = descendants.get(&node.article_num).copied().unwrap_or(0);
    }

    Ok(nodes)
}

/// Persist a freshly built tree, replacing any previous rows.
pub fn store_cached_tree(dbs: &GroupDbs, root: i64, nodes: &[CachedTreeNode]) -> Result<()> {
    dbs.with_conn_mut(|conn| {
        retry::transaction(conn, |tx| {
            tx.execute("DELETE FROM cached_trees WHERE thread_root = ?1", [root])?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO cached_trees
                   (thread_root, article_num, parent_article, depth, child_count,
                    descendant_count, tree_path, sort_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for node in nodes {
                insert.execute(rusqlite::params![
                    node.thread_root,
                    node.article_num,
                    node.parent_article,
                    node.depth,
                    node.child_count,
                    node.descendant_count,
                    node.tree_path,
                    node.sort_order,
                ])?;
            }
            Ok(())
        })
    })
}

/// Load a cached tree, building and persisting it when absent.
pub fn get_or_build_tree(dbs: &GroupDbs, root: i64) -> Result<Vec<CachedTreeNode>> {
    let cached: Vec<CachedTreeNode> = dbs.with_conn(|conn| {
        retry::query_all(
            conn,
            "SELECT thread_root, article_num, parent_article, depth, child_count,
                    descendant_count, tree_path, sort_order
             FROM cached_trees WHERE thread_root = ?1 ORDER BY sort_order",
            &[&root],
            |row| {
                Ok(CachedTreeNode {
                    thread_root: row.get(0)?,
                    article_num: row.get(1)?,
                    parent_article: row.get(2)?,
                    depth: row.get(3)?,
                    child_count: row.get(4)?,
                    descendant_count: row.get(5)?,
                    tree_path: row.get(6)?,
                    sort_order: row.get(7)?,
                })
            },
        )
    })?;
    if !cached.is_empty() {
        return Ok(cached);
    }
    let nodes = build_thread_tree(dbs, root)?;
    if !nodes.is_empty() {
        store_cached_tree(dbs, root, &nodes)?;
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::articles::{insert_article_batch, parse_utc, test_article};
    use crate::storage::group_store::GroupStores;
    use crate::storage::migrations::MigrationRunner;
    use std::sync::Arc;
    use std::time::Duration;

    fn open_group() -> (tempfile::TempDir, crate::storage::group_store::GroupGuard) {
        let dir = tempfile::tempdir().unwrap();
        let stores = GroupStores::new(
            dir.path().join("db"),
            Duration::from_secs(3600),
            Arc::new(MigrationRunner::new()),
        );
        let guard = stores.get_group_dbs("alt.test").unwrap();
        (dir, guard)
    }

    fn date(s: &str) -> DateTime<Utc> {
        parse_utc(s).unwrap()
    }

    /// Seed a 4-article thread: 1 <- 2, 1 <- 3, 3 <- 4.
    fn seed_thread(dbs: &GroupDbs) {
        insert_article_batch(
            dbs,
            &[
                test_article("<a@x>", "", "2024-01-01 00:00:00"),
                test_article("<b@x>", "<a@x>", "2024-01-01 01:00:00"),
                test_article("<c@x>", "<a@x>", "2024-01-01 00:30:00"),
                test_article("<d@x>", "<a@x> <c@x>", "2024-01-01 02:00:00"),
            ],
        )
        .unwrap();
        insert_thread_roots(dbs, &[(1, date("2024-01-01 00:00:00"))]).unwrap();
        insert_reply_edges(
            dbs,
            &[
                ReplyEdge {
                    child: 2,
                    root: 1,
                    parent: 1,
                    child_date: date("2024-01-01 01:00:00"),
                },
                ReplyEdge {
                    child: 3,
                    root: 1,
                    parent: 1,
                    child_date: date("2024-01-01 00:30:00"),
                },
                ReplyEdge {
                    child: 4,
                    root: 1,
                    parent: 3,
                    child_date: date("2024-01-01 02:00:00"),
                },
            ],
        )
        .unwrap();
    }

    #[test]
    fn test_root_self_edge() {
        let (_dir, dbs) = open_group();
        insert_article_batch(&dbs, &[test_article("<a@x>", "", "2024-01-01 00:00:00")]).unwrap();
        insert_thread_roots(&dbs, &[(1, date("2024-01-01 00:00:00"))]).unwrap();

        let (parent, depth): (Option<i64>, i64) = dbs
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT parent_article, depth FROM threads WHERE child_article = 1",
                        [],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .unwrap())
            })
            .unwrap();
        assert_eq!(parent, None);
        assert_eq!(depth, 0);
        assert_eq!(thread_root_of(&dbs, 1).unwrap(), Some(1));

        let cache = get_thread_cache_row(&dbs, 1).unwrap().unwrap();
        assert_eq!(cache.message_count, 1);
        assert_eq!(cache.child_articles, "");
        assert_eq!(cache.last_activity, "2024-01-01 00:00:00");
    }

    #[test]
    fn test_reply_edges_and_depth() {
        let (_dir, dbs) = open_group();
        seed_thread(&dbs);
        assert_eq!(thread_root_of(&dbs, 2).unwrap(), Some(1));
        assert_eq!(thread_root_of(&dbs, 4).unwrap(), Some(1));
        // Orphans have no edge.
        assert_eq!(thread_root_of(&dbs, 99).unwrap(), None);

        let depth4: i64 = dbs
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT depth FROM threads WHERE child_article = 4",
                        [],
                        |r| r.get(0),
                    )
                    .unwrap())
            })
            .unwrap();
        assert_eq!(depth4, 2);
    }

    #[test]
    fn test_reply_count_case_update() {
        let (_dir, dbs) = open_group();
        seed_thread(&dbs);
        let mut deltas = HashMap::new();
        deltas.insert("<a@x>".to_string(), 2i64);
        deltas.insert("<c@x>".to_string(), 1i64);
        batch_update_reply_counts(&dbs, &deltas).unwrap();

        let a = crate::storage::articles::get_article_by_message_id(&dbs, "<a@x>")
            .unwrap()
            .unwrap();
        let c = crate::storage::articles::get_article_by_message_id(&dbs, "<c@x>")
            .unwrap()
            .unwrap();
        let b = crate::storage::articles::get_article_by_message_id(&dbs, "<b@x>")
            .unwrap()
            .unwrap();
        assert_eq!(a.reply_count, 2);
        assert_eq!(c.reply_count, 1);
        assert_eq!(b.reply_count, 0);
    }

    #[test]
    fn test_thread_cache_append_and_activity() {
        let (_dir, dbs) = open_group();
        seed_thread(&dbs);
        let mut updates = HashMap::new();
        updates.insert(
            1i64,
            ThreadCacheUpdate {
                new_children: vec![
                    (2, date("2024-01-01 01:00:00")),
                    (3, date("2024-01-01 00:30:00")),
                    (4, date("2024-01-01 02:00:00")),
                ],
            },
        );
        let rows = batch_update_thread_cache(&dbs, &updates).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.message_count, 4);
        assert_eq!(row.child_list(), vec![2, 3, 4]);
        assert_eq!(row.last_child_number, 4);
        assert_eq!(row.last_activity, "2024-01-01 02:00:00");
        // Invariant: message_count == 1 + children.
        assert_eq!(row.message_count, 1 + row.child_list().len() as i64);
    }

    #[test]
    fn test_thread_cache_seeded_when_absent() {
        let (_dir, dbs) = open_group();
        insert_article_batch(
            &dbs,
            &[
                test_article("<a@x>", "", "2024-01-01 00:00:00"),
                test_article("<b@x>", "<a@x>", "2024-01-01 01:00:00"),
            ],
        )
        .unwrap();
        // Root edge exists but its cache row was never created.
        dbs.with_conn(|conn| {
            conn.execute(
                "INSERT INTO threads (root_article, parent_article, child_article, depth, thread_order)
                 VALUES (1, NULL, 1, 0, 0)",
                [],
            )
            .unwrap();
            Ok(())
        })
        .unwrap();

        let mut updates = HashMap::new();
        updates.insert(
            1i64,
            ThreadCacheUpdate {
                new_children: vec![(2, date("2024-01-01 01:00:00"))],
            },
        );
        let rows = batch_update_thread_cache(&dbs, &updates).unwrap();
        assert_eq!(rows[0].root_date, "2024-01-01 00:00:00");
        assert_eq!(rows[0].message_count, 2);
        assert_eq!(rows[0].last_activity, "2024-01-01 01:00:00");
    }

    #[test]
    fn test_window_filters_hidden_roots() {
        let (_dir, dbs) = open_group();
        insert_article_batch(
            &dbs,
            &[
                test_article("<a@x>", "", "2024-01-01 00:00:00"),
                test_article("<b@x>", "", "2024-01-02 00:00:00"),
            ],
        )
        .unwrap();
        insert_thread_roots(
            &dbs,
            &[
                (1, date("2024-01-01 00:00:00")),
                (2, date("2024-01-02 00:00:00")),
            ],
        )
        .unwrap();

        let window = query_thread_cache_window(&dbs, 10, 0).unwrap();
        assert_eq!(window.len(), 2);
        // Newest activity first.
        assert_eq!(window[0].thread_root, 2);
        assert_eq!(thread_cache_total(&dbs).unwrap(), 2);

        crate::storage::articles::increment_article_hide(&dbs, 2).unwrap();
        let window = query_thread_cache_window(&dbs, 10, 0).unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].thread_root, 1);
        assert_eq!(thread_cache_total(&dbs).unwrap(), 1);
    }

    #[test]
    fn test_cached_thread_replies_pagination() {
        let (_dir, dbs) = open_group();
        seed_thread(&dbs);
        let mut updates = HashMap::new();
        updates.insert(
            1i64,
            ThreadCacheUpdate {
                new_children: vec![
                    (2, date("2024-01-01 01:00:00")),
                    (3, date("2024-01-01 00:30:00")),
                    (4, date("2024-01-01 02:00:00")),
                ],
            },
        );
        batch_update_thread_cache(&dbs, &updates).unwrap();

        let page1 = get_cached_thread_replies(&dbs, 1, 1, 2).unwrap();
        assert_eq!(
            page1.iter().map(|r| r.article_num).collect::<Vec<_>>(),
            vec![2, 3]
        );
        let page2 = get_cached_thread_replies(&dbs, 1, 2, 2).unwrap();
        assert_eq!(
            page2.iter().map(|r| r.article_num).collect::<Vec<_>>(),
            vec![4]
        );
        assert!(get_cached_thread_replies(&dbs, 1, 3, 2).unwrap().is_empty());
        assert!(get_cached_thread_replies(&dbs, 42, 1, 2).unwrap().is_empty());
    }

    #[test]
    fn test_build_thread_tree_order_and_counts() {
        let (_dir, dbs) = open_group();
        seed_thread(&dbs);
        let nodes = build_thread_tree(&dbs, 1).unwrap();
        assert_eq!(nodes.len(), 4);

        // Preorder with siblings by date: 1, then 3 (00:30), its child
        // 4, then 2 (01:00).
        let order: Vec<i64> = nodes.iter().map(|n| n.article_num).collect();
        assert_eq!(order, vec![1, 3, 4, 2]);

        let root = &nodes[0];
        assert_eq!(root.tree_path, "0");
        assert_eq!(root.descendant_count, 3);
        assert_eq!(root.child_count, 2);

        let n3 = nodes.iter().find(|n| n.article_num == 3).unwrap();
        assert_eq!(n3.tree_path, "0.0");
        assert_eq!(n3.descendant_count, 1);
        let n4 = nodes.iter().find(|n| n.article_num == 4).unwrap();
        assert_eq!(n4.tree_path, "0.0.0");
        assert_eq!(n4.depth, 2);
        let n2 = nodes.iter().find(|n| n.article_num == 2).unwrap();
        assert_eq!(n2.tree_path, "0.1");

        // Invariant: descendant_count sums over children.
        let total: i64 = nodes.iter().map(|n| n.descendant_count).sum();
        assert_eq!(total, 3 + 1);
    }

    #[test]
    fn test_get_or_build_tree_persists() {
        let (_dir, dbs) = open_group();
        seed_thread(&dbs);
        let built = get_or_build_tree(&dbs, 1).unwrap();
        assert_eq!(built.len(), 4);
        let stored: i64 = dbs
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT COUNT(*) FROM cached_trees WHERE thread_root = 1",
                        [],
                        |r| r.get(0),
                    )
                    .unwrap())
            })
            .unwrap();
        assert_eq!(stored, 4);
        // Second call reads the cached rows.
        let again = get_or_build_tree(&dbs, 1).unwrap();
        assert_eq!(again, built);
    }
}
