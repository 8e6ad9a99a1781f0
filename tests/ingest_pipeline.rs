//! End-to-end ingest tests: articles flow through the batch divider
//! into the group store, counters and caches converge, and the read
//! API serves what was written.
//!
//! The storage layer initializes once per process and never again, so
//! every test shares one pipeline (database, orchestrator, runtime) and
//! works in its own newsgroup.

use std::sync::{Arc, OnceLock};

use pugleaf::batch::{BatchOrchestrator, IncomingArticle};
use pugleaf::config::{BatchConfig, PathsConfig};
use pugleaf::storage::articles as article_store;
use pugleaf::storage::{threads, Database, DatabaseOptions};

struct Pipeline {
    _dir: tempfile::TempDir,
    runtime: tokio::runtime::Runtime,
    db: Arc<Database>,
    orchestrator: Arc<BatchOrchestrator>,
}

static PIPELINE: OnceLock<Pipeline> = OnceLock::new();

fn pipeline() -> &'static Pipeline {
    PIPELINE.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            data_dir: dir.path().to_path_buf(),
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let db = Database::open(paths, DatabaseOptions::default()).unwrap();
        let config = BatchConfig {
            max_batch_size: 50,
            interval_secs: 1,
            max_threads: 4,
        };
        let orchestrator = runtime.block_on(async {
            db.start_background_tasks();
            let orchestrator = BatchOrchestrator::new(db.clone(), &config);
            orchestrator.spawn();
            orchestrator
        });

        Pipeline {
            _dir: dir,
            runtime,
            db,
            orchestrator,
        }
    })
}

fn parse(date: &str) -> chrono::DateTime<chrono::Utc> {
    article_store::parse_utc(date).unwrap()
}

fn incoming(message_id: &str, refs: Vec<&str>, date: &str, group: &str) -> Arc<IncomingArticle> {
    Arc::new(IncomingArticle::new(
        message_id.to_string(),
        format!("subject {message_id}"),
        "tester <t@example>".to_string(),
        parse(date),
        date.to_string(),
        refs.into_iter().map(String::from).collect(),
        128,
        4,
        "news.local!not-for-mail".to_string(),
        "{}".to_string(),
        format!("body of {message_id}"),
        true,
        vec![group.to_string()],
        None,
    ))
}

/// Send articles into the divider and wait for the pipeline to drain.
async fn ingest(p: &Pipeline, articles: Vec<Arc<IncomingArticle>>) {
    let tx = p.orchestrator.sender();
    for article in articles {
        tx.send(article).await.unwrap();
    }
    p.orchestrator.wait_quiescent().await;
}

#[test]
fn test_root_then_reply_builds_thread_state() {
    let p = pipeline();
    let group = "ingest.basic";
    p.runtime.block_on(async {
        ingest(
            p,
            vec![
                incoming("<a@basic>", vec![], "2024-01-01 00:00:00", group),
                incoming("<b@basic>", vec!["<a@basic>"], "2024-01-01 01:00:00", group),
            ],
        )
        .await;

        {
            let dbs = p.db.groups.get_group_dbs(group).unwrap();
            assert_eq!(article_store::article_count(&dbs).unwrap(), 2);
            assert_eq!(threads::thread_root_of(&dbs, 2).unwrap(), Some(1));

            let cache = threads::get_thread_cache_row(&dbs, 1).unwrap().unwrap();
            assert_eq!(cache.message_count, 2);
            assert_eq!(cache.child_list(), vec![2]);
            assert_eq!(cache.last_child_number, 2);
            assert_eq!(cache.last_activity, "2024-01-01 01:00:00");

            let root = article_store::get_article_by_message_id(&dbs, "<a@basic>")
                .unwrap()
                .unwrap();
            assert_eq!(root.reply_count, 1);
        }

        // Main-store counters converged with the group store.
        let newsgroup = p.db.main.get_newsgroup(group).unwrap().unwrap();
        assert_eq!(newsgroup.message_count, 2);
        assert_eq!(newsgroup.last_article, 2);

        // History knows both IDs and they resolve to stored articles.
        assert!(p.db.history.exists("<a@basic>").unwrap());
        assert!(p.db.history.exists("<b@basic>").unwrap());
        assert!(p
            .db
            .get_article_by_message_id(group, "<b@basic>")
            .unwrap()
            .is_some());
    });
}

#[test]
fn test_replayed_range_is_idempotent() {
    let p = pipeline();
    let group = "ingest.replay";
    p.runtime.block_on(async {
        for _round in 0..2 {
            ingest(
                p,
                vec![
                    incoming("<a@replay>", vec![], "2024-01-01 00:00:00", group),
                    incoming(
                        "<b@replay>",
                        vec!["<a@replay>"],
                        "2024-01-01 01:00:00",
                        group,
                    ),
                ],
            )
            .await;
        }

        {
            let dbs = p.db.groups.get_group_dbs(group).unwrap();
            assert_eq!(article_store::article_count(&dbs).unwrap(), 2);
            let cache = threads::get_thread_cache_row(&dbs, 1).unwrap().unwrap();
            assert_eq!(cache.message_count, 2);
            assert_eq!(cache.child_list(), vec![2]);
        }
        let newsgroup = p.db.main.get_newsgroup(group).unwrap().unwrap();
        assert_eq!(newsgroup.message_count, 2);
        assert_eq!(newsgroup.last_article, 2);
    });
}

#[test]
fn test_multi_group_fanout_and_independent_numbering() {
    let p = pipeline();
    p.runtime.block_on(async {
        // Pre-populate fan.one so the crosspost gets a different number
        // there.
        ingest(
            p,
            vec![incoming("<pre@fan>", vec![], "2024-01-01 00:00:00", "ingest.fan.one")],
        )
        .await;

        let crosspost = Arc::new(IncomingArticle::new(
            "<cross@fan>".to_string(),
            "crossposted".to_string(),
            "tester <t@example>".to_string(),
            parse("2024-01-02 00:00:00"),
            "2024-01-02 00:00:00".to_string(),
            vec![],
            64,
            2,
            "news.local!not-for-mail".to_string(),
            "{\"k\":\"v\"}".to_string(),
            "shared body".to_string(),
            true,
            vec!["ingest.fan.one".to_string(), "ingest.fan.two".to_string()],
            None,
        ));
        ingest(p, vec![crosspost.clone()]).await;

        assert_eq!(crosspost.article_num("ingest.fan.one"), Some(2));
        assert_eq!(crosspost.article_num("ingest.fan.two"), Some(1));
        // Both groups committed, so the heavy payload was released.
        assert_eq!(crosspost.heavy_fields().body_text, "");

        assert_eq!(
            p.db
                .main
                .get_newsgroup("ingest.fan.one")
                .unwrap()
                .unwrap()
                .message_count,
            2
        );
        assert_eq!(
            p.db
                .main
                .get_newsgroup("ingest.fan.two")
                .unwrap()
                .unwrap()
                .message_count,
            1
        );
    });
}

#[test]
fn test_thread_listing_read_api() {
    let p = pipeline();
    let group = "ingest.listing";
    p.runtime.block_on(async {
        // 12 roots with increasing activity dates.
        let articles = (0..12)
            .map(|i| {
                incoming(
                    &format!("<r{i}@listing>"),
                    vec![],
                    &format!("2024-01-{:02} 00:00:00", i + 1),
                    group,
                )
            })
            .collect();
        ingest(p, articles).await;

        let (page1, total) = p.db.get_cached_threads(group, 1, 5).unwrap();
        assert_eq!(total, 12);
        assert_eq!(page1.len(), 5);
        // Newest activity first.
        assert_eq!(page1[0].root.message_id, "<r11@listing>");

        let (page3, total) = p.db.get_cached_threads(group, 3, 5).unwrap();
        assert_eq!(total, 12);
        assert_eq!(page3.len(), 2);
        assert_eq!(page3[1].root.message_id, "<r0@listing>");

        // An untouched group yields an empty page with a stable total.
        let (empty, total) = p.db.get_cached_threads("ingest.empty", 1, 5).unwrap();
        assert!(empty.is_empty());
        assert_eq!(total, 0);
    });
}

#[test]
fn test_thread_tree_and_replies_api() {
    let p = pipeline();
    let group = "ingest.tree";
    p.runtime.block_on(async {
        ingest(
            p,
            vec![
                incoming("<a@tree>", vec![], "2024-01-01 00:00:00", group),
                incoming("<b@tree>", vec!["<a@tree>"], "2024-01-01 01:00:00", group),
                incoming(
                    "<c@tree>",
                    vec!["<a@tree>", "<b@tree>"],
                    "2024-01-01 02:00:00",
                    group,
                ),
            ],
        )
        .await;

        let tree = p.db.build_thread_tree(group, 1).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree[0].article_num, 1);
        assert_eq!(tree[0].descendant_count, 2);
        assert_eq!(tree[0].tree_path, "0");
        // <c@tree> nests under <b@tree>, its immediate parent.
        let c = tree.iter().find(|n| n.article_num == 3).unwrap();
        assert_eq!(c.parent_article, Some(2));
        assert_eq!(c.depth, 2);

        let replies = p.db.get_cached_thread_replies(group, 1, 1, 10).unwrap();
        assert_eq!(
            replies.iter().map(|r| r.article_num).collect::<Vec<_>>(),
            vec![2, 3]
        );
    });
}

#[test]
fn test_hide_removes_thread_from_listing() {
    let p = pipeline();
    let group = "ingest.hide";
    p.runtime.block_on(async {
        ingest(
            p,
            vec![
                incoming("<a@hide>", vec![], "2024-01-01 00:00:00", group),
                incoming("<b@hide>", vec![], "2024-01-02 00:00:00", group),
            ],
        )
        .await;

        let (threads_before, total) = p.db.get_cached_threads(group, 1, 10).unwrap();
        assert_eq!((threads_before.len(), total), (2, 2));

        p.db.increment_article_hide(group, 2).unwrap();
        let (threads_after, total) = p.db.get_cached_threads(group, 1, 10).unwrap();
        assert_eq!((threads_after.len(), total), (1, 1));
        assert_eq!(threads_after[0].root.article_num, 1);

        p.db.unhide_article(group, 2).unwrap();
        let (threads_restored, total) = p.db.get_cached_threads(group, 1, 10).unwrap();
        assert_eq!((threads_restored.len(), total), (2, 2));
    });
}

#[test]
fn test_orphan_is_stored_without_thread_state() {
    let p = pipeline();
    let group = "ingest.orphan";
    p.runtime.block_on(async {
        ingest(
            p,
            vec![incoming(
                "<c@orphan>",
                vec!["<missing@orphan>"],
                "2024-01-01 00:00:00",
                group,
            )],
        )
        .await;

        {
            let dbs = p.db.groups.get_group_dbs(group).unwrap();
            assert_eq!(article_store::article_count(&dbs).unwrap(), 1);
            assert_eq!(threads::thread_root_of(&dbs, 1).unwrap(), None);
            assert_eq!(threads::thread_cache_total(&dbs).unwrap(), 0);
        }
        let newsgroup = p.db.main.get_newsgroup(group).unwrap().unwrap();
        assert_eq!(newsgroup.message_count, 1);
    });
}
