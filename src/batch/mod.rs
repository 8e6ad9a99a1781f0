//! Batch orchestrator: per-group buffers and phased commits.
//!
//! Contract: once an article is handed to the divider, it is durably
//! written exactly once to its group store, counted once in the main
//! store, and recorded once in history, or the whole batch surfaces an
//! error (and its acks never fire).
//!
//! Three cooperating tasks:
//!  - the divider demultiplexes incoming articles onto per-group
//!    buffers, spinning while the global inflight count is saturated;
//!  - the orchestrator loop polls with adaptive backoff and commits
//!    any buffer at or above the batch-size threshold;
//!  - the fallback loop flushes undersized buffers on a timer, so a
//!    trickle of articles still reaches the store.
//! Commits are bounded by a semaphore and run on blocking threads.

pub mod article;
pub mod pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_channel::{bounded, Receiver, Sender};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{
    BatchConfig, BATCH_RETRY_DELAY, INITIAL_SHUTDOWN_COUNTER, LOOPS_PER_GROUP, MAX_QUEUED,
    ORCH_POLL_CEILING, ORCH_POLL_FLOOR, QUEUE_DRAIN_FRACTION,
};
use crate::error::Result;
use crate::storage::articles;
use crate::storage::threads::{self, ReplyEdge, ThreadCacheUpdate};
use crate::storage::Database;

pub use article::IncomingArticle;

use pool::BufferPool;

/// Per-group buffer between the divider and the commit path.
struct GroupBuffer {
    group: String,
    tx: Sender<Arc<IncomingArticle>>,
    rx: Receiver<Arc<IncomingArticle>>,
    processing: AtomicBool,
    last_send: Mutex<Instant>,
}

pub struct BatchOrchestrator {
    db: Arc<Database>,
    divider_tx: Sender<Arc<IncomingArticle>>,
    divider_rx: Receiver<Arc<IncomingArticle>>,
    buffers: Mutex<HashMap<String, Arc<GroupBuffer>>>,
    /// Articles dispatched to group buffers but not yet committed.
    inflight: Arc<AtomicUsize>,
    semaphore: Arc<Semaphore>,
    scratch: BufferPool<Arc<IncomingArticle>>,
    max_batch_size: usize,
    batch_interval: Duration,
}

impl BatchOrchestrator {
    pub fn new(db: Arc<Database>, config: &BatchConfig) -> Arc<Self> {
        // Length-1 divider channel: producers feel backpressure
        // immediately, the cap logic lives in the divider itself.
        let (divider_tx, divider_rx) = bounded(1);
        Arc::new(Self {
            db,
            divider_tx,
            divider_rx,
            buffers: Mutex::new(HashMap::new()),
            inflight: Arc::new(AtomicUsize::new(0)),
            semaphore: Arc::new(Semaphore::new(config.max_threads.max(1))),
            scratch: BufferPool::new(config.max_threads.max(1) * 2, config.max_batch_size),
            max_batch_size: config.max_batch_size.max(1),
            batch_interval: config.interval(),
        })
    }

    /// The divider intake; the fetch pipeline sends articles here.
    pub fn sender(&self) -> Sender<Arc<IncomingArticle>> {
        self.divider_tx.clone()
    }

    /// Spawn the divider, orchestrator, and fallback tasks.
    pub fn spawn(self: &Arc<Self>) {
        tokio::spawn(self.clone().divider_loop());
        tokio::spawn(self.clone().orchestrator_loop());
        tokio::spawn(self.clone().fallback_loop());
    }

    fn buffer_for(&self, group: &str) -> Arc<GroupBuffer> {
        let mut buffers = self.buffers.lock().expect("buffers poisoned");
        buffers
            .entry(group.to_string())
            .or_insert_with(|| {
                let (tx, rx) = bounded(self.max_batch_size * LOOPS_PER_GROUP);
                Arc::new(GroupBuffer {
                    group: group.to_string(),
                    tx,
                    rx,
                    processing: AtomicBool::new(false),
                    last_send: Mutex::new(Instant::now()),
                })
            })
            .clone()
    }

    fn snapshot_buffers(&self) -> Vec<Arc<GroupBuffer>> {
        self.buffers
            .lock()
            .expect("buffers poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Demultiplex incoming articles to their group buffers, enforcing
    /// the soft global inflight cap.
    async fn divider_loop(self: Arc<Self>) {
        let mut shutdown = self.db.subscribe_shutdown();
        let drain_floor = (MAX_QUEUED as f64 * QUEUE_DRAIN_FRACTION) as usize;
        loop {
            let article = tokio::select! {
                article = self.divider_rx.recv() => match article {
                    Ok(article) => article,
                    Err(_) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Drain whatever producers already queued.
                        while let Ok(article) = self.divider_rx.try_recv() {
                            self.dispatch(article).await;
                        }
                        break;
                    }
                    continue;
                }
            };

            if self.inflight.load(Ordering::SeqCst) >= MAX_QUEUED {
                debug!("inflight cap reached, divider waiting");
                while self.inflight.load(Ordering::SeqCst) > drain_floor {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }

            self.dispatch(article).await;
        }
        info!("batch divider exited");
    }

    async fn dispatch(&self, article: Arc<IncomingArticle>) {
        for group in article.newsgroups.clone() {
            let buffer = self.buffer_for(&group);
            self.inflight.fetch_add(1, Ordering::SeqCst);
            *buffer.last_send.lock().expect("buffer poisoned") = Instant::now();
            if buffer.tx.send(article.clone()).await.is_err() {
                self.inflight.fetch_sub(1, Ordering::SeqCst);
                error!(%group, "group buffer closed, article dropped");
            }
        }
    }

    /// Poll for buffers at the size threshold with adaptive backoff:
    /// quarter the delay when work shows up, double it when idle.
    async fn orchestrator_loop(self: Arc<Self>) {
        let shutdown = self.db.subscribe_shutdown();
        let mut delay = ORCH_POLL_FLOOR;
        loop {
            let mut found_work = false;
            for buffer in self.snapshot_buffers() {
                if buffer.rx.len() >= self.max_batch_size {
                    found_work |= self.try_spawn_commit(buffer);
                }
            }

            delay = if found_work {
                (delay / 4).max(ORCH_POLL_FLOOR)
            } else {
                (delay * 2).min(ORCH_POLL_CEILING)
            };
            tokio::time::sleep(delay).await;

            if *shutdown.borrow() && self.is_drained() {
                break;
            }
        }
        info!("batch orchestrator exited");
    }

    /// Timer flush for undersized buffers, plus pruning of buffers that
    /// have been idle for a long while.
    async fn fallback_loop(self: Arc<Self>) {
        let shutdown = self.db.subscribe_shutdown();
        let mut ticker = tokio::time::interval(self.batch_interval);
        loop {
            ticker.tick().await;
            for buffer in self.snapshot_buffers() {
                if !buffer.rx.is_empty() {
                    self.try_spawn_commit(buffer);
                }
            }
            self.prune_stale_buffers();
            if *shutdown.borrow() && self.is_drained() {
                break;
            }
        }
        info!("batch fallback timer exited");
    }

    fn prune_stale_buffers(&self) {
        let expiry = self.batch_interval * 20;
        let mut buffers = self.buffers.lock().expect("buffers poisoned");
        buffers.retain(|_, buffer| {
            buffer.processing.load(Ordering::SeqCst)
                || !buffer.rx.is_empty()
                || buffer.last_send.lock().expect("buffer poisoned").elapsed() < expiry
        });
    }

    /// Claim the buffer's processing flag and commit one batch from it.
    /// Returns false when the buffer is already being processed.
    fn try_spawn_commit(self: &Arc<Self>, buffer: Arc<GroupBuffer>) -> bool {
        if buffer
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let orch = self.clone();
        tokio::spawn(async move {
            let permit = orch.semaphore.clone().acquire_owned().await;
            if permit.is_err() {
                buffer.processing.store(false, Ordering::SeqCst);
                return;
            }

            let mut batch = orch.scratch.get();
            while batch.len() < orch.max_batch_size {
                match buffer.rx.try_recv() {
                    Ok(article) => batch.push(article),
                    Err(_) => break,
                }
            }

            if batch.is_empty() {
                orch.scratch.put(batch);
                buffer.processing.store(false, Ordering::SeqCst);
                return;
            }

            let drained = batch.len();
            let db = orch.db.clone();
            let group = buffer.group.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let result = process_newsgroup_batch(&db, &group, &batch);
                (result, batch)
            })
            .await;

            match outcome {
                Ok((result, mut batch)) => {
                    if let Err(e) = result {
                        error!(group = %buffer.group, error = %e, "batch commit failed");
                    }
                    batch.clear();
                    orch.scratch.put(batch);
                }
                Err(_) => error!(group = %buffer.group, "batch commit task panicked"),
            }

            orch.inflight.fetch_sub(drained, Ordering::SeqCst);
            buffer.processing.store(false, Ordering::SeqCst);
        });
        true
    }

    fn is_drained(&self) -> bool {
        self.divider_rx.is_empty()
            && self.inflight.load(Ordering::SeqCst) == 0
            && self.snapshot_buffers().iter().all(|b| {
                b.rx.is_empty() && !b.processing.load(Ordering::SeqCst)
            })
            && self.db.history.check_no_more_work()
    }

    /// Block until the pipeline has been continuously idle for several
    /// samples; used before shutdown and by fetch rounds that advance
    /// progress cursors.
    pub async fn wait_quiescent(&self) {
        let mut quiet_samples = 0u32;
        loop {
            if self.is_drained() {
                quiet_samples += 1;
                if quiet_samples >= INITIAL_SHUTDOWN_COUNTER {
                    return;
                }
            } else {
                quiet_samples = 0;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Commit one batch for one group, in phase order: article insert,
/// thread roots, replies, reply counts, thread cache, history, main
/// counter. The article insert is the only phase whose failure aborts
/// the batch (after one delayed retry on a fresh handle); the cache and
/// counter phases are best-effort since the rows are already durable.
#[instrument(name = "batch.commit", skip(db, batch), fields(count = batch.len()))]
fn process_newsgroup_batch(
    db: &Database,
    group: &str,
    batch: &[Arc<IncomingArticle>],
) -> Result<()> {
    let prepared: Vec<articles::PreparedArticle> = batch.iter().map(|a| a.to_prepared()).collect();

    let mut dbs = db.groups.get_group_dbs(group)?;
    let outcome = match articles::insert_article_batch(&dbs, &prepared) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(group, error = %e, "article insert failed, retrying batch");
            drop(dbs);
            std::thread::sleep(BATCH_RETRY_DELAY);
            dbs = db.groups.get_group_dbs(group)?;
            articles::insert_article_batch(&dbs, &prepared)?
        }
    };

    for article in batch {
        if let Some(num) = outcome.mapping.get(&article.message_id) {
            article.set_article_num(group, *num);
        }
    }

    // Thread roots: self-edges plus seeded cache rows. Self-edges are
    // INSERT OR IGNORE, so replayed roots are harmless here.
    let roots: Vec<(i64, DateTime<Utc>)> = batch
        .iter()
        .filter(|a| a.is_thread_root && !a.is_reply)
        .filter_map(|a| a.article_num(group).map(|num| (num, a.date_sent)))
        .collect();
    match threads::insert_thread_roots(&dbs, &roots) {
        Ok(()) => {
            for article in batch.iter().filter(|a| a.is_thread_root && !a.is_reply) {
                if let Some(num) = article.article_num(group) {
                    db.msgid_cache.insert(group, &article.message_id, num, num);
                }
            }
        }
        Err(e) => warn!(group, error = %e, "thread root insert failed"),
    }

    // Replies: resolve each root via the in-memory cache, then the
    // database, walking references newest to oldest. Unresolvable
    // references leave the article an orphan; it stays recorded.
    let mut reply_edges: Vec<ReplyEdge> = Vec::new();
    let mut reply_deltas: HashMap<String, i64> = HashMap::new();
    let mut cache_updates: HashMap<i64, ThreadCacheUpdate> = HashMap::new();
    for article in batch.iter().filter(|a| a.is_reply) {
        // Replayed rows were threaded when first seen; counting them
        // again would double reply counts and cache children.
        if !outcome.fresh.contains(&article.message_id) {
            continue;
        }
        let Some(child) = article.article_num(group) else {
            continue;
        };
        let refs = article.references();

        // The immediate parent is the last reference, whether or not it
        // resolves; its reply count bumps either way (matching no row
        // is harmless).
        if let Some(last) = refs.last() {
            *reply_deltas.entry(last.clone()).or_insert(0) += 1;
        }

        let mut root: Option<i64> = None;
        for reference in refs.iter().rev() {
            if let Some((_, cached_root)) = db.msgid_cache.get(group, reference) {
                root = Some(cached_root);
                break;
            }
            if let Ok(Some(num)) = articles::lookup_article_num(&dbs, reference) {
                if let Ok(Some(found)) = threads::thread_root_of(&dbs, num) {
                    root = Some(found);
                    break;
                }
            }
        }
        let Some(root) = root else {
            debug!(group, message_id = %article.message_id, "orphan reply, no edge");
            continue;
        };

        let parent = refs
            .last()
            .and_then(|last| {
                db.msgid_cache
                    .get(group, last)
                    .map(|(num, _)| num)
                    .or_else(|| articles::lookup_article_num(&dbs, last).ok().flatten())
            })
            .unwrap_or(root);

        reply_edges.push(ReplyEdge {
            child,
            root,
            parent,
            child_date: article.date_sent,
        });
        cache_updates
            .entry(root)
            .or_default()
            .new_children
            .push((child, article.date_sent));
        db.msgid_cache.insert(group, &article.message_id, child, root);
    }

    if let Err(e) = threads::insert_reply_edges(&dbs, &reply_edges) {
        warn!(group, error = %e, "reply edge insert failed");
    }
    if let Err(e) = threads::batch_update_reply_counts(&dbs, &reply_deltas) {
        warn!(group, error = %e, "reply count update failed");
    }

    match threads::batch_update_thread_cache(&dbs, &cache_updates) {
        Ok(rows) => {
            for row in &rows {
                db.thread_cache.update_thread_metadata(group, row);
            }
        }
        Err(e) => warn!(group, error = %e, "thread cache update failed"),
    }

    // History, transient-field release, and the per-article ack.
    for article in batch {
        match article.article_num(group) {
            Some(num) => {
                db.history.record(&article.message_id, group, num);
                article.finish_group();
                if let Some(queue) = &article.process_queue {
                    let _ = queue.send_blocking(num);
                }
            }
            None => {
                // Insert mapped nothing for this row; ack failure so the
                // producer does not hang waiting.
                article.finish_group();
                if let Some(queue) = &article.process_queue {
                    let _ = queue.send_blocking(0);
                }
            }
        }
    }

    if outcome.inserted > 0 {
        if let Err(e) =
            db.main
                .bump_group_counters(group, outcome.inserted, outcome.max_article_num)
        {
            warn!(group, error = %e, "main store counter update failed");
        }
    }

    debug!(
        group,
        total = batch.len(),
        inserted = outcome.inserted,
        roots = roots.len(),
        replies = reply_edges.len(),
        "batch committed"
    );
    Ok(())
}
