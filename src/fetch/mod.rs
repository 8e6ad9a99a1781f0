//! Fetch processor: select a group, plan the article range, download
//! with bounded workers, enqueue into the batch orchestrator, and
//! advance the progress cursor once the commit path has acknowledged
//! durable insertion.

pub mod dates;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, instrument, warn};

use crate::batch::IncomingArticle;
use crate::config::MAX_READ_LINES_XOVER;
use crate::error::{Error, Result};
use crate::nntp::{parse_references, GroupStats, NntpPool, OverviewEntry, RawArticle};
use crate::storage::articles as article_store;
use crate::storage::progress::RESCAN_MARKER;
use crate::storage::Database;

use dates::DateParser;

/// Per-article ack timeout while waiting on the commit path.
const ACK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Articles per planning round (`--max-batch`).
    pub max_batch: u64,
    /// Planning rounds per group (`--max-loops`).
    pub max_loops: usize,
    /// Mirror overview rows via XOVER before fetching bodies.
    pub xover_copy: bool,
    /// Skip groups smaller than this when no local progress exists.
    pub ignore_initial_tiny_groups: u64,
    /// Force date-based planning from this instant.
    pub download_start_date: Option<DateTime<Utc>>,
    /// Local hostname prepended to Path headers.
    pub nntp_hostname: String,
    /// Restrict wildcard expansion to groups marked active.
    pub fetch_active_only: bool,
}

/// What the planner decided for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePlan {
    /// Nothing to do.
    Skip,
    /// Fetch the numeric article range `[start, end]`.
    Numeric { start: u64, end: u64 },
    /// Scan backwards from the remote high-water mark for articles at
    /// or after `since`.
    DateBased { since: DateTime<Utc> },
}

/// Pure planning step. `last_article` is the progress cursor, 0 when
/// the pair was never fetched, -1 for an explicit rescan.
pub fn plan_range(
    last_article: i64,
    remote: &GroupStats,
    has_local_articles: bool,
    local_max_date: Option<DateTime<Utc>>,
    forced_start: Option<DateTime<Utc>>,
    max_batch: u64,
) -> RangePlan {
    if let Some(since) = forced_start {
        return RangePlan::DateBased { since };
    }
    if last_article == RESCAN_MARKER {
        return RangePlan::DateBased {
            since: Utc.timestamp_opt(0, 0).unwrap(),
        };
    }
    if last_article == 0 && has_local_articles {
        // The store has articles but no cursor (e.g. imported data);
        // resume from the newest local date.
        return RangePlan::DateBased {
            since: local_max_date.unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap()),
        };
    }

    let start = (last_article + 1) as u64;
    let mut end = (last_article as u64)
        .saturating_add(max_batch)
        .min(remote.last);
    // Never accept more rows than one XOVER response may carry.
    if end >= start {
        let span = end - start + 1;
        if span > MAX_READ_LINES_XOVER as u64 {
            end = start + MAX_READ_LINES_XOVER as u64 - 1;
        }
    }
    if start > end {
        return RangePlan::Skip;
    }
    RangePlan::Numeric { start, end }
}

#[derive(Debug, Default, Clone)]
pub struct FetchSummary {
    pub group: String,
    pub enqueued: u64,
    pub committed: u64,
    pub skipped: bool,
}

pub struct Processor {
    db: Arc<Database>,
    pool: NntpPool,
    batch_tx: async_channel::Sender<Arc<IncomingArticle>>,
    options: FetchOptions,
    date_parser: Arc<dyn DateParser>,
}

impl Processor {
    pub fn new(
        db: Arc<Database>,
        pool: NntpPool,
        batch_tx: async_channel::Sender<Arc<IncomingArticle>>,
        options: FetchOptions,
        date_parser: Arc<dyn DateParser>,
    ) -> Self {
        Self {
            db,
            pool,
            batch_tx,
            options,
            date_parser,
        }
    }

    fn provider_name(&self) -> String {
        self.pool.provider().name.clone()
    }

    /// Expand a `--group` argument: a literal name, a `prefix.*`
    /// wildcard, or `$all`. Wildcards resolve against the main store;
    /// when that comes up empty the remote LIST ACTIVE seeds it.
    pub async fn expand_groups(&self, pattern: &str) -> Result<Vec<String>> {
        if pattern != "$all" && !pattern.ends_with('*') {
            return Ok(vec![pattern.to_string()]);
        }
        let prefix = if pattern == "$all" {
            None
        } else {
            Some(pattern.trim_end_matches('*').to_string())
        };

        let mut groups = self.db.main.list_active_groups(prefix.as_deref())?;
        if groups.is_empty() && !self.options.fetch_active_only {
            let wildmat = match &prefix {
                Some(p) => Some(format!("{p}*")),
                None => None,
            };
            let mut conn = self.pool.get().await?;
            let descriptors = conn.list_groups(wildmat.as_deref()).await?;
            for descriptor in &descriptors {
                self.db.main.ensure_newsgroup(&descriptor.name)?;
            }
            info!(count = descriptors.len(), "seeded group list from LIST ACTIVE");
            groups = self.db.main.list_active_groups(prefix.as_deref())?;
        }
        Ok(groups)
    }

    /// Fetch one group for up to `max_loops` planning rounds.
    #[instrument(name = "fetch.group", skip(self), fields(provider = %self.provider_name()))]
    pub async fn run_group(&self, group: &str) -> Result<FetchSummary> {
        let mut summary = FetchSummary {
            group: group.to_string(),
            ..Default::default()
        };

        for round in 0..self.options.max_loops {
            if self.db.is_shutdown() {
                return Err(Error::Shutdown);
            }

            let stats = {
                let mut conn = self.pool.get().await?;
                match conn.select_group(group).await {
                    Ok(stats) => stats,
                    Err(Error::NewsgroupNotFound(_)) => {
                        debug!(group, "group not carried by provider, skipping");
                        summary.skipped = true;
                        return Ok(summary);
                    }
                    Err(e) => return Err(e),
                }
            };

            self.db.main.ensure_newsgroup(group)?;
            self.db
                .main
                .update_watermarks(group, stats.first as i64, stats.last as i64)?;

            let last = self
                .db
                .progress
                .last_article(&self.provider_name(), group)?;

            let (has_local, local_max_date) = {
                let dbs = self.db.get_group_dbs(group)?;
                let count = article_store::article_count(&dbs)?;
                let max_date = if count > 0 {
                    article_store::max_date_sent(&dbs)?
                } else {
                    None
                };
                (count > 0, max_date)
            };

            if last == 0
                && !has_local
                && stats.count < self.options.ignore_initial_tiny_groups
            {
                debug!(group, count = stats.count, "initial tiny group ignored");
                summary.skipped = true;
                return Ok(summary);
            }

            let plan = plan_range(
                last,
                &stats,
                has_local,
                local_max_date,
                self.options.download_start_date,
                self.options.max_batch,
            );
            debug!(group, round, ?plan, "planned fetch round");

            match plan {
                RangePlan::Skip => break,
                RangePlan::Numeric { start, end } => {
                    let fetched = self.fetch_numeric_range(group, start, end).await?;
                    summary.enqueued += fetched.enqueued;
                    summary.committed += fetched.committed;
                    // The cursor covers the whole planned range: holes
                    // and dedup skips must not be refetched forever.
                    self.db
                        .progress
                        .advance(&self.provider_name(), group, end as i64)?;
                    if end >= stats.last {
                        break;
                    }
                }
                RangePlan::DateBased { since } => {
                    let fetched = self.fetch_since(group, &stats, since).await?;
                    summary.enqueued += fetched.enqueued;
                    summary.committed += fetched.committed;
                    self.db
                        .progress
                        .advance(&self.provider_name(), group, stats.last as i64)?;
                    break;
                }
            }
        }

        info!(
            group,
            enqueued = summary.enqueued,
            committed = summary.committed,
            "group fetch finished"
        );
        Ok(summary)
    }

    /// Fetch a numeric range: XHDR Message-ID for the range, drop IDs
    /// already in history, download the rest with bounded workers.
    async fn fetch_numeric_range(&self, group: &str, start: u64, end: u64) -> Result<FetchSummary> {
        let mut conn = self.pool.get().await?;
        let ids = conn.xhdr("Message-ID", start, end).await?;
        drop(conn);

        // Optional overview mirror: one XOVER for the range, keyed by
        // article number, so stored rows carry overview metadata even
        // when the body fetch fails.
        let overview: BTreeMap<u64, OverviewEntry> = if self.options.xover_copy {
            let mut conn = self.pool.get().await?;
            conn.xover(start, end, true)
                .await?
                .into_iter()
                .map(|entry| (entry.number, entry))
                .collect()
        } else {
            BTreeMap::new()
        };

        let mut wanted: Vec<(u64, String)> = Vec::with_capacity(ids.len());
        for entry in ids {
            let message_id = entry.value.trim().to_string();
            if message_id.is_empty() {
                continue;
            }
            if self.db.history.exists(&message_id)? {
                continue;
            }
            wanted.push((entry.number, message_id));
        }
        if wanted.is_empty() {
            return Ok(FetchSummary::default());
        }

        self.download_articles(group, wanted, overview).await
    }

    /// Date-based mode: walk XOVER windows backwards from the remote
    /// high-water mark until articles predate `since`, then download
    /// the survivors oldest-first.
    async fn fetch_since(
        &self,
        group: &str,
        stats: &GroupStats,
        since: DateTime<Utc>,
    ) -> Result<FetchSummary> {
        let window = self.options.max_batch.max(1);
        let mut wanted: Vec<(u64, String)> = Vec::new();
        let mut overview: BTreeMap<u64, OverviewEntry> = BTreeMap::new();
        let mut high = stats.last;

        while high >= stats.first && high > 0 {
            if self.db.is_shutdown() {
                return Err(Error::Shutdown);
            }
            let low = high.saturating_sub(window - 1).max(stats.first);
            let rows = {
                let mut conn = self.pool.get().await?;
                conn.xover(low, high, true).await?
            };
            if rows.is_empty() {
                break;
            }

            let mut oldest_in_window: Option<DateTime<Utc>> = None;
            for row in rows {
                let date = self.date_parser.parse(&row.date);
                if let Some(date) = date {
                    oldest_in_window = Some(match oldest_in_window {
                        Some(existing) => existing.min(date),
                        None => date,
                    });
                    if date < since {
                        continue;
                    }
                }
                if self.db.history.exists(&row.message_id)? {
                    continue;
                }
                wanted.push((row.number, row.message_id.clone()));
                overview.insert(row.number, row);
            }

            // Every article in this window predates the cutoff; older
            // windows only get worse.
            if matches!(oldest_in_window, Some(oldest) if oldest < since) {
                break;
            }
            if low == stats.first || low <= 1 {
                break;
            }
            high = low - 1;
        }

        if wanted.is_empty() {
            return Ok(FetchSummary::default());
        }
        wanted.sort_by_key(|(num, _)| *num);
        self.download_articles(group, wanted, overview).await
    }

    /// Download bodies with up to `max_conns` workers, enqueue into the
    /// batch divider, then wait for the commit acks and the history
    /// writer before reporting.
    async fn download_articles(
        &self,
        group: &str,
        wanted: Vec<(u64, String)>,
        overview: BTreeMap<u64, OverviewEntry>,
    ) -> Result<FetchSummary> {
        let total = wanted.len();
        let (ack_tx, ack_rx) = async_channel::bounded(total.max(1));

        let workers = self.pool.max_conns().min(total.max(1));
        let chunk_size = total.div_ceil(workers);
        let mut handles = Vec::with_capacity(workers);
        for chunk in wanted.chunks(chunk_size.max(1)) {
            let chunk: Vec<(u64, String)> = chunk.to_vec();
            let pool = self.pool.clone();
            let batch_tx = self.batch_tx.clone();
            let ack_tx = ack_tx.clone();
            let overview: Vec<(u64, OverviewEntry)> = chunk
                .iter()
                .filter_map(|(num, _)| overview.get(num).map(|o| (*num, o.clone())))
                .collect();
            let group = group.to_string();
            let hostname = self.options.nntp_hostname.clone();
            let max_art_size = self.pool.provider().max_art_size;
            let date_parser = self.date_parser.clone();

            handles.push(tokio::spawn(async move {
                let overview: BTreeMap<u64, OverviewEntry> = overview.into_iter().collect();
                let mut enqueued = 0u64;
                for (number, message_id) in chunk {
                    let mut conn = match pool.get().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "worker could not get a connection");
                            break;
                        }
                    };
                    let raw = match conn.get_article(&message_id).await {
                        Ok(raw) => Some(raw),
                        Err(Error::NotFound) => None,
                        Err(e) => {
                            warn!(%message_id, error = %e, "article fetch failed");
                            conn.discard();
                            None
                        }
                    };

                    let article = build_incoming(
                        &group,
                        &message_id,
                        raw,
                        overview.get(&number),
                        &hostname,
                        max_art_size,
                        date_parser.as_ref(),
                        ack_tx.clone(),
                    );
                    let Some(article) = article else { continue };
                    if batch_tx.send(Arc::new(article)).await.is_err() {
                        warn!("batch divider closed, stopping worker");
                        break;
                    }
                    enqueued += 1;
                }
                enqueued
            }));
        }
        drop(ack_tx);

        let mut enqueued = 0u64;
        for handle in handles {
            enqueued += handle.await.unwrap_or(0);
        }

        // Progress only advances after durable insertion: collect one
        // ack per enqueued article, then let the history writer drain.
        let mut committed = 0u64;
        for _ in 0..enqueued {
            match tokio::time::timeout(ACK_TIMEOUT, ack_rx.recv()).await {
                Ok(Ok(num)) if num > 0 => committed += 1,
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => {
                    warn!(group, "timed out waiting for batch acknowledgements");
                    break;
                }
            }
        }
        self.db.history.wait_quiescent().await;

        Ok(FetchSummary {
            group: group.to_string(),
            enqueued,
            committed,
            skipped: false,
        })
    }

    /// Fetch a single article by Message-ID into the given group.
    pub async fn fetch_message_id(&self, group: &str, message_id: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        if !conn.stat_article(message_id).await? {
            return Ok(false);
        }
        if self.db.history.exists(message_id)? {
            info!(%message_id, "already in history");
            return Ok(true);
        }
        drop(conn);
        let summary = self
            .download_articles(group, vec![(0, message_id.to_string())], BTreeMap::new())
            .await?;
        Ok(summary.committed > 0)
    }
}

/// Assemble the orchestrator-bound article from the raw download and
/// the optional overview row.
#[allow(clippy::too_many_arguments)]
fn build_incoming(
    group: &str,
    message_id: &str,
    raw: Option<RawArticle>,
    overview: Option<&OverviewEntry>,
    hostname: &str,
    max_art_size: u64,
    date_parser: &dyn DateParser,
    ack_tx: async_channel::Sender<i64>,
) -> Option<IncomingArticle> {
    let (subject, from, date_string, references, bytes, lines, headers_json, body_text, path) =
        match &raw {
            Some(raw) => {
                let headers_json = serde_json::to_string(&raw.headers).unwrap_or_default();
                (
                    raw.header("subject").unwrap_or("(no subject)").to_string(),
                    raw.header("from").unwrap_or_default().to_string(),
                    raw.header("date").unwrap_or_default().to_string(),
                    parse_references(raw.header("references").unwrap_or_default()),
                    raw.bytes as i64,
                    raw.body.len() as i64,
                    headers_json,
                    raw.body_text(),
                    raw.header("path").unwrap_or("not-for-mail").to_string(),
                )
            }
            None => {
                let overview = overview?;
                (
                    overview.subject.clone(),
                    overview.from.clone(),
                    overview.date.clone(),
                    parse_references(&overview.references),
                    overview.bytes as i64,
                    overview.lines as i64,
                    String::new(),
                    String::new(),
                    "not-for-mail".to_string(),
                )
            }
        };

    if max_art_size > 0 && bytes as u64 > max_art_size {
        warn!(%message_id, bytes, "article exceeds provider size cap, dropped");
        return None;
    }

    let date_sent = date_parser.parse(&date_string).unwrap_or_else(Utc::now);
    Some(IncomingArticle::new(
        message_id.to_string(),
        subject,
        from,
        date_sent,
        date_string,
        references,
        bytes,
        lines,
        format!("{hostname}!{path}"),
        headers_json,
        body_text,
        raw.is_some(),
        vec![group.to_string()],
        Some(ack_tx),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(first: u64, last: u64, count: u64) -> GroupStats {
        GroupStats {
            name: "alt.test".into(),
            count,
            first,
            last,
            posting_ok: true,
        }
    }

    #[test]
    fn test_plan_fresh_group() {
        let plan = plan_range(0, &remote(1, 50, 50), false, None, None, 100);
        assert_eq!(plan, RangePlan::Numeric { start: 1, end: 50 });
    }

    #[test]
    fn test_plan_caught_up_group_skips() {
        // Progress equals the remote high-water mark: nothing to do.
        let plan = plan_range(100, &remote(1, 100, 100), true, None, None, 100);
        assert_eq!(plan, RangePlan::Skip);
    }

    #[test]
    fn test_plan_batch_cap() {
        let plan = plan_range(10, &remote(1, 10_000, 10_000), true, None, None, 250);
        assert_eq!(plan, RangePlan::Numeric { start: 11, end: 260 });
    }

    #[test]
    fn test_plan_xover_row_cap() {
        let plan = plan_range(
            0,
            &remote(1, 1_000_000, 1_000_000),
            false,
            None,
            None,
            1_000_000,
        );
        assert_eq!(
            plan,
            RangePlan::Numeric {
                start: 1,
                end: MAX_READ_LINES_XOVER as u64,
            }
        );
    }

    #[test]
    fn test_plan_rescan_marker() {
        let plan = plan_range(-1, &remote(1, 100, 100), true, None, None, 100);
        match plan {
            RangePlan::DateBased { since } => assert_eq!(since.timestamp(), 0),
            other => panic!("expected date-based plan, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_local_articles_without_cursor() {
        let local_max = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let plan = plan_range(0, &remote(1, 100, 100), true, Some(local_max), None, 100);
        assert_eq!(plan, RangePlan::DateBased { since: local_max });
    }

    #[test]
    fn test_plan_forced_start_date_wins() {
        let forced = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let plan = plan_range(50, &remote(1, 100, 100), true, None, Some(forced), 100);
        assert_eq!(plan, RangePlan::DateBased { since: forced });
    }
}
