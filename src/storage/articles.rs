//! Article rows: batched insert with number mapping, read accessors,
//! and the spam/hide mutators.
//!
//! `article_num` is the group store's autoincrementing rowid. Inserts
//! use `INSERT OR IGNORE` so rows pre-seeded by overview-copy (or a
//! replayed fetch range) are never duplicated; the batched mapping
//! SELECT afterwards is what tells us the assigned numbers for both
//! fresh and pre-existing rows.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::ToSql;

use crate::error::Result;
use crate::storage::group_store::GroupDbs;
use crate::storage::retry;

/// SQLite bind-parameter budget per mapping SELECT.
const MAPPING_CHUNK: usize = 500;

/// `date_sent` is persisted in this exact shape to avoid
/// driver-dependent timezone drift.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_utc(dt: DateTime<Utc>) -> String {
    dt.format(DATE_FORMAT).to_string()
}

pub fn parse_utc(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// An article as the batch orchestrator writes it.
#[derive(Debug, Clone)]
pub struct PreparedArticle {
    pub message_id: String,
    pub subject: String,
    pub from_header: String,
    pub date_sent: DateTime<Utc>,
    pub date_string: String,
    /// Whitespace-separated references, oldest first.
    pub refs: String,
    pub bytes: i64,
    pub lines: i64,
    pub path: String,
    pub headers_json: String,
    pub body_text: String,
    pub downloaded: bool,
}

/// A stored article row.
#[derive(Debug, Clone)]
pub struct ArticleRow {
    pub article_num: i64,
    pub message_id: String,
    pub subject: String,
    pub from_header: String,
    pub date_sent: String,
    pub date_string: String,
    pub refs: String,
    pub bytes: i64,
    pub lines: i64,
    pub reply_count: i64,
    pub path: String,
    pub headers_json: String,
    pub body_text: String,
    pub downloaded: i64,
    pub spam: i64,
    pub hide: i64,
}

/// Overview projection for listings.
#[derive(Debug, Clone)]
pub struct OverviewRow {
    pub article_num: i64,
    pub message_id: String,
    pub subject: String,
    pub from_header: String,
    pub date_sent: String,
    pub refs: String,
    pub bytes: i64,
    pub lines: i64,
    pub reply_count: i64,
}

fn article_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArticleRow> {
    Ok(ArticleRow {
        article_num: row.get(0)?,
        message_id: row.get(1)?,
        subject: row.get(2)?,
        from_header: row.get(3)?,
        date_sent: row.get(4)?,
        date_string: row.get(5)?,
        refs: row.get(6)?,
        bytes: row.get(7)?,
        lines: row.get(8)?,
        reply_count: row.get(9)?,
        path: row.get(10)?,
        headers_json: row.get(11)?,
        body_text: row.get(12)?,
        downloaded: row.get(13)?,
        spam: row.get(14)?,
        hide: row.get(15)?,
    })
}

const ARTICLE_COLUMNS: &str = "article_num, message_id, subject, from_header, date_sent, \
     date_string, refs, bytes, lines, reply_count, path, headers_json, body_text, \
     downloaded, spam, hide";

/// Outcome of a batched insert: Message-ID -> assigned number for every
/// row of the batch (fresh or pre-existing), the highest assigned
/// number, and the set of Message-IDs that were actually new. Replayed
/// rows are mapped but not in `fresh`, so threading and counters run
/// once per article ever.
#[derive(Debug, Default)]
pub struct InsertOutcome {
    pub mapping: HashMap<String, i64>,
    pub max_article_num: i64,
    pub inserted: i64,
    pub fresh: HashSet<String>,
}

/// Insert a batch inside one transaction and map every Message-ID back
/// to its assigned article number. Pre-existing rows are ignored but
/// still mapped.
pub fn insert_article_batch(dbs: &GroupDbs, articles: &[PreparedArticle]) -> Result<InsertOutcome> {
    if articles.is_empty() {
        return Ok(InsertOutcome::default());
    }

    let now = format_utc(Utc::now());
    let fresh = dbs.with_conn_mut(|conn| {
        retry::transaction(conn, |tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO articles
                   (message_id, subject, from_header, date_sent, date_string, refs,
                    bytes, lines, path, headers_json, body_text, downloaded, imported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            let mut fresh: HashSet<String> = HashSet::with_capacity(articles.len());
            for article in articles {
                let changed = stmt.execute(rusqlite::params![
                    article.message_id,
                    article.subject,
                    article.from_header,
                    format_utc(article.date_sent),
                    article.date_string,
                    article.refs,
                    article.bytes,
                    article.lines,
                    article.path,
                    article.headers_json,
                    article.body_text,
                    article.downloaded as i64,
                    now,
                ])?;
                if changed > 0 {
                    fresh.insert(article.message_id.clone());
                }
            }
            Ok(fresh)
        })
    })?;

    // Map assigned numbers back by Message-ID, chunked to stay inside
    // the bind-parameter budget.
    let mut outcome = InsertOutcome {
        inserted: fresh.len() as i64,
        fresh,
        ..Default::default()
    };
    dbs.with_conn(|conn| {
        for chunk in articles.chunks(MAPPING_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT message_id, article_num FROM articles WHERE message_id IN ({placeholders})"
            );
            let params: Vec<&dyn ToSql> =
                chunk.iter().map(|a| &a.message_id as &dyn ToSql).collect();
            let rows: Vec<(String, i64)> =
                retry::query_all(conn, &sql, &params, |row| Ok((row.get(0)?, row.get(1)?)))?;
            for (message_id, article_num) in rows {
                outcome.max_article_num = outcome.max_article_num.max(article_num);
                outcome.mapping.insert(message_id, article_num);
            }
        }
        Ok(())
    })?;

    Ok(outcome)
}

pub fn get_article_by_num(dbs: &GroupDbs, article_num: i64) -> Result<Option<ArticleRow>> {
    dbs.with_conn(|conn| {
        retry::query_opt(
            conn,
            &format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE article_num = ?1"),
            &[&article_num],
            article_row,
        )
    })
}

pub fn get_article_by_message_id(dbs: &GroupDbs, message_id: &str) -> Result<Option<ArticleRow>> {
    dbs.with_conn(|conn| {
        retry::query_opt(
            conn,
            &format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE message_id = ?1"),
            &[&message_id],
            article_row,
        )
    })
}

pub fn get_overview_by_article_num(
    dbs: &GroupDbs,
    article_num: i64,
) -> Result<Option<OverviewRow>> {
    dbs.with_conn(|conn| {
        retry::query_opt(
            conn,
            "SELECT article_num, message_id, subject, from_header, date_sent, refs,
                    bytes, lines, reply_count
             FROM articles WHERE article_num = ?1",
            &[&article_num],
            |row| {
                Ok(OverviewRow {
                    article_num: row.get(0)?,
                    message_id: row.get(1)?,
                    subject: row.get(2)?,
                    from_header: row.get(3)?,
                    date_sent: row.get(4)?,
                    refs: row.get(5)?,
                    bytes: row.get(6)?,
                    lines: row.get(7)?,
                    reply_count: row.get(8)?,
                })
            },
        )
    })
}

/// Resolve an article number for a Message-ID without loading the row.
pub fn lookup_article_num(dbs: &GroupDbs, message_id: &str) -> Result<Option<i64>> {
    dbs.with_conn(|conn| {
        retry::query_opt(
            conn,
            "SELECT article_num FROM articles WHERE message_id = ?1 LIMIT 1",
            &[&message_id],
            |row| row.get(0),
        )
    })
}

pub fn article_count(dbs: &GroupDbs) -> Result<i64> {
    dbs.with_conn(|conn| {
        retry::query_row(conn, "SELECT COUNT(*) FROM articles", &[], |row| row.get(0))
    })
}

pub fn max_article_num(dbs: &GroupDbs) -> Result<i64> {
    dbs.with_conn(|conn| {
        retry::query_row(
            conn,
            "SELECT COALESCE(MAX(article_num), 0) FROM articles",
            &[],
            |row| row.get(0),
        )
    })
}

/// Newest `date_sent` in the group, used for date-based fetch planning.
pub fn max_date_sent(dbs: &GroupDbs) -> Result<Option<DateTime<Utc>>> {
    let max: Option<String> = dbs.with_conn(|conn| {
        retry::query_opt(
            conn,
            "SELECT MAX(date_sent) FROM articles WHERE date_sent != ''",
            &[],
            |row| row.get(0),
        )
    })?;
    Ok(max.as_deref().and_then(parse_utc))
}

// --- spam / hide mutators -------------------------------------------------

pub fn increment_article_spam(dbs: &GroupDbs, article_num: i64) -> Result<()> {
    dbs.with_conn(|conn| {
        retry::exec(
            conn,
            "UPDATE articles SET spam = spam + 1 WHERE article_num = ?1",
            &[&article_num],
        )
        .map(|_| ())
    })
}

pub fn decrement_article_spam(dbs: &GroupDbs, article_num: i64) -> Result<()> {
    dbs.with_conn(|conn| {
        retry::exec(
            conn,
            "UPDATE articles SET spam = MAX(spam - 1, 0) WHERE article_num = ?1",
            &[&article_num],
        )
        .map(|_| ())
    })
}

pub fn increment_article_hide(dbs: &GroupDbs, article_num: i64) -> Result<()> {
    dbs.with_conn(|conn| {
        retry::exec(
            conn,
            "UPDATE articles SET hide = 1 WHERE article_num = ?1",
            &[&article_num],
        )
        .map(|_| ())
    })
}

pub fn unhide_article(dbs: &GroupDbs, article_num: i64) -> Result<()> {
    dbs.with_conn(|conn| {
        retry::exec(
            conn,
            "UPDATE articles SET hide = 0 WHERE article_num = ?1",
            &[&article_num],
        )
        .map(|_| ())
    })
}

pub fn has_user_flagged_spam(dbs: &GroupDbs, article_num: i64, user_id: i64) -> Result<bool> {
    dbs.with_conn(|conn| {
        let found: Option<i64> = retry::query_opt(
            conn,
            "SELECT 1 FROM spam_flags WHERE article_num = ?1 AND user_id = ?2",
            &[&article_num, &user_id],
            |row| row.get(0),
        )?;
        Ok(found.is_some())
    })
}

pub fn record_user_spam_flag(dbs: &GroupDbs, article_num: i64, user_id: i64) -> Result<()> {
    let now = format_utc(Utc::now());
    dbs.with_conn(|conn| {
        retry::exec(
            conn,
            "INSERT OR IGNORE INTO spam_flags (article_num, user_id, flagged_at)
             VALUES (?1, ?2, ?3)",
            &[&article_num, &user_id, &now],
        )
        .map(|_| ())
    })
}

#[cfg(test)]
pub(crate) fn test_article(message_id: &str, refs: &str, date: &str) -> PreparedArticle {
    PreparedArticle {
        message_id: message_id.to_string(),
        subject: format!("subject for {message_id}"),
        from_header: "tester <t@example>".to_string(),
        date_sent: parse_utc(date).unwrap(),
        date_string: date.to_string(),
        refs: refs.to_string(),
        bytes: 100,
        lines: 5,
        path: "news.local!not-for-mail".to_string(),
        headers_json: "{}".to_string(),
        body_text: "body".to_string(),
        downloaded: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn test_insert_assigns_dense_numbers() {
        let (_dir, dbs) = open_group();
        let batch = vec![
            test_article("<a@x>", "", "2024-01-01 00:00:00"),
            test_article("<b@x>", "<a@x>", "2024-01-01 01:00:00"),
        ];
        let outcome = insert_article_batch(&dbs, &batch).unwrap();
        assert_eq!(outcome.mapping["<a@x>"], 1);
        assert_eq!(outcome.mapping["<b@x>"], 2);
        assert_eq!(outcome.max_article_num, 2);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(article_count(&dbs).unwrap(), 2);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let (_dir, dbs) = open_group();
        let batch = vec![test_article("<a@x>", "", "2024-01-01 00:00:00")];
        let first = insert_article_batch(&dbs, &batch).unwrap();
        let second = insert_article_batch(&dbs, &batch).unwrap();
        // The replay maps to the same number instead of inserting anew.
        assert_eq!(first.mapping["<a@x>"], second.mapping["<a@x>"]);
        assert_eq!(second.max_article_num, 1);
        assert_eq!(first.inserted, 1);
        assert_eq!(second.inserted, 0);
        assert_eq!(article_count(&dbs).unwrap(), 1);
    }

    #[test]
    fn test_read_accessors() {
        let (_dir, dbs) = open_group();
        let batch = vec![test_article("<a@x>", "", "2024-01-01 00:00:00")];
        insert_article_batch(&dbs, &batch).unwrap();

        let by_num = get_article_by_num(&dbs, 1).unwrap().unwrap();
        assert_eq!(by_num.message_id, "<a@x>");
        assert_eq!(by_num.date_sent, "2024-01-01 00:00:00");

        let by_id = get_article_by_message_id(&dbs, "<a@x>").unwrap().unwrap();
        assert_eq!(by_id.article_num, 1);

        let overview = get_overview_by_article_num(&dbs, 1).unwrap().unwrap();
        assert_eq!(overview.reply_count, 0);

        assert!(get_article_by_num(&dbs, 99).unwrap().is_none());
        assert_eq!(lookup_article_num(&dbs, "<a@x>").unwrap(), Some(1));
        assert_eq!(lookup_article_num(&dbs, "<zz@x>").unwrap(), None);
    }

    #[test]
    fn test_max_date_sent() {
        let (_dir, dbs) = open_group();
        assert!(max_date_sent(&dbs).unwrap().is_none());
        insert_article_batch(
            &dbs,
            &[
                test_article("<a@x>", "", "2024-01-01 00:00:00"),
                test_article("<b@x>", "", "2024-03-05 12:30:00"),
            ],
        )
        .unwrap();
        let max = max_date_sent(&dbs).unwrap().unwrap();
        assert_eq!(format_utc(max), "2024-03-05 12:30:00");
    }

    #[test]
    fn test_spam_counter_floor() {
        let (_dir, dbs) = open_group();
        insert_article_batch(&dbs, &[test_article("<a@x>", "", "2024-01-01 00:00:00")]).unwrap();
        decrement_article_spam(&dbs, 1).unwrap();
        assert_eq!(get_article_by_num(&dbs, 1).unwrap().unwrap().spam, 0);
        increment_article_spam(&dbs, 1).unwrap();
        increment_article_spam(&dbs, 1).unwrap();
        assert_eq!(get_article_by_num(&dbs, 1).unwrap().unwrap().spam, 2);
        decrement_article_spam(&dbs, 1).unwrap();
        assert_eq!(get_article_by_num(&dbs, 1).unwrap().unwrap().spam, 1);
    }

    #[test]
    fn test_hide_toggles() {
        let (_dir, dbs) = open_group();
        insert_article_batch(&dbs, &[test_article("<a@x>", "", "2024-01-01 00:00:00")]).unwrap();
        increment_article_hide(&dbs, 1).unwrap();
        assert_eq!(get_article_by_num(&dbs, 1).unwrap().unwrap().hide, 1);
        unhide_article(&dbs, 1).unwrap();
        assert_eq!(get_article_by_num(&dbs, 1).unwrap().unwrap().hide, 0);
    }

    #[test]
    fn test_user_spam_flags() {
        let (_dir, dbs) = open_group();
        insert_article_batch(&dbs, &[test_article("<a@x>", "", "2024-01-01 00:00:00")]).unwrap();
        assert!(!has_user_flagged_spam(&dbs, 1, 7).unwrap());
        record_user_spam_flag(&dbs, 1, 7).unwrap();
        assert!(has_user_flagged_spam(&dbs, 1, 7).unwrap());
        // Re-recording is a no-op.
        record_user_spam_flag(&dbs, 1, 7).unwrap();
        assert!(!has_user_flagged_spam(&dbs, 1, 8).unwrap());
    }

    #[test]
    fn test_date_round_trip() {
        let dt = parse_utc("2024-06-15 08:09:10").unwrap();
        assert_eq!(format_utc(dt), "2024-06-15 08:09:10");
        assert!(parse_utc("garbage").is_none());
    }
}
