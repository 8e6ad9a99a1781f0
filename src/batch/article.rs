//! The article unit handed to the batch orchestrator.
//!
//! An article may belong to several groups; ownership is the explicit
//! `newsgroups` list plus a per-group assigned-number map. The heavy
//! transient fields (body, headers, references) are cleared once every
//! group the article belongs to has committed it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::storage::articles::PreparedArticle;

/// Transient payload dropped after the last group commit.
#[derive(Debug, Clone, Default)]
pub struct HeavyFields {
    /// Parsed references, oldest first.
    pub references: Vec<String>,
    pub headers_json: String,
    pub body_text: String,
}

pub struct IncomingArticle {
    pub message_id: String,
    pub subject: String,
    pub from_header: String,
    pub date_sent: DateTime<Utc>,
    pub date_string: String,
    pub bytes: i64,
    pub lines: i64,
    pub path: String,
    pub downloaded: bool,
    /// No references at all.
    pub is_thread_root: bool,
    /// Carries references; its root is resolved at commit time.
    pub is_reply: bool,
    /// Groups this article belongs to.
    pub newsgroups: Vec<String>,
    heavy: Mutex<Option<HeavyFields>>,
    article_nums: Mutex<HashMap<String, i64>>,
    remaining_groups: AtomicUsize,
    /// Per-article ack channel: the assigned number is sent once the
    /// group commit has recorded history.
    pub process_queue: Option<async_channel::Sender<i64>>,
}

impl IncomingArticle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_id: String,
        subject: String,
        from_header: String,
        date_sent: DateTime<Utc>,
        date_string: String,
        references: Vec<String>,
        bytes: i64,
        lines: i64,
        path: String,
        headers_json: String,
        body_text: String,
        downloaded: bool,
        newsgroups: Vec<String>,
        process_queue: Option<async_channel::Sender<i64>>,
    ) -> Self {
        let is_reply = !references.is_empty();
        let groups = newsgroups.len();
        Self {
            message_id,
            subject,
            from_header,
            date_sent,
            date_string,
            bytes,
            lines,
            path,
            downloaded,
            is_thread_root: !is_reply,
            is_reply,
            newsgroups,
            heavy: Mutex::new(Some(HeavyFields {
                references,
                headers_json,
                body_text,
            })),
            article_nums: Mutex::new(HashMap::new()),
            remaining_groups: AtomicUsize::new(groups),
            process_queue,
        }
    }

    /// Snapshot the heavy fields for a commit. Empty after clearing.
    pub fn heavy_fields(&self) -> HeavyFields {
        self.heavy
            .lock()
            .expect("article poisoned")
            .clone()
            .unwrap_or_default()
    }

    pub fn references(&self) -> Vec<String> {
        self.heavy
            .lock()
            .expect("article poisoned")
            .as_ref()
            .map(|h| h.references.clone())
            .unwrap_or_default()
    }

    pub fn set_article_num(&self, group: &str, num: i64) {
        self.article_nums
            .lock()
            .expect("article poisoned")
            .insert(group.to_string(), num);
    }

    pub fn article_num(&self, group: &str) -> Option<i64> {
        self.article_nums
            .lock()
            .expect("article poisoned")
            .get(group)
            .copied()
    }

    /// Mark one group's commit finished; the heavy fields are released
    /// once every group has committed.
    pub fn finish_group(&self) {
        if self.remaining_groups.fetch_sub(1, Ordering::SeqCst) == 1 {
            *self.heavy.lock().expect("article poisoned") = None;
        }
    }

    /// Row shape for the group-store insert.
    pub fn to_prepared(&self) -> PreparedArticle {
        let heavy = self.heavy_fields();
        PreparedArticle {
            message_id: self.message_id.clone(),
            subject: self.subject.clone(),
            from_header: self.from_header.clone(),
            date_sent: self.date_sent,
            date_string: self.date_string.clone(),
            refs: heavy.references.join(" "),
            bytes: self.bytes,
            lines: self.lines,
            path: self.path.clone(),
            headers_json: heavy.headers_json,
            body_text: heavy.body_text,
            downloaded: self.downloaded,
        }
    }
}
