//! History store: the durable Message-ID fingerprint set used to answer
//! "have I processed this ID anywhere before?".
//!
//! Reads are served directly from the shared connection; writes go
//! through a dedicated writer task so insertion order is preserved.
//! The short-hash length is stored on first use and locked thereafter;
//! attempts to change it fail validation without touching the store.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::config::{DEFAULT_SHORT_HASH_LEN, SHORT_HASH_LEN_MAX, SHORT_HASH_LEN_MIN};
use crate::error::{Error, Result};
use crate::storage::retry;

/// A queued history write.
#[derive(Debug, Clone)]
struct HistoryRecord {
    fingerprint: String,
    shard: String,
    newsgroup: String,
    article_num: i64,
}

#[derive(Debug)]
pub struct HistoryStore {
    conn: Mutex<Connection>,
    writer_tx: async_channel::Sender<HistoryRecord>,
    writer_rx: async_channel::Receiver<HistoryRecord>,
    /// Records accepted but not yet durably written.
    pending: AtomicUsize,
    short_hash_len: usize,
}

/// md5 hex fingerprint of a Message-ID.
pub fn fingerprint(message_id: &str) -> String {
    format!("{:x}", md5::compute(message_id.as_bytes()))
}

impl HistoryStore {
    /// Open the history file. `requested_len` is the `--useshorthashlen`
    /// flag: on a fresh store it is persisted and locked; on an existing
    /// store any differing value is rejected.
    pub fn open(path: &Path, requested_len: Option<usize>) -> Result<Arc<Self>> {
        if let Some(len) = requested_len {
            if !(SHORT_HASH_LEN_MIN..=SHORT_HASH_LEN_MAX).contains(&len) {
                return Err(Error::Validation(format!(
                    "short hash length must be in {SHORT_HASH_LEN_MIN}..={SHORT_HASH_LEN_MAX}, got {len}"
                )));
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 30_000)?;
        retry::exec_batch(
            &conn,
            "CREATE TABLE IF NOT EXISTS history (
                fingerprint TEXT PRIMARY KEY,
                shard TEXT NOT NULL,
                newsgroup TEXT NOT NULL,
                article_num INTEGER NOT NULL
            ) WITHOUT ROWID;
            CREATE TABLE IF NOT EXISTS history_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )?;

        let stored: Option<String> = retry::query_opt(
            &conn,
            "SELECT value FROM history_meta WHERE key = 'short_hash_len'",
            &[],
            |row| row.get(0),
        )?;

        let short_hash_len = match (stored, requested_len) {
            (Some(stored), Some(requested)) => {
                let stored: usize = stored
                    .parse()
                    .map_err(|_| Error::Validation("corrupt short_hash_len".into()))?;
                if stored != requested {
                    return Err(Error::Validation(format!(
                        "short hash length is locked at {stored}; cannot change to {requested}"
                    )));
                }
                stored
            }
            (Some(stored), None) => stored
                .parse()
                .map_err(|_| Error::Validation("corrupt short_hash_len".into()))?,
            (None, requested) => {
                let len = requested.unwrap_or(DEFAULT_SHORT_HASH_LEN);
                retry::exec(
                    &conn,
                    "INSERT INTO history_meta (key, value) VALUES ('short_hash_len', ?1)",
                    &[&len.to_string()],
                )?;
                retry::exec(
                    &conn,
                    "INSERT OR REPLACE INTO history_meta (key, value) VALUES ('locked', '1')",
                    &[],
                )?;
                debug!(len, "history short hash length fixed");
                len
            }
        };

        let (writer_tx, writer_rx) = async_channel::unbounded();
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            writer_tx,
            writer_rx,
            pending: AtomicUsize::new(0),
            short_hash_len,
        }))
    }

    pub fn short_hash_len(&self) -> usize {
        self.short_hash_len
    }

    /// Whether this Message-ID was ever recorded, in any group.
    pub fn exists(&self, message_id: &str) -> Result<bool> {
        let fp = fingerprint(message_id);
        let conn = self.conn.lock().expect("history store poisoned");
        let found: Option<i64> = retry::query_opt(
            &conn,
            "SELECT 1 FROM history WHERE fingerprint = ?1",
            &[&fp],
            |row| row.get(0),
        )?;
        Ok(found.is_some())
    }

    /// Queue a record for the writer task. Callable from blocking
    /// contexts; the channel is unbounded so this never stalls a commit.
    pub fn record(&self, message_id: &str, newsgroup: &str, article_num: i64) {
        let fp = fingerprint(message_id);
        let shard = fp[..self.short_hash_len.min(fp.len())].to_string();
        self.pending.fetch_add(1, Ordering::SeqCst);
        let record = HistoryRecord {
            fingerprint: fp,
            shard,
            newsgroup: newsgroup.to_string(),
            article_num,
        };
        if self.writer_tx.send_blocking(record).is_err() {
            // Writer already shut down; nothing will drain this.
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!("history writer is gone, record dropped");
        }
    }

    /// True when every accepted record has been durably written.
    pub fn check_no_more_work(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.writer_rx.is_empty()
    }

    /// Block (async) until the writer has drained everything.
    pub async fn wait_quiescent(&self) {
        while !self.check_no_more_work() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Spawn the ordered writer task. Exits once shutdown is signalled
    /// and the queue is drained.
    pub fn spawn_writer(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    record = store.writer_rx.recv() => {
                        match record {
                            Ok(record) => store.write_one(record),
                            Err(_) => break,
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            // Drain whatever is already queued.
                            while let Ok(record) = store.writer_rx.try_recv() {
                                store.write_one(record);
                            }
                            break;
                        }
                    }
                }
            }
        });
    }

    fn write_one(&self, record: HistoryRecord) {
        let conn = self.conn.lock().expect("history store poisoned");
        let result = retry::exec(
            &conn,
            "INSERT OR IGNORE INTO history (fingerprint, shard, newsgroup, article_num)
             VALUES (?1, ?2, ?3, ?4)",
            &[
                &record.fingerprint,
                &record.shard,
                &record.newsgroup,
                &record.article_num,
            ],
        );
        drop(conn);
        if let Err(e) = result {
            error!(error = %e, "history write failed");
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Synchronous write used by tests and the shutdown drain.
    #[cfg(test)]
    pub fn record_sync(&self, message_id: &str, newsgroup: &str, article_num: i64) -> Result<()> {
        self.record(message_id, newsgroup, article_num);
        while let Ok(record) = self.writer_rx.try_recv() {
            self.write_one(record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp(len: Option<usize>) -> (tempfile::TempDir, Arc<HistoryStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("history.db"), len).unwrap();
        (dir, store)
    }

    #[test]
    fn test_fingerprint_is_md5_hex() {
        assert_eq!(fingerprint("<a@x>").len(), 32);
        assert_eq!(fingerprint("<a@x>"), fingerprint("<a@x>"));
        assert_ne!(fingerprint("<a@x>"), fingerprint("<b@x>"));
    }

    #[test]
    fn test_record_and_exists() {
        let (_dir, store) = open_temp(None);
        assert!(!store.exists("<a@x>").unwrap());
        store.record_sync("<a@x>", "alt.test", 1).unwrap();
        assert!(store.exists("<a@x>").unwrap());
        assert!(store.check_no_more_work());
    }

    #[test]
    fn test_duplicate_records_are_ignored() {
        let (_dir, store) = open_temp(None);
        store.record_sync("<a@x>", "alt.test", 1).unwrap();
        store.record_sync("<a@x>", "alt.other", 9).unwrap();
        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM history", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_short_hash_len_fixed_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = HistoryStore::open(&path, Some(5)).unwrap();
            assert_eq!(store.short_hash_len(), 5);
        }
        // Reopen without a request: the stored value sticks.
        {
            let store = HistoryStore::open(&path, None).unwrap();
            assert_eq!(store.short_hash_len(), 5);
        }
        // Same value is accepted, a different one is rejected.
        assert!(HistoryStore::open(&path, Some(5)).is_ok());
        let err = HistoryStore::open(&path, Some(3)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_short_hash_len_range_enforced() {
        let dir = tempfile::tempdir().unwrap();
        for bad in [0, 1, 8, 100] {
            let err =
                HistoryStore::open(&dir.path().join(format!("h{bad}.db")), Some(bad)).unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
        for good in SHORT_HASH_LEN_MIN..=SHORT_HASH_LEN_MAX {
            HistoryStore::open(&dir.path().join(format!("ok{good}.db")), Some(good)).unwrap();
        }
    }
}
