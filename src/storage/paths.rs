//! Shard placement: group-name hashing, sanitization, and the expiring
//! bi-directional hash registry.
//!
//! A group's database lives at `<dataDir>/db/<md5(group)>/<sanitized>.db`.
//! Hashing and sanitization are pure and deterministic; the registry is
//! only a lookup convenience with expiring entries, swept periodically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::watch;
use tracing::trace;

use crate::config::{HASH_ENTRY_TTL, HASH_SWEEP_INTERVAL, JUNK_GROUP_NAME};

/// md5 hex digest of a group name; selects the shard directory.
pub fn group_hash(group: &str) -> String {
    format!("{:x}", md5::compute(group.as_bytes()))
}

/// Reduce a group name to a safe file stem: anything outside
/// `[a-zA-Z0-9_-]` becomes `_`, runs of `_` collapse, edges are
/// trimmed, and an empty result falls back to `junk`.
pub fn sanitize_group_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;
    for c in name.chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '-' {
            c
        } else {
            '_'
        };
        if mapped == '_' {
            if prev_underscore {
                continue;
            }
            prev_underscore = true;
        } else {
            prev_underscore = false;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        JUNK_GROUP_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Full path of a group's database file under the shard root.
pub fn group_db_path(shard_root: &Path, group: &str) -> PathBuf {
    shard_root
        .join(group_hash(group))
        .join(format!("{}.db", sanitize_group_name(group)))
}

#[derive(Debug)]
struct RegistryInner {
    /// group -> (hash, expiry)
    forward: HashMap<String, (String, Instant)>,
    /// hash -> (group, expiry)
    reverse: HashMap<String, (String, Instant)>,
}

/// Bi-directional group <-> hash mapping with expiring entries.
#[derive(Debug)]
pub struct HashRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for HashRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HashRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                forward: HashMap::new(),
                reverse: HashMap::new(),
            }),
        }
    }

    /// Hash a group name, refreshing the registry entry.
    pub fn group_to_hash(&self, group: &str) -> String {
        let hash = group_hash(group);
        let expiry = Instant::now() + HASH_ENTRY_TTL;
        let mut inner = self.inner.lock().expect("hash registry poisoned");
        inner
            .forward
            .insert(group.to_string(), (hash.clone(), expiry));
        inner
            .reverse
            .insert(hash.clone(), (group.to_string(), expiry));
        hash
    }

    /// Reverse lookup; only answers within the entry's expiry window.
    pub fn get_group_from_hash(&self, hash: &str) -> Option<String> {
        let inner = self.inner.lock().expect("hash registry poisoned");
        inner
            .reverse
            .get(hash)
            .filter(|(_, expiry)| *expiry > Instant::now())
            .map(|(group, _)| group.clone())
    }

    /// Drop expired entries from both directions.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("hash registry poisoned");
        inner.forward.retain(|_, (_, expiry)| *expiry > now);
        inner.reverse.retain(|_, (_, expiry)| *expiry > now);
        trace!(
            entries = inner.forward.len(),
            "hash registry swept"
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("hash registry poisoned").forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Background sweeper; exits when `shutdown` flips to true.
    pub fn spawn_sweeper(self: &std::sync::Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HASH_SWEEP_INTERVAL) => registry.sweep(),
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

    #[test]
    fn test_group_hash_is_stable() {
        assert_eq!(group_hash("alt.test"), group_hash("alt.test"));
        assert_ne!(group_hash("alt.test"), group_hash("alt.test2"));
        // md5 hex digest is 32 chars
        assert_eq!(group_hash("alt.test").len(), 32);
    }

    #[test]
    fn test_sanitize_replaces_and_collapses() {
        assert_eq!(sanitize_group_name("alt.binaries.test"), "alt_binaries_test");
        assert_eq!(sanitize_group_name("comp...lang"), "comp_lang");
        assert_eq!(sanitize_group_name("..edge.."), "edge");
        assert_eq!(sanitize_group_name("keep-dash_ok"), "keep-dash_ok");
    }

    #[test]
    fn test_sanitize_junk_fallback() {
        assert_eq!(sanitize_group_name(""), JUNK_GROUP_NAME);
        assert_eq!(sanitize_group_name("..."), JUNK_GROUP_NAME);
        assert_eq!(sanitize_group_name("日本語"), JUNK_GROUP_NAME);
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for name in ["alt.binaries.test", "..edge..", "", "a--b__c", "x y z"] {
            let once = sanitize_group_name(name);
            assert_eq!(sanitize_group_name(&once), once);
        }
    }

    #[test]
    fn test_group_db_path_layout() {
        let path = group_db_path(Path::new("/data/db"), "alt.test");
        let hash = group_hash("alt.test");
        assert_eq!(path, PathBuf::from(format!("/data/db/{hash}/alt_test.db")));
    }

    #[test]
    fn test_registry_round_trip() {
        let registry = HashRegistry::new();
        let hash = registry.group_to_hash("alt.test");
        assert_eq!(registry.get_group_from_hash(&hash).as_deref(), Some("alt.test"));
        assert!(registry.get_group_from_hash("deadbeef").is_none());
    }

    #[test]
    fn test_registry_sweep_keeps_live_entries() {
        let registry = HashRegistry::new();
        registry.group_to_hash("alt.one");
        registry.group_to_hash("alt.two");
        registry.sweep();
        assert_eq!(registry.len(), 2);
    }
}
