//! Persistent `.e2/hashcache`: remembers checksums already computed for a
//! file so that `checksum_verify` does not need to re-hash unchanged files
//! on every build.
//!
//! Entries are keyed by `(dev, inode, size, mtime, ctime)` — if any of those
//! change, the cached checksum is assumed stale and is recomputed. The cache
//! is rewritten once, at process shutdown, sorted by most-recent-use and
//! capped to a maximum entry count; it is never consulted or updated at all
//! in release build mode.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileIdentity {
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            size: meta.size(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        Ok(Self::from_metadata(&meta))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HashCacheEntry {
    identity: FileIdentity,
    sha256: String,
    last_used: i64,
    use_count: u64,
}

/// Persistent checksum cache, held in memory for the duration of one run.
#[derive(Debug, Clone, Default)]
pub struct HashCache {
    entries: Vec<HashCacheEntry>,
    enabled: bool,
}

impl HashCache {
    /// Load the cache from `path`. `enabled` should be `false` in release
    /// build mode, in which case the cache is never consulted or updated.
    pub fn load(path: &Path, enabled: bool) -> Result<Self> {
        if !enabled || !path.exists() {
            return Ok(Self {
                entries: Vec::new(),
                enabled,
            });
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read hashcache at {}", path.display()))?;
        let entries: Vec<HashCacheEntry> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse hashcache at {}", path.display()))?;
        Ok(Self { entries, enabled })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a cached checksum for a file's current identity, bumping its
    /// use counter on hit.
    pub fn lookup(&mut self, identity: &FileIdentity) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let now = Utc::now().timestamp();
        let entry = self.entries.iter_mut().find(|e| &e.identity == identity)?;
        entry.last_used = now;
        entry.use_count += 1;
        Some(entry.sha256.clone())
    }

    /// Record a freshly-computed checksum for a file identity.
    pub fn insert(&mut self, identity: FileIdentity, sha256: String) {
        if !self.enabled {
            return;
        }
        let now = Utc::now().timestamp();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.identity == identity) {
            entry.sha256 = sha256;
            entry.last_used = now;
            entry.use_count += 1;
            return;
        }
        self.entries.push(HashCacheEntry {
            identity,
            sha256,
            last_used: now,
            use_count: 1,
        });
    }

    /// Rewrite the cache file at shutdown: sort by most-recent-use and keep
    /// only the `cap` most recently used entries.
    pub fn write_at_shutdown(&mut self, path: &Path, cap: usize) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.entries.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        self.entries.truncate(cap);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("tmp");
        let json = serde_json::to_string(&self.entries).context("failed to serialize hashcache")?;
        fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename hashcache into place at {}", path.display()))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Default path for the hashcache beneath a project's `.e2` state directory.
pub fn default_path(state_dir: &Path) -> PathBuf {
    state_dir.join("hashcache")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn identity(seed: u64) -> FileIdentity {
        FileIdentity {
            dev: 1,
            ino: seed,
            size: 100,
            mtime: 1000,
            ctime: 1000,
        }
    }

    #[test]
    fn disabled_cache_never_hits() {
        let mut cache = HashCache::load(Path::new("/nonexistent"), false).unwrap();
        cache.insert(identity(1), "abc".into());
        assert!(cache.lookup(&identity(1)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_then_lookup_hits() {
        let mut cache = HashCache {
            entries: Vec::new(),
            enabled: true,
        };
        cache.insert(identity(1), "abc".into());
        assert_eq!(cache.lookup(&identity(1)), Some("abc".to_string()));
    }

    #[test]
    fn identity_change_misses() {
        let mut cache = HashCache {
            entries: Vec::new(),
            enabled: true,
        };
        cache.insert(identity(1), "abc".into());
        let mut changed = identity(1);
        changed.mtime += 1;
        assert!(cache.lookup(&changed).is_none());
    }

    #[test]
    fn write_at_shutdown_caps_and_sorts_by_recency() {
        let td = tempdir().unwrap();
        let path = default_path(td.path());
        let mut cache = HashCache {
            entries: Vec::new(),
            enabled: true,
        };
        for i in 0..5 {
            cache.insert(identity(i), format!("hash{i}"));
        }
        cache.write_at_shutdown(&path, 2).unwrap();
        assert!(path.exists());

        let reloaded = HashCache::load(&path, true).unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn write_at_shutdown_is_noop_when_disabled() {
        let td = tempdir().unwrap();
        let path = default_path(td.path());
        let mut cache = HashCache::load(&path, false).unwrap();
        cache.write_at_shutdown(&path, 10).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn roundtrip_through_disk_preserves_entry() {
        let td = tempdir().unwrap();
        let path = default_path(td.path());
        let mut cache = HashCache {
            entries: Vec::new(),
            enabled: true,
        };
        cache.insert(identity(42), "deadbeef".into());
        cache.write_at_shutdown(&path, 10).unwrap();

        let mut reloaded = HashCache::load(&path, true).unwrap();
        assert_eq!(reloaded.lookup(&identity(42)), Some("deadbeef".to_string()));
    }
}
