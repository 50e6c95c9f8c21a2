//! Content-addressable store for normalized clips.
//!
//! Layout of the cache root:
//!
//! ```text
//! <root>/index.json        key -> entry index
//! <root>/<key>.mp4         one media file per entry
//! <root>/.<key>.<id>.part  in-flight writes, renamed into place
//! ```
//!
//! The cache is shared by every run in the process and by other processes
//! using the same root. Media files are published with an atomic rename onto
//! their deterministic name, so a concurrent store of the same key is
//! idempotent. The index is persisted by read-merge-write through a temporary
//! file. An unreadable or unknown index degrades to empty; the cache never
//! fails a run.

use crate::clip::CacheKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use thiserror::Error;
use uuid::Uuid;

/// Index file name inside the cache root
pub const INDEX_FILE: &str = "index.json";

const INDEX_VERSION: u32 = 1;

/// Errors raised inside the cache. None of them escape as run failures.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Index unreadable/corrupt, or the cache is disabled
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One registered media file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// File name relative to the cache root
    pub file: String,
    pub created_unix_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
}

/// Counters and sizes reported by [`ClipCache::stats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Shared normalized-clip cache
#[derive(Debug)]
pub struct ClipCache {
    /// None when the cache is disabled
    root: Option<PathBuf>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// Modification time of the index when it was last read or written
    index_stamp: Mutex<Option<SystemTime>>,
    /// Serializes this process's index writes
    persist_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn index_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Read the index; a missing file is an empty index, anything unparsable is an error
fn read_index(path: &Path) -> Result<HashMap<String, CacheEntry>, CacheError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(CacheError::Unavailable(format!("cannot read index: {}", e))),
    };

    let index: IndexFile = serde_json::from_slice(&bytes)
        .map_err(|e| CacheError::Unavailable(format!("corrupt index: {}", e)))?;

    if index.version != INDEX_VERSION {
        return Err(CacheError::Unavailable(format!(
            "unsupported index version {}",
            index.version
        )));
    }

    Ok(index.entries.into_iter().collect())
}

/// Rename when possible, copy across filesystems otherwise
pub(crate) fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

impl ClipCache {
    /// Open (creating if needed) a cache rooted at `root`
    ///
    /// Never fails: an unusable root yields a disabled cache.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();

        if let Err(e) = fs::create_dir_all(&root) {
            tracing::warn!(root = %root.display(), error = %e, "cache root unusable, caching disabled");
            return Self::disabled();
        }

        let index_path = root.join(INDEX_FILE);
        let entries = match read_index(&index_path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "ignoring cache index");
                HashMap::new()
            }
        };
        tracing::debug!(root = %root.display(), entries = entries.len(), "opened clip cache");

        Self {
            root: Some(root),
            entries: RwLock::new(entries),
            index_stamp: Mutex::new(index_mtime(&index_path)),
            persist_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A cache that misses every lookup and refuses every store
    pub fn disabled() -> Self {
        Self {
            root: None,
            entries: RwLock::new(HashMap::new()),
            index_stamp: Mutex::new(None),
            persist_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    /// Path of a cached file for `key`, if one is registered and present
    pub fn lookup(&self, key: &CacheKey) -> Option<PathBuf> {
        let found = self.root.as_deref().and_then(|root| {
            self.resolve(root, key)
                .or_else(|| self.refresh_from_disk(root).then(|| self.resolve(root, key)).flatten())
        });

        match &found {
            Some(path) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, path = %path.display(), "cache hit");
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "cache miss");
            }
        }
        found
    }

    fn resolve(&self, root: &Path, key: &CacheKey) -> Option<PathBuf> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key.as_str())
            .map(|entry| root.join(&entry.file))
            .filter(|path| path.is_file())
    }

    /// Pick up entries another process registered. Returns true if anything was read.
    fn refresh_from_disk(&self, root: &Path) -> bool {
        let index_path = root.join(INDEX_FILE);
        let current = index_mtime(&index_path);

        {
            let mut stamp = self.index_stamp.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_none() || *stamp == current {
                return false;
            }
            *stamp = current;
        }

        match read_index(&index_path) {
            Ok(on_disk) => {
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                for (key, entry) in on_disk {
                    entries.entry(key).or_insert(entry);
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring cache index");
                false
            }
        }
    }

    /// Move `produced` into the cache under `key` and register it
    ///
    /// Concurrent stores of the same key are idempotent: whichever rename lands
    /// last owns the name, and the entries they register are identical.
    pub fn store(&self, key: &CacheKey, produced: &Path) -> Result<PathBuf, CacheError> {
        let root = self
            .root
            .as_deref()
            .ok_or_else(|| CacheError::Unavailable("cache disabled".to_string()))?;

        let file_name = key.file_name();
        let final_path = root.join(&file_name);
        let part_path = root.join(format!(".{}.{}.part", key.as_str(), Uuid::new_v4()));

        move_file(produced, &part_path)?;
        if let Err(e) = fs::rename(&part_path, &final_path) {
            let _ = fs::remove_file(&part_path);
            if !final_path.is_file() {
                return Err(CacheError::Io(e));
            }
            // another writer published the same key first; keep theirs
        }

        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.insert(
                key.as_str().to_string(),
                CacheEntry {
                    file: file_name,
                    created_unix_ms: now_unix_ms(),
                },
            );
        }

        if let Err(e) = self.persist(root) {
            // the file is in place; only cross-process visibility suffers
            tracing::warn!(key = %key, error = %e, "failed to persist cache index");
        }

        tracing::debug!(key = %key, path = %final_path.display(), "stored clip in cache");
        Ok(final_path)
    }

    /// Merge the in-memory entries with the on-disk index and write it atomically
    fn persist(&self, root: &Path) -> Result<(), CacheError> {
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        let index_path = root.join(INDEX_FILE);

        let mut merged: BTreeMap<String, CacheEntry> = read_index(&index_path)
            .unwrap_or_default()
            .into_iter()
            .collect();
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            for (key, entry) in entries.iter() {
                merged.insert(key.clone(), entry.clone());
            }
        }
        merged.retain(|_, entry| root.join(&entry.file).is_file());

        let index = IndexFile {
            version: INDEX_VERSION,
            entries: merged,
        };

        let mut tmp = NamedTempFile::new_in(root)?;
        serde_json::to_writer_pretty(&mut tmp, &index)
            .map_err(|e| CacheError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        tmp.flush()?;
        tmp.persist(&index_path).map_err(|e| CacheError::Io(e.error))?;

        let mut stamp = self.index_stamp.lock().unwrap_or_else(|e| e.into_inner());
        *stamp = index_mtime(&index_path);
        Ok(())
    }

    /// Entry count, on-disk size and hit/miss counters
    pub fn stats(&self) -> CacheStats {
        let (entries, total_bytes) = match self.root.as_deref() {
            Some(root) => {
                let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
                let total = entries
                    .values()
                    .filter_map(|entry| fs::metadata(root.join(&entry.file)).ok())
                    .map(|m| m.len())
                    .sum();
                (entries.len(), total)
            }
            None => (0, 0),
        };

        CacheStats {
            entries,
            total_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Remove every cached file and the index. Returns the number of files removed.
    ///
    /// Must not run while other runs are using the cache.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let Some(root) = self.root.as_deref() else {
            return Ok(0);
        };
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut removed = 0;
        for dir_entry in fs::read_dir(root)? {
            let path = dir_entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let managed = name == INDEX_FILE || name.ends_with(".mp4") || name.ends_with(".part");
            if managed && path.is_file() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.index_stamp.lock().unwrap_or_else(|e| e.into_inner()) = None;

        tracing::info!(root = %root.display(), removed, "cleared clip cache");
        Ok(removed)
    }
}
