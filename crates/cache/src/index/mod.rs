//! In-memory entry index
//!
//! Tracks every entry's hash, size and last-used time, and decides when
//! eviction must run. The index starts empty and unloaded; a background task
//! populates it from disk via [`CacheIndex::merge_loaded`]. Until that
//! happens membership queries answer conservatively (`has` returns true) so
//! lookups fall through to the files rather than miss spuriously.
//!
//! Eviction is watermark-driven: once total size passes the high watermark,
//! the oldest entries are dropped from the index and their hashes handed to
//! the deletion listener until total size is back under the low watermark.

pub mod persistence;

use crate::hashing::EntryHash;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};

/// What the index remembers about one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    /// `None` for entries that have never been used since their timestamp
    /// was recorded with second precision
    pub last_used: Option<SystemTime>,
    pub size: u64,
}

struct IndexInner {
    entries: HashMap<EntryHash, EntryMetadata>,
    total: u64,
    loaded: bool,
    /// Removals observed before the disk load landed; the merge must not
    /// resurrect these
    pending_removals: HashSet<EntryHash>,
    ready_waiters: Vec<oneshot::Sender<()>>,
    /// One eviction pass runs at a time
    evicting: bool,
    /// Set on any mutation since the last flush
    dirty: bool,
}

pub(crate) struct CacheIndex {
    inner: Mutex<IndexInner>,
    max_size: u64,
    high_watermark: u64,
    low_watermark: u64,
    evict_tx: mpsc::UnboundedSender<Vec<EntryHash>>,
}

impl CacheIndex {
    pub fn new(max_size: u64, evict_tx: mpsc::UnboundedSender<Vec<EntryHash>>) -> Self {
        let margin = max_size / 20;
        Self {
            inner: Mutex::new(IndexInner {
                entries: HashMap::new(),
                total: 0,
                loaded: false,
                pending_removals: HashSet::new(),
                ready_waiters: Vec::new(),
                evicting: false,
                dirty: false,
            }),
            max_size,
            high_watermark: max_size - margin,
            low_watermark: max_size - 2 * margin,
            evict_tx,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Membership check. Answers `true` for everything while the disk load
    /// is still in flight; the file open sorts out reality.
    pub fn has(&self, hash: EntryHash) -> bool {
        let inner = self.inner.lock();
        if !inner.loaded {
            return true;
        }
        inner.entries.contains_key(&hash)
    }

    /// Whether the disk load has completed yet
    pub fn is_loaded(&self) -> bool {
        self.inner.lock().loaded
    }

    pub fn total_size(&self) -> u64 {
        self.inner.lock().total
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Record an entry with fresh metadata, replacing any previous record
    pub fn insert(&self, hash: EntryHash, metadata: EntryMetadata) {
        let mut inner = self.inner.lock();
        inner.pending_removals.remove(&hash);
        if let Some(old) = inner.entries.insert(hash, metadata) {
            inner.total -= old.size;
        }
        inner.total += metadata.size;
        inner.dirty = true;
        self.maybe_start_eviction(&mut inner);
    }

    /// Drop an entry from the index. Returns whether it was present. While
    /// unloaded the removal is remembered so the later merge cannot bring
    /// the entry back.
    pub fn remove(&self, hash: EntryHash) -> bool {
        let mut inner = self.inner.lock();
        if !inner.loaded {
            inner.pending_removals.insert(hash);
        }
        match inner.entries.remove(&hash) {
            Some(old) => {
                inner.total -= old.size;
                inner.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Touch an entry's last-used time if the index knows it
    pub fn use_if_exists(&self, hash: EntryHash) {
        let mut inner = self.inner.lock();
        if let Some(meta) = inner.entries.get_mut(&hash) {
            meta.last_used = Some(SystemTime::now());
            inner.dirty = true;
        }
    }

    /// Replace an entry's size and touch it; called when an entry closes
    /// with its final on-disk footprint
    pub fn update_entry_size(&self, hash: EntryHash, size: u64) {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&hash) {
            Some(meta) => {
                let old = meta.size;
                meta.size = size;
                meta.last_used = Some(SystemTime::now());
                inner.total = inner.total - old + size;
            }
            None => {
                // Evicted (or never indexed) while open; reinstate it.
                inner.entries.insert(
                    hash,
                    EntryMetadata {
                        last_used: Some(SystemTime::now()),
                        size,
                    },
                );
                inner.total += size;
            }
        }
        inner.dirty = true;
        self.maybe_start_eviction(&mut inner);
    }

    /// Fold the disk-loaded records in. In-memory records always win:
    /// anything created, updated or removed while the load ran is newer than
    /// what the load saw.
    pub fn merge_loaded(&self, loaded: Vec<(EntryHash, EntryMetadata)>) {
        let mut inner = self.inner.lock();
        for (hash, metadata) in loaded {
            if inner.pending_removals.contains(&hash) || inner.entries.contains_key(&hash) {
                continue;
            }
            inner.entries.insert(hash, metadata);
            inner.total += metadata.size;
        }
        inner.loaded = true;
        inner.pending_removals.clear();
        inner.dirty = true;
        for waiter in inner.ready_waiters.drain(..) {
            let _ = waiter.send(());
        }
        tracing::debug!(
            entries = inner.entries.len(),
            total = inner.total,
            "index load merged"
        );
        self.maybe_start_eviction(&mut inner);
    }

    /// Resolve once the index has finished loading
    pub async fn await_ready(&self) {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.loaded {
                return;
            }
            let (tx, rx) = oneshot::channel();
            inner.ready_waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    pub fn all_hashes(&self) -> Vec<EntryHash> {
        self.inner.lock().entries.keys().copied().collect()
    }

    /// Hashes of entries last used within `[begin, end)`. `None` bounds are
    /// open; never-used entries only match a fully open lower bound.
    pub fn hashes_between(
        &self,
        begin: Option<SystemTime>,
        end: Option<SystemTime>,
    ) -> Vec<EntryHash> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(_, meta)| match meta.last_used {
                Some(t) => begin.is_none_or(|b| t >= b) && end.is_none_or(|e| t < e),
                None => begin.is_none(),
            })
            .map(|(hash, _)| *hash)
            .collect()
    }

    /// Called by the deletion listener when a handed-off victim batch has
    /// been dealt with; allows the next eviction pass to start
    pub fn eviction_finished(&self) {
        let mut inner = self.inner.lock();
        inner.evicting = false;
        self.maybe_start_eviction(&mut inner);
    }

    /// Consume the dirty flag; true means the index changed since the last
    /// call
    pub fn take_dirty(&self) -> bool {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.dirty)
    }

    /// Stable copy of the current records (sorted by hash) plus total size
    pub fn snapshot(&self) -> (Vec<(EntryHash, EntryMetadata)>, u64) {
        let inner = self.inner.lock();
        let mut records: Vec<_> = inner.entries.iter().map(|(h, m)| (*h, *m)).collect();
        records.sort_unstable_by_key(|(hash, _)| *hash);
        (records, inner.total)
    }

    fn maybe_start_eviction(&self, inner: &mut IndexInner) {
        if !inner.loaded || inner.evicting || inner.total <= self.high_watermark {
            return;
        }
        // Oldest first; never-used entries evict before any timestamped
        // one, hash breaks ties deterministically.
        let mut candidates: Vec<_> = inner
            .entries
            .iter()
            .map(|(hash, meta)| (meta.last_used, *hash, meta.size))
            .collect();
        candidates.sort_unstable_by_key(|&(last_used, hash, _)| (last_used, hash));

        let mut victims = Vec::new();
        for (_, hash, size) in candidates {
            if inner.total <= self.low_watermark {
                break;
            }
            inner.entries.remove(&hash);
            inner.total -= size;
            victims.push(hash);
        }
        if victims.is_empty() {
            return;
        }
        tracing::info!(
            victims = victims.len(),
            total = inner.total,
            low_watermark = self.low_watermark,
            "evicting oldest entries"
        );
        inner.dirty = true;
        inner.evicting = true;
        if self.evict_tx.send(victims).is_err() {
            // Shutdown: nobody will call eviction_finished.
            inner.evicting = false;
        }
    }
}
