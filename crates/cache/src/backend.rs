//! Backend coordinator
//!
//! [`FlatCache`] owns the cache directory, the in-memory index, and the set
//! of active entries. All entry-level operations funnel through a per-hash
//! op queue: while an open, create, doom or close is in flight for a hash,
//! later operations on the same hash wait their turn in FIFO order. That
//! single rule gives doom-then-recreate, close-then-open and concurrent
//! opens their ordering without any larger lock.
//!
//! Three background tasks run per cache: the initial index load, the
//! eviction listener that deletes victim files, and the periodic index
//! flush. They hold weak references, so dropping the last [`FlatCache`]
//! clone shuts everything down.

use crate::config::CacheConfig;
use crate::entry::{Entry, EntryShared, EntryState};
use crate::errors::{CacheError, Result};
use crate::hashing::{entry_hash, EntryHash};
use crate::index::persistence::{self, LoadedIndex};
use crate::index::{CacheIndex, EntryMetadata};
use crate::sync_entry::{EntryOptions, SyncEntry};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// An operation waiting for (or holding) a hash's turn in the op queue
pub(crate) enum DeferredOp {
    Open {
        /// `None` opens whatever entry the hash resolves to, as the
        /// iterator does
        key: Option<String>,
        reply: oneshot::Sender<Result<Entry>>,
    },
    Create {
        key: String,
        reply: oneshot::Sender<Result<Entry>>,
    },
    Doom {
        /// Eviction dooms without anyone waiting on the outcome
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Close {
        /// Kept in the active map until this op executes, so queued opens
        /// can revive the entry instead of racing the write-back
        shared: Arc<EntryShared>,
    },
}

#[derive(Default)]
struct BackendState {
    /// Entries with at least one live handle
    active: HashMap<EntryHash, Arc<EntryShared>>,
    /// Presence means an op holds the hash; the queue holds the ops behind
    /// it
    pending: HashMap<EntryHash, VecDeque<DeferredOp>>,
}

pub(crate) struct BackendShared {
    dir: PathBuf,
    entry_options: EntryOptions,
    index: CacheIndex,
    runtime: Handle,
    state: parking_lot::Mutex<BackendState>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Disk cache backend
///
/// Cheap to clone; all clones share one cache. Entries are addressed by
/// string key, hashed to a 64-bit identity. The cache evicts least recently
/// used entries on its own once total size crosses the high watermark.
#[derive(Clone)]
pub struct FlatCache {
    shared: Arc<BackendShared>,
}

impl FlatCache {
    /// Open (or create) the cache rooted at `config.path`. The index loads
    /// in the background; operations issued before it finishes work off the
    /// files directly.
    pub async fn new(config: CacheConfig) -> Result<FlatCache> {
        let dir = config.path.clone();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io(&dir, "create cache directory", e))?;
        let max_size = config.resolved_max_size();
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(BackendShared {
            dir: dir.clone(),
            entry_options: EntryOptions {
                omit_empty_stream2: config.omit_empty_stream2,
                sparse_budget: config.resolved_sparse_budget(),
            },
            index: CacheIndex::new(max_size, evict_tx),
            runtime: Handle::current(),
            state: parking_lot::Mutex::new(BackendState::default()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let mut tasks = vec![
            spawn_index_load(&shared),
            spawn_eviction_listener(&shared, evict_rx),
        ];
        if !config.flush_interval.is_zero() {
            tasks.push(spawn_periodic_flush(&shared, config.flush_interval));
        }
        *shared.tasks.lock() = tasks;

        tracing::info!(path = %dir.display(), max_size, "cache opened");
        Ok(FlatCache { shared })
    }

    /// Open an existing entry. Misses and key collisions (a different key
    /// occupying this key's hash) both come back as `NotFound`.
    pub async fn open_entry(&self, key: &str) -> Result<Entry> {
        self.shared
            .queue_open(entry_hash(key), Some(key.to_string()))
            .await
    }

    /// Create a new entry. Fails with `AlreadyExists` when the key is
    /// present; an entry squatting on the hash under a different key is
    /// doomed and replaced.
    pub async fn create_entry(&self, key: &str) -> Result<Entry> {
        self.shared.queue_create(entry_hash(key), key.to_string()).await
    }

    /// Delete an entry by key. Open handles to it keep working against the
    /// deleted files. Dooming an absent entry is not an error.
    pub async fn doom_entry(&self, key: &str) -> Result<()> {
        self.shared.doom_hash(entry_hash(key)).await
    }

    /// Delete every entry. Waits for the index to finish loading so the
    /// sweep is complete.
    pub async fn doom_all(&self) -> Result<()> {
        self.shared.index.await_ready().await;
        let mut hashes: HashSet<EntryHash> =
            self.shared.index.all_hashes().into_iter().collect();
        hashes.extend(self.shared.state.lock().active.keys().copied());
        self.shared.doom_many(hashes.into_iter().collect()).await
    }

    /// Delete entries last used within `[begin, end)`; `None` leaves that
    /// side unbounded
    pub async fn doom_entries_between(
        &self,
        begin: Option<SystemTime>,
        end: Option<SystemTime>,
    ) -> Result<()> {
        self.shared.index.await_ready().await;
        let hashes = self.shared.index.hashes_between(begin, end);
        self.shared.doom_many(hashes).await
    }

    /// Delete entries last used at or after `since`
    pub async fn doom_entries_since(&self, since: SystemTime) -> Result<()> {
        self.doom_entries_between(Some(since), None).await
    }

    /// Resolves once the index has finished its initial load
    pub async fn index_ready(&self) {
        self.shared.index.await_ready().await;
    }

    /// Persist the index now instead of waiting for the periodic flush
    pub async fn flush_index(&self) -> Result<()> {
        self.shared.index.await_ready().await;
        self.shared.index.take_dirty();
        let (records, _) = self.shared.index.snapshot();
        let dir = self.shared.dir.clone();
        match tokio::task::spawn_blocking(move || persistence::save(&dir, &records)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::ShutDown),
        }
    }

    /// Iterate over all entries present when iteration starts. Entries
    /// created afterwards may or may not be seen; doomed entries are
    /// skipped.
    pub fn iter(&self) -> EntryIter {
        EntryIter {
            shared: Arc::clone(&self.shared),
            hashes: None,
            pos: 0,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.shared.index.max_size()
    }

    /// Number of indexed entries; approximate until the index has loaded
    pub fn entry_count(&self) -> usize {
        self.shared.index.len()
    }

    /// Total indexed size in bytes; approximate until the index has loaded
    pub fn total_size(&self) -> u64 {
        self.shared.index.total_size()
    }

    #[cfg(test)]
    pub(crate) async fn open_with_hash(&self, key: &str, hash: EntryHash) -> Result<Entry> {
        self.shared.queue_open(hash, Some(key.to_string())).await
    }

    #[cfg(test)]
    pub(crate) async fn create_with_hash(&self, key: &str, hash: EntryHash) -> Result<Entry> {
        self.shared.queue_create(hash, key.to_string()).await
    }
}

/// Async iterator over a cache's entries
pub struct EntryIter {
    shared: Arc<BackendShared>,
    hashes: Option<Vec<EntryHash>>,
    pos: usize,
}

impl EntryIter {
    /// Next live entry, or `None` when exhausted
    pub async fn next_entry(&mut self) -> Option<Entry> {
        if self.hashes.is_none() {
            self.shared.index.await_ready().await;
            let mut hashes = self.shared.index.all_hashes();
            hashes.sort_unstable();
            self.hashes = Some(hashes);
        }
        loop {
            let hash = *self.hashes.as_ref()?.get(self.pos)?;
            self.pos += 1;
            match self.shared.queue_open(hash, None).await {
                Ok(entry) => return Some(entry),
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    tracing::debug!(%hash, "iterator skipping entry: {e}");
                    continue;
                }
            }
        }
    }
}

impl BackendShared {
    async fn queue_open(self: &Arc<Self>, hash: EntryHash, key: Option<String>) -> Result<Entry> {
        let (tx, rx) = oneshot::channel();
        self.submit(hash, DeferredOp::Open { key, reply: tx });
        rx.await.map_err(|_| CacheError::ShutDown)?
    }

    async fn queue_create(self: &Arc<Self>, hash: EntryHash, key: String) -> Result<Entry> {
        let (tx, rx) = oneshot::channel();
        self.submit(hash, DeferredOp::Create { key, reply: tx });
        rx.await.map_err(|_| CacheError::ShutDown)?
    }

    pub(crate) async fn doom_hash(self: &Arc<Self>, hash: EntryHash) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(hash, DeferredOp::Doom { reply: Some(tx) });
        rx.await.map_err(|_| CacheError::ShutDown)?
    }

    /// Doom a batch. Hashes that are active or mid-operation go through the
    /// op queue one by one; idle hashes are claimed up front and deleted in
    /// a single bulk pass. The first failure wins, but every deletion is
    /// attempted.
    async fn doom_many(self: &Arc<Self>, hashes: Vec<EntryHash>) -> Result<()> {
        let mut waits = Vec::new();
        let mut bulk = Vec::new();
        {
            let mut state = self.state.lock();
            for hash in hashes {
                if state.active.contains_key(&hash) || state.pending.contains_key(&hash) {
                    let (tx, rx) = oneshot::channel();
                    let op = DeferredOp::Doom { reply: Some(tx) };
                    if let Some(op) = self.claim_or_queue(&mut state, hash, op) {
                        self.run_op(hash, op);
                    }
                    waits.push(rx);
                } else {
                    // Claim the idle hash so nothing else touches it while
                    // the bulk deletion runs.
                    state.pending.insert(hash, VecDeque::new());
                    bulk.push(hash);
                }
            }
        }
        let queued = waits.len();
        let bulked = bulk.len();

        let mut first_err = None;
        if !bulk.is_empty() {
            for &hash in &bulk {
                self.index.remove(hash);
            }
            let dir = self.dir.clone();
            let set = bulk.clone();
            let deleted = run_blocking(
                tokio::task::spawn_blocking(move || SyncEntry::doom_set(&dir, &set)).await,
            );
            for hash in bulk {
                self.finish_op(hash);
            }
            if let Err(e) = deleted {
                first_err.get_or_insert(e);
            }
        }

        for outcome in futures::future::join_all(waits).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(CacheError::ShutDown);
                }
            }
        }
        tracing::debug!(queued, bulked, "mass doom finished");
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Hand an op to the hash's queue; runs it immediately if the hash is
    /// idle
    pub(crate) fn submit(self: &Arc<Self>, hash: EntryHash, op: DeferredOp) {
        let run_now = self.claim_or_queue(&mut self.state.lock(), hash, op);
        if let Some(op) = run_now {
            self.run_op(hash, op);
        }
    }

    /// Under the state lock: claim the hash for `op`, or queue it behind
    /// the current holder. Returns the op if the caller must run it.
    fn claim_or_queue(
        &self,
        state: &mut BackendState,
        hash: EntryHash,
        op: DeferredOp,
    ) -> Option<DeferredOp> {
        use std::collections::hash_map::Entry as MapEntry;
        match state.pending.entry(hash) {
            MapEntry::Occupied(mut busy) => {
                busy.get_mut().push_back(op);
                None
            }
            MapEntry::Vacant(idle) => {
                idle.insert(VecDeque::new());
                Some(op)
            }
        }
    }

    fn run_op(self: &Arc<Self>, hash: EntryHash, op: DeferredOp) {
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            this.execute(hash, op).await;
            this.finish_op(hash);
        });
    }

    /// Release the hash and start the next queued op, if any
    fn finish_op(self: &Arc<Self>, hash: EntryHash) {
        let next = {
            let mut state = self.state.lock();
            match state.pending.get_mut(&hash) {
                Some(queue) => match queue.pop_front() {
                    Some(op) => Some(op),
                    None => {
                        state.pending.remove(&hash);
                        None
                    }
                },
                None => None,
            }
        };
        if let Some(op) = next {
            self.run_op(hash, op);
        }
    }

    async fn execute(self: &Arc<Self>, hash: EntryHash, op: DeferredOp) {
        match op {
            DeferredOp::Open { key, reply } => {
                let _ = reply.send(self.do_open(hash, key).await);
            }
            DeferredOp::Create { key, reply } => {
                let _ = reply.send(self.do_create(hash, key).await);
            }
            DeferredOp::Doom { reply } => {
                let result = self.do_doom(hash).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                } else if let Err(e) = result {
                    tracing::warn!(%hash, "evicted entry deletion failed: {e}");
                }
            }
            DeferredOp::Close { shared } => {
                self.do_close(hash, shared).await;
            }
        }
    }

    async fn do_open(self: &Arc<Self>, hash: EntryHash, key: Option<String>) -> Result<Entry> {
        if let Some(outcome) = self.share_active(hash, key.as_deref()) {
            return outcome;
        }
        let had_hint = self.index.has(hash);
        if !had_hint {
            // A loaded index is authoritative for misses (`has` answers
            // true while the load is still in flight), so skip the disk
            // probe entirely.
            return Err(CacheError::NotFound);
        }
        let dir = self.dir.clone();
        let options = self.entry_options;
        let expected = key.clone();
        let opened = run_blocking(
            tokio::task::spawn_blocking(move || {
                SyncEntry::open(options, &dir, hash, expected.as_deref(), had_hint)
            })
            .await,
        );
        let (sync, stat, stream0) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                if e.is_not_found() && self.index.is_loaded() {
                    // The index promised an entry the disk does not have.
                    tracing::debug!(%hash, "dropping stale index record");
                    self.index.remove(hash);
                }
                return Err(e);
            }
        };
        if let Some(requested) = &key {
            if sync.key() != requested {
                // Another key occupies this hash; for the caller that is a
                // plain miss.
                tracing::debug!(%hash, "hash collision on open");
                return Err(CacheError::NotFound);
            }
        }
        Ok(self.register(hash, sync, stat, stream0))
    }

    async fn do_create(self: &Arc<Self>, hash: EntryHash, key: String) -> Result<Entry> {
        let active_conflict = {
            let state = self.state.lock();
            state.active.get(&hash).map(|shared| shared.key == key)
        };
        match active_conflict {
            Some(true) => return Err(CacheError::AlreadyExists),
            Some(false) => {
                // Collision with an open entry: evict the squatter first.
                self.do_doom(hash).await?;
            }
            None => {}
        }

        let mut collision_doomed = false;
        loop {
            let dir = self.dir.clone();
            let options = self.entry_options;
            let create_key = key.clone();
            let created = run_blocking(
                tokio::task::spawn_blocking(move || {
                    SyncEntry::create(options, &dir, &create_key, hash)
                })
                .await,
            );
            match created {
                Ok((sync, stat)) => return Ok(self.register(hash, sync, stat, Vec::new())),
                Err(CacheError::AlreadyExists) if !collision_doomed => {
                    if self.resolve_create_conflict(hash, &key).await? {
                        return Err(CacheError::AlreadyExists);
                    }
                    collision_doomed = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Files exist where a create wants to go. Returns true when they
    /// belong to this very key (a genuine conflict); otherwise the
    /// squatting files are doomed and the create may retry.
    async fn resolve_create_conflict(self: &Arc<Self>, hash: EntryHash, key: &str) -> Result<bool> {
        let dir = self.dir.clone();
        let options = self.entry_options;
        let opened = run_blocking(
            tokio::task::spawn_blocking(move || SyncEntry::open(options, &dir, hash, None, false))
                .await,
        );
        match opened {
            Ok((sync, _, _)) => {
                if sync.key() == key {
                    return Ok(true);
                }
                tracing::debug!(%hash, "hash collision on create, dooming occupant");
                drop(sync);
                self.do_doom(hash).await?;
                Ok(false)
            }
            // Unreadable or vanished either way the open already cleaned up.
            Err(_) => Ok(false),
        }
    }

    async fn do_doom(self: &Arc<Self>, hash: EntryHash) -> Result<()> {
        if let Some(shared) = self.state.lock().active.remove(&hash) {
            shared.doomed.store(true, Ordering::Relaxed);
        }
        self.index.remove(hash);
        let dir = self.dir.clone();
        run_blocking(tokio::task::spawn_blocking(move || SyncEntry::doom(&dir, hash)).await)
    }

    async fn do_close(self: &Arc<Self>, hash: EntryHash, shared: Arc<EntryShared>) {
        {
            let mut state = self.state.lock();
            if shared.users.load(Ordering::Relaxed) != 0 {
                // Revived by an open while this close waited its turn.
                return;
            }
            if let Some(current) = state.active.get(&hash) {
                if Arc::ptr_eq(current, &shared) {
                    state.active.remove(&hash);
                }
            }
        }
        // Doomed and failed entries have nothing worth writing back.
        let Some((sync, stream0)) = shared.take_for_close().await else {
            return;
        };
        let closed =
            run_blocking(tokio::task::spawn_blocking(move || sync.close(&stream0)).await);
        match closed {
            Ok(stat) => self.index.update_entry_size(hash, stat.disk_size),
            Err(e) => {
                tracing::warn!(%hash, "entry close failed: {e}");
                self.index.remove(hash);
            }
        }
    }

    /// Hand out another handle to an already-active entry. `None` when the
    /// hash has no active entry.
    fn share_active(&self, hash: EntryHash, key: Option<&str>) -> Option<Result<Entry>> {
        let state = self.state.lock();
        let shared = state.active.get(&hash)?;
        if let Some(requested) = key {
            if shared.key != requested {
                return Some(Err(CacheError::NotFound));
            }
        }
        shared.users.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            shared: Arc::clone(shared),
        };
        drop(state);
        self.index.use_if_exists(hash);
        Some(Ok(entry))
    }

    /// Wrap a freshly opened or created file layer in a shared handle and
    /// make it the hash's active entry
    fn register(
        self: &Arc<Self>,
        hash: EntryHash,
        sync: SyncEntry,
        stat: crate::sync_entry::EntryStat,
        stream0: Vec<u8>,
    ) -> Entry {
        let shared = Arc::new(EntryShared {
            hash,
            key: sync.key().to_string(),
            backend: Arc::downgrade(self),
            users: AtomicUsize::new(1),
            doomed: AtomicBool::new(false),
            state: Arc::new(tokio::sync::Mutex::new(EntryState {
                sync: Some(sync),
                stream0,
                dead: false,
            })),
        });
        self.index.insert(
            hash,
            EntryMetadata {
                last_used: Some(stat.last_used),
                size: stat.disk_size,
            },
        );
        self.state.lock().active.insert(hash, Arc::clone(&shared));
        Entry { shared }
    }

    /// A handle was dropped. When it was the last one, queue the entry's
    /// write-back behind whatever else the hash has going on. The entry
    /// stays in the active map until the close op runs, so an open arriving
    /// in between revives it instead of reading half-written files.
    pub(crate) fn release_handle(self: &Arc<Self>, shared: &Arc<EntryShared>) {
        let hash = shared.hash;
        let run_now = {
            let mut state = self.state.lock();
            if shared.users.fetch_sub(1, Ordering::Relaxed) != 1 {
                return;
            }
            let op = DeferredOp::Close {
                shared: Arc::clone(shared),
            };
            self.claim_or_queue(&mut state, hash, op)
        };
        if let Some(op) = run_now {
            self.run_op(hash, op);
        }
    }

    /// A fatal entry failure: the file layer already doomed the files, so
    /// drop the entry from the active map and the index
    pub(crate) fn discard_failed(&self, hash: EntryHash, shared_ptr: *const EntryShared) {
        let mut state = self.state.lock();
        if let Some(current) = state.active.get(&hash) {
            if Arc::as_ptr(current) == shared_ptr {
                state.active.remove(&hash);
            }
        }
        drop(state);
        self.index.remove(hash);
    }
}

impl Drop for BackendShared {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn run_blocking<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("blocking cache op panicked: {e}");
            Err(CacheError::ShutDown)
        }
    }
}

fn spawn_index_load(shared: &Arc<BackendShared>) -> JoinHandle<()> {
    let weak = Arc::downgrade(shared);
    let dir = shared.dir.clone();
    tokio::spawn(async move {
        let loaded = tokio::task::spawn_blocking(move || persistence::load(&dir)).await;
        let Some(shared) = weak.upgrade() else { return };
        match loaded {
            Ok(LoadedIndex { records, rebuilt }) => {
                if rebuilt {
                    tracing::info!(entries = records.len(), "index ready after rescan");
                }
                shared.index.merge_loaded(records);
            }
            Err(e) => {
                // Run with an empty index; entries still open from disk.
                tracing::error!("index load panicked: {e}");
                shared.index.merge_loaded(Vec::new());
            }
        }
    })
}

fn spawn_eviction_listener(
    shared: &Arc<BackendShared>,
    mut evict_rx: mpsc::UnboundedReceiver<Vec<EntryHash>>,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        while let Some(victims) = evict_rx.recv().await {
            let Some(shared) = weak.upgrade() else { break };
            // Active victims are doomed through the op queue like any
            // other; their live handles keep working on the unlinked
            // files until dropped.
            if let Err(e) = shared.doom_many(victims).await {
                tracing::warn!("eviction deletion failed: {e}");
            }
            shared.index.eviction_finished();
        }
    })
}

fn spawn_periodic_flush(
    shared: &Arc<BackendShared>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else { break };
            if !shared.index.is_loaded() || !shared.index.take_dirty() {
                continue;
            }
            let (records, total) = shared.index.snapshot();
            let dir = shared.dir.clone();
            let saved =
                tokio::task::spawn_blocking(move || persistence::save(&dir, &records)).await;
            match saved {
                Ok(Ok(())) => tracing::trace!(total, "periodic index flush"),
                Ok(Err(e)) => tracing::warn!("periodic index flush failed: {e}"),
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::format;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> CacheConfig {
        let mut config = CacheConfig::new(dir.path());
        config.max_size = Some(10 << 20);
        config.flush_interval = Duration::ZERO;
        config
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for background work");
    }

    #[tokio::test]
    async fn create_collision_dooms_occupant() {
        let dir = TempDir::new().unwrap();
        let cache = FlatCache::new(config(&dir)).await.unwrap();
        cache.index_ready().await;
        let hash = EntryHash(0x1234);

        let first = cache.create_with_hash("occupant", hash).await.unwrap();
        first.write_stream(0, 0, b"occupant data", false).await.unwrap();
        drop(first);

        // Same hash, different key: the occupant is doomed and replaced.
        let second = cache.create_with_hash("newcomer", hash).await.unwrap();
        assert_eq!(second.key(), "newcomer");
        drop(second);

        let err = cache.open_with_hash("occupant", hash).await.unwrap_err();
        assert!(err.is_not_found());
        let reopened = cache.open_with_hash("newcomer", hash).await.unwrap();
        assert_eq!(reopened.key(), "newcomer");
    }

    #[tokio::test]
    async fn open_collision_is_a_miss_and_keeps_occupant() {
        let dir = TempDir::new().unwrap();
        let cache = FlatCache::new(config(&dir)).await.unwrap();
        cache.index_ready().await;
        let hash = EntryHash(0x5678);

        let occupant = cache.create_with_hash("occupant", hash).await.unwrap();
        drop(occupant);

        let err = cache.open_with_hash("other-key", hash).await.unwrap_err();
        assert!(err.is_not_found());
        // The occupant survives a colliding open.
        assert!(cache.open_with_hash("occupant", hash).await.is_ok());
    }

    #[tokio::test]
    async fn colliding_open_against_active_entry_misses() {
        let dir = TempDir::new().unwrap();
        let cache = FlatCache::new(config(&dir)).await.unwrap();
        cache.index_ready().await;
        let hash = EntryHash(0x9abc);

        let _held = cache.create_with_hash("occupant", hash).await.unwrap();
        let err = cache.open_with_hash("other-key", hash).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn create_collision_against_active_entry_replaces_it() {
        let dir = TempDir::new().unwrap();
        let cache = FlatCache::new(config(&dir)).await.unwrap();
        cache.index_ready().await;
        let hash = EntryHash(0xdef0);

        let held = cache.create_with_hash("occupant", hash).await.unwrap();
        held.write_stream(1, 0, b"still usable", false).await.unwrap();

        let replacement = cache.create_with_hash("newcomer", hash).await.unwrap();
        assert_eq!(replacement.key(), "newcomer");

        // The doomed handle still reads and writes its unlinked files.
        assert_eq!(
            held.read_stream(1, 0, 100).await.unwrap(),
            b"still usable"
        );
        held.write_stream(1, 12, b"!", false).await.unwrap();
    }

    #[tokio::test]
    async fn open_same_key_shares_the_active_entry() {
        let dir = TempDir::new().unwrap();
        let cache = FlatCache::new(config(&dir)).await.unwrap();
        cache.index_ready().await;

        let a = cache.create_entry("shared").await.unwrap();
        a.write_stream(0, 0, b"visible", false).await.unwrap();
        let b = cache.open_entry("shared").await.unwrap();
        // No close happened yet; b sees a's unflushed stream 0.
        assert_eq!(b.read_stream(0, 0, 100).await.unwrap(), b"visible");
        drop(a);
        assert_eq!(b.read_stream(0, 0, 100).await.unwrap(), b"visible");
    }

    #[tokio::test]
    async fn second_create_for_same_key_fails() {
        let dir = TempDir::new().unwrap();
        let cache = FlatCache::new(config(&dir)).await.unwrap();
        cache.index_ready().await;

        let _held = cache.create_entry("dup").await.unwrap();
        let err = cache.create_entry("dup").await.unwrap_err();
        assert!(matches!(err, CacheError::AlreadyExists));
    }

    #[tokio::test]
    async fn cancelled_operation_keeps_the_entry_usable() {
        let dir = TempDir::new().unwrap();
        let cache = FlatCache::new(config(&dir)).await.unwrap();
        cache.index_ready().await;

        let entry = cache.create_entry("cancel-me").await.unwrap();
        entry.write_stream(1, 0, b"hello", false).await.unwrap();
        {
            // Start a read, then drop it mid-flight, as a timeout would.
            let mut dropped = Box::pin(entry.read_stream(1, 0, 5));
            let _ = futures::poll!(dropped.as_mut());
        }
        assert_eq!(entry.read_stream(1, 0, 5).await.unwrap(), b"hello");
        assert_eq!(entry.stream_size(1).await.unwrap(), 5);

        // The write-back still happens on close.
        drop(entry);
        let reopened = cache.open_entry("cancel-me").await.unwrap();
        assert_eq!(reopened.read_stream(1, 0, 5).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn loaded_index_short_circuits_misses_without_touching_files() {
        let dir = TempDir::new().unwrap();
        let cache = FlatCache::new(config(&dir)).await.unwrap();
        cache.index_ready().await;

        // A valid entry the index has never heard of.
        let hash = entry_hash("ghost");
        let options = EntryOptions {
            omit_empty_stream2: true,
            sparse_budget: 1 << 20,
        };
        let (ghost, _) = SyncEntry::create(options, dir.path(), "ghost", hash).unwrap();
        ghost.close(b"").unwrap();

        let err = cache.open_entry("ghost").await.unwrap_err();
        assert!(err.is_not_found());
        // The miss was answered from the index; the file was never probed.
        assert!(dir.path().join(format::stream_file_name(hash, 0)).exists());
    }

    #[tokio::test]
    async fn doom_all_bulk_deletes_entries_from_a_prior_run() {
        let dir = TempDir::new().unwrap();
        let expected: u64 = ["one", "two"]
            .iter()
            .map(|k| format::combined_file_size(k.len() as u64, 4, 7))
            .sum();
        {
            let cache = FlatCache::new(config(&dir)).await.unwrap();
            cache.index_ready().await;
            for key in ["one", "two"] {
                let entry = cache.create_entry(key).await.unwrap();
                entry.write_stream(0, 0, b"meta", false).await.unwrap();
                entry.write_stream(1, 0, b"payload", false).await.unwrap();
                drop(entry);
            }
            wait_until(|| cache.total_size() == expected).await;
            cache.flush_index().await.unwrap();
        }

        let cache = FlatCache::new(config(&dir)).await.unwrap();
        cache.index_ready().await;
        assert_eq!(cache.entry_count(), 2);
        // Nothing is active or mid-operation, so the whole batch takes the
        // bulk deletion path.
        cache.doom_all().await.unwrap();
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.total_size(), 0);
        for key in ["one", "two"] {
            let hash = entry_hash(key);
            assert!(!dir.path().join(format::stream_file_name(hash, 0)).exists());
            assert!(cache.open_entry(key).await.unwrap_err().is_not_found());
        }
    }
}
