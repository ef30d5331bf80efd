//! Async entry handle
//!
//! [`Entry`] is the user-facing handle to one cache entry. Stream 0 lives in
//! memory and is answered inline; everything else forwards to the blocking
//! [`SyncEntry`] on the background pool. An entry's operations run one at a
//! time: the file layer is moved out under the entry's mutex, and a detached
//! task holds the mutex across the blocking call and puts the file layer
//! back afterwards. The hand-back does not depend on the caller staying
//! around, so a dropped (timed-out, cancelled) operation future never
//! strands the entry.
//!
//! Handles are reference counted by the backend. Opening an already-active
//! entry shares the same underlying state; the files are written back and
//! closed when the last handle drops.

use crate::backend::BackendShared;
use crate::errors::{CacheError, Result};
use crate::format;
use crate::hashing::EntryHash;
use crate::sync_entry::SyncEntry;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Mutex};

pub(crate) struct EntryState {
    /// Taken out for the duration of each blocking call; `None` also after
    /// a fatal failure
    pub(crate) sync: Option<SyncEntry>,
    /// Stream 0, kept in memory for its whole open lifetime
    pub(crate) stream0: Vec<u8>,
    /// A failed entry answers every operation with `NotFound`
    pub(crate) dead: bool,
}

pub(crate) struct EntryShared {
    pub(crate) hash: EntryHash,
    pub(crate) key: String,
    pub(crate) backend: Weak<BackendShared>,
    /// Live handle count; mutated only under the backend's state lock
    pub(crate) users: AtomicUsize,
    /// Set when the entry is doomed while open; skips the write-back at
    /// close
    pub(crate) doomed: AtomicBool,
    /// `Arc` so in-flight blocking ops can keep the lock past the lifetime
    /// of the future that started them
    pub(crate) state: Arc<Mutex<EntryState>>,
}

/// Handle to one open cache entry
///
/// Streams are addressed 0 to 2. Stream 0 is small in-memory metadata,
/// streams 1 and 2 are on disk, and the sparse operations address an
/// independent byte space. Dropping the last handle writes the entry back
/// asynchronously.
pub struct Entry {
    pub(crate) shared: Arc<EntryShared>,
}

impl Entry {
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn hash(&self) -> EntryHash {
        self.shared.hash
    }

    /// Current size of one stream
    pub async fn stream_size(&self, stream: usize) -> Result<u64> {
        check_stream(stream)?;
        let state = self.shared.state.lock().await;
        if state.dead {
            return Err(CacheError::NotFound);
        }
        if stream == 0 {
            return Ok(state.stream0.len() as u64);
        }
        match &state.sync {
            Some(sync) => Ok(sync.stream_size(stream)),
            None => Err(CacheError::NotFound),
        }
    }

    /// Read up to `len` bytes from a stream at `offset`. A read at or past
    /// the end of the stream returns an empty buffer, a read crossing the
    /// end returns the bytes up to it.
    pub async fn read_stream(&self, stream: usize, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_stream(stream)?;
        if stream == 0 {
            let state = self.shared.state.lock().await;
            if state.dead {
                return Err(CacheError::NotFound);
            }
            let buf = &state.stream0;
            let start = (offset as usize).min(buf.len());
            let end = start.saturating_add(len).min(buf.len());
            return Ok(buf[start..end].to_vec());
        }
        self.with_sync(move |sync| sync.read_stream(stream, offset, len))
            .await
    }

    /// Write `data` to a stream at `offset`. Writing past the current end
    /// zero-fills the gap; `truncate` makes `offset + data.len()` the new
    /// stream size even when that shrinks it.
    pub async fn write_stream(
        &self,
        stream: usize,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> Result<()> {
        check_stream(stream)?;
        if offset.saturating_add(data.len() as u64) > format::MAX_STREAM_SIZE {
            return Err(CacheError::Config {
                message: format!("write at {offset} exceeds the maximum stream size"),
            });
        }
        if stream == 0 {
            let mut state = self.shared.state.lock().await;
            if state.dead {
                return Err(CacheError::NotFound);
            }
            write_buffer(&mut state.stream0, offset as usize, data, truncate);
            return Ok(());
        }
        let data = data.to_vec();
        self.with_sync(move |sync| sync.write_stream(stream, offset, &data, truncate))
            .await
    }

    /// Read from the sparse byte space. Returns data only up to the first
    /// gap at or after `offset`; a gap at `offset` itself reads empty.
    pub async fn read_sparse(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.with_sync(move |sync| sync.read_sparse(offset, len)).await
    }

    /// Write into the sparse byte space at an arbitrary offset
    pub async fn write_sparse(&self, offset: u64, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.with_sync(move |sync| sync.write_sparse(offset, &data))
            .await
    }

    /// First contiguous stored span intersecting `[offset, offset + len)`,
    /// as `(start, length)`; length 0 when nothing is stored there
    pub async fn available_range(&self, offset: u64, len: u64) -> Result<(u64, u64)> {
        self.with_sync(move |sync| Ok(sync.available_range(offset, len)))
            .await
    }

    /// Delete this entry. Existing handles keep operating on the doomed
    /// files; the key becomes immediately available for a fresh create.
    pub async fn doom(&self) -> Result<()> {
        let backend = self.shared.backend.upgrade().ok_or(CacheError::ShutDown)?;
        backend.doom_hash(self.shared.hash).await
    }

    /// Run `f` against the file layer on the blocking pool, holding this
    /// entry's op lock throughout. The op lock and the file layer travel
    /// with a detached task, which restores them once the blocking call
    /// finishes; dropping the returned future mid-operation therefore
    /// cannot lose the file layer. Any error from the file layer is fatal:
    /// the files are already doomed, so the entry is marked dead and
    /// withdrawn from the index.
    async fn with_sync<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SyncEntry) -> Result<T> + Send + 'static,
    {
        let mut state = Arc::clone(&self.shared.state).lock_owned().await;
        if state.dead {
            return Err(CacheError::NotFound);
        }
        let mut sync = match state.sync.take() {
            Some(sync) => sync,
            None => return Err(CacheError::NotFound),
        };
        let shared = Arc::clone(&self.shared);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let joined = tokio::task::spawn_blocking(move || {
                let out = f(&mut sync);
                (sync, out)
            })
            .await;
            match joined {
                Ok((sync, out)) => {
                    if out.is_err() {
                        shared.mark_dead(&mut state);
                    } else {
                        state.sync = Some(sync);
                    }
                    let _ = tx.send(out);
                }
                Err(e) => {
                    tracing::error!(hash = %shared.hash, "blocking entry op panicked: {e}");
                    shared.mark_dead(&mut state);
                    let _ = tx.send(Err(CacheError::ShutDown));
                }
            }
        });
        rx.await.map_err(|_| CacheError::ShutDown)?
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(backend) = self.shared.backend.upgrade() {
            backend.release_handle(&self.shared);
        }
        // With the backend gone the file handles close when the Arc dies;
        // nothing is left to write back to.
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.shared.key)
            .field("hash", &self.shared.hash)
            .finish()
    }
}

impl EntryShared {
    /// Detach the file layer and stream-0 buffer for the close op, unless
    /// the entry is dead or doomed (then there is nothing worth writing
    /// back). Must only be called once no handles remain; waits out any
    /// blocking op a cancelled caller left running.
    pub(crate) async fn take_for_close(&self) -> Option<(SyncEntry, Vec<u8>)> {
        if self.doomed.load(std::sync::atomic::Ordering::Relaxed) {
            return None;
        }
        let mut state = self.state.lock().await;
        if state.dead {
            return None;
        }
        let sync = state.sync.take()?;
        let stream0 = std::mem::take(&mut state.stream0);
        Some((sync, stream0))
    }

    fn mark_dead(self: &Arc<Self>, state: &mut EntryState) {
        state.dead = true;
        state.sync = None;
        if let Some(backend) = self.backend.upgrade() {
            backend.discard_failed(self.hash, Arc::as_ptr(self));
        }
    }
}

fn check_stream(stream: usize) -> Result<()> {
    if stream > 2 {
        return Err(CacheError::Config {
            message: format!("stream index {stream} out of range"),
        });
    }
    Ok(())
}

/// In-memory equivalent of the on-disk stream write semantics
fn write_buffer(buf: &mut Vec<u8>, offset: usize, data: &[u8], truncate: bool) {
    if offset > buf.len() {
        buf.resize(offset, 0);
    }
    let end = offset + data.len();
    if end <= buf.len() {
        buf[offset..end].copy_from_slice(data);
    } else {
        buf.truncate(offset);
        buf.extend_from_slice(data);
    }
    if truncate {
        buf.truncate(end);
    }
}

#[cfg(test)]
mod tests {
    use super::write_buffer;

    #[test]
    fn buffer_write_overwrites_in_place() {
        let mut buf = b"hello world".to_vec();
        write_buffer(&mut buf, 6, b"there", false);
        assert_eq!(buf, b"hello there");
    }

    #[test]
    fn buffer_write_zero_fills_gap() {
        let mut buf = b"ab".to_vec();
        write_buffer(&mut buf, 5, b"cd", false);
        assert_eq!(buf, b"ab\0\0\0cd");
    }

    #[test]
    fn buffer_write_truncates() {
        let mut buf = vec![9u8; 100];
        write_buffer(&mut buf, 0, b"tiny", true);
        assert_eq!(buf, b"tiny");
        // Truncate at an offset keeps the prefix.
        write_buffer(&mut buf, 2, b"", true);
        assert_eq!(buf, b"ti");
    }

    #[test]
    fn buffer_write_extends_past_end() {
        let mut buf = b"0123456789".to_vec();
        write_buffer(&mut buf, 8, b"abcd", false);
        assert_eq!(buf, b"01234567abcd");
    }
}
