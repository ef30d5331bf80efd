//! Blocking file operations for one cache entry
//!
//! `SyncEntry` owns the file handles: the combined file (streams 0 and 1),
//! the optional stream-2 file, and the lazily created sparse side file. Every
//! method here blocks and must run on the background pool, never on the
//! runtime's async workers; the async proxy in `entry.rs` moves the value
//! into `spawn_blocking` for the duration of each call.
//!
//! Failure semantics: any unexpected I/O error or validation failure marks
//! the instance failed and dooms the entry's files. The caller treats the
//! returned error as fatal for this entry, not retryable.

use crate::errors::{CacheError, FormatViolation, Result};
use crate::format::{self, EntryEof, EntryHeader};
use crate::hashing::{entry_hash, EntryHash};
use crate::sparse::SparseFile;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Zeroing writes for gap pre-fill go out in chunks of this size
const ZERO_CHUNK: usize = 64 * 1024;

/// Per-entry policy knobs resolved from the cache configuration
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryOptions {
    /// Do not materialize the stream-2 file while stream 2 is empty
    pub omit_empty_stream2: bool,
    /// Sparse payload budget; exceeding it before an append drops all ranges
    pub sparse_budget: u64,
}

/// Sizes and usage time for one entry, as measured by the file layer
#[derive(Debug, Clone, Copy)]
pub struct EntryStat {
    pub last_used: SystemTime,
    pub stream_sizes: [u64; 3],
    /// Total on-disk footprint including headers, EOF records and the sparse
    /// side file
    pub disk_size: u64,
}

/// Incremental CRC tracking for one directly-written stream (1 or 2)
///
/// `crc` covers the prefix `[0, covered)`. Sequential appends extend it; a
/// rewrite from offset 0 restarts it; anything else leaves the stream
/// unverifiable and its next EOF record is written without a CRC.
#[derive(Debug, Clone, Copy)]
struct StreamCrc {
    crc: u32,
    covered: u64,
    valid: bool,
    /// CRC promised by the EOF record read at open; consumed by the first
    /// full-stream read
    expected_full: Option<u32>,
    validated: bool,
}

impl StreamCrc {
    fn fresh() -> Self {
        Self {
            crc: 0,
            covered: 0,
            valid: true,
            expected_full: None,
            validated: false,
        }
    }

    fn from_open(eof_crc: Option<u32>, stream_size: u64) -> Self {
        Self {
            crc: eof_crc.unwrap_or(0),
            covered: stream_size,
            valid: eof_crc.is_some(),
            expected_full: eof_crc,
            validated: false,
        }
    }

    fn on_write(&mut self, offset: u64, data: &[u8]) {
        self.expected_full = None;
        if self.valid && offset == self.covered {
            self.crc = crc32c::crc32c_append(self.crc, data);
            self.covered += data.len() as u64;
        } else if offset == 0 {
            self.crc = crc32c::crc32c(data);
            self.covered = data.len() as u64;
            self.valid = true;
        } else {
            self.valid = false;
        }
    }

    /// CRC to record in the EOF, if the whole final stream was observed
    fn final_crc(&self, stream_size: u64) -> Option<u32> {
        (self.valid && self.covered == stream_size).then_some(self.crc)
    }
}

/// The blocking half of one cache entry
#[derive(Debug)]
pub(crate) struct SyncEntry {
    dir: PathBuf,
    key: String,
    hash: EntryHash,
    /// Combined file holding streams 0 and 1
    file0: File,
    /// Stream-2 file; absent while the stream is empty and omitted
    file1: Option<File>,
    /// Stream sizes; `sizes[0]` mirrors the proxy's in-memory buffer and is
    /// only authoritative at open and close
    sizes: [u64; 3],
    /// CRC state for streams 1 and 2
    crc: [StreamCrc; 2],
    sparse: Option<SparseFile>,
    options: EntryOptions,
    failed: bool,
}

impl SyncEntry {
    /// Open an existing entry's files and fully validate them. Stream 0 is
    /// read into memory and CRC-checked here; streams 1 and 2 validate
    /// lazily on their first full read. Any validation failure dooms the
    /// entry's files.
    ///
    /// With `expected_key` the caller promises to compare the stored key
    /// itself; without it the stored key must hash to the file's own name.
    /// `had_index_hint` is diagnostic only.
    pub fn open(
        options: EntryOptions,
        dir: &Path,
        hash: EntryHash,
        expected_key: Option<&str>,
        had_index_hint: bool,
    ) -> Result<(SyncEntry, EntryStat, Vec<u8>)> {
        match Self::open_impl(options, dir, hash, expected_key) {
            Ok(out) => Ok(out),
            Err(e) => {
                if !e.is_not_found() {
                    tracing::warn!(%hash, had_index_hint, "entry unreadable, dooming: {e}");
                }
                let _ = Self::doom(dir, hash);
                Err(e)
            }
        }
    }

    fn open_impl(
        options: EntryOptions,
        dir: &Path,
        hash: EntryHash,
        expected_key: Option<&str>,
    ) -> Result<(SyncEntry, EntryStat, Vec<u8>)> {
        let path0 = dir.join(format::stream_file_name(hash, 0));
        let file0 = match OpenOptions::new().read(true).write(true).open(&path0) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(CacheError::NotFound),
            Err(e) => return Err(CacheError::io(&path0, "open entry file", e)),
        };
        let len0 = match file0.metadata() {
            Ok(m) => m.len(),
            Err(e) => return Err(CacheError::io(&path0, "stat entry file", e)),
        };

        let (header, key) = read_preamble(&file0, &path0, len0, hash)?;
        if expected_key.is_none() && entry_hash(&key) != hash {
            // The file claims a key that does not hash to its own filename.
            return Err(CacheError::corrupt(hash, FormatViolation::KeyMismatch));
        }
        let key_len = u64::from(header.key_length);

        let eof0 = read_eof(&file0, &path0, len0 - EntryEof::SIZE as u64, hash)?;
        let s0 = u64::from(eof0.stream_size);
        let s1 = match format::split_combined_file(len0, key_len, s0) {
            Ok(s1) => s1,
            Err(v) => return Err(CacheError::corrupt(hash, v)),
        };
        let eof1 = read_eof(&file0, &path0, format::stream1_eof_offset(key_len, s1), hash)?;

        let mut stream0 = vec![0u8; s0 as usize];
        let stream0_pos = format::stream0_data_offset(key_len, s1);
        if let Err(e) = file0.read_exact_at(&mut stream0, stream0_pos) {
            return Err(read_failure(hash, &path0, e));
        }
        if let Some(expected) = eof0.crc() {
            if crc32c::crc32c(&stream0) != expected {
                return Err(CacheError::corrupt(hash, FormatViolation::CrcMismatch));
            }
        }

        // Stream-2 file is optional; absent reads as an empty stream.
        let path1 = dir.join(format::stream_file_name(hash, 1));
        let (file1, s2, crc2) = match OpenOptions::new().read(true).write(true).open(&path1) {
            Ok(f) => {
                let len1 = match f.metadata() {
                    Ok(m) => m.len(),
                    Err(e) => return Err(CacheError::io(&path1, "stat entry file", e)),
                };
                let (header1, key1) = read_preamble(&f, &path1, len1, hash)?;
                if key1 != key || header1.key_length != header.key_length {
                    return Err(CacheError::corrupt(hash, FormatViolation::KeyMismatch));
                }
                let s2 = len1
                    .checked_sub(format::stream2_data_offset(key_len) + EntryEof::SIZE as u64)
                    .ok_or_else(|| CacheError::corrupt(hash, FormatViolation::TruncatedRead))?;
                let eof2 = read_eof(&f, &path1, len1 - EntryEof::SIZE as u64, hash)?;
                (Some(f), s2, StreamCrc::from_open(eof2.crc(), s2))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => (None, 0, StreamCrc::fresh()),
            Err(e) => return Err(CacheError::io(&path1, "open entry file", e)),
        };

        let sparse_path = dir.join(format::sparse_file_name(hash));
        let sparse = if sparse_path.exists() {
            Some(SparseFile::open(sparse_path, &key, hash)?)
        } else {
            None
        };

        let entry = SyncEntry {
            dir: dir.to_path_buf(),
            key,
            hash,
            file0,
            file1,
            sizes: [s0, s1, s2],
            crc: [StreamCrc::from_open(eof1.crc(), s1), crc2],
            sparse,
            options,
            failed: false,
        };
        let stat = entry.stat(s0);
        Ok((entry, stat, stream0))
    }

    /// Create a brand-new entry. Fails with `AlreadyExists` if any of the
    /// entry's files are present; overwriting requires an explicit prior
    /// doom.
    pub fn create(
        options: EntryOptions,
        dir: &Path,
        key: &str,
        hash: EntryHash,
    ) -> Result<(SyncEntry, EntryStat)> {
        if key.len() > format::MAX_KEY_LENGTH as usize {
            return Err(CacheError::Config {
                message: format!("key length {} exceeds maximum", key.len()),
            });
        }
        let sparse_path = dir.join(format::sparse_file_name(hash));
        let path1 = dir.join(format::stream_file_name(hash, 1));
        if sparse_path.exists() || path1.exists() {
            return Err(CacheError::AlreadyExists);
        }

        let path0 = dir.join(format::stream_file_name(hash, 0));
        let file0 = match create_with_preamble(&path0, key) {
            Ok(f) => f,
            Err(CacheError::AlreadyExists) => return Err(CacheError::AlreadyExists),
            Err(e) => {
                let _ = Self::doom(dir, hash);
                return Err(e);
            }
        };
        let file1 = if options.omit_empty_stream2 {
            None
        } else {
            match create_with_preamble(&path1, key) {
                Ok(f) => Some(f),
                Err(e) => {
                    let _ = Self::doom(dir, hash);
                    return Err(e);
                }
            }
        };

        let entry = SyncEntry {
            dir: dir.to_path_buf(),
            key: key.to_string(),
            hash,
            file0,
            file1,
            sizes: [0; 3],
            crc: [StreamCrc::fresh(); 2],
            sparse: None,
            options,
            failed: false,
        };
        let stat = entry.stat(0);
        Ok((entry, stat))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn stream_size(&self, stream: usize) -> u64 {
        self.sizes[stream]
    }

    /// Current sizes and disk footprint. `stream0_len` is supplied by the
    /// proxy, which owns stream 0's buffer.
    pub fn stat(&self, stream0_len: u64) -> EntryStat {
        let key_len = self.key.len() as u64;
        let mut disk_size = format::combined_file_size(key_len, stream0_len, self.sizes[1]);
        if self.file1.is_some() {
            disk_size += format::stream2_file_size(key_len, self.sizes[2]);
        }
        if let Some(sparse) = &self.sparse {
            disk_size += sparse.file_len();
        }
        EntryStat {
            last_used: SystemTime::now(),
            stream_sizes: [stream0_len, self.sizes[1], self.sizes[2]],
            disk_size,
        }
    }

    /// Read from stream 1 or 2. Returns fewer bytes than requested at EOF;
    /// an absent stream-2 file reads as empty. The first read covering the
    /// whole stream after open re-validates its recorded CRC.
    pub fn read_stream(&mut self, stream: usize, offset: u64, len: usize) -> Result<Vec<u8>> {
        debug_assert!(stream == 1 || stream == 2);
        if self.failed {
            return Err(CacheError::NotFound);
        }
        let size = self.sizes[stream];
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let n = ((size - offset) as usize).min(len);
        let mut out = vec![0u8; n];
        let pos = self.stream_data_offset(stream) + offset;
        let read = match (stream, &self.file1) {
            (2, None) => return Ok(Vec::new()),
            (2, Some(file1)) => file1.read_exact_at(&mut out, pos),
            _ => self.file0.read_exact_at(&mut out, pos),
        };
        if let Err(e) = read {
            let err = read_failure(self.hash, &self.stream_path(stream), e);
            self.fail();
            return Err(err);
        }

        let crc = &mut self.crc[stream - 1];
        if offset == 0 && n as u64 == size && !crc.validated {
            if let Some(expected) = crc.expected_full {
                if crc32c::crc32c(&out) != expected {
                    self.fail();
                    return Err(CacheError::corrupt(self.hash, FormatViolation::CrcMismatch));
                }
                crc.validated = true;
            }
        }
        Ok(out)
    }

    /// Write to stream 1 or 2. A write extending past the current size
    /// pre-zeroes the gap so a partial failure cannot expose uninitialized
    /// disk content; `truncate` forces the post-write size to exactly
    /// `offset + data.len()`.
    pub fn write_stream(
        &mut self,
        stream: usize,
        offset: u64,
        data: &[u8],
        truncate: bool,
    ) -> Result<()> {
        debug_assert!(stream == 1 || stream == 2);
        if self.failed {
            return Err(CacheError::NotFound);
        }
        let old_size = self.sizes[stream];
        let new_size = match offset.checked_add(data.len() as u64) {
            Some(end) if end <= format::MAX_STREAM_SIZE => {
                if truncate {
                    end
                } else {
                    old_size.max(end)
                }
            }
            // A caller error, not a failure of the entry itself.
            _ => {
                return Err(CacheError::Config {
                    message: format!("stream {stream} would exceed the maximum stream size"),
                })
            }
        };
        if stream == 2 && self.file1.is_none() {
            if new_size == 0 {
                return Ok(()); // stays omitted
            }
            let path1 = self.dir.join(format::stream_file_name(self.hash, 1));
            match create_with_preamble(&path1, &self.key) {
                Ok(f) => self.file1 = Some(f),
                Err(e) => {
                    self.fail();
                    return Err(e);
                }
            }
        }

        let data_start = self.stream_data_offset(stream);
        let path = self.stream_path(stream);
        let result = (|| {
            let file = match (stream, &self.file1) {
                (2, Some(file1)) => file1,
                (2, None) => return Err(CacheError::NotFound),
                _ => &self.file0,
            };
            if offset > old_size {
                zero_fill(file, &path, data_start + old_size, offset - old_size)?;
            }
            file.write_all_at(data, data_start + offset)
                .map_err(|e| CacheError::io(&path, "write stream", e))?;
            // Stream 2 lives alone in its file; shrink it eagerly. The
            // combined file's tail is rewritten wholesale at close.
            if stream == 2 && new_size < old_size {
                file.set_len(data_start + new_size)
                    .map_err(|e| CacheError::io(&path, "truncate stream", e))?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            self.fail();
            return Err(e);
        }

        self.sizes[stream] = new_size;
        self.crc[stream - 1].on_write(offset, data);
        Ok(())
    }

    /// Read from the sparse store; gaps truncate, missing store reads empty
    pub fn read_sparse(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if self.failed {
            return Err(CacheError::NotFound);
        }
        let sparse = match &mut self.sparse {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        match sparse.read(offset, len) {
            Ok(out) => Ok(out),
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Write to the sparse store, creating the side file on first use. If
    /// the write would push sparse payload past the budget, all existing
    /// ranges are dropped first.
    pub fn write_sparse(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.failed {
            return Err(CacheError::NotFound);
        }
        // Out-of-range offsets are a caller error; reject them before the
        // fatal-failure path below.
        if offset
            .checked_add(data.len() as u64)
            .is_none_or(|end| end > i64::MAX as u64)
        {
            return Err(CacheError::Config {
                message: format!("sparse write at {offset} exceeds the addressable range"),
            });
        }
        let budget = self.options.sparse_budget;
        let hash = self.hash;
        let result = (|| {
            if self.sparse.is_none() {
                let path = self.dir.join(format::sparse_file_name(hash));
                self.sparse = Some(SparseFile::create(path, &self.key, hash)?);
            }
            let sparse = self.sparse.as_mut().ok_or(CacheError::NotFound)?;
            if sparse.payload_len() + data.len() as u64 > budget {
                tracing::debug!(%hash, "sparse budget exceeded, dropping all ranges");
                sparse.truncate_all()?;
            }
            sparse.write(offset, data)
        })();
        if let Err(e) = result {
            self.fail();
            return Err(e);
        }
        Ok(())
    }

    /// First contiguous covered sub-span of the sparse store intersecting
    /// the window
    pub fn available_range(&self, offset: u64, len: u64) -> (u64, u64) {
        match &self.sparse {
            Some(s) => s.available_range(offset, len),
            None => (offset, 0),
        }
    }

    /// Flush stream 0 and the EOF records, then release all handles. Errors
    /// do not abort the remaining steps; the first one is reported after
    /// everything has been closed, and the entry's files are doomed.
    pub fn close(mut self, stream0: &[u8]) -> Result<EntryStat> {
        if self.failed {
            return Err(CacheError::NotFound);
        }
        self.sizes[0] = stream0.len() as u64;
        let key_len = self.key.len() as u64;
        let s1 = self.sizes[1];
        let mut first_err: Option<CacheError> = None;

        {
            let path0 = self.dir.join(format::stream_file_name(self.hash, 0));
            let file0 = &self.file0;
            let mut tail = Vec::with_capacity(2 * EntryEof::SIZE + stream0.len());
            tail.extend_from_slice(&EntryEof::new(self.crc[0].final_crc(s1), s1 as u32).encode());
            tail.extend_from_slice(stream0);
            tail.extend_from_slice(
                &EntryEof::new(Some(crc32c::crc32c(stream0)), stream0.len() as u32).encode(),
            );
            let result = file0
                .write_all_at(&tail, format::stream1_eof_offset(key_len, s1))
                .and_then(|()| {
                    file0.set_len(format::combined_file_size(key_len, self.sizes[0], s1))
                });
            if let Err(e) = result {
                first_err.get_or_insert(CacheError::io(&path0, "write entry tail", e));
            }
        }

        if let Some(file1) = self.file1.as_ref() {
            let path1 = self.dir.join(format::stream_file_name(self.hash, 1));
            let s2 = self.sizes[2];
            let eof2 = EntryEof::new(self.crc[1].final_crc(s2), s2 as u32);
            let result = file1
                .write_all_at(
                    &eof2.encode(),
                    format::stream2_data_offset(key_len) + s2,
                )
                .and_then(|()| file1.set_len(format::stream2_file_size(key_len, s2)));
            if let Err(e) = result {
                first_err.get_or_insert(CacheError::io(&path1, "write entry tail", e));
            }
        }

        let stat = self.stat(stream0.len() as u64);
        // Handles drop here regardless of errors.
        match first_err {
            None => Ok(stat),
            Some(e) => {
                let _ = Self::doom(&self.dir, self.hash);
                Err(e)
            }
        }
    }

    /// Best-effort deletion of every file belonging to `hash`. Missing files
    /// are not an error; the first real failure is reported after all three
    /// deletions have been attempted.
    pub fn doom(dir: &Path, hash: EntryHash) -> Result<()> {
        let names = [
            format::stream_file_name(hash, 0),
            format::stream_file_name(hash, 1),
            format::sparse_file_name(hash),
        ];
        let mut first_err = None;
        for name in names {
            let path = dir.join(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    first_err.get_or_insert(CacheError::io(&path, "delete entry file", e));
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Doom a whole set of hashes. Deletions are not transactional: a
    /// partial failure is surfaced but already-deleted files stay deleted.
    pub fn doom_set(dir: &Path, hashes: &[EntryHash]) -> Result<()> {
        tracing::debug!(count = hashes.len(), "bulk doom");
        let mut first_err = None;
        for &hash in hashes {
            if let Err(e) = Self::doom(dir, hash) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Mark this instance failed and doom its files; every subsequent call
    /// short-circuits
    fn fail(&mut self) {
        if !self.failed {
            self.failed = true;
            tracing::warn!(hash = %self.hash, "entry failed, dooming files");
            let _ = Self::doom(&self.dir, self.hash);
        }
    }

    fn stream_data_offset(&self, stream: usize) -> u64 {
        let key_len = self.key.len() as u64;
        match stream {
            1 => format::stream1_data_offset(key_len),
            2 => format::stream2_data_offset(key_len),
            _ => unreachable!("streams 0 has no direct file offset"),
        }
    }

    fn stream_path(&self, stream: usize) -> PathBuf {
        let file_index = if stream == 2 { 1 } else { 0 };
        self.dir
            .join(format::stream_file_name(self.hash, file_index))
    }
}

fn zero_fill(file: &File, path: &Path, mut pos: u64, mut remaining: u64) -> Result<()> {
    let zeros = [0u8; ZERO_CHUNK];
    while remaining > 0 {
        let n = (remaining as usize).min(ZERO_CHUNK);
        if let Err(e) = file.write_all_at(&zeros[..n], pos) {
            return Err(CacheError::io(path, "zero-fill gap", e));
        }
        pos += n as u64;
        remaining -= n as u64;
    }
    Ok(())
}

/// Read and validate the header + key preamble shared by all entry files
fn read_preamble(file: &File, path: &Path, file_len: u64, hash: EntryHash) -> Result<(EntryHeader, String)> {
    let min_len = EntryHeader::SIZE as u64 + EntryEof::SIZE as u64;
    if file_len < min_len {
        return Err(CacheError::corrupt(hash, FormatViolation::TruncatedRead));
    }
    let mut buf = [0u8; EntryHeader::SIZE];
    if let Err(e) = file.read_exact_at(&mut buf, 0) {
        return Err(read_failure(hash, path, e));
    }
    let header = EntryHeader::decode(&buf);
    if let Err(v) = header.validate() {
        return Err(CacheError::corrupt(hash, v));
    }
    let mut key_buf = vec![0u8; header.key_length as usize];
    if let Err(e) = file.read_exact_at(&mut key_buf, EntryHeader::SIZE as u64) {
        return Err(read_failure(hash, path, e));
    }
    let key = match String::from_utf8(key_buf) {
        Ok(k) => k,
        Err(_) => return Err(CacheError::corrupt(hash, FormatViolation::KeyMismatch)),
    };
    if let Err(v) = header.validate_key(&key) {
        return Err(CacheError::corrupt(hash, v));
    }
    Ok((header, key))
}

fn read_eof(file: &File, path: &Path, pos: u64, hash: EntryHash) -> Result<EntryEof> {
    let mut buf = [0u8; EntryEof::SIZE];
    if let Err(e) = file.read_exact_at(&mut buf, pos) {
        return Err(read_failure(hash, path, e));
    }
    let eof = EntryEof::decode(&buf);
    match eof.validate() {
        Ok(()) => Ok(eof),
        Err(v) => Err(CacheError::corrupt(hash, v)),
    }
}

fn create_with_preamble(path: &Path, key: &str) -> Result<File> {
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(CacheError::AlreadyExists),
        Err(e) => return Err(CacheError::io(path, "create entry file", e)),
    };
    let mut preamble = Vec::with_capacity(EntryHeader::SIZE + key.len());
    preamble.extend_from_slice(&EntryHeader::new(key).encode());
    preamble.extend_from_slice(key.as_bytes());
    if let Err(e) = file.write_all_at(&preamble, 0) {
        return Err(CacheError::io(path, "write entry header", e));
    }
    Ok(file)
}

/// A short read means the file is truncated relative to what its records
/// promise; anything else is a real I/O failure
fn read_failure(hash: EntryHash, path: &Path, e: std::io::Error) -> CacheError {
    if e.kind() == ErrorKind::UnexpectedEof {
        CacheError::corrupt(hash, FormatViolation::TruncatedRead)
    } else {
        CacheError::io(path, "read entry file", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: &str = "http://example.com/resource";

    fn options() -> EntryOptions {
        EntryOptions {
            omit_empty_stream2: true,
            sparse_budget: 1 << 20,
        }
    }

    fn create_entry(dir: &Path) -> SyncEntry {
        let hash = entry_hash(KEY);
        SyncEntry::create(options(), dir, KEY, hash).unwrap().0
    }

    #[test]
    fn create_open_round_trip_all_streams() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        {
            let mut entry = create_entry(dir.path());
            entry.write_stream(1, 0, b"stream one", false).unwrap();
            entry.write_stream(2, 0, b"stream two!", false).unwrap();
            entry.close(b"stream zero").unwrap();
        }

        let (mut entry, stat, stream0) =
            SyncEntry::open(options(), dir.path(), hash, None, true).unwrap();
        assert_eq!(stream0, b"stream zero");
        assert_eq!(stat.stream_sizes, [11, 10, 11]);
        assert_eq!(entry.key(), KEY);
        assert_eq!(entry.read_stream(1, 0, 100).unwrap(), b"stream one");
        assert_eq!(entry.read_stream(2, 0, 100).unwrap(), b"stream two!");
    }

    #[test]
    fn create_fails_when_files_exist() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        create_entry(dir.path()).close(b"").unwrap();
        let err = SyncEntry::create(options(), dir.path(), KEY, hash).unwrap_err();
        assert!(matches!(err, CacheError::AlreadyExists));
    }

    #[test]
    fn open_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = SyncEntry::open(options(), dir.path(), entry_hash(KEY), None, false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn stream2_file_omitted_until_written() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        let path1 = dir.path().join(format::stream_file_name(hash, 1));
        {
            let mut entry = create_entry(dir.path());
            assert!(!path1.exists());
            // Empty stream 2 reads fine without a file.
            assert!(entry.read_stream(2, 0, 10).unwrap().is_empty());
            entry.close(b"").unwrap();
        }
        assert!(!path1.exists());

        // A real write materializes the file.
        let (mut entry, _, _) = SyncEntry::open(options(), dir.path(), hash, None, true).unwrap();
        entry.write_stream(2, 0, b"now", false).unwrap();
        assert!(path1.exists());
        entry.close(b"").unwrap();
    }

    #[test]
    fn extending_write_zero_fills_gap() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        {
            let mut entry = create_entry(dir.path());
            entry.write_stream(1, 0, b"abc", false).unwrap();
            entry.write_stream(1, 10, b"xyz", false).unwrap();
            entry.close(b"").unwrap();
        }
        let (mut entry, stat, _) = SyncEntry::open(options(), dir.path(), hash, None, true).unwrap();
        assert_eq!(stat.stream_sizes[1], 13);
        let data = entry.read_stream(1, 0, 13).unwrap();
        assert_eq!(&data[..3], b"abc");
        assert_eq!(&data[3..10], &[0u8; 7]);
        assert_eq!(&data[10..], b"xyz");
    }

    #[test]
    fn truncating_write_shrinks_stream() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        {
            let mut entry = create_entry(dir.path());
            entry.write_stream(1, 0, &[7u8; 50], false).unwrap();
            entry.write_stream(1, 0, b"short", true).unwrap();
            entry.close(b"").unwrap();
        }
        let (mut entry, stat, _) = SyncEntry::open(options(), dir.path(), hash, None, true).unwrap();
        assert_eq!(stat.stream_sizes[1], 5);
        assert_eq!(entry.read_stream(1, 0, 100).unwrap(), b"short");
    }

    #[test]
    fn flipped_payload_byte_fails_full_read() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        {
            let mut entry = create_entry(dir.path());
            entry.write_stream(1, 0, b"payload under test", false).unwrap();
            entry.close(b"").unwrap();
        }
        // Corrupt one byte of stream 1's payload without touching its EOF.
        let path0 = dir.path().join(format::stream_file_name(hash, 0));
        let file = OpenOptions::new().write(true).open(&path0).unwrap();
        file.write_all_at(b"X", format::stream1_data_offset(KEY.len() as u64) + 4)
            .unwrap();

        let (mut entry, _, _) = SyncEntry::open(options(), dir.path(), hash, None, true).unwrap();
        let err = entry.read_stream(1, 0, 100).unwrap_err();
        assert!(matches!(
            err,
            CacheError::Corruption {
                violation: FormatViolation::CrcMismatch,
                ..
            }
        ));
        // The failure doomed the files.
        assert!(!path0.exists());
        // And the instance stays failed.
        assert!(entry.read_stream(1, 0, 1).is_err());
    }

    #[test]
    fn partial_read_skips_crc_then_full_read_catches_it() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        {
            let mut entry = create_entry(dir.path());
            entry.write_stream(1, 0, b"0123456789", false).unwrap();
            entry.close(b"").unwrap();
        }
        let path0 = dir.path().join(format::stream_file_name(hash, 0));
        let file = OpenOptions::new().write(true).open(&path0).unwrap();
        file.write_all_at(b"X", format::stream1_data_offset(KEY.len() as u64))
            .unwrap();
        drop(file);

        let (mut entry, _, _) = SyncEntry::open(options(), dir.path(), hash, None, true).unwrap();
        assert_eq!(entry.read_stream(1, 5, 5).unwrap(), b"56789");
        assert!(entry.read_stream(1, 0, 10).is_err());
    }

    #[test]
    fn corrupt_header_dooms_on_open() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        create_entry(dir.path()).close(b"").unwrap();

        let path0 = dir.path().join(format::stream_file_name(hash, 0));
        let file = OpenOptions::new().write(true).open(&path0).unwrap();
        file.write_all_at(&[0u8; 8], 0).unwrap();
        drop(file);

        let err = SyncEntry::open(options(), dir.path(), hash, None, true).unwrap_err();
        assert!(matches!(
            err,
            CacheError::Corruption {
                violation: FormatViolation::BadMagic,
                ..
            }
        ));
        assert!(!path0.exists(), "open failure must doom the files");
    }

    #[test]
    fn truncated_file_dooms_on_open() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        {
            let mut entry = create_entry(dir.path());
            entry.write_stream(1, 0, &[1u8; 100], false).unwrap();
            entry.close(b"some stream zero data").unwrap();
        }
        let path0 = dir.path().join(format::stream_file_name(hash, 0));
        let len = std::fs::metadata(&path0).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path0).unwrap();
        file.set_len(len - 30).unwrap();
        drop(file);

        assert!(SyncEntry::open(options(), dir.path(), hash, None, true).is_err());
        assert!(!path0.exists());
    }

    #[test]
    fn rewrite_from_zero_restores_crc_coverage() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        {
            let mut entry = create_entry(dir.path());
            entry.write_stream(1, 0, b"first version", false).unwrap();
            // Overwrite in the middle: CRC coverage lost for the EOF...
            entry.write_stream(1, 6, b"middle", false).unwrap();
            // ...then a rewrite from zero with truncate restores it.
            entry.write_stream(1, 0, b"second", true).unwrap();
            entry.close(b"").unwrap();
        }
        let (mut entry, _, _) = SyncEntry::open(options(), dir.path(), hash, None, true).unwrap();
        assert_eq!(entry.read_stream(1, 0, 6).unwrap(), b"second");
    }

    #[test]
    fn doom_set_reports_but_does_not_roll_back() {
        let dir = TempDir::new().unwrap();
        let h1 = entry_hash("k1");
        let h2 = entry_hash("k2");
        SyncEntry::create(options(), dir.path(), "k1", h1)
            .unwrap()
            .0
            .close(b"")
            .unwrap();
        SyncEntry::create(options(), dir.path(), "k2", h2)
            .unwrap()
            .0
            .close(b"")
            .unwrap();

        SyncEntry::doom_set(dir.path(), &[h1, h2]).unwrap();
        assert!(!dir.path().join(format::stream_file_name(h1, 0)).exists());
        assert!(!dir.path().join(format::stream_file_name(h2, 0)).exists());
        // Dooming already-gone entries is fine.
        SyncEntry::doom_set(dir.path(), &[h1, h2]).unwrap();
    }

    #[test]
    fn sparse_round_trip_with_budget() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        let small_budget = EntryOptions {
            omit_empty_stream2: true,
            sparse_budget: 64,
        };
        let mut entry = SyncEntry::create(small_budget, dir.path(), KEY, hash).unwrap().0;
        entry.write_sparse(0, &[1u8; 40]).unwrap();
        assert_eq!(entry.read_sparse(0, 40).unwrap(), vec![1u8; 40]);
        assert_eq!(entry.available_range(0, 100), (0, 40));

        // Pushing past the budget drops everything, then stores the new data.
        entry.write_sparse(1000, &[2u8; 40]).unwrap();
        assert!(entry.read_sparse(0, 40).unwrap().is_empty());
        assert_eq!(entry.read_sparse(1000, 40).unwrap(), vec![2u8; 40]);
        entry.close(b"").unwrap();
    }

    #[test]
    fn stat_counts_all_files() {
        let dir = TempDir::new().unwrap();
        let hash = entry_hash(KEY);
        let mut entry = create_entry(dir.path());
        entry.write_stream(1, 0, &[1u8; 100], false).unwrap();
        entry.write_sparse(0, &[2u8; 50]).unwrap();
        let stat = entry.stat(25);
        let key_len = KEY.len() as u64;
        let expected_sparse = EntryHeader::SIZE as u64
            + key_len
            + crate::sparse::RANGE_HEADER_SIZE as u64
            + 50;
        assert_eq!(
            stat.disk_size,
            format::combined_file_size(key_len, 25, 100) + expected_sparse
        );
        entry.close(&[0u8; 25]).unwrap();

        let (_, stat, stream0) = SyncEntry::open(options(), dir.path(), hash, None, true).unwrap();
        assert_eq!(stream0.len(), 25);
        assert_eq!(
            stat.disk_size,
            format::combined_file_size(key_len, 25, 100) + expected_sparse
        );
    }

    #[test]
    fn file_under_a_foreign_name_fails_the_unkeyed_open() {
        let dir = TempDir::new().unwrap();
        create_entry(dir.path()).close(b"").unwrap();

        // Move the file to a name its stored key does not hash to.
        let wrong = EntryHash(entry_hash(KEY).0 ^ 1);
        std::fs::rename(
            dir.path().join(format::stream_file_name(entry_hash(KEY), 0)),
            dir.path().join(format::stream_file_name(wrong, 0)),
        )
        .unwrap();

        let err = SyncEntry::open(options(), dir.path(), wrong, None, false).unwrap_err();
        assert!(matches!(
            err,
            CacheError::Corruption {
                violation: FormatViolation::KeyMismatch,
                ..
            }
        ));
        let path = dir.path().join(format::stream_file_name(wrong, 0));
        assert!(!path.exists(), "the failed open must doom the file");
    }

    #[test]
    fn keyed_open_tolerates_a_foreign_filename() {
        let dir = TempDir::new().unwrap();
        create_entry(dir.path()).close(b"").unwrap();
        let wrong = EntryHash(entry_hash(KEY).0 ^ 1);
        std::fs::rename(
            dir.path().join(format::stream_file_name(entry_hash(KEY), 0)),
            dir.path().join(format::stream_file_name(wrong, 0)),
        )
        .unwrap();

        let (entry, _, _) = SyncEntry::open(options(), dir.path(), wrong, Some(KEY), false).unwrap();
        assert_eq!(entry.key(), KEY);
    }

    #[test]
    fn oversized_stream_write_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut entry = create_entry(dir.path());
        let err = entry
            .write_stream(1, format::MAX_STREAM_SIZE, b"x", false)
            .unwrap_err();
        assert!(matches!(err, CacheError::Config { .. }));
        let err = entry.write_stream(2, u64::MAX, b"x", false).unwrap_err();
        assert!(matches!(err, CacheError::Config { .. }));
        // The rejection is not fatal.
        entry.write_stream(1, 0, b"fine", false).unwrap();
        entry.close(b"").unwrap();
    }

    #[test]
    fn out_of_range_sparse_write_is_rejected_without_dooming() {
        let dir = TempDir::new().unwrap();
        let mut entry = create_entry(dir.path());
        let err = entry.write_sparse(u64::MAX - 1, b"abc").unwrap_err();
        assert!(matches!(err, CacheError::Config { .. }));
        entry.write_sparse(0, b"ok").unwrap();
        assert_eq!(entry.read_sparse(0, 2).unwrap(), b"ok");
        entry.close(b"").unwrap();
    }
}
