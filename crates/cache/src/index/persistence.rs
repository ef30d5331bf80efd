//! Index persistence: load, save, and the directory-scan fallback
//!
//! The index lives at `<cache>/index/the-index`. The file carries the cache
//! directory's mtime from the moment it was written; if the directory has
//! been modified since, entries changed behind the index's back and the file
//! is discarded in favor of a full directory scan. Any parse or checksum
//! failure falls back to the scan the same way, so a damaged index costs a
//! slow start, never incorrect state.
//!
//! Everything here blocks and runs on the background pool.
//!
//! Layout, all little-endian:
//!
//! ```text
//! magic:u64  version:u32  count:u64  total:u64
//! count x { hash:u64  lastUsedSecs:u32  size:u32 }
//! dirMtimeSecs:i64  crc32c:u32
//! ```
//!
//! `lastUsedSecs` of zero means never used.

use crate::errors::{CacheError, Result};
use crate::format::{self, FileKind};
use crate::hashing::EntryHash;
use crate::index::EntryMetadata;
use crate::sync_entry::SyncEntry;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const INDEX_DIR: &str = "index";
const INDEX_FILE: &str = "the-index";

const INDEX_HEADER_SIZE: usize = 8 + 4 + 8 + 8;
const INDEX_RECORD_SIZE: usize = 8 + 4 + 4;
const INDEX_TRAILER_SIZE: usize = 8 + 4;

/// Result of loading the index at startup
pub(crate) struct LoadedIndex {
    pub records: Vec<(EntryHash, EntryMetadata)>,
    /// True when the records came from a directory scan instead of the
    /// index file
    pub rebuilt: bool,
}

pub(crate) fn index_file_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(INDEX_DIR).join(INDEX_FILE)
}

/// Load the persisted index, falling back to a directory scan when the file
/// is missing, damaged, or stale
pub(crate) fn load(cache_dir: &Path) -> LoadedIndex {
    let path = index_file_path(cache_dir);
    match std::fs::read(&path) {
        Ok(bytes) => match parse_index(&bytes) {
            Ok((records, stored_mtime)) => {
                let current = dir_mtime_secs(cache_dir);
                if current <= stored_mtime {
                    tracing::debug!(entries = records.len(), "index file loaded");
                    return LoadedIndex {
                        records,
                        rebuilt: false,
                    };
                }
                tracing::info!(
                    stored_mtime,
                    current,
                    "cache directory changed since last index save, rescanning"
                );
            }
            Err(reason) => {
                tracing::warn!(reason, "index file unreadable, rescanning");
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!("no index file, scanning cache directory");
        }
        Err(e) => {
            tracing::warn!("failed to read index file: {e}");
        }
    }
    LoadedIndex {
        records: rebuild_by_scan(cache_dir),
        rebuilt: true,
    }
}

/// Atomically persist the index: temp file in the index directory, then
/// rename over the final name
pub(crate) fn save(cache_dir: &Path, records: &[(EntryHash, EntryMetadata)]) -> Result<()> {
    let index_dir = cache_dir.join(INDEX_DIR);
    std::fs::create_dir_all(&index_dir)
        .map_err(|e| CacheError::io(&index_dir, "create index directory", e))?;

    let total: u64 = records.iter().map(|(_, meta)| meta.size).sum();
    let mut buf =
        Vec::with_capacity(INDEX_HEADER_SIZE + records.len() * INDEX_RECORD_SIZE + INDEX_TRAILER_SIZE);
    buf.extend_from_slice(&format::INDEX_MAGIC.to_le_bytes());
    buf.extend_from_slice(&format::FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(records.len() as u64).to_le_bytes());
    buf.extend_from_slice(&total.to_le_bytes());
    for (hash, meta) in records {
        buf.extend_from_slice(&hash.0.to_le_bytes());
        buf.extend_from_slice(&encode_last_used(meta.last_used).to_le_bytes());
        buf.extend_from_slice(&(meta.size.min(u64::from(u32::MAX)) as u32).to_le_bytes());
    }
    // The mtime recorded must be at least as new as every entry mutation
    // the records reflect, so read it last.
    buf.extend_from_slice(&dir_mtime_secs(cache_dir).to_le_bytes());
    buf.extend_from_slice(&crc32c::crc32c(&buf).to_le_bytes());

    let tmp = index_dir.join(format!("{}.tmp", Uuid::new_v4()));
    std::fs::write(&tmp, &buf).map_err(|e| CacheError::io(&tmp, "write index", e))?;
    let path = index_dir.join(INDEX_FILE);
    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(CacheError::io(&path, "rename index into place", e));
    }
    tracing::debug!(entries = records.len(), total, "index saved");
    Ok(())
}

fn parse_index(bytes: &[u8]) -> std::result::Result<(Vec<(EntryHash, EntryMetadata)>, i64), &'static str> {
    if bytes.len() < INDEX_HEADER_SIZE + INDEX_TRAILER_SIZE {
        return Err("short file");
    }
    let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().map_err(|_| "short file")?);
    if crc32c::crc32c(payload) != stored_crc {
        return Err("checksum mismatch");
    }
    let magic = u64::from_le_bytes(bytes[0..8].try_into().map_err(|_| "short file")?);
    if magic != format::INDEX_MAGIC {
        return Err("bad magic");
    }
    let version = u32::from_le_bytes(bytes[8..12].try_into().map_err(|_| "short file")?);
    if version != format::FORMAT_VERSION {
        return Err("unsupported version");
    }
    let count = u64::from_le_bytes(bytes[12..20].try_into().map_err(|_| "short file")?);
    let expected_len = count
        .checked_mul(INDEX_RECORD_SIZE as u64)
        .and_then(|n| n.checked_add((INDEX_HEADER_SIZE + INDEX_TRAILER_SIZE) as u64))
        .ok_or("record count overflows")?;
    if bytes.len() as u64 != expected_len {
        return Err("record count disagrees with file length");
    }
    // Bounded by the file length from here on.
    let count = count as usize;
    let stored_total = u64::from_le_bytes(bytes[20..28].try_into().map_err(|_| "short file")?);

    let mut records = Vec::with_capacity(count);
    let mut total = 0u64;
    let mut pos = INDEX_HEADER_SIZE;
    for _ in 0..count {
        let rec = &bytes[pos..pos + INDEX_RECORD_SIZE];
        let hash = EntryHash(u64::from_le_bytes(rec[0..8].try_into().map_err(|_| "short record")?));
        let last_used_secs = u32::from_le_bytes(rec[8..12].try_into().map_err(|_| "short record")?);
        let size = u64::from(u32::from_le_bytes(rec[12..16].try_into().map_err(|_| "short record")?));
        total += size;
        records.push((
            hash,
            EntryMetadata {
                last_used: decode_last_used(last_used_secs),
                size,
            },
        ));
        pos += INDEX_RECORD_SIZE;
    }
    if total != stored_total {
        return Err("size total disagrees with records");
    }
    let mtime = i64::from_le_bytes(bytes[pos..pos + 8].try_into().map_err(|_| "short trailer")?);
    Ok((records, mtime))
}

/// Reconstruct index records by scanning the cache directory. Also deletes
/// stray side files whose combined file is gone, and the now-distrusted
/// index file itself.
fn rebuild_by_scan(cache_dir: &Path) -> Vec<(EntryHash, EntryMetadata)> {
    let _ = std::fs::remove_file(index_file_path(cache_dir));

    let mut sizes: HashMap<EntryHash, u64> = HashMap::new();
    let mut complete: HashMap<EntryHash, Option<SystemTime>> = HashMap::new();
    let read_dir = match std::fs::read_dir(cache_dir) {
        Ok(rd) => rd,
        Err(e) => {
            tracing::warn!("cannot scan cache directory: {e}");
            return Vec::new();
        }
    };
    for dirent in read_dir.flatten() {
        let name = dirent.file_name();
        let Some((hash, kind)) = name.to_str().and_then(format::parse_file_name) else {
            continue; // the index subdirectory, temp files, anything foreign
        };
        let metadata = match dirent.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !metadata.is_file() {
            continue;
        }
        *sizes.entry(hash).or_default() += metadata.len();
        if kind == FileKind::Stream(0) {
            let last_used = metadata.accessed().or_else(|_| metadata.modified()).ok();
            complete.insert(hash, last_used);
        }
    }

    // Side files without a combined file cannot be opened; clean them up.
    let mut strays = 0usize;
    for &hash in sizes.keys() {
        if !complete.contains_key(&hash) {
            let _ = SyncEntry::doom(cache_dir, hash);
            strays += 1;
        }
    }
    if strays > 0 {
        tracing::info!(strays, "deleted orphaned entry files during scan");
    }

    let records: Vec<_> = complete
        .into_iter()
        .map(|(hash, last_used)| {
            (
                hash,
                EntryMetadata {
                    last_used,
                    size: sizes.get(&hash).copied().unwrap_or(0),
                },
            )
        })
        .collect();
    tracing::info!(entries = records.len(), "index rebuilt from directory scan");
    records
}

fn dir_mtime_secs(cache_dir: &Path) -> i64 {
    let mtime = std::fs::metadata(cache_dir).and_then(|m| m.modified());
    match mtime {
        Ok(t) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(_) => 0,
        },
        // Unreadable directory counts as "changed" so the scan runs.
        Err(_) => i64::MAX,
    }
}

fn encode_last_used(last_used: Option<SystemTime>) -> u32 {
    let Some(t) = last_used else { return 0 };
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs().min(u64::from(u32::MAX)) as u32).max(1),
        Err(_) => 0,
    }
}

fn decode_last_used(secs: u32) -> Option<SystemTime> {
    (secs != 0).then(|| UNIX_EPOCH + Duration::from_secs(u64::from(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::entry_hash;
    use crate::sync_entry::{EntryOptions, SyncEntry};
    use tempfile::TempDir;

    fn options() -> EntryOptions {
        EntryOptions {
            omit_empty_stream2: true,
            sparse_budget: 1 << 20,
        }
    }

    fn write_entry(dir: &Path, key: &str, stream1: &[u8]) -> EntryHash {
        let hash = entry_hash(key);
        let mut entry = SyncEntry::create(options(), dir, key, hash).unwrap().0;
        entry.write_stream(1, 0, stream1, false).unwrap();
        entry.close(b"meta").unwrap();
        hash
    }

    fn record_for(
        records: &[(EntryHash, EntryMetadata)],
        hash: EntryHash,
    ) -> Option<EntryMetadata> {
        records.iter().find(|(h, _)| *h == hash).map(|(_, m)| *m)
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let h1 = write_entry(dir.path(), "first", b"aaaa");
        let h2 = write_entry(dir.path(), "second", b"bbbbbbbb");
        let scanned = load(dir.path());
        assert!(scanned.rebuilt);

        save(dir.path(), &scanned.records).unwrap();
        let loaded = load(dir.path());
        assert!(!loaded.rebuilt, "fresh index file must be trusted");
        assert_eq!(loaded.records.len(), 2);
        let r1 = record_for(&loaded.records, h1).unwrap();
        let r2 = record_for(&loaded.records, h2).unwrap();
        assert!(r2.size > r1.size);
        assert!(r1.last_used.is_some());
    }

    #[test]
    fn missing_index_rebuilds_by_scan() {
        let dir = TempDir::new().unwrap();
        let hash = write_entry(dir.path(), "scanned", b"payload");
        let loaded = load(dir.path());
        assert!(loaded.rebuilt);
        let rec = record_for(&loaded.records, hash).unwrap();
        let file_len = std::fs::metadata(
            dir.path().join(format::stream_file_name(hash, 0)),
        )
        .unwrap()
        .len();
        assert_eq!(rec.size, file_len);
    }

    #[test]
    fn corrupt_index_rebuilds_by_scan() {
        let dir = TempDir::new().unwrap();
        let hash = write_entry(dir.path(), "survivor", b"data");
        let scanned = load(dir.path());
        save(dir.path(), &scanned.records).unwrap();

        let path = index_file_path(dir.path());
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let loaded = load(dir.path());
        assert!(loaded.rebuilt);
        assert!(record_for(&loaded.records, hash).is_some());
        assert!(!path.exists(), "distrusted index file must be deleted");
    }

    #[test]
    fn stale_index_rebuilds_and_sees_new_entry() {
        let dir = TempDir::new().unwrap();
        write_entry(dir.path(), "old", b"x");
        let scanned = load(dir.path());
        save(dir.path(), &scanned.records).unwrap();

        // Creating an entry touches the cache directory after the save.
        // Saved mtime has second precision, so push the clock difference
        // past a second.
        let past = std::time::SystemTime::now() - Duration::from_secs(10);
        let times = std::fs::FileTimes::new().set_modified(past);
        let file = std::fs::File::open(dir.path()).unwrap();
        file.set_times(times).unwrap();
        save(dir.path(), &scanned.records).unwrap();

        let new_hash = write_entry(dir.path(), "new", b"yy");
        let loaded = load(dir.path());
        assert!(loaded.rebuilt, "directory newer than index must rescan");
        assert!(record_for(&loaded.records, new_hash).is_some());
    }

    #[test]
    fn scan_deletes_orphaned_side_files() {
        let dir = TempDir::new().unwrap();
        let kept = write_entry(dir.path(), "kept", b"k");
        // A sparse file with no combined file alongside it.
        let orphan = entry_hash("orphan");
        let orphan_path = dir.path().join(format::sparse_file_name(orphan));
        std::fs::write(&orphan_path, b"junk").unwrap();

        let loaded = load(dir.path());
        assert!(record_for(&loaded.records, kept).is_some());
        assert!(record_for(&loaded.records, orphan).is_none());
        assert!(!orphan_path.exists());
    }

    #[test]
    fn absurd_record_count_rebuilds_by_scan() {
        let dir = TempDir::new().unwrap();
        let hash = write_entry(dir.path(), "survivor", b"data");

        // Checksum-valid file whose count would overflow length arithmetic.
        let mut buf = Vec::new();
        buf.extend_from_slice(&format::INDEX_MAGIC.to_le_bytes());
        buf.extend_from_slice(&format::FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&u64::MAX.to_le_bytes()); // count
        buf.extend_from_slice(&0u64.to_le_bytes()); // total
        buf.extend_from_slice(&i64::MAX.to_le_bytes()); // mtime
        buf.extend_from_slice(&crc32c::crc32c(&buf).to_le_bytes());
        std::fs::create_dir_all(dir.path().join(INDEX_DIR)).unwrap();
        std::fs::write(index_file_path(dir.path()), &buf).unwrap();

        let loaded = load(dir.path());
        assert!(loaded.rebuilt);
        assert!(record_for(&loaded.records, hash).is_some());
    }

    #[test]
    fn never_used_survives_round_trip() {
        let dir = TempDir::new().unwrap();
        let records = vec![(
            EntryHash(0xabcd),
            EntryMetadata {
                last_used: None,
                size: 77,
            },
        )];
        save(dir.path(), &records).unwrap();
        let loaded = load(dir.path());
        assert!(!loaded.rebuilt);
        let rec = record_for(&loaded.records, EntryHash(0xabcd)).unwrap();
        assert_eq!(rec.last_used, None);
        assert_eq!(rec.size, 77);
    }
}
