//! Sparse byte-range storage
//!
//! An entry's sparse data lives in a dedicated side file: the usual entry
//! header and key, then a sequence of range records, each a small header
//! (magic, offset, length, CRC32) followed by that range's payload. Records
//! are only ever appended; overwrites of existing ranges happen in place.
//! The in-memory picture is an offset-ordered map of disjoint ranges.
//!
//! CRC discipline: a range's CRC covers its full payload. Fully overwriting
//! a range recomputes it; partially overwriting one rewrites the stored CRC
//! with a sentinel meaning "not verifiable". Reads that cover a whole range
//! re-validate its CRC; partial reads do not.

use crate::errors::{CacheError, FormatViolation, Result};
use crate::format::{self, EntryHeader, RANGE_MAGIC};
use crate::hashing::EntryHash;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Stored in the CRC field of a range whose checksum is no longer valid.
/// A genuine checksum can collide with it, in which case the range is merely
/// treated as unverifiable.
const CRC_SENTINEL: u32 = u32::MAX;

/// Size of the per-range record header
pub const RANGE_HEADER_SIZE: usize = 28;

/// One disjoint byte range of an entry's sparse data
#[derive(Debug, Clone, Copy)]
pub struct SparseRange {
    pub offset: u64,
    pub length: u64,
    pub crc: Option<u32>,
    /// Position of the payload in the side file; the record header sits
    /// immediately before it
    pub file_offset: u64,
}

impl SparseRange {
    fn end(&self) -> u64 {
        self.offset + self.length
    }

    fn encode_header(&self) -> [u8; RANGE_HEADER_SIZE] {
        let mut buf = [0u8; RANGE_HEADER_SIZE];
        buf[0..8].copy_from_slice(&RANGE_MAGIC.to_le_bytes());
        buf[8..16].copy_from_slice(&(self.offset as i64).to_le_bytes());
        buf[16..24].copy_from_slice(&(self.length as i64).to_le_bytes());
        buf[24..28].copy_from_slice(&self.crc.unwrap_or(CRC_SENTINEL).to_le_bytes());
        buf
    }

    fn decode_header(
        buf: &[u8; RANGE_HEADER_SIZE],
        file_offset: u64,
    ) -> std::result::Result<Self, FormatViolation> {
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != RANGE_MAGIC {
            return Err(FormatViolation::BadMagic);
        }
        let offset = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        let length = i64::from_le_bytes(buf[16..24].try_into().unwrap());
        if offset < 0 || length <= 0 {
            return Err(FormatViolation::TruncatedRead);
        }
        let crc = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        Ok(Self {
            offset: offset as u64,
            length: length as u64,
            crc: (crc != CRC_SENTINEL).then_some(crc),
            file_offset,
        })
    }
}

/// The sparse side file for one entry
#[derive(Debug)]
pub struct SparseFile {
    file: File,
    path: PathBuf,
    hash: EntryHash,
    /// End of the header + key preamble; ranges start here
    data_start: u64,
    /// Current file length; appends go here
    append_pos: u64,
    /// Sum of all range lengths, checked against the sparse budget
    payload_len: u64,
    ranges: BTreeMap<u64, SparseRange>,
}

impl SparseFile {
    /// Create a fresh side file holding just the header and key
    pub fn create(path: PathBuf, key: &str, hash: EntryHash) -> Result<Self> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) => return Err(CacheError::io(&path, "create sparse file", e)),
        };
        let mut preamble = Vec::with_capacity(EntryHeader::SIZE + key.len());
        preamble.extend_from_slice(&EntryHeader::new(key).encode());
        preamble.extend_from_slice(key.as_bytes());
        if let Err(e) = file.write_all_at(&preamble, 0) {
            return Err(CacheError::io(&path, "write sparse header", e));
        }
        let data_start = preamble.len() as u64;
        Ok(Self {
            file,
            path,
            hash,
            data_start,
            append_pos: data_start,
            payload_len: 0,
            ranges: BTreeMap::new(),
        })
    }

    /// Open an existing side file and rebuild the range map by scanning its
    /// records. Any malformed record is corruption; the caller dooms the
    /// entry.
    pub fn open(path: PathBuf, key: &str, hash: EntryHash) -> Result<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) => return Err(CacheError::io(&path, "open sparse file", e)),
        };
        let file_len = match file.metadata() {
            Ok(m) => m.len(),
            Err(e) => return Err(CacheError::io(&path, "stat sparse file", e)),
        };

        let mut header_buf = [0u8; EntryHeader::SIZE];
        if let Err(e) = file.read_exact_at(&mut header_buf, 0) {
            return Err(corruption_from_read(hash, &path, e));
        }
        let header = EntryHeader::decode(&header_buf);
        if let Err(v) = header.validate().and_then(|()| header.validate_key(key)) {
            return Err(CacheError::corrupt(hash, v));
        }
        let mut key_buf = vec![0u8; key.len()];
        if let Err(e) = file.read_exact_at(&mut key_buf, EntryHeader::SIZE as u64) {
            return Err(corruption_from_read(hash, &path, e));
        }
        if key_buf != key.as_bytes() {
            return Err(CacheError::corrupt(hash, FormatViolation::KeyMismatch));
        }

        let data_start = EntryHeader::SIZE as u64 + key.len() as u64;
        let mut ranges = BTreeMap::new();
        let mut payload_len = 0u64;
        let mut pos = data_start;
        while pos < file_len {
            let mut record_buf = [0u8; RANGE_HEADER_SIZE];
            if let Err(e) = file.read_exact_at(&mut record_buf, pos) {
                return Err(corruption_from_read(hash, &path, e));
            }
            let range = match SparseRange::decode_header(&record_buf, pos + RANGE_HEADER_SIZE as u64)
            {
                Ok(r) => r,
                Err(v) => return Err(CacheError::corrupt(hash, v)),
            };
            let record_end = pos + RANGE_HEADER_SIZE as u64 + range.length;
            if record_end > file_len {
                return Err(CacheError::corrupt(hash, FormatViolation::TruncatedRead));
            }
            if overlaps_existing(&ranges, range.offset, range.end()) {
                return Err(CacheError::corrupt(hash, FormatViolation::TruncatedRead));
            }
            payload_len += range.length;
            ranges.insert(range.offset, range);
            pos = record_end;
        }

        Ok(Self {
            file,
            path,
            hash,
            data_start,
            append_pos: file_len,
            payload_len,
            ranges,
        })
    }

    /// Total payload bytes across all ranges
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Current side-file length on disk
    pub fn file_len(&self) -> u64 {
        self.append_pos
    }

    /// Read up to `len` bytes at `offset`, concatenating contiguous coverage.
    /// The first gap truncates the result; a read that starts in a gap
    /// returns no bytes. Gaps are never an error.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset.saturating_add(len as u64);
        let mut out = Vec::new();
        let mut pos = offset;
        while pos < end {
            let range = match self.range_covering(pos) {
                Some(r) => r,
                None => break,
            };
            let chunk_len = (range.end().min(end) - pos) as usize;
            let mut chunk = vec![0u8; chunk_len];
            let file_pos = range.file_offset + (pos - range.offset);
            if let Err(e) = self.file.read_exact_at(&mut chunk, file_pos) {
                return Err(CacheError::io(&self.path, "read sparse range", e));
            }
            let covers_whole_range = pos == range.offset && range.end() <= end;
            if covers_whole_range {
                if let Some(expected) = range.crc {
                    if crc32c::crc32c(&chunk) != expected {
                        return Err(CacheError::corrupt(self.hash, FormatViolation::CrcMismatch));
                    }
                }
            }
            out.extend_from_slice(&chunk);
            pos += chunk_len as u64;
        }
        Ok(out)
    }

    /// Write `data` at `offset`: overwrite whatever ranges it touches in
    /// place and append new ranges for every uncovered sub-span
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        // Range record headers store offsets and lengths as i64.
        let end = match offset.checked_add(data.len() as u64) {
            Some(end) if end <= i64::MAX as u64 => end,
            _ => {
                return Err(CacheError::Config {
                    message: format!("sparse write at {offset} exceeds the addressable range"),
                })
            }
        };
        let mut pos = offset;

        // Tail of a range that starts before the write and overlaps it.
        if let Some(range) = self.range_covering(offset) {
            if range.offset < offset {
                let within = offset - range.offset;
                let n = ((range.length - within) as usize).min(data.len());
                let file_pos = range.file_offset + within;
                if let Err(e) = self.file.write_all_at(&data[..n], file_pos) {
                    return Err(CacheError::io(&self.path, "overwrite sparse range", e));
                }
                self.set_range_crc(range.offset, None)?;
                pos += n as u64;
            }
        }

        // Ranges that start inside the write: full or prefix overwrite.
        let starts: Vec<u64> = self.ranges.range(pos..end).map(|(k, _)| *k).collect();
        for start in starts {
            if start > pos {
                let head = (pos - offset) as usize;
                let gap_len = (start - pos) as usize;
                self.append_range(pos, &data[head..head + gap_len])?;
                pos = start;
            }
            let range = self.ranges[&start];
            let n = (range.length.min(end - start)) as usize;
            let slice = &data[(pos - offset) as usize..(pos - offset) as usize + n];
            if let Err(e) = self.file.write_all_at(slice, range.file_offset) {
                return Err(CacheError::io(&self.path, "overwrite sparse range", e));
            }
            let crc = if n as u64 == range.length {
                Some(crc32c::crc32c(slice))
            } else {
                None
            };
            self.set_range_crc(start, crc)?;
            pos += n as u64;
            if pos >= end {
                break;
            }
        }

        // Whatever is left past the last touched range is brand new.
        if pos < end {
            let head = (pos - offset) as usize;
            self.append_range(pos, &data[head..])?;
        }
        Ok(())
    }

    /// First contiguous covered sub-span intersecting `[offset, offset+len)`.
    /// Returns `(start, available)`; `available` is zero when nothing in the
    /// window is covered.
    pub fn available_range(&self, offset: u64, len: u64) -> (u64, u64) {
        let end = offset.saturating_add(len);
        let start = match self.range_covering(offset) {
            Some(_) => offset,
            None => match self.ranges.range(offset..end).next() {
                Some((first, _)) => *first,
                None => return (offset, 0),
            },
        };
        // Extend through exactly adjacent ranges.
        let mut contiguous_end = match self.range_covering(start) {
            Some(r) => r.end(),
            None => return (offset, 0),
        };
        while let Some(next) = self.ranges.get(&contiguous_end) {
            if contiguous_end >= end {
                break;
            }
            contiguous_end = next.end();
        }
        (start, contiguous_end.min(end) - start)
    }

    /// Drop every range and reset the file to its bare preamble. Called when
    /// an append would push the entry past its sparse budget; deliberately a
    /// full reset rather than a per-range eviction.
    pub fn truncate_all(&mut self) -> Result<()> {
        if let Err(e) = self.file.set_len(self.data_start) {
            return Err(CacheError::io(&self.path, "truncate sparse file", e));
        }
        self.ranges.clear();
        self.append_pos = self.data_start;
        self.payload_len = 0;
        Ok(())
    }

    fn range_covering(&self, pos: u64) -> Option<SparseRange> {
        self.ranges
            .range(..=pos)
            .next_back()
            .map(|(_, r)| *r)
            .filter(|r| r.end() > pos)
    }

    /// Append a brand-new range record at the file tail
    fn append_range(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        debug_assert!(!data.is_empty());
        let range = SparseRange {
            offset,
            length: data.len() as u64,
            crc: Some(crc32c::crc32c(data)),
            file_offset: self.append_pos + RANGE_HEADER_SIZE as u64,
        };
        let mut record = Vec::with_capacity(RANGE_HEADER_SIZE + data.len());
        record.extend_from_slice(&range.encode_header());
        record.extend_from_slice(data);
        if let Err(e) = self.file.write_all_at(&record, self.append_pos) {
            return Err(CacheError::io(&self.path, "append sparse range", e));
        }
        self.append_pos += record.len() as u64;
        self.payload_len += range.length;
        self.ranges.insert(offset, range);
        Ok(())
    }

    /// Update a range's CRC both in memory and in its on-disk record header
    fn set_range_crc(&mut self, start: u64, crc: Option<u32>) -> Result<()> {
        let range = match self.ranges.get_mut(&start) {
            Some(r) => r,
            None => return Ok(()),
        };
        range.crc = crc;
        let crc_pos = range.file_offset - RANGE_HEADER_SIZE as u64 + 24;
        let bytes = crc.unwrap_or(CRC_SENTINEL).to_le_bytes();
        if let Err(e) = self.file.write_all_at(&bytes, crc_pos) {
            return Err(CacheError::io(&self.path, "update sparse range crc", e));
        }
        Ok(())
    }
}

fn overlaps_existing(ranges: &BTreeMap<u64, SparseRange>, start: u64, end: u64) -> bool {
    if let Some((_, prev)) = ranges.range(..=start).next_back() {
        if prev.end() > start {
            return true;
        }
    }
    ranges.range(start..end).next().is_some()
}

fn corruption_from_read(hash: EntryHash, path: &Path, e: std::io::Error) -> CacheError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CacheError::corrupt(hash, FormatViolation::TruncatedRead)
    } else {
        CacheError::io(path, "read sparse file", e)
    }
}
