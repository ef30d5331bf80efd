//! On-disk record formats and offset arithmetic
//!
//! Every stream-bearing file starts with an [`EntryHeader`] followed by the
//! raw key bytes. The combined file (streams 0 and 1) is laid out as
//! `[header][key][stream1][EOF1][stream0][EOF0]`; the optional stream-2 file
//! as `[header][key][stream2][EOF2]`. Only the combined file's total size is
//! knowable up front, so stream 0's EOF record carries stream 0's length and
//! the split is recovered from it on open.
//!
//! All integers are little-endian. Two distinct magic numbers tell a
//! mis-placed header apart from a mis-placed EOF record, which is how
//! truncation is distinguished from corruption.

use crate::errors::FormatViolation;
use crate::hashing::EntryHash;

/// Magic for the header at the start of every entry file
pub const HEADER_MAGIC: u64 = u64::from_le_bytes(*b"flathcdr");
/// Magic for EOF records
pub const EOF_MAGIC: u64 = u64::from_le_bytes(*b"flateofr");
/// Magic for sparse range record headers
pub const RANGE_MAGIC: u64 = u64::from_le_bytes(*b"flatrnge");
/// Magic for the index file
pub const INDEX_MAGIC: u64 = u64::from_le_bytes(*b"flatindx");

/// Current entry file format version
pub const FORMAT_VERSION: u32 = 1;

/// Keys longer than this are rejected outright; also bounds how much a
/// corrupt header can make us allocate
pub const MAX_KEY_LENGTH: u32 = 64 * 1024;

/// Largest size one stream may grow to; EOF records carry stream sizes as
/// `u32`
pub const MAX_STREAM_SIZE: u64 = u32::MAX as u64;

/// Fixed header at offset 0 of every entry file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub magic: u64,
    pub version: u32,
    pub key_length: u32,
    pub key_hash: u32,
}

impl EntryHeader {
    pub const SIZE: usize = 20;

    pub fn new(key: &str) -> Self {
        Self {
            magic: HEADER_MAGIC,
            version: FORMAT_VERSION,
            key_length: key.len() as u32,
            key_hash: crate::hashing::key_hash32(key),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.key_length.to_le_bytes());
        buf[16..20].copy_from_slice(&self.key_hash.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            version: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            key_length: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            key_hash: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        }
    }

    /// Magic, version and key-length sanity; key bytes are checked separately
    /// once they have been read
    pub fn validate(&self) -> std::result::Result<(), FormatViolation> {
        if self.magic != HEADER_MAGIC {
            return Err(FormatViolation::BadMagic);
        }
        if self.version != FORMAT_VERSION {
            return Err(FormatViolation::BadVersion);
        }
        if self.key_length > MAX_KEY_LENGTH {
            return Err(FormatViolation::TruncatedRead);
        }
        Ok(())
    }

    /// Check the recorded key hash against the key bytes read from the file
    pub fn validate_key(&self, key: &str) -> std::result::Result<(), FormatViolation> {
        if self.key_length as usize != key.len() || self.key_hash != crate::hashing::key_hash32(key)
        {
            return Err(FormatViolation::KeyMismatch);
        }
        Ok(())
    }
}

/// EOF record terminating each stream's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryEof {
    pub magic: u64,
    pub flags: u32,
    pub data_crc32: u32,
    /// Meaningful only in stream 0's record, where it disambiguates the
    /// stream-0/stream-1 split within the combined file
    pub stream_size: u32,
}

impl EntryEof {
    pub const SIZE: usize = 20;
    pub const FLAG_HAS_CRC32: u32 = 1 << 0;

    pub fn new(crc: Option<u32>, stream_size: u32) -> Self {
        Self {
            magic: EOF_MAGIC,
            flags: if crc.is_some() { Self::FLAG_HAS_CRC32 } else { 0 },
            data_crc32: crc.unwrap_or(0),
            stream_size,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_crc32.to_le_bytes());
        buf[16..20].copy_from_slice(&self.stream_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            data_crc32: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            stream_size: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), FormatViolation> {
        if self.magic != EOF_MAGIC {
            return Err(FormatViolation::BadMagic);
        }
        Ok(())
    }

    /// The recorded CRC, if the writer was able to accumulate one
    pub fn crc(&self) -> Option<u32> {
        if self.flags & Self::FLAG_HAS_CRC32 != 0 {
            Some(self.data_crc32)
        } else {
            None
        }
    }
}

const HEADER: u64 = EntryHeader::SIZE as u64;
const EOF: u64 = EntryEof::SIZE as u64;

/// Offset of stream 1's payload within the combined file
pub fn stream1_data_offset(key_len: u64) -> u64 {
    HEADER + key_len
}

/// Offset of stream 1's EOF record
pub fn stream1_eof_offset(key_len: u64, stream1_size: u64) -> u64 {
    stream1_data_offset(key_len) + stream1_size
}

/// Offset of stream 0's payload; depends on stream 1's current size
pub fn stream0_data_offset(key_len: u64, stream1_size: u64) -> u64 {
    stream1_eof_offset(key_len, stream1_size) + EOF
}

/// Exact length of a closed combined file: no slack before or after the
/// records
pub fn combined_file_size(key_len: u64, stream0_size: u64, stream1_size: u64) -> u64 {
    stream0_data_offset(key_len, stream1_size) + stream0_size + EOF
}

/// Offset of stream 2's payload within its own file
pub fn stream2_data_offset(key_len: u64) -> u64 {
    HEADER + key_len
}

/// Exact length of a closed stream-2 file
pub fn stream2_file_size(key_len: u64, stream2_size: u64) -> u64 {
    stream2_data_offset(key_len) + stream2_size + EOF
}

/// Recover stream 1's size from the combined file length and the stream-0
/// size read out of the trailing EOF record. Fails on any length that could
/// not have been produced by a complete close.
pub fn split_combined_file(
    file_size: u64,
    key_len: u64,
    stream0_size: u64,
) -> std::result::Result<u64, FormatViolation> {
    let fixed = HEADER + key_len + 2 * EOF + stream0_size;
    file_size.checked_sub(fixed).ok_or(FormatViolation::TruncatedRead)
}

/// Which on-disk file a directory-scan filename refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `{hash}_0` (streams 0 and 1) or `{hash}_1` (stream 2)
    Stream(u8),
    /// `{hash}_s`
    Sparse,
}

/// Filename of one of the entry's two stream-bearing files
pub fn stream_file_name(hash: EntryHash, file_index: u8) -> String {
    format!("{hash}_{file_index}")
}

/// Filename of the entry's sparse side file
pub fn sparse_file_name(hash: EntryHash) -> String {
    format!("{hash}_s")
}

/// Parse a cache-directory filename back into its hash and file kind; used
/// by the directory-scan index rebuild
pub fn parse_file_name(name: &str) -> Option<(EntryHash, FileKind)> {
    let (hex, suffix) = name.split_at_checked(16)?;
    let hash = EntryHash::from_hex(hex)?;
    match suffix {
        "_0" => Some((hash, FileKind::Stream(0))),
        "_1" => Some((hash, FileKind::Stream(1))),
        "_s" => Some((hash, FileKind::Sparse)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::entry_hash;

    #[test]
    fn header_round_trip() {
        let header = EntryHeader::new("some/key");
        let decoded = EntryHeader::decode(&header.encode());
        assert_eq!(decoded, header);
        assert!(decoded.validate().is_ok());
        assert!(decoded.validate_key("some/key").is_ok());
        assert_eq!(
            decoded.validate_key("other/key"),
            Err(FormatViolation::KeyMismatch)
        );
    }

    #[test]
    fn header_rejects_bad_magic_and_version() {
        let mut header = EntryHeader::new("k");
        header.magic ^= 1;
        assert_eq!(header.validate(), Err(FormatViolation::BadMagic));

        let mut header = EntryHeader::new("k");
        header.version = FORMAT_VERSION + 1;
        assert_eq!(header.validate(), Err(FormatViolation::BadVersion));
    }

    #[test]
    fn eof_crc_flag() {
        let eof = EntryEof::new(Some(0xdead_beef), 7);
        let decoded = EntryEof::decode(&eof.encode());
        assert_eq!(decoded.crc(), Some(0xdead_beef));
        assert_eq!(decoded.stream_size, 7);

        let eof = EntryEof::new(None, 0);
        assert_eq!(EntryEof::decode(&eof.encode()).crc(), None);
    }

    #[test]
    fn combined_layout_has_no_slack() {
        let key_len = 11u64;
        let (s0, s1) = (100u64, 40u64);
        let size = combined_file_size(key_len, s0, s1);
        assert_eq!(
            size,
            EntryHeader::SIZE as u64 + key_len + s1 + s0 + 2 * EntryEof::SIZE as u64
        );
        assert_eq!(split_combined_file(size, key_len, s0), Ok(s1));
        assert_eq!(
            split_combined_file(size - s1 - 1, key_len, s0),
            Err(FormatViolation::TruncatedRead)
        );
    }

    #[test]
    fn stream0_offset_tracks_stream1_size() {
        let key_len = 4;
        assert_eq!(
            stream0_data_offset(key_len, 10),
            stream0_data_offset(key_len, 0) + 10
        );
    }

    #[test]
    fn file_name_round_trip() {
        let hash = entry_hash("a key");
        assert_eq!(
            parse_file_name(&stream_file_name(hash, 0)),
            Some((hash, FileKind::Stream(0)))
        );
        assert_eq!(
            parse_file_name(&stream_file_name(hash, 1)),
            Some((hash, FileKind::Stream(1)))
        );
        assert_eq!(
            parse_file_name(&sparse_file_name(hash)),
            Some((hash, FileKind::Sparse))
        );
        assert_eq!(parse_file_name("the-index"), None);
        assert_eq!(parse_file_name(&format!("{hash}_2")), None);
    }
}
