//! Flat-file disk cache
//!
//! A disk cache that stores each entry in its own files under one flat
//! directory, with an in-memory index for membership, recency and size
//! accounting. Entries are addressed by string key and carry three data
//! streams plus an independent sparse byte space for partial content.
//!
//! - Stream 0 is small metadata, held fully in memory while an entry is
//!   open and checksummed on every load
//! - Streams 1 and 2 live on disk with lazy CRC validation
//! - The sparse space stores arbitrary byte ranges in a side file
//!
//! The index persists across restarts and rebuilds itself from a directory
//! scan whenever the persisted copy is missing, damaged, or older than the
//! cache directory. Once total size crosses the high watermark, the least
//! recently used entries are evicted until the cache is back under the low
//! watermark.
//!
//! ```no_run
//! use flatcache::{CacheConfig, FlatCache};
//!
//! # async fn demo() -> flatcache::Result<()> {
//! let cache = FlatCache::new(CacheConfig::new("/tmp/demo-cache")).await?;
//! let entry = cache.create_entry("http://example.com/style.css").await?;
//! entry.write_stream(1, 0, b"body { margin: 0 }", false).await?;
//! drop(entry);
//!
//! let entry = cache.open_entry("http://example.com/style.css").await?;
//! let body = entry.read_stream(1, 0, 4096).await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod entry;
pub mod errors;
pub mod format;
pub mod hashing;
pub mod index;
mod sparse;
mod sync_entry;

pub use backend::{EntryIter, FlatCache};
pub use config::CacheConfig;
pub use entry::Entry;
pub use errors::{CacheError, FormatViolation, Result};
pub use hashing::{entry_hash, EntryHash};
