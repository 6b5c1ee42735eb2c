//! Hash Directory Cache
//!
//! Server-side memo of filesystem scans. A fixed-bucket hash table keyed by
//! filename, with every file entry scoped to a directory marker.
//!
//! # Design
//!
//! ```text
//! bucket[h("libc.so")] ─▶ File{libc.so, /lib} ─▶ File{libc.so, /usr/lib}
//! bucket[h("/lib")]    ─▶ Directory{/lib, Exists}
//!                              │ first_child
//!                              ▼
//!                         File{libm.so} ─▶ File{libc.so} ─▶ ...
//! ```
//!
//! - Collisions are chained through `hash_next`.
//! - Each directory marker roots a second chain over its children so a
//!   listing never walks the whole table.
//! - Entries are never removed.

mod cache;
pub mod codec;
mod entry;
mod table;

#[cfg(test)]
mod proptest;

pub use cache::{DirLookup, DirectoryCache, EntryUpdate, FileLookup, ScanStats};
pub use codec::{encode_listing, encode_records, DirBufferIter, DirRecord};
pub use entry::{DirCacheEntry, DirectoryState, EntryState, Resolution, ResolutionStatus};
pub use table::hash_value;

/// Number of hash buckets
pub const HASH_SIZE: usize = 10 * 1024;

/// Longest filename or directory name accepted
pub const MAX_PATH_LEN: usize = 4096;

/// Dirname column printed by `dump` for a directory that could not be listed
pub const SENTINEL_CHILD: &str = "-";
