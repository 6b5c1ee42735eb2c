//! Shared-Memory LRU Cache
//!
//! Per-node cache shared by every co-resident process through a mapped
//! segment. Built on the sheep relative-pointer allocator so the segment may
//! sit at a different address in each process.
//!
//! # Components
//!
//! - [`sheep`]: arena allocator with segment-relative pointers
//! - [`segment`]: file-backed or anonymous mapping, one-time initialisation
//! - [`lock`]: cross-process spinlock with dead-holder recovery
//! - [`ShmCache`]: hash table, LRU list, owner election, eviction
//! - [`keys`]: key prefixes and value encodings shared with the client

mod cache;
pub mod keys;
pub mod lock;
mod metrics;
pub mod segment;
pub mod sheep;

#[cfg(test)]
mod proptest;

pub use cache::{
    CachedValue, Lookup, ShmCache, ShmCacheConfig, ShmCacheStats, DEFAULT_HEAP_LIMIT,
    DEFAULT_SEGMENT_SIZE, MAX_KEY_LEN, NUM_BUCKETS,
};
pub use keys::CacheKind;
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use segment::Segment;
pub use sheep::SheepPtr;
