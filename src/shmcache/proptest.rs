//! Property-Based Tests for the Shared Cache
//!
//! # Test Properties
//!
//! 1. **Heap integrity**: any alloc/free sequence leaves a well-formed heap
//! 2. **Isolation**: live allocations never overlap
//! 3. **Budget**: the shared cache never holds more than its byte limit
//! 4. **Read-your-write**: `update(k, v)` then `lookup_or_add(k)` yields `v`

#![cfg(test)]

use proptest::prelude::*;

use super::sheep::tests::TestHeap;
use super::{CachedValue, Lookup, ShmCache, ShmCacheConfig};

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum HeapOp {
    Alloc(usize),
    /// Free the n-th live allocation (modulo count)
    Free(usize),
}

fn heap_op_strategy() -> impl Strategy<Value = HeapOp> {
    prop_oneof![
        3 => (0usize..300).prop_map(HeapOp::Alloc),
        2 => any::<usize>().prop_map(HeapOp::Free),
    ]
}

fn key_strategy() -> impl Strategy<Value = String> {
    "/[a-z]{1,6}/[a-z0-9._]{1,12}"
}

// =============================================================================
// Allocator Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Property: the heap stays well-formed and allocations keep their contents.
    #[test]
    fn prop_heap_integrity(ops in prop::collection::vec(heap_op_strategy(), 1..200)) {
        let heap = TestHeap::new(16 * 1024);
        let sheep = heap.sheep();
        let mut live: Vec<(super::SheepPtr, Vec<u8>)> = Vec::new();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                HeapOp::Alloc(size) => {
                    if let Some(ptr) = sheep.alloc(size) {
                        prop_assert!(sheep.alloc_size(ptr) >= size);
                        let fill = vec![(step % 251) as u8; size];
                        sheep.write_bytes(ptr, &fill);
                        live.push((ptr, fill));
                    }
                }
                HeapOp::Free(n) => {
                    if !live.is_empty() {
                        let (ptr, _) = live.swap_remove(n % live.len());
                        sheep.free(ptr);
                    }
                }
            }
            let check = sheep.check();
            prop_assert!(check.is_ok(), "heap corrupt: {:?}", check);
        }

        // Every live block still holds what was written to it
        for (ptr, fill) in &live {
            prop_assert_eq!(&sheep.read_bytes(*ptr, fill.len()), fill);
        }

        for (ptr, _) in live {
            sheep.free(ptr);
        }
        let check = sheep.check().unwrap();
        prop_assert_eq!(check.blocks, 1);
        prop_assert_eq!(check.used_bytes, 0);
    }
}

// =============================================================================
// Cache Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: used bytes never exceed the budget, whatever gets inserted.
    #[test]
    fn prop_cache_respects_budget(
        entries in prop::collection::vec((key_strategy(), "[a-z/]{0,64}"), 1..150),
    ) {
        let cache = ShmCache::open(ShmCacheConfig {
            segment_size: 128 * 1024,
            heap_limit: 2048,
            ..Default::default()
        })?;
        for (key, value) in &entries {
            cache.add(key, Some(value))?;
            let stats = cache.stats();
            prop_assert!(stats.used_bytes <= stats.limit_bytes);
        }
        prop_assert!(cache.check_heap().is_ok());
    }

    /// Property: the last value written for a key is the one read back.
    #[test]
    fn prop_update_then_lookup(key in key_strategy(), value in "[a-zA-Z0-9/._-]{1,128}") {
        let cache = ShmCache::open(ShmCacheConfig {
            segment_size: 128 * 1024,
            heap_limit: 32 * 1024,
            ..Default::default()
        })?;
        prop_assert_eq!(cache.lookup_or_add(&key)?, Lookup::NotFound);
        cache.update(&key, Some(&value))?;
        prop_assert_eq!(
            cache.lookup_or_add(&key)?,
            Lookup::Found(CachedValue::Resolved(value))
        );
    }
}
