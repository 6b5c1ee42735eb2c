//! Property-Based Tests for the Directory Cache
//!
//! # Test Properties
//!
//! 1. **Scoping**: a file added under one directory is never found under another
//! 2. **No duplicates**: re-adding a child leaves exactly one entry
//! 3. **Hand-off**: a relay applying a serialized listing sees the same children

#![cfg(test)]

use std::collections::BTreeSet;

use proptest::prelude::*;

use super::{DirLookup, DirectoryCache, FileLookup};

// =============================================================================
// Property Strategies
// =============================================================================

/// File names without slashes or NULs
fn name_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9._+-]{1,24}"
}

fn names_strategy() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set(name_strategy(), 1..40)
}

fn dir_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9]{1,8}", 1..4).prop_map(|parts| format!("/{}", parts.join("/")))
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: lookups only match the directory a file was added under.
    #[test]
    fn prop_lookup_is_directory_scoped(
        names in names_strategy(),
        dir in dir_strategy(),
        other in dir_strategy(),
    ) {
        prop_assume!(dir != other);
        let mut cache = DirectoryCache::init();
        for name in &names {
            cache.add_file(&dir, name)?;
        }
        for name in &names {
            prop_assert!(cache.find_file(name, &dir).is_found());
            prop_assert_eq!(cache.find_file(name, &other), FileLookup::NotFound);
        }
    }

    /// Property: adding the same child twice keeps a single entry.
    #[test]
    fn prop_children_are_unique(names in names_strategy(), dir in dir_strategy()) {
        let mut cache = DirectoryCache::init();
        for name in names.iter().chain(names.iter()) {
            cache.add_file(&dir, name)?;
        }
        let children: BTreeSet<String> =
            cache.children(&dir).into_iter().map(str::to_string).collect();
        prop_assert_eq!(cache.children(&dir).len(), names.len());
        prop_assert_eq!(children, names.clone());
        // One marker plus one entry per child
        prop_assert_eq!(cache.len(), names.len() + 1);
    }

    /// Property: a relay applying a listing ends up with the same children.
    #[test]
    fn prop_relay_sees_same_children(names in names_strategy(), dir in dir_strategy()) {
        let mut server = DirectoryCache::init();
        for name in &names {
            server.add_file(&dir, name)?;
        }
        let buf = server.serialize_directory(&dir)?;

        let mut relay = DirectoryCache::init();
        let applied = relay.apply_directory_buffer(&buf)?;
        prop_assert_eq!(applied, names.len());
        prop_assert_eq!(relay.find_directory(&dir), DirLookup::ParsedExists);
        for name in &names {
            prop_assert!(relay.find_file(name, &dir).is_found());
        }
    }
}
