//! Fixed-Bucket Hash Table
//!
//! Entries live in an append-only arena and are chained per bucket through
//! `hash_next`. Nothing is ever removed: the directory cache is kept for the
//! lifetime of the server.

use super::entry::{DirCacheEntry, EntryId, HashValue};
use super::HASH_SIZE;

/// djb2 string hash: `hash = hash * 33 + byte`, seeded with 5381
#[inline]
pub fn hash_value(name: &str) -> HashValue {
    name.bytes().fold(5381u32, |hash, byte| {
        hash.wrapping_shl(5)
            .wrapping_add(hash)
            .wrapping_add(byte as u32)
    })
}

/// Bucketed hash table over an entry arena
pub struct HashTable {
    buckets: Box<[Option<EntryId>]>,
    entries: Vec<DirCacheEntry>,
}

impl Default for HashTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HashTable {
    /// Create an empty table with `HASH_SIZE` buckets
    pub fn new() -> Self {
        Self {
            buckets: vec![None; HASH_SIZE].into_boxed_slice(),
            entries: Vec::new(),
        }
    }

    #[inline]
    pub fn bucket_of(hash: HashValue) -> usize {
        hash as usize % HASH_SIZE
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry to the tail of its bucket chain
    pub fn insert(&mut self, entry: DirCacheEntry) -> EntryId {
        let id = EntryId(self.entries.len() as u32);
        let bucket = Self::bucket_of(entry.hash);
        self.entries.push(entry);

        match self.buckets[bucket] {
            None => self.buckets[bucket] = Some(id),
            Some(head) => {
                let mut cur = head;
                while let Some(next) = self.entries[cur.index()].hash_next {
                    cur = next;
                }
                self.entries[cur.index()].hash_next = Some(id);
            }
        }
        id
    }

    #[inline]
    pub fn get(&self, id: EntryId) -> &DirCacheEntry {
        &self.entries[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: EntryId) -> &mut DirCacheEntry {
        &mut self.entries[id.index()]
    }

    /// First entry in the chain for `hash` that satisfies `pred`
    pub fn find<F>(&self, hash: HashValue, pred: F) -> Option<EntryId>
    where
        F: Fn(&DirCacheEntry) -> bool,
    {
        let mut cur = self.buckets[Self::bucket_of(hash)];
        while let Some(id) = cur {
            let entry = self.get(id);
            if pred(entry) {
                return Some(id);
            }
            cur = entry.hash_next;
        }
        None
    }

    /// All entries in bucket order, paired with their bucket index
    pub fn iter(&self) -> impl Iterator<Item = (usize, &DirCacheEntry)> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .flat_map(move |(index, head)| ChainIter {
                table: self,
                cur: *head,
            }
            .map(move |entry| (index, entry)))
    }

    /// All entries in insertion order with their ids
    pub fn enumerate(&self) -> impl Iterator<Item = (EntryId, &DirCacheEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (EntryId(index as u32), entry))
    }

    /// Entries linked from `start` through the per-directory chain
    pub fn dir_chain(&self, start: Option<EntryId>) -> DirChainIter<'_> {
        DirChainIter { table: self, cur: start }
    }
}

struct ChainIter<'a> {
    table: &'a HashTable,
    cur: Option<EntryId>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a DirCacheEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let entry = self.table.get(id);
        self.cur = entry.hash_next;
        Some(entry)
    }
}

/// Iterator over a directory's children
pub struct DirChainIter<'a> {
    table: &'a HashTable,
    cur: Option<EntryId>,
}

impl<'a> Iterator for DirChainIter<'a> {
    type Item = &'a DirCacheEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let entry = self.table.get(id);
        self.cur = entry.next_in_dir();
        Some(entry)
    }
}

// =============================================================================
// Tests
// =============================================================================
