//! Hash Directory Cache
//!
//! Server-side record of which directories have been listed and what each
//! listing found. Each directory is read from the real filesystem at most
//! once per server lifetime; a directory that cannot be opened is recorded
//! as missing so later lookups under it short-circuit.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, instrument, trace};

use super::codec::{encode_listing, encode_records, DirBufferIter, DirRecord};
use super::entry::{
    DirCacheEntry, DirectoryState, EntryId, EntryKind, EntryState, ResolutionStatus,
};
use super::table::{hash_value, HashTable};
use super::{MAX_PATH_LEN, SENTINEL_CHILD};
use crate::error::{Error, Result};

/// Outcome of a directory existence test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirLookup {
    /// Listed and present
    ParsedExists,
    /// Listed (or attempted) and absent
    ParsedNotExists,
    /// Never listed
    NotParsed,
}

impl std::fmt::Display for DirLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirLookup::ParsedExists => write!(f, "parsed and exists"),
            DirLookup::ParsedNotExists => write!(f, "parsed and doesn't exist"),
            DirLookup::NotParsed => write!(f, "not parsed"),
        }
    }
}

/// Outcome of a scoped file lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLookup {
    /// Entry exists; `local_path` is set once content was stored locally
    Found {
        local_path: Option<String>,
        errcode: i32,
    },
    NotFound,
}

impl FileLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, FileLookup::Found { .. })
    }
}

/// Content attached to an entry once the real file has been opened
#[derive(Debug, Clone, Default)]
pub struct EntryUpdate {
    pub local_path: Option<String>,
    pub buffer: Option<Bytes>,
    pub alias_target: Option<String>,
    pub errcode: i32,
}

/// Counters for filesystem work done by the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Directories listed from the real filesystem
    pub directories_scanned: u64,
    /// Directory entries read across all listings
    pub entries_read: u64,
    /// Listings that failed (directory missing or unreadable)
    pub failed_scans: u64,
}

/// Server-side directory/file hash cache
#[derive(Default)]
pub struct DirectoryCache {
    table: HashTable,
    stats: ScanStats,
}

impl DirectoryCache {
    /// Create an empty cache
    pub fn init() -> Self {
        Self::default()
    }

    /// Number of entries, markers included
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Filesystem work counters
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    fn marker(&self, dirname: &str) -> Option<EntryId> {
        if dirname.len() > MAX_PATH_LEN {
            return None;
        }
        let hash = hash_value(dirname);
        self.table
            .find(hash, |e| e.matches_directory(hash, dirname))
    }

    fn file(&self, filename: &str, dirname: &str) -> Option<EntryId> {
        if filename.len() > MAX_PATH_LEN || dirname.len() > MAX_PATH_LEN {
            return None;
        }
        let hash = hash_value(filename);
        self.table
            .find(hash, |e| e.matches_file(hash, filename, dirname))
    }

    /// Existence test for a directory
    pub fn find_directory(&self, dirname: &str) -> DirLookup {
        let state = self
            .marker(dirname)
            .and_then(|id| self.table.get(id).directory_state());
        match state {
            Some(DirectoryState::Exists) => DirLookup::ParsedExists,
            Some(DirectoryState::Missing) => DirLookup::ParsedNotExists,
            Some(DirectoryState::Unscanned) | None => DirLookup::NotParsed,
        }
    }

    /// Directory-scoped file lookup
    pub fn find_file(&self, filename: &str, dirname: &str) -> FileLookup {
        match self.file(filename, dirname) {
            Some(id) => {
                let resolution = self.table.get(id).resolution();
                match resolution {
                    Some(r) if r.status == ResolutionStatus::LocalPath => FileLookup::Found {
                        local_path: r.local_path.clone(),
                        errcode: r.errcode,
                    },
                    _ => FileLookup::Found {
                        local_path: None,
                        errcode: 0,
                    },
                }
            }
            None => FileLookup::NotFound,
        }
    }

    /// Symlink target recorded for a file
    pub fn get_alias(&self, filename: &str, dirname: &str) -> Option<&str> {
        let id = self.file(filename, dirname)?;
        self.table
            .get(id)
            .resolution()
            .and_then(|r| r.alias_target.as_deref())
    }

    /// Inline payload and alias recorded for a file
    pub fn get_buffer(&self, filename: &str, dirname: &str) -> Option<(Option<Bytes>, Option<String>)> {
        let id = self.file(filename, dirname)?;
        self.table
            .get(id)
            .resolution()
            .map(|r| (r.buffer.clone(), r.alias_target.clone()))
    }

    /// Resolution status of a file, `Unknown` if not cached
    pub fn get_status(&self, filename: &str, dirname: &str) -> ResolutionStatus {
        self.file(filename, dirname)
            .and_then(|id| self.table.get(id).resolution())
            .map(|r| r.status)
            .unwrap_or(ResolutionStatus::Unknown)
    }

    /// Cached children of a directory (most recently inserted first)
    pub fn children(&self, dirname: &str) -> Vec<&str> {
        let first = self
            .marker(dirname)
            .and_then(|id| self.table.get(id).next_in_dir());
        self.table.dir_chain(first).map(|e| e.name()).collect()
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    fn check_len(path: &str) -> Result<()> {
        if path.len() > MAX_PATH_LEN {
            return Err(Error::PathTooLong {
                path: path.chars().take(64).collect(),
                len: path.len(),
                max: MAX_PATH_LEN,
            });
        }
        Ok(())
    }

    /// Insert a directory marker, or upgrade an unscanned one
    fn mark_directory(&mut self, dirname: &str, state: DirectoryState) -> EntryId {
        if let Some(id) = self.marker(dirname) {
            let entry = self.table.get_mut(id);
            if let EntryKind::Directory { state: cur, .. } = &mut entry.kind {
                if *cur == DirectoryState::Unscanned && state != DirectoryState::Unscanned {
                    *cur = state;
                    entry.state = EntryState::New;
                }
            }
            return id;
        }
        let hash = hash_value(dirname);
        self.table
            .insert(DirCacheEntry::directory(dirname, hash, state))
    }

    /// Insert a child entry under `dirname`, creating an unscanned marker if needed.
    /// Returns the existing entry when the child is already cached.
    fn insert_child(&mut self, dirname: &str, filename: &str) -> EntryId {
        if let Some(id) = self.file(filename, dirname) {
            return id;
        }
        let dir_id = self.mark_directory(dirname, DirectoryState::Unscanned);
        let hash = hash_value(filename);
        let id = self.table.insert(DirCacheEntry::file(filename, dirname, hash));

        let head = self.table.get(dir_id).next_in_dir();
        self.table.get_mut(id).set_next_in_dir(head);
        self.table.get_mut(dir_id).set_next_in_dir(Some(id));
        id
    }

    /// Record a child discovered without listing its directory
    pub fn add_file(&mut self, dirname: &str, filename: &str) -> Result<()> {
        Self::check_len(dirname)?;
        Self::check_len(filename)?;
        trace!(dir = %dirname, file = %filename, "Adding file to directory cache");
        self.insert_child(dirname, filename);
        Ok(())
    }

    /// Record that a directory could not be listed
    pub fn add_missing_directory(&mut self, dirname: &str) -> Result<()> {
        Self::check_len(dirname)?;
        debug!(dir = %dirname, "Adding missing directory to cache");
        self.mark_directory(dirname, DirectoryState::Missing);
        Ok(())
    }

    /// List a directory once and cache every member
    #[instrument(skip(self), level = "debug")]
    pub fn scan_directory(&mut self, dirname: &str) -> Result<DirLookup> {
        Self::check_len(dirname)?;

        let current = self.find_directory(dirname);
        if current != DirLookup::NotParsed {
            trace!(dir = %dirname, "Directory already parsed");
            return Ok(current);
        }

        self.stats.directories_scanned += 1;
        let reader = match fs::read_dir(dirname) {
            Ok(reader) => reader,
            Err(e) => {
                debug!(dir = %dirname, error = %e, "Could not open directory, recording as missing");
                self.stats.failed_scans += 1;
                self.mark_directory(dirname, DirectoryState::Missing);
                return Ok(DirLookup::ParsedNotExists);
            }
        };

        let mut names = Vec::new();
        for dent in reader {
            let dent = match dent {
                Ok(dent) => dent,
                Err(e) => {
                    debug!(dir = %dirname, error = %e, "Directory read interrupted");
                    break;
                }
            };
            self.stats.entries_read += 1;

            if !is_cacheable(&dent) {
                continue;
            }
            match dent.file_name().into_string() {
                Ok(name) if name.len() <= MAX_PATH_LEN => names.push(name),
                Ok(name) => trace!(dir = %dirname, len = name.len(), "Skipping overlong name"),
                Err(raw) => trace!(dir = %dirname, name = ?raw, "Skipping non UTF-8 name"),
            }
        }

        self.mark_directory(dirname, DirectoryState::Exists);
        for name in &names {
            self.insert_child(dirname, name);
        }

        debug!(dir = %dirname, entries = names.len(), "Directory scanned");
        Ok(DirLookup::ParsedExists)
    }

    /// Attach resolved content to a cached file.
    /// Returns false when the file is not in the cache.
    pub fn update_entry(&mut self, filename: &str, dirname: &str, update: EntryUpdate) -> Result<bool> {
        Self::check_len(dirname)?;
        Self::check_len(filename)?;

        let Some(id) = self.file(filename, dirname) else {
            return Ok(false);
        };

        debug!(
            dir = %dirname,
            file = %filename,
            local = ?update.local_path,
            size = update.buffer.as_ref().map(|b| b.len()).unwrap_or(0),
            errcode = update.errcode,
            "Updating directory cache entry"
        );

        let entry = self.table.get_mut(id);
        if let Some(r) = entry.resolution_mut() {
            r.local_path = update.local_path;
            r.buffer = update.buffer;
            r.alias_target = update.alias_target;
            r.errcode = update.errcode;
            r.status = ResolutionStatus::LocalPath;
        }
        Ok(true)
    }

    /// Set the resolution status of a cached file and mark it new.
    /// Returns false when the file is not in the cache.
    pub fn update_status(&mut self, filename: &str, dirname: &str, status: ResolutionStatus) -> bool {
        let Some(id) = self.file(filename, dirname) else {
            return false;
        };
        let entry = self.table.get_mut(id);
        entry.state = EntryState::New;
        if let Some(r) = entry.resolution_mut() {
            r.status = status;
        }
        true
    }

    // =========================================================================
    // Bulk hand-off
    // =========================================================================

    /// Encode every cached child of a directory
    pub fn serialize_directory(&self, dirname: &str) -> Result<Bytes> {
        Self::check_len(dirname)?;
        let exists = self.find_directory(dirname) != DirLookup::ParsedNotExists;
        let children = self.children(dirname);
        debug!(dir = %dirname, entries = children.len(), exists, "Encoding directory listing");
        Ok(encode_listing(dirname, exists, children))
    }

    /// Encode every entry inserted or changed since the previous call and mark
    /// it used, so a relay can be kept current with deltas only.
    ///
    /// Files are handed off once their directory has been listed, and markers
    /// once their directory is known to exist or be missing. Anything else
    /// stays new for a later call.
    pub fn serialize_new_entries(&mut self) -> Bytes {
        let mut records = Vec::new();
        let mut handed = Vec::new();
        for (id, entry) in self.table.enumerate() {
            if entry.state() != EntryState::New {
                continue;
            }
            let record = match &entry.kind {
                EntryKind::File { dir, .. } => (self.find_directory(dir) == DirLookup::ParsedExists)
                    .then(|| DirRecord::File {
                        name: entry.name().to_string(),
                        dir: dir.clone(),
                    }),
                EntryKind::Directory { state, .. } => match state {
                    DirectoryState::Exists => Some(DirRecord::EmptyDirectory {
                        dir: entry.name().to_string(),
                    }),
                    DirectoryState::Missing => Some(DirRecord::MissingDirectory {
                        dir: entry.name().to_string(),
                    }),
                    DirectoryState::Unscanned => None,
                },
            };
            if let Some(record) = record {
                records.push(record);
                handed.push(id);
            }
        }

        for id in handed {
            self.table.get_mut(id).state = EntryState::Used;
        }
        debug!(entries = records.len(), "Encoding new directory cache entries");
        encode_records(&records)
    }

    /// Insert the contents of an encoded listing. Returns the number of records applied.
    pub fn apply_directory_buffer(&mut self, buf: &[u8]) -> Result<usize> {
        let mut applied = 0;
        for record in DirBufferIter::new(buf) {
            match record? {
                DirRecord::File { name, dir } => {
                    Self::check_len(&dir)?;
                    Self::check_len(&name)?;
                    self.mark_directory(&dir, DirectoryState::Exists);
                    self.insert_child(&dir, &name);
                }
                DirRecord::EmptyDirectory { dir } => {
                    Self::check_len(&dir)?;
                    self.mark_directory(&dir, DirectoryState::Exists);
                }
                DirRecord::MissingDirectory { dir } => {
                    self.add_missing_directory(&dir)?;
                }
            }
            applied += 1;
        }
        Ok(applied)
    }

    // =========================================================================
    // Debugging
    // =========================================================================

    /// Write one line per entry: `index: hash filename dirname state`
    pub fn dump<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for (index, entry) in self.table.iter() {
            let dirname = match entry.directory_state() {
                Some(DirectoryState::Missing) => SENTINEL_CHILD,
                _ => entry.dirname(),
            };
            writeln!(
                out,
                "{:4}: {:16} {} {} {}",
                index,
                entry.hash(),
                entry.name(),
                dirname,
                entry.state()
            )?;
        }
        Ok(())
    }

    /// Dump the cache into a file
    pub fn dump_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = io::BufWriter::new(fs::File::create(path)?);
        self.dump(&mut file)?;
        file.flush()?;
        Ok(())
    }
}

/// Regular files, symlinks, directories and entries of unknown type are cached
fn is_cacheable(dent: &fs::DirEntry) -> bool {
    match dent.file_type() {
        Ok(ft) => ft.is_file() || ft.is_symlink() || ft.is_dir(),
        Err(_) => true,
    }
}

// =============================================================================
// Tests
// =============================================================================
