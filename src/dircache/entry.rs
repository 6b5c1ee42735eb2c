//! Directory Cache Entry Types
//!
//! A cache entry is either a directory marker (the directory has been seen,
//! and possibly listed) or a file that lives in a marked directory. Entries
//! are arena-allocated and linked by [`EntryId`] rather than by pointer.

use std::fmt;

use bytes::Bytes;

/// Hash value of an entry's name (djb2 over the name bytes)
pub type HashValue = u32;

/// Stable index of an entry in the table arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(super) u32);

impl EntryId {
    #[inline]
    pub(super) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Hand-off state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Inserted or changed since the last new-entries hand-off
    New,
    /// Included in a new-entries hand-off
    Used,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryState::New => write!(f, "HASH_ENTRY_STATUS_NEW"),
            EntryState::Used => write!(f, "HASH_ENTRY_STATUS_USED"),
        }
    }
}

/// Where the resolved content of a file lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionStatus {
    /// Nothing resolved yet
    #[default]
    NotSet,
    /// Content was copied to node-local storage
    LocalPath,
    /// Content is served from its global path
    GlobalPath,
    /// Status could not be determined
    Unknown,
}

/// Resolved content attached to a file entry
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Where the content lives
    pub status: ResolutionStatus,
    /// Node-local copy of the file
    pub local_path: Option<String>,
    /// Small-file payload kept in memory
    pub buffer: Option<Bytes>,
    /// Symlink target, if the file is a link
    pub alias_target: Option<String>,
    /// errno observed when the file was opened (0 = success)
    pub errcode: i32,
}

/// Scan state of a directory marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryState {
    /// Known only because a child was inserted before any listing
    Unscanned,
    /// Listed successfully
    Exists,
    /// Listing failed; the directory is treated as absent
    Missing,
}

/// Tagged entry payload
#[derive(Debug, Clone)]
pub enum EntryKind {
    /// Directory marker, head of the per-directory child chain
    Directory {
        state: DirectoryState,
        first_child: Option<EntryId>,
    },
    /// File (or sub-directory) discovered inside `dir`
    File {
        dir: String,
        resolution: Resolution,
        next_in_dir: Option<EntryId>,
    },
}

/// One slot of the directory cache
#[derive(Debug, Clone)]
pub struct DirCacheEntry {
    pub(super) name: String,
    pub(super) hash: HashValue,
    pub(super) state: EntryState,
    pub(super) kind: EntryKind,
    pub(super) hash_next: Option<EntryId>,
}

impl DirCacheEntry {
    pub(super) fn directory(name: &str, hash: HashValue, state: DirectoryState) -> Self {
        Self {
            name: name.to_string(),
            hash,
            state: EntryState::New,
            kind: EntryKind::Directory {
                state,
                first_child: None,
            },
            hash_next: None,
        }
    }

    pub(super) fn file(name: &str, dir: &str, hash: HashValue) -> Self {
        Self {
            name: name.to_string(),
            hash,
            state: EntryState::New,
            kind: EntryKind::File {
                dir: dir.to_string(),
                resolution: Resolution::default(),
                next_in_dir: None,
            },
            hash_next: None,
        }
    }

    /// Entry name: the bare filename, or the full path for a directory marker
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Containing directory; a marker reports its own name
    pub fn dirname(&self) -> &str {
        match &self.kind {
            EntryKind::Directory { .. } => &self.name,
            EntryKind::File { dir, .. } => dir,
        }
    }

    /// Hash of the entry name
    pub fn hash(&self) -> HashValue {
        self.hash
    }

    /// Bookkeeping state
    pub fn state(&self) -> EntryState {
        self.state
    }

    /// True for directory markers
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory { .. })
    }

    /// Scan state, for directory markers
    pub fn directory_state(&self) -> Option<DirectoryState> {
        match &self.kind {
            EntryKind::Directory { state, .. } => Some(*state),
            EntryKind::File { .. } => None,
        }
    }

    /// Resolved content, for file entries
    pub fn resolution(&self) -> Option<&Resolution> {
        match &self.kind {
            EntryKind::File { resolution, .. } => Some(resolution),
            EntryKind::Directory { .. } => None,
        }
    }

    pub(super) fn resolution_mut(&mut self) -> Option<&mut Resolution> {
        match &mut self.kind {
            EntryKind::File { resolution, .. } => Some(resolution),
            EntryKind::Directory { .. } => None,
        }
    }

    pub(super) fn next_in_dir(&self) -> Option<EntryId> {
        match &self.kind {
            EntryKind::Directory { first_child, .. } => *first_child,
            EntryKind::File { next_in_dir, .. } => *next_in_dir,
        }
    }

    pub(super) fn set_next_in_dir(&mut self, next: Option<EntryId>) {
        match &mut self.kind {
            EntryKind::Directory { first_child, .. } => *first_child = next,
            EntryKind::File { next_in_dir, .. } => *next_in_dir = next,
        }
    }

    pub(super) fn matches_file(&self, hash: HashValue, filename: &str, dirname: &str) -> bool {
        match &self.kind {
            EntryKind::File { dir, .. } => {
                self.hash == hash && self.name == filename && dir == dirname
            }
            EntryKind::Directory { .. } => false,
        }
    }

    pub(super) fn matches_directory(&self, hash: HashValue, dirname: &str) -> bool {
        self.is_directory() && self.hash == hash && self.name == dirname
    }
}
