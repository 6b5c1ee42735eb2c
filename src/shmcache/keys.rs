//! Key Namespaces and Value Encodings
//!
//! One shared table serves several logical caches. Each kind prefixes its
//! keys so they never collide:
//!
//! | Kind        | Key                  | Value                      |
//! |-------------|----------------------|----------------------------|
//! | resolve     | `path`               | local path or `ERRNO:n`    |
//! | stat        | `*path`              | stat record path or `ERRNO:n` |
//! | lstat       | `**path`             | stat record path or `ERRNO:n` |
//! | exists      | `&path`              | `y` / `n`                  |
//! | dir marker  | `^dir`               | `NODR`                     |
//! | loader info | `LDSOINFO:path`      | loader record path or `ERRNO:n` |
//! | python      | `:PYTHONPREFIX`      | colon-separated prefixes   |

use crate::domain::paths::{absolute, parent_dir};

/// Errno the server reports when the parent directory does not exist
pub const SPINDLE_ENODIR: i32 = -68;

/// Value stored under a `^dir` key for a missing directory
pub const NODIR_MARKER: &str = "NODR";

/// Singleton key for the Python prefix list
pub const PYTHON_PREFIX_KEY: &str = ":PYTHONPREFIX";

const ERRNO_PREFIX: &str = "ERRNO:";

/// Logical cache a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Resolve,
    Stat,
    Lstat,
    Exists,
    DirMarker,
    LoaderInfo,
}

impl CacheKind {
    pub fn prefix(self) -> &'static str {
        match self {
            CacheKind::Resolve => "",
            CacheKind::Stat => "*",
            CacheKind::Lstat => "**",
            CacheKind::Exists => "&",
            CacheKind::DirMarker => "^",
            CacheKind::LoaderInfo => "LDSOINFO:",
        }
    }
}

/// Cache key plus the `^dir` key of its parent directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    pub key: String,
    /// `None` for bare names, which are resolved through the search path
    pub dir_key: Option<String>,
}

/// Build the keys for a query on `path`.
///
/// A bare name with `search` set is keyed as-is, since its answer depends on
/// the search path rather than the working directory.
pub fn cache_keys(kind: CacheKind, path: &str, cwd: &str, search: bool) -> CacheKeys {
    if search && !path.contains('/') {
        return CacheKeys {
            key: format!("{}{}", kind.prefix(), path),
            dir_key: None,
        };
    }
    let abs = absolute(path, cwd);
    CacheKeys {
        key: format!("{}{}", kind.prefix(), abs),
        dir_key: Some(dir_key(parent_dir(&abs))),
    }
}

/// `^dir` key for a directory
pub fn dir_key(dir: &str) -> String {
    format!("{}{}", CacheKind::DirMarker.prefix(), dir)
}

/// Encode a negative answer
pub fn encode_errno(errno: i32) -> String {
    format!("{}{}", ERRNO_PREFIX, errno)
}

/// Decode a negative answer; `None` if `value` is a real result
pub fn decode_errno(value: &str) -> Option<i32> {
    value.strip_prefix(ERRNO_PREFIX)?.parse().ok()
}

pub fn encode_exists(exists: bool) -> &'static str {
    if exists {
        "y"
    } else {
        "n"
    }
}

pub fn decode_exists(value: &str) -> bool {
    value.starts_with('y')
}
