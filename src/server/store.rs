//! Local Store
//!
//! Node-local copies of resolved files and their stat records.
//!
//! ```text
//! <root>/files/<global path>        relocated content
//! <root>/stat/<global path>.json    stat record
//! <root>/lstat/<global path>.json   lstat record
//! <root>/ldso/<global path>.json    loader info record
//! ```

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::domain::ports::ELF_HEADER_PREFIX;
use crate::domain::{LoaderInfo, StatRecord};
use crate::error::Result;

/// Result of copying a file into the store
#[derive(Debug, Clone)]
pub struct Relocated {
    pub local_path: String,
    /// Content, when small enough to keep in memory
    pub buffer: Option<Bytes>,
    /// Symlink target, when the global path is a link
    pub alias_target: Option<String>,
}

/// Node-local file store
pub struct LocalStore {
    root: PathBuf,
    inline_limit: usize,
    /// local path -> global path
    origins: HashMap<String, String>,
    /// (global path, lstat) -> stat record path, `None` if the file is missing
    stats: HashMap<(String, bool), Option<String>>,
    /// global path -> loader info record path, `None` if missing or not ELF
    loaders: HashMap<String, Option<String>>,
}

impl LocalStore {
    /// Open a store rooted at `root`, creating it if needed
    pub fn open(root: impl Into<PathBuf>, inline_limit: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), inline_limit, "Opened local store");
        Ok(Self {
            root,
            inline_limit,
            origins: HashMap::new(),
            stats: HashMap::new(),
            loaders: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mirror(&self, area: &str, global: &str, suffix: &str) -> PathBuf {
        let mut path = self.root.join(area);
        path.push(global.trim_start_matches('/'));
        if !suffix.is_empty() {
            let mut name = path.into_os_string();
            name.push(suffix);
            path = PathBuf::from(name);
        }
        path
    }

    /// Copy `global` into the store
    pub fn relocate(&mut self, global: &str) -> io::Result<Relocated> {
        let link_meta = fs::symlink_metadata(global)?;
        let alias_target = if link_meta.file_type().is_symlink() {
            Some(fs::read_link(global)?.to_string_lossy().into_owned())
        } else {
            None
        };

        let content = fs::read(global)?;
        let local = self.mirror("files", global, "");
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&local, &content)?;

        let local_path = local.to_string_lossy().into_owned();
        self.origins.insert(local_path.clone(), global.to_string());
        trace!(global, local = %local_path, size = content.len(), "Relocated file");

        let buffer = (content.len() <= self.inline_limit).then(|| Bytes::from(content));
        Ok(Relocated {
            local_path,
            buffer,
            alias_target,
        })
    }

    /// Write a stat record for `global`. `None` if the file does not exist.
    pub fn write_stat(&mut self, global: &str, lstat: bool, now: DateTime<Utc>) -> Result<Option<String>> {
        let key = (global.to_string(), lstat);
        if let Some(known) = self.stats.get(&key) {
            return Ok(known.clone());
        }

        let meta = if lstat {
            fs::symlink_metadata(global)
        } else {
            fs::metadata(global)
        };
        let meta = match meta {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.stats.insert(key, None);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let record = StatRecord::from_metadata(global, &meta, now);
        let area = if lstat { "lstat" } else { "stat" };
        let path = self.mirror(area, global, ".json");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_vec(&record)?)?;

        let path = path.to_string_lossy().into_owned();
        self.stats.insert(key, Some(path.clone()));
        Ok(Some(path))
    }

    /// Write the loader info record for `global`. `None` if the file is
    /// missing or is not an ELF file.
    pub fn write_loader_info(&mut self, global: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        if let Some(known) = self.loaders.get(global) {
            return Ok(known.clone());
        }

        let mut header = Vec::with_capacity(ELF_HEADER_PREFIX);
        match fs::File::open(global) {
            Ok(file) => {
                file.take(ELF_HEADER_PREFIX as u64).read_to_end(&mut header)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let Some(info) = LoaderInfo::parse(global, &header, now) else {
            debug!(path = global, "No loader info, not an ELF file");
            self.loaders.insert(global.to_string(), None);
            return Ok(None);
        };

        let path = self.mirror("ldso", global, ".json");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_vec(&info)?)?;

        let path = path.to_string_lossy().into_owned();
        trace!(global, record = %path, machine = info.machine, "Recorded loader info");
        self.loaders.insert(global.to_string(), Some(path.clone()));
        Ok(Some(path))
    }

    /// Global path a relocated file came from
    pub fn orig_path(&self, local: &str) -> Option<&str> {
        self.origins.get(local).map(String::as_str)
    }

    /// Number of relocated files
    pub fn relocated_count(&self) -> usize {
        self.origins.len()
    }
}
