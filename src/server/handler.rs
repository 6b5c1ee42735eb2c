//! Query Handler
//!
//! Turns one client query into one answer. Owns the directory cache and the
//! local store; callers serialise access to it.

use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::store::LocalStore;
use super::ServerConfig;
use crate::dircache::{DirLookup, DirectoryCache, EntryUpdate, FileLookup};
use crate::domain::paths::{absolute, join, split};
use crate::domain::{errno, FileAnswer, HostEnv, Message};
use crate::error::{Error, Result};

/// Per-handler request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HandlerStats {
    pub requests: u64,
    pub file_queries: u64,
    pub stat_queries: u64,
    pub exists_queries: u64,
    pub relocations: u64,
    pub errors: u64,
}

/// Server-side query processing
pub struct QueryHandler<E: HostEnv> {
    cache: DirectoryCache,
    store: LocalStore,
    search_path: Vec<String>,
    python_prefixes: Vec<String>,
    env: E,
    stats: HandlerStats,
}

impl<E: HostEnv> QueryHandler<E> {
    pub fn new(config: &ServerConfig, env: E) -> Result<Self> {
        let store = LocalStore::open(&config.store_dir, config.inline_limit)?;
        Ok(Self {
            cache: DirectoryCache::init(),
            store,
            search_path: config.search_path.clone(),
            python_prefixes: config.python_prefixes.clone(),
            env,
            stats: HandlerStats::default(),
        })
    }

    pub fn cache(&self) -> &DirectoryCache {
        &self.cache
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn stats(&self) -> HandlerStats {
        self.stats
    }

    /// Answer `message` for a session whose working directory is `cwd`.
    ///
    /// Failures are answered with `ErrorAnswer` rather than returned.
    #[instrument(skip(self, message), fields(kind = message.kind()))]
    pub fn handle(&mut self, message: Message, cwd: &str) -> Message {
        self.stats.requests += 1;
        match self.dispatch(message, cwd) {
            Ok(answer) => answer,
            Err(e) => {
                self.stats.errors += 1;
                warn!(error = %e, "Query failed");
                Message::ErrorAnswer {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn dispatch(&mut self, message: Message, cwd: &str) -> Result<Message> {
        match message {
            Message::FileQuery { path } => {
                self.stats.file_queries += 1;
                let answer = if path.contains('/') {
                    self.resolve_path(&absolute(&path, cwd))?
                } else {
                    self.search(&path)?
                };
                Ok(Message::FileQueryAnswer { answer })
            }
            Message::FileQueryExactPath { path } => {
                self.stats.file_queries += 1;
                let answer = self.resolve_path(&absolute(&path, cwd))?;
                Ok(Message::FileQueryAnswer { answer })
            }
            Message::StatQuery { path, lstat } => {
                self.stats.stat_queries += 1;
                let stat_path = self.stat(&absolute(&path, cwd), lstat)?;
                Ok(Message::StatAnswer { stat_path })
            }
            Message::ExistsQuery { path } => {
                self.stats.exists_queries += 1;
                let exists = self.exists(&absolute(&path, cwd))?;
                Ok(Message::ExistsAnswer { exists })
            }
            Message::OrigPathQuery { path } => Ok(Message::OrigPathAnswer {
                path: self.store.orig_path(&path).map(str::to_string),
            }),
            Message::PythonPrefixQuery => Ok(Message::PythonPrefixAnswer {
                prefixes: self.python_prefixes.clone(),
            }),
            Message::LoaderInfoQuery { path } => {
                let info_path = self.loader_info(&absolute(&path, cwd))?;
                Ok(Message::LoaderInfoAnswer { info_path })
            }
            Message::NewEntriesQuery => Ok(Message::NewEntries {
                buffer: self.cache.serialize_new_entries().to_vec(),
            }),
            Message::DirectoryListingQuery { dir } => {
                let dir = absolute(&dir, cwd);
                self.cache.scan_directory(&dir)?;
                let buffer = self.cache.serialize_directory(&dir)?;
                Ok(Message::DirectoryListing {
                    dir,
                    buffer: buffer.to_vec(),
                })
            }
            other => Err(Error::protocol("query", other.kind())),
        }
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Look a bare name up in each search directory, in order
    fn search(&mut self, name: &str) -> Result<FileAnswer> {
        for idx in 0..self.search_path.len() {
            let dir = self.search_path[idx].clone();
            if let FileAnswer::Found { path } = self.resolve_in(&dir, name)? {
                debug!(name, dir = %dir, "Found in search path");
                return Ok(FileAnswer::Found { path });
            }
        }
        Ok(FileAnswer::NotFound {
            errno: errno::ENOENT,
        })
    }

    fn resolve_path(&mut self, path: &str) -> Result<FileAnswer> {
        let (dir, file) = split(path);
        if file.is_empty() {
            return Ok(FileAnswer::NotFound {
                errno: errno::EISDIR,
            });
        }
        self.resolve_in(dir, file)
    }

    fn resolve_in(&mut self, dir: &str, file: &str) -> Result<FileAnswer> {
        match self.cache.scan_directory(dir) {
            Ok(DirLookup::ParsedNotExists) => return Ok(FileAnswer::DirectoryNotFound),
            Ok(_) => {}
            Err(Error::PathTooLong { .. }) => {
                return Ok(FileAnswer::NotFound {
                    errno: errno::ENAMETOOLONG,
                })
            }
            Err(e) => return Err(e),
        }

        match self.cache.find_file(file, dir) {
            FileLookup::NotFound => Ok(FileAnswer::NotFound {
                errno: errno::ENOENT,
            }),
            FileLookup::Found { errcode, .. } if errcode != 0 => {
                Ok(FileAnswer::NotFound { errno: errcode })
            }
            FileLookup::Found {
                local_path: Some(path),
                ..
            } => Ok(FileAnswer::Found { path }),
            FileLookup::Found {
                local_path: None, ..
            } => self.relocate(dir, file),
        }
    }

    /// First request for a file: copy it into the store and remember the result
    fn relocate(&mut self, dir: &str, file: &str) -> Result<FileAnswer> {
        let global = join(dir, file);
        match self.store.relocate(&global) {
            Ok(relocated) => {
                self.stats.relocations += 1;
                let path = relocated.local_path.clone();
                self.cache.update_entry(
                    file,
                    dir,
                    EntryUpdate {
                        local_path: Some(relocated.local_path),
                        buffer: relocated.buffer,
                        alias_target: relocated.alias_target,
                        errcode: 0,
                    },
                )?;
                Ok(FileAnswer::Found { path })
            }
            Err(e) => {
                let errcode = e.raw_os_error().unwrap_or(errno::EIO);
                debug!(path = %global, error = %e, "Relocation failed");
                self.cache.update_entry(
                    file,
                    dir,
                    EntryUpdate {
                        errcode,
                        ..Default::default()
                    },
                )?;
                Ok(FileAnswer::NotFound { errno: errcode })
            }
        }
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    fn stat(&mut self, path: &str, lstat: bool) -> Result<Option<String>> {
        let (dir, file) = split(path);
        if !file.is_empty() && !self.listed(dir, file)? {
            return Ok(None);
        }
        let now = self.env.now();
        self.store.write_stat(path, lstat, now)
    }

    fn loader_info(&mut self, path: &str) -> Result<Option<String>> {
        let (dir, file) = split(path);
        if file.is_empty() || !self.listed(dir, file)? {
            return Ok(None);
        }
        let now = self.env.now();
        self.store.write_loader_info(path, now)
    }

    fn exists(&mut self, path: &str) -> Result<bool> {
        let (dir, file) = split(path);
        if file.is_empty() {
            return Ok(true);
        }
        self.listed(dir, file)
    }

    /// True if `file` appears in the listing of `dir`
    fn listed(&mut self, dir: &str, file: &str) -> Result<bool> {
        match self.cache.scan_directory(dir) {
            Ok(DirLookup::ParsedNotExists) => Ok(false),
            Ok(_) => Ok(self.cache.find_file(file, dir).is_found()),
            Err(Error::PathTooLong { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// What a connection should do with an incoming message
#[derive(Debug, PartialEq, Eq)]
pub enum SessionStep {
    /// Pass the query to the handler
    Query(Message),
    /// Session state updated; nothing to answer
    Updated,
    /// Client ended the session
    Close,
}

/// Per-connection state: the client's working directory
#[derive(Debug, Clone)]
pub struct Session {
    cwd: String,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            cwd: "/".to_string(),
        }
    }
}

impl Session {
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Classify an incoming message, applying session messages
    pub fn step(&mut self, message: Message) -> Result<SessionStep> {
        match message {
            Message::Cwd { cwd } => {
                self.cwd = cwd;
                Ok(SessionStep::Updated)
            }
            Message::End => Ok(SessionStep::Close),
            query if query.is_query() => Ok(SessionStep::Query(query)),
            other => Err(Error::protocol("query or session message", other.kind())),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoaderInfo, StatRecord};
    use assert_matches::assert_matches;
    use chrono::{DateTime, Utc};
    use std::fs;
    use tempfile::TempDir;

    struct FixedEnv;

    impl HostEnv for FixedEnv {
        fn cwd(&self) -> Result<String> {
            Ok("/".to_string())
        }

        fn now(&self) -> DateTime<Utc> {
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default()
        }
    }

    struct Fixture {
        root: TempDir,
        handler: QueryHandler<FixedEnv>,
    }

    impl Fixture {
        fn path(&self, rel: &str) -> String {
            join(self.root.path().to_str().unwrap(), rel)
        }
    }

    fn setup() -> Fixture {
        let root = TempDir::new().unwrap();
        let base = root.path();
        fs::create_dir_all(base.join("lib1")).unwrap();
        fs::create_dir_all(base.join("lib2")).unwrap();
        fs::write(base.join("lib1/libfirst.so"), b"first").unwrap();
        fs::write(base.join("lib2/libfirst.so"), b"shadowed").unwrap();
        fs::write(base.join("lib2/libsecond.so"), b"second").unwrap();

        let config = ServerConfig {
            store_dir: base.join("store"),
            search_path: vec![
                base.join("lib1").to_str().unwrap().to_string(),
                base.join("missing").to_str().unwrap().to_string(),
                base.join("lib2").to_str().unwrap().to_string(),
            ],
            python_prefixes: vec!["/usr".to_string(), "/opt/py".to_string()],
            ..Default::default()
        };
        let handler = QueryHandler::new(&config, FixedEnv).unwrap();
        Fixture { root, handler }
    }

    fn file_answer(reply: Message) -> FileAnswer {
        match reply {
            Message::FileQueryAnswer { answer } => answer,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_search_path_order() {
        let mut fx = setup();
        let first = file_answer(fx.handler.handle(
            Message::FileQuery {
                path: "libfirst.so".into(),
            },
            "/",
        ));
        let path = assert_matches!(first, FileAnswer::Found { path } => path);
        assert_eq!(fs::read(&path).unwrap(), b"first");

        let second = file_answer(fx.handler.handle(
            Message::FileQuery {
                path: "libsecond.so".into(),
            },
            "/",
        ));
        assert_matches!(second, FileAnswer::Found { .. });

        let none = file_answer(fx.handler.handle(
            Message::FileQuery {
                path: "libnone.so".into(),
            },
            "/",
        ));
        assert_eq!(none, FileAnswer::NotFound { errno: errno::ENOENT });
    }

    #[test]
    fn test_repeat_query_reuses_local_copy() {
        let mut fx = setup();
        let query = Message::FileQueryExactPath {
            path: fx.path("lib2/libsecond.so"),
        };
        let a = file_answer(fx.handler.handle(query.clone(), "/"));
        let b = file_answer(fx.handler.handle(query, "/"));
        assert_eq!(a, b);
        assert_eq!(fx.handler.stats().relocations, 1);
        assert_eq!(fx.handler.cache().stats().directories_scanned, 1);
    }

    #[test]
    fn test_relative_path_uses_cwd() {
        let mut fx = setup();
        let cwd = fx.path("lib1");
        let answer = file_answer(fx.handler.handle(
            Message::FileQuery {
                path: "./libfirst.so".into(),
            },
            &cwd,
        ));
        assert_matches!(answer, FileAnswer::Found { .. });
    }

    #[test]
    fn test_exact_path_skips_search() {
        let mut fx = setup();
        let cwd = fx.path("lib2");
        // Bare name, exact semantics: resolved against cwd only
        let answer = file_answer(fx.handler.handle(
            Message::FileQueryExactPath {
                path: "libsecond.so".into(),
            },
            &cwd,
        ));
        assert_matches!(answer, FileAnswer::Found { .. });

        let answer = file_answer(fx.handler.handle(
            Message::FileQueryExactPath {
                path: "libsecond.so".into(),
            },
            "/",
        ));
        assert_matches!(answer, FileAnswer::NotFound { .. });
    }

    #[test]
    fn test_missing_directory() {
        let mut fx = setup();
        let answer = file_answer(fx.handler.handle(
            Message::FileQueryExactPath {
                path: fx.path("nowhere/libx.so"),
            },
            "/",
        ));
        assert_eq!(answer, FileAnswer::DirectoryNotFound);
    }

    #[test]
    fn test_stat_and_exists() {
        let mut fx = setup();
        let target = fx.path("lib1/libfirst.so");

        let reply = fx.handler.handle(
            Message::StatQuery {
                path: target.clone(),
                lstat: false,
            },
            "/",
        );
        let stat_path = assert_matches!(reply, Message::StatAnswer { stat_path: Some(p) } => p);
        let record = StatRecord::read_from(&stat_path).unwrap();
        assert_eq!(record.size, 5);
        assert_eq!(record.recorded_at.timestamp(), 1_700_000_000);

        let reply = fx.handler.handle(
            Message::StatQuery {
                path: fx.path("lib1/absent"),
                lstat: true,
            },
            "/",
        );
        assert_eq!(reply, Message::StatAnswer { stat_path: None });

        let reply = fx.handler.handle(Message::ExistsQuery { path: target }, "/");
        assert_eq!(reply, Message::ExistsAnswer { exists: true });
        let reply = fx.handler.handle(
            Message::ExistsQuery {
                path: fx.path("nowhere/x"),
            },
            "/",
        );
        assert_eq!(reply, Message::ExistsAnswer { exists: false });
    }

    #[test]
    fn test_orig_path_reverse_lookup() {
        let mut fx = setup();
        let global = fx.path("lib2/libsecond.so");
        let local = assert_matches!(
            file_answer(fx.handler.handle(Message::FileQueryExactPath { path: global.clone() }, "/")),
            FileAnswer::Found { path } => path
        );
        let reply = fx.handler.handle(Message::OrigPathQuery { path: local }, "/");
        assert_eq!(reply, Message::OrigPathAnswer { path: Some(global) });

        let reply = fx.handler.handle(
            Message::OrigPathQuery {
                path: "/not/relocated".into(),
            },
            "/",
        );
        assert_eq!(reply, Message::OrigPathAnswer { path: None });
    }

    #[test]
    fn test_python_prefixes_and_listing() {
        let mut fx = setup();
        let reply = fx.handler.handle(Message::PythonPrefixQuery, "/");
        assert_eq!(
            reply,
            Message::PythonPrefixAnswer {
                prefixes: vec!["/usr".into(), "/opt/py".into()]
            }
        );

        let dir = fx.path("lib2");
        let reply = fx.handler.handle(Message::DirectoryListingQuery { dir: dir.clone() }, "/");
        let buffer = assert_matches!(reply, Message::DirectoryListing { buffer, .. } => buffer);

        let mut relay = DirectoryCache::init();
        relay.apply_directory_buffer(&buffer).unwrap();
        let mut children = relay.children(&dir);
        children.sort();
        assert_eq!(children, vec!["libfirst.so", "libsecond.so"]);
    }

    #[test]
    fn test_answers_are_rejected_as_queries() {
        let mut fx = setup();
        let reply = fx.handler.handle(Message::ExistsAnswer { exists: true }, "/");
        assert_matches!(reply, Message::ErrorAnswer { .. });
        assert_eq!(fx.handler.stats().errors, 1);
    }

    #[test]
    fn test_session_steps() {
        let mut session = Session::default();
        assert_eq!(session.cwd(), "/");
        assert_eq!(
            session.step(Message::Cwd { cwd: "/home".into() }).unwrap(),
            SessionStep::Updated
        );
        assert_eq!(session.cwd(), "/home");
        assert_matches!(
            session.step(Message::PythonPrefixQuery).unwrap(),
            SessionStep::Query(Message::PythonPrefixQuery)
        );
        assert_eq!(session.step(Message::End).unwrap(), SessionStep::Close);
        assert!(session.step(Message::StatAnswer { stat_path: None }).is_err());
    }

    #[test]
    fn test_loader_info_query() {
        let mut fx = setup();
        let mut elf = vec![0u8; 64];
        elf[..4].copy_from_slice(b"\x7fELF");
        elf[4] = 2;
        elf[5] = 1;
        elf[18..20].copy_from_slice(&62u16.to_le_bytes());
        fs::write(fx.root.path().join("lib1/ld-linux.so.2"), &elf).unwrap();

        let reply = fx.handler.handle(
            Message::LoaderInfoQuery {
                path: fx.path("lib1/ld-linux.so.2"),
            },
            "/",
        );
        let info_path = assert_matches!(reply, Message::LoaderInfoAnswer { info_path: Some(p) } => p);
        assert_eq!(LoaderInfo::read_from(&info_path).unwrap().machine, 62);

        let reply = fx.handler.handle(
            Message::LoaderInfoQuery {
                path: fx.path("lib1/libfirst.so"),
            },
            "/",
        );
        assert_eq!(reply, Message::LoaderInfoAnswer { info_path: None });
    }

    #[test]
    fn test_new_entries_follow_lookups() {
        let mut fx = setup();
        let reply = fx.handler.handle(Message::NewEntriesQuery, "/");
        assert_eq!(reply, Message::NewEntries { buffer: Vec::new() });

        fx.handler.handle(
            Message::FileQuery {
                path: "libsecond.so".into(),
            },
            "/",
        );
        let buffer = assert_matches!(
            fx.handler.handle(Message::NewEntriesQuery, "/"),
            Message::NewEntries { buffer } => buffer
        );
        let mut relay = DirectoryCache::init();
        relay.apply_directory_buffer(&buffer).unwrap();
        assert_eq!(relay.find_directory(&fx.path("lib2")), DirLookup::ParsedExists);
        assert_eq!(
            relay.find_directory(&fx.path("missing")),
            DirLookup::ParsedNotExists
        );
        assert!(relay.find_file("libsecond.so", &fx.path("lib2")).is_found());

        let reply = fx.handler.handle(Message::NewEntriesQuery, "/");
        assert_eq!(reply, Message::NewEntries { buffer: Vec::new() });
    }
}
