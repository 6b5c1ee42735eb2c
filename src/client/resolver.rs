//! Resolver
//!
//! Client lookups through the shared cache. See the module docs of
//! [`crate::client`] for the flow.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, trace, warn};

use super::ClientConfig;
use crate::dircache::{DirBufferIter, DirRecord};
use crate::domain::{errno, FileAnswer, HostEnv, LoaderInfo, Message, StatRecord, Transport};
use crate::error::{Error, Result};
use crate::shmcache::keys::{
    cache_keys, decode_errno, decode_exists, encode_errno, encode_exists, CacheKeys,
    NODIR_MARKER, PYTHON_PREFIX_KEY, SPINDLE_ENODIR,
};
use crate::shmcache::{CacheKind, CachedValue, Lookup, ShmCache};

/// Outcome of a file lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Node-local path to open instead of the original
    Found(String),
    NotFound { errno: i32 },
}

impl Resolution {
    fn decode(value: &str) -> Self {
        match decode_errno(value) {
            Some(errno) => Resolution::NotFound { errno },
            None => Resolution::Found(value.to_string()),
        }
    }

    pub fn local_path(&self) -> Option<&str> {
        match self {
            Resolution::Found(path) => Some(path),
            Resolution::NotFound { .. } => None,
        }
    }
}

/// Server answer reduced to what the shared cache stores
enum CacheAnswer {
    Value(String),
    /// Parent directory does not exist
    NoDir,
}

/// Ownership of an in-progress key; abandons it on drop unless released
struct Ownership {
    cache: Arc<ShmCache>,
    key: String,
    armed: bool,
}

impl Ownership {
    fn new(cache: Arc<ShmCache>, key: &str) -> Self {
        Self {
            cache,
            key: key.to_string(),
            armed: true,
        }
    }

    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for Ownership {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.cache.abandon(&self.key) {
                warn!(key = %self.key, error = %e, "Could not abandon entry");
            }
        }
    }
}

/// Client-side resolver
pub struct Resolver<T: Transport, E: HostEnv> {
    transport: T,
    env: E,
    cache: Arc<ShmCache>,
    config: ClientConfig,
    /// Working directory the server currently has for this session
    sent_cwd: Option<String>,
    /// A request was cut short; the next frame on the stream may be its answer
    desynced: bool,
    server_queries: u64,
}

impl<T: Transport, E: HostEnv> Resolver<T, E> {
    pub fn new(transport: T, env: E, cache: Arc<ShmCache>) -> Self {
        Self::with_config(transport, env, cache, ClientConfig::default())
    }

    pub fn with_config(transport: T, env: E, cache: Arc<ShmCache>, config: ClientConfig) -> Self {
        Self {
            transport,
            env,
            cache,
            config,
            sent_cwd: None,
            desynced: false,
            server_queries: 0,
        }
    }

    pub fn cache(&self) -> &ShmCache {
        &self.cache
    }

    /// Queries this resolver sent to the server
    pub fn server_queries(&self) -> u64 {
        self.server_queries
    }

    /// True once a request was cut short and the transport must be replaced
    pub fn needs_reconnect(&self) -> bool {
        self.desynced
    }

    /// Swap in a fresh connection. The working directory is announced again.
    pub fn reconnect(&mut self, transport: T) {
        self.transport = transport;
        self.sent_cwd = None;
        self.desynced = false;
    }

    /// End the session
    pub async fn close(mut self) -> Result<()> {
        self.transport.send(Message::End).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Resolve `path`; bare names go through the server's search path
    #[instrument(skip(self), level = "debug")]
    pub async fn resolve(&mut self, path: &str) -> Result<Resolution> {
        let cwd = self.env.cwd()?;
        let keys = cache_keys(CacheKind::Resolve, path, &cwd, true);
        let query = Message::FileQuery {
            path: path.to_string(),
        };
        let value = self.cached(&keys, query).await?;
        Ok(Resolution::decode(&value))
    }

    /// Resolve exactly `path`, never searching
    #[instrument(skip(self), level = "debug")]
    pub async fn resolve_exact(&mut self, path: &str) -> Result<Resolution> {
        let cwd = self.env.cwd()?;
        let keys = cache_keys(CacheKind::Resolve, path, &cwd, false);
        let query = Message::FileQueryExactPath {
            path: path.to_string(),
        };
        let value = self.cached(&keys, query).await?;
        Ok(Resolution::decode(&value))
    }

    /// Stat (or lstat) `path`. `None` if it does not exist.
    #[instrument(skip(self), level = "debug")]
    pub async fn stat(&mut self, path: &str, lstat: bool) -> Result<Option<StatRecord>> {
        let cwd = self.env.cwd()?;
        let kind = if lstat { CacheKind::Lstat } else { CacheKind::Stat };
        let keys = cache_keys(kind, path, &cwd, false);
        let query = Message::StatQuery {
            path: path.to_string(),
            lstat,
        };
        let value = self.cached(&keys, query).await?;
        if decode_errno(&value).is_some() {
            return Ok(None);
        }
        StatRecord::read_from(&value).map(Some)
    }

    /// Existence test
    #[instrument(skip(self), level = "debug")]
    pub async fn exists(&mut self, path: &str) -> Result<bool> {
        let cwd = self.env.cwd()?;
        let keys = cache_keys(CacheKind::Exists, path, &cwd, false);
        let query = Message::ExistsQuery {
            path: path.to_string(),
        };
        let value = self.cached(&keys, query).await?;
        Ok(decode_exists(&value))
    }

    /// ELF identification of the dynamic loader at `path`. `None` if it is
    /// missing or not an ELF file.
    #[instrument(skip(self), level = "debug")]
    pub async fn loader_info(&mut self, path: &str) -> Result<Option<LoaderInfo>> {
        let cwd = self.env.cwd()?;
        let keys = cache_keys(CacheKind::LoaderInfo, path, &cwd, false);
        let query = Message::LoaderInfoQuery {
            path: path.to_string(),
        };
        let value = self.cached(&keys, query).await?;
        if decode_errno(&value).is_some() {
            return Ok(None);
        }
        LoaderInfo::read_from(&value).map(Some)
    }

    /// Map a relocated path back to its original location
    pub async fn orig_path(&mut self, path: &str) -> Result<Option<String>> {
        let query = Message::OrigPathQuery {
            path: path.to_string(),
        };
        match self.request(query).await? {
            Message::OrigPathAnswer { path } => Ok(path),
            other => Err(Error::protocol("OrigPathAnswer", other.kind())),
        }
    }

    /// Python installation prefixes known to the server
    pub async fn python_prefixes(&mut self) -> Result<Vec<String>> {
        let keys = CacheKeys {
            key: PYTHON_PREFIX_KEY.to_string(),
            dir_key: None,
        };
        let value = self.cached(&keys, Message::PythonPrefixQuery).await?;
        Ok(value
            .split(':')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Every cached entry of `dir`, as the server lists it
    pub async fn scan(&mut self, dir: &str) -> Result<Vec<DirRecord>> {
        let query = Message::DirectoryListingQuery {
            dir: dir.to_string(),
        };
        match self.request(query).await? {
            Message::DirectoryListing { buffer, .. } => DirBufferIter::new(&buffer).collect(),
            other => Err(Error::protocol("DirectoryListing", other.kind())),
        }
    }

    // =========================================================================
    // Shared cache protocol
    // =========================================================================

    async fn cached(&mut self, keys: &CacheKeys, query: Message) -> Result<String> {
        if !self.config.use_shared_cache {
            return self.uncached(query).await;
        }

        if let Some(dir_key) = &keys.dir_key {
            match self.cache.lookup(dir_key) {
                Ok(Some(CachedValue::Resolved(marker))) if marker == NODIR_MARKER => {
                    trace!(key = %keys.key, "Parent directory known missing");
                    return Ok(encode_errno(errno::ENOENT));
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Directory marker lookup failed"),
            }
        }

        let lookup = match self.cache.lookup_or_add(&keys.key) {
            Ok(lookup) => lookup,
            Err(e) => {
                if !e.is_bypassable() {
                    debug!(key = %keys.key, error = %e, "Shared cache unusable for key");
                }
                return self.uncached(query).await;
            }
        };

        match lookup {
            Lookup::Found(CachedValue::Resolved(value)) => Ok(value),
            Lookup::Found(CachedValue::Negative) => Ok(encode_errno(errno::ENOENT)),
            Lookup::Found(CachedValue::InProgress) => {
                match self.cache.wait_for_update_async(&keys.key).await {
                    Ok(CachedValue::Resolved(value)) => Ok(value),
                    Ok(CachedValue::Negative) => Ok(encode_errno(errno::ENOENT)),
                    Ok(_) | Err(_) => {
                        debug!(key = %keys.key, "Owner gave up, asking server directly");
                        self.uncached(query).await
                    }
                }
            }
            Lookup::Found(CachedValue::Abandoned) | Lookup::Bypass => self.uncached(query).await,
            Lookup::NotFound => self.resolve_as_owner(keys, query).await,
        }
    }

    async fn resolve_as_owner(&mut self, keys: &CacheKeys, query: Message) -> Result<String> {
        let ownership = Ownership::new(self.cache.clone(), &keys.key);
        let answer = self.fetch(query).await?;

        let value = match answer {
            CacheAnswer::Value(value) => value,
            CacheAnswer::NoDir => {
                if let Some(dir_key) = &keys.dir_key {
                    if let Err(e) = self.cache.add(dir_key, Some(NODIR_MARKER)) {
                        debug!(key = %dir_key, error = %e, "Could not record missing directory");
                    }
                }
                encode_errno(errno::ENOENT)
            }
        };

        // A failed store leaves the entry abandoned; the answer is still good
        match self.cache.update(&keys.key, Some(&value)) {
            Ok(()) => ownership.release(),
            Err(e) => debug!(key = %keys.key, error = %e, "Answer not cached"),
        }
        Ok(value)
    }

    async fn uncached(&mut self, query: Message) -> Result<String> {
        match self.fetch(query).await? {
            CacheAnswer::Value(value) => Ok(value),
            CacheAnswer::NoDir => Ok(encode_errno(errno::ENOENT)),
        }
    }

    /// Ask the server and reduce its answer to a cache value
    async fn fetch(&mut self, query: Message) -> Result<CacheAnswer> {
        let answer = match self.request(query).await? {
            Message::FileQueryAnswer { answer } => match answer {
                FileAnswer::Found { path } => CacheAnswer::Value(path),
                FileAnswer::DirectoryNotFound => CacheAnswer::NoDir,
                FileAnswer::NotFound { errno } if errno == SPINDLE_ENODIR => CacheAnswer::NoDir,
                FileAnswer::NotFound { errno } => CacheAnswer::Value(encode_errno(errno)),
            },
            Message::StatAnswer { stat_path } => CacheAnswer::Value(
                stat_path.unwrap_or_else(|| encode_errno(errno::ENOENT)),
            ),
            Message::LoaderInfoAnswer { info_path } => CacheAnswer::Value(
                info_path.unwrap_or_else(|| encode_errno(errno::ENOENT)),
            ),
            Message::ExistsAnswer { exists } => CacheAnswer::Value(encode_exists(exists).to_string()),
            Message::PythonPrefixAnswer { prefixes } => CacheAnswer::Value(prefixes.join(":")),
            other => return Err(Error::protocol("answer", other.kind())),
        };
        Ok(answer)
    }

    /// One server round trip, announcing the working directory first if it changed
    ///
    /// Answers carry no request id, so after a timeout or a failed exchange the
    /// stream may still hold a stale answer. The resolver then refuses further
    /// requests until [`reconnect`](Self::reconnect).
    async fn request(&mut self, query: Message) -> Result<Message> {
        if self.desynced {
            return Err(Error::TransportFailure(
                "connection out of step with the server, reconnect required".into(),
            ));
        }
        let cwd = self.env.cwd()?;

        // Cleared only once a whole answer has been read
        self.desynced = true;
        if self.sent_cwd.as_deref() != Some(cwd.as_str()) {
            self.transport.send(Message::Cwd { cwd: cwd.clone() }).await?;
            self.sent_cwd = Some(cwd);
        }

        let kind = query.kind();
        let started = self.env.now();
        self.server_queries += 1;
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let answer = match tokio::time::timeout(timeout, self.transport.request(query)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e @ Error::ServerError(_))) => {
                self.desynced = false;
                return Err(e);
            }
            Ok(Err(e)) => {
                warn!(kind, error = %e, "Request failed, connection needs replacing");
                return Err(e);
            }
            Err(_) => {
                warn!(kind, ?timeout, "Request timed out, connection needs replacing");
                return Err(Error::TransportFailure(format!(
                    "{} timed out after {:?}",
                    kind, timeout
                )));
            }
        };
        self.desynced = false;
        debug!(
            kind,
            answer = answer.kind(),
            elapsed_us = (self.env.now() - started).num_microseconds().unwrap_or(i64::MAX),
            "Server answered"
        );
        Ok(answer)
    }
}

// =============================================================================
// Tests
// =============================================================================
