//! Resolution Server
//!
//! Answers client queries from the hash directory cache and keeps node-local
//! copies of everything it resolves.
//!
//! # Design
//!
//! ```text
//! connection task ─┐
//! connection task ─┼─▶ mpsc ─▶ handler task (QueryHandler)
//! connection task ─┘              │  DirectoryCache
//!                                 │  LocalStore
//! ```
//!
//! Connection tasks own framing and the per-session working directory. Every
//! query goes through the single handler task, so the directory cache is only
//! ever touched from one place.

mod handler;
mod service;
mod store;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use handler::{HandlerStats, QueryHandler, Session, SessionStep};
pub use service::{serve, Server};
pub use store::{LocalStore, Relocated};

/// Configuration for the resolution server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix socket the server listens on
    pub socket_path: PathBuf,
    /// Root of the local store
    pub store_dir: PathBuf,
    /// Directories searched, in order, for bare names
    pub search_path: Vec<String>,
    /// Answer to `PythonPrefixQuery`
    pub python_prefixes: Vec<String>,
    /// Files up to this size keep an in-memory copy in the directory cache
    pub inline_limit: usize,
    /// Requests queued for the handler task before connections wait
    pub queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/spindle.sock"),
            store_dir: PathBuf::from("/tmp/spindle-store"),
            search_path: vec![
                "/lib64".to_string(),
                "/usr/lib64".to_string(),
                "/lib".to_string(),
                "/usr/lib".to_string(),
            ],
            python_prefixes: Vec::new(),
            inline_limit: 64 * 1024,
            queue_depth: 1024,
        }
    }
}
