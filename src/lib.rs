//! Spindle - Node-Shared File Resolution
//!
//! Keeps the file lookups of large parallel jobs off the shared filesystem.
//! One server per node (or relay tree) lists directories once and hands out
//! node-local copies; every process on a node shares answers through a
//! memory-mapped LRU cache so each distinct query reaches the server once.
//!
//! # Architecture
//!
//! ```text
//! process ─┐                                   ┌─ DirectoryCache
//! process ─┼─ Resolver ─▶ ShmCache (shared) ─▶ server ─┤
//! process ─┘                                   └─ LocalStore
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Transport and environment adapters implementing domain ports
//! - [`client`] - Resolver running the shared-cache protocol
//! - [`config`] - YAML configuration
//! - [`dircache`] - Hash directory cache
//! - [`domain`] - Messages, path helpers and ports
//! - [`error`] - Error types
//! - [`server`] - Query handler, local store and service loop
//! - [`shmcache`] - Shared-memory LRU cache on the sheep allocator

pub mod adapters;
pub mod client;
pub mod config;
pub mod dircache;
pub mod domain;
pub mod error;
pub mod server;
pub mod shmcache;

// Re-export commonly used types
pub use client::{ClientConfig, Resolution, Resolver};
pub use config::SpindleConfig;
pub use dircache::DirectoryCache;
pub use error::{Error, Result};
pub use server::{QueryHandler, ServerConfig};
pub use shmcache::{ShmCache, ShmCacheConfig};
