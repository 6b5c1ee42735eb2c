//! Infrastructure Adapters
//!
//! Implementations of the domain ports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │            Transport            │          HostEnv          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │  UnixTransport │ HandlerTransport │ SystemEnv               │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use spindle::adapters::{SystemEnv, UnixTransport};
//! use spindle::client::Resolver;
//!
//! let transport = UnixTransport::connect("/tmp/spindle.sock").await?;
//! let mut resolver = Resolver::new(transport, SystemEnv, cache);
//! let answer = resolver.resolve("libm.so.6").await?;
//! ```

mod in_process;
mod system_env;
pub mod unix_socket;

pub use in_process::HandlerTransport;
pub use system_env::SystemEnv;
pub use unix_socket::UnixTransport;
