//! Resolution Client
//!
//! Node-side half of the resolution protocol. Every lookup first consults the
//! shared cache; only the process elected owner of a key talks to the
//! server, and everyone else on the node waits for its answer.
//!
//! # Flow
//!
//! ```text
//! lookup(path)
//!   ├─ ^dir == NODR ?           ─▶ ENOENT, no server traffic
//!   ├─ lookup_or_add(key)
//!   │    ├─ Found(value)        ─▶ decode
//!   │    ├─ Found(InProgress)   ─▶ wait_for_update ─▶ decode
//!   │    ├─ NotFound (owner)    ─▶ query server ─▶ update ─▶ decode
//!   │    └─ Bypass / error      ─▶ query server uncached
//! ```

mod resolver;

use serde::{Deserialize, Serialize};

pub use resolver::{Resolution, Resolver};

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Consult the shared cache before asking the server
    pub use_shared_cache: bool,
    /// Upper bound for one server round trip (milliseconds)
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            use_shared_cache: true,
            request_timeout_ms: 30_000,
        }
    }
}
