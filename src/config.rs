//! Configuration
//!
//! One YAML document with a section per component. Every section has
//! defaults, so an empty file (or no file) is a valid configuration.
//!
//! ```yaml
//! server:
//!   socket_path: /tmp/spindle.sock
//!   search_path: [/lib64, /usr/lib64]
//! shm:
//!   segment_path: /dev/shm/spindle
//!   heap_limit: 8388608
//! client:
//!   request_timeout_ms: 10000
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::error::{Error, Result};
use crate::server::ServerConfig;
use crate::shmcache::segment::{MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE};
use crate::shmcache::ShmCacheConfig;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpindleConfig {
    pub server: ServerConfig,
    pub shm: ShmCacheConfig,
    pub client: ClientConfig,
}

impl SpindleConfig {
    /// Load and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let shm = &self.shm;
        if shm.heap_limit > 0 {
            if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&shm.segment_size) {
                return Err(Error::Config(format!(
                    "shm.segment_size {} outside [{}, {}]",
                    shm.segment_size, MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE
                )));
            }
            if shm.heap_limit > shm.segment_size {
                return Err(Error::Config(format!(
                    "shm.heap_limit {} exceeds shm.segment_size {}",
                    shm.heap_limit, shm.segment_size
                )));
            }
        }
        if shm.wait_backoff_min_us > shm.wait_backoff_max_us {
            return Err(Error::Config(
                "shm.wait_backoff_min_us must not exceed shm.wait_backoff_max_us".into(),
            ));
        }
        if let Some(dir) = self.server.search_path.iter().find(|d| !d.starts_with('/')) {
            return Err(Error::Config(format!(
                "server.search_path entry {:?} is not absolute",
                dir
            )));
        }
        if self.client.request_timeout_ms == 0 {
            return Err(Error::Config("client.request_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
