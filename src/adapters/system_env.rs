//! Host environment backed by the running process

use chrono::{DateTime, Utc};

use crate::domain::HostEnv;
use crate::error::{Error, Result};

/// Real working directory and wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl HostEnv for SystemEnv {
    fn cwd(&self) -> Result<String> {
        std::env::current_dir()?
            .into_os_string()
            .into_string()
            .map_err(|p| Error::Internal(format!("working directory is not UTF-8: {:?}", p)))
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
