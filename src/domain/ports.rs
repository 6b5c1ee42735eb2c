//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions the resolution core depends on. Adapters in
//! [`crate::adapters`] provide the concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Resolution Core                         │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │            Transport       │       HostEnv           │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  UnixTransport │ HandlerTransport │ SystemEnv        │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use bytes::Buf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::messages::Message;
use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// File metadata as recorded by the server and read back by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRecord {
    /// Path the record describes
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub ino: u64,
    pub dev: u64,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub modified: Option<DateTime<Utc>>,
    /// When the server took the record
    pub recorded_at: DateTime<Utc>,
}

impl StatRecord {
    /// Build a record from filesystem metadata
    pub fn from_metadata(path: &str, meta: &fs::Metadata, recorded_at: DateTime<Utc>) -> Self {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;

        #[cfg(unix)]
        let (mode, ino, dev, nlink, uid, gid) = (
            meta.mode(),
            meta.ino(),
            meta.dev(),
            meta.nlink(),
            meta.uid(),
            meta.gid(),
        );
        #[cfg(not(unix))]
        let (mode, ino, dev, nlink, uid, gid) = (0, 0, 0, 1, 0, 0);

        Self {
            path: path.to_string(),
            size: meta.len(),
            mode,
            is_dir: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
            ino,
            dev,
            nlink,
            uid,
            gid,
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            recorded_at,
        }
    }

    /// Read a record written by the server
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Leading bytes of a file needed to read a loader's ELF identification
pub const ELF_HEADER_PREFIX: usize = 32;

const ELF_MAGIC: &[u8] = b"\x7fELF";

/// ELF identification of a dynamic loader, recorded by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderInfo {
    pub path: String,
    /// 32 or 64
    pub class: u8,
    pub little_endian: bool,
    /// `e_machine`
    pub machine: u16,
    /// `e_entry`
    pub entry: u64,
    pub recorded_at: DateTime<Utc>,
}

impl LoaderInfo {
    /// Parse the start of an ELF file; `None` if it is not one
    pub fn parse(path: &str, header: &[u8], recorded_at: DateTime<Utc>) -> Option<Self> {
        if header.len() < 24 || !header.starts_with(ELF_MAGIC) {
            return None;
        }
        let class = match header[4] {
            1 => 32,
            2 => 64,
            _ => return None,
        };
        let little_endian = match header[5] {
            1 => true,
            2 => false,
            _ => return None,
        };

        let mut fields = &header[18..];
        let machine = if little_endian {
            fields.get_u16_le()
        } else {
            fields.get_u16()
        };
        // e_version
        fields.advance(4);
        let entry = match class {
            32 if fields.remaining() >= 4 => {
                if little_endian {
                    fields.get_u32_le() as u64
                } else {
                    fields.get_u32() as u64
                }
            }
            64 if fields.remaining() >= 8 => {
                if little_endian {
                    fields.get_u64_le()
                } else {
                    fields.get_u64()
                }
            }
            _ => return None,
        };

        Some(Self {
            path: path.to_string(),
            class,
            little_endian,
            machine,
            entry,
            recorded_at,
        })
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

// =============================================================================
// Transport Port
// =============================================================================

/// Port for exchanging messages with the server.
///
/// Framing, connection setup and timeouts belong to the implementation.
#[async_trait]
pub trait Transport: Send {
    /// Send one message.
    async fn send(&mut self, message: Message) -> Result<()>;

    /// Receive the next message.
    async fn receive(&mut self) -> Result<Message>;

    /// Send a query and wait for its answer.
    async fn request(&mut self, message: Message) -> Result<Message> {
        let kind = message.kind();
        self.send(message).await?;
        match self.receive().await? {
            Message::ErrorAnswer { reason } => {
                Err(Error::ServerError(format!("{}: {}", kind, reason)))
            }
            answer => Ok(answer),
        }
    }
}

// =============================================================================
// Host Environment Port
// =============================================================================

/// Port for process environment the core reads
pub trait HostEnv: Send + Sync {
    /// Current working directory
    fn cwd(&self) -> Result<String>;

    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf64_header(machine: u16, entry: u64) -> Vec<u8> {
        let mut header = vec![0u8; 64];
        header[..4].copy_from_slice(ELF_MAGIC);
        header[4] = 2;
        header[5] = 1;
        header[18..20].copy_from_slice(&machine.to_le_bytes());
        header[20..24].copy_from_slice(&1u32.to_le_bytes());
        header[24..32].copy_from_slice(&entry.to_le_bytes());
        header
    }

    #[test]
    fn test_loader_info_from_elf64() {
        let header = elf64_header(62, 0x1100);
        let info = LoaderInfo::parse("/lib64/ld-linux-x86-64.so.2", &header, Utc::now()).unwrap();
        assert_eq!(info.class, 64);
        assert!(info.little_endian);
        assert_eq!(info.machine, 62);
        assert_eq!(info.entry, 0x1100);
    }

    #[test]
    fn test_loader_info_big_endian_elf32() {
        let mut header = vec![0u8; 28];
        header[..4].copy_from_slice(ELF_MAGIC);
        header[4] = 1;
        header[5] = 2;
        header[18..20].copy_from_slice(&8u16.to_be_bytes());
        header[24..28].copy_from_slice(&0x400u32.to_be_bytes());
        let info = LoaderInfo::parse("/lib/ld.so.1", &header, Utc::now()).unwrap();
        assert_eq!((info.class, info.little_endian), (32, false));
        assert_eq!((info.machine, info.entry), (8, 0x400));
    }

    #[test]
    fn test_non_elf_is_rejected() {
        assert!(LoaderInfo::parse("/bin/sh", b"#!/bin/sh\necho hi\n", Utc::now()).is_none());
        let mut truncated = elf64_header(62, 1);
        truncated.truncate(28);
        assert!(LoaderInfo::parse("/x", &truncated, Utc::now()).is_none());
    }
}
