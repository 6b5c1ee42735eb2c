//! Protocol Messages
//!
//! Logical messages exchanged between a client and the server. Framing is
//! the transport's business; these only fix the shapes.
//!
//! # Example
//!
//! ```ignore
//! transport.send(Message::FileQuery { path: "libm.so".into() }).await?;
//! match transport.receive().await? {
//!     Message::FileQueryAnswer { answer: FileAnswer::Found { path } } => { /* ... */ }
//!     other => return Err(Error::protocol("FileQueryAnswer", other.kind())),
//! }
//! ```

use serde::{Deserialize, Serialize};

/// errno values carried in negative answers
pub mod errno {
    #[cfg(unix)]
    pub use libc::{EIO, EISDIR, ENAMETOOLONG, ENOENT};

    #[cfg(not(unix))]
    pub const ENOENT: i32 = 2;
    #[cfg(not(unix))]
    pub const EIO: i32 = 5;
    #[cfg(not(unix))]
    pub const EISDIR: i32 = 21;
    #[cfg(not(unix))]
    pub const ENAMETOOLONG: i32 = 36;
}

/// Answer to a file query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileAnswer {
    /// Node-local path holding the file's content
    Found { path: String },
    /// File absent or unreadable
    NotFound { errno: i32 },
    /// Parent directory does not exist
    DirectoryNotFound,
}

/// Message exchanged with the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    // =========================================================================
    // Session
    // =========================================================================
    /// Working directory for relative paths in later queries
    Cwd { cwd: String },
    /// Client is done with this connection
    End,

    // =========================================================================
    // Queries
    // =========================================================================
    /// Resolve with search semantics
    FileQuery { path: String },
    /// Resolve exactly this path
    FileQueryExactPath { path: String },
    StatQuery { path: String, lstat: bool },
    ExistsQuery { path: String },
    /// Map a relocated path back to where it came from
    OrigPathQuery { path: String },
    PythonPrefixQuery,
    /// Encoded listing of every cached child of a directory
    DirectoryListingQuery { dir: String },
    /// ELF identification of a dynamic loader
    LoaderInfoQuery { path: String },
    /// Directory cache entries added since the previous request
    NewEntriesQuery,

    // =========================================================================
    // Answers
    // =========================================================================
    FileQueryAnswer { answer: FileAnswer },
    /// Path of a stat record, `None` if the file does not exist
    StatAnswer { stat_path: Option<String> },
    ExistsAnswer { exists: bool },
    OrigPathAnswer { path: Option<String> },
    PythonPrefixAnswer { prefixes: Vec<String> },
    DirectoryListing { dir: String, buffer: Vec<u8> },
    /// Path of a loader info record, `None` if missing or not an ELF file
    LoaderInfoAnswer { info_path: Option<String> },
    NewEntries { buffer: Vec<u8> },
    /// Server could not process the request
    ErrorAnswer { reason: String },
}

impl Message {
    /// Short name of the message type, for logs and protocol errors
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Cwd { .. } => "Cwd",
            Message::End => "End",
            Message::FileQuery { .. } => "FileQuery",
            Message::FileQueryExactPath { .. } => "FileQueryExactPath",
            Message::StatQuery { .. } => "StatQuery",
            Message::ExistsQuery { .. } => "ExistsQuery",
            Message::OrigPathQuery { .. } => "OrigPathQuery",
            Message::PythonPrefixQuery => "PythonPrefixQuery",
            Message::DirectoryListingQuery { .. } => "DirectoryListingQuery",
            Message::LoaderInfoQuery { .. } => "LoaderInfoQuery",
            Message::NewEntriesQuery => "NewEntriesQuery",
            Message::FileQueryAnswer { .. } => "FileQueryAnswer",
            Message::StatAnswer { .. } => "StatAnswer",
            Message::ExistsAnswer { .. } => "ExistsAnswer",
            Message::OrigPathAnswer { .. } => "OrigPathAnswer",
            Message::PythonPrefixAnswer { .. } => "PythonPrefixAnswer",
            Message::DirectoryListing { .. } => "DirectoryListing",
            Message::LoaderInfoAnswer { .. } => "LoaderInfoAnswer",
            Message::NewEntries { .. } => "NewEntries",
            Message::ErrorAnswer { .. } => "ErrorAnswer",
        }
    }

    /// True for messages that expect an answer
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Message::FileQuery { .. }
                | Message::FileQueryExactPath { .. }
                | Message::StatQuery { .. }
                | Message::ExistsQuery { .. }
                | Message::OrigPathQuery { .. }
                | Message::PythonPrefixQuery
                | Message::DirectoryListingQuery { .. }
                | Message::LoaderInfoQuery { .. }
                | Message::NewEntriesQuery
        )
    }
}
