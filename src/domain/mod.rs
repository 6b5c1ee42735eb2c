//! Domain Layer
//!
//! Message shapes and the ports the resolution core talks through.
//!
//! - **Messages** (`messages.rs`) - Queries and answers exchanged with the server
//! - **Paths** (`paths.rs`) - Lexical path helpers
//! - **Ports** (`ports.rs`) - Transport and host-environment abstractions

pub mod messages;
pub mod paths;
pub mod ports;

pub use messages::{errno, FileAnswer, Message};
pub use ports::{HostEnv, LoaderInfo, StatRecord, Transport};
