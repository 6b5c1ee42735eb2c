//! Spindle
//!
//! Node-shared file resolution server and client.
//!
//! ```text
//! spindle serve                      run the resolution server
//! spindle resolve libm.so.6          resolve through the shared cache
//! spindle stat /usr/lib/libc.so      stat record of a path
//! spindle exists /etc/hosts          existence test
//! spindle scan /usr/lib              list a directory and print its records
//! spindle dump /lib /usr/lib         print the directory cache after scanning
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use spindle::adapters::{SystemEnv, UnixTransport};
use spindle::dircache::{DirBufferIter, DirLookup, DirRecord, DirectoryCache};
use spindle::{Error, Resolution, Resolver, ShmCache, SpindleConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Spindle - node-shared file resolution cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "SPINDLE_CONFIG")]
    config: Option<PathBuf>,

    /// Server socket (overrides server.socket_path)
    #[arg(long, env = "SPINDLE_SOCKET")]
    socket: Option<PathBuf>,

    /// Shared segment file (overrides shm.segment_path)
    #[arg(long, env = "SPINDLE_SEGMENT")]
    segment: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the resolution server
    Serve {
        /// Local store directory (overrides server.store_dir)
        #[arg(long, env = "SPINDLE_STORE_DIR")]
        store_dir: Option<PathBuf>,
    },
    /// Resolve a file through the shared cache
    Resolve {
        path: String,
        /// Do not search the library path for bare names
        #[arg(long)]
        exact: bool,
    },
    /// Print the stat record of a path
    Stat {
        path: String,
        /// Do not follow a final symlink
        #[arg(long)]
        lstat: bool,
    },
    /// Test whether a path exists
    Exists { path: String },
    /// Print the ELF identification of a dynamic loader
    LoaderInfo { path: String },
    /// List a directory and print its encoded records
    Scan { dir: String },
    /// Scan directories and print the resulting directory cache
    Dump { dirs: Vec<String> },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => SpindleConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SpindleConfig::default(),
    };
    if let Some(socket) = &args.socket {
        config.server.socket_path = socket.clone();
    }
    if let Some(segment) = &args.segment {
        config.shm.segment_path = Some(segment.clone());
    }

    match args.command {
        Command::Serve { store_dir } => {
            if let Some(dir) = store_dir {
                config.server.store_dir = dir;
            }
            info!("Starting Spindle server");
            info!("  Socket: {}", config.server.socket_path.display());
            info!("  Store: {}", config.server.store_dir.display());
            info!("  Search path: {}", config.server.search_path.join(":"));
            let stats = spindle::server::serve(&config.server, SystemEnv)
                .await
                .context("server failed")?;
            info!(requests = stats.requests, "Server shutdown complete");
        }
        Command::Resolve { path, exact } => {
            let mut resolver = connect(&config).await?;
            let resolution = if exact {
                resolver.resolve_exact(&path).await?
            } else {
                resolver.resolve(&path).await?
            };
            match resolution {
                Resolution::Found(local) => println!("{}", local),
                Resolution::NotFound { errno } => {
                    println!("not found ({})", std::io::Error::from_raw_os_error(errno))
                }
            }
            resolver.close().await?;
        }
        Command::Stat { path, lstat } => {
            let mut resolver = connect(&config).await?;
            match resolver.stat(&path, lstat).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("not found"),
            }
            resolver.close().await?;
        }
        Command::Exists { path } => {
            let mut resolver = connect(&config).await?;
            let exists = resolver.exists(&path).await?;
            println!("{}", if exists { "yes" } else { "no" });
            resolver.close().await?;
        }
        Command::LoaderInfo { path } => {
            let mut resolver = connect(&config).await?;
            match resolver.loader_info(&path).await? {
                Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                None => println!("not an ELF loader"),
            }
            resolver.close().await?;
        }
        Command::Scan { dir } => {
            let mut cache = DirectoryCache::init();
            let found = cache.scan_directory(&dir)?;
            info!(dir = %dir, result = %found, "Scanned");
            if found == DirLookup::ParsedNotExists {
                return Err(Error::DirectoryNotFound { dir }.into());
            }
            let buffer = cache.serialize_directory(&dir)?;
            for record in DirBufferIter::new(&buffer) {
                match record? {
                    DirRecord::File { name, dir } => println!("{}/{}", dir, name),
                    DirRecord::EmptyDirectory { dir } => println!("{} (empty)", dir),
                    DirRecord::MissingDirectory { dir } => println!("{} (missing)", dir),
                }
            }
        }
        Command::Dump { dirs } => {
            let mut cache = DirectoryCache::init();
            for dir in &dirs {
                cache.scan_directory(dir)?;
            }
            let stdout = std::io::stdout();
            cache.dump(&mut stdout.lock())?;
        }
    }
    Ok(())
}

async fn connect(config: &SpindleConfig) -> anyhow::Result<Resolver<UnixTransport, SystemEnv>> {
    let cache = ShmCache::open(config.shm.clone()).context("opening shared cache")?;
    let transport = UnixTransport::connect(&config.server.socket_path).await?;
    Ok(Resolver::with_config(
        transport,
        SystemEnv,
        Arc::new(cache),
        config.client.clone(),
    ))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("tokio=warn".parse()?)
        .add_directive("mio=warn".parse()?);

    // Logs go to stderr so query answers on stdout stay clean
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}
