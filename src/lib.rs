//! # Nestar - Federated Archive File System
//!
//! `nestar-rs` lets you treat archive files as directories. A path may run
//! through any number of nested archives:
//!
//! - **Transparent nesting**: `backup.sar/photos.sar/2024/img.jpg` just works
//! - **Lazy mounting**: archives are parsed on first access
//! - **Out-of-order writes** over sequential archive formats, buffered in a
//!   shared pool
//! - **Explicit sync**: changes are written back innermost first, failures
//!   are collected in one chain
//! - **Raw copies**: entries move between archives of the same format
//!   without decompressing or decrypting
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nestar_rs::{FsBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let fs = FsBuilder::new().build()?;
//!
//! // Creates backup.sar and inner.sar on the next sync
//! fs.write("backup.sar/inner.sar/notes/today.txt", b"Hello, World!")?;
//! let content = fs.read("backup.sar/inner.sar/notes/today.txt")?;
//! assert_eq!(content, b"Hello, World!");
//!
//! if let Err(chain) = fs.umount() {
//!     eprintln!("{}", chain);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use nestar_rs::{FsBuilder, FsConfig, Result, StaticKeys};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let fs = FsBuilder::new()
//!     .config(FsConfig::load("nestar.toml")?)
//!     .keys(Arc::new(StaticKeys::with_default("secret")))
//!     .with_tracing()
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{
    buffer_pool, compression, config, controller, driver, encryption, entry, error, events,
    manager, model, mux, socket, sync,
};

// Re-export core types that users need
pub use crate::core::{
    buffer_pool::{Buffer, BufferPool, PoolBacking, PoolStats},
    compression::{CompressionConfig, CompressionMethod},
    config::{DriverMapping, FsConfig, PoolConfig, SyncConfig},
    controller::{ArchiveController, MountOptions},
    driver::{ArchiveDriver, DriverRegistry, SarDriver},
    encryption::{KeyProvider, NoKeys, StaticKeys},
    entry::{Access, Entry, EntryType},
    error::{FsError, Result},
    events::{Event, EventSink, NoopSink, RecordingSink, TracingSink},
    manager::{FsManager, Location},
    model::{ArchiveFileSystem, MknodOptions, TouchEvent, TouchKind, TouchListener},
    mux::MultiplexedOutput,
    socket::{InputSocket, OutputSocket, OutputStream},
    sync::{Severity, SyncErrorChain, SyncException, SyncOptions},
};

use std::sync::Arc;
use tracing::debug;

/// Builder for a configured [`FsManager`]
///
/// # Examples
///
/// ```rust,no_run
/// use nestar_rs::{FsBuilder, SarDriver};
/// use std::sync::Arc;
///
/// # fn main() -> nestar_rs::Result<()> {
/// let fs = FsBuilder::new()
///     .driver("pak", Arc::new(SarDriver::new().encrypted()))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct FsBuilder {
    config: FsConfig,
    extra: Vec<(String, Arc<dyn ArchiveDriver>)>,
    keys: Arc<dyn KeyProvider>,
    sink: Arc<dyn EventSink>,
}

impl FsBuilder {
    /// Default configuration, no keys, no instrumentation
    pub fn new() -> Self {
        FsBuilder {
            config: FsConfig::default(),
            extra: Vec::new(),
            keys: Arc::new(NoKeys),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn config(mut self, config: FsConfig) -> Self {
        self.config = config;
        self
    }

    /// Register `driver` for `suffix`, overriding the configured mapping
    pub fn driver(mut self, suffix: impl Into<String>, driver: Arc<dyn ArchiveDriver>) -> Self {
        self.extra.push((suffix.into(), driver));
        self
    }

    /// Secrets for encrypted containers
    pub fn keys(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = keys;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Report kernel events through `tracing`
    pub fn with_tracing(self) -> Self {
        self.sink(Arc::new(TracingSink))
    }

    pub fn build(self) -> Result<FsManager> {
        let mut registry = DriverRegistry::from_mappings(&self.config.drivers)?;
        for (suffix, driver) in self.extra {
            debug!("Registering driver {} for .{}", driver.id(), suffix);
            registry.register(&suffix, driver);
        }
        Ok(FsManager::new(self.config, registry, self.keys, self.sink))
    }
}

impl Default for FsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Virtual Filesystem trait for unified storage interface
///
/// Lets code work against the federated file system without knowing which
/// paths are host files and which are archive entries.
///
/// # Examples
///
/// ```rust,no_run
/// use nestar_rs::{FsBuilder, Vfs};
///
/// fn total_size<V: Vfs>(vfs: &V, dir: &str) -> nestar_rs::Result<u64> {
///     let mut total = 0;
///     for name in vfs.list(dir)? {
///         let path = format!("{}/{}", dir, name);
///         if !vfs.is_dir(&path)? {
///             total += vfs.metadata(&path)?.size().unwrap_or(0);
///         }
///     }
///     Ok(total)
/// }
///
/// let fs = FsBuilder::new().build()?;
/// println!("{}", total_size(&fs, "backup.sar")?);
/// # Ok::<(), nestar_rs::FsError>(())
/// ```
pub trait Vfs {
    /// Names of the immediate children of a directory
    fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Read the contents of a file
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write or replace a file, creating parent directories as needed
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Delete a file or an empty directory
    fn delete(&self, path: &str) -> Result<()>;

    fn exists(&self, path: &str) -> Result<bool>;

    /// Check if a path is a directory (archives count as directories)
    fn is_dir(&self, path: &str) -> Result<bool>;

    fn metadata(&self, path: &str) -> Result<Entry>;
}

impl Vfs for FsManager {
    fn list(&self, path: &str) -> Result<Vec<String>> {
        FsManager::list(self, path)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        FsManager::read(self, path)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        FsManager::write(self, path, data)
    }

    fn delete(&self, path: &str) -> Result<()> {
        FsManager::delete(self, path)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path)?.is_directory())
    }

    fn metadata(&self, path: &str) -> Result<Entry> {
        self.stat(path)
    }
}
