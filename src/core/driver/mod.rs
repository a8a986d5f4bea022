//! Archive drivers
//!
//! A driver turns container bytes into an entry listing ([`InputService`])
//! and writes a new container entry by entry ([`OutputService`]). The kernel
//! treats drivers as black boxes; the registry maps file name suffixes to
//! drivers and is filled from static configuration at start-up.

pub mod sar;

pub use sar::SarDriver;

use crate::compression::CompressionConfig;
use crate::config::DriverMapping;
use crate::encryption::KeyProvider;
use crate::entry::{Entry, EntryFactory};
use crate::error::{FsError, Result};
use crate::socket::{InputTarget, RawEntry};
use std::any::Any;
use std::collections::BTreeMap;
use std::io::{Read, Seek, Write};
use std::sync::Arc;

/// Seekable container bytes
pub trait Source: Read + Seek + Send {}

impl<T: Read + Seek + Send> Source for T {}

/// Decoded view of an existing container
pub trait InputService: Send + Sync {
    /// All entries in container order
    fn entries(&self) -> Vec<Entry>;

    fn entry(&self, name: &str) -> Option<Entry>;

    /// Socket target reading one entry
    fn input(&self, name: &str) -> Result<Box<dyn InputTarget>>;

    fn as_any(&self) -> &dyn Any;
}

/// Strictly sequential container writer
///
/// Exactly one entry is open at a time: `begin`, any number of `write`s,
/// then `end`.
pub trait OutputService: Send {
    fn begin(&mut self, entry: Entry) -> Result<()>;

    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Finish the open entry and return it as written
    fn end(&mut self) -> Result<Entry>;

    /// True if `raw` can be stored verbatim by this writer
    fn accepts_raw(&self, _raw: &RawEntry) -> bool {
        false
    }

    /// Store an undecoded payload under `entry`'s header. Only called when
    /// [`OutputService::accepts_raw`] returned true.
    fn write_raw(&mut self, entry: Entry, _raw: &RawEntry) -> Result<Entry> {
        Err(FsError::corrupt(entry.name(), "raw copy not supported"))
    }

    /// Drop the open entry, if any, so the next `begin` can proceed
    fn discard(&mut self) {}

    /// Names written so far, in order
    fn written(&self) -> Vec<String>;

    /// Write the trailer and flush the sink
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Capability interface of one archive format
pub trait ArchiveDriver: Send + Sync {
    /// Registry identifier
    fn id(&self) -> &str;

    fn factory(&self) -> &dyn EntryFactory;

    /// Whether the writer can only append
    fn sequential_only(&self) -> bool {
        true
    }

    /// Entry the format requires to be written first, if any
    fn required_head(&self) -> Option<&str> {
        None
    }

    /// Decode the listing of an existing container
    fn new_input(
        &self,
        mount: &str,
        source: Box<dyn Source>,
        keys: &dyn KeyProvider,
    ) -> Result<Arc<dyn InputService>>;

    /// Start a new container. `input` is the current view of the container
    /// being replaced, if any, so codec state can be carried over.
    fn new_output(
        &self,
        mount: &str,
        sink: Box<dyn Write + Send>,
        input: Option<&dyn InputService>,
        keys: &dyn KeyProvider,
    ) -> Result<Box<dyn OutputService>>;

    /// Decode a payload previously taken with [`InputTarget::open_raw`].
    /// `input` is the current view of the container the payload is going
    /// into; its codec state may be needed.
    fn decode_raw(&self, raw: &RawEntry, _input: Option<&dyn InputService>) -> Result<Vec<u8>> {
        Err(FsError::corrupt(raw.entry.name(), "raw payload cannot be decoded"))
    }
}

/// Built-in driver constructors by id
pub fn builtin(id: &str) -> Option<Arc<dyn ArchiveDriver>> {
    let driver: Arc<dyn ArchiveDriver> = match id {
        "sar" => Arc::new(SarDriver::new()),
        "sar-mimetype" => Arc::new(SarDriver::with_head("mimetype")),
        "sar-zstd" => Arc::new(
            SarDriver::new()
                .with_compression(CompressionConfig::zstd())
                .named(id),
        ),
        "sar-encrypted" => Arc::new(SarDriver::new().encrypted().named(id)),
        _ => return None,
    };
    Some(driver)
}

/// Suffix → driver mapping
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn ArchiveDriver>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.drivers.iter().map(|(k, v)| (k, v.id())))
            .finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured mappings, resolving ids against the built-ins
    pub fn from_mappings(mappings: &[DriverMapping]) -> Result<Self> {
        let mut registry = Self::new();
        for mapping in mappings {
            let driver = builtin(&mapping.driver)
                .ok_or_else(|| FsError::Config(format!("unknown driver {:?}", mapping.driver)))?;
            registry.register(&mapping.suffix, driver);
        }
        Ok(registry)
    }

    /// Map `suffix` (without the dot, case-insensitive) to `driver`
    pub fn register(&mut self, suffix: &str, driver: Arc<dyn ArchiveDriver>) -> &mut Self {
        self.drivers
            .insert(suffix.trim_start_matches('.').to_ascii_lowercase(), driver);
        self
    }

    /// Driver for a path segment such as `docs.sar`
    pub fn driver_for(&self, segment: &str) -> Option<Arc<dyn ArchiveDriver>> {
        let idx = segment.rfind('.')?;
        if idx == 0 {
            return None;
        }
        self.drivers
            .get(&segment[idx + 1..].to_ascii_lowercase())
            .cloned()
    }

    pub fn suffixes(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let mut registry = DriverRegistry::new();
        registry.register("sar", builtin("sar").unwrap());
        registry.register(".OSAR", builtin("sar-mimetype").unwrap());

        assert_eq!(registry.driver_for("a.sar").unwrap().id(), "sar");
        assert_eq!(registry.driver_for("A.SAR").unwrap().id(), "sar");
        assert_eq!(registry.driver_for("b.osar").unwrap().id(), "sar-mimetype");
        assert!(registry.driver_for(".sar").is_none());
        assert!(registry.driver_for("plain.txt").is_none());
        assert!(registry.driver_for("noext").is_none());
    }

    #[test]
    fn test_from_mappings_rejects_unknown_driver() {
        let mappings = vec![DriverMapping {
            suffix: "zip".into(),
            driver: "zip".into(),
        }];
        assert!(matches!(
            DriverRegistry::from_mappings(&mappings),
            Err(FsError::Config(_))
        ));
    }

    #[test]
    fn test_builtins_declare_head() {
        assert_eq!(builtin("sar-mimetype").unwrap().required_head(), Some("mimetype"));
        assert_eq!(builtin("sar").unwrap().required_head(), None);
        assert!(builtin("sar").unwrap().sequential_only());
    }
}
