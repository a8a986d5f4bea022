//! Pool of re-creatable staging buffers
//!
//! Entries that cannot be written straight into a sequential archive are
//! staged in buffers leased from this pool:
//! - Memory backing: a growable byte vector
//! - Temp-file backing: an anonymous file that is unlinked on creation, so
//!   nothing is left behind even on abnormal exit
//!
//! Every buffer is leased exactly once and released exactly once. The pool
//! only tracks counters, so `allocate` and `release` are safe from any thread.

use crate::error::{FsError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Backing storage for pooled buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PoolBacking {
    /// In-memory byte vectors
    #[default]
    Memory,
    /// Anonymous temporary files
    TempFile,
}

/// Buffer pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers currently leased
    pub active: usize,
    /// Buffers ever allocated
    pub total: u64,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    total: AtomicU64,
}

/// Pool of staging buffers
#[derive(Debug)]
pub struct BufferPool {
    backing: PoolBacking,
    temp_dir: Option<PathBuf>,
    /// Maximum number of simultaneously leased buffers
    max_active: Option<usize>,
    counters: Arc<Counters>,
    closed: AtomicBool,
}

impl BufferPool {
    /// Create a new pool
    ///
    /// # Arguments
    /// * `backing` - Where buffer bytes live
    /// * `temp_dir` - Directory for temp-file buffers (system default if `None`)
    pub fn new(backing: PoolBacking, temp_dir: Option<PathBuf>) -> Self {
        BufferPool {
            backing,
            temp_dir,
            max_active: None,
            counters: Arc::new(Counters::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(PoolBacking::Memory, None)
    }

    pub fn temp_file() -> Self {
        Self::new(PoolBacking::TempFile, None)
    }

    /// Limit the number of simultaneously leased buffers
    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = Some(max_active);
        self
    }

    pub fn backing(&self) -> PoolBacking {
        self.backing
    }

    /// Lease a fresh, empty buffer
    ///
    /// Fails with `PoolExhausted` if temp storage cannot be created, the
    /// lease limit is reached, or the pool has been shut down.
    pub fn allocate(&self) -> Result<Buffer> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::PoolExhausted("pool has been shut down".into()));
        }

        let active = self.counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(max) = self.max_active {
            if active > max {
                self.counters.active.fetch_sub(1, Ordering::AcqRel);
                return Err(FsError::PoolExhausted(format!(
                    "{} buffers already leased",
                    max
                )));
            }
        }

        let storage = match self.create_storage() {
            Ok(storage) => storage,
            Err(e) => {
                self.counters.active.fetch_sub(1, Ordering::AcqRel);
                return Err(FsError::PoolExhausted(e.to_string()));
            }
        };

        let id = self.counters.total.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Allocated buffer-{} ({:?})", id, self.backing);

        Ok(Buffer {
            inner: Arc::new(BufferInner {
                name: format!("buffer-{}", id),
                storage: Mutex::new(storage),
                released: AtomicBool::new(false),
                counters: Arc::clone(&self.counters),
            }),
        })
    }

    fn create_storage(&self) -> io::Result<Storage> {
        match self.backing {
            PoolBacking::Memory => Ok(Storage::Memory(Vec::new())),
            PoolBacking::TempFile => {
                let file = match &self.temp_dir {
                    Some(dir) => tempfile::tempfile_in(dir)?,
                    None => tempfile::tempfile()?,
                };
                Ok(Storage::File(file))
            }
        }
    }

    /// Return a buffer's storage. Releasing the same buffer twice fails with
    /// `BufferReleased` and leaves the counters untouched.
    pub fn release(&self, buffer: &Buffer) -> Result<()> {
        buffer.release()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.counters.active.load(Ordering::Acquire),
            total: self.counters.total.load(Ordering::Acquire),
        }
    }

    /// Refuse further allocations. Buffers still leased keep working until
    /// released; their temp files vanish when the last handle drops.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let active = self.counters.active.load(Ordering::Acquire);
            if active > 0 {
                warn!("Buffer pool shut down with {} buffer(s) still leased", active);
            }
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::in_memory()
    }
}

enum Storage {
    Memory(Vec<u8>),
    File(File),
    Released,
}

impl Storage {
    fn len(&mut self) -> io::Result<u64> {
        match self {
            Storage::Memory(v) => Ok(v.len() as u64),
            Storage::File(f) => Ok(f.metadata()?.len()),
            Storage::Released => Err(released()),
        }
    }

    fn truncate(&mut self) -> io::Result<()> {
        match self {
            Storage::Memory(v) => {
                v.clear();
                Ok(())
            }
            Storage::File(f) => f.set_len(0),
            Storage::Released => Err(released()),
        }
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        match self {
            Storage::Memory(v) => {
                let pos = pos as usize;
                if v.len() < pos + buf.len() {
                    v.resize(pos + buf.len(), 0);
                }
                v[pos..pos + buf.len()].copy_from_slice(buf);
                Ok(buf.len())
            }
            Storage::File(f) => {
                f.seek(SeekFrom::Start(pos))?;
                f.write(buf)
            }
            Storage::Released => Err(released()),
        }
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Storage::Memory(v) => {
                let pos = pos as usize;
                if pos >= v.len() {
                    return Ok(0);
                }
                let n = buf.len().min(v.len() - pos);
                buf[..n].copy_from_slice(&v[pos..pos + n]);
                Ok(n)
            }
            Storage::File(f) => {
                f.seek(SeekFrom::Start(pos))?;
                f.read(buf)
            }
            Storage::Released => Err(released()),
        }
    }
}

fn released() -> io::Error {
    FsError::BufferReleased("storage".into()).into_io()
}

struct BufferInner {
    name: String,
    storage: Mutex<Storage>,
    released: AtomicBool,
    counters: Arc<Counters>,
}

/// Handle to a leased buffer
///
/// Clones share the same storage and the same single lease.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.inner.name)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Buffer {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Current content length
    pub fn len(&self) -> Result<u64> {
        self.check()?;
        Ok(self.inner.storage.lock().len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Open a writer. Truncates previous content so a buffer can be
    /// re-created any number of times.
    pub fn writer(&self) -> Result<BufferWriter> {
        self.check()?;
        self.inner.storage.lock().truncate()?;
        Ok(BufferWriter {
            buffer: self.clone(),
            pos: 0,
        })
    }

    /// Open a reader positioned at the start
    pub fn reader(&self) -> Result<BufferReader> {
        self.check()?;
        Ok(BufferReader {
            buffer: self.clone(),
            pos: 0,
        })
    }

    /// Read the whole content
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.reader()?.read_to_end(&mut out)?;
        Ok(out)
    }

    pub(crate) fn release(&self) -> Result<()> {
        if self
            .inner
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FsError::BufferReleased(self.inner.name.clone()));
        }
        *self.inner.storage.lock() = Storage::Released;
        self.inner.counters.active.fetch_sub(1, Ordering::AcqRel);
        debug!("Released {}", self.inner.name);
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.is_released() {
            Err(FsError::BufferReleased(self.inner.name.clone()))
        } else {
            Ok(())
        }
    }
}

/// Sequential writer into a [`Buffer`]
pub struct BufferWriter {
    buffer: Buffer,
    pos: u64,
}

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.buffer.inner.storage.lock().write_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.buffer.inner.storage.lock() {
            Storage::File(f) => f.flush(),
            Storage::Memory(_) => Ok(()),
            Storage::Released => Err(released()),
        }
    }
}

/// Seekable reader over a [`Buffer`]
pub struct BufferReader {
    buffer: Buffer,
    pos: u64,
}

impl Read for BufferReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.buffer.inner.storage.lock().read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for BufferReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.buffer.inner.storage.lock().len()?;
        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::End(off) => len as i128 + off as i128,
            SeekFrom::Current(off) => self.pos as i128 + off as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of buffer",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
