//! Multiplexing output service
//!
//! Sequential archive writers accept one entry at a time, in the order the
//! format dictates. [`MultiplexedOutput`] lets callers open entries in any
//! order: an entry streams straight into the writer when nothing else is in
//! the way, otherwise it is staged in a pooled buffer and written later,
//! strictly in the order it was requested.
//!
//! A driver may require a head entry (for instance `mimetype`). Until it has
//! been written every other entry is staged, and the service reports busy.
//!
//! One writer thread per mount is assumed.

use crate::buffer_pool::{Buffer, BufferPool, BufferWriter};
use crate::driver::OutputService;
use crate::entry::Entry;
use crate::error::{FsError, Result};
use crate::socket::{OutputStream, RawEntry};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

const CHUNK: usize = 64 * 1024;

struct Pending {
    id: u64,
    entry: Entry,
    buffer: Buffer,
    closed: bool,
}

struct MuxState {
    mount: String,
    /// `None` once the service has been closed
    service: Option<Box<dyn OutputService>>,
    /// Entry currently streaming straight into the service
    direct: Option<String>,
    /// Staged entries in request order
    pending: Vec<Pending>,
    next_id: u64,
    required_head: Option<String>,
    head_seen: bool,
    written: Vec<Entry>,
}

impl MuxState {
    fn head_resolved(&self) -> bool {
        self.required_head.is_none() || self.head_seen
    }

    fn can_write_directly(&self, name: &str) -> bool {
        if self.service.is_none() || self.direct.is_some() {
            return false;
        }
        match &self.required_head {
            Some(head) if !self.head_seen => name == head,
            _ => self.pending.is_empty(),
        }
    }

    fn record(&mut self, entry: Entry) {
        if self.required_head.as_deref() == Some(entry.name()) {
            self.head_seen = true;
        }
        self.written.push(entry);
    }

    fn service(&mut self) -> Result<&mut Box<dyn OutputService>> {
        let mount = &self.mount;
        self.service
            .as_mut()
            .ok_or_else(|| FsError::ForcedClosed(mount.clone()))
    }

    /// Copy one staged entry into the service
    fn write_pending(&mut self, entry: &Entry, buffer: &Buffer) -> Result<()> {
        let mut reader = buffer.reader()?;
        let service = self.service()?;
        service.begin(entry.clone())?;
        let copied = (|| -> Result<Entry> {
            let mut chunk = vec![0u8; CHUNK];
            loop {
                let n = reader.read(&mut chunk).map_err(FsError::from_io)?;
                if n == 0 {
                    break;
                }
                service.write(&chunk[..n])?;
            }
            service.end()
        })();
        match copied {
            Ok(written) => {
                self.record(written);
                Ok(())
            }
            Err(e) => {
                service.discard();
                Err(e)
            }
        }
    }

    /// Write out closed staged entries from the front of the queue. Stops at
    /// the first entry still being written. Every drained buffer is released
    /// exactly once, whatever happens to its entry.
    fn drain(&mut self) -> Vec<FsError> {
        let mut errors = Vec::new();
        if self.direct.is_some() || !self.head_resolved() {
            return errors;
        }
        while self.pending.first().map(|p| p.closed).unwrap_or(false) {
            let p = self.pending.remove(0);
            if let Err(e) = self.write_pending(&p.entry, &p.buffer) {
                warn!("Failed to drain {:?} into {}: {}", p.entry.name(), self.mount, e);
                errors.push(e);
            }
            if let Err(e) = p.buffer.release() {
                errors.push(e);
            }
        }
        errors
    }
}

fn collect(mut errors: Vec<FsError>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(FsError::Drain(errors)),
    }
}

/// Adapts a sequential [`OutputService`] to out-of-order entry requests
pub struct MultiplexedOutput {
    state: Arc<Mutex<MuxState>>,
    pool: Arc<BufferPool>,
}

impl std::fmt::Debug for MultiplexedOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MultiplexedOutput")
            .field("mount", &state.mount)
            .field("direct", &state.direct)
            .field("pending", &state.pending.len())
            .field("head_seen", &state.head_seen)
            .finish()
    }
}

impl MultiplexedOutput {
    pub fn new(
        mount: impl Into<String>,
        service: Box<dyn OutputService>,
        pool: Arc<BufferPool>,
        required_head: Option<String>,
    ) -> Self {
        MultiplexedOutput {
            state: Arc::new(Mutex::new(MuxState {
                mount: mount.into(),
                service: Some(service),
                direct: None,
                pending: Vec::new(),
                next_id: 0,
                required_head,
                head_seen: false,
                written: Vec::new(),
            })),
            pool,
        }
    }

    /// Open a stream for `entry`
    ///
    /// Streams directly if possible, otherwise leases a buffer first, so a
    /// `PoolExhausted` failure leaves nothing behind.
    pub fn output(&self, entry: Entry) -> Result<Box<dyn OutputStream>> {
        let mut state = self.state.lock();
        let name = entry.name().to_string();
        if state.can_write_directly(&name) {
            state.service()?.begin(entry)?;
            state.direct = Some(name.clone());
            return Ok(Box::new(DirectStream {
                state: Arc::clone(&self.state),
                name,
                closed: false,
            }));
        }
        if state.service.is_none() {
            return Err(FsError::ForcedClosed(state.mount.clone()));
        }

        let buffer = self.pool.allocate()?;
        let writer = match buffer.writer() {
            Ok(w) => w,
            Err(e) => {
                let _ = buffer.release();
                return Err(e);
            }
        };
        let id = state.next_id;
        state.next_id += 1;
        debug!("Staging {:?} of {} in {}", name, state.mount, buffer.name());
        state.pending.push(Pending {
            id,
            entry,
            buffer,
            closed: false,
        });
        Ok(Box::new(BufferedStream {
            state: Arc::clone(&self.state),
            id,
            name,
            writer,
            closed: false,
        }))
    }

    /// Store an undecoded payload if the entry could be written directly
    /// right now and the writer accepts it. Returns false when the caller
    /// has to stream decoded bytes instead.
    pub fn output_raw(&self, entry: Entry, raw: &RawEntry) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.can_write_directly(entry.name()) {
            return Ok(false);
        }
        let service = state.service()?;
        if !service.accepts_raw(raw) {
            return Ok(false);
        }
        let written = service.write_raw(entry, raw)?;
        state.record(written);
        let errors = state.drain();
        collect(errors)?;
        Ok(true)
    }

    /// True while a stream is open, a staged entry waits or the required
    /// head is missing. [`MultiplexedOutput::close`] drains a busy output
    /// anyway; see [`crate::controller::ArchiveController::is_busy`].
    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.direct.is_some() || !state.pending.is_empty() || !state.head_resolved()
    }

    /// Names of staged entries in request order
    pub fn pending(&self) -> Vec<String> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|p| p.entry.name().to_string())
            .collect()
    }

    /// Entries written to the service so far
    pub fn written(&self) -> Vec<Entry> {
        self.state.lock().written.clone()
    }

    /// Drain everything and finish the underlying writer
    ///
    /// Streams still open are cut short: what they wrote so far is kept and
    /// their entry names are reported in [`Closed::forced`]. A missing
    /// required head does not block closing.
    pub fn close(self) -> Result<Closed> {
        let mut state = self.state.lock();
        let mut errors = Vec::new();
        let mut forced = Vec::new();

        if let Some(name) = state.direct.take() {
            forced.push(name);
            let service = state.service()?;
            match service.end() {
                Ok(e) => state.record(e),
                Err(e) => {
                    service.discard();
                    errors.push(e);
                }
            }
        }
        if !state.head_resolved() {
            if let Some(head) = &state.required_head {
                warn!("{} closed without required entry {:?}", state.mount, head);
            }
            state.head_seen = true;
        }
        for p in state.pending.iter_mut().filter(|p| !p.closed) {
            p.closed = true;
            forced.push(p.entry.name().to_string());
        }
        if !forced.is_empty() {
            warn!("Cut short {} open stream(s) of {}", forced.len(), state.mount);
        }
        let drained = state.drain();
        errors.extend(drained);

        if let Some(service) = state.service.take() {
            if let Err(e) = service.finish() {
                errors.push(e);
            }
        }
        let written = std::mem::take(&mut state.written);
        debug!("Closed output of {} ({} entries)", state.mount, written.len());
        collect(errors).map(|_| Closed { written, forced })
    }

    /// Give up: release every staged buffer and drop the writer unfinished
    pub fn abort(self) {
        let mut state = self.state.lock();
        state.direct = None;
        for p in std::mem::take(&mut state.pending) {
            if let Err(e) = p.buffer.release() {
                warn!("Releasing {} failed: {}", p.buffer.name(), e);
            }
        }
        state.service = None;
        debug!("Aborted output of {}", state.mount);
    }
}

/// Outcome of [`MultiplexedOutput::close`]
#[derive(Debug, Default)]
pub struct Closed {
    /// Every entry written, in container order
    pub written: Vec<Entry>,
    /// Entries whose streams were still open
    pub forced: Vec<String>,
}

struct DirectStream {
    state: Arc<Mutex<MuxState>>,
    name: String,
    closed: bool,
}

impl Write for DirectStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if self.closed || state.direct.as_deref() != Some(self.name.as_str()) {
            return Err(FsError::ForcedClosed(self.name.clone()).into_io());
        }
        state
            .service()
            .and_then(|s| s.write(buf))
            .map_err(FsError::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl OutputStream for DirectStream {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.state.lock();
        if state.direct.as_deref() != Some(self.name.as_str()) {
            return Err(FsError::ForcedClosed(self.name.clone()));
        }
        state.direct = None;

        let mut errors = Vec::new();
        let service = state.service()?;
        match service.end() {
            Ok(entry) => state.record(entry),
            Err(e) => {
                service.discard();
                errors.push(e);
            }
        }
        errors.extend(state.drain());
        collect(errors)
    }
}

impl Drop for DirectStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Closing {:?} on drop failed: {}", self.name, e);
        }
    }
}

struct BufferedStream {
    state: Arc<Mutex<MuxState>>,
    id: u64,
    name: String,
    writer: BufferWriter,
    closed: bool,
}

impl BufferedStream {
    fn check_open(&self) -> io::Result<()> {
        let state = self.state.lock();
        let staged = state.pending.iter().any(|p| p.id == self.id && !p.closed);
        if self.closed || !staged {
            return Err(FsError::ForcedClosed(self.name.clone()).into_io());
        }
        Ok(())
    }
}

impl Write for BufferedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()?;
        self.writer.flush()
    }
}

impl OutputStream for BufferedStream {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.flush()?;

        let mut state = self.state.lock();
        let size = {
            let pending = state
                .pending
                .iter_mut()
                .find(|p| p.id == self.id && !p.closed)
                .ok_or_else(|| FsError::ForcedClosed(self.name.clone()))?;
            pending.closed = true;
            pending.buffer.len()?
        };
        debug!("Staged {:?} ({} bytes)", self.name, size);
        let errors = state.drain();
        collect(errors)
    }
}

impl Drop for BufferedStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Closing {:?} on drop failed: {}", self.name, e);
        }
    }
}
