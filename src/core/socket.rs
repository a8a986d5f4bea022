//! I/O sockets
//!
//! A socket is "a thing that can produce a stream" for one entry. Input and
//! output sockets can be peered so that the target on either side can inspect
//! the other end of a transfer before choosing how to open its stream. The
//! peer link is a plain, non-owning back-reference: dropping a socket never
//! keeps its peer alive, and rebinding one side clears the former peer's link.
//!
//! Sockets never buffer. Buffering belongs to the caller or to the
//! multiplexer.

use crate::entry::Entry;
use crate::error::{FsError, Result};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Output stream with an explicit, fallible close
pub trait OutputStream: Write + Send {
    /// Finish the entry. Must be idempotent.
    fn close(&mut self) -> Result<()>;

    /// True if the stream already took its content from the peer socket
    /// and expects no further data.
    fn satisfied(&self) -> bool {
        false
    }
}

/// Undecoded entry payload, used for copies that skip decode/encode
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub entry: Entry,
    /// Identifies the codec state (format, key) the payload is bound to
    pub codec: String,
    pub payload: Vec<u8>,
    pub crc: u32,
}

/// Source side of a socket
pub trait InputTarget: Send + Sync {
    /// Resolve the entry this socket reads
    fn target(&self) -> Result<Entry>;

    /// Open a decoded stream
    fn open(&self, peer: Option<&OutputSocket>) -> Result<Box<dyn Read + Send>>;

    /// Undecoded payload, if the format can hand it out
    fn open_raw(&self) -> Option<Result<RawEntry>> {
        None
    }

    fn before_peering(&self) {}

    fn after_peering(&self) {}
}

/// Sink side of a socket
pub trait OutputTarget: Send + Sync {
    /// Resolve the entry this socket writes
    fn target(&self) -> Result<Entry>;

    fn open(&self, peer: Option<&InputSocket>) -> Result<Box<dyn OutputStream>>;

    fn before_peering(&self) {}

    fn after_peering(&self) {}
}

enum Target {
    Input(Box<dyn InputTarget>),
    Output(Box<dyn OutputTarget>),
}

struct Core {
    id: u64,
    target: Target,
    peer: Mutex<Option<Weak<Core>>>,
    /// Streams obtained from this socket and not yet dropped
    active: AtomicUsize,
}

impl Core {
    fn new(target: Target) -> Arc<Core> {
        Arc::new(Core {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            target,
            peer: Mutex::new(None),
            active: AtomicUsize::new(0),
        })
    }

    fn peer(&self) -> Option<Arc<Core>> {
        self.peer.lock().as_ref().and_then(Weak::upgrade)
    }

    fn is_peer(&self, other: &Arc<Core>) -> bool {
        self.peer()
            .map(|p| Arc::ptr_eq(&p, other))
            .unwrap_or(false)
    }

    fn before_peering(&self) {
        match &self.target {
            Target::Input(t) => t.before_peering(),
            Target::Output(t) => t.before_peering(),
        }
    }

    fn after_peering(&self) {
        match &self.target {
            Target::Input(t) => t.after_peering(),
            Target::Output(t) => t.after_peering(),
        }
    }

    /// Clear this core's link and the former peer's back-reference to it
    fn detach(self: &Arc<Core>) {
        let old = self.peer.lock().take().and_then(|w| w.upgrade());
        if let Some(old) = old {
            let mut back = old.peer.lock();
            let points_here = back
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|p| Arc::ptr_eq(&p, self))
                .unwrap_or(false);
            if points_here {
                *back = None;
            }
        }
    }
}

fn link(a: &Arc<Core>, b: &Arc<Core>) -> Result<()> {
    if a.is_peer(b) && b.is_peer(a) {
        return Ok(());
    }
    if a.active.load(Ordering::Acquire) > 0 || b.active.load(Ordering::Acquire) > 0 {
        return Err(FsError::IllegalPeering);
    }

    a.before_peering();
    b.before_peering();

    a.detach();
    b.detach();
    *a.peer.lock() = Some(Arc::downgrade(b));
    *b.peer.lock() = Some(Arc::downgrade(a));

    a.after_peering();
    b.after_peering();
    Ok(())
}

fn unlink(a: &Arc<Core>) -> Result<()> {
    if a.peer.lock().is_none() {
        return Ok(());
    }
    if a.active.load(Ordering::Acquire) > 0 {
        return Err(FsError::IllegalPeering);
    }
    a.before_peering();
    a.detach();
    a.after_peering();
    Ok(())
}

/// Handle to an input socket. Clones address the same socket.
#[derive(Clone)]
pub struct InputSocket {
    core: Arc<Core>,
}

/// Handle to an output socket. Clones address the same socket.
#[derive(Clone)]
pub struct OutputSocket {
    core: Arc<Core>,
}

impl std::fmt::Debug for InputSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InputSocket#{}", self.core.id)
    }
}

impl std::fmt::Debug for OutputSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutputSocket#{}", self.core.id)
    }
}

impl InputSocket {
    pub fn new(target: impl InputTarget + 'static) -> Self {
        InputSocket {
            core: Core::new(Target::Input(Box::new(target))),
        }
    }

    fn input(&self) -> &dyn InputTarget {
        match &self.core.target {
            Target::Input(t) => t.as_ref(),
            // Constructors only ever build input cores for InputSocket
            Target::Output(_) => unreachable!("input socket with output target"),
        }
    }

    pub fn target(&self) -> Result<Entry> {
        self.input().target()
    }

    pub fn open_raw(&self) -> Option<Result<RawEntry>> {
        self.input().open_raw()
    }

    /// Current peer, if bound and still alive
    pub fn peer(&self) -> Option<OutputSocket> {
        self.core.peer().map(|core| OutputSocket { core })
    }

    /// Peer with `output`. Idempotent if already peered with it.
    pub fn bind(&self, output: &OutputSocket) -> Result<()> {
        link(&self.core, &output.core)
    }

    pub fn unbind(&self) -> Result<()> {
        unlink(&self.core)
    }

    /// Open a decoded input stream, passing the current peer to the target
    pub fn stream(&self) -> Result<Box<dyn Read + Send>> {
        let peer = self.peer();
        let inner = self.input().open(peer.as_ref())?;
        self.core.active.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(ActiveRead {
            inner,
            core: Arc::clone(&self.core),
        }))
    }

    /// Number of streams from this socket still in use
    pub fn active_streams(&self) -> usize {
        self.core.active.load(Ordering::Acquire)
    }
}

impl OutputSocket {
    pub fn new(target: impl OutputTarget + 'static) -> Self {
        OutputSocket {
            core: Core::new(Target::Output(Box::new(target))),
        }
    }

    fn output(&self) -> &dyn OutputTarget {
        match &self.core.target {
            Target::Output(t) => t.as_ref(),
            // Constructors only ever build output cores for OutputSocket
            Target::Input(_) => unreachable!("output socket with input target"),
        }
    }

    pub fn target(&self) -> Result<Entry> {
        self.output().target()
    }

    pub fn peer(&self) -> Option<InputSocket> {
        self.core.peer().map(|core| InputSocket { core })
    }

    pub fn bind(&self, input: &InputSocket) -> Result<()> {
        link(&self.core, &input.core)
    }

    pub fn unbind(&self) -> Result<()> {
        unlink(&self.core)
    }

    pub fn stream(&self) -> Result<Box<dyn OutputStream>> {
        let peer = self.peer();
        let inner = self.output().open(peer.as_ref())?;
        self.core.active.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(ActiveWrite {
            inner,
            core: Arc::clone(&self.core),
        }))
    }

    pub fn active_streams(&self) -> usize {
        self.core.active.load(Ordering::Acquire)
    }
}

struct ActiveRead {
    inner: Box<dyn Read + Send>,
    core: Arc<Core>,
}

impl Read for ActiveRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for ActiveRead {
    fn drop(&mut self) {
        self.core.active.fetch_sub(1, Ordering::AcqRel);
    }
}

struct ActiveWrite {
    inner: Box<dyn OutputStream>,
    core: Arc<Core>,
}

impl Write for ActiveWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl OutputStream for ActiveWrite {
    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn satisfied(&self) -> bool {
        self.inner.satisfied()
    }
}

impl Drop for ActiveWrite {
    fn drop(&mut self) {
        self.core.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Copy one entry from `input` to `output`
///
/// Binds the sockets, opens the output first so its target may take the
/// payload straight from the peer, otherwise streams decoded bytes. Returns
/// the number of decoded bytes streamed (0 when the fast path was taken).
pub fn copy(input: &InputSocket, output: &OutputSocket) -> Result<u64> {
    output.bind(input)?;
    let result = copy_bound(input, output);
    // Streams are dropped by now, so unbinding cannot be refused
    output.unbind()?;
    result
}

fn copy_bound(input: &InputSocket, output: &OutputSocket) -> Result<u64> {
    let mut out = output.stream()?;
    if out.satisfied() {
        out.close()?;
        return Ok(0);
    }
    let copied = {
        let mut inp = input.stream()?;
        io::copy(&mut inp, &mut *out).map_err(FsError::from_io)
    };
    match copied {
        Ok(n) => {
            out.close()?;
            Ok(n)
        }
        Err(e) => {
            // Keep the first failure; the close error adds nothing
            let _ = out.close();
            Err(e)
        }
    }
}
