//! Archive controller
//!
//! One controller per mounted container. It mounts lazily, hands out entry
//! sockets, keeps entries written since the last sync in a multiplexed
//! output, and on sync writes a complete new container:
//! - host containers go to a temp file next to the original, which is then
//!   persisted over it
//! - nested containers are staged in a pooled buffer and written into the
//!   parent mount as an entry
//!
//! Every entry written since the last successful sync also keeps a copy
//! (a pooled buffer, or the stored payload of a verbatim copy) so a failed
//! flush loses nothing: the next flush writes the copies instead.
//!
//! Lock order is child before parent: a controller may call into its parent
//! while holding its own state, never the other way round.

use crate::buffer_pool::{Buffer, BufferPool, BufferWriter};
use crate::driver::{ArchiveDriver, InputService, Source};
use crate::encryption::KeyProvider;
use crate::entry::{self, now_millis, Access, Entry, EntryFactory, EntryType, ROOT};
use crate::error::{FsError, Result};
use crate::events::{EventSink, StreamKind};
use crate::model::{ArchiveFileSystem, MknodOptions, TouchEvent, TouchListener};
use crate::mux::MultiplexedOutput;
use crate::socket::{
    InputSocket, InputTarget, OutputSocket, OutputStream, OutputTarget, RawEntry,
};
use crate::sync::{SyncErrorChain, SyncOptions};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Flush passes before giving up on a model that keeps changing
const MAX_FLUSH_PASSES: usize = 4;

/// Services shared by every mount of one manager
pub struct MountContext {
    pub pool: Arc<BufferPool>,
    pub keys: Arc<dyn KeyProvider>,
    pub sink: Arc<dyn EventSink>,
}

/// Where a container's bytes live
pub enum Parent {
    /// A file on the host file system
    Host(PathBuf),
    /// An entry of another mount
    Archive {
        controller: Arc<ArchiveController>,
        entry: String,
    },
}

/// Mount options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
}

struct DriverFactory(Arc<dyn ArchiveDriver>);

impl EntryFactory for DriverFactory {
    fn new_entry(&self, name: &str, entry_type: EntryType, template: Option<&Entry>) -> Entry {
        self.0.factory().new_entry(name, entry_type, template)
    }
}

/// Forwards model touches to the event sink
struct SinkListener {
    mount: String,
    sink: Arc<dyn EventSink>,
}

impl TouchListener for SinkListener {
    fn before_touch(&self, event: &TouchEvent) {
        self.sink.before_touch(&self.mount, event);
    }

    fn after_touch(&self, event: &TouchEvent) {
        self.sink.after_touch(&self.mount, event);
    }
}

/// Destination of a new container
enum Target {
    Host(NamedTempFile),
    Buffer(Buffer),
}

impl Target {
    fn discard(self) {
        match self {
            // Deleted on drop
            Target::Host(temp) => drop(temp),
            Target::Buffer(buffer) => {
                if let Err(e) = buffer.release() {
                    warn!("Releasing {} failed: {}", buffer.name(), e);
                }
            }
        }
    }
}

struct Output {
    mux: MultiplexedOutput,
    target: Target,
}

/// Content of an entry written since the last successful sync
enum Shadow {
    Staged(Buffer),
    /// Taken verbatim from a peer in this mount's codec
    Raw(RawEntry),
}

impl Shadow {
    fn discard(self) {
        if let Shadow::Staged(buffer) = self {
            if let Err(e) = buffer.release() {
                warn!("Releasing {} failed: {}", buffer.name(), e);
            }
        }
    }
}

impl Output {
    fn abort(self) {
        self.mux.abort();
        self.target.discard();
    }
}

#[derive(Default)]
struct MountState {
    model: Option<Arc<ArchiveFileSystem>>,
    input: Option<Arc<dyn InputService>>,
    /// Buffer backing `input` of a nested mount
    staged: Option<Buffer>,
    output: Option<Output>,
    /// Entries written to `output` since the last sync
    written: HashSet<String>,
    /// Copies of everything written since the last successful sync,
    /// including entries whose output was lost to a failed flush
    shadows: HashMap<String, Shadow>,
}

impl MountState {
    fn keep_shadow(&mut self, name: &str, shadow: Shadow) {
        if let Some(old) = self.shadows.insert(name.to_string(), shadow) {
            old.discard();
        }
    }

    fn drop_shadow(&mut self, name: &str) {
        if let Some(old) = self.shadows.remove(name) {
            old.discard();
        }
    }

    fn clear_shadows(&mut self) {
        for (_, shadow) in self.shadows.drain() {
            shadow.discard();
        }
    }
}

/// Where the content of an entry comes from when it is read
enum Origin {
    Stored(Box<dyn InputTarget>),
    Shadow(Box<dyn Read + Send>),
    Empty,
}

/// Open entry streams of one mount
#[derive(Default)]
struct StreamRegistry {
    next: AtomicU64,
    open: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl StreamRegistry {
    fn register(self: &Arc<Self>) -> StreamGuard {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let closed = Arc::new(AtomicBool::new(false));
        self.open.lock().insert(id, Arc::clone(&closed));
        StreamGuard {
            id,
            closed,
            registry: Arc::clone(self),
        }
    }

    fn count(&self) -> usize {
        self.open.lock().len()
    }

    /// Flag every open stream closed and forget them
    fn close_all(&self) -> usize {
        let mut open = self.open.lock();
        for flag in open.values() {
            flag.store(true, Ordering::Release);
        }
        let n = open.len();
        open.clear();
        n
    }
}

struct StreamGuard {
    id: u64,
    closed: Arc<AtomicBool>,
    registry: Arc<StreamRegistry>,
}

impl StreamGuard {
    fn check(&self, name: &str) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FsError::ForcedClosed(name.to_string()).into_io())
        } else {
            Ok(())
        }
    }

    fn is_forced(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.registry.open.lock().remove(&self.id);
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.release();
    }
}

struct TrackedRead {
    inner: Box<dyn Read + Send>,
    guard: StreamGuard,
    name: String,
}

impl Read for TrackedRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.guard.check(&self.name)?;
        self.inner.read(buf)
    }
}

struct TrackedWrite {
    inner: Box<dyn OutputStream>,
    shadow: BufferWriter,
    guard: StreamGuard,
    name: String,
    model: Arc<ArchiveFileSystem>,
    written: u64,
}

impl Write for TrackedWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.check(&self.name)?;
        let n = self.inner.write(buf)?;
        self.shadow.write_all(&buf[..n])?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.check(&self.name)?;
        self.shadow.flush()?;
        self.inner.flush()
    }
}

impl OutputStream for TrackedWrite {
    fn close(&mut self) -> Result<()> {
        if self.guard.is_forced() {
            return Err(FsError::ForcedClosed(self.name.clone()));
        }
        self.inner.close()?;
        self.guard.release();
        if let Some(e) = self.model.entry(&self.name) {
            self.model.refresh([e.with_size(Some(self.written))]);
        }
        Ok(())
    }

    fn satisfied(&self) -> bool {
        self.inner.satisfied()
    }
}

/// Returned when the content was taken from the peer without decoding
struct Satisfied(String);

impl Write for Satisfied {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} was already copied from its peer", self.0),
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl OutputStream for Satisfied {
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn satisfied(&self) -> bool {
        true
    }
}

struct ControllerInput {
    controller: Arc<ArchiveController>,
    name: String,
}

impl InputTarget for ControllerInput {
    fn target(&self) -> Result<Entry> {
        self.controller
            .stat(&self.name)?
            .ok_or_else(|| FsError::NotFound(self.controller.path_of(&self.name)))
    }

    fn open(&self, peer: Option<&OutputSocket>) -> Result<Box<dyn Read + Send>> {
        self.controller.open_input(&self.name, peer)
    }

    fn open_raw(&self) -> Option<Result<RawEntry>> {
        self.controller.open_raw(&self.name)
    }
}

struct ControllerOutput {
    controller: Arc<ArchiveController>,
    name: String,
    template: Option<Entry>,
}

impl OutputTarget for ControllerOutput {
    fn target(&self) -> Result<Entry> {
        Ok(self.controller.driver.factory().new_entry(
            &self.name,
            EntryType::File,
            self.template.as_ref(),
        ))
    }

    fn open(&self, peer: Option<&InputSocket>) -> Result<Box<dyn OutputStream>> {
        self.controller
            .open_output(&self.name, self.template.as_ref(), peer)
    }
}

/// One mounted container
pub struct ArchiveController {
    mount: String,
    parent: Parent,
    driver: Arc<dyn ArchiveDriver>,
    ctx: Arc<MountContext>,
    read_only: bool,
    state: Mutex<MountState>,
    streams: Arc<StreamRegistry>,
}

impl std::fmt::Debug for ArchiveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveController")
            .field("mount", &self.mount)
            .field("driver", &self.driver.id())
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl ArchiveController {
    /// Create an unmounted controller. Nested mounts inherit read-only from
    /// their parent.
    pub fn new(
        parent: Parent,
        driver: Arc<dyn ArchiveDriver>,
        ctx: Arc<MountContext>,
        options: MountOptions,
    ) -> Arc<Self> {
        let (mount, read_only) = match &parent {
            Parent::Host(path) => (path.display().to_string(), options.read_only),
            Parent::Archive { controller, entry } => (
                format!("{}/{}", controller.mount, entry),
                options.read_only || controller.read_only,
            ),
        };
        Arc::new(ArchiveController {
            mount,
            parent,
            driver,
            ctx,
            read_only,
            state: Mutex::new(MountState::default()),
            streams: Arc::new(StreamRegistry::default()),
        })
    }

    /// Display path of this mount
    pub fn mount_point(&self) -> &str {
        &self.mount
    }

    /// Where this container is stored
    pub fn location(&self) -> &Parent {
        &self.parent
    }

    pub fn parent(&self) -> Option<&Arc<ArchiveController>> {
        match &self.parent {
            Parent::Archive { controller, .. } => Some(controller),
            Parent::Host(_) => None,
        }
    }

    /// Nesting depth; host containers are 0
    pub fn depth(&self) -> usize {
        self.parent().map(|p| p.depth() + 1).unwrap_or(0)
    }

    /// Whether `self` is stored, directly or not, inside `other`
    pub fn is_inside(&self, other: &ArchiveController) -> bool {
        let mut cur = self.parent();
        while let Some(p) = cur {
            if std::ptr::eq(p.as_ref(), other) {
                return true;
            }
            cur = p.parent();
        }
        false
    }

    pub fn driver(&self) -> &Arc<dyn ArchiveDriver> {
        &self.driver
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_mounted(&self) -> bool {
        self.state.lock().model.is_some()
    }

    /// True if a sync would write anything
    pub fn is_touched(&self) -> bool {
        let state = self.state.lock();
        state.output.is_some() || state.model.as_ref().map(|m| m.is_touched()).unwrap_or(false)
    }

    /// Whether the pending output still waits for staged entries or the
    /// required head. A sync drains it anyway.
    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.output.as_ref().map(|o| o.mux.is_busy()).unwrap_or(false)
    }

    pub fn open_streams(&self) -> usize {
        self.streams.count()
    }

    pub(crate) fn path_of(&self, name: &str) -> String {
        if name.is_empty() {
            self.mount.clone()
        } else {
            format!("{}/{}", self.mount, name)
        }
    }

    /// The mounted model, mounting an existing container if needed
    pub fn file_system(&self) -> Result<Arc<ArchiveFileSystem>> {
        self.model(false)
    }

    fn model(&self, create: bool) -> Result<Arc<ArchiveFileSystem>> {
        let mut state = self.state.lock();
        self.mount_locked(&mut state, create)
    }

    fn mount_locked(&self, state: &mut MountState, create: bool) -> Result<Arc<ArchiveFileSystem>> {
        if let Some(model) = &state.model {
            return Ok(Arc::clone(model));
        }

        let (input, staged) = match self.open_source()? {
            Some((source, staged)) => {
                match self
                    .driver
                    .new_input(&self.mount, source, self.ctx.keys.as_ref())
                {
                    Ok(input) => (Some(input), staged),
                    Err(e) => {
                        if let Some(buffer) = staged {
                            let _ = buffer.release();
                        }
                        return Err(e);
                    }
                }
            }
            None if create && !self.read_only => (None, None),
            None => return Err(FsError::NotFound(self.mount.clone())),
        };

        let entries = input.as_ref().map(|i| i.entries()).unwrap_or_default();
        let model = Arc::new(ArchiveFileSystem::new(
            Arc::new(DriverFactory(Arc::clone(&self.driver))),
            entries,
            self.read_only,
        ));
        model.add_listener(Arc::new(SinkListener {
            mount: self.mount.clone(),
            sink: Arc::clone(&self.ctx.sink),
        }));
        info!(
            "Mounted {} ({} entries{}{})",
            self.mount,
            model.len() - 1,
            if input.is_none() { ", new" } else { "" },
            if self.read_only { ", read-only" } else { "" }
        );

        state.model = Some(Arc::clone(&model));
        state.input = input;
        state.staged = staged;
        Ok(model)
    }

    /// Open the current container bytes, `None` if there is no container
    fn open_source(&self) -> Result<Option<(Box<dyn Source>, Option<Buffer>)>> {
        match &self.parent {
            Parent::Host(path) => match File::open(path) {
                Ok(file) => Ok(Some((Box::new(file), None))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
            Parent::Archive { controller, entry } => {
                match stat_or_none(controller, entry)? {
                    None => Ok(None),
                    Some(e) if !e.is_file() => Err(FsError::NotADirectory(self.mount.clone())),
                    Some(_) => {
                        let buffer = self.ctx.pool.allocate()?;
                        let staged = stage_entry(controller, entry, &buffer)
                            .and_then(|_| buffer.reader());
                        match staged {
                            Ok(reader) => Ok(Some((Box::new(reader), Some(buffer)))),
                            Err(e) => {
                                let _ = buffer.release();
                                Err(e)
                            }
                        }
                    }
                }
            }
        }
    }

    /// Entry by name, `None` if absent. Fails with `NotFound` if the
    /// container itself does not exist.
    pub fn stat(&self, name: &str) -> Result<Option<Entry>> {
        let name = entry::normalize(name)?;
        Ok(self.model(false)?.entry(&name))
    }

    /// Child names of a directory entry
    pub fn list(&self, name: &str) -> Result<Vec<String>> {
        let name = entry::normalize(name)?;
        let model = self.model(false)?;
        match model.children(&name) {
            Some(children) => Ok(children),
            None if model.entry(&name).is_some() => Err(FsError::NotADirectory(self.path_of(&name))),
            None => Err(FsError::NotFound(self.path_of(&name))),
        }
    }

    pub fn input_socket(self: &Arc<Self>, name: &str) -> Result<InputSocket> {
        Ok(InputSocket::new(ControllerInput {
            controller: Arc::clone(self),
            name: entry::normalize(name)?,
        }))
    }

    /// Socket writing entry `name`; `template` supplies attributes to keep
    pub fn output_socket(
        self: &Arc<Self>,
        name: &str,
        template: Option<Entry>,
    ) -> Result<OutputSocket> {
        Ok(OutputSocket::new(ControllerOutput {
            controller: Arc::clone(self),
            name: entry::normalize(name)?,
            template,
        }))
    }

    pub fn read(self: &Arc<Self>, name: &str) -> Result<Vec<u8>> {
        let mut stream = self.input_socket(name)?.stream()?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data).map_err(FsError::from_io)?;
        Ok(data)
    }

    pub fn write(self: &Arc<Self>, name: &str, data: &[u8]) -> Result<()> {
        let mut stream = self.output_socket(name, None)?.stream()?;
        stream.write_all(data).map_err(FsError::from_io)?;
        stream.close()
    }

    /// Create a directory. `mkdir("")` creates the container itself.
    pub fn mkdir(&self, name: &str, parents: bool) -> Result<()> {
        if self.read_only {
            return Err(FsError::ReadOnly(self.mount.clone()));
        }
        let name = entry::normalize(name)?;
        let mut state = self.state.lock();
        if name == ROOT {
            match self.mount_locked(&mut state, false) {
                Ok(_) => return Err(FsError::AlreadyExists(self.mount.clone())),
                Err(FsError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            let model = self.mount_locked(&mut state, true)?;
            // Touch the root so the next sync writes an empty container
            model.set_time(ROOT, Access::WRITE, now_millis())?;
            return Ok(());
        }
        let model = self.mount_locked(&mut state, true)?;
        let options = MknodOptions {
            create_parents: parents,
            exclusive: true,
        };
        model
            .mknod(&name, EntryType::Directory, options, None)?
            .commit()?;
        Ok(())
    }

    pub fn unlink(&self, name: &str) -> Result<()> {
        if self.read_only {
            return Err(FsError::ReadOnly(self.mount.clone()));
        }
        let name = entry::normalize(name)?;
        if name == ROOT {
            return Err(FsError::RootUnlink);
        }
        let mut state = self.settled(&name)?;
        let model = self.mount_locked(&mut state, false)?;
        model.unlink(&name)?;
        state.drop_shadow(&name);
        Ok(())
    }

    pub fn set_time(&self, name: &str, access: Access, value: i64) -> Result<bool> {
        if self.read_only {
            return Err(FsError::ReadOnly(self.mount.clone()));
        }
        let name = entry::normalize(name)?;
        let mut state = self.settled(&name)?;
        let model = self.mount_locked(&mut state, false)?;
        model.set_time(&name, access, value)
    }

    /// Lock the mount state once `name` is no longer part of the pending
    /// output, so a change to it cannot slip between two flushes
    fn settled(&self, name: &str) -> Result<MutexGuard<'_, MountState>> {
        loop {
            self.sync_if_written(name)?;
            let state = self.state.lock();
            if !state.written.contains(name) {
                return Ok(state);
            }
        }
    }

    /// Entries written since the last sync only exist in the pending output;
    /// flush first so they can be read back or changed.
    pub(crate) fn sync_if_written(&self, name: &str) -> Result<()> {
        let written = self.state.lock().written.contains(name);
        if written {
            debug!("Implicit sync of {} for {:?}", self.mount, name);
            if let Some(e) = self.sync(SyncOptions::SYNC).into_error() {
                return Err(e);
            }
        }
        Ok(())
    }

    fn open_input(&self, name: &str, peer: Option<&OutputSocket>) -> Result<Box<dyn Read + Send>> {
        self.ctx.sink.before_stream(&self.mount, name, StreamKind::Input);
        let result = self.open_input_inner(name, peer);
        self.ctx
            .sink
            .after_stream(&self.mount, name, StreamKind::Input, result.is_ok());
        result
    }

    fn open_input_inner(
        &self,
        name: &str,
        peer: Option<&OutputSocket>,
    ) -> Result<Box<dyn Read + Send>> {
        self.sync_if_written(name)?;
        let target = {
            let mut state = self.state.lock();
            let model = self.mount_locked(&mut state, false)?;
            let entry = model
                .entry(name)
                .ok_or_else(|| FsError::NotFound(self.path_of(name)))?;
            if entry.is_directory() {
                return Err(FsError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} is a directory", self.path_of(name)),
                )));
            }
            match (state.shadows.get(name), &state.input) {
                (Some(Shadow::Staged(buffer)), _) => Origin::Shadow(Box::new(buffer.reader()?)),
                (Some(Shadow::Raw(raw)), input) => {
                    let data = self.driver.decode_raw(raw, input.as_deref())?;
                    Origin::Shadow(Box::new(io::Cursor::new(data)))
                }
                (None, Some(input)) if input.entry(name).is_some() => {
                    Origin::Stored(input.input(name)?)
                }
                (None, _) => Origin::Empty,
            }
        };
        let inner: Box<dyn Read + Send> = match target {
            Origin::Stored(target) => target.open(peer)?,
            Origin::Shadow(reader) => reader,
            Origin::Empty => Box::new(io::empty()),
        };
        Ok(Box::new(TrackedRead {
            inner,
            guard: self.streams.register(),
            name: name.to_string(),
        }))
    }

    fn open_raw(&self, name: &str) -> Option<Result<RawEntry>> {
        let target = {
            let state = self.state.lock();
            match state.shadows.get(name) {
                Some(Shadow::Raw(raw)) if !state.written.contains(name) => {
                    return Some(Ok(raw.clone()));
                }
                Some(_) => return None,
                None => {}
            }
            state.model.as_ref()?.entry(name)?;
            match state.input.as_ref()?.input(name) {
                Ok(target) => target,
                Err(e) => return Some(Err(e)),
            }
        };
        target.open_raw()
    }

    fn open_output(
        &self,
        name: &str,
        template: Option<&Entry>,
        peer: Option<&InputSocket>,
    ) -> Result<Box<dyn OutputStream>> {
        self.ctx.sink.before_stream(&self.mount, name, StreamKind::Output);
        let result = self.open_output_inner(name, template, peer);
        self.ctx
            .sink
            .after_stream(&self.mount, name, StreamKind::Output, result.is_ok());
        result
    }

    fn open_output_inner(
        &self,
        name: &str,
        template: Option<&Entry>,
        peer: Option<&InputSocket>,
    ) -> Result<Box<dyn OutputStream>> {
        if self.read_only {
            return Err(FsError::ReadOnly(self.mount.clone()));
        }
        if name == ROOT {
            return Err(FsError::AlreadyExists(self.mount.clone()));
        }
        self.sync_if_written(name)?;
        // The peer may live in this very mount, so ask it before locking
        let raw = match peer.and_then(|p| p.open_raw()) {
            Some(Ok(raw)) => Some(raw),
            _ => None,
        };

        let mut state = self.state.lock();
        let model = self.mount_locked(&mut state, true)?;
        let op = model.mknod(name, EntryType::File, MknodOptions::parents(), template)?;
        self.ensure_output(&mut state)?;
        let mux = match &state.output {
            Some(output) => &output.mux,
            None => return Err(FsError::ForcedClosed(self.mount.clone())),
        };

        if let Some(raw) = raw {
            if mux.output_raw(op.entry().clone(), &raw)? {
                op.with_entry(|e| e.with_size(raw.entry.size())).commit()?;
                state.written.insert(name.to_string());
                state.keep_shadow(name, Shadow::Raw(raw));
                debug!("Copied {:?} into {} without decoding", name, self.mount);
                return Ok(Box::new(Satisfied(self.path_of(name))));
            }
        }

        let buffer = self.ctx.pool.allocate()?;
        let opened = buffer
            .writer()
            .and_then(|shadow| Ok((shadow, mux.output(op.entry().clone())?)))
            .and_then(|opened| op.commit().map(|_| opened));
        let (shadow, stream) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let _ = buffer.release();
                return Err(e);
            }
        };
        state.written.insert(name.to_string());
        state.keep_shadow(name, Shadow::Staged(buffer));
        Ok(Box::new(TrackedWrite {
            inner: stream,
            shadow,
            guard: self.streams.register(),
            name: name.to_string(),
            model,
            written: 0,
        }))
    }

    fn ensure_output(&self, state: &mut MountState) -> Result<()> {
        if state.output.is_some() {
            return Ok(());
        }
        let (sink, target): (Box<dyn Write + Send>, Target) = match &self.parent {
            Parent::Host(path) => {
                let dir = path
                    .parent()
                    .filter(|d| !d.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                std::fs::create_dir_all(dir)?;
                let temp = NamedTempFile::new_in(dir)?;
                let file = temp.reopen()?;
                (Box::new(BufWriter::new(file)), Target::Host(temp))
            }
            Parent::Archive { .. } => {
                let buffer = self.ctx.pool.allocate()?;
                match buffer.writer() {
                    Ok(writer) => (Box::new(writer), Target::Buffer(buffer)),
                    Err(e) => {
                        let _ = buffer.release();
                        return Err(e);
                    }
                }
            }
        };

        let service = match self.driver.new_output(
            &self.mount,
            sink,
            state.input.as_deref(),
            self.ctx.keys.as_ref(),
        ) {
            Ok(service) => service,
            Err(e) => {
                target.discard();
                return Err(e);
            }
        };
        let mux = MultiplexedOutput::new(
            self.mount.clone(),
            service,
            Arc::clone(&self.ctx.pool),
            self.driver.required_head().map(String::from),
        );
        state.output = Some(Output { mux, target });
        Ok(())
    }

    /// Flush, discard or unmount this mount according to `options`
    ///
    /// Never fails outright: every problem lands in the returned chain. A
    /// mount whose flush failed stays mounted.
    pub fn sync(&self, options: SyncOptions) -> SyncErrorChain {
        let mut chain = SyncErrorChain::new();
        let mut state = self.state.lock();

        let open = self.streams.count();
        if open > 0 {
            if !options.force_close {
                let busy = FsError::Busy {
                    mount: self.mount.clone(),
                    streams: open,
                };
                self.ctx.sink.synced(&self.mount, Some(&busy));
                chain.error(&self.mount, busy);
                return chain;
            }
            let closed = self.streams.close_all();
            warn!("Forcibly closed {} stream(s) of {}", closed, self.mount);
            chain.warn(
                &self.mount,
                FsError::ForcedClosed(format!("{} stream(s) of {}", closed, self.mount)),
            );
        }

        let flushed = if options.abort_changes {
            if state.output.is_some() {
                info!("Discarding changes to {}", self.mount);
            }
            self.release(&mut state);
            Ok(())
        } else {
            self.flush(&mut state)
        };
        self.ctx.sink.synced(&self.mount, flushed.as_ref().err());

        match flushed {
            Ok(()) => {
                if options.umount && state.model.is_some() {
                    self.release(&mut state);
                    info!("Unmounted {}", self.mount);
                }
            }
            Err(e) => chain.error(&self.mount, e),
        }
        chain
    }

    /// Drop all mount state
    fn release(&self, state: &mut MountState) {
        if let Some(output) = state.output.take() {
            output.abort();
        }
        if let Some(model) = state.model.take() {
            model.clear_listeners();
        }
        state.input = None;
        if let Some(buffer) = state.staged.take() {
            if let Err(e) = buffer.release() {
                warn!("Releasing {} failed: {}", buffer.name(), e);
            }
        }
        state.written.clear();
        state.clear_shadows();
    }

    fn flush(&self, state: &mut MountState) -> Result<()> {
        let model = match &state.model {
            Some(model) => Arc::clone(model),
            None => return Ok(()),
        };
        if !model.is_touched() && state.output.is_none() {
            return Ok(());
        }
        if let Some(output) = &state.output {
            if output.mux.is_busy() {
                debug!("Draining busy output of {}", self.mount);
            }
        }

        // Changes made through the model while a pass is running are picked
        // up by the next pass
        for _ in 0..MAX_FLUSH_PASSES {
            if let Err(e) = self.write_out(state, &model) {
                // The output is gone; the shadows take the written entries' place
                state.written.clear();
                warn!(
                    "Flush of {} failed, keeping {} written entries: {}",
                    self.mount,
                    state.shadows.len(),
                    e
                );
                return Err(e);
            }
            if !model.is_touched() {
                return Ok(());
            }
        }
        Err(FsError::Busy {
            mount: self.mount.clone(),
            streams: 0,
        })
    }

    fn write_out(&self, state: &mut MountState, model: &ArchiveFileSystem) -> Result<()> {
        let generation = model.generation();
        self.ensure_output(state)?;
        let Output { mux, target } = match state.output.take() {
            Some(output) => output,
            None => return Ok(()),
        };

        if let Err(e) = self.copy_unchanged(state, model, &mux) {
            mux.abort();
            target.discard();
            return Err(e);
        }
        let closed = match mux.close() {
            Ok(closed) => closed,
            Err(e) => {
                target.discard();
                return Err(e);
            }
        };
        let (input, staged) = self.commit(target)?;

        if let Some(old) = std::mem::replace(&mut state.staged, staged) {
            if let Err(e) = old.release() {
                warn!("Releasing {} failed: {}", old.name(), e);
            }
        }
        state.input = Some(input);
        state.written.clear();
        state.clear_shadows();
        let count = closed.written.len();
        model.refresh(closed.written);
        if !model.mark_clean(generation) {
            debug!("{} changed while syncing", self.mount);
        }
        info!("Synced {} ({} entries)", self.mount, count);
        Ok(())
    }

    /// Write every entry not rewritten since the last sync, taking stored
    /// payloads over verbatim where the writer accepts them. Entries kept
    /// from a failed flush come from their shadows.
    fn copy_unchanged(
        &self,
        state: &MountState,
        model: &ArchiveFileSystem,
        mux: &MultiplexedOutput,
    ) -> Result<()> {
        let mut entries: Vec<Entry> = model
            .entries()
            .into_iter()
            .filter(|e| e.name() != ROOT && !state.written.contains(e.name()))
            .collect();
        if let Some(head) = self.driver.required_head() {
            entries.sort_by_key(|e| e.name() != head);
        }

        let mut raw_copies = 0usize;
        for entry in entries {
            match state.shadows.get(entry.name()) {
                Some(Shadow::Staged(buffer)) => {
                    let mut out = mux.output(entry)?;
                    io::copy(&mut buffer.reader()?, &mut out).map_err(FsError::from_io)?;
                    out.close()?;
                    continue;
                }
                Some(Shadow::Raw(raw)) => {
                    if !mux.output_raw(entry.clone(), raw)? {
                        let data = self.driver.decode_raw(raw, state.input.as_deref())?;
                        let mut out = mux.output(entry)?;
                        out.write_all(&data).map_err(FsError::from_io)?;
                        out.close()?;
                    }
                    continue;
                }
                None => {}
            }
            let source = match &state.input {
                Some(input) if entry.is_file() && input.entry(entry.name()).is_some() => {
                    Some(input.input(entry.name())?)
                }
                _ => None,
            };
            let source = match source {
                Some(source) => source,
                None => {
                    mux.output(entry)?.close()?;
                    continue;
                }
            };
            if let Some(Ok(raw)) = source.open_raw() {
                if mux.output_raw(entry.clone(), &raw)? {
                    raw_copies += 1;
                    continue;
                }
            }
            let mut out = mux.output(entry)?;
            let mut decoded = source.open(None)?;
            io::copy(&mut decoded, &mut out).map_err(FsError::from_io)?;
            out.close()?;
        }
        debug!("{}: {} entries copied without decoding", self.mount, raw_copies);
        Ok(())
    }

    /// Make the new container current and reopen it
    fn commit(&self, target: Target) -> Result<(Arc<dyn InputService>, Option<Buffer>)> {
        match (target, &self.parent) {
            (Target::Host(temp), Parent::Host(path)) => {
                temp.persist(path).map_err(|e| FsError::Io(e.error))?;
                let file = File::open(path)?;
                let input = self
                    .driver
                    .new_input(&self.mount, Box::new(file), self.ctx.keys.as_ref())?;
                Ok((input, None))
            }
            (Target::Buffer(buffer), Parent::Archive { controller, entry }) => {
                let reopened = write_into_parent(controller, entry, &buffer)
                    .and_then(|_| buffer.reader())
                    .and_then(|reader| {
                        self.driver.new_input(
                            &self.mount,
                            Box::new(reader),
                            self.ctx.keys.as_ref(),
                        )
                    });
                match reopened {
                    Ok(input) => Ok((input, Some(buffer))),
                    Err(e) => {
                        let _ = buffer.release();
                        Err(e)
                    }
                }
            }
            (target, _) => {
                target.discard();
                Err(FsError::corrupt(&self.mount, "output target does not match parent"))
            }
        }
    }
}

impl Drop for ArchiveController {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.output.is_some() || !state.shadows.is_empty() {
            warn!("Dropping {} with unsynced changes", self.mount);
        }
        if let Some(output) = state.output.take() {
            output.abort();
        }
        if let Some(buffer) = state.staged.take() {
            let _ = buffer.release();
        }
        state.clear_shadows();
    }
}

fn stat_or_none(controller: &ArchiveController, entry: &str) -> Result<Option<Entry>> {
    match controller.stat(entry) {
        Ok(found) => Ok(found),
        Err(FsError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Copy a parent entry into `buffer`
fn stage_entry(parent: &Arc<ArchiveController>, entry: &str, buffer: &Buffer) -> Result<()> {
    let mut input = parent.input_socket(entry)?.stream()?;
    let mut writer = buffer.writer()?;
    io::copy(&mut input, &mut writer).map_err(FsError::from_io)?;
    writer.flush()?;
    Ok(())
}

/// Store a rewritten nested container as entry `entry` of its parent
fn write_into_parent(parent: &Arc<ArchiveController>, entry: &str, buffer: &Buffer) -> Result<()> {
    let template = stat_or_none(parent, entry)?
        .map(|e| e.with_time(Access::WRITE, Some(now_millis())));
    let mut out = parent.output_socket(entry, template)?.stream()?;
    let mut reader = buffer.reader()?;
    io::copy(&mut reader, &mut out).map_err(FsError::from_io)?;
    out.close()
}
