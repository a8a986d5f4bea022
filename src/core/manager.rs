//! File system manager
//!
//! Resolves paths that may run through any number of archives, keeps one
//! controller per mounted container and coordinates sync across all of
//! them. A path segment whose name has a registered suffix is treated as an
//! archive unless it is a plain directory.

use crate::buffer_pool::BufferPool;
use crate::config::FsConfig;
use crate::controller::{ArchiveController, MountContext, MountOptions, Parent};
use crate::driver::{ArchiveDriver, DriverRegistry};
use crate::encryption::KeyProvider;
use crate::entry::{Access, Entry, EntryType};
use crate::error::{FsError, Result};
use crate::events::EventSink;
use crate::socket::{self, InputSocket, InputTarget, OutputSocket, OutputStream, OutputTarget};
use crate::sync::{Severity, SyncErrorChain, SyncOptions};
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A resolved path
#[derive(Debug)]
pub enum Location {
    /// Plain host file or directory
    Host(PathBuf),
    /// Entry of a mounted archive; `""` is the archive root
    Archive {
        controller: Arc<ArchiveController>,
        entry: String,
    },
}

/// Federated file system over host files and nested archives
pub struct FsManager {
    config: FsConfig,
    registry: DriverRegistry,
    ctx: Arc<MountContext>,
    controllers: RwLock<HashMap<String, Arc<ArchiveController>>>,
    read_only: RwLock<HashSet<String>>,
    shut: AtomicBool,
}

impl std::fmt::Debug for FsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsManager")
            .field("registry", &self.registry)
            .field("mounts", &self.mounts())
            .finish()
    }
}

impl FsManager {
    pub fn new(
        config: FsConfig,
        registry: DriverRegistry,
        keys: Arc<dyn KeyProvider>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let mut pool = BufferPool::new(config.pool.backing, config.pool.temp_dir.clone());
        if let Some(max) = config.pool.max_active {
            pool = pool.with_max_active(max);
        }
        info!(
            "File system manager ready ({} archive suffixes, {:?} buffers)",
            registry.suffixes().count(),
            config.pool.backing
        );
        FsManager {
            config,
            registry,
            ctx: Arc::new(MountContext {
                pool: Arc::new(pool),
                keys,
                sink,
            }),
            controllers: RwLock::new(HashMap::new()),
            read_only: RwLock::new(HashSet::new()),
            shut: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.ctx.pool
    }

    /// Mount points currently known, sorted
    pub fn mounts(&self) -> Vec<String> {
        let mut mounts: Vec<String> = self.controllers.read().keys().cloned().collect();
        mounts.sort();
        mounts
    }

    /// Split `path` into its host part and the archive entries below it
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<Location> {
        let path = path.as_ref();
        let mut host = PathBuf::new();
        let mut current: Option<(Arc<ArchiveController>, Vec<String>)> = None;

        for component in path.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => host.push(component.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if current.is_some() {
                        return Err(FsError::InvalidName(path.display().to_string()));
                    }
                    host.push("..");
                }
                Component::Normal(segment) => {
                    let segment = segment
                        .to_str()
                        .ok_or_else(|| FsError::InvalidName(path.display().to_string()))?;
                    current = match current.take() {
                        None => {
                            host.push(segment);
                            match self.registry.driver_for(segment) {
                                Some(driver) if !host.is_dir() => {
                                    let controller =
                                        self.controller_for(Parent::Host(host.clone()), driver);
                                    Some((controller, Vec::new()))
                                }
                                _ => None,
                            }
                        }
                        Some((controller, mut entries)) => {
                            entries.push(segment.to_string());
                            match self.registry.driver_for(segment) {
                                Some(driver) => {
                                    let entry = entries.join("/");
                                    if is_directory(&controller, &entry) {
                                        Some((controller, entries))
                                    } else {
                                        let parent = Parent::Archive { controller, entry };
                                        Some((self.controller_for(parent, driver), Vec::new()))
                                    }
                                }
                                None => Some((controller, entries)),
                            }
                        }
                    };
                }
            }
        }

        Ok(match current {
            Some((controller, entries)) => Location::Archive {
                controller,
                entry: entries.join("/"),
            },
            None => Location::Host(host),
        })
    }

    fn controller_for(&self, parent: Parent, driver: Arc<dyn ArchiveDriver>) -> Arc<ArchiveController> {
        let key = mount_key(&parent);
        if let Some(existing) = self.controllers.read().get(&key) {
            return Arc::clone(existing);
        }
        let mut controllers = self.controllers.write();
        // Lost a race to another resolver
        if let Some(existing) = controllers.get(&key) {
            return Arc::clone(existing);
        }
        let options = MountOptions {
            read_only: self.read_only.read().contains(&key),
        };
        debug!("New controller for {} ({})", key, driver.id());
        let controller = ArchiveController::new(parent, driver, Arc::clone(&self.ctx), options);
        controllers.insert(key, Arc::clone(&controller));
        controller
    }

    /// Mount the archive at `path` read-only from now on. An existing mount
    /// of it is synced and dropped first.
    pub fn mount_read_only(&self, path: impl AsRef<Path>) -> Result<()> {
        let key = path.as_ref().display().to_string();
        self.read_only.write().insert(key.clone());
        let existing = self.controllers.read().get(&key).cloned();
        match existing {
            Some(controller) if !controller.is_read_only() => {
                self.evict(&controller, SyncOptions::UMOUNT)
            }
            _ => Ok(()),
        }
    }

    pub fn stat(&self, path: impl AsRef<Path>) -> Result<Entry> {
        let path = path.as_ref();
        match self.resolve(path)? {
            Location::Host(p) => host_entry(&p),
            Location::Archive { controller, entry } => controller
                .stat(&entry)?
                .ok_or_else(|| FsError::NotFound(path.display().to_string())),
        }
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.stat(path).is_ok()
    }

    /// Sorted child names of a directory or archive
    pub fn list(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        match self.resolve(path)? {
            Location::Host(p) => {
                let mut names = Vec::new();
                for dirent in fs::read_dir(&p).map_err(|e| host_error(&p, e))? {
                    names.push(dirent?.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(names)
            }
            Location::Archive { controller, entry } => controller.list(&entry),
        }
    }

    pub fn input(&self, path: impl AsRef<Path>) -> Result<InputSocket> {
        match self.resolve(path)? {
            Location::Host(p) => Ok(InputSocket::new(HostInput { path: p })),
            Location::Archive { controller, entry } => controller.input_socket(&entry),
        }
    }

    /// Output socket for `path`; `template` supplies attributes to keep
    pub fn output(&self, path: impl AsRef<Path>, template: Option<Entry>) -> Result<OutputSocket> {
        match self.resolve(path)? {
            Location::Host(p) => Ok(OutputSocket::new(HostOutput { path: p, template })),
            Location::Archive { controller, entry } => controller.output_socket(&entry, template),
        }
    }

    pub fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let mut stream = self.input(path)?.stream()?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data).map_err(FsError::from_io)?;
        Ok(data)
    }

    pub fn write(&self, path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        let mut stream = self.output(path, None)?.stream()?;
        stream.write_all(data).map_err(FsError::from_io)?;
        stream.close()
    }

    /// Copy a file, keeping its times. Archive to archive copies in the same
    /// format move the stored payload without decoding it.
    pub fn copy(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<u64> {
        let template = self.stat(from.as_ref())?;
        if !template.is_file() {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not a file", from.as_ref().display()),
            )));
        }
        let input = match self.resolve(from)? {
            Location::Host(p) => InputSocket::new(HostInput { path: p }),
            Location::Archive { controller, entry } => {
                // Settle the source first; its mount may be the destination
                controller.sync_if_written(&entry)?;
                controller.input_socket(&entry)?
            }
        };
        let output = self.output(to, Some(template))?;
        socket::copy(&input, &output)
    }

    /// Create a directory. On an archive path this creates an empty archive.
    pub fn mkdir(&self, path: impl AsRef<Path>, parents: bool) -> Result<()> {
        match self.resolve(path)? {
            Location::Host(p) => {
                let created = if parents {
                    fs::create_dir_all(&p)
                } else {
                    fs::create_dir(&p)
                };
                created.map_err(|e| host_error(&p, e))
            }
            Location::Archive { controller, entry } => controller.mkdir(&entry, parents),
        }
    }

    /// Delete a file, an empty directory or an empty archive
    pub fn delete(&self, path: impl AsRef<Path>) -> Result<()> {
        match self.resolve(path)? {
            Location::Host(p) => {
                let meta = fs::symlink_metadata(&p).map_err(|e| host_error(&p, e))?;
                let removed = if meta.is_dir() {
                    fs::remove_dir(&p)
                } else {
                    fs::remove_file(&p)
                };
                removed.map_err(|e| host_error(&p, e))
            }
            Location::Archive { controller, entry } if entry.is_empty() => {
                self.delete_archive(&controller)
            }
            Location::Archive { controller, entry } => controller.unlink(&entry),
        }
    }

    fn delete_archive(&self, controller: &Arc<ArchiveController>) -> Result<()> {
        match controller.list("") {
            Ok(children) if !children.is_empty() => {
                return Err(FsError::DirectoryNotEmpty(controller.mount_point().to_string()))
            }
            Ok(_) => {}
            // Unreadable containers can still be removed
            Err(FsError::Corrupt { .. }) => {}
            Err(e) => return Err(e),
        }
        self.evict(controller, SyncOptions::ABORT)?;

        let removed = match controller.location() {
            Parent::Host(path) => fs::remove_file(path).map_err(FsError::from),
            Parent::Archive { controller: parent, entry } => parent.unlink(entry),
        };
        match removed {
            Ok(()) | Err(FsError::NotFound(_)) => {}
            Err(FsError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        info!("Deleted archive {}", controller.mount_point());
        Ok(())
    }

    /// Sync `root` and every mount inside it, then forget them
    fn evict(&self, root: &Arc<ArchiveController>, options: SyncOptions) -> Result<()> {
        let mut victims: Vec<Arc<ArchiveController>> = self
            .controllers
            .read()
            .values()
            .filter(|c| Arc::ptr_eq(c, root) || c.is_inside(root))
            .cloned()
            .collect();
        victims.sort_by_key(|c| Reverse(c.depth()));

        let mut chain = SyncErrorChain::new();
        for c in &victims {
            chain.append(c.sync(options));
        }
        if chain.max_severity() == Some(Severity::Error) {
            if let Some(e) = chain.into_error() {
                return Err(e);
            }
        }
        let mut controllers = self.controllers.write();
        for c in victims {
            controllers.remove(c.mount_point());
        }
        Ok(())
    }

    /// Set one time stamp. Host paths support `Access::WRITE` only.
    pub fn set_time(&self, path: impl AsRef<Path>, access: Access, millis: i64) -> Result<bool> {
        match self.resolve(path)? {
            Location::Host(p) => {
                if access != Access::WRITE {
                    return Ok(false);
                }
                let file = File::options()
                    .write(true)
                    .open(&p)
                    .map_err(|e| host_error(&p, e))?;
                file.set_modified(system_time(millis))?;
                Ok(true)
            }
            Location::Archive { controller, entry } => {
                controller.set_time(&entry, access, millis)
            }
        }
    }

    /// Sync every mount, innermost first
    ///
    /// Mounts of the same depth are independent and are synced on scoped
    /// threads when `sync.parallel` is set. A failing mount does not stop the
    /// pass; all failures come back in one chain. With `umount`, mounts that
    /// synced cleanly and hold no failed mount inside them are forgotten.
    pub fn sync(&self, options: SyncOptions) -> std::result::Result<(), SyncErrorChain> {
        let mut by_depth: BTreeMap<usize, Vec<Arc<ArchiveController>>> = BTreeMap::new();
        for c in self.controllers.read().values() {
            by_depth.entry(c.depth()).or_default().push(Arc::clone(c));
        }

        let mut chain = SyncErrorChain::new();
        let mut synced: Vec<Arc<ArchiveController>> = Vec::new();
        let mut failed: Vec<Arc<ArchiveController>> = Vec::new();
        for (depth, group) in by_depth.into_iter().rev() {
            debug!("Syncing {} mount(s) at depth {}", group.len(), depth);
            for (controller, result) in group.iter().zip(self.sync_group(&group, options)) {
                if result.max_severity() == Some(Severity::Error) {
                    failed.push(Arc::clone(controller));
                } else {
                    synced.push(Arc::clone(controller));
                }
                chain.append(result);
            }
        }

        if options.umount {
            // Mounts created while the pass ran were never synced; keep them
            let mut controllers = self.controllers.write();
            controllers.retain(|_, c| {
                !synced.iter().any(|s| Arc::ptr_eq(s, c)) || failed.iter().any(|f| f.is_inside(c))
            });
        }

        if !chain.is_empty() {
            warn!("Sync finished with {} problem(s)", chain.len());
        }
        chain.into_result()
    }

    fn sync_group(
        &self,
        group: &[Arc<ArchiveController>],
        options: SyncOptions,
    ) -> Vec<SyncErrorChain> {
        if !self.config.sync.parallel || group.len() < 2 {
            return group.iter().map(|c| c.sync(options)).collect();
        }

        let joined = crossbeam::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|c| s.spawn(move |_| c.sync(options)))
                .collect();
            handles
                .into_iter()
                .zip(group)
                .map(|(h, c)| {
                    h.join().unwrap_or_else(|_| {
                        let mut chain = SyncErrorChain::new();
                        chain.error(c.mount_point(), panicked(c.mount_point()));
                        chain
                    })
                })
                .collect::<Vec<_>>()
        });
        joined.unwrap_or_else(|_| {
            group
                .iter()
                .map(|c| {
                    let mut chain = SyncErrorChain::new();
                    chain.error(c.mount_point(), panicked(c.mount_point()));
                    chain
                })
                .collect()
        })
    }

    /// Flush and drop every mount
    pub fn umount(&self) -> std::result::Result<(), SyncErrorChain> {
        self.sync(SyncOptions::UMOUNT)
    }

    /// Unmount everything and stop handing out buffers
    pub fn shutdown(&self) -> std::result::Result<(), SyncErrorChain> {
        self.shut.store(true, Ordering::Release);
        let result = self.umount();
        self.ctx.pool.shutdown();
        result
    }
}

impl Drop for FsManager {
    fn drop(&mut self) {
        if self.shut.load(Ordering::Acquire) {
            return;
        }
        if let Err(chain) = self.umount() {
            warn!("Unmount on drop failed: {}", chain);
        }
    }
}

fn panicked(mount: &str) -> FsError {
    FsError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("sync of {} panicked", mount),
    ))
}

fn mount_key(parent: &Parent) -> String {
    match parent {
        Parent::Host(path) => path.display().to_string(),
        Parent::Archive { controller, entry } => format!("{}/{}", controller.mount_point(), entry),
    }
}

/// An archive-looking entry that is really a directory stays a directory
fn is_directory(controller: &ArchiveController, entry: &str) -> bool {
    matches!(controller.stat(entry), Ok(Some(e)) if e.is_directory())
}

fn host_error(path: &Path, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.display().to_string()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.display().to_string()),
        _ => FsError::Io(e),
    }
}

fn system_time(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}

fn host_entry(path: &Path) -> Result<Entry> {
    let meta = fs::metadata(path).map_err(|e| host_error(path, e))?;
    let entry_type = if meta.is_dir() {
        EntryType::Directory
    } else if meta.is_file() {
        EntryType::File
    } else {
        EntryType::Special
    };
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64);
    let entry = Entry::new(path.display().to_string(), entry_type).with_time(Access::WRITE, modified);
    Ok(if meta.is_file() {
        entry.with_size(Some(meta.len()))
    } else {
        entry
    })
}

struct HostInput {
    path: PathBuf,
}

impl InputTarget for HostInput {
    fn target(&self) -> Result<Entry> {
        host_entry(&self.path)
    }

    fn open(&self, _peer: Option<&OutputSocket>) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path).map_err(|e| host_error(&self.path, e))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

struct HostOutput {
    path: PathBuf,
    template: Option<Entry>,
}

impl OutputTarget for HostOutput {
    fn target(&self) -> Result<Entry> {
        let entry = Entry::new(self.path.display().to_string(), EntryType::File);
        Ok(match &self.template {
            Some(t) => entry.with_time(Access::WRITE, t.time(Access::WRITE)),
            None => entry,
        })
    }

    fn open(&self, _peer: Option<&InputSocket>) -> Result<Box<dyn OutputStream>> {
        let file = File::create(&self.path).map_err(|e| host_error(&self.path, e))?;
        Ok(Box::new(HostStream {
            writer: Some(BufWriter::new(file)),
            modified: self.template.as_ref().and_then(|t| t.time(Access::WRITE)),
        }))
    }
}

struct HostStream {
    writer: Option<BufWriter<File>>,
    /// Applied on close
    modified: Option<i64>,
}

impl Write for HostStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.writer {
            Some(w) => w.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "stream closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.writer {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for HostStream {
    fn close(&mut self) -> Result<()> {
        let writer = match self.writer.take() {
            Some(w) => w,
            None => return Ok(()),
        };
        let file = writer.into_inner().map_err(|e| FsError::Io(e.into_error()))?;
        if let Some(millis) = self.modified {
            file.set_modified(system_time(millis))?;
        }
        file.sync_all()?;
        Ok(())
    }
}
