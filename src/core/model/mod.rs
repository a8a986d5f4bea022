//! In-memory file system model of one mounted archive
//!
//! The model is a tree of entries keyed by normalized name. It starts Clean;
//! any successful mutation makes it Touched, and only the sync coordinator
//! turns it Clean again after a successful flush.
//!
//! Mutations are serialized per model. Each one brackets exactly one logical
//! change with `before_touch`/`after_touch` deliveries to every registered
//! listener.


use crate::entry::{self, Access, Entry, EntryFactory, EntryType, ROOT};
use crate::error::{FsError, Result};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of mutation being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchKind {
    Mknod,
    Unlink,
    SetTime,
    Update,
}

/// Describes one mutation to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchEvent {
    /// [`ArchiveFileSystem::id`] of the model being changed
    pub model: u64,
    pub name: String,
    pub kind: TouchKind,
}

/// Observer of model mutations
pub trait TouchListener: Send + Sync {
    fn before_touch(&self, _event: &TouchEvent) {}

    fn after_touch(&self, _event: &TouchEvent) {}
}

/// Options for [`ArchiveFileSystem::mknod`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MknodOptions {
    /// Create missing parent directories
    pub create_parents: bool,
    /// Fail if the entry already exists
    pub exclusive: bool,
}

impl MknodOptions {
    pub fn parents() -> Self {
        MknodOptions {
            create_parents: true,
            exclusive: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    entry: Entry,
    /// Base names of children
    children: BTreeSet<String>,
}

impl Node {
    fn new(entry: Entry) -> Self {
        Node {
            entry,
            children: BTreeSet::new(),
        }
    }
}

#[derive(Debug)]
struct ModelState {
    nodes: BTreeMap<String, Node>,
    touched: bool,
    /// Bumped by every mutation
    generation: u64,
}

/// File system model of one archive
pub struct ArchiveFileSystem {
    id: u64,
    /// Serializes mutations and listener delivery
    op: ReentrantMutex<()>,
    state: RwLock<ModelState>,
    listeners: Mutex<Vec<Arc<dyn TouchListener>>>,
    factory: Arc<dyn EntryFactory>,
    read_only: bool,
}

impl std::fmt::Debug for ArchiveFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ArchiveFileSystem")
            .field("id", &self.id)
            .field("entries", &state.nodes.len())
            .field("touched", &state.touched)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl ArchiveFileSystem {
    /// Build a model from a decoded entry listing
    ///
    /// Missing parent directories are created. Entries below a
    /// non-directory are dropped with a warning.
    pub fn new(
        factory: Arc<dyn EntryFactory>,
        entries: impl IntoIterator<Item = Entry>,
        read_only: bool,
    ) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT.to_string(), Node::new(Entry::root()));
        for e in entries {
            if e.name() == ROOT {
                if e.is_directory() {
                    nodes.insert(ROOT.to_string(), Node::new(e));
                }
                continue;
            }
            nodes.insert(e.name().to_string(), Node::new(e));
        }

        let names: Vec<String> = nodes.keys().filter(|n| !n.is_empty()).cloned().collect();
        for name in names {
            if nodes.contains_key(&name) {
                attach(&mut nodes, factory.as_ref(), &name);
            }
        }

        ArchiveFileSystem {
            id: NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed),
            op: ReentrantMutex::new(()),
            state: RwLock::new(ModelState {
                nodes,
                touched: false,
                generation: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            factory,
            read_only,
        }
    }

    /// Model with only a root directory
    pub fn new_empty(factory: Arc<dyn EntryFactory>, read_only: bool) -> Self {
        Self::new(factory, std::iter::empty(), read_only)
    }

    /// Process-unique identity, carried by every [`TouchEvent`]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_touched(&self) -> bool {
        self.state.read().touched
    }

    /// Mutation counter. A flush captures it before taking its snapshot.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Acknowledge a successful flush of the snapshot taken at `generation`.
    /// Stays Touched if anything changed since; returns whether it is Clean.
    pub(crate) fn mark_clean(&self, generation: u64) -> bool {
        let _op = self.op.lock();
        let mut state = self.state.write();
        if state.generation == generation {
            state.touched = false;
        }
        !state.touched
    }

    pub fn factory(&self) -> &dyn EntryFactory {
        self.factory.as_ref()
    }

    pub fn entry(&self, name: &str) -> Option<Entry> {
        self.state.read().nodes.get(name).map(|n| n.entry.clone())
    }

    /// Child base names of a directory, `None` if `name` is not a directory
    pub fn children(&self, name: &str) -> Option<Vec<String>> {
        let state = self.state.read();
        let node = state.nodes.get(name)?;
        if !node.entry.is_directory() {
            return None;
        }
        Some(node.children.iter().cloned().collect())
    }

    /// All entries including the root, ordered by name
    pub fn entries(&self) -> Vec<Entry> {
        self.state
            .read()
            .nodes
            .values()
            .map(|n| n.entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Prepare creation of `name`
    ///
    /// Validation happens now and again on [`Mknod::commit`]; nothing
    /// changes until then, and dropping the operation discards it.
    pub fn mknod(
        &self,
        name: &str,
        entry_type: EntryType,
        options: MknodOptions,
        template: Option<&Entry>,
    ) -> Result<Mknod<'_>> {
        self.check_writable()?;
        let name = entry::normalize(name)?;
        {
            let state = self.state.read();
            validate_mknod(&state, &name, entry_type, options)?;
        }
        let entry = self.factory.new_entry(&name, entry_type, template);
        Ok(Mknod {
            fs: self,
            name,
            entry,
            options,
        })
    }

    /// Remove an entry
    pub fn unlink(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        let name = entry::normalize(name)?;
        let _op = self.op.lock();
        {
            let state = self.state.read();
            if name == ROOT {
                return Err(FsError::RootUnlink);
            }
            let node = state
                .nodes
                .get(&name)
                .ok_or_else(|| FsError::NotFound(name.clone()))?;
            if !node.children.is_empty() {
                return Err(FsError::DirectoryNotEmpty(name.clone()));
            }
        }

        let event = TouchEvent {
            model: self.id,
            name: name.clone(),
            kind: TouchKind::Unlink,
        };
        self.touch(&event, |state| {
            state.nodes.remove(&name);
            if let Some(parent) = entry::parent_of(&name) {
                if let Some(p) = state.nodes.get_mut(parent) {
                    p.children.remove(entry::base_name(&name));
                }
            }
        });
        Ok(())
    }

    /// Set the timestamps in `access` to `value`. Returns whether anything
    /// actually changed.
    pub fn set_time(&self, name: &str, access: Access, value: i64) -> Result<bool> {
        self.check_writable()?;
        let name = entry::normalize(name)?;
        let _op = self.op.lock();
        let current = self
            .entry(&name)
            .ok_or_else(|| FsError::NotFound(name.clone()))?;
        let changed = access.iter().any(|kind| current.time(kind) != Some(value));

        let event = TouchEvent {
            model: self.id,
            name: name.clone(),
            kind: TouchKind::SetTime,
        };
        self.touch(&event, |state| {
            if let Some(node) = state.nodes.get_mut(&name) {
                node.entry = node.entry.clone().with_time(access, Some(value));
            }
        });
        Ok(changed)
    }

    /// Replace the attributes of an existing entry. Name and type must match.
    pub fn update(&self, entry: Entry) -> Result<()> {
        self.check_writable()?;
        let _op = self.op.lock();
        let name = entry.name().to_string();
        match self.entry(&name) {
            None => return Err(FsError::NotFound(name)),
            Some(current) if current.entry_type() != entry.entry_type() => {
                return Err(FsError::AlreadyExists(name))
            }
            Some(_) => {}
        }

        let event = TouchEvent {
            model: self.id,
            name: name.clone(),
            kind: TouchKind::Update,
        };
        self.touch(&event, |state| {
            if let Some(node) = state.nodes.get_mut(&name) {
                node.entry = entry;
            }
        });
        Ok(())
    }

    /// Adopt codec fields and sizes assigned by a flush without touching
    pub(crate) fn refresh(&self, written: impl IntoIterator<Item = Entry>) {
        let _op = self.op.lock();
        let mut state = self.state.write();
        for e in written {
            if let Some(node) = state.nodes.get_mut(e.name()) {
                if node.entry.entry_type() == e.entry_type() {
                    node.entry = e;
                }
            }
        }
    }

    /// Register a listener. Adding the same listener twice is a no-op.
    pub fn add_listener(&self, listener: Arc<dyn TouchListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Unregister a listener. Returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn TouchListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    /// Snapshot of the registered listeners
    pub fn listeners(&self) -> Vec<Arc<dyn TouchListener>> {
        self.listeners.lock().clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(FsError::ReadOnly("archive mounted read-only".into()))
        } else {
            Ok(())
        }
    }

    /// Apply one change bracketed by listener deliveries. Callers hold `op`.
    fn touch(&self, event: &TouchEvent, apply: impl FnOnce(&mut ModelState)) {
        let listeners = self.listeners();
        for l in &listeners {
            l.before_touch(event);
        }
        {
            let mut state = self.state.write();
            apply(&mut state);
            state.touched = true;
            state.generation += 1;
        }
        for l in &listeners {
            l.after_touch(event);
        }
    }
}

/// A validated, not yet applied entry creation
pub struct Mknod<'a> {
    fs: &'a ArchiveFileSystem,
    name: String,
    entry: Entry,
    options: MknodOptions,
}

impl std::fmt::Debug for Mknod<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mknod").field("entry", &self.entry).finish()
    }
}

impl Mknod<'_> {
    /// The entry that will be inserted
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Adjust the entry before commit (for instance its size)
    pub fn with_entry(mut self, f: impl FnOnce(Entry) -> Entry) -> Self {
        let name = self.entry.name().to_string();
        let entry_type = self.entry.entry_type();
        let e = f(self.entry);
        // Name and type were validated; keep them
        self.entry = if e.name() == name && e.entry_type() == entry_type {
            e
        } else {
            e.renamed(name)
        };
        self
    }

    /// Insert the node, creating parents as requested
    pub fn commit(self) -> Result<Entry> {
        let fs = self.fs;
        let _op = fs.op.lock();
        {
            let state = fs.state.read();
            validate_mknod(&state, &self.name, self.entry.entry_type(), self.options)?;
        }

        let event = TouchEvent {
            model: fs.id,
            name: self.name.clone(),
            kind: TouchKind::Mknod,
        };
        let entry = self.entry.clone();
        let name = self.name;
        fs.touch(&event, |state| {
            let mut missing = Vec::new();
            let mut cur = entry::parent_of(&name);
            while let Some(p) = cur {
                if state.nodes.contains_key(p) {
                    break;
                }
                missing.push(p.to_string());
                cur = entry::parent_of(p);
            }
            for dir in missing.into_iter().rev() {
                let e = fs.factory.new_entry(&dir, EntryType::Directory, None);
                insert_node(state, Node::new(e));
            }
            let mut node = Node::new(self.entry);
            if let Some(old) = state.nodes.get(&name) {
                node.children = old.children.clone();
            }
            insert_node(state, node);
        });
        Ok(entry)
    }
}

fn insert_node(state: &mut ModelState, node: Node) {
    let name = node.entry.name().to_string();
    if let Some(parent) = entry::parent_of(&name) {
        if let Some(p) = state.nodes.get_mut(parent) {
            p.children.insert(entry::base_name(&name).to_string());
        }
    }
    state.nodes.insert(name, node);
}

fn validate_mknod(
    state: &ModelState,
    name: &str,
    entry_type: EntryType,
    options: MknodOptions,
) -> Result<()> {
    if let Some(existing) = state.nodes.get(name) {
        let replaceable = !options.exclusive
            && !existing.entry.is_directory()
            && entry_type != EntryType::Directory;
        if !replaceable {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
    }

    let mut cur = entry::parent_of(name);
    let mut nearest = true;
    while let Some(p) = cur {
        match state.nodes.get(p) {
            Some(node) if !node.entry.is_directory() => {
                return Err(FsError::NotADirectory(p.to_string()))
            }
            Some(_) => return Ok(()),
            None if nearest && !options.create_parents => {
                return Err(FsError::NotFound(p.to_string()))
            }
            None => {}
        }
        nearest = false;
        cur = entry::parent_of(p);
    }
    Ok(())
}

/// Link `name` into its parent, creating missing directories. Returns false
/// (and removes `name`) if an ancestor is not a directory.
fn attach(nodes: &mut BTreeMap<String, Node>, factory: &dyn EntryFactory, name: &str) -> bool {
    let parent = match entry::parent_of(name) {
        Some(p) => p.to_string(),
        None => return true,
    };
    let parent_ok = match nodes.get(&parent) {
        Some(node) => node.entry.is_directory(),
        None => {
            let dir = factory.new_entry(&parent, EntryType::Directory, None);
            nodes.insert(parent.clone(), Node::new(dir));
            attach(nodes, factory, &parent)
        }
    };
    if !parent_ok {
        warn!("Dropping {:?}: parent is not a directory", name);
        nodes.remove(name);
        return false;
    }
    if let Some(p) = nodes.get_mut(&parent) {
        p.children.insert(entry::base_name(name).to_string());
    }
    true
}
