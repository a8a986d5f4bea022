//! Archive entries
//!
//! An [`Entry`] is an immutable value record describing one archive member.
//! Drivers produce entries through an [`EntryFactory`]; the kernel only
//! changes codec fields through the declared `with_*` setters.

use crate::compression::CompressionMethod;
use crate::error::{FsError, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the root entry of every archive.
pub const ROOT: &str = "";

/// Entry separator
pub const SEPARATOR: char = '/';

/// Entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Anything else the format can represent (links, devices, ...)
    Special,
}

bitflags! {
    /// Timestamp kinds
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Access: u8 {
        const CREATE = 0b001;
        const READ = 0b010;
        const WRITE = 0b100;
    }
}

impl Access {
    /// Storage slot of a single kind, `None` for empty or combined flags
    fn slot(self) -> Option<usize> {
        if self == Access::CREATE {
            Some(0)
        } else if self == Access::READ {
            Some(1)
        } else if self == Access::WRITE {
            Some(2)
        } else {
            None
        }
    }
}

/// Current time as milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One archive member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    name: String,
    #[serde(rename = "type")]
    entry_type: EntryType,
    /// Uncompressed size, `None` if unknown
    size: Option<u64>,
    /// Created, read, written (milliseconds), each independently unknown
    times: [Option<i64>; 3],
    #[serde(default)]
    method: CompressionMethod,
    #[serde(default)]
    encrypted: bool,
}

impl Entry {
    /// Create an entry. `name` must already be normalized.
    pub fn new(name: impl Into<String>, entry_type: EntryType) -> Self {
        Entry {
            name: name.into(),
            entry_type,
            size: if entry_type == EntryType::Directory {
                Some(0)
            } else {
                None
            },
            times: [None; 3],
            method: CompressionMethod::None,
            encrypted: false,
        }
    }

    pub fn root() -> Self {
        Entry::new(ROOT, EntryType::Directory)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn is_directory(&self) -> bool {
        self.entry_type == EntryType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.entry_type == EntryType::File
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Timestamp for a single access kind. Combined or empty flags have
    /// no single timestamp and yield `None`.
    pub fn time(&self, access: Access) -> Option<i64> {
        access.slot().and_then(|slot| self.times[slot])
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Same entry under another name (used when a template is applied)
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Entry {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    /// Set every kind in `access` to `value`
    pub fn with_time(mut self, access: Access, value: Option<i64>) -> Self {
        for slot in access.iter().filter_map(Access::slot) {
            self.times[slot] = value;
        }
        self
    }

    pub fn with_method(mut self, method: CompressionMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Compare the attributes a remount must preserve
    pub fn same_listing(&self, other: &Entry) -> bool {
        self.name == other.name
            && self.entry_type == other.entry_type
            && self.size == other.size
            && self.times == other.times
    }
}

/// Creates entries of the correct concrete kind for one archive family
pub trait EntryFactory: Send + Sync {
    /// Create a new entry. `template` carries attributes to copy (times,
    /// codec fields) when an entry is replaced or copied.
    fn new_entry(&self, name: &str, entry_type: EntryType, template: Option<&Entry>) -> Entry {
        match template {
            Some(t) => {
                let mut e = Entry::new(name, entry_type);
                for kind in [Access::CREATE, Access::READ, Access::WRITE] {
                    e = e.with_time(kind, t.time(kind));
                }
                e.with_method(t.method()).with_encrypted(t.is_encrypted())
            }
            None => Entry::new(name, entry_type).with_time(Access::WRITE, Some(now_millis())),
        }
    }
}

/// Factory with no format-specific fixups
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEntryFactory;

impl EntryFactory for DefaultEntryFactory {}

/// Normalize an entry name: strip leading/trailing separators and reject
/// empty, `.` and `..` segments.
pub fn normalize(name: &str) -> Result<String> {
    if name.contains('\0') || name.contains('\\') {
        return Err(FsError::InvalidName(name.to_string()));
    }
    let trimmed = name.trim_matches(SEPARATOR);
    if trimmed.is_empty() {
        return Ok(ROOT.to_string());
    }
    for segment in trimmed.split(SEPARATOR) {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(FsError::InvalidName(name.to_string()));
        }
    }
    Ok(trimmed.to_string())
}

/// Parent entry name; `None` for the root
pub fn parent_of(name: &str) -> Option<&str> {
    if name.is_empty() {
        return None;
    }
    Some(match name.rfind(SEPARATOR) {
        Some(idx) => &name[..idx],
        None => ROOT,
    })
}

/// Last segment of an entry name
pub fn base_name(name: &str) -> &str {
    match name.rfind(SEPARATOR) {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

/// Join a parent entry name and a child segment
pub fn join(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}{}{}", parent, SEPARATOR, child)
    }
}
