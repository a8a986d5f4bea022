//! Sync options and the sync exception chain
//!
//! A sync pass keeps going after a mount fails. Every failure is appended to
//! a [`SyncErrorChain`] that remembers the order it was recorded in; the
//! chain is reported once, sorted so the most severe cause comes first.

use crate::error::FsError;
use std::fmt;

/// What a sync pass should do with each mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncOptions {
    /// Drop the mount after flushing
    pub umount: bool,
    /// Close open entry streams instead of failing with `Busy`
    pub force_close: bool,
    /// Discard pending changes instead of writing them
    pub abort_changes: bool,
}

impl SyncOptions {
    /// Flush changes, keep mounts
    pub const SYNC: SyncOptions = SyncOptions {
        umount: false,
        force_close: false,
        abort_changes: false,
    };

    /// Flush changes, close open streams, drop mounts
    pub const UMOUNT: SyncOptions = SyncOptions {
        umount: true,
        force_close: true,
        abort_changes: false,
    };

    /// Discard changes, close open streams, drop mounts
    pub const ABORT: SyncOptions = SyncOptions {
        umount: true,
        force_close: true,
        abort_changes: true,
    };
}

/// Failure class. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// The sync went through but something was lost on the way (e.g. open
    /// streams were forcibly closed)
    Warning,
    /// The mount could not be flushed
    Error,
}

/// One recorded failure
#[derive(Debug)]
pub struct SyncException {
    mount: String,
    severity: Severity,
    error: FsError,
    seq: usize,
    predecessor: Option<usize>,
}

impl SyncException {
    pub fn mount(&self) -> &str {
        &self.mount
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn error(&self) -> &FsError {
        &self.error
    }

    pub fn into_error(self) -> FsError {
        self.error
    }

    /// Position in recording order
    pub fn seq(&self) -> usize {
        self.seq
    }

    /// Sequence number of the failure recorded just before this one
    pub fn predecessor(&self) -> Option<usize> {
        self.predecessor
    }
}

impl fmt::Display for SyncException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.severity, self.mount, self.error)
    }
}

/// Every failure of one sync pass
#[derive(Debug, Default)]
pub struct SyncErrorChain {
    causes: Vec<SyncException>,
}

impl SyncErrorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a failure, linking it to the previous one
    pub fn push(&mut self, mount: impl Into<String>, severity: Severity, error: FsError) {
        let seq = self.causes.iter().map(|c| c.seq + 1).max().unwrap_or(0);
        let predecessor = seq.checked_sub(1);
        self.causes.push(SyncException {
            mount: mount.into(),
            severity,
            error,
            seq,
            predecessor,
        });
    }

    pub fn warn(&mut self, mount: impl Into<String>, error: FsError) {
        self.push(mount, Severity::Warning, error);
    }

    pub fn error(&mut self, mount: impl Into<String>, error: FsError) {
        self.push(mount, Severity::Error, error);
    }

    /// Move all causes of `other` to the end of this chain
    pub fn append(&mut self, other: SyncErrorChain) {
        let mut causes = other.causes;
        causes.sort_by_key(|c| c.seq);
        for c in causes {
            self.push(c.mount, c.severity, c.error);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    /// Most severe first, then in recording order
    pub fn sort(&mut self) {
        self.causes
            .sort_by(|a, b| b.severity.cmp(&a.severity).then(a.seq.cmp(&b.seq)));
    }

    pub fn causes(&self) -> &[SyncException] {
        &self.causes
    }

    /// Highest severity in the chain
    pub fn max_severity(&self) -> Option<Severity> {
        self.causes.iter().map(|c| c.severity).max()
    }

    /// Most severe cause
    pub fn head(&self) -> Option<&SyncException> {
        self.causes
            .iter()
            .min_by(|a, b| b.severity.cmp(&a.severity).then(a.seq.cmp(&b.seq)))
    }

    /// Only the causes of mount `mount`
    pub fn for_mount<'a>(&'a self, mount: &'a str) -> impl Iterator<Item = &'a SyncException> {
        self.causes.iter().filter(move |c| c.mount == mount)
    }

    /// `Ok` if nothing was recorded, otherwise the sorted chain
    pub fn into_result(mut self) -> Result<(), SyncErrorChain> {
        if self.causes.is_empty() {
            Ok(())
        } else {
            self.sort();
            Err(self)
        }
    }

    /// Flatten into one error, `None` if nothing was recorded. Several
    /// causes come back as [`FsError::Drain`], most severe first.
    pub fn into_error(mut self) -> Option<FsError> {
        self.sort();
        match self.causes.len() {
            0 => None,
            1 => Some(self.causes.remove(0).error),
            _ => Some(FsError::Drain(
                self.causes.into_iter().map(|c| c.error).collect(),
            )),
        }
    }
}

impl IntoIterator for SyncErrorChain {
    type Item = SyncException;
    type IntoIter = std::vec::IntoIter<SyncException>;

    fn into_iter(self) -> Self::IntoIter {
        self.causes.into_iter()
    }
}

impl fmt::Display for SyncErrorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync failed with {} cause(s)", self.causes.len())?;
        for c in &self.causes {
            write!(f, "\n  {}", c)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncErrorChain {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.head().map(|c| &c.error as &(dyn std::error::Error + 'static))
    }
}
