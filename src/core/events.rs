//! Instrumentation sink
//!
//! The kernel reports stream creation, model mutations and sync outcomes to
//! one [`EventSink`]. Sinks only observe; the kernel behaves the same
//! whichever sink is attached.

use crate::error::FsError;
use crate::model::{TouchEvent, TouchKind};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Direction of an entry stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Input,
    Output,
}

/// Receiver of kernel events. All methods default to no-ops.
pub trait EventSink: Send + Sync {
    fn before_stream(&self, _mount: &str, _entry: &str, _kind: StreamKind) {}

    /// `ok` is false if the stream could not be created
    fn after_stream(&self, _mount: &str, _entry: &str, _kind: StreamKind, _ok: bool) {}

    fn before_touch(&self, _mount: &str, _event: &TouchEvent) {}

    fn after_touch(&self, _mount: &str, _event: &TouchEvent) {}

    fn synced(&self, _mount: &str, _error: Option<&FsError>) {}
}

/// Ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn after_stream(&self, mount: &str, entry: &str, kind: StreamKind, ok: bool) {
        debug!(mount, entry, ?kind, ok, "entry stream");
    }

    fn after_touch(&self, mount: &str, event: &TouchEvent) {
        debug!(mount, entry = %event.name, kind = ?event.kind, "touch");
    }

    fn synced(&self, mount: &str, error: Option<&FsError>) {
        match error {
            None => info!(mount, "synced"),
            Some(e) => warn!(mount, error = %e, "sync failed"),
        }
    }
}

/// Recorded kernel event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    BeforeStream {
        mount: String,
        entry: String,
        kind: StreamKind,
    },
    AfterStream {
        mount: String,
        entry: String,
        kind: StreamKind,
        ok: bool,
    },
    BeforeTouch {
        mount: String,
        entry: String,
        kind: TouchKind,
    },
    AfterTouch {
        mount: String,
        entry: String,
        kind: TouchKind,
    },
    Synced {
        mount: String,
        ok: bool,
    },
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl EventSink for RecordingSink {
    fn before_stream(&self, mount: &str, entry: &str, kind: StreamKind) {
        self.push(Event::BeforeStream {
            mount: mount.to_string(),
            entry: entry.to_string(),
            kind,
        });
    }

    fn after_stream(&self, mount: &str, entry: &str, kind: StreamKind, ok: bool) {
        self.push(Event::AfterStream {
            mount: mount.to_string(),
            entry: entry.to_string(),
            kind,
            ok,
        });
    }

    fn before_touch(&self, mount: &str, event: &TouchEvent) {
        self.push(Event::BeforeTouch {
            mount: mount.to_string(),
            entry: event.name.clone(),
            kind: event.kind,
        });
    }

    fn after_touch(&self, mount: &str, event: &TouchEvent) {
        self.push(Event::AfterTouch {
            mount: mount.to_string(),
            entry: event.name.clone(),
            kind: event.kind,
        });
    }

    fn synced(&self, mount: &str, error: Option<&FsError>) {
        self.push(Event::Synced {
            mount: mount.to_string(),
            ok: error.is_none(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        let event = TouchEvent {
            model: 1,
            name: "a".into(),
            kind: TouchKind::Mknod,
        };
        sink.before_touch("x.sar", &event);
        sink.after_touch("x.sar", &event);
        sink.synced("x.sar", Some(&FsError::RootUnlink));

        assert_eq!(sink.events().len(), 3);
        assert_eq!(
            sink.count(|e| matches!(e, Event::Synced { ok: false, .. })),
            1
        );
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
