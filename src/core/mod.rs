//! Kernel of the federated archive file system
//!
//! - [`buffer_pool`] - Leased scratch buffers (memory or temp file backed)
//! - [`socket`] - Input/output sockets with peering and raw copies
//! - [`mux`] - Multiplexed output over sequential archive writers
//! - [`model`] - In-memory entry tree of one mounted archive
//! - [`controller`] - Mount, flush and unmount of one container
//! - [`manager`] - Path resolution and sync across all mounts
//! - [`sync`] - Sync options and the sync exception chain
//! - [`driver`] - Archive formats, including the built-in SAR format
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ FsManager: paths -> host | mount + entry   │
//! ├────────────────────────────────────────────┤
//! │ ArchiveController (one per container)      │
//! │   model ── ArchiveFileSystem               │
//! │   input ── InputService (driver)           │
//! │   output ─ MultiplexedOutput ─ OutputService│
//! ├────────────────────────────────────────────┤
//! │ parent: host file | entry of parent mount  │
//! └────────────────────────────────────────────┘
//! ```

pub mod buffer_pool;
pub mod compression;
pub mod config;
pub mod controller;
pub mod driver;
pub mod encryption;
pub mod entry;
pub mod error;
pub mod events;
pub mod manager;
pub mod model;
pub mod mux;
pub mod socket;
pub mod sync;
