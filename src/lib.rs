//! # Plugin VM Host
//!
//! A plugin host that isolates each plugin inside a Firecracker microVM and
//! serves HTTP action hooks against it.
//!
//! This crate provides:
//! - A host-network allocator handing out TAP devices and IPv4 addresses
//! - A VM supervisor driving each Firecracker child through its lifecycle
//! - An on-disk snapshot store for full and differential VM state
//! - A pre-warm pool of paused, booted VMs leased out per dispatch
//! - A plugin lifecycle state machine and health-gated action-hook dispatcher
//!
//! ## Architecture
//!
//! ```text
//! Host
//!     ├── Allocator       (network::Allocator)
//!     ├── VmSupervisor     (vm::VmSupervisor)
//!     ├── PrewarmPool       (pool::PrewarmPool)
//!     ├── SnapshotStore      (snapshot::SnapshotStore)
//!     └── PluginRegistry      (registry::JsonFileRegistry)
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod manifest;
pub mod network;
pub mod pool;
pub mod registry;
pub mod snapshot;
pub mod vm;

pub use config::Config;
pub use dispatch::Host;
pub use error::{Error, Result};
pub use network::Allocator;
pub use pool::PrewarmPool;
pub use registry::{JsonFileRegistry, Plugin, PluginRegistry, PluginStatus};
pub use snapshot::SnapshotStore;
pub use vm::VmSupervisor;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
