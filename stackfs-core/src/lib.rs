//! # stackfs core
//!
//! A stacking filesystem adapter: it mounts on top of one existing lower
//! filesystem and forwards every operation to it, keeping its own nodes and
//! entries in front of the lower ones.
//!
//! ## Overview
//!
//! Every adapter node stands for exactly one lower node. Lookups resolve
//! names in the lower tree and interpose shadow nodes through an identity
//! cache keyed by lower node; names missing from the lower tree produce
//! negative entries that a later create can fill. Each mount also keeps a
//! private working triad (`._stackfs/{data,meta}`) in the writable layer of
//! the lower filesystem.
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use stackfs_core::{LookupFlags, MountOptions, StackFs};
//! use std::ffi::OsStr;
//!
//! let fs = StackFs::mount("/srv/data", MountOptions::default())?;
//! let root = fs.root()?;
//! let entry = fs.lookup(&root, OsStr::new("missing.txt"), LookupFlags::CREATE)?;
//! assert!(entry.is_negative());
//! ```
//!
//! ## Architecture
//!
//! - [`lower`]: the lower filesystem interface and its backends
//! - [`shadow`]: shadow nodes, the identity cache and directory entries
//! - [`lookup`]: name resolution and interposition
//! - [`create`]: creation of lower objects by kind
//! - [`workdir`]: bootstrap of the working triad
//! - [`superblock`]: per-mount state and lifecycle
//! - [`fs`]: high-level operations
//! - [`file`]: open file delegation
//! - [`xattr`]: extended attribute forwarding
//! - [`stats`]: counters
//!
//! The `stackfs-linux` crate exposes [`StackFs`] to the kernel through FUSE.

pub mod types;
pub mod error;
pub mod lower;
pub mod shadow;
pub mod lookup;
pub mod create;
pub mod workdir;
pub mod superblock;
pub mod fs;
pub mod file;
pub mod xattr;
pub mod stats;

pub use error::{Result, StackError};
pub use file::FileHandle;
pub use fs::StackFs;
pub use shadow::{ShadowEntry, ShadowNode};
pub use stats::{AdapterStats, OperationType, StatsSnapshot};
pub use superblock::{Superblock, STACKFS_SUPER_MAGIC};
pub use types::*;
