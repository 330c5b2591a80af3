//! Linux FUSE frontend for stackfs.
//!
//! [`StackFuse`] answers kernel requests with calls into a
//! [`stackfs_core::StackFs`]; [`mount`] starts a background session for it.

pub mod fuse;
pub mod inode;

pub use fuse::{mount, StackFuse};
pub use inode::{InodeTable, ROOT_INO};
