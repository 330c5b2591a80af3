//! The lower filesystem as seen by the adapter.
//!
//! A lower filesystem is reached through the object-safe [`LowerFs`] trait,
//! which works on inode-level primitives. Names are resolved into
//! [`LowerDentry`] edges and carried around as [`LowerPath`] pairs of
//! `(mount, dentry)`.
//!
//! Two backends are provided: [`memory::MemoryLower`], an in-memory tree,
//! and (on Linux) [`host::HostLower`], a passthrough over a real directory.

pub mod dentry;
pub mod memory;

#[cfg(target_os = "linux")]
pub mod host;
#[cfg(target_os = "linux")]
pub mod mountinfo;

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{Result, StackError};
use crate::types::{DirEntry, NodeAttr, NodeKind, OpenFlags, SetAttr, StatFs};

pub use dentry::{LowerDentry, LowerPath};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// `statfs` magic of overlayfs.
pub const OVERLAYFS_MAGIC: u64 = 0x794c_7630;

/// `FS_IOC_GETFLAGS` as seen on 64-bit Linux.
pub const IOC_GETFLAGS: u32 = 0x8008_6601;
/// `FS_IOC_SETFLAGS` as seen on 64-bit Linux.
pub const IOC_SETFLAGS: u32 = 0x4008_6602;

/// Identity of a lower node: device plus inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    pub dev: u64,
    pub ino: u64,
}

impl NodeId {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// One lower filesystem instance.
///
/// Tracks how many mounts keep the instance active, plus the limits a mount
/// on top of it inherits.
#[derive(Debug)]
pub struct FsInstance {
    id: u64,
    dev: u64,
    fs_type: String,
    max_bytes: u64,
    time_gran: Duration,
    active: AtomicUsize,
}

impl FsInstance {
    pub fn new(dev: u64, fs_type: impl Into<String>, max_bytes: u64, time_gran: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            dev,
            fs_type: fs_type.into(),
            max_bytes,
            time_gran,
            active: AtomicUsize::new(0),
        })
    }

    /// Process-unique serial of this instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn fs_type(&self) -> &str {
        &self.fs_type
    }

    /// Largest file size the instance accepts.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Timestamp granularity of the instance.
    pub fn time_gran(&self) -> Duration {
        self.time_gran
    }

    pub fn is_same(&self, other: &FsInstance) -> bool {
        self.id == other.id
    }

    /// Number of outstanding [`ActivePin`]s.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the instance as in active use until the returned pin is dropped.
    pub fn pin_active(self: &Arc<Self>) -> ActivePin {
        self.active.fetch_add(1, Ordering::AcqRel);
        ActivePin {
            instance: Arc::clone(self),
        }
    }
}

/// Active-use reference on a lower filesystem instance.
#[derive(Debug)]
pub struct ActivePin {
    instance: Arc<FsInstance>,
}

impl ActivePin {
    pub fn instance(&self) -> &Arc<FsInstance> {
        &self.instance
    }
}

impl Drop for ActivePin {
    fn drop(&mut self) {
        self.instance.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Backend-specific handle kept by a lower inode.
#[derive(Debug)]
pub enum InodeHandle {
    /// State lives in the owning in-memory tree.
    Memory,
    /// An `O_PATH` descriptor for the host object.
    #[cfg(target_os = "linux")]
    Host(std::os::fd::OwnedFd),
}

const DYING: usize = 1 << (usize::BITS - 1);

/// One lower node. Unique per [`NodeId`] within its backend.
pub struct LowerInode {
    id: NodeId,
    instance: Arc<FsInstance>,
    kind: NodeKind,
    generation: u64,
    /// Pin count in the low bits, [`DYING`] in the top bit.
    state: AtomicUsize,
    attr: RwLock<NodeAttr>,
    dir_lock: Mutex<()>,
    handle: InodeHandle,
}

impl LowerInode {
    pub fn new(
        id: NodeId,
        instance: Arc<FsInstance>,
        generation: u64,
        attr: NodeAttr,
        handle: InodeHandle,
    ) -> Arc<Self> {
        let kind = attr.kind().unwrap_or(NodeKind::Regular);
        Arc::new(Self {
            id,
            instance,
            kind,
            generation,
            state: AtomicUsize::new(0),
            attr: RwLock::new(attr),
            dir_lock: Mutex::new(()),
            handle,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn ino(&self) -> u64 {
        self.id.ino
    }

    pub fn instance(&self) -> &Arc<FsInstance> {
        &self.instance
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&self) -> &InodeHandle {
        &self.handle
    }

    /// Snapshot of the cached attributes.
    pub fn attr(&self) -> NodeAttr {
        *self.attr.read()
    }

    pub fn set_attr(&self, attr: NodeAttr) {
        *self.attr.write() = attr;
    }

    /// Applies `f` to the cached attributes in place.
    pub fn update_attr(&self, f: impl FnOnce(&mut NodeAttr)) {
        f(&mut self.attr.write());
    }

    /// Serialises namespace changes inside this directory.
    pub fn lock_dir(&self) -> MutexGuard<'_, ()> {
        self.dir_lock.lock()
    }

    /// Takes an explicit reference on the inode.
    ///
    /// Fails with [`StackError::Unavailable`] once the inode is dying.
    pub fn try_pin(self: &Arc<Self>) -> Result<PinnedInode> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if state & DYING != 0 {
                    None
                } else {
                    Some(state + 1)
                }
            })
            .map_err(|_| StackError::Unavailable { ino: self.id.ino })?;
        Ok(PinnedInode {
            inode: Arc::clone(self),
        })
    }

    pub fn pin_count(&self) -> usize {
        self.state.load(Ordering::Acquire) & !DYING
    }

    pub fn is_dying(&self) -> bool {
        self.state.load(Ordering::Acquire) & DYING != 0
    }

    /// Marks the inode as being destroyed. Only succeeds while unpinned.
    pub fn mark_dying(&self) -> bool {
        self.state
            .compare_exchange(0, DYING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unpin(&self) {
        self.state.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for LowerInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LowerInode")
            .field("id", &self.id)
            .field("instance", &self.instance.id())
            .field("kind", &self.kind)
            .field("pins", &self.pin_count())
            .field("dying", &self.is_dying())
            .finish()
    }
}

/// An explicit reference on a [`LowerInode`], released on drop.
#[derive(Debug)]
pub struct PinnedInode {
    inode: Arc<LowerInode>,
}

impl PinnedInode {
    pub fn inode(&self) -> &Arc<LowerInode> {
        &self.inode
    }
}

impl std::ops::Deref for PinnedInode {
    type Target = LowerInode;

    fn deref(&self) -> &LowerInode {
        &self.inode
    }
}

impl Drop for PinnedInode {
    fn drop(&mut self) {
        self.inode.unpin();
    }
}

/// Layout of an overlay-style lower filesystem.
#[derive(Debug, Clone, Default)]
pub struct OverlayLayout {
    /// The writable upper layer, absent for a read-only overlay
    pub upper: Option<Arc<dyn LowerFs>>,
    pub upper_dir: Option<PathBuf>,
    /// The overlay's configured work path
    pub work_dir: Option<PathBuf>,
    /// Whether the work path was still reachable when probed
    pub work_dir_present: bool,
    pub lower_dirs: Vec<PathBuf>,
}

/// What kind of filesystem the lower instance is.
#[derive(Debug, Clone)]
pub enum LowerKind {
    Plain,
    Overlay(OverlayLayout),
}

impl LowerKind {
    pub fn is_overlay(&self) -> bool {
        matches!(self, LowerKind::Overlay(_))
    }
}

/// An open lower file.
pub trait LowerFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize>;

    fn fsync(&self, datasync: bool) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Current size of the file.
    fn size(&self) -> Result<u64>;

    fn ioctl(&self, cmd: u32, _arg: u64) -> Result<u64> {
        Err(StackError::NotSupported {
            operation: format!("ioctl {:#x}", cmd),
        })
    }

    /// Whether a shared writable mapping of this file can be backed.
    fn supports_shared_writable_mapping(&self) -> bool;
}

/// Inode-level interface of a lower filesystem.
pub trait LowerFs: Send + Sync + fmt::Debug {
    fn instance(&self) -> &Arc<FsInstance>;

    fn kind(&self) -> LowerKind;

    /// Where the filesystem was reached from, for diagnostics.
    fn source(&self) -> &Path;

    fn root(&self) -> Result<Arc<LowerInode>>;

    /// Resolves `name` in `dir`. A missing name is [`StackError::NotFound`].
    fn lookup(&self, dir: &LowerInode, name: &OsStr) -> Result<Arc<LowerInode>>;

    /// Refreshes and returns the attributes of `inode`.
    fn getattr(&self, inode: &LowerInode) -> Result<NodeAttr>;

    fn setattr(&self, inode: &LowerInode, changes: &SetAttr) -> Result<NodeAttr>;

    fn create(&self, dir: &LowerInode, name: &OsStr, mode: u32) -> Result<Arc<LowerInode>>;

    fn mkdir(&self, dir: &LowerInode, name: &OsStr, mode: u32) -> Result<Arc<LowerInode>>;

    fn mknod(&self, dir: &LowerInode, name: &OsStr, mode: u32, rdev: u64) -> Result<Arc<LowerInode>>;

    fn symlink(&self, dir: &LowerInode, name: &OsStr, target: &Path) -> Result<Arc<LowerInode>>;

    fn link(&self, source: &LowerInode, dir: &LowerInode, name: &OsStr) -> Result<Arc<LowerInode>>;

    fn unlink(&self, dir: &LowerInode, name: &OsStr) -> Result<()>;

    fn rmdir(&self, dir: &LowerInode, name: &OsStr) -> Result<()>;

    fn rename(
        &self,
        old_dir: &LowerInode,
        old_name: &OsStr,
        new_dir: &LowerInode,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<()>;

    fn readlink(&self, inode: &LowerInode) -> Result<PathBuf>;

    fn readdir(&self, dir: &LowerInode) -> Result<Vec<DirEntry>>;

    fn open(&self, inode: &LowerInode, flags: OpenFlags) -> Result<Box<dyn LowerFile>>;

    fn statfs(&self, inode: &LowerInode) -> Result<StatFs>;

    fn getxattr(&self, inode: &LowerInode, name: &OsStr) -> Result<Vec<u8>>;

    fn setxattr(&self, inode: &LowerInode, name: &OsStr, value: &[u8], flags: i32) -> Result<()>;

    fn listxattr(&self, inode: &LowerInode) -> Result<Vec<OsString>>;

    fn removexattr(&self, inode: &LowerInode, name: &OsStr) -> Result<()>;

    /// Takes write access on the mount. Paired with [`LowerFs::drop_write`].
    fn want_write(&self) -> Result<()>;

    fn drop_write(&self);

    /// Finds a live inode of this instance by number.
    fn inode_by_ino(&self, ino: u64) -> Option<Arc<LowerInode>>;

    /// Notification that a forced unmount has started.
    fn umount_begin(&self) {}
}

/// Write access on a lower mount, released on drop.
pub struct WriteAccess<'a> {
    fs: &'a dyn LowerFs,
}

impl<'a> WriteAccess<'a> {
    pub fn acquire(fs: &'a dyn LowerFs) -> Result<Self> {
        fs.want_write()?;
        Ok(Self { fs })
    }
}

impl Drop for WriteAccess<'_> {
    fn drop(&mut self) {
        self.fs.drop_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::metadata::S_IFREG;
    use std::time::SystemTime;

    fn inode(ino: u64) -> Arc<LowerInode> {
        let instance = FsInstance::new(1, "test", u64::MAX, Duration::from_nanos(1));
        LowerInode::new(
            NodeId::new(1, ino),
            instance,
            0,
            NodeAttr::new(ino, S_IFREG | 0o644, SystemTime::UNIX_EPOCH),
            InodeHandle::Memory,
        )
    }

    #[test]
    fn test_pin_and_release() {
        let inode = inode(5);
        let a = inode.try_pin().unwrap();
        let b = inode.try_pin().unwrap();
        assert_eq!(inode.pin_count(), 2);
        drop(a);
        assert_eq!(inode.pin_count(), 1);
        assert!(!inode.mark_dying());
        drop(b);
        assert_eq!(inode.pin_count(), 0);
    }

    #[test]
    fn test_dying_inode_refuses_pins() {
        let inode = inode(6);
        assert!(inode.mark_dying());
        assert!(inode.is_dying());
        let err = inode.try_pin().unwrap_err();
        assert!(matches!(err, StackError::Unavailable { ino: 6 }));
        assert_eq!(inode.pin_count(), 0);
    }

    #[test]
    fn test_active_pin_balance() {
        let instance = FsInstance::new(3, "test", u64::MAX, Duration::from_nanos(1));
        let pin = instance.pin_active();
        assert_eq!(instance.active_count(), 1);
        assert!(pin.instance().is_same(&instance));
        drop(pin);
        assert_eq!(instance.active_count(), 0);
    }

    #[test]
    fn test_instances_are_distinct() {
        let a = FsInstance::new(3, "test", u64::MAX, Duration::from_nanos(1));
        let b = FsInstance::new(3, "test", u64::MAX, Duration::from_nanos(1));
        assert!(!a.is_same(&b));
        assert!(a.is_same(&a));
    }
}
