//! In-memory lower filesystem.
//!
//! A complete inode tree kept in a hash map, used by the test suite and for
//! dry runs. It can pose as an overlay (with a separate upper instance), be
//! switched read-only, and graft the root of another instance below one of
//! its directories the way a bind mount would.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use super::{
    FsInstance, InodeHandle, LowerFile, LowerFs, LowerInode, LowerKind, NodeId, OverlayLayout,
    IOC_GETFLAGS, IOC_SETFLAGS, OVERLAYFS_MAGIC,
};
use crate::error::{Result, StackError};
use crate::types::metadata::{S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::types::{DirEntry, NodeAttr, NodeKind, OpenFlags, SetAttr, StatFs, RENAME_NOREPLACE};

pub const TMPFS_MAGIC: u64 = 0x0102_1994;

const XATTR_CREATE: i32 = 1;
const XATTR_REPLACE: i32 = 2;

const ROOT_INO: u64 = 1;

const ACL_DEFAULT: &str = "system.posix_acl_default";
const ACL_ACCESS: &str = "system.posix_acl_access";

static NEXT_DEV: AtomicU64 = AtomicU64::new(0x1000);

#[derive(Clone)]
enum MemChild {
    Local(u64),
    /// Root of another instance mounted over this name
    Graft(Arc<LowerInode>),
}

enum MemContent {
    File {
        data: Arc<RwLock<Vec<u8>>>,
        flags: Arc<AtomicU32>,
    },
    Dir(BTreeMap<OsString, MemChild>),
    Symlink(PathBuf),
    Special,
}

struct MemNode {
    inode: Arc<LowerInode>,
    content: MemContent,
    xattrs: BTreeMap<OsString, Vec<u8>>,
}

/// In-memory lower filesystem.
pub struct MemoryLower {
    instance: Arc<FsInstance>,
    source: PathBuf,
    overlay: RwLock<Option<OverlayLayout>>,
    nodes: RwLock<HashMap<u64, MemNode>>,
    next_ino: AtomicU64,
    next_generation: AtomicU64,
    read_only: AtomicBool,
    xattr_supported: AtomicBool,
    shared_mmap: AtomicBool,
    evict_created: AtomicBool,
    writers: AtomicUsize,
    unmounting: AtomicBool,
}

impl std::fmt::Debug for MemoryLower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLower")
            .field("source", &self.source)
            .field("instance", &self.instance.id())
            .field("nodes", &self.nodes.read().len())
            .finish()
    }
}

fn now() -> SystemTime {
    SystemTime::now()
}

fn check_name(name: &OsStr) -> Result<()> {
    let bytes = name.as_encoded_bytes();
    if bytes.is_empty() || bytes.contains(&b'/') || name == "." || name == ".." {
        return Err(StackError::invalid(format!("invalid name {:?}", name)));
    }
    Ok(())
}

fn split_path(path: &str) -> Result<(&str, &OsStr)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) if idx + 1 < trimmed.len() => {
            Ok((&trimmed[..idx], OsStr::new(&trimmed[idx + 1..])))
        }
        _ => Err(StackError::invalid(format!("path {:?} has no final component", path))),
    }
}

impl MemoryLower {
    /// Creates an empty plain filesystem holding only its root directory.
    pub fn new(fs_type: &str) -> Arc<Self> {
        let dev = NEXT_DEV.fetch_add(1, Ordering::Relaxed);
        let instance = FsInstance::new(dev, fs_type, i64::MAX as u64, Duration::from_nanos(1));
        let source = PathBuf::from(format!("/memory/{}-{}", fs_type, instance.id()));
        let fs = Self {
            instance,
            source,
            overlay: RwLock::new(None),
            nodes: RwLock::new(HashMap::new()),
            next_ino: AtomicU64::new(ROOT_INO),
            next_generation: AtomicU64::new(1),
            read_only: AtomicBool::new(false),
            xattr_supported: AtomicBool::new(true),
            shared_mmap: AtomicBool::new(true),
            evict_created: AtomicBool::new(false),
            writers: AtomicUsize::new(0),
            unmounting: AtomicBool::new(false),
        };
        {
            let mut nodes = fs.nodes.write();
            fs.alloc(&mut nodes, S_IFDIR | 0o755, 0, MemContent::Dir(BTreeMap::new()));
        }
        Arc::new(fs)
    }

    /// Creates an overlay-kind filesystem together with its writable upper
    /// layer. Returns `(merged, upper)`.
    pub fn overlay() -> (Arc<Self>, Arc<Self>) {
        let upper = MemoryLower::new("tmpfs");
        let merged = MemoryLower::new("overlay");
        merged.set_overlay(Some(OverlayLayout {
            upper: Some(upper.clone()),
            upper_dir: Some(PathBuf::from("/upper")),
            work_dir: Some(PathBuf::from("/work")),
            work_dir_present: true,
            lower_dirs: vec![PathBuf::from("/lower")],
        }));
        (merged, upper)
    }

    pub fn set_overlay(&self, layout: Option<OverlayLayout>) {
        *self.overlay.write() = layout;
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    pub fn set_xattr_supported(&self, supported: bool) {
        self.xattr_supported.store(supported, Ordering::Release);
    }

    /// Controls whether opened files can back shared writable mappings.
    pub fn set_shared_mmap(&self, supported: bool) {
        self.shared_mmap.store(supported, Ordering::Release);
    }

    /// When set, every newly created regular file is handed back already
    /// dying, as if it had been evicted before the caller could bind it.
    pub fn set_evict_created(&self, evict: bool) {
        self.evict_created.store(evict, Ordering::Release);
    }

    /// Outstanding write-access grants.
    pub fn active_writers(&self) -> usize {
        self.writers.load(Ordering::Acquire)
    }

    pub fn umount_begun(&self) -> bool {
        self.unmounting.load(Ordering::Acquire)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Resolves an absolute path, crossing into grafted instances.
    pub fn resolve(&self, path: &str) -> Result<Arc<LowerInode>> {
        let mut cursor = self.root()?;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            cursor = self.lookup_any(&cursor, OsStr::new(name))?;
        }
        Ok(cursor)
    }

    /// Adds a regular file with `contents`, bypassing read-only mode.
    pub fn add_file(&self, path: &str, contents: &[u8], perm: u32) -> Result<Arc<LowerInode>> {
        let (parent, name) = split_path(path)?;
        let dir = self.resolve(parent)?;
        let data = Arc::new(RwLock::new(contents.to_vec()));
        let content = MemContent::File {
            data,
            flags: Arc::new(AtomicU32::new(0)),
        };
        let inode = self.insert_child(&dir, name, S_IFREG | (perm & 0o7777), 0, content)?;
        inode.update_attr(|attr| {
            attr.size = contents.len() as u64;
            attr.blocks = NodeAttr::blocks_for(attr.size);
        });
        Ok(inode)
    }

    pub fn add_dir(&self, path: &str, perm: u32) -> Result<Arc<LowerInode>> {
        let (parent, name) = split_path(path)?;
        let dir = self.resolve(parent)?;
        self.insert_child(&dir, name, S_IFDIR | (perm & 0o7777), 0, MemContent::Dir(BTreeMap::new()))
    }

    pub fn add_symlink(&self, path: &str, target: &str) -> Result<Arc<LowerInode>> {
        let (parent, name) = split_path(path)?;
        let dir = self.resolve(parent)?;
        self.insert_child(&dir, name, S_IFLNK | 0o777, 0, MemContent::Symlink(PathBuf::from(target)))
    }

    /// Removes `path` as an outside party would, bypassing read-only mode.
    pub fn remove(&self, path: &str) -> Result<()> {
        let (parent, name) = split_path(path)?;
        let dir = self.resolve(parent)?;
        let mut nodes = self.nodes.write();
        self.detach_child(&mut nodes, &dir, name, None)
    }

    /// Mounts the root of `foreign` over a new name at `path`.
    pub fn graft(&self, path: &str, foreign: &Arc<MemoryLower>) -> Result<()> {
        let (parent, name) = split_path(path)?;
        let dir = self.resolve(parent)?;
        let foreign_root = foreign.root()?;
        let mut nodes = self.nodes.write();
        let children = Self::children_mut(&mut nodes, &dir)?;
        if children.contains_key(name) {
            return Err(StackError::AlreadyExists { name: name.to_os_string() });
        }
        children.insert(name.to_os_string(), MemChild::Graft(foreign_root));
        Ok(())
    }

    fn alloc(
        &self,
        nodes: &mut HashMap<u64, MemNode>,
        mode: u32,
        rdev: u64,
        content: MemContent,
    ) -> Arc<LowerInode> {
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut attr = NodeAttr::new(ino, mode, now());
        attr.rdev = rdev;
        if mode & S_IFMT == S_IFDIR {
            attr.nlink = 2;
        }
        if let MemContent::Symlink(target) = &content {
            attr.size = target.as_os_str().len() as u64;
        }
        let inode = LowerInode::new(
            NodeId::new(self.instance.dev(), ino),
            Arc::clone(&self.instance),
            generation,
            attr,
            InodeHandle::Memory,
        );
        nodes.insert(
            ino,
            MemNode {
                inode: Arc::clone(&inode),
                content,
                xattrs: BTreeMap::new(),
            },
        );
        inode
    }

    fn check_local(&self, inode: &LowerInode) -> Result<()> {
        if inode.instance().is_same(&self.instance) {
            Ok(())
        } else {
            Err(StackError::CrossDevice {
                name: OsString::from(inode.id().to_string()),
            })
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            Err(StackError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn children<'a>(
        nodes: &'a HashMap<u64, MemNode>,
        dir: &LowerInode,
    ) -> Result<&'a BTreeMap<OsString, MemChild>> {
        match nodes.get(&dir.ino()).map(|node| &node.content) {
            Some(MemContent::Dir(children)) => Ok(children),
            Some(_) => Err(StackError::NotADirectory {
                name: OsString::from(dir.id().to_string()),
            }),
            None => Err(StackError::stale(format!("directory {} was removed", dir.id()))),
        }
    }

    fn children_mut<'a>(
        nodes: &'a mut HashMap<u64, MemNode>,
        dir: &LowerInode,
    ) -> Result<&'a mut BTreeMap<OsString, MemChild>> {
        match nodes.get_mut(&dir.ino()).map(|node| &mut node.content) {
            Some(MemContent::Dir(children)) => Ok(children),
            Some(_) => Err(StackError::NotADirectory {
                name: OsString::from(dir.id().to_string()),
            }),
            None => Err(StackError::stale(format!("directory {} was removed", dir.id()))),
        }
    }

    /// Refreshes a directory's times, size and link count after a change.
    fn touch_dir(nodes: &HashMap<u64, MemNode>, dir: &LowerInode, nlink_delta: i64) {
        let entries = Self::children(nodes, dir).map(|c| c.len() as u64).unwrap_or(0);
        let stamp = now();
        dir.update_attr(|attr| {
            attr.size = entries;
            attr.mtime = stamp;
            attr.ctime = stamp;
            attr.nlink = attr.nlink.saturating_add_signed(nlink_delta);
        });
    }

    fn lookup_any(&self, dir: &LowerInode, name: &OsStr) -> Result<Arc<LowerInode>> {
        self.check_local(dir)?;
        let nodes = self.nodes.read();
        let children = Self::children(&nodes, dir)?;
        match children.get(name) {
            Some(MemChild::Local(ino)) => nodes
                .get(ino)
                .map(|node| Arc::clone(&node.inode))
                .ok_or_else(|| StackError::not_found(name)),
            Some(MemChild::Graft(inode)) => Ok(Arc::clone(inode)),
            None => Err(StackError::not_found(name)),
        }
    }

    fn insert_child(
        &self,
        dir: &LowerInode,
        name: &OsStr,
        mode: u32,
        rdev: u64,
        content: MemContent,
    ) -> Result<Arc<LowerInode>> {
        check_name(name)?;
        self.check_local(dir)?;
        let mut nodes = self.nodes.write();
        if Self::children(&nodes, dir)?.contains_key(name) {
            return Err(StackError::AlreadyExists { name: name.to_os_string() });
        }
        let is_dir = mode & S_IFMT == S_IFDIR;
        let inherited = nodes
            .get(&dir.ino())
            .and_then(|node| node.xattrs.get(OsStr::new(ACL_DEFAULT)))
            .cloned();
        let inode = self.alloc(&mut nodes, mode, rdev, content);
        if let (Some(acl), Some(node)) = (inherited, nodes.get_mut(&inode.ino())) {
            // New objects inherit the directory's default ACL.
            if is_dir {
                node.xattrs.insert(OsString::from(ACL_DEFAULT), acl.clone());
            }
            node.xattrs.insert(OsString::from(ACL_ACCESS), acl);
        }
        Self::children_mut(&mut nodes, dir)?.insert(name.to_os_string(), MemChild::Local(inode.ino()));
        Self::touch_dir(&nodes, dir, if is_dir { 1 } else { 0 });
        Ok(inode)
    }

    /// Drops one link from the node behind `ino`, destroying it when the
    /// last link goes.
    fn drop_link(nodes: &mut HashMap<u64, MemNode>, ino: u64) {
        let Some(node) = nodes.get(&ino) else {
            return;
        };
        let is_dir = node.inode.kind().is_dir();
        let stamp = now();
        node.inode.update_attr(|attr| {
            attr.nlink = if is_dir { 0 } else { attr.nlink.saturating_sub(1) };
            attr.ctime = stamp;
        });
        if node.inode.attr().nlink == 0 {
            if let Some(node) = nodes.remove(&ino) {
                // Still pinned inodes live on as orphans.
                node.inode.mark_dying();
            }
        }
    }

    /// Removes `name` from `dir`. `expect_dir` selects unlink (`Some(false)`)
    /// or rmdir (`Some(true)`) semantics; `None` accepts either.
    fn detach_child(
        &self,
        nodes: &mut HashMap<u64, MemNode>,
        dir: &LowerInode,
        name: &OsStr,
        expect_dir: Option<bool>,
    ) -> Result<()> {
        self.check_local(dir)?;
        let child = Self::children(nodes, dir)?
            .get(name)
            .cloned()
            .ok_or_else(|| StackError::not_found(name))?;
        let ino = match child {
            MemChild::Local(ino) => ino,
            MemChild::Graft(_) => {
                return Err(StackError::NotPermitted {
                    reason: format!("{:?} is a mount point", name),
                })
            }
        };
        let (is_dir, empty) = match nodes.get(&ino).map(|node| &node.content) {
            Some(MemContent::Dir(children)) => (true, children.is_empty()),
            Some(_) => (false, true),
            None => return Err(StackError::not_found(name)),
        };
        match expect_dir {
            Some(true) if !is_dir => {
                return Err(StackError::NotADirectory { name: name.to_os_string() })
            }
            Some(false) if is_dir => {
                return Err(StackError::IsADirectory { name: name.to_os_string() })
            }
            _ => {}
        }
        if is_dir && !empty {
            return Err(StackError::NotEmpty { name: name.to_os_string() });
        }
        Self::children_mut(nodes, dir)?.remove(name);
        Self::drop_link(nodes, ino);
        Self::touch_dir(nodes, dir, if is_dir { -1 } else { 0 });
        Ok(())
    }

    fn node_mut<'a>(
        nodes: &'a mut HashMap<u64, MemNode>,
        inode: &LowerInode,
    ) -> Result<&'a mut MemNode> {
        nodes
            .get_mut(&inode.ino())
            .ok_or_else(|| StackError::stale(format!("lower node {} was removed", inode.id())))
    }

    fn check_xattr(&self) -> Result<()> {
        if self.xattr_supported.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StackError::NotSupported {
                operation: "xattr".to_string(),
            })
        }
    }
}

impl LowerFs for MemoryLower {
    fn instance(&self) -> &Arc<FsInstance> {
        &self.instance
    }

    fn kind(&self) -> LowerKind {
        match self.overlay.read().clone() {
            Some(layout) => LowerKind::Overlay(layout),
            None => LowerKind::Plain,
        }
    }

    fn source(&self) -> &Path {
        &self.source
    }

    fn root(&self) -> Result<Arc<LowerInode>> {
        self.nodes
            .read()
            .get(&ROOT_INO)
            .map(|node| Arc::clone(&node.inode))
            .ok_or_else(|| StackError::stale("root directory missing"))
    }

    fn lookup(&self, dir: &LowerInode, name: &OsStr) -> Result<Arc<LowerInode>> {
        check_name(name)?;
        self.lookup_any(dir, name)
    }

    fn getattr(&self, inode: &LowerInode) -> Result<NodeAttr> {
        self.check_local(inode)?;
        Ok(inode.attr())
    }

    fn setattr(&self, inode: &LowerInode, changes: &SetAttr) -> Result<NodeAttr> {
        self.check_writable()?;
        self.check_local(inode)?;
        let mut nodes = self.nodes.write();
        let node = Self::node_mut(&mut nodes, inode)?;
        if let Some(size) = changes.size {
            match &node.content {
                MemContent::File { data, .. } => data.write().resize(size as usize, 0),
                MemContent::Dir(_) => {
                    return Err(StackError::IsADirectory {
                        name: OsString::from(inode.id().to_string()),
                    })
                }
                _ => return Err(StackError::invalid("truncate of a non-regular file")),
            }
        }
        let stamp = now();
        inode.update_attr(|attr| {
            if let Some(mode) = changes.mode {
                attr.mode = (attr.mode & S_IFMT) | (mode & 0o7777);
            }
            if let Some(uid) = changes.uid {
                attr.uid = uid;
            }
            if let Some(gid) = changes.gid {
                attr.gid = gid;
            }
            if let Some(size) = changes.size {
                attr.size = size;
                attr.blocks = NodeAttr::blocks_for(size);
                attr.mtime = stamp;
            }
            if let Some(atime) = changes.atime {
                attr.atime = atime;
            }
            if let Some(mtime) = changes.mtime {
                attr.mtime = mtime;
            }
            attr.ctime = stamp;
        });
        Ok(inode.attr())
    }

    fn create(&self, dir: &LowerInode, name: &OsStr, mode: u32) -> Result<Arc<LowerInode>> {
        self.check_writable()?;
        let content = MemContent::File {
            data: Arc::new(RwLock::new(Vec::new())),
            flags: Arc::new(AtomicU32::new(0)),
        };
        let inode = self.insert_child(dir, name, S_IFREG | (mode & 0o7777), 0, content)?;
        if self.evict_created.load(Ordering::Acquire) {
            inode.mark_dying();
        }
        Ok(inode)
    }

    fn mkdir(&self, dir: &LowerInode, name: &OsStr, mode: u32) -> Result<Arc<LowerInode>> {
        self.check_writable()?;
        self.insert_child(dir, name, S_IFDIR | (mode & 0o7777), 0, MemContent::Dir(BTreeMap::new()))
    }

    fn mknod(&self, dir: &LowerInode, name: &OsStr, mode: u32, rdev: u64) -> Result<Arc<LowerInode>> {
        self.check_writable()?;
        match NodeKind::from_mode(mode) {
            Some(NodeKind::Special(_)) => self.insert_child(dir, name, mode, rdev, MemContent::Special),
            Some(NodeKind::Regular) => self.create(dir, name, mode),
            _ => Err(StackError::invalid(format!("mknod with mode {:o}", mode))),
        }
    }

    fn symlink(&self, dir: &LowerInode, name: &OsStr, target: &Path) -> Result<Arc<LowerInode>> {
        self.check_writable()?;
        self.insert_child(dir, name, S_IFLNK | 0o777, 0, MemContent::Symlink(target.to_path_buf()))
    }

    fn link(&self, source: &LowerInode, dir: &LowerInode, name: &OsStr) -> Result<Arc<LowerInode>> {
        self.check_writable()?;
        check_name(name)?;
        self.check_local(source)?;
        self.check_local(dir)?;
        if source.kind().is_dir() {
            return Err(StackError::NotPermitted {
                reason: "hard link to a directory".to_string(),
            });
        }
        let mut nodes = self.nodes.write();
        if Self::children(&nodes, dir)?.contains_key(name) {
            return Err(StackError::AlreadyExists { name: name.to_os_string() });
        }
        let inode = Arc::clone(&Self::node_mut(&mut nodes, source)?.inode);
        Self::children_mut(&mut nodes, dir)?.insert(name.to_os_string(), MemChild::Local(inode.ino()));
        let stamp = now();
        inode.update_attr(|attr| {
            attr.nlink += 1;
            attr.ctime = stamp;
        });
        Self::touch_dir(&nodes, dir, 0);
        Ok(inode)
    }

    fn unlink(&self, dir: &LowerInode, name: &OsStr) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.nodes.write();
        self.detach_child(&mut nodes, dir, name, Some(false))
    }

    fn rmdir(&self, dir: &LowerInode, name: &OsStr) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.nodes.write();
        self.detach_child(&mut nodes, dir, name, Some(true))
    }

    fn rename(
        &self,
        old_dir: &LowerInode,
        old_name: &OsStr,
        new_dir: &LowerInode,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<()> {
        self.check_writable()?;
        check_name(new_name)?;
        self.check_local(old_dir)?;
        self.check_local(new_dir)?;
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(StackError::NotSupported {
                operation: format!("rename flags {:#x}", flags),
            });
        }
        let mut nodes = self.nodes.write();
        let moving = match Self::children(&nodes, old_dir)?.get(old_name) {
            Some(MemChild::Local(ino)) => *ino,
            Some(MemChild::Graft(_)) => {
                return Err(StackError::NotPermitted {
                    reason: format!("{:?} is a mount point", old_name),
                })
            }
            None => return Err(StackError::not_found(old_name)),
        };
        let moving_is_dir = nodes
            .get(&moving)
            .map(|node| node.inode.kind().is_dir())
            .unwrap_or(false);

        let existing = Self::children(&nodes, new_dir)?.get(new_name).cloned();
        if let Some(target) = existing {
            if flags & RENAME_NOREPLACE != 0 {
                return Err(StackError::AlreadyExists { name: new_name.to_os_string() });
            }
            if let MemChild::Local(ino) = target {
                if ino == moving {
                    return Ok(());
                }
            }
            let target_is_dir = match &target {
                MemChild::Local(ino) => nodes
                    .get(ino)
                    .map(|node| node.inode.kind().is_dir())
                    .unwrap_or(false),
                MemChild::Graft(_) => true,
            };
            if moving_is_dir && !target_is_dir {
                return Err(StackError::NotADirectory { name: new_name.to_os_string() });
            }
            if !moving_is_dir && target_is_dir {
                return Err(StackError::IsADirectory { name: new_name.to_os_string() });
            }
            self.detach_child(&mut nodes, new_dir, new_name, Some(target_is_dir))?;
        }

        Self::children_mut(&mut nodes, old_dir)?.remove(old_name);
        Self::children_mut(&mut nodes, new_dir)?.insert(new_name.to_os_string(), MemChild::Local(moving));
        let same_dir = old_dir.id() == new_dir.id();
        let delta = if moving_is_dir && !same_dir { 1 } else { 0 };
        Self::touch_dir(&nodes, old_dir, -delta);
        if !same_dir {
            Self::touch_dir(&nodes, new_dir, delta);
        }
        if let Some(node) = nodes.get(&moving) {
            let stamp = now();
            node.inode.update_attr(|attr| attr.ctime = stamp);
        }
        Ok(())
    }

    fn readlink(&self, inode: &LowerInode) -> Result<PathBuf> {
        let nodes = self.nodes.read();
        match nodes.get(&inode.ino()).map(|node| &node.content) {
            Some(MemContent::Symlink(target)) => Ok(target.clone()),
            Some(_) => Err(StackError::invalid("readlink of a non-symlink")),
            None => Err(StackError::stale(format!("lower node {} was removed", inode.id()))),
        }
    }

    fn readdir(&self, dir: &LowerInode) -> Result<Vec<DirEntry>> {
        self.check_local(dir)?;
        let nodes = self.nodes.read();
        let children = Self::children(&nodes, dir)?;
        let mut entries = Vec::with_capacity(children.len());
        for (name, child) in children {
            let inode = match child {
                MemChild::Local(ino) => match nodes.get(ino) {
                    Some(node) => Arc::clone(&node.inode),
                    None => continue,
                },
                MemChild::Graft(inode) => Arc::clone(inode),
            };
            entries.push(DirEntry {
                name: name.clone(),
                ino: inode.ino(),
                kind: inode.kind(),
            });
        }
        let stamp = now();
        dir.update_attr(|attr| attr.atime = stamp);
        Ok(entries)
    }

    fn open(&self, inode: &LowerInode, flags: OpenFlags) -> Result<Box<dyn LowerFile>> {
        if flags.is_writable() {
            self.check_writable()?;
        }
        let nodes = self.nodes.read();
        let node = nodes
            .get(&inode.ino())
            .ok_or_else(|| StackError::stale(format!("lower node {} was removed", inode.id())))?;
        match &node.content {
            MemContent::File { data, flags: ioctl_flags } => {
                if flags.is_writable() && flags.contains(OpenFlags::TRUNCATE) {
                    data.write().clear();
                    let stamp = now();
                    inode.update_attr(|attr| {
                        attr.size = 0;
                        attr.blocks = 0;
                        attr.mtime = stamp;
                        attr.ctime = stamp;
                    });
                }
                Ok(Box::new(MemFile {
                    inode: Arc::clone(&node.inode),
                    data: Arc::clone(data),
                    ioctl_flags: Arc::clone(ioctl_flags),
                    readable: flags.is_readable(),
                    writable: flags.is_writable(),
                    shared_mmap: self.shared_mmap.load(Ordering::Acquire),
                }))
            }
            MemContent::Dir(_) => Err(StackError::IsADirectory {
                name: OsString::from(inode.id().to_string()),
            }),
            MemContent::Symlink(_) => Err(StackError::invalid("open of a symbolic link")),
            MemContent::Special => Err(StackError::NotSupported {
                operation: "open of a special node".to_string(),
            }),
        }
    }

    fn statfs(&self, _inode: &LowerInode) -> Result<StatFs> {
        let used = self.nodes.read().len() as u64;
        let fs_type = if self.overlay.read().is_some() {
            OVERLAYFS_MAGIC
        } else {
            TMPFS_MAGIC
        };
        Ok(StatFs {
            fs_type,
            blocks: 1 << 20,
            bfree: 1 << 19,
            bavail: 1 << 19,
            files: 1 << 16,
            ffree: (1u64 << 16).saturating_sub(used),
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    fn getxattr(&self, inode: &LowerInode, name: &OsStr) -> Result<Vec<u8>> {
        self.check_xattr()?;
        let nodes = self.nodes.read();
        let node = nodes
            .get(&inode.ino())
            .ok_or_else(|| StackError::stale(format!("lower node {} was removed", inode.id())))?;
        node.xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| StackError::NoData { name: name.to_os_string() })
    }

    fn setxattr(&self, inode: &LowerInode, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        self.check_writable()?;
        self.check_xattr()?;
        let mut nodes = self.nodes.write();
        let node = Self::node_mut(&mut nodes, inode)?;
        let exists = node.xattrs.contains_key(name);
        if flags & XATTR_CREATE != 0 && exists {
            return Err(StackError::AlreadyExists { name: name.to_os_string() });
        }
        if flags & XATTR_REPLACE != 0 && !exists {
            return Err(StackError::NoData { name: name.to_os_string() });
        }
        node.xattrs.insert(name.to_os_string(), value.to_vec());
        let stamp = now();
        inode.update_attr(|attr| attr.ctime = stamp);
        Ok(())
    }

    fn listxattr(&self, inode: &LowerInode) -> Result<Vec<OsString>> {
        self.check_xattr()?;
        let nodes = self.nodes.read();
        Ok(nodes
            .get(&inode.ino())
            .map(|node| node.xattrs.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn removexattr(&self, inode: &LowerInode, name: &OsStr) -> Result<()> {
        self.check_writable()?;
        self.check_xattr()?;
        let mut nodes = self.nodes.write();
        let node = Self::node_mut(&mut nodes, inode)?;
        node.xattrs
            .remove(name)
            .ok_or_else(|| StackError::NoData { name: name.to_os_string() })?;
        let stamp = now();
        inode.update_attr(|attr| attr.ctime = stamp);
        Ok(())
    }

    fn want_write(&self) -> Result<()> {
        self.check_writable()?;
        self.writers.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn drop_write(&self) {
        self.writers.fetch_sub(1, Ordering::AcqRel);
    }

    fn inode_by_ino(&self, ino: u64) -> Option<Arc<LowerInode>> {
        self.nodes.read().get(&ino).map(|node| Arc::clone(&node.inode))
    }

    fn umount_begin(&self) {
        self.unmounting.store(true, Ordering::Release);
    }
}

struct MemFile {
    inode: Arc<LowerInode>,
    data: Arc<RwLock<Vec<u8>>>,
    ioctl_flags: Arc<AtomicU32>,
    readable: bool,
    writable: bool,
    shared_mmap: bool,
}

fn bad_descriptor() -> StackError {
    StackError::Io {
        source: io::Error::from_raw_os_error(libc::EBADF),
    }
}

impl LowerFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if !self.readable {
            return Err(bad_descriptor());
        }
        let data = self.data.read();
        let start = (offset as usize).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        drop(data);
        let stamp = now();
        self.inode.update_attr(|attr| attr.atime = stamp);
        Ok(count)
    }

    fn write_at(&self, bytes: &[u8], offset: u64) -> Result<usize> {
        if !self.writable {
            return Err(bad_descriptor());
        }
        let size = {
            let mut data = self.data.write();
            let start = offset as usize;
            let end = start + bytes.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(bytes);
            data.len() as u64
        };
        let stamp = now();
        self.inode.update_attr(|attr| {
            attr.size = size;
            attr.blocks = NodeAttr::blocks_for(size);
            attr.mtime = stamp;
            attr.ctime = stamp;
        });
        Ok(bytes.len())
    }

    fn fsync(&self, _datasync: bool) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn ioctl(&self, cmd: u32, arg: u64) -> Result<u64> {
        match cmd {
            IOC_GETFLAGS => Ok(self.ioctl_flags.load(Ordering::Acquire) as u64),
            IOC_SETFLAGS => {
                self.ioctl_flags.store(arg as u32, Ordering::Release);
                let stamp = now();
                self.inode.update_attr(|attr| attr.ctime = stamp);
                Ok(0)
            }
            _ => Err(StackError::NotSupported {
                operation: format!("ioctl {:#x}", cmd),
            }),
        }
    }

    fn supports_shared_writable_mapping(&self) -> bool {
        self.shared_mmap
    }
}
