//! High-level filesystem operations over a mounted [`Superblock`].
//!
//! Namespace operations take directory entries, node operations take
//! shadow nodes. Every mutating call goes to the lower filesystem first and
//! refreshes the cached attributes of the nodes it touched afterwards.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::create::create_real;
use crate::error::{Result, StackError};
use crate::file::FileHandle;
use crate::lower::{LowerFs, LowerInode, LowerPath, WriteAccess};
use crate::shadow::attr::{copy_attr_all, copy_attr_atime, copy_attr_times, copy_size_and_times};
use crate::shadow::{NodeOp, ShadowEntry, ShadowNode};
use crate::stats::{AdapterStats, OperationType};
use crate::superblock::Superblock;
use crate::types::{
    CreateAttr, DirEntry, FileId, LookupFlags, MountOptions, NodeAttr, OpenFlags, RemountFlags,
    SetAttr, StatFs, RENAME_NOREPLACE,
};

/// A mounted stacking filesystem.
#[derive(Debug, Clone)]
pub struct StackFs {
    sb: Arc<Superblock>,
}

impl StackFs {
    /// Mounts over the host directory `source`.
    #[cfg(target_os = "linux")]
    pub fn mount(source: &str, options: MountOptions) -> Result<Self> {
        Ok(Self {
            sb: Superblock::mount(Some(source), options)?,
        })
    }

    /// Mounts over an already opened lower filesystem.
    pub fn mount_lower(lower: Arc<dyn LowerFs>, options: MountOptions) -> Result<Self> {
        Ok(Self {
            sb: Superblock::attach(lower, options)?,
        })
    }

    pub fn superblock(&self) -> &Arc<Superblock> {
        &self.sb
    }

    pub fn lower(&self) -> &Arc<dyn LowerFs> {
        self.sb.lower()
    }

    pub fn stats(&self) -> &Arc<AdapterStats> {
        self.sb.stats()
    }

    pub fn root(&self) -> Result<Arc<ShadowEntry>> {
        self.sb.root()
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.sb.is_read_only() {
            Err(StackError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn lookup(
        &self,
        dir: &Arc<ShadowEntry>,
        name: &OsStr,
        flags: LookupFlags,
    ) -> Result<Arc<ShadowEntry>> {
        self.sb.lookup(dir, name, flags)
    }

    /// Like [`StackFs::lookup`], but a negative result is
    /// [`StackError::NotFound`].
    pub fn lookup_existing(&self, dir: &Arc<ShadowEntry>, name: &OsStr) -> Result<Arc<ShadowEntry>> {
        let entry = self.sb.lookup(dir, name, LookupFlags::NONE)?;
        if entry.is_negative() {
            return Err(StackError::not_found(name));
        }
        Ok(entry)
    }

    fn dir_node(dir: &ShadowEntry, op: NodeOp) -> Result<Arc<ShadowNode>> {
        let node = dir.node().ok_or_else(|| StackError::not_found(dir.name()))?;
        node.ops().check(op)?;
        Ok(node)
    }

    /// Creates `name` in `dir` as described by `attr`.
    pub fn create(
        &self,
        dir: &Arc<ShadowEntry>,
        name: &OsStr,
        attr: &CreateAttr,
    ) -> Result<Arc<ShadowEntry>> {
        self.stats().record(OperationType::Create);
        self.create_object(dir, name, attr, None)
    }

    pub fn mkdir(&self, dir: &Arc<ShadowEntry>, name: &OsStr, perm: u32) -> Result<Arc<ShadowEntry>> {
        self.create(dir, name, &CreateAttr::directory(perm))
    }

    /// Creates a node from a raw mode, type bits included.
    pub fn mknod(
        &self,
        dir: &Arc<ShadowEntry>,
        name: &OsStr,
        mode: u32,
        rdev: u64,
    ) -> Result<Arc<ShadowEntry>> {
        self.create(dir, name, &CreateAttr::from_mode(mode, rdev))
    }

    pub fn symlink(
        &self,
        dir: &Arc<ShadowEntry>,
        name: &OsStr,
        target: &Path,
    ) -> Result<Arc<ShadowEntry>> {
        self.create(dir, name, &CreateAttr::symlink(target))
    }

    /// Adds `name` in `dir` as a new link to `source`.
    pub fn link(
        &self,
        source: &Arc<ShadowEntry>,
        dir: &Arc<ShadowEntry>,
        name: &OsStr,
    ) -> Result<Arc<ShadowEntry>> {
        self.stats().record(OperationType::Link);
        let node = source
            .node()
            .ok_or_else(|| StackError::not_found(source.name()))?;
        if node.kind().is_dir() {
            return Err(StackError::NotPermitted {
                reason: "hard link to a directory".to_string(),
            });
        }
        let source_path = source.lower_path()?;
        let attr = CreateAttr::with_kind(node.kind(), node.attr().perm());
        let entry = self.create_object(dir, name, &attr, Some(&source_path))?;
        copy_attr_all(&node, self.lower().as_ref());
        Ok(entry)
    }

    fn create_object(
        &self,
        dir: &Arc<ShadowEntry>,
        name: &OsStr,
        attr: &CreateAttr,
        hardlink: Option<&LowerPath>,
    ) -> Result<Arc<ShadowEntry>> {
        self.check_writable()?;
        let dir_node = Self::dir_node(dir, NodeOp::Create)?;
        let entry = self
            .sb
            .lookup(dir, name, LookupFlags::CREATE | LookupFlags::EXCLUSIVE)?;
        let dir_path = dir.lower_path()?;
        let target = entry.lower_path()?;
        {
            let _write = WriteAccess::acquire(self.lower().as_ref())?;
            let _locked = dir_node.lower().lock_dir();
            create_real(&dir_path, &target, attr, hardlink)?;
        }
        let created = match self.sb.interpose(&entry, &target) {
            Ok(created) => created,
            Err(e) => {
                entry.put_reset_lower_path();
                return Err(e);
            }
        };
        copy_size_and_times(&dir_node, self.lower().as_ref());
        Ok(created)
    }

    pub fn unlink(&self, dir: &Arc<ShadowEntry>, name: &OsStr) -> Result<()> {
        self.remove(dir, name, false)
    }

    pub fn rmdir(&self, dir: &Arc<ShadowEntry>, name: &OsStr) -> Result<()> {
        self.remove(dir, name, true)
    }

    fn remove(&self, dir: &Arc<ShadowEntry>, name: &OsStr, is_dir: bool) -> Result<()> {
        self.stats().record(OperationType::Unlink);
        self.check_writable()?;
        let dir_node = Self::dir_node(dir, NodeOp::Lookup)?;
        let entry = self.lookup_existing(dir, name)?;
        let target = entry.lower_path()?;
        let lower = self.lower();
        {
            let _write = WriteAccess::acquire(lower.as_ref())?;
            let _locked = dir_node.lower().lock_dir();
            let result = if is_dir {
                lower.rmdir(dir_node.lower(), name)
            } else {
                lower.unlink(dir_node.lower(), name)
            };
            tracing::debug!(
                "{}({}) = {:?}",
                if is_dir { "rmdir" } else { "unlink" },
                target.display(),
                result.as_ref().map_err(|e| e.errno())
            );
            result?;
            drop(target.dentry().make_negative());
        }
        drop(target);

        entry.put_reset_lower_path();
        let node = entry.make_negative();
        copy_size_and_times(&dir_node, lower.as_ref());
        if let Some(node) = node {
            copy_attr_all(&node, lower.as_ref());
        }
        Ok(())
    }

    /// Renames `old_name` in `old_dir` to `new_name` in `new_dir`, returning
    /// the entry now naming the moved node.
    ///
    /// `flags` are the `renameat2(2)` flags. Only [`RENAME_NOREPLACE`] is
    /// forwarded; exchange and whiteout fail with [`StackError::NotSupported`]
    /// before the lower filesystem is touched.
    pub fn rename(
        &self,
        old_dir: &Arc<ShadowEntry>,
        old_name: &OsStr,
        new_dir: &Arc<ShadowEntry>,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<Arc<ShadowEntry>> {
        self.stats().record(OperationType::Rename);
        self.check_writable()?;
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(StackError::NotSupported {
                operation: format!("rename flags {:#x}", flags),
            });
        }
        let old_dir_node = Self::dir_node(old_dir, NodeOp::Lookup)?;
        let new_dir_node = Self::dir_node(new_dir, NodeOp::Create)?;
        let old = self.lookup_existing(old_dir, old_name)?;
        let new = self.sb.lookup(new_dir, new_name, LookupFlags::RENAME_TARGET)?;
        if Arc::ptr_eq(&old, &new) {
            return Ok(new);
        }
        let old_lower = old.lower_path()?;
        let new_lower = new.lower_path()?;
        let lower = self.lower();
        {
            let _write = WriteAccess::acquire(lower.as_ref())?;
            let _locked = lock_pair(old_dir_node.lower(), new_dir_node.lower());
            let result = lower.rename(
                old_dir_node.lower(),
                old_name,
                new_dir_node.lower(),
                new_name,
                flags,
            );
            tracing::debug!(
                "rename({}, {}) = {:?}",
                old_lower.display(),
                new_lower.display(),
                result.as_ref().map_err(|e| e.errno())
            );
            result?;
            if let Some(inode) = old_lower.dentry().make_negative() {
                new_lower.dentry().instantiate(inode);
            }
        }

        let moved = old.make_negative();
        let replaced = new.make_negative();
        if let Some(node) = &moved {
            new.instantiate(Arc::clone(node));
        }
        old.put_reset_lower_path();
        drop(replaced);

        copy_size_and_times(&old_dir_node, lower.as_ref());
        if !Arc::ptr_eq(&old_dir_node, &new_dir_node) {
            copy_size_and_times(&new_dir_node, lower.as_ref());
        }
        if let Some(node) = moved {
            copy_attr_times(&node, lower.as_ref());
        }
        Ok(new)
    }

    pub fn readlink(&self, node: &ShadowNode) -> Result<PathBuf> {
        node.ops().check(NodeOp::ReadLink)?;
        let target = self.lower().readlink(node.lower())?;
        copy_attr_atime(node, self.lower().as_ref());
        Ok(target)
    }

    /// Fetches fresh attributes from the lower node and caches them.
    pub fn getattr(&self, node: &ShadowNode) -> Result<NodeAttr> {
        let attr = self.lower().getattr(node.lower())?;
        node.update_attr(|cached| *cached = attr);
        Ok(attr)
    }

    pub fn setattr(&self, node: &ShadowNode, changes: &SetAttr) -> Result<NodeAttr> {
        self.stats().record(OperationType::SetAttr);
        self.check_writable()?;
        if let Some(size) = changes.size {
            if size > self.sb.max_bytes() {
                return Err(StackError::invalid(format!(
                    "size {} exceeds the {} byte limit",
                    size,
                    self.sb.max_bytes()
                )));
            }
        }
        let _write = WriteAccess::acquire(self.lower().as_ref())?;
        self.lower().setattr(node.lower(), changes)?;
        copy_attr_all(node, self.lower().as_ref());
        Ok(node.attr())
    }

    pub fn readdir(&self, node: &ShadowNode) -> Result<Vec<DirEntry>> {
        self.stats().record(OperationType::ReadDir);
        node.ops().check(NodeOp::ReadDir)?;
        let entries = self.lower().readdir(node.lower())?;
        copy_attr_atime(node, self.lower().as_ref());
        Ok(entries)
    }

    /// Opens the lower file behind `entry`.
    ///
    /// Entries that were unlinked or never resolved are refused.
    pub fn open(&self, entry: &Arc<ShadowEntry>, flags: OpenFlags) -> Result<FileHandle> {
        self.stats().record(OperationType::Open);
        let node = match (entry.node(), entry.get_lower_path()) {
            (Some(node), Some(_)) => node,
            _ => {
                tracing::error!("open of unhashed entry {}", entry.path().display());
                return Err(StackError::not_found(entry.name()));
            }
        };
        node.ops().check(NodeOp::Open)?;
        if flags.is_writable() || flags.contains(OpenFlags::TRUNCATE) {
            self.check_writable()?;
        }
        let lower_file = self.lower().open(node.lower(), flags)?;
        copy_attr_all(&node, self.lower().as_ref());
        Ok(FileHandle::new(
            lower_file,
            node,
            Arc::clone(self.lower()),
            flags,
            Arc::clone(self.stats()),
        ))
    }

    pub fn statfs(&self) -> Result<StatFs> {
        self.sb.statfs()
    }

    pub fn remount(&self, flags: RemountFlags) -> Result<()> {
        self.sb.remount(flags)
    }

    pub fn umount_begin(&self) {
        self.sb.umount_begin()
    }

    pub fn show_options(&self) -> String {
        self.sb.show_options()
    }

    /// Export handle of `node`.
    pub fn file_id(&self, node: &ShadowNode) -> FileId {
        FileId {
            ino: node.lower().ino(),
            generation: node.lower().generation(),
        }
    }

    pub fn node_from_handle(&self, id: FileId) -> Result<Arc<ShadowNode>> {
        self.sb.node_from_handle(id)
    }

    pub fn detach(&self) -> bool {
        self.sb.detach()
    }
}

/// Locks two lower directories in a stable order, or one if they are the
/// same.
fn lock_pair<'a>(
    a: &'a LowerInode,
    b: &'a LowerInode,
) -> (MutexGuard<'a, ()>, Option<MutexGuard<'a, ()>>) {
    if a.id() == b.id() {
        return (a.lock_dir(), None);
    }
    let (first, second) = if a.id() < b.id() { (a, b) } else { (b, a) };
    let first = first.lock_dir();
    let second = second.lock_dir();
    (first, Some(second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::memory::MemoryLower;
    use crate::types::metadata::S_IFIFO;
    use crate::types::{NodeKind, SpecialKind};

    fn setup() -> (Arc<MemoryLower>, StackFs, Arc<ShadowEntry>) {
        let fs = MemoryLower::new("tmpfs");
        let stack = StackFs::mount_lower(fs.clone(), MountOptions::default()).unwrap();
        let root = stack.root().unwrap();
        (fs, stack, root)
    }

    #[test]
    fn test_create_then_lookup() {
        let (fs, stack, root) = setup();
        let entry = stack
            .create(&root, OsStr::new("missing.txt"), &CreateAttr::regular(0o644))
            .unwrap();
        let node = entry.node().unwrap();
        assert_eq!(node.kind(), NodeKind::Regular);
        assert_eq!(node.attr().perm(), 0o644);
        assert!(fs.resolve("/missing.txt").is_ok());

        let again = stack.lookup_existing(&root, OsStr::new("missing.txt")).unwrap();
        assert!(Arc::ptr_eq(&again.node().unwrap(), &node));
        assert_eq!(fs.active_writers(), 0);
    }

    #[test]
    fn test_create_existing_fails() {
        let (fs, stack, root) = setup();
        fs.add_file("/taken", b"", 0o644).unwrap();
        let err = stack
            .create(&root, OsStr::new("taken"), &CreateAttr::regular(0o644))
            .unwrap_err();
        assert!(matches!(err, StackError::AlreadyExists { .. }));
    }

    #[test]
    fn test_create_refreshes_parent() {
        let (fs, stack, root) = setup();
        stack.mkdir(&root, OsStr::new("sub"), 0o755).unwrap();
        let lower_size = fs.root().unwrap().attr().size;
        assert_eq!(lower_size, 2);
        assert_eq!(root.node().unwrap().attr().size, lower_size);
    }

    #[test]
    fn test_mknod_and_symlink() {
        let (_fs, stack, root) = setup();
        let fifo = stack.mknod(&root, OsStr::new("pipe"), S_IFIFO | 0o600, 0).unwrap();
        assert_eq!(fifo.node().unwrap().kind(), NodeKind::Special(SpecialKind::Fifo));

        let link = stack.symlink(&root, OsStr::new("l"), Path::new("pipe")).unwrap();
        let target = stack.readlink(&link.node().unwrap()).unwrap();
        assert_eq!(target, PathBuf::from("pipe"));

        let err = stack.mknod(&root, OsStr::new("odd"), 0o644, 0).unwrap_err();
        assert!(matches!(err, StackError::NotPermitted { .. }));
    }

    #[test]
    fn test_link_shares_node() {
        let (fs, stack, root) = setup();
        fs.add_file("/a", b"x", 0o644).unwrap();
        let a = stack.lookup_existing(&root, OsStr::new("a")).unwrap();
        let b = stack.link(&a, &root, OsStr::new("b")).unwrap();
        let node = a.node().unwrap();
        assert!(Arc::ptr_eq(&node, &b.node().unwrap()));
        assert_eq!(node.attr().nlink, 2);
    }

    #[test]
    fn test_unlink_detaches_entry() {
        let (fs, stack, root) = setup();
        let lower = fs.add_file("/gone", b"", 0o644).unwrap();
        let entry = stack.lookup_existing(&root, OsStr::new("gone")).unwrap();
        let node = entry.node().unwrap();

        stack.unlink(&root, OsStr::new("gone")).unwrap();
        assert!(entry.is_negative());
        assert!(entry.get_lower_path().is_none());
        assert_eq!(node.attr().nlink, 0);
        drop(node);
        assert_eq!(lower.pin_count(), 0);

        let again = stack.lookup(&root, OsStr::new("gone"), LookupFlags::NONE).unwrap();
        assert!(again.is_negative());
        assert!(matches!(
            stack.unlink(&root, OsStr::new("gone")),
            Err(StackError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rmdir() {
        let (fs, stack, root) = setup();
        fs.add_dir("/d", 0o755).unwrap();
        fs.add_file("/d/f", b"", 0o644).unwrap();

        let err = stack.rmdir(&root, OsStr::new("d")).unwrap_err();
        assert!(matches!(err, StackError::NotEmpty { .. }));
        let d = stack.lookup_existing(&root, OsStr::new("d")).unwrap();
        stack.unlink(&d, OsStr::new("f")).unwrap();
        stack.rmdir(&root, OsStr::new("d")).unwrap();
        assert!(fs.resolve("/d").is_err());
    }

    #[test]
    fn test_rename_moves_node() {
        let (fs, stack, root) = setup();
        fs.add_file("/old", b"data", 0o644).unwrap();
        fs.add_dir("/dst", 0o755).unwrap();
        let old = stack.lookup_existing(&root, OsStr::new("old")).unwrap();
        let node = old.node().unwrap();
        let dst = stack.lookup_existing(&root, OsStr::new("dst")).unwrap();

        let new = stack
            .rename(&root, OsStr::new("old"), &dst, OsStr::new("new"), 0)
            .unwrap();
        assert!(Arc::ptr_eq(&new.node().unwrap(), &node));
        assert!(old.is_negative());
        assert!(old.get_lower_path().is_none());
        assert_eq!(new.path(), PathBuf::from("/dst/new"));
        assert!(fs.resolve("/dst/new").is_ok());

        let found = stack.lookup_existing(&dst, OsStr::new("new")).unwrap();
        assert!(Arc::ptr_eq(&found.node().unwrap(), &node));
        assert!(stack.lookup(&root, OsStr::new("old"), LookupFlags::NONE).unwrap().is_negative());
    }

    #[test]
    fn test_rename_replaces_target() {
        let (fs, stack, root) = setup();
        fs.add_file("/a", b"a", 0o644).unwrap();
        let victim = fs.add_file("/b", b"bb", 0o644).unwrap();
        let b = stack.lookup_existing(&root, OsStr::new("b")).unwrap();
        drop(b);

        let new = stack
            .rename(&root, OsStr::new("a"), &root, OsStr::new("b"), 0)
            .unwrap();
        assert_eq!(new.node().unwrap().attr().size, 1);
        assert_eq!(victim.pin_count(), 0);
    }

    #[test]
    fn test_rename_exchange_is_refused() {
        let (fs, stack, root) = setup();
        fs.add_file("/a", b"aaaa", 0o644).unwrap();
        fs.add_file("/b", b"bb", 0o644).unwrap();
        let a = stack.lookup_existing(&root, OsStr::new("a")).unwrap();
        let b = stack.lookup_existing(&root, OsStr::new("b")).unwrap();

        const RENAME_EXCHANGE: u32 = 2;
        let err = stack
            .rename(&root, OsStr::new("a"), &root, OsStr::new("b"), RENAME_EXCHANGE)
            .unwrap_err();
        assert!(matches!(err, StackError::NotSupported { .. }));
        assert_eq!(err.errno(), libc::EOPNOTSUPP);
        assert_eq!(a.node().unwrap().attr().size, 4);
        assert_eq!(b.node().unwrap().attr().size, 2);
        assert!(a.get_lower_path().unwrap().is_positive());

        let kept = stack
            .rename(&root, OsStr::new("a"), &root, OsStr::new("b"), RENAME_NOREPLACE)
            .unwrap_err();
        assert!(matches!(kept, StackError::AlreadyExists { .. }));
        assert!(!a.is_negative());
    }

    #[test]
    fn test_read_only_mount_refuses_changes() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/f", b"", 0o644).unwrap();
        let options = MountOptions::builder().read_only(true).build();
        let stack = StackFs::mount_lower(fs.clone(), options).unwrap();
        let root = stack.root().unwrap();

        let err = stack.mkdir(&root, OsStr::new("x"), 0o755).unwrap_err();
        assert!(matches!(err, StackError::ReadOnly));
        let entry = stack.lookup_existing(&root, OsStr::new("f")).unwrap();
        assert!(matches!(stack.open(&entry, OpenFlags::WRITE), Err(StackError::ReadOnly)));
        assert!(stack.open(&entry, OpenFlags::READ).is_ok());
    }

    #[test]
    fn test_setattr_truncates() {
        let (fs, stack, root) = setup();
        fs.add_file("/f", b"0123456789", 0o644).unwrap();
        let node = stack.lookup_existing(&root, OsStr::new("f")).unwrap().node().unwrap();

        let changes = SetAttr {
            size: Some(4),
            ..SetAttr::default()
        };
        let attr = stack.setattr(&node, &changes).unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(node.attr().size, 4);

        let huge = SetAttr {
            size: Some(u64::MAX),
            ..SetAttr::default()
        };
        assert!(matches!(
            stack.setattr(&node, &huge),
            Err(StackError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_readdir_lists_lower() {
        let (fs, stack, root) = setup();
        fs.add_file("/x", b"", 0o644).unwrap();
        let names: Vec<_> = stack
            .readdir(&root.node().unwrap())
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert!(names.iter().any(|name| name == "x"));
        assert!(names.iter().any(|name| name == "._stackfs"));
    }

    #[test]
    fn test_open_unlinked_entry_fails() {
        let (fs, stack, root) = setup();
        fs.add_file("/f", b"", 0o644).unwrap();
        let entry = stack.lookup_existing(&root, OsStr::new("f")).unwrap();
        let file = stack.open(&entry, OpenFlags::READ).unwrap();
        drop(file);
        stack.unlink(&root, OsStr::new("f")).unwrap();
        let err = stack.open(&entry, OpenFlags::READ).unwrap_err();
        assert!(matches!(err, StackError::NotFound { .. }));
    }

    #[test]
    fn test_file_id_roundtrip() {
        let (fs, stack, root) = setup();
        fs.add_file("/f", b"", 0o644).unwrap();
        let node = stack.lookup_existing(&root, OsStr::new("f")).unwrap().node().unwrap();
        let id = stack.file_id(&node);
        let found = stack.node_from_handle(id).unwrap();
        assert!(Arc::ptr_eq(&found, &node));
    }
}
