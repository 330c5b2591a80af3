//! Shadow directory entries and their lower-path cell.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::node::ShadowNode;
use crate::error::{Result, StackError};
use crate::lower::LowerPath;
use crate::types::NodeKind;

const CHILD_PRUNE_THRESHOLD: usize = 64;

/// A named edge in the adapter's tree.
///
/// The lower path this entry resolves to lives in a mutex-protected cell.
/// The lock is held only while the `Option` is swapped; clones and drops of
/// the path happen outside it.
///
/// Entries are hashed by name in their parent, so every holder of a name
/// sees the same entry until it is replaced by a fresh resolution.
pub struct ShadowEntry {
    name: OsString,
    parent: Option<Arc<ShadowEntry>>,
    lower: Mutex<Option<LowerPath>>,
    node: RwLock<Option<Arc<ShadowNode>>>,
    children: Mutex<HashMap<OsString, Weak<ShadowEntry>>>,
}

impl ShadowEntry {
    /// The mount root, already resolved at bootstrap.
    pub fn new_root(lower: LowerPath, node: Arc<ShadowNode>) -> Arc<Self> {
        let entry = Arc::new(Self {
            name: OsString::from("/"),
            parent: None,
            lower: Mutex::new(Some(lower)),
            node: RwLock::new(Some(Arc::clone(&node))),
            children: Mutex::new(HashMap::new()),
        });
        node.set_alias(&entry);
        entry
    }

    /// A fresh negative entry under `parent` with an empty lower path,
    /// hashed in place of any previous entry of the same name.
    pub fn new(parent: &Arc<ShadowEntry>, name: &OsStr) -> Arc<Self> {
        let entry = Arc::new(Self {
            name: name.to_os_string(),
            parent: Some(Arc::clone(parent)),
            lower: Mutex::new(None),
            node: RwLock::new(None),
            children: Mutex::new(HashMap::new()),
        });
        let mut children = parent.children.lock();
        if children.len() >= CHILD_PRUNE_THRESHOLD {
            children.retain(|_, child| child.strong_count() > 0);
        }
        children.insert(name.to_os_string(), Arc::downgrade(&entry));
        entry
    }

    /// The entry currently hashed under `name`, if still alive.
    pub fn hashed_child(&self, name: &OsStr) -> Option<Arc<ShadowEntry>> {
        self.children.lock().get(name).and_then(Weak::upgrade)
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<ShadowEntry>> {
        self.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none() && self.name == "/"
    }

    pub fn node(&self) -> Option<Arc<ShadowNode>> {
        self.node.read().clone()
    }

    pub fn is_negative(&self) -> bool {
        self.node.read().is_none()
    }

    /// Copies out a referenced snapshot of the lower path.
    pub fn get_lower_path(&self) -> Option<LowerPath> {
        let guard = self.lower.lock();
        guard.clone()
    }

    /// Like [`ShadowEntry::get_lower_path`], failing with
    /// [`StackError::Stale`] on a detached entry.
    pub fn lower_path(&self) -> Result<LowerPath> {
        self.get_lower_path()
            .ok_or_else(|| StackError::stale(format!("{} is detached", self.path().display())))
    }

    /// Installs `path`, handing the previous value back to the caller.
    #[must_use = "the previous lower path must be released by the caller"]
    pub fn set_lower_path(&self, path: LowerPath) -> Option<LowerPath> {
        self.lower.lock().replace(path)
    }

    /// Clears the cell, transferring the previous value out.
    #[must_use = "the previous lower path must be released by the caller"]
    pub fn reset_lower_path(&self) -> Option<LowerPath> {
        self.lower.lock().take()
    }

    /// Clears the cell and releases the previous value once the lock is
    /// dropped.
    pub fn put_reset_lower_path(&self) {
        let old = self.lower.lock().take();
        drop(old);
    }

    /// Binds `node` to this entry.
    pub fn instantiate(self: &Arc<Self>, node: Arc<ShadowNode>) {
        if node.kind() == NodeKind::Directory {
            node.set_alias(self);
        }
        *self.node.write() = Some(node);
    }

    /// Unbinds the node, returning it to the caller.
    pub fn make_negative(&self) -> Option<Arc<ShadowNode>> {
        self.node.write().take()
    }

    /// Attaches `node` to this entry, or returns the entry that already
    /// names it.
    ///
    /// A directory keeps a single alias: when a live alias resolves to the
    /// same lower dentry it is returned instead and this entry is left
    /// negative.
    pub fn splice(self: &Arc<Self>, node: Arc<ShadowNode>) -> Arc<ShadowEntry> {
        if node.kind() != NodeKind::Directory {
            *self.node.write() = Some(node);
            return Arc::clone(self);
        }

        let mut alias_slot = node.alias_slot().lock();
        if let Some(alias) = alias_slot.upgrade() {
            if !Arc::ptr_eq(&alias, self) && alias.resolves_like(self) {
                drop(alias_slot);
                return alias;
            }
        }
        *alias_slot = Arc::downgrade(self);
        drop(alias_slot);
        *self.node.write() = Some(node);
        Arc::clone(self)
    }

    /// True while this entry is positive and bound to `lower`'s dentry and
    /// inode.
    pub fn still_resolves_to(&self, lower: &LowerPath) -> bool {
        let (Some(node), Some(path)) = (self.node(), self.get_lower_path()) else {
            return false;
        };
        match lower.inode() {
            Some(inode) => path.same_as(lower) && Arc::ptr_eq(node.lower(), &inode),
            None => false,
        }
    }

    fn resolves_like(&self, other: &ShadowEntry) -> bool {
        let mine = self.get_lower_path();
        let theirs = other.get_lower_path();
        match (mine, theirs) {
            (Some(a), Some(b)) => a.same_as(&b),
            _ => false,
        }
    }

    /// Path of this entry from the mount root.
    pub fn path(&self) -> PathBuf {
        let mut names = Vec::new();
        let mut cursor = Some(self);
        while let Some(entry) = cursor {
            if entry.parent.is_some() {
                names.push(entry.name.as_os_str());
            }
            cursor = entry.parent.as_deref();
        }
        let mut path = PathBuf::from("/");
        for name in names.into_iter().rev() {
            path.push(name);
        }
        path
    }
}

impl fmt::Debug for ShadowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowEntry")
            .field("path", &self.path())
            .field("node", &self.node().map(|node| node.serial()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::memory::MemoryLower;
    use crate::lower::LowerPath;
    use crate::shadow::cache::NodeCache;
    use crate::stats::AdapterStats;
    use std::thread;

    fn root_entry(fs: &Arc<MemoryLower>, cache: &NodeCache) -> Arc<ShadowEntry> {
        let lower = LowerPath::root_of(fs.clone()).unwrap();
        let node = cache.find_or_create(&lower.inode().unwrap()).unwrap();
        ShadowEntry::new_root(lower, node)
    }

    #[test]
    fn test_lower_path_cell() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/a", b"", 0o644).unwrap();
        fs.add_file("/b", b"", 0o644).unwrap();
        let cache = NodeCache::new(Arc::new(AdapterStats::new()));
        let root = root_entry(&fs, &cache);
        let root_path = root.get_lower_path().unwrap();

        let entry = ShadowEntry::new(&root, OsStr::new("a"));
        assert!(entry.get_lower_path().is_none());

        let a = root_path.lookup_one(OsStr::new("a")).unwrap();
        assert!(entry.set_lower_path(a.clone()).is_none());
        assert!(entry.get_lower_path().unwrap().same_as(&a));

        let b = root_path.lookup_one(OsStr::new("b")).unwrap();
        let old = entry.set_lower_path(b.clone()).unwrap();
        assert!(old.same_as(&a));

        let taken = entry.reset_lower_path().unwrap();
        assert!(taken.same_as(&b));
        assert!(entry.get_lower_path().is_none());

        assert!(entry.set_lower_path(taken).is_none());
        entry.put_reset_lower_path();
        assert!(entry.get_lower_path().is_none());
        assert_eq!(entry.path(), PathBuf::from("/a"));
    }

    #[test]
    fn test_concurrent_readers_see_whole_paths() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/x", b"", 0o644).unwrap();
        fs.add_file("/y", b"", 0o644).unwrap();
        let cache = NodeCache::new(Arc::new(AdapterStats::new()));
        let root = root_entry(&fs, &cache);
        let root_path = root.get_lower_path().unwrap();
        let x = root_path.lookup_one(OsStr::new("x")).unwrap();
        let y = root_path.lookup_one(OsStr::new("y")).unwrap();

        let entry = ShadowEntry::new(&root, OsStr::new("x"));
        let _ = entry.set_lower_path(x.clone());

        let writer = {
            let entry = Arc::clone(&entry);
            let (x, y) = (x.clone(), y.clone());
            thread::spawn(move || {
                for i in 0..2000 {
                    let next = if i % 2 == 0 { y.clone() } else { x.clone() };
                    drop(entry.set_lower_path(next));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let entry = Arc::clone(&entry);
                let (x, y) = (x.clone(), y.clone());
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let seen = entry.get_lower_path().unwrap();
                        assert!(seen.same_as(&x) || seen.same_as(&y));
                        let inode = seen.inode().unwrap();
                        assert_eq!(inode.id(), seen.dentry().inode().unwrap().id());
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_splice_reuses_directory_alias() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_dir("/d", 0o755).unwrap();
        let cache = NodeCache::new(Arc::new(AdapterStats::new()));
        let root = root_entry(&fs, &cache);
        let root_path = root.get_lower_path().unwrap();

        let first = ShadowEntry::new(&root, OsStr::new("d"));
        let lower = root_path.lookup_one(OsStr::new("d")).unwrap();
        let _ = first.set_lower_path(lower.clone());
        let node = cache.find_or_create(&lower.inode().unwrap()).unwrap();
        let spliced = first.splice(Arc::clone(&node));
        assert!(Arc::ptr_eq(&spliced, &first));

        let second = ShadowEntry::new(&root, OsStr::new("d"));
        let _ = second.set_lower_path(root_path.lookup_one(OsStr::new("d")).unwrap());
        let spliced = second.splice(node);
        assert!(Arc::ptr_eq(&spliced, &first));
        assert!(second.is_negative());
    }

    #[test]
    fn test_children_are_hashed_by_name() {
        let fs = MemoryLower::new("tmpfs");
        let cache = NodeCache::new(Arc::new(AdapterStats::new()));
        let root = root_entry(&fs, &cache);

        let first = ShadowEntry::new(&root, OsStr::new("n"));
        assert!(Arc::ptr_eq(&root.hashed_child(OsStr::new("n")).unwrap(), &first));
        let second = ShadowEntry::new(&root, OsStr::new("n"));
        assert!(Arc::ptr_eq(&root.hashed_child(OsStr::new("n")).unwrap(), &second));
        drop(second);
        assert!(root.hashed_child(OsStr::new("n")).is_none());
        assert!(root.hashed_child(OsStr::new("other")).is_none());
    }

    #[test]
    fn test_splice_files_never_alias() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/f", b"", 0o644).unwrap();
        let cache = NodeCache::new(Arc::new(AdapterStats::new()));
        let root = root_entry(&fs, &cache);
        let root_path = root.get_lower_path().unwrap();
        let lower = root_path.lookup_one(OsStr::new("f")).unwrap();
        let node = cache.find_or_create(&lower.inode().unwrap()).unwrap();

        let a = ShadowEntry::new(&root, OsStr::new("f"));
        let b = ShadowEntry::new(&root, OsStr::new("f"));
        assert!(Arc::ptr_eq(&a.splice(Arc::clone(&node)), &a));
        assert!(Arc::ptr_eq(&b.splice(node), &b));
        assert!(!a.is_negative() && !b.is_negative());
    }
}
