//! Lower name edges and `(mount, dentry)` paths.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::{LowerFs, LowerInode};
use crate::error::{Result, StackError};

/// Prune dead child slots once a directory's table grows past this size.
const CHILD_PRUNE_THRESHOLD: usize = 64;

/// A name in a lower directory, positive when it holds an inode.
///
/// Children are hashed by name so repeated resolutions of the same name,
/// including failed ones, land on the same dentry.
pub struct LowerDentry {
    name: OsString,
    parent: Option<Arc<LowerDentry>>,
    inode: RwLock<Option<Arc<LowerInode>>>,
    children: Mutex<HashMap<OsString, Weak<LowerDentry>>>,
}

impl LowerDentry {
    /// Creates the root dentry of a lower mount.
    pub fn root(inode: Arc<LowerInode>) -> Arc<Self> {
        Arc::new(Self {
            name: OsString::from("/"),
            parent: None,
            inode: RwLock::new(Some(inode)),
            children: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<LowerDentry>> {
        self.parent.as_ref()
    }

    pub fn inode(&self) -> Option<Arc<LowerInode>> {
        self.inode.read().clone()
    }

    pub fn is_negative(&self) -> bool {
        self.inode.read().is_none()
    }

    /// Binds `inode` to this name, replacing whatever it held.
    ///
    /// A dying inode is refused and leaves the dentry untouched; the return
    /// value tells whether the binding happened.
    pub fn instantiate(&self, inode: Arc<LowerInode>) -> bool {
        if inode.is_dying() {
            return false;
        }
        *self.inode.write() = Some(inode);
        true
    }

    /// Turns the dentry negative, returning the inode it held.
    pub fn make_negative(&self) -> Option<Arc<LowerInode>> {
        self.inode.write().take()
    }

    /// Returns the hashed child called `name`, if one is still alive.
    pub fn lookup_hashed(&self, name: &OsStr) -> Option<Arc<LowerDentry>> {
        self.children.lock().get(name).and_then(Weak::upgrade)
    }

    /// Returns the hashed child called `name`, allocating a negative one if
    /// none is alive.
    pub fn child(self: &Arc<Self>, name: &OsStr) -> Arc<LowerDentry> {
        let mut children = self.children.lock();
        if let Some(existing) = children.get(name).and_then(Weak::upgrade) {
            return existing;
        }
        if children.len() >= CHILD_PRUNE_THRESHOLD {
            children.retain(|_, child| child.strong_count() > 0);
        }
        let dentry = Arc::new(LowerDentry {
            name: name.to_os_string(),
            parent: Some(Arc::clone(self)),
            inode: RwLock::new(None),
            children: Mutex::new(HashMap::new()),
        });
        children.insert(name.to_os_string(), Arc::downgrade(&dentry));
        dentry
    }

    /// Path of the dentry relative to the mount root.
    pub fn path(&self) -> PathBuf {
        let mut names = Vec::new();
        let mut cursor = Some(self);
        while let Some(dentry) = cursor {
            if dentry.parent.is_some() {
                names.push(dentry.name.as_os_str());
            }
            cursor = dentry.parent.as_deref();
        }
        let mut path = PathBuf::from("/");
        for name in names.into_iter().rev() {
            path.push(name);
        }
        path
    }
}

impl fmt::Debug for LowerDentry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LowerDentry")
            .field("path", &self.path())
            .field("inode", &self.inode().map(|inode| inode.id()))
            .finish()
    }
}

/// A `(mount, dentry)` pair. Cloning takes a reference, dropping releases it.
#[derive(Clone)]
pub struct LowerPath {
    mnt: Arc<dyn LowerFs>,
    dentry: Arc<LowerDentry>,
}

impl LowerPath {
    pub fn new(mnt: Arc<dyn LowerFs>, dentry: Arc<LowerDentry>) -> Self {
        Self { mnt, dentry }
    }

    /// The root path of `mnt`.
    pub fn root_of(mnt: Arc<dyn LowerFs>) -> Result<Self> {
        let root = mnt.root()?;
        Ok(Self::new(mnt, LowerDentry::root(root)))
    }

    pub fn mnt(&self) -> &Arc<dyn LowerFs> {
        &self.mnt
    }

    pub fn dentry(&self) -> &Arc<LowerDentry> {
        &self.dentry
    }

    pub fn inode(&self) -> Option<Arc<LowerInode>> {
        self.dentry.inode()
    }

    pub fn is_positive(&self) -> bool {
        !self.dentry.is_negative()
    }

    /// True when both paths name the same dentry on the same mount.
    pub fn same_as(&self, other: &LowerPath) -> bool {
        Arc::ptr_eq(&self.dentry, &other.dentry)
            && Arc::ptr_eq(self.mnt.instance(), other.mnt.instance())
    }

    /// Resolves `name` below this path. Only positive results are returned;
    /// a missing name surfaces as [`StackError::NotFound`].
    pub fn lookup_one(&self, name: &OsStr) -> Result<LowerPath> {
        let dir = self
            .inode()
            .ok_or_else(|| StackError::not_found(self.dentry.name()))?;
        if !dir.kind().is_dir() {
            return Err(StackError::NotADirectory {
                name: self.dentry.name().to_os_string(),
            });
        }
        let inode = self.mnt.lookup(&dir, name)?;
        let dentry = self.dentry.child(name);
        if !dentry.instantiate(inode) {
            return Err(StackError::not_found(name));
        }
        Ok(LowerPath::new(Arc::clone(&self.mnt), dentry))
    }

    /// Returns a negative path for `name`, reusing a hashed dentry when one
    /// exists.
    pub fn negative_child(&self, name: &OsStr) -> LowerPath {
        let dentry = self.dentry.child(name);
        if let Some(stale) = dentry.make_negative() {
            tracing::debug!(
                "dropping stale lower binding {} for {}",
                stale.id(),
                dentry.path().display()
            );
        }
        LowerPath::new(Arc::clone(&self.mnt), dentry)
    }

    pub fn display(&self) -> String {
        format!("{}:{}", self.mnt.source().display(), self.dentry.path().display())
    }
}

impl fmt::Debug for LowerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LowerPath")
            .field("instance", &self.mnt.instance().id())
            .field("dentry", &self.dentry)
            .finish()
    }
}
