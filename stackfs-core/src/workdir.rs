//! Bootstrapping of the private working directories.
//!
//! Every mount keeps a triad `._<adapter>/{data,meta}` in the writable layer
//! of the lower filesystem. Creating it is idempotent, so repeated mounts
//! over the same tree find and reuse what an earlier mount left behind.

use std::ffi::OsStr;
use std::sync::Arc;

use crate::create::create_real;
use crate::error::{Result, StackError};
use crate::lower::{LowerPath, WriteAccess};
use crate::shadow::{NodeCache, ShadowEntry};
use crate::types::{CreateAttr, MountOptions, SetAttr, WORK_DATADIR_NAME, WORK_METADIR_NAME};

const POSIX_ACL_DEFAULT: &str = "system.posix_acl_default";
const POSIX_ACL_ACCESS: &str = "system.posix_acl_access";

/// The three working directories of a mount.
#[derive(Debug, Clone)]
pub struct WorkTriad {
    pub base: Arc<ShadowEntry>,
    pub data: Arc<ShadowEntry>,
    pub meta: Arc<ShadowEntry>,
}

impl WorkTriad {
    /// Lower locations of base, data and meta, for display.
    pub fn lower_paths(&self) -> Vec<String> {
        [&self.base, &self.data, &self.meta]
            .iter()
            .filter_map(|entry| entry.get_lower_path())
            .map(|path| path.display())
            .collect()
    }
}

/// Creates the triad below `work_root`.
pub fn bootstrap(
    cache: &NodeCache,
    work_root: &Arc<ShadowEntry>,
    options: &MountOptions,
) -> Result<WorkTriad> {
    let mode = options.workdir_mode;
    let base_name = options.base_dir_name();
    let base = create_workdir(cache, work_root, OsStr::new(&base_name), true, mode)?;
    let data = create_workdir(cache, &base, OsStr::new(WORK_DATADIR_NAME), true, mode)?;
    let meta = create_workdir(cache, &base, OsStr::new(WORK_METADIR_NAME), true, mode)?;
    Ok(WorkTriad { base, data, meta })
}

/// Creates the directory `name` below `parent`, or returns the existing one
/// when `persist` is set.
///
/// Without `persist` an existing directory gets one cleanup pass and one
/// more resolution; if it is still there the call fails with
/// [`StackError::AlreadyExists`]. Failures are logged with the work path
/// and errno.
pub fn create_workdir(
    cache: &NodeCache,
    parent: &Arc<ShadowEntry>,
    name: &OsStr,
    persist: bool,
    mode: u32,
) -> Result<Arc<ShadowEntry>> {
    let dir = parent
        .get_lower_path()
        .ok_or_else(|| StackError::stale(format!("{} has no lower path", parent.path().display())))?;

    let result = create_locked(&dir, name, persist, mode).and_then(|path| {
        let inode = path
            .inode()
            .ok_or_else(|| StackError::not_found(name))?;
        let node = cache.find_or_create(&inode)?;
        let entry = ShadowEntry::new(parent, name);
        let _ = entry.set_lower_path(path);
        entry.instantiate(node);
        Ok(entry)
    });

    if let Err(e) = &result {
        tracing::error!(
            "failed to create management directory {}/{} (errno: {}): {}; refusing to continue",
            dir.display(),
            name.to_string_lossy(),
            e.errno(),
            e
        );
    }
    result
}

/// Resolves or creates `name` with write access held and the parent locked.
/// Both are released on every return path by their guards.
fn create_locked(dir: &LowerPath, name: &OsStr, persist: bool, mode: u32) -> Result<LowerPath> {
    let fs = Arc::clone(dir.mnt());
    let _write = WriteAccess::acquire(fs.as_ref())?;
    let parent = dir
        .inode()
        .ok_or_else(|| StackError::not_found(dir.dentry().name()))?;
    let _locked = parent.lock_dir();

    let mut retried = false;
    let target = loop {
        match dir.lookup_one(name) {
            Ok(existing) if persist => return Ok(existing),
            Ok(existing) => {
                if retried {
                    return Err(StackError::AlreadyExists {
                        name: name.to_os_string(),
                    });
                }
                cleanup_workdir(&existing);
                retried = true;
            }
            Err(StackError::NotFound { .. }) => break dir.negative_child(name),
            Err(e) => return Err(e),
        }
    };

    create_real(dir, &target, &CreateAttr::directory(0), None)?;
    let inode = target
        .inode()
        .ok_or_else(|| StackError::not_found(name))?;

    for acl in [POSIX_ACL_DEFAULT, POSIX_ACL_ACCESS] {
        match fs.removexattr(&inode, OsStr::new(acl)) {
            Ok(()) => {}
            Err(e) if e.is_absent_attribute() => {}
            Err(e) => return Err(e),
        }
    }

    // Clear inherited mode bits.
    fs.setattr(&inode, &SetAttr::mode(mode))?;
    Ok(target)
}

/// Hook for removing transient state left in a stale work directory.
/// Currently leaves the directory untouched.
fn cleanup_workdir(existing: &LowerPath) {
    tracing::debug!("work directory {} already exists", existing.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::memory::MemoryLower;
    use crate::lower::LowerFs;
    use crate::stats::AdapterStats;

    fn setup(fs: &Arc<MemoryLower>) -> (NodeCache, Arc<ShadowEntry>) {
        let cache = NodeCache::new(Arc::new(AdapterStats::new()));
        let root = LowerPath::root_of(fs.clone()).unwrap();
        let node = cache.find_or_create(&root.inode().unwrap()).unwrap();
        (cache, ShadowEntry::new_root(root, node))
    }

    #[test]
    fn test_bootstrap_creates_triad() {
        let fs = MemoryLower::new("tmpfs");
        let (cache, root) = setup(&fs);
        let options = MountOptions::default();

        let triad = bootstrap(&cache, &root, &options).unwrap();
        assert_eq!(triad.base.path().to_str(), Some("/._stackfs"));
        assert_eq!(triad.data.path().to_str(), Some("/._stackfs/data"));
        assert_eq!(triad.meta.path().to_str(), Some("/._stackfs/meta"));

        let data = fs.resolve("/._stackfs/data").unwrap();
        assert!(data.kind().is_dir());
        assert_eq!(data.attr().perm(), 0o700);
        assert_eq!(fs.active_writers(), 0);
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let fs = MemoryLower::new("tmpfs");
        let options = MountOptions::default();

        let (cache, root) = setup(&fs);
        let first = bootstrap(&cache, &root, &options).unwrap();
        let first_ino = fs.resolve("/._stackfs/meta").unwrap().ino();
        let first_paths = first.lower_paths();
        drop(first);

        let (cache, root) = setup(&fs);
        let second = bootstrap(&cache, &root, &options).unwrap();
        assert_eq!(second.lower_paths(), first_paths);
        assert_eq!(fs.resolve("/._stackfs/meta").unwrap().ino(), first_ino);
    }

    #[test]
    fn test_existing_without_persist_retries_once() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_dir("/scratch", 0o755).unwrap();
        let (cache, root) = setup(&fs);

        let err = create_workdir(&cache, &root, OsStr::new("scratch"), false, 0o700).unwrap_err();
        assert!(matches!(err, StackError::AlreadyExists { .. }));
        assert_eq!(fs.active_writers(), 0);
    }

    #[test]
    fn test_missing_acl_support_is_tolerated() {
        let fs = MemoryLower::new("tmpfs");
        fs.set_xattr_supported(false);
        let (cache, root) = setup(&fs);

        let entry = create_workdir(&cache, &root, OsStr::new("w"), true, 0o700).unwrap();
        assert!(!entry.is_negative());
    }

    #[test]
    fn test_inherited_acls_are_stripped() {
        let fs = MemoryLower::new("tmpfs");
        let (cache, root) = setup(&fs);
        let root_inode = fs.root().unwrap();
        fs.setxattr(&root_inode, OsStr::new(POSIX_ACL_DEFAULT), b"acl", 0).unwrap();

        let plain = fs.mkdir(&root_inode, OsStr::new("plain"), 0o755).unwrap();
        assert_eq!(fs.listxattr(&plain).unwrap().len(), 2);

        let entry = create_workdir(&cache, &root, OsStr::new("w"), true, 0o700).unwrap();
        let inode = entry.get_lower_path().unwrap().inode().unwrap();
        assert!(fs.listxattr(&inode).unwrap().is_empty());
    }

    #[test]
    fn test_read_only_lower_aborts() {
        let fs = MemoryLower::new("tmpfs");
        let (cache, root) = setup(&fs);
        fs.set_read_only(true);

        let err = bootstrap(&cache, &root, &MountOptions::default()).unwrap_err();
        assert!(matches!(err, StackError::ReadOnly));
        assert_eq!(fs.active_writers(), 0);
    }
}
