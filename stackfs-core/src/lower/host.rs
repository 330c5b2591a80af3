//! Passthrough lower filesystem over a host directory.
//!
//! Every lower inode holds an `O_PATH` descriptor, and all namespace calls
//! are made relative to those descriptors with the `*at` family. Calls that
//! need a real open file (xattrs, open, readdir) go through the
//! `/proc/self/fd/N` magic link of the inode.

use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirEntryExt, FileExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::mountinfo::{self, MountEntry};
use super::{
    FsInstance, InodeHandle, LowerFile, LowerFs, LowerInode, LowerKind, NodeId, OverlayLayout,
    IOC_GETFLAGS, IOC_SETFLAGS, OVERLAYFS_MAGIC,
};
use crate::error::{Result, StackError};
use crate::types::metadata::{system_time_from, SpecialKind, S_IFDIR, S_IFMT};
use crate::types::{DirEntry, NodeAttr, NodeKind, OpenFlags, SetAttr, StatFs};

const EMPTY: &[u8] = b"\0";
const PRUNE_INTERVAL: usize = 1024;

fn empty_path() -> *const libc::c_char {
    EMPTY.as_ptr() as *const libc::c_char
}

fn cstring(name: &OsStr) -> Result<CString> {
    CString::new(name.as_bytes())
        .map_err(|_| StackError::invalid(format!("name {:?} contains a NUL byte", name)))
}

fn check_name(name: &OsStr) -> Result<CString> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.contains(&b'/') || name == "." || name == ".." {
        return Err(StackError::invalid(format!("invalid name {:?}", name)));
    }
    cstring(name)
}

fn last_error(name: impl Into<OsString>) -> StackError {
    StackError::from_io(io::Error::last_os_error(), name)
}

fn check(ret: libc::c_int, name: &OsStr) -> Result<()> {
    if ret < 0 {
        Err(last_error(name))
    } else {
        Ok(())
    }
}

fn mounted_read_only(vfs: &libc::statvfs) -> bool {
    vfs.f_flag as u64 & libc::ST_RDONLY as u64 != 0
}

fn proc_path(fd: RawFd) -> Result<CString> {
    CString::new(format!("/proc/self/fd/{}", fd))
        .map_err(|_| StackError::invalid("descriptor path"))
}

fn stat_fd(fd: RawFd) -> io::Result<libc::stat> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: `st` is a valid out-pointer and the path is NUL terminated.
    let ret = unsafe {
        libc::fstatat(
            fd,
            empty_path(),
            &mut st,
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

fn attr_from_stat(st: &libc::stat) -> NodeAttr {
    NodeAttr {
        ino: st.st_ino as u64,
        mode: st.st_mode as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        nlink: st.st_nlink as u64,
        rdev: st.st_rdev as u64,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        blksize: st.st_blksize as u32,
        atime: system_time_from(st.st_atime as i64, st.st_atime_nsec as i64),
        mtime: system_time_from(st.st_mtime as i64, st.st_mtime_nsec as i64),
        ctime: system_time_from(st.st_ctime as i64, st.st_ctime_nsec as i64),
    }
}

fn open_path(path: &Path) -> Result<OwnedFd> {
    let c_path = cstring(path.as_os_str())?;
    // SAFETY: the path is NUL terminated; the returned descriptor is owned below.
    let fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(last_error(path.as_os_str()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn timespec(time: Option<SystemTime>) -> libc::timespec {
    match time.map(|t| t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO)) {
        Some(since) => libc::timespec {
            tv_sec: since.as_secs() as libc::time_t,
            tv_nsec: since.subsec_nanos() as _,
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}

fn kind_of(file_type: std::fs::FileType) -> NodeKind {
    if file_type.is_dir() {
        NodeKind::Directory
    } else if file_type.is_symlink() {
        NodeKind::Symlink
    } else if file_type.is_char_device() {
        NodeKind::Special(SpecialKind::CharDevice)
    } else if file_type.is_block_device() {
        NodeKind::Special(SpecialKind::BlockDevice)
    } else if file_type.is_fifo() {
        NodeKind::Special(SpecialKind::Fifo)
    } else if file_type.is_socket() {
        NodeKind::Special(SpecialKind::Socket)
    } else {
        NodeKind::Regular
    }
}

/// Target of an xattr call: an opened file, or the magic link path for
/// symlinks, which cannot be opened.
enum XattrTarget {
    File(File),
    Path(CString),
}

/// Passthrough lower filesystem rooted at a host directory.
pub struct HostLower {
    instance: Arc<FsInstance>,
    source: PathBuf,
    root: Arc<LowerInode>,
    kind: LowerKind,
    read_only: bool,
    inodes: DashMap<NodeId, Weak<LowerInode>>,
    foreign: DashMap<u64, Arc<FsInstance>>,
    writers: AtomicUsize,
}

impl std::fmt::Debug for HostLower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLower")
            .field("source", &self.source)
            .field("fs_type", &self.instance.fs_type())
            .field("overlay", &self.kind.is_overlay())
            .finish()
    }
}

impl HostLower {
    /// Opens `path` as a lower filesystem, detecting overlayfs.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        Self::open_with(path, true)
    }

    /// Opens `path` as a plain filesystem, even when it sits on overlayfs.
    pub fn open_plain(path: &Path) -> Result<Arc<Self>> {
        Self::open_with(path, false)
    }

    fn open_with(path: &Path, detect_overlay: bool) -> Result<Arc<Self>> {
        let source = std::fs::canonicalize(path).map_err(|err| StackError::UnsupportedLower {
            reason: format!("error accessing lower directory '{}': {}", path.display(), err),
        })?;
        let fd = open_path(&source)?;
        let st = stat_fd(fd.as_raw_fd()).map_err(|err| StackError::from_io(err, source.as_os_str()))?;
        if st.st_mode as u32 & S_IFMT != S_IFDIR {
            return Err(StackError::UnsupportedLower {
                reason: format!("'{}' is not a directory", source.display()),
            });
        }

        let mut sfs: libc::statfs = unsafe { std::mem::zeroed() };
        // SAFETY: `sfs` is a valid out-pointer; fstatfs accepts O_PATH descriptors.
        check(unsafe { libc::fstatfs(fd.as_raw_fd(), &mut sfs) }, source.as_os_str())?;
        let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: as above; the mount flags are only reported by statvfs.
        check(unsafe { libc::fstatvfs(fd.as_raw_fd(), &mut vfs) }, source.as_os_str())?;
        let read_only = mounted_read_only(&vfs);

        let mounts = match mountinfo::read_self() {
            Ok(mounts) => mounts,
            Err(err) => {
                warn!("cannot read mount table: {}", err);
                Vec::new()
            }
        };
        let mount = mountinfo::find_mount(&mounts, &source);
        let fs_type = mount
            .map(|m| m.fs_type.clone())
            .unwrap_or_else(|| format!("{:#x}", sfs.f_type));

        let kind = if detect_overlay && sfs.f_type as u64 == OVERLAYFS_MAGIC {
            LowerKind::Overlay(Self::overlay_layout(mount)?)
        } else {
            LowerKind::Plain
        };

        let instance = FsInstance::new(
            st.st_dev as u64,
            fs_type,
            i64::MAX as u64,
            Duration::from_nanos(1),
        );
        let id = NodeId::new(st.st_dev as u64, st.st_ino as u64);
        let root = LowerInode::new(
            id,
            Arc::clone(&instance),
            0,
            attr_from_stat(&st),
            InodeHandle::Host(fd),
        );
        let inodes = DashMap::new();
        inodes.insert(id, Arc::downgrade(&root));

        info!(
            "opened lower directory {} ({}, {})",
            source.display(),
            instance.fs_type(),
            if read_only { "ro" } else { "rw" }
        );
        Ok(Arc::new(Self {
            instance,
            source,
            root,
            kind,
            read_only,
            inodes,
            foreign: DashMap::new(),
            writers: AtomicUsize::new(0),
        }))
    }

    fn overlay_layout(mount: Option<&MountEntry>) -> Result<OverlayLayout> {
        let Some(mount) = mount else {
            warn!("overlay lower directory missing from the mount table");
            return Ok(OverlayLayout::default());
        };
        let upper_dir = mount.option("upperdir").map(PathBuf::from);
        let work_dir = mount.option("workdir").map(PathBuf::from);
        let lower_dirs = mount
            .option("lowerdir")
            .map(|dirs| dirs.split(':').map(PathBuf::from).collect())
            .unwrap_or_default();
        let work_dir_present = work_dir.as_deref().map(Path::exists).unwrap_or(false);
        let upper: Option<Arc<dyn LowerFs>> = match &upper_dir {
            Some(dir) => Some(HostLower::open_with(dir, false)?),
            None => None,
        };
        debug!(
            "overlay layout: upper={:?} work={:?} lower={:?}",
            upper_dir, work_dir, lower_dirs
        );
        Ok(OverlayLayout {
            upper,
            upper_dir,
            work_dir,
            work_dir_present,
            lower_dirs,
        })
    }

    fn fd(inode: &LowerInode) -> Result<RawFd> {
        match inode.handle() {
            InodeHandle::Host(fd) => Ok(fd.as_raw_fd()),
            InodeHandle::Memory => Err(StackError::invalid(format!(
                "inode {} does not belong to a host filesystem",
                inode.id()
            ))),
        }
    }

    fn instance_for(&self, dev: u64) -> Arc<FsInstance> {
        if dev == self.instance.dev() {
            return Arc::clone(&self.instance);
        }
        self.foreign
            .entry(dev)
            .or_insert_with(|| {
                FsInstance::new(dev, "foreign", i64::MAX as u64, Duration::from_nanos(1))
            })
            .clone()
    }

    /// Returns the unique inode for the object behind `fd`.
    fn inode_for(&self, fd: OwnedFd, name: &OsStr) -> Result<Arc<LowerInode>> {
        let st = stat_fd(fd.as_raw_fd()).map_err(|err| StackError::from_io(err, name))?;
        let id = NodeId::new(st.st_dev as u64, st.st_ino as u64);
        let attr = attr_from_stat(&st);

        if let Some(existing) = self.inodes.get(&id).and_then(|weak| weak.upgrade()) {
            existing.set_attr(attr);
            return Ok(existing);
        }

        if self.inodes.len() % PRUNE_INTERVAL == PRUNE_INTERVAL - 1 {
            self.inodes.retain(|_, weak| weak.strong_count() > 0);
        }

        let inode = LowerInode::new(id, self.instance_for(id.dev), 0, attr, InodeHandle::Host(fd));
        let winner = match self.inodes.entry(id) {
            Entry::Occupied(mut occupied) => match occupied.get().upgrade() {
                Some(existing) => existing,
                None => {
                    occupied.insert(Arc::downgrade(&inode));
                    inode
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(&inode));
                inode
            }
        };
        Ok(winner)
    }

    fn lookup_at(&self, dirfd: RawFd, name: &OsStr) -> Result<Arc<LowerInode>> {
        let c_name = check_name(name)?;
        // SAFETY: the name is NUL terminated; the descriptor is owned below.
        let fd = unsafe {
            libc::openat(
                dirfd,
                c_name.as_ptr(),
                libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(last_error(name));
        }
        self.inode_for(unsafe { OwnedFd::from_raw_fd(fd) }, name)
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(StackError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn xattr_target(inode: &LowerInode) -> Result<XattrTarget> {
        let path = proc_path(Self::fd(inode)?)?;
        if inode.kind() == NodeKind::Symlink {
            return Ok(XattrTarget::Path(path));
        }
        // SAFETY: the path is NUL terminated; the descriptor is owned below.
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(last_error(format!("{}", inode.id())));
        }
        Ok(XattrTarget::File(unsafe { File::from_raw_fd(fd) }))
    }
}

impl LowerFs for HostLower {
    fn instance(&self) -> &Arc<FsInstance> {
        &self.instance
    }

    fn kind(&self) -> LowerKind {
        self.kind.clone()
    }

    fn source(&self) -> &Path {
        &self.source
    }

    fn root(&self) -> Result<Arc<LowerInode>> {
        Ok(Arc::clone(&self.root))
    }

    fn lookup(&self, dir: &LowerInode, name: &OsStr) -> Result<Arc<LowerInode>> {
        self.lookup_at(Self::fd(dir)?, name)
    }

    fn getattr(&self, inode: &LowerInode) -> Result<NodeAttr> {
        let st = stat_fd(Self::fd(inode)?)
            .map_err(|err| StackError::from_io(err, inode.id().to_string()))?;
        let attr = attr_from_stat(&st);
        inode.set_attr(attr);
        Ok(attr)
    }

    fn setattr(&self, inode: &LowerInode, changes: &SetAttr) -> Result<NodeAttr> {
        self.check_writable()?;
        let fd = Self::fd(inode)?;
        let path = proc_path(fd)?;
        let name = OsString::from(inode.id().to_string());
        let is_symlink = inode.kind() == NodeKind::Symlink;

        if let Some(mode) = changes.mode {
            if !is_symlink {
                // SAFETY: NUL terminated path.
                check(
                    unsafe { libc::chmod(path.as_ptr(), (mode & 0o7777) as libc::mode_t) },
                    &name,
                )?;
            }
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            let uid = changes.uid.unwrap_or(u32::MAX);
            let gid = changes.gid.unwrap_or(u32::MAX);
            // SAFETY: empty NUL terminated path with AT_EMPTY_PATH.
            check(
                unsafe {
                    libc::fchownat(
                        fd,
                        empty_path(),
                        uid,
                        gid,
                        libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
                    )
                },
                &name,
            )?;
        }
        if let Some(size) = changes.size {
            // SAFETY: NUL terminated path.
            check(
                unsafe { libc::truncate(path.as_ptr(), size as libc::off_t) },
                &name,
            )?;
        }
        if (changes.atime.is_some() || changes.mtime.is_some()) && !is_symlink {
            let times = [timespec(changes.atime), timespec(changes.mtime)];
            // SAFETY: NUL terminated path and a two-element timespec array.
            check(
                unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0) },
                &name,
            )?;
        }
        self.getattr(inode)
    }

    fn create(&self, dir: &LowerInode, name: &OsStr, mode: u32) -> Result<Arc<LowerInode>> {
        self.check_writable()?;
        let dirfd = Self::fd(dir)?;
        let c_name = check_name(name)?;
        // SAFETY: NUL terminated name; the descriptor is closed right away.
        let fd = unsafe {
            libc::openat(
                dirfd,
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY | libc::O_CLOEXEC,
                (mode & 0o7777) as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(last_error(name));
        }
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
        self.lookup_at(dirfd, name)
    }

    fn mkdir(&self, dir: &LowerInode, name: &OsStr, mode: u32) -> Result<Arc<LowerInode>> {
        self.check_writable()?;
        let dirfd = Self::fd(dir)?;
        let c_name = check_name(name)?;
        // SAFETY: NUL terminated name.
        check(
            unsafe { libc::mkdirat(dirfd, c_name.as_ptr(), (mode & 0o7777) as libc::mode_t) },
            name,
        )?;
        self.lookup_at(dirfd, name)
    }

    fn mknod(&self, dir: &LowerInode, name: &OsStr, mode: u32, rdev: u64) -> Result<Arc<LowerInode>> {
        self.check_writable()?;
        let dirfd = Self::fd(dir)?;
        let c_name = check_name(name)?;
        // SAFETY: NUL terminated name.
        check(
            unsafe {
                libc::mknodat(dirfd, c_name.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t)
            },
            name,
        )?;
        self.lookup_at(dirfd, name)
    }

    fn symlink(&self, dir: &LowerInode, name: &OsStr, target: &Path) -> Result<Arc<LowerInode>> {
        self.check_writable()?;
        let dirfd = Self::fd(dir)?;
        let c_name = check_name(name)?;
        let c_target = cstring(target.as_os_str())?;
        // SAFETY: both strings are NUL terminated.
        check(
            unsafe { libc::symlinkat(c_target.as_ptr(), dirfd, c_name.as_ptr()) },
            name,
        )?;
        self.lookup_at(dirfd, name)
    }

    fn link(&self, source: &LowerInode, dir: &LowerInode, name: &OsStr) -> Result<Arc<LowerInode>> {
        self.check_writable()?;
        let dirfd = Self::fd(dir)?;
        let c_name = check_name(name)?;
        let source_path = proc_path(Self::fd(source)?)?;
        // SAFETY: both strings are NUL terminated. Following is needed to
        // resolve the magic link.
        check(
            unsafe {
                libc::linkat(
                    libc::AT_FDCWD,
                    source_path.as_ptr(),
                    dirfd,
                    c_name.as_ptr(),
                    libc::AT_SYMLINK_FOLLOW,
                )
            },
            name,
        )?;
        self.lookup_at(dirfd, name)
    }

    fn unlink(&self, dir: &LowerInode, name: &OsStr) -> Result<()> {
        self.check_writable()?;
        let c_name = check_name(name)?;
        // SAFETY: NUL terminated name.
        check(unsafe { libc::unlinkat(Self::fd(dir)?, c_name.as_ptr(), 0) }, name)
    }

    fn rmdir(&self, dir: &LowerInode, name: &OsStr) -> Result<()> {
        self.check_writable()?;
        let c_name = check_name(name)?;
        // SAFETY: NUL terminated name.
        check(
            unsafe { libc::unlinkat(Self::fd(dir)?, c_name.as_ptr(), libc::AT_REMOVEDIR) },
            name,
        )
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
        let old_fd = Self::fd(old_dir)?;
        let new_fd = Self::fd(new_dir)?;
        let c_old = check_name(old_name)?;
        let c_new = check_name(new_name)?;
        let ret = if flags == 0 {
            // SAFETY: NUL terminated names.
            unsafe { libc::renameat(old_fd, c_old.as_ptr(), new_fd, c_new.as_ptr()) }
        } else {
            // SAFETY: NUL terminated names; renameat2 takes the same arguments
            // as renameat plus the flags word.
            unsafe {
                libc::syscall(
                    libc::SYS_renameat2,
                    old_fd,
                    c_old.as_ptr(),
                    new_fd,
                    c_new.as_ptr(),
                    flags,
                ) as libc::c_int
            }
        };
        check(ret, new_name)
    }

    fn readlink(&self, inode: &LowerInode) -> Result<PathBuf> {
        let fd = Self::fd(inode)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        // SAFETY: `buf` is writable for its full length.
        let len = unsafe {
            libc::readlinkat(fd, empty_path(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        if len < 0 {
            return Err(last_error(inode.id().to_string()));
        }
        buf.truncate(len as usize);
        Ok(PathBuf::from(OsString::from_vec(buf)))
    }

    fn readdir(&self, dir: &LowerInode) -> Result<Vec<DirEntry>> {
        let path = PathBuf::from(format!("/proc/self/fd/{}", Self::fd(dir)?));
        let name = OsString::from(dir.id().to_string());
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&path).map_err(|err| StackError::from_io(err, name.clone()))? {
            let entry = entry.map_err(|err| StackError::from_io(err, name.clone()))?;
            let kind = entry
                .file_type()
                .map(kind_of)
                .map_err(|err| StackError::from_io(err, entry.file_name()))?;
            entries.push(DirEntry {
                name: entry.file_name(),
                ino: entry.ino(),
                kind,
            });
        }
        Ok(entries)
    }

    fn open(&self, inode: &LowerInode, flags: OpenFlags) -> Result<Box<dyn LowerFile>> {
        if flags.is_writable() {
            self.check_writable()?;
        }
        if inode.kind().is_dir() {
            return Err(StackError::IsADirectory {
                name: OsString::from(inode.id().to_string()),
            });
        }
        let path = PathBuf::from(format!("/proc/self/fd/{}", Self::fd(inode)?));
        let passthrough = flags.bits()
            & !(libc::O_ACCMODE
                | libc::O_CREAT
                | libc::O_EXCL
                | libc::O_TRUNC
                | libc::O_APPEND
                | libc::O_NOFOLLOW);
        let file = std::fs::OpenOptions::new()
            .read(flags.is_readable())
            .write(flags.is_writable())
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.is_writable() && flags.contains(OpenFlags::TRUNCATE))
            .custom_flags(passthrough)
            .open(&path)
            .map_err(|err| StackError::from_io(err, inode.id().to_string()))?;
        Ok(Box::new(HostFile { file }))
    }

    fn statfs(&self, inode: &LowerInode) -> Result<StatFs> {
        let mut sfs: libc::statfs = unsafe { std::mem::zeroed() };
        // SAFETY: `sfs` is a valid out-pointer.
        check(
            unsafe { libc::fstatfs(Self::fd(inode)?, &mut sfs) },
            self.source.as_os_str(),
        )?;
        Ok(StatFs {
            fs_type: sfs.f_type as u64,
            blocks: sfs.f_blocks as u64,
            bfree: sfs.f_bfree as u64,
            bavail: sfs.f_bavail as u64,
            files: sfs.f_files as u64,
            ffree: sfs.f_ffree as u64,
            bsize: sfs.f_bsize as u32,
            namelen: sfs.f_namelen as u32,
            frsize: sfs.f_frsize as u32,
        })
    }

    fn getxattr(&self, inode: &LowerInode, name: &OsStr) -> Result<Vec<u8>> {
        let c_name = cstring(name)?;
        let target = Self::xattr_target(inode)?;
        let query = |buf: &mut [u8]| -> isize {
            let (ptr, len) = if buf.is_empty() {
                (std::ptr::null_mut(), 0)
            } else {
                (buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            // SAFETY: `ptr` is null with length 0 or valid for `len` bytes.
            unsafe {
                match &target {
                    XattrTarget::File(file) => {
                        libc::fgetxattr(file.as_raw_fd(), c_name.as_ptr(), ptr, len)
                    }
                    XattrTarget::Path(path) => {
                        libc::lgetxattr(path.as_ptr(), c_name.as_ptr(), ptr, len)
                    }
                }
            }
        };
        let size = query(&mut []);
        if size < 0 {
            return Err(last_error(name));
        }
        let mut value = vec![0u8; size as usize];
        let len = query(&mut value);
        if len < 0 {
            return Err(last_error(name));
        }
        value.truncate(len as usize);
        Ok(value)
    }

    fn setxattr(&self, inode: &LowerInode, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        self.check_writable()?;
        let c_name = cstring(name)?;
        let target = Self::xattr_target(inode)?;
        let ptr = value.as_ptr() as *const libc::c_void;
        // SAFETY: `value` is valid for `value.len()` bytes.
        let ret = unsafe {
            match &target {
                XattrTarget::File(file) => {
                    libc::fsetxattr(file.as_raw_fd(), c_name.as_ptr(), ptr, value.len(), flags)
                }
                XattrTarget::Path(path) => {
                    libc::lsetxattr(path.as_ptr(), c_name.as_ptr(), ptr, value.len(), flags)
                }
            }
        };
        check(ret, name)
    }

    fn listxattr(&self, inode: &LowerInode) -> Result<Vec<OsString>> {
        let target = Self::xattr_target(inode)?;
        let query = |buf: &mut [u8]| -> isize {
            let (ptr, len) = if buf.is_empty() {
                (std::ptr::null_mut(), 0)
            } else {
                (buf.as_mut_ptr() as *mut libc::c_char, buf.len())
            };
            // SAFETY: `ptr` is null with length 0 or valid for `len` bytes.
            unsafe {
                match &target {
                    XattrTarget::File(file) => libc::flistxattr(file.as_raw_fd(), ptr, len),
                    XattrTarget::Path(path) => libc::llistxattr(path.as_ptr(), ptr, len),
                }
            }
        };
        let name = inode.id().to_string();
        let size = query(&mut []);
        if size < 0 {
            return Err(last_error(name));
        }
        let mut raw = vec![0u8; size as usize];
        let len = query(&mut raw);
        if len < 0 {
            return Err(last_error(name));
        }
        raw.truncate(len as usize);
        Ok(raw
            .split(|b| *b == 0)
            .filter(|n| !n.is_empty())
            .map(|n| OsStr::from_bytes(n).to_os_string())
            .collect())
    }

    fn removexattr(&self, inode: &LowerInode, name: &OsStr) -> Result<()> {
        self.check_writable()?;
        let c_name = cstring(name)?;
        let target = Self::xattr_target(inode)?;
        // SAFETY: NUL terminated strings.
        let ret = unsafe {
            match &target {
                XattrTarget::File(file) => libc::fremovexattr(file.as_raw_fd(), c_name.as_ptr()),
                XattrTarget::Path(path) => libc::lremovexattr(path.as_ptr(), c_name.as_ptr()),
            }
        };
        check(ret, name)
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
        self.inodes
            .get(&NodeId::new(self.instance.dev(), ino))
            .and_then(|weak| weak.upgrade())
    }
}

struct HostFile {
    file: File,
}

impl LowerFile for HostFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        Ok(self.file.write_at(data, offset)?)
    }

    fn fsync(&self, datasync: bool) -> Result<()> {
        if datasync {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn ioctl(&self, cmd: u32, arg: u64) -> Result<u64> {
        let fd = self.file.as_raw_fd();
        match cmd {
            IOC_GETFLAGS => {
                let mut flags: libc::c_int = 0;
                // SAFETY: the kernel writes one int through the pointer.
                let ret = unsafe { libc::ioctl(fd, cmd as _, &mut flags as *mut libc::c_int) };
                check(ret, OsStr::new("ioctl"))?;
                Ok(flags as u32 as u64)
            }
            IOC_SETFLAGS => {
                let flags = arg as libc::c_int;
                // SAFETY: the kernel reads one int through the pointer.
                let ret = unsafe { libc::ioctl(fd, cmd as _, &flags as *const libc::c_int) };
                check(ret, OsStr::new("ioctl"))?;
                Ok(0)
            }
            _ => Err(StackError::NotSupported {
                operation: format!("ioctl {:#x}", cmd),
            }),
        }
    }

    fn supports_shared_writable_mapping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_open_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        let lower = HostLower::open_plain(dir.path()).unwrap();

        assert!(!lower.kind().is_overlay());
        let root = lower.root().unwrap();
        assert!(root.kind().is_dir());

        let file = lower.lookup(&root, OsStr::new("a.txt")).unwrap();
        assert_eq!(file.kind(), NodeKind::Regular);
        assert_eq!(lower.getattr(&file).unwrap().size, 3);
    }

    #[test]
    fn test_read_only_flag_from_statvfs() {
        let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
        assert!(!mounted_read_only(&vfs));
        vfs.f_flag = libc::ST_RDONLY | libc::ST_NOSUID;
        assert!(mounted_read_only(&vfs));
        vfs.f_flag = libc::ST_NOSUID;
        assert!(!mounted_read_only(&vfs));
    }

    #[test]
    fn test_writable_directory_accepts_creation() {
        let dir = tempfile::tempdir().unwrap();
        let lower = HostLower::open_plain(dir.path()).unwrap();
        let root = lower.root().unwrap();
        lower.create(&root, OsStr::new("new"), 0o644).unwrap();
        assert!(dir.path().join("new").exists());
    }

    #[test]
    fn test_lookup_returns_unique_inode() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"").unwrap();
        let lower = HostLower::open_plain(dir.path()).unwrap();
        let root = lower.root().unwrap();

        let a = lower.lookup(&root, OsStr::new("f")).unwrap();
        let b = lower.lookup(&root, OsStr::new("f")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(lower.inode_by_ino(a.ino()).is_some());
    }

    #[test]
    fn test_missing_directory_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let err = HostLower::open(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, StackError::UnsupportedLower { .. }));
    }

    #[test]
    fn test_namespace_operations() {
        let dir = tempfile::tempdir().unwrap();
        let lower = HostLower::open_plain(dir.path()).unwrap();
        let root = lower.root().unwrap();

        let sub = lower.mkdir(&root, OsStr::new("sub"), 0o755).unwrap();
        assert!(sub.kind().is_dir());
        let file = lower.create(&sub, OsStr::new("f"), 0o600).unwrap();
        assert_eq!(file.attr().perm(), 0o600);

        let link = lower.symlink(&sub, OsStr::new("l"), Path::new("f")).unwrap();
        assert_eq!(link.kind(), NodeKind::Symlink);
        assert_eq!(lower.readlink(&link).unwrap(), PathBuf::from("f"));

        lower
            .rename(&sub, OsStr::new("f"), &root, OsStr::new("moved"), 0)
            .unwrap();
        assert!(dir.path().join("moved").exists());

        let names: Vec<_> = lower
            .readdir(&sub)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![OsString::from("l")]);

        lower.unlink(&sub, OsStr::new("l")).unwrap();
        lower.rmdir(&root, OsStr::new("sub")).unwrap();
        assert!(!dir.path().join("sub").exists());
    }

    #[test]
    fn test_file_io_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let lower = HostLower::open_plain(dir.path()).unwrap();
        let root = lower.root().unwrap();
        let inode = lower.create(&root, OsStr::new("data"), 0o644).unwrap();

        let file = lower.open(&inode, OpenFlags::READ_WRITE).unwrap();
        assert_eq!(file.write_at(b"payload", 0).unwrap(), 7);
        let mut buf = [0u8; 16];
        let n = file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"payload");
        assert_eq!(file.size().unwrap(), 7);
        assert!(file.supports_shared_writable_mapping());
    }

    #[test]
    fn test_setattr_mode_and_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"0123456789").unwrap();
        let lower = HostLower::open_plain(dir.path()).unwrap();
        let root = lower.root().unwrap();
        let inode = lower.lookup(&root, OsStr::new("f")).unwrap();

        let changes = SetAttr {
            mode: Some(0o600),
            size: Some(4),
            ..Default::default()
        };
        let attr = lower.setattr(&inode, &changes).unwrap();
        assert_eq!(attr.perm(), 0o600);
        assert_eq!(attr.size, 4);
    }
}
