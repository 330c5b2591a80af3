//! `fuser` glue: kernel requests in, [`StackFs`] calls out.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyLseek,
    ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use stackfs_core::lower::LowerFs;
use stackfs_core::xattr::{encode_names, XattrReply};
use stackfs_core::{
    CreateAttr, FileHandle, NodeAttr, NodeKind, OpenFlags, Result, SetAttr, ShadowEntry,
    SpecialKind, StackError, StackFs,
};

use crate::inode::{InodeTable, ROOT_INO};

/// Mounts `fs` at `mountpoint` and serves it from a background thread until
/// the returned session is dropped.
pub fn mount(fs: StackFs, mountpoint: &Path) -> std::io::Result<BackgroundSession> {
    let options = fs.superblock().options();
    let source = fs.lower().source().display().to_string();
    let mut mount_options = vec![
        MountOption::FSName(source),
        MountOption::Subtype(options.adapter_name.clone()),
        MountOption::DefaultPermissions,
    ];
    if options.read_only {
        mount_options.push(MountOption::RO);
    }
    if options.allow_other {
        mount_options.push(MountOption::AllowOther);
    }
    let fuse = StackFuse::new(fs).map_err(std::io::Error::from)?;
    tracing::info!("serving {} at {}", fuse.fs.show_options(), mountpoint.display());
    fuser::spawn_mount2(fuse, mountpoint, &mount_options)
}

struct DirListing {
    entries: Vec<(u64, FileType, OsString)>,
}

/// A [`StackFs`] driven by the kernel through FUSE.
pub struct StackFuse {
    fs: StackFs,
    inodes: InodeTable,
    files: HashMap<u64, FileHandle>,
    dirs: HashMap<u64, DirListing>,
    next_fh: u64,
    ttl: Duration,
}

impl StackFuse {
    pub fn new(fs: StackFs) -> Result<Self> {
        let inodes = InodeTable::new(fs.root()?)?;
        let ttl = fs.superblock().options().attr_ttl;
        Ok(Self {
            fs,
            inodes,
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_fh: 1,
            ttl,
        })
    }

    fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    fn attr_of(&self, ino: u64) -> Result<FileAttr> {
        let node = self.inodes.node(ino)?;
        Ok(to_file_attr(ino, &node.attr(), node.kind()))
    }

    /// Turns a freshly resolved entry into a kernel entry reply.
    fn reply_entry(&mut self, entry: Result<Arc<ShadowEntry>>, reply: ReplyEntry) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => return reply.error(e.errno()),
        };
        let Some(ino) = self.inodes.remember(&entry) else {
            return reply.error(libc::ENOENT);
        };
        match self.attr_of(ino) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    /// Snapshots the directory `ino`. Nodes the kernel already knows are
    /// listed under their table number; the rest under their lower inode
    /// number, since listing a name does not count as a lookup.
    fn list_dir(&self, ino: u64) -> Result<DirListing> {
        let dir = self.inodes.entry(ino)?;
        let node = self.inodes.node(ino)?;
        let parent_ino = match dir.parent().and_then(|parent| parent.node()) {
            Some(parent) => self
                .inodes
                .ino_of(&parent)
                .unwrap_or_else(|| parent.lower().ino()),
            None => ino,
        };
        let mut entries = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent_ino, FileType::Directory, OsString::from("..")),
        ];
        for entry in self.fs.readdir(node)? {
            let known = dir
                .hashed_child(&entry.name)
                .and_then(|child| child.node())
                .filter(|child| child.lower().ino() == entry.ino)
                .and_then(|child| self.inodes.ino_of(&child));
            entries.push((
                known.unwrap_or(entry.ino),
                to_file_type(entry.kind),
                entry.name,
            ));
        }
        Ok(DirListing { entries })
    }

    fn file(&self, fh: u64) -> Result<&FileHandle> {
        self.files
            .get(&fh)
            .ok_or(StackError::BadHandle { handle: fh })
    }
}

fn to_file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Regular => FileType::RegularFile,
        NodeKind::Directory => FileType::Directory,
        NodeKind::Symlink => FileType::Symlink,
        NodeKind::Special(SpecialKind::CharDevice) => FileType::CharDevice,
        NodeKind::Special(SpecialKind::BlockDevice) => FileType::BlockDevice,
        NodeKind::Special(SpecialKind::Fifo) => FileType::NamedPipe,
        NodeKind::Special(SpecialKind::Socket) => FileType::Socket,
    }
}

fn to_file_attr(ino: u64, attr: &NodeAttr, kind: NodeKind) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: to_file_type(kind),
        perm: attr.perm() as u16,
        nlink: u32::try_from(attr.nlink).unwrap_or(u32::MAX),
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev as u32,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn resolve_time(time: Option<TimeOrNow>) -> Option<SystemTime> {
    time.map(|t| match t {
        TimeOrNow::SpecificTime(at) => at,
        TimeOrNow::Now => SystemTime::now(),
    })
}

fn to_seek(offset: i64, whence: i32) -> Result<SeekFrom> {
    match whence {
        libc::SEEK_SET => u64::try_from(offset)
            .map(SeekFrom::Start)
            .map_err(|_| StackError::invalid(format!("seek to {}", offset))),
        libc::SEEK_CUR => Ok(SeekFrom::Current(offset)),
        libc::SEEK_END => Ok(SeekFrom::End(offset)),
        other => Err(StackError::invalid(format!("whence {}", other))),
    }
}

/// Decodes the little-endian integer argument the kernel passes in
/// `in_data`.
fn ioctl_arg(in_data: &[u8]) -> u64 {
    in_data
        .iter()
        .take(8)
        .rev()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

/// Strips the creation flags that were already honored by `create`.
fn open_flags_after_create(flags: i32) -> OpenFlags {
    OpenFlags::from_raw(flags & !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC))
}

/// Writable handles whose lower file cannot back a shared writable mapping
/// bypass the page cache, so the kernel refuses to map them shared and
/// writable.
fn open_reply_flags(handle: &FileHandle) -> u32 {
    match handle.mmap(true, true) {
        Err(StackError::InvalidArgument { .. }) => fuser::consts::FOPEN_DIRECT_IO,
        _ => 0,
    }
}

fn apply_umask(mode: u32, umask: u32) -> u32 {
    mode & !(umask & 0o7777)
}

impl Filesystem for StackFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        let gran = self.fs.superblock().time_gran();
        if let Err(nearest) = config.set_time_granularity(gran) {
            tracing::debug!("time granularity {:?} not accepted, using {:?}", gran, nearest);
            let _ = config.set_time_granularity(nearest);
        }
        tracing::debug!("fuse session initialised");
        Ok(())
    }

    fn destroy(&mut self) {
        self.files.clear();
        self.dirs.clear();
        self.inodes.clear();
        self.fs.detach();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let dir = match self.inodes.entry(parent) {
            Ok(dir) => Arc::clone(dir),
            Err(e) => return reply.error(e.errno()),
        };
        let result = self.fs.lookup_existing(&dir, name);
        self.reply_entry(result, reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let result = self
            .inodes
            .node(ino)
            .and_then(|node| self.fs.getattr(node).map(|attr| to_file_attr(ino, &attr, node.kind())));
        match result {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: resolve_time(atime),
            mtime: resolve_time(mtime),
        };
        let result = self.inodes.node(ino).and_then(|node| {
            self.fs
                .setattr(node, &changes)
                .map(|attr| to_file_attr(ino, &attr, node.kind()))
        });
        match result {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.inodes.node(ino).and_then(|node| self.fs.readlink(node)) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.inodes.entry(parent).and_then(|dir| {
            self.fs
                .mknod(dir, name, apply_umask(mode, umask), u64::from(rdev))
        });
        self.reply_entry(result, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self
            .inodes
            .entry(parent)
            .and_then(|dir| self.fs.mkdir(dir, name, apply_umask(mode, umask) & 0o7777));
        self.reply_entry(result, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.inodes.entry(parent).and_then(|dir| self.fs.unlink(dir, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.inodes.entry(parent).and_then(|dir| self.fs.rmdir(dir, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let result = self
            .inodes
            .entry(parent)
            .and_then(|dir| self.fs.symlink(dir, name, link));
        self.reply_entry(result, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.inodes.entry(parent).and_then(|old_dir| {
            let new_dir = self.inodes.entry(newparent)?;
            self.fs.rename(old_dir, name, new_dir, newname, flags)
        });
        match result {
            Ok(moved) => {
                self.inodes.rebind(&moved);
                reply.ok()
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.inodes.entry(ino).and_then(|source| {
            let dir = self.inodes.entry(newparent)?;
            self.fs.link(source, dir, newname)
        });
        self.reply_entry(result, reply);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self
            .inodes
            .entry(ino)
            .and_then(|entry| self.fs.open(entry, OpenFlags::from_raw(flags)));
        match result {
            Ok(handle) => {
                let fh = self.alloc_fh();
                let open_flags = open_reply_flags(&handle);
                self.files.insert(fh, handle);
                reply.opened(fh, open_flags);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self
            .file(fh)
            .and_then(|file| file.read_at(offset.max(0) as u64, size as usize));
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self
            .file(fh)
            .and_then(|file| file.write_at(offset.max(0) as u64, data));
        match result {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.file(fh).and_then(|file| file.flush()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.files.remove(&fh) {
            handle.release();
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.file(fh).and_then(|file| file.fsync(datasync)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.list_dir(ino) {
            Ok(listing) => {
                let fh = self.alloc_fh();
                self.dirs.insert(fh, listing);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(listing) = self.dirs.get(&fh) else {
            return reply.error(libc::EBADF);
        };
        let start = usize::try_from(offset).unwrap_or(0);
        for (index, (ino, kind, name)) in listing.entries.iter().enumerate().skip(start) {
            if reply.add(*ino, (index + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dirs.remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self
            .inodes
            .node(ino)
            .and_then(|node| self.fs.setxattr(node, name, value, flags));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let result = self
            .inodes
            .node(ino)
            .and_then(|node| self.fs.getxattr(node, name))
            .and_then(|value| XattrReply::for_buffer(value, size));
        match result {
            Ok(XattrReply::Size(len)) => reply.size(len),
            Ok(XattrReply::Data(value)) => reply.data(&value),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self
            .inodes
            .node(ino)
            .and_then(|node| self.fs.listxattr(node))
            .and_then(|names| XattrReply::for_buffer(encode_names(&names), size));
        match result {
            Ok(XattrReply::Size(len)) => reply.size(len),
            Ok(XattrReply::Data(value)) => reply.data(&value),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.inodes.node(ino).and_then(|node| self.fs.removexattr(node, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match self.inodes.node(ino) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let attr = CreateAttr::regular(apply_umask(mode, umask) & 0o7777);
        let created = self.inodes.entry(parent).and_then(|dir| {
            let entry = self.fs.create(dir, name, &attr)?;
            let handle = self.fs.open(&entry, open_flags_after_create(flags))?;
            Ok((entry, handle))
        });
        let (entry, handle) = match created {
            Ok(created) => created,
            Err(e) => return reply.error(e.errno()),
        };
        let Some(ino) = self.inodes.remember(&entry) else {
            return reply.error(libc::ENOENT);
        };
        match self.attr_of(ino) {
            Ok(attr) => {
                let fh = self.alloc_fh();
                let open_flags = open_reply_flags(&handle);
                self.files.insert(fh, handle);
                reply.created(&self.ttl, &attr, 0, fh, open_flags);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn ioctl(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: u32,
        cmd: u32,
        in_data: &[u8],
        out_size: u32,
        reply: ReplyIoctl,
    ) {
        match self.file(fh).and_then(|file| file.ioctl(cmd, ioctl_arg(in_data))) {
            Ok(result) => {
                let bytes = result.to_le_bytes();
                let len = (out_size as usize).min(bytes.len());
                reply.ioctl(0, &bytes[..len]);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let result = to_seek(offset, whence)
            .and_then(|seek| self.file(fh).and_then(|file| file.llseek(seek)));
        match result {
            Ok(pos) => match i64::try_from(pos) {
                Ok(pos) => reply.offset(pos),
                Err(_) => reply.error(libc::EOVERFLOW),
            },
            Err(e) => reply.error(e.errno()),
        }
    }
}
