use std::time::{Duration, SystemTime};
use serde::{Deserialize, Serialize};

/// File type bits, in the layout used by `st_mode`.
pub const S_IFMT: u32 = libc::S_IFMT as u32;
pub const S_IFREG: u32 = libc::S_IFREG as u32;
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
pub const S_IFLNK: u32 = libc::S_IFLNK as u32;
pub const S_IFCHR: u32 = libc::S_IFCHR as u32;
pub const S_IFBLK: u32 = libc::S_IFBLK as u32;
pub const S_IFIFO: u32 = libc::S_IFIFO as u32;
pub const S_IFSOCK: u32 = libc::S_IFSOCK as u32;

/// The kinds of special node the lower tree may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialKind {
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

/// Represents the type of a filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Device, FIFO or socket
    Special(SpecialKind),
}

impl NodeKind {
    /// Derives the kind from the type bits of a mode.
    ///
    /// Returns `None` for a mode without recognised type bits.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(NodeKind::Regular),
            S_IFDIR => Some(NodeKind::Directory),
            S_IFLNK => Some(NodeKind::Symlink),
            S_IFCHR => Some(NodeKind::Special(SpecialKind::CharDevice)),
            S_IFBLK => Some(NodeKind::Special(SpecialKind::BlockDevice)),
            S_IFIFO => Some(NodeKind::Special(SpecialKind::Fifo)),
            S_IFSOCK => Some(NodeKind::Special(SpecialKind::Socket)),
            _ => None,
        }
    }

    /// Returns the type bits for this kind.
    pub fn type_bits(&self) -> u32 {
        match self {
            NodeKind::Regular => S_IFREG,
            NodeKind::Directory => S_IFDIR,
            NodeKind::Symlink => S_IFLNK,
            NodeKind::Special(SpecialKind::CharDevice) => S_IFCHR,
            NodeKind::Special(SpecialKind::BlockDevice) => S_IFBLK,
            NodeKind::Special(SpecialKind::Fifo) => S_IFIFO,
            NodeKind::Special(SpecialKind::Socket) => S_IFSOCK,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Directory)
    }
}

/// Cached POSIX metadata of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    /// Inode number on the owning filesystem
    pub ino: u64,
    /// Full mode, type bits included
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    /// Device number for special nodes
    pub rdev: u64,
    /// Size in bytes
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl NodeAttr {
    /// Creates attributes for a fresh node with all timestamps set to `now`.
    pub fn new(ino: u64, mode: u32, now: SystemTime) -> Self {
        Self {
            ino,
            mode,
            uid: 0,
            gid: 0,
            nlink: 1,
            rdev: 0,
            size: 0,
            blocks: 0,
            blksize: 4096,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// Returns zeroed attributes; timestamps sit at the epoch.
    pub fn empty() -> Self {
        Self::new(0, 0, SystemTime::UNIX_EPOCH)
    }

    pub fn kind(&self) -> Option<NodeKind> {
        NodeKind::from_mode(self.mode)
    }

    /// Permission bits without the type.
    pub fn perm(&self) -> u32 {
        self.mode & !S_IFMT
    }

    /// Number of 512-byte blocks needed for `size`.
    pub fn blocks_for(size: u64) -> u64 {
        size.div_ceil(512)
    }
}

/// Converts seconds/nanoseconds since the epoch into a `SystemTime`.
pub fn system_time_from(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs.clamp(0, 999_999_999) as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Filesystem usage figures as reported by statfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatFs {
    /// Filesystem type magic
    pub fs_type: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Attribute changes requested by setattr. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttr {
    /// Permission bits; type bits are ignored
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl SetAttr {
    pub fn mode(mode: u32) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == SetAttr::default()
    }
}
