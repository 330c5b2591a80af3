use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use crate::types::metadata::{NodeKind, S_IFMT};

/// `renameat2(2)` flag refusing to replace an existing target. It is the
/// only rename flag stackfs forwards.
pub const RENAME_NOREPLACE: u32 = 1;

/// Flags for opening a file. Access mode and creation bits use the host
/// `open(2)` values so they can be handed straight to the lower filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenFlags(i32);

impl OpenFlags {
    pub const READ: Self = Self(libc::O_RDONLY);
    pub const WRITE: Self = Self(libc::O_WRONLY);
    pub const READ_WRITE: Self = Self(libc::O_RDWR);
    pub const APPEND: Self = Self(libc::O_APPEND);
    pub const CREATE: Self = Self(libc::O_CREAT);
    pub const TRUNCATE: Self = Self(libc::O_TRUNC);
    pub const EXCLUSIVE: Self = Self(libc::O_EXCL);
    pub const DIRECTORY: Self = Self(libc::O_DIRECTORY);

    /// Creates flags from raw `open(2)` bits.
    pub const fn from_raw(bits: i32) -> Self {
        Self(bits)
    }

    /// Returns the raw value of the flags.
    pub const fn bits(&self) -> i32 {
        self.0
    }

    /// Returns true if all flags in `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn accmode(&self) -> i32 {
        self.0 & libc::O_ACCMODE
    }

    pub const fn is_writable(&self) -> bool {
        let mode = self.accmode();
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    pub const fn is_readable(&self) -> bool {
        let mode = self.accmode();
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Returns the union of the flags.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::READ
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Intent carried by a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LookupFlags(u32);

impl LookupFlags {
    /// Plain resolution.
    pub const NONE: Self = Self(0);
    /// The caller intends to create an object at this name.
    pub const CREATE: Self = Self(1 << 0);
    /// The caller intends to rename an object onto this name.
    pub const RENAME_TARGET: Self = Self(1 << 1);
    /// Resolution fails with `AlreadyExists` if the name is positive.
    pub const EXCLUSIVE: Self = Self(1 << 2);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the caller intends to populate the name it is resolving.
    pub const fn wants_negative(&self) -> bool {
        self.0 & (Self::CREATE.0 | Self::RENAME_TARGET.0) != 0
    }
}

impl std::ops::BitOr for LookupFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Attributes of an object to be created.
///
/// The kind is carried in the type bits of `mode`, exactly as `mknod(2)`
/// would receive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAttr {
    pub mode: u32,
    /// Device number for character and block devices
    pub rdev: u64,
    /// Target for symbolic links
    pub link: Option<PathBuf>,
}

impl CreateAttr {
    pub fn regular(perm: u32) -> Self {
        Self::with_kind(NodeKind::Regular, perm)
    }

    pub fn directory(perm: u32) -> Self {
        Self::with_kind(NodeKind::Directory, perm)
    }

    pub fn symlink(target: impl Into<PathBuf>) -> Self {
        Self {
            mode: NodeKind::Symlink.type_bits() | 0o777,
            rdev: 0,
            link: Some(target.into()),
        }
    }

    pub fn special(kind: NodeKind, perm: u32, rdev: u64) -> Self {
        Self {
            mode: kind.type_bits() | (perm & !S_IFMT),
            rdev,
            link: None,
        }
    }

    pub fn with_kind(kind: NodeKind, perm: u32) -> Self {
        Self::special(kind, perm, 0)
    }

    /// Builds attributes from a raw mode (type bits included).
    pub fn from_mode(mode: u32, rdev: u64) -> Self {
        Self {
            mode,
            rdev,
            link: None,
        }
    }

    pub fn kind(&self) -> Option<NodeKind> {
        NodeKind::from_mode(self.mode)
    }

    pub fn perm(&self) -> u32 {
        self.mode & !S_IFMT
    }
}

/// Flags accepted by remount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RemountFlags(u64);

impl RemountFlags {
    pub const READ_ONLY: Self = Self(libc::MS_RDONLY as u64);
    pub const MANDATORY_LOCK: Self = Self(libc::MS_MANDLOCK as u64);
    pub const SILENT: Self = Self(libc::MS_SILENT as u64);

    pub const fn from_raw(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bits outside the accepted set.
    pub const fn unsupported(&self) -> u64 {
        self.0 & !(Self::READ_ONLY.0 | Self::MANDATORY_LOCK.0 | Self::SILENT.0)
    }
}

impl std::ops::BitOr for RemountFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Opaque identifier used to resolve a node without a path (export handles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub ino: u64,
    pub generation: u64,
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ino, self.generation)
    }
}

/// One entry returned by readdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: NodeKind,
}
