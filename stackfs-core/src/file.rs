//! Open files.
//!
//! A [`FileHandle`] pairs a shadow node with the lower file opened for it.
//! Every call goes to the lower file; on success the node's cached
//! attributes are refreshed the way the call may have changed them.

use std::io::SeekFrom;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, StackError};
use crate::lower::{LowerFile, LowerFs};
use crate::shadow::attr::{copy_attr_all, copy_attr_atime, copy_size_and_times};
use crate::shadow::ShadowNode;
use crate::stats::{AdapterStats, OperationType};
use crate::types::OpenFlags;

/// An open shadow file.
pub struct FileHandle {
    // Declared first so the lower file closes before the node lets go of
    // its pin.
    lower: Box<dyn LowerFile>,
    node: Arc<ShadowNode>,
    fs: Arc<dyn LowerFs>,
    flags: OpenFlags,
    pos: Mutex<u64>,
    shared_writable_mapping: OnceLock<bool>,
    stats: Arc<AdapterStats>,
}

impl FileHandle {
    pub(crate) fn new(
        lower: Box<dyn LowerFile>,
        node: Arc<ShadowNode>,
        fs: Arc<dyn LowerFs>,
        flags: OpenFlags,
        stats: Arc<AdapterStats>,
    ) -> Self {
        stats.handle_opened();
        Self {
            lower,
            node,
            fs,
            flags,
            pos: Mutex::new(0),
            shared_writable_mapping: OnceLock::new(),
            stats,
        }
    }

    pub fn node(&self) -> &Arc<ShadowNode> {
        &self.node
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn position(&self) -> u64 {
        *self.pos.lock()
    }

    /// Reads at the current position and advances it.
    pub fn read(&self, size: usize) -> Result<Bytes> {
        let mut pos = self.pos.lock();
        let data = self.read_at(*pos, size)?;
        *pos += data.len() as u64;
        Ok(data)
    }

    /// Reads up to `size` bytes at `offset`. Short reads mark end of file.
    pub fn read_at(&self, offset: u64, size: usize) -> Result<Bytes> {
        self.stats.record(OperationType::Read);
        let mut buf = vec![0u8; size];
        let count = self.lower.read_at(&mut buf, offset)?;
        buf.truncate(count);
        self.stats.add_bytes_read(count as u64);
        copy_attr_atime(&self.node, self.fs.as_ref());
        Ok(Bytes::from(buf))
    }

    /// Writes at the current position, or at the end of file for handles
    /// opened with [`OpenFlags::APPEND`], and advances the position.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut pos = self.pos.lock();
        let offset = if self.flags.contains(OpenFlags::APPEND) {
            self.lower.size()?
        } else {
            *pos
        };
        let written = self.write_at(offset, data)?;
        *pos = offset + written as u64;
        Ok(written)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.stats.record(OperationType::Write);
        let max_bytes = self.fs.instance().max_bytes();
        if offset.saturating_add(data.len() as u64) > max_bytes {
            return Err(StackError::invalid(format!(
                "write past the {} byte limit",
                max_bytes
            )));
        }
        let written = self.lower.write_at(data, offset)?;
        self.stats.add_bytes_written(written as u64);
        copy_size_and_times(&self.node, self.fs.as_ref());
        Ok(written)
    }

    /// Moves the file position. Positions before the start of the file are
    /// refused.
    pub fn llseek(&self, whence: SeekFrom) -> Result<u64> {
        let mut pos = self.pos.lock();
        let (base, delta) = match whence {
            SeekFrom::Start(offset) => (0i128, offset as i128),
            SeekFrom::Current(delta) => (*pos as i128, delta as i128),
            SeekFrom::End(delta) => (self.lower.size()? as i128, delta as i128),
        };
        let target = base + delta;
        if target < 0 || target > u64::MAX as i128 {
            return Err(StackError::invalid(format!("seek to {}", target)));
        }
        *pos = target as u64;
        Ok(*pos)
    }

    pub fn fsync(&self, datasync: bool) -> Result<()> {
        self.lower.fsync(datasync)
    }

    pub fn flush(&self) -> Result<()> {
        self.lower.flush()
    }

    /// Forwards `cmd` to the lower file; every attribute is copied back
    /// afterwards since the command may have changed any of them.
    pub fn ioctl(&self, cmd: u32, arg: u64) -> Result<u64> {
        let result = self.lower.ioctl(cmd, arg)?;
        copy_attr_all(&self.node, self.fs.as_ref());
        Ok(result)
    }

    /// Checks whether the file can be mapped.
    ///
    /// A shared writable mapping needs a handle opened for writing and a
    /// lower file able to back it. The lower capability is probed once per
    /// handle.
    pub fn mmap(&self, shared: bool, writable: bool) -> Result<()> {
        if !(shared && writable) {
            return Ok(());
        }
        if !self.flags.is_writable() {
            return Err(StackError::NotPermitted {
                reason: "shared writable mapping of a file not open for writing".to_string(),
            });
        }
        let supported = *self
            .shared_writable_mapping
            .get_or_init(|| self.lower.supports_shared_writable_mapping());
        if !supported {
            return Err(StackError::invalid(format!(
                "lower node {} cannot back a shared writable mapping",
                self.node.lower_id()
            )));
        }
        Ok(())
    }

    /// Closes the handle.
    pub fn release(self) {
        tracing::trace!("release of node {}", self.node.serial());
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.stats.handle_closed();
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("node", &self.node.serial())
            .field("flags", &self.flags)
            .field("pos", &self.position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StackFs;
    use crate::lower::memory::MemoryLower;
    use crate::lower::IOC_SETFLAGS;
    use crate::types::{LookupFlags, MountOptions};
    use std::ffi::OsStr;

    fn open(fs: &Arc<MemoryLower>, name: &str, flags: OpenFlags) -> (StackFs, FileHandle) {
        let stack = StackFs::mount_lower(fs.clone(), MountOptions::default()).unwrap();
        let root = stack.root().unwrap();
        let entry = stack.lookup(&root, OsStr::new(name), LookupFlags::NONE).unwrap();
        let handle = stack.open(&entry, flags).unwrap();
        (stack, handle)
    }

    #[test]
    fn test_sequential_read() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/f", b"hello world", 0o644).unwrap();
        let (stack, handle) = open(&fs, "f", OpenFlags::READ);

        assert_eq!(&handle.read(5).unwrap()[..], b"hello");
        assert_eq!(&handle.read(100).unwrap()[..], b" world");
        assert!(handle.read(10).unwrap().is_empty());
        assert_eq!(stack.stats().snapshot().bytes_read, 11);
    }

    #[test]
    fn test_write_copies_size_back() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/f", b"", 0o644).unwrap();
        let (_stack, handle) = open(&fs, "f", OpenFlags::READ_WRITE);

        assert_eq!(handle.write(b"abcdef").unwrap(), 6);
        assert_eq!(handle.node().attr().size, 6);
        assert_eq!(handle.position(), 6);
        assert_eq!(&handle.read_at(2, 2).unwrap()[..], b"cd");
    }

    #[test]
    fn test_append_writes_at_end() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/log", b"one\n", 0o644).unwrap();
        let (_stack, handle) = open(&fs, "log", OpenFlags::WRITE | OpenFlags::APPEND);

        handle.write(b"two\n").unwrap();
        assert_eq!(handle.node().attr().size, 8);
        assert_eq!(handle.position(), 8);
    }

    #[test]
    fn test_llseek() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/f", b"0123456789", 0o644).unwrap();
        let (_stack, handle) = open(&fs, "f", OpenFlags::READ);

        assert_eq!(handle.llseek(SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(handle.llseek(SeekFrom::Current(2)).unwrap(), 6);
        assert_eq!(handle.llseek(SeekFrom::End(-1)).unwrap(), 9);
        assert_eq!(&handle.read(5).unwrap()[..], b"9");
        assert!(handle.llseek(SeekFrom::Current(-100)).is_err());
        assert_eq!(handle.position(), 10);
    }

    #[test]
    fn test_ioctl_refreshes_attributes() {
        let fs = MemoryLower::new("tmpfs");
        let lower = fs.add_file("/f", b"", 0o644).unwrap();
        let (_stack, handle) = open(&fs, "f", OpenFlags::READ);
        let old = std::time::SystemTime::UNIX_EPOCH;
        lower.update_attr(|attr| attr.ctime = old);
        handle.node().update_attr(|attr| attr.ctime = old);

        handle.ioctl(IOC_SETFLAGS, 0x10).unwrap();
        assert!(handle.node().attr().ctime > old);
        assert!(handle.ioctl(0xdead, 0).is_err());
    }

    #[test]
    fn test_shared_writable_mapping() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/f", b"", 0o644).unwrap();
        fs.set_shared_mmap(false);

        let (_stack, ro) = open(&fs, "f", OpenFlags::READ);
        assert!(ro.mmap(false, true).is_ok());
        assert!(matches!(ro.mmap(true, true), Err(StackError::NotPermitted { .. })));

        let (_stack, rw) = open(&fs, "f", OpenFlags::READ_WRITE);
        assert!(rw.mmap(true, false).is_ok());
        let err = rw.mmap(true, true).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_open_handle_accounting() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/f", b"", 0o644).unwrap();
        let (stack, handle) = open(&fs, "f", OpenFlags::READ);
        assert_eq!(stack.stats().snapshot().open_handles, 1);
        handle.release();
        assert_eq!(stack.stats().snapshot().open_handles, 0);
    }
}
