//! Extended attribute forwarding.
//!
//! Names are dispatched through a small handler table keyed by namespace.
//! Every known namespace forwards to the lower node; names outside the table
//! are refused without reaching the lower filesystem.

use std::ffi::{OsStr, OsString};

use crate::error::{Result, StackError};
use crate::fs::StackFs;
use crate::shadow::attr::copy_attr_all;
use crate::shadow::ShadowNode;
use crate::stats::OperationType;

/// Namespaces the adapter forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrNamespace {
    PosixAclAccess,
    PosixAclDefault,
    Security,
    Trusted,
    User,
}

enum Match {
    Exact(&'static str),
    Prefix(&'static str),
}

struct XattrHandler {
    matches: Match,
    namespace: XattrNamespace,
}

const HANDLERS: &[XattrHandler] = &[
    XattrHandler {
        matches: Match::Exact("system.posix_acl_access"),
        namespace: XattrNamespace::PosixAclAccess,
    },
    XattrHandler {
        matches: Match::Exact("system.posix_acl_default"),
        namespace: XattrNamespace::PosixAclDefault,
    },
    XattrHandler {
        matches: Match::Prefix("security."),
        namespace: XattrNamespace::Security,
    },
    XattrHandler {
        matches: Match::Prefix("trusted."),
        namespace: XattrNamespace::Trusted,
    },
    XattrHandler {
        matches: Match::Prefix("user."),
        namespace: XattrNamespace::User,
    },
];

/// Finds the handler responsible for `name`.
pub fn namespace_of(name: &OsStr) -> Option<XattrNamespace> {
    let bytes = name.as_encoded_bytes();
    HANDLERS
        .iter()
        .find(|handler| match handler.matches {
            Match::Exact(exact) => bytes == exact.as_bytes(),
            Match::Prefix(prefix) => bytes.len() > prefix.len() && bytes.starts_with(prefix.as_bytes()),
        })
        .map(|handler| handler.namespace)
}

fn require_handler(name: &OsStr) -> Result<XattrNamespace> {
    namespace_of(name).ok_or_else(|| StackError::NotSupported {
        operation: format!("xattr {:?}", name),
    })
}

/// Answer to a size-probing xattr request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    /// The caller passed a zero-sized buffer and only wants the length.
    Size(u32),
    Data(Vec<u8>),
}

impl XattrReply {
    /// Fits `value` to a caller buffer of `size` bytes.
    pub fn for_buffer(value: Vec<u8>, size: u32) -> Result<Self> {
        if size == 0 {
            let len = u32::try_from(value.len()).map_err(|_| StackError::BufferTooSmall {
                needed: value.len(),
                given: u32::MAX as usize,
            })?;
            return Ok(XattrReply::Size(len));
        }
        if value.len() > size as usize {
            return Err(StackError::BufferTooSmall {
                needed: value.len(),
                given: size as usize,
            });
        }
        Ok(XattrReply::Data(value))
    }
}

/// Encodes names as the NUL-separated list `listxattr(2)` returns.
pub fn encode_names(names: &[OsString]) -> Vec<u8> {
    let mut out = Vec::with_capacity(names.iter().map(|n| n.len() + 1).sum());
    for name in names {
        out.extend_from_slice(name.as_encoded_bytes());
        out.push(0);
    }
    out
}

impl StackFs {
    pub fn getxattr(&self, node: &ShadowNode, name: &OsStr) -> Result<Vec<u8>> {
        self.stats().record(OperationType::Xattr);
        require_handler(name)?;
        self.lower().getxattr(node.lower(), name)
    }

    /// Sets `name` on the lower node and copies every attribute back.
    pub fn setxattr(&self, node: &ShadowNode, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        self.stats().record(OperationType::Xattr);
        self.check_writable()?;
        require_handler(name)?;
        self.lower().setxattr(node.lower(), name, value, flags)?;
        copy_attr_all(node, self.lower().as_ref());
        Ok(())
    }

    /// Lists the names a handler exists for.
    pub fn listxattr(&self, node: &ShadowNode) -> Result<Vec<OsString>> {
        self.stats().record(OperationType::Xattr);
        let names = self.lower().listxattr(node.lower())?;
        Ok(names
            .into_iter()
            .filter(|name| namespace_of(name).is_some())
            .collect())
    }

    pub fn removexattr(&self, node: &ShadowNode, name: &OsStr) -> Result<()> {
        self.stats().record(OperationType::Xattr);
        self.check_writable()?;
        require_handler(name)?;
        let result = self.lower().removexattr(node.lower(), name);
        tracing::debug!(
            "removexattr({}, {:?}) = {:?}",
            node.lower_id(),
            name,
            result.as_ref().map_err(|e| e.errno())
        );
        result?;
        copy_attr_all(node, self.lower().as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::memory::MemoryLower;
    use crate::lower::LowerFs;
    use crate::types::{LookupFlags, MountOptions};
    use std::time::{Duration, SystemTime};

    fn setup() -> (std::sync::Arc<MemoryLower>, StackFs) {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/f", b"", 0o644).unwrap();
        let stack = StackFs::mount_lower(fs.clone(), MountOptions::default()).unwrap();
        (fs, stack)
    }

    #[test]
    fn test_namespace_table() {
        assert_eq!(namespace_of(OsStr::new("user.comment")), Some(XattrNamespace::User));
        assert_eq!(namespace_of(OsStr::new("security.selinux")), Some(XattrNamespace::Security));
        assert_eq!(
            namespace_of(OsStr::new("system.posix_acl_default")),
            Some(XattrNamespace::PosixAclDefault)
        );
        assert_eq!(namespace_of(OsStr::new("system.other")), None);
        assert_eq!(namespace_of(OsStr::new("user.")), None);
    }

    #[test]
    fn test_set_get_and_remove() {
        let (_fs, stack) = setup();
        let root = stack.root().unwrap();
        let entry = stack.lookup(&root, OsStr::new("f"), LookupFlags::NONE).unwrap();
        let node = entry.node().unwrap();

        stack.setxattr(&node, OsStr::new("user.tag"), b"blue", 0).unwrap();
        assert_eq!(stack.getxattr(&node, OsStr::new("user.tag")).unwrap(), b"blue");

        stack.removexattr(&node, OsStr::new("user.tag")).unwrap();
        let err = stack.getxattr(&node, OsStr::new("user.tag")).unwrap_err();
        assert!(matches!(err, StackError::NoData { .. }));
    }

    #[test]
    fn test_unknown_namespace_refused() {
        let (_fs, stack) = setup();
        let root = stack.root().unwrap();
        let node = root.node().unwrap();

        let err = stack.setxattr(&node, OsStr::new("osx.finder"), b"x", 0).unwrap_err();
        assert!(matches!(err, StackError::NotSupported { .. }));
    }

    #[test]
    fn test_list_filters_unhandled_names() {
        let (fs, stack) = setup();
        let lower = fs.resolve("/f").unwrap();
        fs.setxattr(&lower, OsStr::new("user.a"), b"1", 0).unwrap();
        fs.setxattr(&lower, OsStr::new("weird.b"), b"2", 0).unwrap();

        let root = stack.root().unwrap();
        let node = stack
            .lookup(&root, OsStr::new("f"), LookupFlags::NONE)
            .unwrap()
            .node()
            .unwrap();
        let names = stack.listxattr(&node).unwrap();
        assert_eq!(names, vec![OsString::from("user.a")]);
        assert_eq!(encode_names(&names), b"user.a\0");
    }

    #[test]
    fn test_set_refreshes_ctime() {
        let (fs, stack) = setup();
        let lower = fs.resolve("/f").unwrap();
        let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1);
        lower.update_attr(|attr| attr.ctime = old);

        let root = stack.root().unwrap();
        let node = stack
            .lookup(&root, OsStr::new("f"), LookupFlags::NONE)
            .unwrap()
            .node()
            .unwrap();
        assert_eq!(node.attr().ctime, old);
        stack.setxattr(&node, OsStr::new("trusted.x"), b"v", 0).unwrap();
        assert!(node.attr().ctime > old);
    }

    #[test]
    fn test_reply_sizing() {
        assert_eq!(XattrReply::for_buffer(b"abc".to_vec(), 0).unwrap(), XattrReply::Size(3));
        assert_eq!(
            XattrReply::for_buffer(b"abc".to_vec(), 8).unwrap(),
            XattrReply::Data(b"abc".to_vec())
        );
        let err = XattrReply::for_buffer(b"abcdef".to_vec(), 2).unwrap_err();
        assert_eq!(err.errno(), libc::ERANGE);
    }
}
