//! Error types for the stackfs adapter.

use std::ffi::OsString;
use std::io;
use thiserror::Error;

/// Comprehensive error type for all stackfs operations.
#[derive(Debug, Error)]
pub enum StackError {
    /// Name does not resolve in the lower tree.
    #[error("Not found: {name:?}")]
    NotFound {
        name: OsString,
    },

    /// An entry expected to be negative is positive, or the reverse.
    #[error("Stale entry: {reason}")]
    Stale {
        reason: String,
    },

    /// The resolved lower node lives on a different filesystem instance.
    #[error("Cross-device reference: {name:?} is not on the lower filesystem instance")]
    CrossDevice {
        name: OsString,
    },

    /// Target already exists.
    #[error("Already exists: {name:?}")]
    AlreadyExists {
        name: OsString,
    },

    /// Allocation failed while building a cache object.
    #[error("Out of memory")]
    OutOfMemory,

    /// Operation not permitted, e.g. creation of an unsupported object kind.
    #[error("Operation not permitted: {reason}")]
    NotPermitted {
        reason: String,
    },

    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        reason: String,
    },

    /// The lower node could not be pinned because it is being destroyed.
    #[error("Lower node {ino} is being destroyed")]
    Unavailable {
        ino: u64,
    },

    /// The lower filesystem is unavailable or of an unsupported kind.
    #[error("Lower filesystem unavailable or unsupported: {reason}")]
    UnsupportedLower {
        reason: String,
    },

    /// Expected a directory.
    #[error("Not a directory: {name:?}")]
    NotADirectory {
        name: OsString,
    },

    /// Expected a non-directory.
    #[error("Is a directory: {name:?}")]
    IsADirectory {
        name: OsString,
    },

    /// Directory still has children.
    #[error("Directory not empty: {name:?}")]
    NotEmpty {
        name: OsString,
    },

    /// Extended attribute is not set.
    #[error("No such attribute: {name:?}")]
    NoData {
        name: OsString,
    },

    /// Feature not supported by the lower filesystem.
    #[error("Unsupported operation: {operation}")]
    NotSupported {
        operation: String,
    },

    /// The lower mount does not accept writes.
    #[error("Read-only filesystem")]
    ReadOnly,

    /// Caller's buffer cannot hold the value.
    #[error("Buffer too small: need {needed} bytes, got {given}")]
    BufferTooSmall {
        needed: usize,
        given: usize,
    },

    /// Unknown or stale file handle.
    #[error("Bad file handle: {handle}")]
    BadHandle {
        handle: u64,
    },

    /// I/O error from the underlying system.
    #[error("I/O error")]
    Io {
        #[from]
        #[source]
        source: io::Error,
    },
}

/// Result type alias for stackfs operations.
pub type Result<T> = std::result::Result<T, StackError>;

impl StackError {
    pub fn not_found(name: impl Into<OsString>) -> Self {
        StackError::NotFound { name: name.into() }
    }

    pub fn stale(reason: impl Into<String>) -> Self {
        StackError::Stale { reason: reason.into() }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        StackError::InvalidArgument { reason: reason.into() }
    }

    /// Converts a raw OS error into the taxonomy, keeping `name` for context.
    ///
    /// Errors without a dedicated variant are kept as [`StackError::Io`].
    pub fn from_io(err: io::Error, name: impl Into<OsString>) -> Self {
        let name = name.into();
        match err.raw_os_error() {
            Some(libc::ENOENT) => StackError::NotFound { name },
            Some(libc::EEXIST) => StackError::AlreadyExists { name },
            Some(libc::EXDEV) => StackError::CrossDevice { name },
            Some(libc::ENOMEM) => StackError::OutOfMemory,
            Some(libc::EPERM) => StackError::NotPermitted {
                reason: format!("{:?}: {}", name, err),
            },
            Some(libc::ESTALE) => StackError::Stale {
                reason: format!("{:?}: {}", name, err),
            },
            Some(libc::ENOTDIR) => StackError::NotADirectory { name },
            Some(libc::EISDIR) => StackError::IsADirectory { name },
            Some(libc::ENOTEMPTY) => StackError::NotEmpty { name },
            Some(libc::ENODATA) => StackError::NoData { name },
            Some(libc::EOPNOTSUPP) => StackError::NotSupported {
                operation: format!("{:?}", name),
            },
            Some(libc::EROFS) => StackError::ReadOnly,
            _ => StackError::Io { source: err },
        }
    }

    /// Returns the errno a kernel-facing frontend should report.
    pub fn errno(&self) -> i32 {
        match self {
            StackError::NotFound { .. } => libc::ENOENT,
            StackError::Stale { .. } => libc::ESTALE,
            StackError::CrossDevice { .. } => libc::EXDEV,
            StackError::AlreadyExists { .. } => libc::EEXIST,
            StackError::OutOfMemory => libc::ENOMEM,
            StackError::NotPermitted { .. } => libc::EPERM,
            StackError::InvalidArgument { .. } => libc::EINVAL,
            StackError::Unavailable { .. } => libc::ESTALE,
            StackError::UnsupportedLower { .. } => libc::EIO,
            StackError::NotADirectory { .. } => libc::ENOTDIR,
            StackError::IsADirectory { .. } => libc::EISDIR,
            StackError::NotEmpty { .. } => libc::ENOTEMPTY,
            StackError::NoData { .. } => libc::ENODATA,
            StackError::NotSupported { .. } => libc::EOPNOTSUPP,
            StackError::ReadOnly => libc::EROFS,
            StackError::BufferTooSmall { .. } => libc::ERANGE,
            StackError::BadHandle { .. } => libc::EBADF,
            StackError::Io { source } => source.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// True for the outcomes ACL stripping tolerates ("not set", "not supported").
    pub fn is_absent_attribute(&self) -> bool {
        matches!(self, StackError::NoData { .. } | StackError::NotSupported { .. })
    }
}

impl From<StackError> for io::Error {
    fn from(err: StackError) -> Self {
        match err {
            StackError::Io { source } => source,
            other => {
                let kind = io::Error::from_raw_os_error(other.errno()).kind();
                io::Error::new(kind, other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StackError::not_found("missing.txt");
        assert_eq!(err.to_string(), "Not found: \"missing.txt\"");

        let err = StackError::CrossDevice { name: "etc".into() };
        assert_eq!(
            err.to_string(),
            "Cross-device reference: \"etc\" is not on the lower filesystem instance"
        );

        let err = StackError::Unavailable { ino: 42 };
        assert_eq!(err.to_string(), "Lower node 42 is being destroyed");

        let err = StackError::stale("entry already positive");
        assert_eq!(err.to_string(), "Stale entry: entry already positive");
    }

    #[test]
    fn test_io_error_mapping() {
        let err = StackError::from_io(io::Error::from_raw_os_error(libc::ENOENT), "a");
        assert!(matches!(err, StackError::NotFound { .. }));

        let err = StackError::from_io(io::Error::from_raw_os_error(libc::EXDEV), "b");
        assert!(matches!(err, StackError::CrossDevice { .. }));

        let err = StackError::from_io(io::Error::from_raw_os_error(libc::ENODATA), "c");
        assert!(err.is_absent_attribute());

        let err = StackError::from_io(io::Error::from_raw_os_error(libc::EBUSY), "d");
        assert!(matches!(err, StackError::Io { .. }));
        assert_eq!(err.errno(), libc::EBUSY);
    }

    #[test]
    fn test_errno_roundtrip_for_taxonomy() {
        assert_eq!(StackError::not_found("x").errno(), libc::ENOENT);
        assert_eq!(StackError::stale("x").errno(), libc::ESTALE);
        assert_eq!(StackError::OutOfMemory.errno(), libc::ENOMEM);
        assert_eq!(
            StackError::UnsupportedLower { reason: "plain".into() }.errno(),
            libc::EIO
        );
        assert_eq!(StackError::invalid("flags").errno(), libc::EINVAL);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        let err: StackError = io_err.into();
        assert!(matches!(err, StackError::Io { .. }));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_into_io_error_keeps_kind() {
        let err: io::Error = StackError::not_found("gone").into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("gone"));

        let raw: io::Error = StackError::from(io::Error::from_raw_os_error(libc::EBUSY)).into();
        assert_eq!(raw.raw_os_error(), Some(libc::EBUSY));
    }
}
