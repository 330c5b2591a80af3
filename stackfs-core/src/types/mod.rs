// Module declarations
pub mod metadata;
pub mod operations;
pub mod mount;
pub mod config;

// Re-export all types from submodules
pub use metadata::{NodeAttr, NodeKind, SetAttr, SpecialKind, StatFs};
pub use operations::{
    CreateAttr, DirEntry, FileId, LookupFlags, OpenFlags, RemountFlags, RENAME_NOREPLACE,
};
pub use mount::{MountOptions, MountOptionsBuilder, ADAPTER_NAME, WORK_DATADIR_NAME, WORK_METADIR_NAME};
pub use config::{LogLevel, StackConfig};
