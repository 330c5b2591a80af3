//! Name resolution and interposition.

use std::ffi::OsStr;
use std::sync::Arc;

use crate::error::{Result, StackError};
use crate::lower::LowerPath;
use crate::shadow::attr::{copy_attr_atime, copy_attr_times};
use crate::shadow::{NodeOp, ShadowEntry};
use crate::stats::{AdapterStats, OperationType};
use crate::superblock::Superblock;
use crate::types::LookupFlags;

const NAME_MAX: usize = 255;

pub(crate) fn check_name(name: &OsStr) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX || name.as_encoded_bytes().contains(&b'/') {
        return Err(StackError::invalid(format!("bad name {:?}", name)));
    }
    Ok(())
}

impl Superblock {
    /// Resolves `name` in the directory `parent`.
    ///
    /// The lower tree is always consulted. The entry hashed under `name` is
    /// reused while it still names the same lower node; otherwise a fresh
    /// entry replaces it. A name missing from the lower tree is not an
    /// error: the result is a negative entry bound to a negative lower
    /// dentry, ready for creation.
    /// With [`LookupFlags::EXCLUSIVE`] a positive result fails with
    /// [`StackError::AlreadyExists`].
    pub fn lookup(
        &self,
        parent: &Arc<ShadowEntry>,
        name: &OsStr,
        flags: LookupFlags,
    ) -> Result<Arc<ShadowEntry>> {
        self.stats().record(OperationType::Lookup);
        if name == "." {
            return Ok(Arc::clone(parent));
        }
        if name == ".." {
            return Ok(parent.parent().cloned().unwrap_or_else(|| Arc::clone(parent)));
        }
        check_name(name)?;

        let dir_node = parent
            .node()
            .ok_or_else(|| StackError::not_found(parent.name()))?;
        dir_node.ops().check(NodeOp::Lookup)?;
        let parent_path = parent.lower_path()?;

        let result = match parent_path.lookup_one(name) {
            Ok(lower) => self.bind_positive(parent, name, lower),
            Err(StackError::NotFound { .. }) => {
                // Creation instantiates under the directory lock; recheck
                // under it so the negative binding cannot undo a new name.
                let dir_inode = parent_path
                    .inode()
                    .ok_or_else(|| StackError::not_found(parent.name()))?;
                let _locked = dir_inode.lock_dir();
                let resolved = match parent_path.lookup_one(name) {
                    Ok(lower) => self.bind_positive(parent, name, lower),
                    Err(StackError::NotFound { .. }) => {
                        let entry = match parent.hashed_child(name).filter(|e| e.is_negative()) {
                            Some(entry) => entry,
                            None => ShadowEntry::new(parent, name),
                        };
                        drop(entry.set_lower_path(parent_path.negative_child(name)));
                        AdapterStats::bump(&self.stats().negative_lookups);
                        Ok(entry)
                    }
                    Err(e) => Err(e),
                };
                resolved
            }
            Err(e) => Err(e),
        };

        let lower_fs = parent_path.mnt().as_ref();
        copy_attr_atime(&dir_node, lower_fs);
        let found = result?;
        if let Some(node) = found.node() {
            copy_attr_times(&node, lower_fs);
            if flags.contains(LookupFlags::EXCLUSIVE) {
                return Err(StackError::AlreadyExists {
                    name: name.to_os_string(),
                });
            }
        }
        tracing::trace!(
            "lookup({}) = {}",
            found.path().display(),
            if found.is_negative() { "negative" } else { "positive" }
        );
        Ok(found)
    }

    /// Reuses the entry hashed under `name` while it still names `lower`,
    /// otherwise interposes a fresh one.
    fn bind_positive(
        &self,
        parent: &Arc<ShadowEntry>,
        name: &OsStr,
        lower: LowerPath,
    ) -> Result<Arc<ShadowEntry>> {
        if let Some(entry) = parent
            .hashed_child(name)
            .filter(|entry| entry.still_resolves_to(&lower))
        {
            AdapterStats::bump(&self.stats().positive_lookups);
            return Ok(entry);
        }
        let entry = ShadowEntry::new(parent, name);
        let _ = entry.set_lower_path(lower.clone());
        match self.interpose(&entry, &lower) {
            Ok(found) => {
                if !Arc::ptr_eq(&found, &entry) {
                    // Directory reached through its existing alias.
                    entry.put_reset_lower_path();
                }
                AdapterStats::bump(&self.stats().positive_lookups);
                Ok(found)
            }
            Err(e) => {
                entry.put_reset_lower_path();
                Err(e)
            }
        }
    }

    /// Attaches a node for the positive `lower` to `entry`.
    ///
    /// Lower nodes from another filesystem instance are refused before any
    /// pin is taken.
    pub(crate) fn interpose(
        &self,
        entry: &Arc<ShadowEntry>,
        lower: &LowerPath,
    ) -> Result<Arc<ShadowEntry>> {
        let inode = lower
            .inode()
            .ok_or_else(|| StackError::stale(format!("{} is negative", lower.display())))?;
        if !inode.instance().is_same(self.instance()) {
            AdapterStats::bump(&self.stats().cross_device);
            tracing::debug!(
                "{} resolves into {} instance {}",
                lower.display(),
                inode.instance().fs_type(),
                inode.instance().id()
            );
            return Err(StackError::CrossDevice {
                name: entry.name().to_os_string(),
            });
        }
        let node = self.cache().find_or_create(&inode)?;
        Ok(entry.splice(node))
    }
}
