//! Creation of lower objects by kind.

use std::sync::Arc;

use crate::error::{Result, StackError};
use crate::lower::{LowerInode, LowerPath};
use crate::types::{CreateAttr, NodeKind};

/// Creates the object described by `attr` at the negative `target` under
/// `dir`, or a hard link to `hardlink` when one is given.
///
/// On success `target` is positive. A target that is already positive
/// fails with [`StackError::Stale`] before anything is created.
pub fn create_real(
    dir: &LowerPath,
    target: &LowerPath,
    attr: &CreateAttr,
    hardlink: Option<&LowerPath>,
) -> Result<()> {
    if target.is_positive() {
        return Err(StackError::stale(format!(
            "{} already exists",
            target.dentry().path().display()
        )));
    }
    let parent = dir
        .inode()
        .ok_or_else(|| StackError::not_found(dir.dentry().name()))?;
    let fs = dir.mnt();
    let name = target.dentry().name();
    let path = target.dentry().path();

    let created: Result<Arc<LowerInode>> = match hardlink {
        Some(source) => {
            let source_inode = source
                .inode()
                .ok_or_else(|| StackError::not_found(source.dentry().name()))?;
            let result = fs.link(&source_inode, &parent, name);
            tracing::debug!(
                "link({}, {}) = {:?}",
                source.dentry().path().display(),
                path.display(),
                result.as_ref().map(|_| ())
            );
            result
        }
        None => match attr.kind() {
            Some(NodeKind::Regular) => {
                let result = fs.create(&parent, name, attr.perm());
                tracing::debug!("create({}, {:#o}) = {:?}", path.display(), attr.mode, result.as_ref().map(|_| ()));
                result
            }
            Some(NodeKind::Directory) => {
                let result = fs.mkdir(&parent, name, attr.perm());
                tracing::debug!("mkdir({}, {:#o}) = {:?}", path.display(), attr.mode, result.as_ref().map(|_| ()));
                result
            }
            Some(NodeKind::Special(_)) => {
                let result = fs.mknod(&parent, name, attr.mode, attr.rdev);
                tracing::debug!(
                    "mknod({}, {:#o}, {:#x}) = {:?}",
                    path.display(),
                    attr.mode,
                    attr.rdev,
                    result.as_ref().map(|_| ())
                );
                result
            }
            Some(NodeKind::Symlink) => {
                let link = attr
                    .link
                    .as_deref()
                    .ok_or_else(|| StackError::invalid("symlink without a target"))?;
                let result = fs.symlink(&parent, name, link);
                tracing::debug!(
                    "symlink(\"{}\", {}) = {:?}",
                    link.display(),
                    path.display(),
                    result.as_ref().map(|_| ())
                );
                result
            }
            None => Err(StackError::NotPermitted {
                reason: format!("cannot create an object with mode {:#o}", attr.mode),
            }),
        },
    };

    let inode = created?;
    if !target.dentry().instantiate(inode) || target.dentry().is_negative() {
        tracing::warn!("{} is still negative after creation", path.display());
        return Err(StackError::not_found(name));
    }
    Ok(())
}
