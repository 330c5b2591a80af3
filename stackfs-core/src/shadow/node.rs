//! Shadow nodes and their per-kind operation sets.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::cache::NodeTable;
use super::entry::ShadowEntry;
use crate::error::{Result, StackError};
use crate::lower::{LowerInode, NodeId, PinnedInode};
use crate::stats::AdapterStats;
use crate::types::{NodeAttr, NodeKind, SpecialKind};

/// An operation a caller wants to run against a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOp {
    Open,
    Lookup,
    Create,
    ReadDir,
    ReadLink,
}

/// The operation set a node was initialised with, chosen by its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOps {
    Regular,
    Directory,
    Symlink,
    /// Devices, FIFOs and sockets carry their device number instead of
    /// going through the regular open path.
    Special { kind: SpecialKind, rdev: u64 },
}

impl NodeOps {
    pub fn for_kind(kind: NodeKind, rdev: u64) -> Self {
        match kind {
            NodeKind::Regular => NodeOps::Regular,
            NodeKind::Directory => NodeOps::Directory,
            NodeKind::Symlink => NodeOps::Symlink,
            NodeKind::Special(kind) => NodeOps::Special { kind, rdev },
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            NodeOps::Regular => NodeKind::Regular,
            NodeOps::Directory => NodeKind::Directory,
            NodeOps::Symlink => NodeKind::Symlink,
            NodeOps::Special { kind, .. } => NodeKind::Special(*kind),
        }
    }

    /// Fails unless this operation set provides `op`.
    pub fn check(&self, op: NodeOp) -> Result<()> {
        let supported = match (self, op) {
            (NodeOps::Directory, NodeOp::Lookup | NodeOp::Create | NodeOp::ReadDir) => true,
            (NodeOps::Directory, NodeOp::Open) => false,
            (NodeOps::Regular, NodeOp::Open) => true,
            (NodeOps::Symlink, NodeOp::ReadLink) => true,
            _ => false,
        };
        if supported {
            return Ok(());
        }
        let name = format!("{:?}", op).into();
        Err(match (self, op) {
            (NodeOps::Directory, NodeOp::Open) => StackError::IsADirectory { name },
            (_, NodeOp::Lookup | NodeOp::Create | NodeOp::ReadDir) => {
                StackError::NotADirectory { name }
            }
            (NodeOps::Special { .. }, NodeOp::Open) => StackError::NotSupported {
                operation: "open of a special node".to_string(),
            },
            _ => StackError::invalid(format!("{:?} on a {:?} node", op, self.kind())),
        })
    }
}

/// The adapter's node for one lower node.
///
/// Holds an explicit pin on the lower inode for its whole life; dropping the
/// node removes it from the identity cache and then releases the pin.
pub struct ShadowNode {
    serial: u64,
    ops: NodeOps,
    attr: RwLock<NodeAttr>,
    alias: Mutex<Weak<ShadowEntry>>,
    table: Weak<NodeTable>,
    stats: Arc<AdapterStats>,
    lower: PinnedInode,
}

impl ShadowNode {
    pub(crate) fn new(
        serial: u64,
        lower: PinnedInode,
        table: Weak<NodeTable>,
        stats: Arc<AdapterStats>,
    ) -> Self {
        let attr = lower.attr();
        let ops = NodeOps::for_kind(lower.kind(), attr.rdev);
        Self {
            serial,
            ops,
            attr: RwLock::new(attr),
            alias: Mutex::new(Weak::new()),
            table,
            stats,
            lower,
        }
    }

    /// Mount-unique number of this node; never reused.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn ops(&self) -> NodeOps {
        self.ops
    }

    pub fn kind(&self) -> NodeKind {
        self.ops.kind()
    }

    pub fn lower(&self) -> &Arc<LowerInode> {
        self.lower.inode()
    }

    pub fn lower_id(&self) -> NodeId {
        self.lower.id()
    }

    /// Snapshot of the cached attributes.
    pub fn attr(&self) -> NodeAttr {
        *self.attr.read()
    }

    pub(crate) fn update_attr(&self, f: impl FnOnce(&mut NodeAttr)) {
        f(&mut self.attr.write());
    }

    /// The entry currently naming this node, for directories.
    pub fn alias(&self) -> Option<Arc<ShadowEntry>> {
        self.alias.lock().upgrade()
    }

    pub(crate) fn set_alias(&self, entry: &Arc<ShadowEntry>) {
        *self.alias.lock() = Arc::downgrade(entry);
    }

    pub(crate) fn alias_slot(&self) -> &Mutex<Weak<ShadowEntry>> {
        &self.alias
    }

    pub(crate) fn stats(&self) -> &AdapterStats {
        &self.stats
    }
}

impl Drop for ShadowNode {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            let serial = self.serial;
            table.remove_if(&self.lower.id(), |_, (owner, _)| *owner == serial);
        }
        AdapterStats::bump(&self.stats.nodes_evicted);
        tracing::trace!("evicted node {} for lower {}", self.serial, self.lower.id());
    }
}

impl fmt::Debug for ShadowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowNode")
            .field("serial", &self.serial)
            .field("ops", &self.ops)
            .field("lower", &self.lower.id())
            .finish()
    }
}
