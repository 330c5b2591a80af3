//! Kernel inode numbers for shadow nodes.
//!
//! The kernel addresses files by 64-bit inode number and tracks how many
//! lookups it holds on each. This table hands out one number per shadow node,
//! keeps the entry last seen for it and drops both once the kernel forgets
//! every lookup.

use std::collections::HashMap;
use std::sync::Arc;

use stackfs_core::{Result, ShadowEntry, ShadowNode, StackError};

/// Inode number of the mount root.
pub const ROOT_INO: u64 = 1;

struct Slot {
    entry: Arc<ShadowEntry>,
    node: Arc<ShadowNode>,
    lookups: u64,
}

pub struct InodeTable {
    slots: HashMap<u64, Slot>,
    by_serial: HashMap<u64, u64>,
    next_ino: u64,
}

impl InodeTable {
    pub fn new(root: Arc<ShadowEntry>) -> Result<Self> {
        let node = root
            .node()
            .ok_or_else(|| StackError::stale("root entry is negative"))?;
        let mut by_serial = HashMap::new();
        by_serial.insert(node.serial(), ROOT_INO);
        let mut slots = HashMap::new();
        slots.insert(
            ROOT_INO,
            Slot {
                entry: root,
                node,
                lookups: 1,
            },
        );
        Ok(Self {
            slots,
            by_serial,
            next_ino: ROOT_INO + 1,
        })
    }

    /// Records one kernel lookup of `entry` and returns its inode number.
    ///
    /// Returns `None` for a negative entry.
    pub fn remember(&mut self, entry: &Arc<ShadowEntry>) -> Option<u64> {
        let node = entry.node()?;
        if let Some(&ino) = self.by_serial.get(&node.serial()) {
            if let Some(slot) = self.slots.get_mut(&ino) {
                slot.entry = Arc::clone(entry);
                slot.lookups += 1;
                return Some(ino);
            }
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_serial.insert(node.serial(), ino);
        self.slots.insert(
            ino,
            Slot {
                entry: Arc::clone(entry),
                node,
                lookups: 1,
            },
        );
        Some(ino)
    }

    /// Points the inode of `entry`'s node at `entry`, without counting a
    /// lookup. Used after a rename moved the node to a new name.
    pub fn rebind(&mut self, entry: &Arc<ShadowEntry>) {
        let Some(node) = entry.node() else {
            return;
        };
        if let Some(slot) = self
            .by_serial
            .get(&node.serial())
            .and_then(|ino| self.slots.get_mut(ino))
        {
            slot.entry = Arc::clone(entry);
        }
    }

    /// The inode number already handed out for `node`, if any.
    pub fn ino_of(&self, node: &ShadowNode) -> Option<u64> {
        self.by_serial.get(&node.serial()).copied()
    }

    pub fn entry(&self, ino: u64) -> Result<&Arc<ShadowEntry>> {
        self.slots
            .get(&ino)
            .map(|slot| &slot.entry)
            .ok_or_else(|| StackError::stale(format!("unknown inode {}", ino)))
    }

    pub fn node(&self, ino: u64) -> Result<&Arc<ShadowNode>> {
        self.slots
            .get(&ino)
            .map(|slot| &slot.node)
            .ok_or_else(|| StackError::stale(format!("unknown inode {}", ino)))
    }

    /// Drops `count` kernel lookups. The root is never released.
    pub fn forget(&mut self, ino: u64, count: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(slot) = self.slots.get_mut(&ino) else {
            return;
        };
        slot.lookups = slot.lookups.saturating_sub(count);
        if slot.lookups == 0 {
            if let Some(slot) = self.slots.remove(&ino) {
                self.by_serial.remove(&slot.node.serial());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Releases every slot, root included.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_serial.clear();
    }
}
