//! Identity cache: at most one live shadow node per lower node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::node::ShadowNode;
use crate::error::Result;
use crate::lower::{LowerInode, NodeId};
use crate::stats::AdapterStats;

/// Lower identity to `(serial, node)`. The serial lets a dying node remove
/// its own slot without clobbering a successor.
pub(crate) type NodeTable = DashMap<NodeId, (u64, Weak<ShadowNode>)>;

/// Serials below this are reserved for the frontend's root.
const FIRST_SERIAL: u64 = 2;

pub struct NodeCache {
    table: Arc<NodeTable>,
    next_serial: AtomicU64,
    stats: Arc<AdapterStats>,
}

impl NodeCache {
    pub fn new(stats: Arc<AdapterStats>) -> Self {
        Self {
            table: Arc::new(DashMap::new()),
            next_serial: AtomicU64::new(FIRST_SERIAL),
            stats,
        }
    }

    /// Returns the shadow node for `lower`, creating it if none is alive.
    ///
    /// The lower inode is pinned before the table is touched, so a node is
    /// never built over an inode that is being destroyed. Concurrent callers
    /// for the same lower node all receive the same `Arc`.
    pub fn find_or_create(&self, lower: &Arc<LowerInode>) -> Result<Arc<ShadowNode>> {
        let pin = lower.try_pin()?;

        let (node, spare_pin) = match self.table.entry(lower.id()) {
            Entry::Occupied(mut slot) => match slot.get().1.upgrade() {
                Some(node) if Arc::ptr_eq(node.lower(), lower) => (node, Some(pin)),
                stale => {
                    // The slot holds a dead node or one bound to an earlier
                    // incarnation of this identity; hand the stale one back so
                    // it is dropped after the shard lock is released.
                    let node = self.build(pin);
                    slot.insert((node.serial(), Arc::downgrade(&node)));
                    drop(slot);
                    drop(stale);
                    (node, None)
                }
            },
            Entry::Vacant(slot) => {
                let node = self.build(pin);
                slot.insert((node.serial(), Arc::downgrade(&node)));
                (node, None)
            }
        };

        if spare_pin.is_some() {
            AdapterStats::bump(&self.stats.node_cache_hits);
        }
        drop(spare_pin);
        Ok(node)
    }

    fn build(&self, pin: crate::lower::PinnedInode) -> Arc<ShadowNode> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        AdapterStats::bump(&self.stats.nodes_created);
        tracing::trace!("new shadow node {} for lower {}", serial, pin.id());
        Arc::new(ShadowNode::new(
            serial,
            pin,
            Arc::downgrade(&self.table),
            Arc::clone(&self.stats),
        ))
    }

    /// Returns the live node for `id` without creating one.
    pub fn get(&self, id: &NodeId) -> Option<Arc<ShadowNode>> {
        let weak = self.table.get(id).map(|slot| slot.1.clone())?;
        weak.upgrade()
    }

    /// Number of slots, including ones whose node is being torn down.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("slots", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackError;
    use crate::lower::memory::MemoryLower;
    use crate::lower::LowerFs;
    use std::ffi::OsStr;
    use std::thread;

    fn cache() -> (NodeCache, Arc<AdapterStats>) {
        let stats = Arc::new(AdapterStats::new());
        (NodeCache::new(Arc::clone(&stats)), stats)
    }

    #[test]
    fn test_same_lower_same_node() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/a", b"x", 0o644).unwrap();
        let root = fs.root().unwrap();
        let lower = fs.lookup(&root, OsStr::new("a")).unwrap();
        let (cache, stats) = cache();

        let a = cache.find_or_create(&lower).unwrap();
        let b = cache.find_or_create(&lower).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(lower.pin_count(), 1);
        assert_eq!(stats.snapshot().node_cache_hits, 1);
        assert_eq!(stats.snapshot().nodes_created, 1);
    }

    #[test]
    fn test_dropping_node_releases_pin_and_slot() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/a", b"x", 0o644).unwrap();
        let root = fs.root().unwrap();
        let lower = fs.lookup(&root, OsStr::new("a")).unwrap();
        let (cache, stats) = cache();

        let node = cache.find_or_create(&lower).unwrap();
        let serial = node.serial();
        assert_eq!(cache.len(), 1);
        drop(node);
        assert_eq!(cache.len(), 0);
        assert_eq!(lower.pin_count(), 0);
        assert_eq!(stats.snapshot().nodes_evicted, 1);

        let again = cache.find_or_create(&lower).unwrap();
        assert!(again.serial() > serial);
    }

    #[test]
    fn test_dying_lower_is_refused_without_a_slot() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/a", b"x", 0o644).unwrap();
        let root = fs.root().unwrap();
        let lower = fs.lookup(&root, OsStr::new("a")).unwrap();
        assert!(lower.mark_dying());
        let (cache, _) = cache();

        let err = cache.find_or_create(&lower).unwrap_err();
        assert!(matches!(err, StackError::Unavailable { .. }));
        assert!(cache.is_empty());
        assert_eq!(lower.pin_count(), 0);
    }

    #[test]
    fn test_concurrent_callers_share_one_node() {
        let fs = MemoryLower::new("tmpfs");
        fs.add_file("/shared", b"x", 0o644).unwrap();
        let root = fs.root().unwrap();
        let lower = fs.lookup(&root, OsStr::new("shared")).unwrap();
        let (cache, _) = cache();
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let lower = Arc::clone(&lower);
                thread::spawn(move || cache.find_or_create(&lower).unwrap())
            })
            .collect();
        let nodes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for node in &nodes[1..] {
            assert!(Arc::ptr_eq(&nodes[0], node));
        }
        assert_eq!(lower.pin_count(), 1);
        drop(nodes);
        assert_eq!(lower.pin_count(), 0);
    }
}
