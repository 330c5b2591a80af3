//! Counters describing what the adapter has been doing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

const OPERATION_KINDS: usize = 11;

/// Operations counted per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Lookup,
    Create,
    Link,
    Unlink,
    Rename,
    Open,
    Read,
    Write,
    ReadDir,
    SetAttr,
    Xattr,
}

impl OperationType {
    pub const ALL: [OperationType; OPERATION_KINDS] = [
        OperationType::Lookup,
        OperationType::Create,
        OperationType::Link,
        OperationType::Unlink,
        OperationType::Rename,
        OperationType::Open,
        OperationType::Read,
        OperationType::Write,
        OperationType::ReadDir,
        OperationType::SetAttr,
        OperationType::Xattr,
    ];

    /// Returns a human-readable name for the operation type.
    pub fn name(&self) -> &'static str {
        match self {
            OperationType::Lookup => "lookup",
            OperationType::Create => "create",
            OperationType::Link => "link",
            OperationType::Unlink => "unlink",
            OperationType::Rename => "rename",
            OperationType::Open => "open",
            OperationType::Read => "read",
            OperationType::Write => "write",
            OperationType::ReadDir => "readdir",
            OperationType::SetAttr => "setattr",
            OperationType::Xattr => "xattr",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Statistics for one mount.
#[derive(Debug, Default)]
pub struct AdapterStats {
    operations: [AtomicU64; OPERATION_KINDS],

    /// Lookups that found a lower object
    pub positive_lookups: AtomicU64,
    /// Lookups that produced a negative entry
    pub negative_lookups: AtomicU64,
    /// Lookups refused because the object lives on another instance
    pub cross_device: AtomicU64,

    /// Shadow nodes built by the identity cache
    pub nodes_created: AtomicU64,
    /// Identity cache lookups answered by an existing node
    pub node_cache_hits: AtomicU64,
    /// Shadow nodes torn down
    pub nodes_evicted: AtomicU64,

    /// Post-call attribute refreshes that failed and were skipped
    pub attr_refresh_failures: AtomicU64,

    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub open_handles: AtomicU64,
}

impl AdapterStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the count for a specific operation type.
    pub fn record(&self, op: OperationType) {
        self.operations[op.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_count(&self, op: OperationType) -> u64 {
        self.operations[op.index()].load(Ordering::Relaxed)
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn handle_opened(&self) {
        self.open_handles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handle_closed(&self) {
        self.open_handles.fetch_sub(1, Ordering::Relaxed);
    }

    /// Share of identity lookups served from the cache, 0.0 to 100.0.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.node_cache_hits.load(Ordering::Relaxed);
        let misses = self.nodes_created.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            operations: OperationType::ALL
                .iter()
                .map(|op| (op.name().to_string(), self.operation_count(*op)))
                .collect(),
            positive_lookups: load(&self.positive_lookups),
            negative_lookups: load(&self.negative_lookups),
            cross_device: load(&self.cross_device),
            nodes_created: load(&self.nodes_created),
            node_cache_hits: load(&self.node_cache_hits),
            nodes_evicted: load(&self.nodes_evicted),
            attr_refresh_failures: load(&self.attr_refresh_failures),
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
            open_handles: load(&self.open_handles),
            cache_hit_rate: self.cache_hit_rate(),
        }
    }
}

/// Serialisable copy of [`AdapterStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub operations: BTreeMap<String, u64>,
    pub positive_lookups: u64,
    pub negative_lookups: u64,
    pub cross_device: u64,
    pub nodes_created: u64,
    pub node_cache_hits: u64,
    pub nodes_evicted: u64,
    pub attr_refresh_failures: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub open_handles: u64,
    pub cache_hit_rate: f64,
}

impl StatsSnapshot {
    /// Shadow nodes currently alive according to the counters.
    pub fn live_nodes(&self) -> u64 {
        self.nodes_created.saturating_sub(self.nodes_evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_counts() {
        let stats = AdapterStats::new();
        stats.record(OperationType::Lookup);
        stats.record(OperationType::Lookup);
        stats.record(OperationType::Rename);

        assert_eq!(stats.operation_count(OperationType::Lookup), 2);
        assert_eq!(stats.operation_count(OperationType::Rename), 1);
        assert_eq!(stats.operation_count(OperationType::Write), 0);
    }

    #[test]
    fn test_cache_hit_rate() {
        let stats = AdapterStats::new();
        assert_eq!(stats.cache_hit_rate(), 0.0);

        AdapterStats::bump(&stats.nodes_created);
        AdapterStats::bump(&stats.node_cache_hits);
        AdapterStats::bump(&stats.node_cache_hits);
        AdapterStats::bump(&stats.node_cache_hits);
        assert_eq!(stats.cache_hit_rate(), 75.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = AdapterStats::new();
        stats.record(OperationType::Open);
        stats.add_bytes_read(128);
        AdapterStats::bump(&stats.nodes_created);
        AdapterStats::bump(&stats.nodes_created);
        AdapterStats::bump(&stats.nodes_evicted);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.operations["open"], 1);
        assert_eq!(snapshot.bytes_read, 128);
        assert_eq!(snapshot.live_nodes(), 1);

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: StatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
