//! Post-call attribute propagation from lower nodes to shadow nodes.
//!
//! These hooks run after the authoritative lower call has succeeded. A
//! failure to refresh is logged and counted, never returned. Cached times
//! are cut to the time granularity of the lower instance.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::lower::LowerFs;
use crate::stats::AdapterStats;
use crate::types::NodeAttr;

use super::node::ShadowNode;

fn truncate_time(time: SystemTime, gran: Duration) -> SystemTime {
    let step = gran.as_nanos();
    if step <= 1 {
        return time;
    }
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => {
            let kept = since.as_nanos() - since.as_nanos() % step;
            UNIX_EPOCH
                + Duration::new(
                    (kept / 1_000_000_000) as u64,
                    (kept % 1_000_000_000) as u32,
                )
        }
        Err(_) => time,
    }
}

fn refresh(node: &ShadowNode, fs: &dyn LowerFs, what: &str) -> Option<NodeAttr> {
    match fs.getattr(node.lower()) {
        Ok(mut attr) => {
            let gran = fs.instance().time_gran();
            attr.atime = truncate_time(attr.atime, gran);
            attr.mtime = truncate_time(attr.mtime, gran);
            attr.ctime = truncate_time(attr.ctime, gran);
            Some(attr)
        }
        Err(e) => {
            AdapterStats::bump(&node.stats().attr_refresh_failures);
            tracing::debug!(
                "skipping {} refresh of node {} from {}: {}",
                what,
                node.serial(),
                node.lower_id(),
                e
            );
            None
        }
    }
}

/// Copies every attribute of the lower node.
pub fn copy_attr_all(node: &ShadowNode, fs: &dyn LowerFs) {
    if let Some(fresh) = refresh(node, fs, "full") {
        node.update_attr(|attr| *attr = fresh);
    }
}

/// Copies access, modification and change times.
pub fn copy_attr_times(node: &ShadowNode, fs: &dyn LowerFs) {
    if let Some(fresh) = refresh(node, fs, "times") {
        node.update_attr(|attr| {
            attr.atime = fresh.atime;
            attr.mtime = fresh.mtime;
            attr.ctime = fresh.ctime;
        });
    }
}

pub fn copy_attr_atime(node: &ShadowNode, fs: &dyn LowerFs) {
    if let Some(fresh) = refresh(node, fs, "atime") {
        node.update_attr(|attr| attr.atime = fresh.atime);
    }
}

/// Copies size and block count together with the times, as after a write
/// or a namespace change in a directory.
pub fn copy_size_and_times(node: &ShadowNode, fs: &dyn LowerFs) {
    if let Some(fresh) = refresh(node, fs, "size") {
        node.update_attr(|attr| {
            attr.size = fresh.size;
            attr.blocks = fresh.blocks;
            attr.nlink = fresh.nlink;
            attr.atime = fresh.atime;
            attr.mtime = fresh.mtime;
            attr.ctime = fresh.ctime;
        });
    }
}
