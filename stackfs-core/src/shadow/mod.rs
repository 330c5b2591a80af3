//! The adapter's own objects: shadow nodes, the identity cache that keeps
//! them unique, and shadow entries naming them.

pub mod attr;
pub mod cache;
pub mod entry;
pub mod node;

pub use cache::NodeCache;
pub use entry::ShadowEntry;
pub use node::{NodeOp, NodeOps, ShadowNode};
