//! Paged B+tree index for Quarry.
//!
//! This crate provides:
//! - Bit-exact node page layout with alignment-safe offset derivation
//! - Node lifecycle (create, load, unload, destroy) against the buffer pool
//! - A B+tree generic over fixed-size key and value types, with splits,
//!   merges, root growth and shrink
//! - Leaf-chain iteration in ascending key order
//!
//! Every node occupies exactly one pool page. A tree is identified by its
//! root page id, which the client stores externally and must re-persist
//! after operations that change it.

mod iter;
mod layout;
mod node;
mod tree;

pub use iter::BTreeIter;
pub use layout::{IndexKey, IndexValue, NodeHeader, NodeKind, NodeLayout};
pub use node::Node;
pub use tree::BTree;
