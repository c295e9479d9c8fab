//! Leaf-chain iteration over a B+tree.

use crate::layout::{IndexKey, IndexValue, NodeKind};
use crate::node::Node;
use quarry_buffer::BufferPool;
use quarry_common::{PageId, Result};

/// Iterator over a tree's entries in ascending key order.
///
/// Construction descends to the leftmost leaf; advancing follows the leaf
/// chain, pinning one leaf at a time and unpinning each leaf before the
/// next one is loaded. Dropping the iterator mid-scan releases the
/// current pin.
pub struct BTreeIter<'p, K, V> {
    pool: &'p BufferPool,
    leaf: Option<Node<'p, K, V>>,
    index: usize,
}

impl<'p, K: IndexKey, V: IndexValue> BTreeIter<'p, K, V> {
    pub(crate) fn new(pool: &'p BufferPool, root: PageId) -> Result<Self> {
        let mut node = Node::<K, V>::load(pool, root)?;
        while node.kind() == NodeKind::Internal {
            let child = node.child(0);
            if !child.is_valid() {
                node.unload()?;
                return Ok(Self {
                    pool,
                    leaf: None,
                    index: 0,
                });
            }
            let next = Node::<K, V>::load(pool, child)?;
            node.unload()?;
            node = next;
        }
        Ok(Self {
            pool,
            leaf: Some(node),
            index: 0,
        })
    }

    /// Returns true if another entry remains.
    pub fn has_next(&self) -> bool {
        match &self.leaf {
            Some(leaf) => self.index < leaf.num_elements() || leaf.next_leaf().is_valid(),
            None => false,
        }
    }
}

impl<K: IndexKey, V: IndexValue> Iterator for BTreeIter<'_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.leaf.as_ref()?;
            if self.index < leaf.num_elements() {
                let key = leaf.key(self.index);
                let value = leaf.value(self.index);
                self.index += 1;
                return Some(Ok((key, value)));
            }

            let next = leaf.next_leaf();
            let exhausted = self.leaf.take()?;
            if let Err(e) = exhausted.unload() {
                return Some(Err(e));
            }
            if !next.is_valid() {
                return None;
            }
            match Node::<K, V>::load(self.pool, next) {
                Ok(node) => {
                    self.leaf = Some(node);
                    self.index = 0;
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
