//! Paged B+tree: search, insert with splits, delete with merges.

use crate::iter::BTreeIter;
use crate::layout::{IndexKey, IndexValue, NodeKind};
use crate::node::Node;
use quarry_buffer::BufferPool;
use quarry_common::{PageId, QuarryError, Result};
use std::marker::PhantomData;
use std::sync::Arc;

/// A split reported by a child to its parent: the new right sibling and
/// the minimum key of its subtree (the promoted key).
struct SplitInfo<K> {
    key: K,
    right: PageId,
}

/// What a recursive delete reports back to the parent.
struct RemoveOutcome<K, V> {
    /// The removed value.
    value: V,
    /// The node fell below its minimum occupancy.
    underfull: bool,
    /// The node's minimum key changed to this (absent when unchanged or
    /// when the node emptied out).
    new_min: Option<K>,
}

/// A B+tree of fixed-size keys and values, one node per pool page.
///
/// The tree's identity is its root page id: `root()` exposes the current
/// id and callers persist it externally, since inserts can grow a new root
/// and deletes can shrink one away. Durability is the pool's flush.
pub struct BTree<K, V> {
    pool: Arc<BufferPool>,
    root: PageId,
    _kv: PhantomData<fn() -> (K, V)>,
}

impl<K: IndexKey, V: IndexValue> BTree<K, V> {
    /// Creates a new tree with an empty leaf as the root.
    pub fn create(pool: Arc<BufferPool>) -> Result<Self> {
        let root = Node::<K, V>::create(pool.as_ref(), NodeKind::Leaf)?;
        let root_id = root.page_id();
        root.unload()?;
        Ok(Self {
            pool,
            root: root_id,
            _kv: PhantomData,
        })
    }

    /// Opens a tree rooted at a previously persisted page id.
    ///
    /// The root page is loaded once to verify it holds a node of this
    /// tree's key and value types.
    pub fn open(pool: Arc<BufferPool>, root: PageId) -> Result<Self> {
        let node = Node::<K, V>::load(pool.as_ref(), root)?;
        node.unload()?;
        Ok(Self {
            pool,
            root,
            _kv: PhantomData,
        })
    }

    /// Returns the current root page id.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Looks up the value stored for `key`.
    pub fn get(&self, key: &K) -> Result<V> {
        self.get_rec(self.root, key)
    }

    fn get_rec(&self, page: PageId, key: &K) -> Result<V> {
        let node = Node::<K, V>::load(self.pool.as_ref(), page)?;
        match node.kind() {
            NodeKind::Internal => {
                let child = node.child(node.internal_position(key));
                if !child.is_valid() {
                    node.unload()?;
                    return Err(QuarryError::KeyNotFound);
                }
                let result = self.get_rec(child, key);
                node.unload()?;
                result
            }
            NodeKind::Leaf => {
                let idx = node.leaf_position(key);
                if idx < node.num_elements() && node.key(idx) == *key {
                    let value = node.value(idx);
                    node.unload()?;
                    Ok(value)
                } else {
                    node.unload()?;
                    Err(QuarryError::KeyNotFound)
                }
            }
        }
    }

    /// Inserts `(key, value)`, overwriting the value if the key is already
    /// present. May replace the root when the current root splits.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        if let Some(split) = self.insert_rec(self.root, key, value)? {
            // Root growth: the only place tree height increases.
            let mut new_root = Node::<K, V>::create(self.pool.as_ref(), NodeKind::Internal)?;
            new_root.set_child(0, self.root);
            new_root.set_child(1, split.right);
            new_root.set_key(0, &split.key);
            new_root.set_num_elements(2);
            let new_root_id = new_root.page_id();
            new_root.unload()?;
            self.root = new_root_id;
        }
        Ok(())
    }

    fn insert_rec(&self, page: PageId, key: K, value: V) -> Result<Option<SplitInfo<K>>> {
        let mut node = Node::<K, V>::load(self.pool.as_ref(), page)?;
        match node.kind() {
            NodeKind::Leaf => {
                let idx = node.leaf_position(&key);
                if idx < node.num_elements() && node.key(idx) == key {
                    node.set_value(idx, &value);
                    node.unload()?;
                    return Ok(None);
                }
                if !node.is_full() {
                    node.leaf_insert_at(idx, &key, &value);
                    node.unload()?;
                    return Ok(None);
                }

                // Full leaf: split, then route the new entry by key.
                let mut sibling = Node::<K, V>::create(self.pool.as_ref(), NodeKind::Leaf)?;
                let promoted = split_leaf(&mut node, &mut sibling);
                if key < promoted {
                    let idx = node.leaf_position(&key);
                    node.leaf_insert_at(idx, &key, &value);
                } else {
                    let idx = sibling.leaf_position(&key);
                    sibling.leaf_insert_at(idx, &key, &value);
                }
                let right = sibling.page_id();
                sibling.unload()?;
                node.unload()?;
                Ok(Some(SplitInfo {
                    key: promoted,
                    right,
                }))
            }
            NodeKind::Internal => {
                let child_idx = node.internal_position(&key);
                let child = node.child(child_idx);
                if !child.is_valid() {
                    return Err(QuarryError::TreeCorrupted(
                        "internal node routed to an empty child slot".to_string(),
                    ));
                }

                let Some(split) = self.insert_rec(child, key, value)? else {
                    node.unload()?;
                    return Ok(None);
                };

                if !node.is_full() {
                    node.internal_insert_split(child_idx, &split.key, split.right);
                    node.unload()?;
                    return Ok(None);
                }

                // Full internal node: split it and record the child split
                // in whichever half now covers the promoted key.
                let mut sibling = Node::<K, V>::create(self.pool.as_ref(), NodeKind::Internal)?;
                let promoted = split_internal(&mut node, &mut sibling);
                if split.key < promoted {
                    let idx = node.internal_position(&split.key);
                    node.internal_insert_split(idx, &split.key, split.right);
                } else {
                    let idx = sibling.internal_position(&split.key);
                    sibling.internal_insert_split(idx, &split.key, split.right);
                }
                let right = sibling.page_id();
                sibling.unload()?;
                node.unload()?;
                Ok(Some(SplitInfo {
                    key: promoted,
                    right,
                }))
            }
        }
    }

    /// Removes `key`, returning its value.
    ///
    /// Underfull children are merged with a sibling on the way back up;
    /// a root reduced to a single child is replaced by that child.
    pub fn remove(&mut self, key: &K) -> Result<V> {
        let outcome = self.remove_rec(self.root, key)?;

        // Root shrink: the only place tree height decreases.
        loop {
            let root = Node::<K, V>::load(self.pool.as_ref(), self.root)?;
            if root.kind() == NodeKind::Internal && root.num_elements() == 1 {
                let child = root.child(0);
                root.destroy()?;
                self.root = child;
            } else {
                root.unload()?;
                break;
            }
        }

        Ok(outcome.value)
    }

    fn remove_rec(&self, page: PageId, key: &K) -> Result<RemoveOutcome<K, V>> {
        let mut node = Node::<K, V>::load(self.pool.as_ref(), page)?;
        match node.kind() {
            NodeKind::Leaf => {
                let idx = node.leaf_position(key);
                if idx >= node.num_elements() || node.key(idx) != *key {
                    node.unload()?;
                    return Err(QuarryError::KeyNotFound);
                }

                let value = node.value(idx);
                node.leaf_remove_at(idx);
                let remaining = node.num_elements();
                let new_min = if idx == 0 && remaining > 0 {
                    Some(node.key(0))
                } else {
                    None
                };
                let underfull = node.is_underfull();
                node.unload()?;
                Ok(RemoveOutcome {
                    value,
                    underfull,
                    new_min,
                })
            }
            NodeKind::Internal => {
                let child_idx = node.internal_position(key);
                let child = node.child(child_idx);
                if !child.is_valid() {
                    node.unload()?;
                    return Err(QuarryError::KeyNotFound);
                }

                let outcome = self.remove_rec(child, key)?;

                let mut new_min = None;
                if let Some(min) = outcome.new_min {
                    if child_idx >= 1 {
                        // The separator for this child tracks its minimum.
                        node.set_key(child_idx - 1, &min);
                    } else {
                        // Child 0 has no separator here; the change belongs
                        // to an ancestor.
                        new_min = Some(min);
                    }
                }

                if outcome.underfull && node.num_elements() >= 2 {
                    let n = node.num_elements();
                    let (left_idx, right_idx) = if child_idx + 1 < n {
                        (child_idx, child_idx + 1)
                    } else {
                        (child_idx - 1, child_idx)
                    };
                    if let Some(min) = self.merge_children(&mut node, left_idx, right_idx)? {
                        new_min = Some(min);
                    }
                }

                let underfull = node.is_underfull();
                node.unload()?;
                Ok(RemoveOutcome {
                    value: outcome.value,
                    underfull,
                    new_min,
                })
            }
        }
    }

    /// Merges `parent`'s children at `left_idx` and `right_idx` into the
    /// left one, unless their combined population would overflow a node.
    ///
    /// Returns the merged node's minimum key when the caller must carry a
    /// min-change further up (left child was empty at slot 0).
    fn merge_children(
        &self,
        parent: &mut Node<'_, K, V>,
        left_idx: usize,
        right_idx: usize,
    ) -> Result<Option<K>> {
        let mut left = Node::<K, V>::load(self.pool.as_ref(), parent.child(left_idx))?;
        let right = Node::<K, V>::load(self.pool.as_ref(), parent.child(right_idx))?;

        if left.kind() != right.kind() {
            return Err(QuarryError::TreeCorrupted(
                "sibling nodes of different kinds".to_string(),
            ));
        }
        if left.num_elements() + right.num_elements() > left.max_elements() {
            // Does not fit; leave the underfull node for a later merge.
            right.unload()?;
            left.unload()?;
            return Ok(None);
        }

        let mut propagate = None;
        match left.kind() {
            NodeKind::Leaf => {
                let left_was_empty = left.num_elements() == 0;
                let right_min = if right.num_elements() > 0 {
                    Some(right.key(0))
                } else {
                    None
                };
                left.append_leaf_entries(&right);
                left.set_next_leaf(right.next_leaf());
                if left_was_empty {
                    // The merged node's minimum is the absorbed sibling's.
                    if let Some(min) = right_min {
                        if left_idx >= 1 {
                            parent.set_key(left_idx - 1, &min);
                        } else {
                            propagate = Some(min);
                        }
                    }
                }
            }
            NodeKind::Internal => {
                // The parent separator bridges the two key arrays.
                let separator = parent.key(left_idx);
                left.append_internal_entries(&separator, &right);
            }
        }

        right.destroy()?;
        parent.internal_remove_child(right_idx);
        left.unload()?;
        Ok(propagate)
    }

    /// Returns an iterator over all entries in ascending key order.
    pub fn iter(&self) -> Result<BTreeIter<'_, K, V>> {
        BTreeIter::new(self.pool.as_ref(), self.root)
    }
}

/// Moves the upper half of a full leaf into the fresh `sibling`, links the
/// sibling into the leaf chain, and returns the promoted key.
fn split_leaf<K: IndexKey, V: IndexValue>(
    node: &mut Node<'_, K, V>,
    sibling: &mut Node<'_, K, V>,
) -> K {
    let n = node.num_elements();
    let mid = node.max_elements().div_ceil(2);
    let moved = n - mid;

    for idx in 0..moved {
        let key = node.key(mid + idx);
        let value = node.value(mid + idx);
        sibling.set_key(idx, &key);
        sibling.set_value(idx, &value);
    }
    sibling.set_num_elements(moved);

    sibling.set_next_leaf(node.next_leaf());
    node.set_next_leaf(sibling.page_id());
    node.set_num_elements(mid);

    sibling.key(0)
}

/// Moves the upper half of a full internal node into the fresh `sibling`
/// and returns the promoted key (the minimum of the sibling's subtree,
/// which leaves this node's key array rather than being copied).
fn split_internal<K: IndexKey, V: IndexValue>(
    node: &mut Node<'_, K, V>,
    sibling: &mut Node<'_, K, V>,
) -> K {
    let n = node.num_elements();
    let mid = node.max_elements().div_ceil(2);
    let moved = n - mid;

    let promoted = node.key(mid - 1);
    for idx in 0..moved {
        sibling.set_child(idx, node.child(mid + idx));
    }
    for idx in 0..moved - 1 {
        let key = node.key(mid + idx);
        sibling.set_key(idx, &key);
    }
    sibling.set_num_elements(moved);

    for idx in mid..n {
        node.set_child(idx, PageId::INVALID);
    }
    node.set_num_elements(mid);

    promoted
}
