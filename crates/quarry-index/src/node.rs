//! B+tree node lifecycle against the buffer pool.

use crate::layout::{read_slot, write_slot, IndexKey, IndexValue, NodeHeader, NodeKind, NodeLayout};
use quarry_buffer::{BufferPool, PageHandle};
use quarry_common::{PageId, QuarryError, Result};
use std::marker::PhantomData;
use std::mem::size_of;

/// A pinned B+tree node.
///
/// A node is created (fresh page allocated from the pool) or loaded
/// (existing page pinned), mutated only while pinned, and released through
/// `unload` (dirty-mark + unpin) or `destroy` (additionally returns the
/// page to the pool). Dropping a node without unloading it is the error
/// path: the drop marks dirty pages and unpins, so every early return
/// releases its pin.
pub struct Node<'p, K, V> {
    pool: &'p BufferPool,
    handle: PageHandle<'p>,
    kind: NodeKind,
    layout: NodeLayout,
    dirty: bool,
    defused: bool,
    _kv: PhantomData<fn() -> (K, V)>,
}

impl<'p, K: IndexKey, V: IndexValue> Node<'p, K, V> {
    /// Allocates and initializes a new empty node. The node is pinned on
    /// return.
    pub fn create(pool: &'p BufferPool, kind: NodeKind) -> Result<Self> {
        let elem_size = match kind {
            NodeKind::Internal => size_of::<u64>(),
            NodeKind::Leaf => size_of::<V>(),
        };
        let layout = NodeLayout::compute(pool.page_size(), size_of::<K>(), elem_size)?;

        let handle = pool.alloc()?;
        let header = NodeHeader {
            kind,
            max_elements: layout.max_elements as u32,
            num_elements: 0,
            key_size: layout.key_size as u32,
            elem_size: layout.elem_size as u32,
            key_start: layout.key_start as u32,
            elem_start: layout.elem_start as u32,
            next_leaf: PageId::INVALID,
        };
        {
            let mut data = handle.data_mut();
            data[..NodeHeader::SIZE].copy_from_slice(&header.to_bytes());
            // The page arrives zeroed; child slots additionally hold the
            // invalid-page sentinel.
            if kind == NodeKind::Internal {
                for idx in 0..layout.max_elements {
                    write_slot::<u64>(
                        &mut data,
                        layout.elem_offset(idx),
                        &PageId::INVALID.as_u64(),
                    );
                }
            }
        }

        Ok(Self {
            pool,
            handle,
            kind,
            layout,
            dirty: true,
            defused: false,
            _kv: PhantomData,
        })
    }

    /// Pins an existing page and reinterprets it as a node.
    ///
    /// The stored header must agree with the caller's key and value types
    /// and with the layout recomputed from them; any mismatch unpins the
    /// page and reports `CorruptedPage`.
    pub fn load(pool: &'p BufferPool, page_id: PageId) -> Result<Self> {
        let handle = pool.pin(page_id)?;
        match Self::validate(pool, &handle) {
            Ok((kind, layout)) => Ok(Self {
                pool,
                handle,
                kind,
                layout,
                dirty: false,
                defused: false,
                _kv: PhantomData,
            }),
            Err(e) => {
                let _ = pool.unpin(page_id);
                Err(e)
            }
        }
    }

    fn validate(pool: &BufferPool, handle: &PageHandle<'_>) -> Result<(NodeKind, NodeLayout)> {
        let page_id = handle.page_id();
        let corrupt = |reason: String| QuarryError::CorruptedPage { page_id, reason };

        let header = {
            let data = handle.data();
            NodeHeader::from_bytes(&data)
        }
        .ok_or_else(|| corrupt("unrecognized node kind".to_string()))?;

        let elem_size = match header.kind {
            NodeKind::Internal => size_of::<u64>(),
            NodeKind::Leaf => size_of::<V>(),
        };
        if header.key_size as usize != size_of::<K>() || header.elem_size as usize != elem_size {
            return Err(corrupt(format!(
                "key/element size mismatch: page has {}/{}, caller expects {}/{}",
                header.key_size,
                header.elem_size,
                size_of::<K>(),
                elem_size
            )));
        }

        let layout = NodeLayout::compute(pool.page_size(), size_of::<K>(), elem_size)?;
        if header.key_start as usize != layout.key_start
            || header.elem_start as usize != layout.elem_start
            || header.max_elements as usize != layout.max_elements
        {
            return Err(corrupt("stored layout does not match page size".to_string()));
        }
        if header.num_elements > header.max_elements {
            return Err(corrupt(format!(
                "element count {} exceeds capacity {}",
                header.num_elements, header.max_elements
            )));
        }

        Ok((header.kind, layout))
    }

    /// Marks the page dirty if mutated, then unpins it.
    pub fn unload(mut self) -> Result<()> {
        self.defused = true;
        let page_id = self.handle.page_id();
        if self.dirty {
            self.pool.set_page_dirty(page_id)?;
        }
        self.pool.unpin(page_id)
    }

    /// Unpins the page and returns it to the pool's free list.
    ///
    /// Used when a node has been merged away.
    pub fn destroy(mut self) -> Result<()> {
        self.defused = true;
        let page_id = self.handle.page_id();
        if self.dirty {
            self.pool.set_page_dirty(page_id)?;
        }
        self.pool.unpin(page_id)?;
        self.pool.release(page_id)
    }

    /// Returns the page backing this node.
    pub fn page_id(&self) -> PageId {
        self.handle.page_id()
    }

    /// Returns the node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Returns the capacity of this node.
    pub fn max_elements(&self) -> usize {
        self.layout.max_elements
    }

    /// Returns the current population.
    pub fn num_elements(&self) -> usize {
        let data = self.handle.data();
        read_slot::<u32>(&data, NodeHeader::NUM_ELEMENTS_OFFSET) as usize
    }

    pub(crate) fn set_num_elements(&mut self, n: usize) {
        {
            let mut data = self.handle.data_mut();
            write_slot::<u32>(&mut data, NodeHeader::NUM_ELEMENTS_OFFSET, &(n as u32));
        }
        self.dirty = true;
    }

    /// Returns true if no free slot remains.
    pub fn is_full(&self) -> bool {
        self.num_elements() == self.max_elements()
    }

    /// Minimum population before a node is considered underfull.
    pub fn min_occupancy(&self) -> usize {
        self.max_elements().div_ceil(2)
    }

    /// Returns true if the population is below the merge threshold.
    pub fn is_underfull(&self) -> bool {
        self.num_elements() < self.min_occupancy()
    }

    /// Reads key slot `idx`.
    pub fn key(&self, idx: usize) -> K {
        let data = self.handle.data();
        read_slot::<K>(&data, self.layout.key_offset(idx))
    }

    /// Writes key slot `idx`.
    pub fn set_key(&mut self, idx: usize, key: &K) {
        {
            let mut data = self.handle.data_mut();
            write_slot::<K>(&mut data, self.layout.key_offset(idx), key);
        }
        self.dirty = true;
    }

    /// Reads child slot `idx` (internal nodes).
    pub fn child(&self, idx: usize) -> PageId {
        let data = self.handle.data();
        PageId::from_u64(read_slot::<u64>(&data, self.layout.elem_offset(idx)))
    }

    /// Writes child slot `idx` (internal nodes).
    pub fn set_child(&mut self, idx: usize, page_id: PageId) {
        {
            let mut data = self.handle.data_mut();
            write_slot::<u64>(&mut data, self.layout.elem_offset(idx), &page_id.as_u64());
        }
        self.dirty = true;
    }

    /// Reads value slot `idx` (leaves).
    pub fn value(&self, idx: usize) -> V {
        let data = self.handle.data();
        read_slot::<V>(&data, self.layout.elem_offset(idx))
    }

    /// Writes value slot `idx` (leaves).
    pub fn set_value(&mut self, idx: usize, value: &V) {
        {
            let mut data = self.handle.data_mut();
            write_slot::<V>(&mut data, self.layout.elem_offset(idx), value);
        }
        self.dirty = true;
    }

    /// Returns the next leaf in the chain (leaves).
    pub fn next_leaf(&self) -> PageId {
        let data = self.handle.data();
        PageId::from_u64(read_slot::<u64>(&data, NodeHeader::NEXT_LEAF_OFFSET))
    }

    /// Sets the next leaf in the chain (leaves).
    pub fn set_next_leaf(&mut self, page_id: PageId) {
        {
            let mut data = self.handle.data_mut();
            write_slot::<u64>(&mut data, NodeHeader::NEXT_LEAF_OFFSET, &page_id.as_u64());
        }
        self.dirty = true;
    }

    /// Index of the child to descend into for `key` (internal nodes).
    ///
    /// Counts the separator keys not greater than `key`, stopping at the
    /// first unoccupied child slot.
    pub fn internal_position(&self, key: &K) -> usize {
        let n = self.num_elements();
        if n <= 1 {
            return 0;
        }
        let max = self.max_elements();
        let mut idx = 0;
        while idx < max - 1 && self.child(idx + 1).is_valid() && *key >= self.key(idx) {
            idx += 1;
        }
        idx
    }

    /// Leftmost index whose key is not less than `key` (leaves).
    ///
    /// Returns `num_elements` when every stored key is smaller.
    pub fn leaf_position(&self, key: &K) -> usize {
        let n = self.num_elements();
        let mut idx = 0;
        while idx < n && *key > self.key(idx) {
            idx += 1;
        }
        idx
    }

    /// Shifts entries at `idx..` right by one and stores `(key, value)`
    /// at `idx` (leaves). The caller ensures a free slot exists.
    pub fn leaf_insert_at(&mut self, idx: usize, key: &K, value: &V) {
        let n = self.num_elements();
        {
            let mut data = self.handle.data_mut();
            let key_at = self.layout.key_offset(idx);
            data.copy_within(key_at..self.layout.key_offset(n), key_at + self.layout.key_size);
            write_slot::<K>(&mut data, key_at, key);

            let elem_at = self.layout.elem_offset(idx);
            data.copy_within(
                elem_at..self.layout.elem_offset(n),
                elem_at + self.layout.elem_size,
            );
            write_slot::<V>(&mut data, elem_at, value);
        }
        self.set_num_elements(n + 1);
    }

    /// Removes the entry at `idx`, shifting the tail left (leaves).
    pub fn leaf_remove_at(&mut self, idx: usize) {
        let n = self.num_elements();
        {
            let mut data = self.handle.data_mut();
            let key_at = self.layout.key_offset(idx);
            data.copy_within(self.layout.key_offset(idx + 1)..self.layout.key_offset(n), key_at);

            let elem_at = self.layout.elem_offset(idx);
            data.copy_within(
                self.layout.elem_offset(idx + 1)..self.layout.elem_offset(n),
                elem_at,
            );
        }
        self.set_num_elements(n - 1);
    }

    /// Records a split of child `child_idx`: the separator `key` lands in
    /// key slot `child_idx` and `right` becomes child `child_idx + 1`
    /// (internal nodes). The caller ensures a free slot exists.
    pub fn internal_insert_split(&mut self, child_idx: usize, key: &K, right: PageId) {
        let n = self.num_elements();
        {
            let mut data = self.handle.data_mut();
            // n children carry n-1 live separator keys.
            let key_at = self.layout.key_offset(child_idx);
            data.copy_within(
                key_at..self.layout.key_offset(n - 1),
                key_at + self.layout.key_size,
            );
            write_slot::<K>(&mut data, key_at, key);

            let child_at = self.layout.elem_offset(child_idx + 1);
            data.copy_within(
                child_at..self.layout.elem_offset(n),
                child_at + self.layout.elem_size,
            );
            write_slot::<u64>(&mut data, child_at, &right.as_u64());
        }
        self.set_num_elements(n + 1);
    }

    /// Removes child `child_idx` and its separator key, shifting the tail
    /// left (internal nodes). The vacated child slot reverts to the
    /// invalid-page sentinel.
    pub fn internal_remove_child(&mut self, child_idx: usize) {
        let n = self.num_elements();
        {
            let mut data = self.handle.data_mut();
            if child_idx == 0 {
                // Child 0 has no separator of its own; the old keys[0] dies
                // with it.
                data.copy_within(
                    self.layout.key_offset(1)..self.layout.key_offset(n - 1),
                    self.layout.key_offset(0),
                );
                data.copy_within(
                    self.layout.elem_offset(1)..self.layout.elem_offset(n),
                    self.layout.elem_offset(0),
                );
            } else {
                data.copy_within(
                    self.layout.key_offset(child_idx)..self.layout.key_offset(n - 1),
                    self.layout.key_offset(child_idx - 1),
                );
                data.copy_within(
                    self.layout.elem_offset(child_idx + 1)..self.layout.elem_offset(n),
                    self.layout.elem_offset(child_idx),
                );
            }
            write_slot::<u64>(
                &mut data,
                self.layout.elem_offset(n - 1),
                &PageId::INVALID.as_u64(),
            );
        }
        self.set_num_elements(n - 1);
    }

    /// Appends every entry of `other` after this leaf's own entries.
    pub fn append_leaf_entries(&mut self, other: &Node<'p, K, V>) {
        let n = self.num_elements();
        let m = other.num_elements();
        for idx in 0..m {
            let key = other.key(idx);
            let value = other.value(idx);
            self.set_key(n + idx, &key);
            self.set_value(n + idx, &value);
        }
        self.set_num_elements(n + m);
    }

    /// Appends every child of `other` after this internal node's own,
    /// bridging the two key arrays with `separator` (the minimum key of
    /// `other`'s subtree, pulled down from the parent).
    pub fn append_internal_entries(&mut self, separator: &K, other: &Node<'p, K, V>) {
        let n = self.num_elements();
        let m = other.num_elements();
        self.set_key(n - 1, separator);
        for idx in 0..m {
            self.set_child(n + idx, other.child(idx));
        }
        for idx in 0..m.saturating_sub(1) {
            let key = other.key(idx);
            self.set_key(n + idx, &key);
        }
        self.set_num_elements(n + m);
    }
}

impl<K, V> Drop for Node<'_, K, V> {
    fn drop(&mut self) {
        if !self.defused {
            let page_id = self.handle.page_id();
            if self.dirty {
                let _ = self.pool.set_page_dirty(page_id);
            }
            let _ = self.pool.unpin(page_id);
        }
    }
}
