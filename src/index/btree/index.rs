use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageId, Value};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{calculate_btree_order, deserialize_node, serialize_node};
use crate::storage::buffer::BufferPoolManager;

/// B+Tree index materialized in buffer-pool pages.
///
/// Nodes are addressed by page id only; split and merge propagation is
/// carried by the recursion, never by stored parent pointers. The tree
/// does not synchronize structural mutations internally: concurrent
/// writers must be serialized by the caller (the engine holds a tree
/// latch, consistent with the logical locks it acquires).
pub struct BTreeIndex<K> {
    buffer_pool: Arc<BufferPoolManager>,
    root_page_id: AtomicU64,
    order: usize,
    _phantom: PhantomData<K>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a new tree with a fresh root leaf.
    pub fn new(buffer_pool: Arc<BufferPoolManager>) -> Result<Self, BTreeError> {
        Self::with_order(buffer_pool, calculate_btree_order::<K>())
    }

    /// Create a new tree with an explicit order (tests use small orders
    /// to exercise splits and merges).
    pub fn with_order(buffer_pool: Arc<BufferPoolManager>, order: usize) -> Result<Self, BTreeError> {
        assert!(order >= 3, "B+Tree order must be at least 3");

        let (root_page, root_page_id) = buffer_pool.new_page()?;
        let root: BTreeNode<K> = BTreeNode::new_leaf();
        {
            let mut page_guard = root_page.write();
            serialize_node(&root, &mut page_guard)?;
        }
        buffer_pool.unpin_page(root_page_id, true)?;

        Ok(Self {
            buffer_pool,
            root_page_id: AtomicU64::new(root_page_id),
            order,
            _phantom: PhantomData,
        })
    }

    /// Open an existing tree rooted at the given page.
    pub fn open(buffer_pool: Arc<BufferPoolManager>, root_page_id: PageId) -> Self {
        Self::open_with_order(buffer_pool, root_page_id, calculate_btree_order::<K>())
    }

    pub fn open_with_order(
        buffer_pool: Arc<BufferPoolManager>,
        root_page_id: PageId,
        order: usize,
    ) -> Self {
        Self {
            buffer_pool,
            root_page_id: AtomicU64::new(root_page_id),
            order,
            _phantom: PhantomData,
        }
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Root-to-leaf descent; exact match in the leaf.
    pub fn search(&self, key: &K) -> Result<Option<Value>, BTreeError> {
        let mut current = self.root_page_id();

        loop {
            let node = self.load_node(current)?;
            if node.is_leaf {
                return Ok(node.get_value(key));
            }
            current = node.children[node.find_child_index(key)];
        }
    }

    /// Page id of the leaf that covers the key (used by the transaction
    /// layer when it stamps log records).
    pub fn locate_leaf(&self, key: &K) -> Result<PageId, BTreeError> {
        let mut current = self.root_page_id();

        loop {
            let node = self.load_node(current)?;
            if node.is_leaf {
                return Ok(current);
            }
            current = node.children[node.find_child_index(key)];
        }
    }

    /// Upsert. Returns the previous value when the key already existed.
    pub fn insert(&self, key: K, value: Value) -> Result<Option<Value>, BTreeError> {
        let root_id = self.root_page_id();
        let (split, replaced) = self.insert_recursive(root_id, key, value)?;

        if let Some((left_id, middle_key, right_id)) = split {
            // Root split: one level taller.
            let (new_root_page, new_root_id) = self.buffer_pool.new_page()?;
            let mut new_root: BTreeNode<K> = BTreeNode::new_internal();
            new_root.keys.push(middle_key);
            new_root.children.push(left_id);
            new_root.children.push(right_id);
            {
                let mut page_guard = new_root_page.write();
                serialize_node(&new_root, &mut page_guard)?;
            }
            self.buffer_pool.unpin_page(new_root_id, true)?;
            self.root_page_id.store(new_root_id, Ordering::SeqCst);
        }

        Ok(replaced)
    }

    /// Insert that refuses to overwrite.
    pub fn insert_unique(&self, key: K, value: Value) -> Result<(), BTreeError> {
        if self.search(&key)?.is_some() {
            return Err(BTreeError::DuplicateKey);
        }
        self.insert(key, value)?;
        Ok(())
    }

    /// Remove a key, rebalancing underflowing nodes by borrowing from a
    /// sibling or merging with one. Returns the removed value.
    pub fn delete(&self, key: &K) -> Result<Value, BTreeError> {
        let root_id = self.root_page_id();
        let (removed, _) = self.delete_recursive(root_id, key)?;

        // An internal root left without keys has a single child: the tree
        // shrinks by one level.
        let root = self.load_node(root_id)?;
        if !root.is_leaf && root.keys.is_empty() {
            let new_root = root.children[0];
            self.root_page_id.store(new_root, Ordering::SeqCst);
            self.buffer_pool.delete_page(root_id)?;
        }

        Ok(removed)
    }

    /// Lazy ascending iterator over all (key, value) pairs.
    ///
    /// The iterator walks the leaf chain and is NOT stable across
    /// concurrent structural mutation; callers serialize externally.
    pub fn iter(&self) -> Result<BTreeIter<K>, BTreeError> {
        let mut current = self.root_page_id();

        loop {
            let node = self.load_node(current)?;
            if node.is_leaf {
                return Ok(BTreeIter {
                    buffer_pool: self.buffer_pool.clone(),
                    current_leaf: Some(current),
                    pos: 0,
                    _phantom: PhantomData,
                });
            }
            current = node.children[0];
        }
    }

    /// Number of levels from root to leaf.
    pub fn height(&self) -> Result<usize, BTreeError> {
        let mut current = self.root_page_id();
        let mut height = 1;

        loop {
            let node = self.load_node(current)?;
            if node.is_leaf {
                return Ok(height);
            }
            height += 1;
            current = node.children[0];
        }
    }

    /// Check the structural invariants: strict key ordering, key-count
    /// bounds on every non-root node, subtree key-range containment, and
    /// uniform leaf depth. Intended for tests, not the hot path.
    pub fn validate(&self) -> Result<(), BTreeError> {
        let root_id = self.root_page_id();
        self.validate_node(root_id, None, None, true)?;
        Ok(())
    }

    fn validate_node(
        &self,
        page_id: PageId,
        low: Option<&K>,
        high: Option<&K>,
        is_root: bool,
    ) -> Result<usize, BTreeError> {
        let node = self.load_node(page_id)?;

        for pair in node.keys.windows(2) {
            if pair[0] >= pair[1] {
                return Err(BTreeError::InvariantViolation(format!(
                    "keys out of order in page {}",
                    page_id
                )));
            }
        }

        if node.keys.len() > self.order - 1 {
            return Err(BTreeError::InvariantViolation(format!(
                "page {} holds {} keys, max {}",
                page_id,
                node.keys.len(),
                self.order - 1
            )));
        }
        if !is_root && node.is_underflow(self.order) {
            return Err(BTreeError::InvariantViolation(format!(
                "page {} underflows with {} keys",
                page_id,
                node.keys.len()
            )));
        }

        for key in &node.keys {
            if let Some(lo) = low {
                if key < lo {
                    return Err(BTreeError::InvariantViolation(format!(
                        "key below subtree range in page {}",
                        page_id
                    )));
                }
            }
            if let Some(hi) = high {
                if key >= hi {
                    return Err(BTreeError::InvariantViolation(format!(
                        "key above subtree range in page {}",
                        page_id
                    )));
                }
            }
        }

        if node.is_leaf {
            return Ok(1);
        }

        if node.children.len() != node.keys.len() + 1 {
            return Err(BTreeError::InvariantViolation(format!(
                "page {} has {} keys but {} children",
                page_id,
                node.keys.len(),
                node.children.len()
            )));
        }

        let mut depth = None;
        for (i, &child) in node.children.iter().enumerate() {
            let child_low = if i == 0 { low } else { Some(&node.keys[i - 1]) };
            let child_high = if i == node.keys.len() {
                high
            } else {
                Some(&node.keys[i])
            };
            let child_depth = self.validate_node(child, child_low, child_high, false)?;
            match depth {
                None => depth = Some(child_depth),
                Some(d) if d != child_depth => {
                    return Err(BTreeError::InvariantViolation(
                        "leaves at differing depths".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(depth.unwrap_or(0) + 1)
    }

    // ---- internal helpers ----

    fn load_node(&self, page_id: PageId) -> Result<BTreeNode<K>, BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        let result = {
            let page_guard = page.read();
            deserialize_node::<K>(&page_guard)
        };
        self.buffer_pool.unpin_page(page_id, false)?;

        let node = result?;
        if !node.is_leaf && node.children.len() != node.keys.len() + 1 {
            // An uninitialized or torn page; never descend into it.
            return Err(BTreeError::InvalidPageFormat);
        }
        Ok(node)
    }

    fn store_node(&self, page_id: PageId, node: &BTreeNode<K>) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        let result = {
            let mut page_guard = page.write();
            serialize_node(node, &mut page_guard)
        };
        self.buffer_pool.unpin_page(page_id, true)?;
        result
    }

    /// Recursive insert. Returns split information (left page, promoted
    /// key, right page) when this node split, plus the replaced value.
    #[allow(clippy::type_complexity)]
    fn insert_recursive(
        &self,
        page_id: PageId,
        key: K,
        value: Value,
    ) -> Result<(Option<(PageId, K, PageId)>, Option<Value>), BTreeError> {
        let mut node = self.load_node(page_id)?;

        if node.is_leaf {
            let (replaced, needs_split) = node.insert_into_leaf(key, value, self.order);

            let split = if needs_split {
                let (new_node, promotion_key) = node.split_leaf();
                let (new_page, new_page_id) = self.buffer_pool.new_page()?;
                node.next_leaf = Some(new_page_id);
                {
                    let mut page_guard = new_page.write();
                    serialize_node(&new_node, &mut page_guard)?;
                }
                self.buffer_pool.unpin_page(new_page_id, true)?;
                Some((page_id, promotion_key, new_page_id))
            } else {
                None
            };

            self.store_node(page_id, &node)?;
            return Ok((split, replaced));
        }

        let child_index = node.find_child_index(&key);
        let child_id = node.children[child_index];
        let (child_split, replaced) = self.insert_recursive(child_id, key, value)?;

        let split = if let Some((_, middle_key, right_id)) = child_split {
            let needs_split = node.insert_into_internal(middle_key, right_id, self.order);
            if needs_split {
                let (new_node, promotion_key) = node.split_internal();
                let (new_page, new_page_id) = self.buffer_pool.new_page()?;
                {
                    let mut page_guard = new_page.write();
                    serialize_node(&new_node, &mut page_guard)?;
                }
                self.buffer_pool.unpin_page(new_page_id, true)?;
                Some((page_id, promotion_key, new_page_id))
            } else {
                None
            }
        } else {
            None
        };

        self.store_node(page_id, &node)?;
        Ok((split, replaced))
    }

    /// Recursive delete. Returns the removed value and whether this node
    /// underflowed (the parent repairs it).
    fn delete_recursive(&self, page_id: PageId, key: &K) -> Result<(Value, bool), BTreeError> {
        let mut node = self.load_node(page_id)?;

        if node.is_leaf {
            let removed = match node.remove_from_leaf(key) {
                Some(v) => v,
                None => return Err(BTreeError::KeyNotFound),
            };
            self.store_node(page_id, &node)?;
            return Ok((removed, node.is_underflow(self.order)));
        }

        let child_index = node.find_child_index(key);
        let child_id = node.children[child_index];
        let (removed, child_underflow) = self.delete_recursive(child_id, key)?;

        if child_underflow {
            self.rebalance_child(&mut node, child_index)?;
        }

        self.store_node(page_id, &node)?;
        Ok((removed, node.is_underflow(self.order)))
    }

    /// Repair an underflowing child: borrow from an adjacent sibling when
    /// one can lend, otherwise merge with one and drop the separator.
    fn rebalance_child(
        &self,
        parent: &mut BTreeNode<K>,
        child_index: usize,
    ) -> Result<(), BTreeError> {
        let child_id = parent.children[child_index];
        let mut child = self.load_node(child_id)?;

        // Borrow from the left sibling.
        if child_index > 0 {
            let left_id = parent.children[child_index - 1];
            let mut left = self.load_node(left_id)?;
            if left.can_lend(self.order) {
                if child.is_leaf {
                    let k = left.keys.pop().expect("lender has keys");
                    let v = left.values.pop().expect("lender has values");
                    child.keys.insert(0, k.clone());
                    child.values.insert(0, v);
                    parent.keys[child_index - 1] = k;
                } else {
                    let separator = parent.keys[child_index - 1].clone();
                    let k = left.keys.pop().expect("lender has keys");
                    let c = left.children.pop().expect("lender has children");
                    child.keys.insert(0, separator);
                    child.children.insert(0, c);
                    parent.keys[child_index - 1] = k;
                }
                self.store_node(left_id, &left)?;
                self.store_node(child_id, &child)?;
                return Ok(());
            }
        }

        // Borrow from the right sibling.
        if child_index + 1 < parent.children.len() {
            let right_id = parent.children[child_index + 1];
            let mut right = self.load_node(right_id)?;
            if right.can_lend(self.order) {
                if child.is_leaf {
                    let k = right.keys.remove(0);
                    let v = right.values.remove(0);
                    child.keys.push(k);
                    child.values.push(v);
                    parent.keys[child_index] = right.keys[0].clone();
                } else {
                    let separator = parent.keys[child_index].clone();
                    child.keys.push(separator);
                    child.children.push(right.children.remove(0));
                    parent.keys[child_index] = right.keys.remove(0);
                }
                self.store_node(right_id, &right)?;
                self.store_node(child_id, &child)?;
                return Ok(());
            }
        }

        // No sibling can lend: merge.
        if child_index > 0 {
            // Merge the child into its left sibling.
            let left_id = parent.children[child_index - 1];
            let mut left = self.load_node(left_id)?;

            if child.is_leaf {
                left.keys.append(&mut child.keys);
                left.values.append(&mut child.values);
                left.next_leaf = child.next_leaf;
            } else {
                left.keys.push(parent.keys[child_index - 1].clone());
                left.keys.append(&mut child.keys);
                left.children.append(&mut child.children);
            }

            parent.keys.remove(child_index - 1);
            parent.children.remove(child_index);

            self.store_node(left_id, &left)?;
            self.buffer_pool.delete_page(child_id)?;
        } else {
            // Leftmost child: merge the right sibling into it.
            let right_id = parent.children[child_index + 1];
            let mut right = self.load_node(right_id)?;

            if child.is_leaf {
                child.keys.append(&mut right.keys);
                child.values.append(&mut right.values);
                child.next_leaf = right.next_leaf;
            } else {
                child.keys.push(parent.keys[child_index].clone());
                child.keys.append(&mut right.keys);
                child.children.append(&mut right.children);
            }

            parent.keys.remove(child_index);
            parent.children.remove(child_index + 1);

            self.store_node(child_id, &child)?;
            self.buffer_pool.delete_page(right_id)?;
        }

        Ok(())
    }
}

/// Ascending iterator over the leaf chain.
pub struct BTreeIter<K> {
    buffer_pool: Arc<BufferPoolManager>,
    current_leaf: Option<PageId>,
    pos: usize,
    _phantom: PhantomData<K>,
}

impl<K> Iterator for BTreeIter<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned,
{
    type Item = Result<(K, Value), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf_id = self.current_leaf?;

            let node = {
                let page = match self.buffer_pool.fetch_page(leaf_id) {
                    Ok(p) => p,
                    Err(e) => {
                        self.current_leaf = None;
                        return Some(Err(e.into()));
                    }
                };
                let result = {
                    let page_guard = page.read();
                    deserialize_node::<K>(&page_guard)
                };
                if let Err(e) = self.buffer_pool.unpin_page(leaf_id, false) {
                    self.current_leaf = None;
                    return Some(Err(e.into()));
                }
                match result {
                    Ok(n) => n,
                    Err(e) => {
                        self.current_leaf = None;
                        return Some(Err(e));
                    }
                }
            };

            if self.pos < node.keys.len() {
                let item = (node.keys[self.pos].clone(), node.values[self.pos]);
                self.pos += 1;
                return Some(Ok(item));
            }

            self.current_leaf = node.next_leaf;
            self.pos = 0;
        }
    }
}
