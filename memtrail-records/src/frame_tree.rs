// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A prefix-compressed trie of call stacks. Every distinct stack maps to the
//! 32-bit index of its deepest node; shared prefixes share nodes.

use crate::records::TreeIndex;

/// Root node index. The root carries no key and represents the empty stack.
pub const ROOT_INDEX: TreeIndex = 0;

#[derive(Clone, Copy, Debug)]
struct DescendentEdge<K> {
    key: K,
    child_index: TreeIndex,
}

#[derive(Clone, Debug)]
struct Node<K> {
    key: K,
    parent_index: TreeIndex,
    children: Vec<DescendentEdge<K>>,
}

/// Stack trie generic over the per-frame key: interpreter frame ids for the
/// python tree, raw instruction pointers for the native tree.
///
/// Invariant: for any node other than the root, `parent_index < index`.
#[derive(Clone, Debug)]
pub struct StackTree<K> {
    nodes: Vec<Node<K>>,
}

impl<K: Copy + Ord + Default> Default for StackTree<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Ord + Default> StackTree<K> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                key: K::default(),
                parent_index: ROOT_INDEX,
                children: Vec::new(),
            }],
        }
    }

    /// Smallest index a non-root node can have.
    pub fn min_index(&self) -> TreeIndex {
        1
    }

    pub fn max_index(&self) -> TreeIndex {
        (self.nodes.len() - 1) as TreeIndex
    }

    /// Key and parent index of the node at `index`. `index` must be a value
    /// previously returned by one of the interning methods.
    pub fn node(&self, index: TreeIndex) -> Option<(K, TreeIndex)> {
        if index == ROOT_INDEX {
            return None;
        }
        self.nodes
            .get(index as usize)
            .map(|node| (node.key, node.parent_index))
    }

    /// Interns a whole stack, outermost frame first, and returns the index
    /// of its deepest node. `callback` runs once for every newly-created
    /// node with `(key, parent_index)`; returning `false` aborts the walk
    /// and yields the root index, leaving the trie unchanged for that node.
    pub fn trace_index_with<I, C>(&mut self, stack: I, callback: &mut C) -> TreeIndex
    where
        I: IntoIterator<Item = K>,
        C: FnMut(K, TreeIndex) -> bool,
    {
        let mut index = ROOT_INDEX;
        for key in stack {
            index = match self.intern(index, key, callback) {
                Some(child) => child,
                None => return ROOT_INDEX,
            };
        }
        index
    }

    /// Interns a single child of `parent_index`.
    pub fn trace_index(&mut self, parent_index: TreeIndex, key: K) -> TreeIndex {
        self.intern(parent_index, key, &mut |_, _| true)
            .unwrap_or(ROOT_INDEX)
    }

    fn intern<C>(&mut self, parent_index: TreeIndex, key: K, callback: &mut C) -> Option<TreeIndex>
    where
        C: FnMut(K, TreeIndex) -> bool,
    {
        let position = self.nodes[parent_index as usize]
            .children
            .binary_search_by(|edge| edge.key.cmp(&key));
        match position {
            Ok(found) => Some(self.nodes[parent_index as usize].children[found].child_index),
            Err(insert_at) => {
                let new_index = self.nodes.len() as TreeIndex;
                if !callback(key, parent_index) {
                    return None;
                }
                self.nodes[parent_index as usize].children.insert(
                    insert_at,
                    DescendentEdge {
                        key,
                        child_index: new_index,
                    },
                );
                self.nodes.push(Node {
                    key,
                    parent_index,
                    children: Vec::new(),
                });
                Some(new_index)
            }
        }
    }

    /// Walks from `index` towards the root, yielding keys deepest-first.
    pub fn walk(&self, index: TreeIndex) -> StackWalk<'_, K> {
        StackWalk {
            tree: self,
            current: index,
        }
    }
}

pub struct StackWalk<'a, K> {
    tree: &'a StackTree<K>,
    current: TreeIndex,
}

impl<K: Copy + Ord + Default> Iterator for StackWalk<'_, K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        let (key, parent) = self.tree.node(self.current)?;
        self.current = parent;
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_traces_share_an_index() {
        let mut tree: StackTree<u64> = StackTree::new();
        let first = tree.trace_index_with([1, 2, 3], &mut |_, _| true);
        let second = tree.trace_index_with([1, 2, 3], &mut |_, _| true);
        assert_eq!(first, second);
        assert_eq!(tree.max_index(), 3);
    }

    #[test]
    fn test_interleaved_traces_do_not_disturb_indices() {
        let mut tree: StackTree<u64> = StackTree::new();
        let target = tree.trace_index_with([1, 2, 3], &mut |_, _| true);
        tree.trace_index_with([4, 5], &mut |_, _| true);
        tree.trace_index_with([1, 9], &mut |_, _| true);
        tree.trace_index_with([1, 2, 7, 8], &mut |_, _| true);
        let again = tree.trace_index_with([1, 2, 3], &mut |_, _| true);
        assert_eq!(target, again);
    }

    #[test]
    fn test_prefixes_share_nodes() {
        let mut tree: StackTree<u64> = StackTree::new();
        tree.trace_index_with([1, 2, 3], &mut |_, _| true);
        tree.trace_index_with([1, 2, 4], &mut |_, _| true);
        // Root + 1 + 2 + 3 + 4.
        assert_eq!(tree.max_index(), 4);
    }

    #[test]
    fn test_parent_index_is_always_smaller() {
        let mut tree: StackTree<u64> = StackTree::new();
        tree.trace_index_with([3, 1, 4, 1, 5], &mut |_, _| true);
        tree.trace_index_with([2, 7, 1], &mut |_, _| true);
        for index in tree.min_index()..=tree.max_index() {
            let (_, parent) = tree.node(index).unwrap();
            assert!(parent < index);
        }
    }

    #[test]
    fn test_callback_sees_every_new_node_once() {
        let mut tree: StackTree<u64> = StackTree::new();
        let mut seen = Vec::new();
        tree.trace_index_with([1, 2], &mut |key, parent| {
            seen.push((key, parent));
            true
        });
        tree.trace_index_with([1, 2], &mut |key, parent| {
            seen.push((key, parent));
            true
        });
        assert_eq!(seen, vec![(1, 0), (2, 1)]);
    }

    #[test]
    fn test_failed_callback_yields_root() {
        let mut tree: StackTree<u64> = StackTree::new();
        let index = tree.trace_index_with([1, 2], &mut |_, _| false);
        assert_eq!(index, ROOT_INDEX);
    }

    #[test]
    fn test_walk_is_deepest_first() {
        let mut tree: StackTree<u64> = StackTree::new();
        let leaf = tree.trace_index_with([10, 20, 30], &mut |_, _| true);
        let walked: Vec<u64> = tree.walk(leaf).collect();
        assert_eq!(walked, vec![30, 20, 10]);
    }
}
