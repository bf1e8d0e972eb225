//! Size-indexed AVL tree of free blocks.
//!
//! ```text
//!                 ┌──────┐
//!                 │  50  │── 50 ── 50        one tree node per distinct size,
//!                 └──────┘                   equal sizes chained behind it
//!                /        \
//!          ┌──────┐      ┌──────┐
//!          │  30  │      │  70  │── 70
//!          └──────┘      └──────┘
//! ```
//!
//! Nodes live in a table and refer to each other by index, so parent links do
//! not form ownership cycles and a [`NodeRef`] stays valid until its node is deleted.

use std::cmp::Ordering;

/// Index of a node in a [`FreeIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(usize);

impl NodeRef {
  pub fn index(self) -> usize {
    self.0
  }

  pub(crate) fn from_index(index: usize) -> Self {
    Self(index)
  }
}

/// Position of a node in its duplicate chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chain {
  /// Lives in the tree. Its `next` starts the duplicates.
  Head,
  /// Chained behind `prev`. Tree links are unused.
  Duplicate { prev: NodeRef },
}

#[derive(Debug, Clone)]
struct FreeNode<T> {
  key: usize,
  value: T,
  parent: Option<NodeRef>,
  left: Option<NodeRef>,
  right: Option<NodeRef>,
  balance: i8,
  chain: Chain,
  next: Option<NodeRef>,
}

/// One indexed entry, as seen by [`FreeIndex::iterate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntry<T> {
  pub node: NodeRef,
  pub key: usize,
  pub value: T,
  /// Chained behind a tree node of the same key.
  pub duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct FreeIndex<T> {
  nodes: Vec<FreeNode<T>>,
  vacant: Vec<NodeRef>,
  root: Option<NodeRef>,
  len: usize,
  distinct: usize,
}

impl<T> Default for FreeIndex<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> FreeIndex<T> {
  pub const fn new() -> Self {
    Self {
      nodes: Vec::new(),
      vacant: Vec::new(),
      root: None,
      len: 0,
      distinct: 0,
    }
  }

  /// Number of indexed entries, duplicates included.
  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Number of tree nodes, i.e. distinct keys.
  pub fn distinct_len(&self) -> usize {
    self.distinct
  }

  pub fn root_key(&self) -> Option<usize> {
    self.root.map(|root| self.node(root).key)
  }

  pub fn key(
    &self,
    node: NodeRef,
  ) -> usize {
    self.node(node).key
  }

  pub fn value(
    &self,
    node: NodeRef,
  ) -> &T {
    &self.node(node).value
  }

  pub fn height(&self) -> usize {
    let mut height = 0;
    let mut level: Vec<NodeRef> = self.root.into_iter().collect();
    while !level.is_empty() {
      height += 1;
      level = level
        .iter()
        .flat_map(|&n| [self.node(n).left, self.node(n).right])
        .flatten()
        .collect();
    }
    height
  }

  fn node(
    &self,
    node: NodeRef,
  ) -> &FreeNode<T> {
    &self.nodes[node.0]
  }

  fn node_mut(
    &mut self,
    node: NodeRef,
  ) -> &mut FreeNode<T> {
    &mut self.nodes[node.0]
  }

  fn alloc_node(
    &mut self,
    key: usize,
    value: T,
  ) -> NodeRef {
    let fresh = FreeNode {
      key,
      value,
      parent: None,
      left: None,
      right: None,
      balance: 0,
      chain: Chain::Head,
      next: None,
    };

    match self.vacant.pop() {
      Some(slot) => {
        self.nodes[slot.0] = fresh;
        slot
      }
      None => {
        self.nodes.push(fresh);
        NodeRef(self.nodes.len() - 1)
      }
    }
  }

  /// Indexes `value` under `key`.
  ///
  /// An existing key gets the new node chained right behind its tree node; the
  /// tree shape is untouched.
  pub fn insert(
    &mut self,
    key: usize,
    value: T,
  ) -> NodeRef {
    let node = self.alloc_node(key, value);
    self.len += 1;

    let mut parent = None;
    let mut went_left = false;
    let mut current = self.root;

    while let Some(c) = current {
      match key.cmp(&self.node(c).key) {
        Ordering::Less => {
          parent = Some(c);
          went_left = true;
          current = self.node(c).left;
        }
        Ordering::Greater => {
          parent = Some(c);
          went_left = false;
          current = self.node(c).right;
        }
        Ordering::Equal => {
          self.chain_after(c, node);
          return node;
        }
      }
    }

    self.distinct += 1;
    self.node_mut(node).parent = parent;
    match parent {
      None => self.root = Some(node),
      Some(p) if went_left => self.node_mut(p).left = Some(node),
      Some(p) => self.node_mut(p).right = Some(node),
    }

    self.rebalance_after_insert(node);
    node
  }

  fn chain_after(
    &mut self,
    head: NodeRef,
    node: NodeRef,
  ) {
    let next = self.node(head).next;
    if let Some(next) = next {
      self.node_mut(next).chain = Chain::Duplicate { prev: node };
    }

    let fresh = self.node_mut(node);
    fresh.chain = Chain::Duplicate { prev: head };
    fresh.next = next;

    self.node_mut(head).next = Some(node);
  }

  fn rebalance_after_insert(
    &mut self,
    mut child: NodeRef,
  ) {
    while let Some(parent) = self.node(child).parent {
      if self.node(parent).left == Some(child) {
        self.node_mut(parent).balance -= 1;
      } else {
        self.node_mut(parent).balance += 1;
      }

      match self.node(parent).balance {
        0 => break,
        -2 | 2 => {
          self.rebalance(parent);
          break;
        }
        _ => child = parent,
      }
    }
  }

  /// Removes `node` from the index. The reference is dead afterwards.
  pub fn delete(
    &mut self,
    node: NodeRef,
  ) {
    self.len -= 1;

    match self.node(node).chain {
      Chain::Duplicate { prev } => self.unchain(node, prev),
      Chain::Head => match self.node(node).next {
        Some(successor) => self.promote(node, successor),
        None => {
          self.distinct -= 1;
          self.remove_from_tree(node);
        }
      },
    }

    self.vacant.push(node);
  }

  fn unchain(
    &mut self,
    node: NodeRef,
    prev: NodeRef,
  ) {
    let next = self.node(node).next;
    self.node_mut(prev).next = next;
    if let Some(next) = next {
      self.node_mut(next).chain = Chain::Duplicate { prev };
    }
  }

  /// Hands `head`'s tree position to its first duplicate.
  fn promote(
    &mut self,
    head: NodeRef,
    successor: NodeRef,
  ) {
    let (parent, left, right, balance) = {
      let h = self.node(head);
      (h.parent, h.left, h.right, h.balance)
    };

    let promoted = self.node_mut(successor);
    promoted.parent = parent;
    promoted.left = left;
    promoted.right = right;
    promoted.balance = balance;
    promoted.chain = Chain::Head;

    for child in [left, right].into_iter().flatten() {
      self.node_mut(child).parent = Some(successor);
    }
    self.replace_child(parent, head, Some(successor));
  }

  fn replace_child(
    &mut self,
    parent: Option<NodeRef>,
    old: NodeRef,
    new: Option<NodeRef>,
  ) {
    match parent {
      None => self.root = new,
      Some(p) if self.node(p).left == Some(old) => self.node_mut(p).left = new,
      Some(p) => self.node_mut(p).right = new,
    }
  }

  fn remove_from_tree(
    &mut self,
    node: NodeRef,
  ) {
    if let (Some(_), Some(right)) = (self.node(node).left, self.node(node).right) {
      let mut successor = right;
      while let Some(left) = self.node(successor).left {
        successor = left;
      }
      self.swap_with_successor(node, successor);
    }

    let removed = self.node(node);
    let child = removed.left.or(removed.right);
    let parent = removed.parent;

    if let Some(child) = child {
      self.node_mut(child).parent = parent;
    }

    match parent {
      None => self.root = child,
      Some(p) => {
        let removed_left = self.node(p).left == Some(node);
        if removed_left {
          self.node_mut(p).left = child;
        } else {
          self.node_mut(p).right = child;
        }
        self.rebalance_after_remove(p, removed_left);
      }
    }
  }

  /// Exchanges the tree positions of `node` and its in-order successor, which
  /// has no left child. Afterwards `node` has at most one child.
  fn swap_with_successor(
    &mut self,
    node: NodeRef,
    successor: NodeRef,
  ) {
    let (parent, left, right, balance) = {
      let n = self.node(node);
      (n.parent, n.left, n.right, n.balance)
    };
    let (succ_parent, succ_right, succ_balance) = {
      let s = self.node(successor);
      (s.parent, s.right, s.balance)
    };

    self.replace_child(parent, node, Some(successor));
    {
      let s = self.node_mut(successor);
      s.parent = parent;
      s.left = left;
      s.balance = balance;
    }
    if let Some(left) = left {
      self.node_mut(left).parent = Some(successor);
    }

    if succ_parent == Some(node) {
      self.node_mut(successor).right = Some(node);
      self.node_mut(node).parent = Some(successor);
    } else {
      self.node_mut(successor).right = right;
      if let Some(right) = right {
        self.node_mut(right).parent = Some(successor);
      }
      if let Some(sp) = succ_parent {
        self.node_mut(sp).left = Some(node);
      }
      self.node_mut(node).parent = succ_parent;
    }

    let n = self.node_mut(node);
    n.left = None;
    n.right = succ_right;
    n.balance = succ_balance;
    if let Some(succ_right) = succ_right {
      self.node_mut(succ_right).parent = Some(node);
    }
  }

  fn rebalance_after_remove(
    &mut self,
    start: NodeRef,
    removed_left: bool,
  ) {
    let mut current = Some(start);
    let mut removed_left = removed_left;

    while let Some(node) = current {
      if removed_left {
        self.node_mut(node).balance += 1;
      } else {
        self.node_mut(node).balance -= 1;
      }

      let subtree = match self.node(node).balance {
        -1 | 1 => break,
        0 => node,
        _ => {
          let top = self.rebalance(node);
          // A single rotation over a balanced sibling keeps the subtree height.
          if self.node(top).balance != 0 {
            break;
          }
          top
        }
      };

      current = self.node(subtree).parent;
      if let Some(parent) = current {
        removed_left = self.node(parent).left == Some(subtree);
      }
    }
  }

  /// Restores balance at a node at ±2, returning the new subtree root.
  fn rebalance(
    &mut self,
    node: NodeRef,
  ) -> NodeRef {
    if self.node(node).balance < 0 {
      let Some(left) = self.node(node).left else {
        return node;
      };
      if self.node(left).balance > 0 {
        self.left_rotate(left);
      }
      self.right_rotate(node)
    } else {
      let Some(right) = self.node(node).right else {
        return node;
      };
      if self.node(right).balance < 0 {
        self.right_rotate(right);
      }
      self.left_rotate(node)
    }
  }

  fn left_rotate(
    &mut self,
    pivot: NodeRef,
  ) -> NodeRef {
    let Some(r) = self.node(pivot).right else {
      return pivot;
    };
    let parent = self.node(pivot).parent;
    let inner = self.node(r).left;

    self.node_mut(pivot).right = inner;
    if let Some(inner) = inner {
      self.node_mut(inner).parent = Some(pivot);
    }

    self.node_mut(r).parent = parent;
    self.replace_child(parent, pivot, Some(r));

    self.node_mut(r).left = Some(pivot);
    self.node_mut(pivot).parent = Some(r);

    let r_balance = self.node(r).balance;
    let pivot_balance = self.node(pivot).balance - 1 - r_balance.max(0);
    self.node_mut(pivot).balance = pivot_balance;
    self.node_mut(r).balance = r_balance - 1 + pivot_balance.min(0);

    r
  }

  fn right_rotate(
    &mut self,
    pivot: NodeRef,
  ) -> NodeRef {
    let Some(l) = self.node(pivot).left else {
      return pivot;
    };
    let parent = self.node(pivot).parent;
    let inner = self.node(l).right;

    self.node_mut(pivot).left = inner;
    if let Some(inner) = inner {
      self.node_mut(inner).parent = Some(pivot);
    }

    self.node_mut(l).parent = parent;
    self.replace_child(parent, pivot, Some(l));

    self.node_mut(l).right = Some(pivot);
    self.node_mut(pivot).parent = Some(l);

    let l_balance = self.node(l).balance;
    let pivot_balance = self.node(pivot).balance + 1 - l_balance.min(0);
    self.node_mut(pivot).balance = pivot_balance;
    self.node_mut(l).balance = l_balance + 1 + pivot_balance.max(0);

    l
  }

  /// Smallest indexed key `>= key`.
  ///
  /// When that key has duplicates, the first duplicate behind the tree node is
  /// returned instead of the tree node itself, so claiming it never reshapes
  /// the tree.
  pub fn best_match(
    &self,
    key: usize,
  ) -> Option<NodeRef> {
    let mut current = self.root;
    let mut candidate = None;

    while let Some(node) = current {
      let n = self.node(node);
      match n.key.cmp(&key) {
        Ordering::Equal => {
          candidate = Some(node);
          break;
        }
        Ordering::Less => current = n.right,
        Ordering::Greater => {
          candidate = Some(node);
          current = n.left;
        }
      }
    }

    candidate.map(|c| self.node(c).next.unwrap_or(c))
  }
}

impl<T: Copy> FreeIndex<T> {
  /// Visits every entry in key order; each tree node comes before its chain.
  pub fn iterate<F>(
    &self,
    mut visit: F,
  ) where
    F: FnMut(FreeEntry<T>),
  {
    let mut stack = Vec::new();
    let mut current = self.root;

    loop {
      while let Some(node) = current {
        stack.push(node);
        current = self.node(node).left;
      }
      let Some(node) = stack.pop() else {
        break;
      };

      let mut entry = Some(node);
      while let Some(e) = entry {
        let n = self.node(e);
        visit(FreeEntry {
          node: e,
          key: n.key,
          value: n.value,
          duplicate: e != node,
        });
        entry = n.next;
      }

      current = self.node(node).right;
    }
  }

  pub fn entries(&self) -> Vec<FreeEntry<T>> {
    let mut entries = Vec::with_capacity(self.len);
    self.iterate(|entry| entries.push(entry));
    entries
  }
}
