// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the codecache project.

//! An ordered map keyed by disjoint byte spans, answering point queries.
//!
//! Each region of the code cache keeps one [`IntervalMap`] from a
//! translation's `[start, start + size)` span to its metadata. Stored
//! spans never overlap (translations are emitted sequentially into
//! non-overlapping buffer slices), which lets the map reuse a single
//! ordered-search structure for both exact keys and "which span contains
//! this address" probes: a [`Span`] with `size == 0` is a *point query*
//! and compares [`Equal`](Ordering::Equal) to the stored span containing
//! it.
//!
//! The comparator is therefore **not** a total order over arbitrary
//! spans. It is only valid for the operations here: exact
//! insert/remove of disjoint spans and point-containment lookup. Do not
//! reuse [`Span`]'s `Ord` for sorting or for overlapping spans.
//!
//! The tree is AVL-balanced: code emission inserts spans in ascending
//! address order, the degenerate case for an unbalanced search tree.

mod node;
#[cfg(test)]
mod tests;

use std::cmp::Ordering;

use node::{rebalance, Node};

#[derive(Clone, Copy)]
/// A byte span `[start, start + size)`, or a point query when
/// `size == 0`.
pub struct Span {
    pub start: usize,
    pub size: usize,
}

impl Span {
    #[inline]
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    #[inline]
    /// A query key: "the stored span containing `addr`".
    pub const fn point(addr: usize) -> Self {
        Self {
            start: addr,
            size: 0,
        }
    }

    #[inline]
    pub const fn end(&self) -> usize {
        self.start + self.size
    }
}

impl std::fmt::Debug for Span {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "0x{:x}..0x{:x}", self.start, self.end())
    }
}

/// Point-versus-span comparison; containment is equality.
fn point_cmp(p: usize, span: &Span) -> Ordering {
    if p < span.start {
        Ordering::Less
    } else if p - span.start < span.size {
        Ordering::Equal
    } else {
        Ordering::Greater
    }
}

impl Ord for Span {
    /// Tagged comparator: two stored (nonzero-size) spans order by start
    /// address; a zero-size span is a point query and compares `Equal`
    /// when contained in the other span. See the module docs for why
    /// this is not a total order.
    fn cmp(&self, other: &Self) -> Ordering {
        if self.size != 0 && other.size != 0 {
            return self.start.cmp(&other.start);
        }
        if self.size == 0 {
            point_cmp(self.start, other)
        } else {
            point_cmp(other.start, self).reverse()
        }
    }
}

impl PartialOrd for Span {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Span {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Span {}

/// Map from disjoint [`Span`]s to values, with point-containment lookup.
#[derive(Debug)]
pub struct IntervalMap<V> {
    root: Option<Box<Node<V>>>,
    size: usize,
}

impl<V> Default for IntervalMap<V> {
    fn default() -> Self {
        Self {
            root: None,
            size: 0,
        }
    }
}

impl<V> IntervalMap<V> {
    /// Insert `value` keyed by `key`.
    ///
    /// `key.size` must be nonzero and `key` must not overlap any stored
    /// span other than an exact duplicate, whose previous value is
    /// returned.
    pub fn insert(&mut self, key: Span, value: V) -> Option<V> {
        debug_assert_ne!(key.size, 0, "cannot store a point query");
        let mut replaced = None;
        let root = self.root.take();
        self.root = Some(Self::insert_node(root, key, value, &mut replaced));
        if replaced.is_none() {
            self.size += 1;
        }
        replaced
    }

    fn insert_node(
        node: Option<Box<Node<V>>>,
        key: Span,
        value: V,
        replaced: &mut Option<V>,
    ) -> Box<Node<V>> {
        let Some(mut n) = node else {
            return Box::new(Node::new(key, value));
        };
        match key.cmp(&n.key) {
            Ordering::Equal => {
                *replaced = Some(std::mem::replace(&mut n.value, value));
                n.key = key;
                n
            }
            Ordering::Less => {
                n.left = Some(Self::insert_node(n.left.take(), key, value, replaced));
                rebalance(n)
            }
            Ordering::Greater => {
                n.right = Some(Self::insert_node(n.right.take(), key, value, replaced));
                rebalance(n)
            }
        }
    }

    /// Remove the entry stored under `key` and return its value.
    pub fn remove(&mut self, key: &Span) -> Option<V> {
        let mut removed = None;
        let root = self.root.take();
        self.root = Self::remove_node(root, key, &mut removed);
        let (stored, value) = removed?;
        if key.size != 0 {
            debug_assert_eq!(
                stored.size, key.size,
                "removal key does not match the stored span"
            );
        }
        self.size -= 1;
        Some(value)
    }

    fn remove_node(
        node: Option<Box<Node<V>>>,
        key: &Span,
        removed: &mut Option<(Span, V)>,
    ) -> Option<Box<Node<V>>> {
        let mut n = node?;
        match key.cmp(&n.key) {
            Ordering::Less => {
                n.left = Self::remove_node(n.left.take(), key, removed);
                Some(rebalance(n))
            }
            Ordering::Greater => {
                n.right = Self::remove_node(n.right.take(), key, removed);
                Some(rebalance(n))
            }
            Ordering::Equal => match (n.left.take(), n.right.take()) {
                (None, None) => {
                    let Node { key, value, .. } = *n;
                    *removed = Some((key, value));
                    None
                }
                (Some(child), None) | (None, Some(child)) => {
                    let Node { key, value, .. } = *n;
                    *removed = Some((key, value));
                    Some(child)
                }
                (Some(left), Some(right)) => {
                    // Splice the in-order successor into this node.
                    let (succ_key, succ_value, rest) = Self::take_min(right);
                    let old_key = std::mem::replace(&mut n.key, succ_key);
                    let old_value = std::mem::replace(&mut n.value, succ_value);
                    *removed = Some((old_key, old_value));
                    n.left = Some(left);
                    n.right = rest;
                    Some(rebalance(n))
                }
            },
        }
    }

    fn take_min(mut n: Box<Node<V>>) -> (Span, V, Option<Box<Node<V>>>) {
        match n.left.take() {
            Some(left) => {
                let (key, value, rest) = Self::take_min(left);
                n.left = rest;
                (key, value, Some(rebalance(n)))
            }
            None => {
                let Node {
                    key, value, right, ..
                } = *n;
                (key, value, right)
            }
        }
    }

    /// Look up `key`: an exact stored span, or a point query
    /// ([`Span::point`]) for the stored span containing an address.
    pub fn get(&self, key: &Span) -> Option<&V> {
        let mut cur = &self.root;
        while let Some(n) = cur {
            match key.cmp(&n.key) {
                Ordering::Equal => return Some(&n.value),
                Ordering::Less => cur = &n.left,
                Ordering::Greater => cur = &n.right,
            }
        }
        None
    }

    #[inline]
    /// The value whose span contains `addr`, if any.
    pub fn get_point(&self, addr: usize) -> Option<&V> {
        self.get(&Span::point(addr))
    }

    /// In-order (ascending span) iterator over stored entries.
    pub const fn iter(&self) -> Iter<'_, V> {
        Iter {
            to_visit: vec![],
            curr: &self.root,
        }
    }

    /// Drop every stored entry.
    pub fn clear(&mut self) {
        self.root = None;
        self.size = 0;
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// In-order iterator over an [`IntervalMap`].
pub struct Iter<'a, V> {
    to_visit: Vec<&'a Node<V>>,
    curr: &'a Option<Box<Node<V>>>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a Span, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(n) = self.curr {
            self.to_visit.push(n);
            self.curr = &n.left;
        }
        let visited = self.to_visit.pop()?;
        self.curr = &visited.right;
        Some((&visited.key, &visited.value))
    }
}

impl<'a, V> IntoIterator for &'a IntervalMap<V> {
    type IntoIter = Iter<'a, V>;
    type Item = (&'a Span, &'a V);

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
