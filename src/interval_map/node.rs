// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the codecache project.

//! AVL tree nodes for [`IntervalMap`](super::IntervalMap).

use super::Span;

#[derive(Debug)]
pub(super) struct Node<V> {
    pub key: Span,
    pub value: V,
    pub left: Option<Box<Node<V>>>,
    pub right: Option<Box<Node<V>>>,
    height: i32,
}

pub(super) fn height<V>(node: &Option<Box<Node<V>>>) -> i32 {
    node.as_ref().map_or(0, |n| n.height)
}

impl<V> Node<V> {
    pub fn new(key: Span, value: V) -> Self {
        Self {
            key,
            value,
            left: None,
            right: None,
            height: 1,
        }
    }

    fn update_height(&mut self) {
        self.height = 1 + height(&self.left).max(height(&self.right));
    }

    fn balance_factor(&self) -> i32 {
        height(&self.left) - height(&self.right)
    }
}

fn rotate_right<V>(mut root: Box<Node<V>>) -> Box<Node<V>> {
    let mut pivot = root.left.take().expect("rotate_right without left child");
    root.left = pivot.right.take();
    root.update_height();
    pivot.right = Some(root);
    pivot.update_height();
    pivot
}

fn rotate_left<V>(mut root: Box<Node<V>>) -> Box<Node<V>> {
    let mut pivot = root.right.take().expect("rotate_left without right child");
    root.right = pivot.left.take();
    root.update_height();
    pivot.left = Some(root);
    pivot.update_height();
    pivot
}

/// Restore the AVL invariant at `node` after an insertion or removal in
/// one of its subtrees.
pub(super) fn rebalance<V>(mut node: Box<Node<V>>) -> Box<Node<V>> {
    node.update_height();
    let bf = node.balance_factor();
    if bf > 1 {
        if node
            .left
            .as_ref()
            .expect("positive balance factor without left child")
            .balance_factor()
            < 0
        {
            node.left = Some(rotate_left(node.left.take().unwrap()));
        }
        return rotate_right(node);
    }
    if bf < -1 {
        if node
            .right
            .as_ref()
            .expect("negative balance factor without right child")
            .balance_factor()
            > 0
        {
            node.right = Some(rotate_right(node.right.take().unwrap()));
        }
        return rotate_left(node);
    }
    node
}
