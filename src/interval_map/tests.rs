// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the codecache project.

use super::*;

#[test]
fn empty_map() {
    let map: IntervalMap<u32> = IntervalMap::default();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert_eq!(map.get_point(0), None);
    assert_eq!(map.iter().count(), 0);
}

#[test]
fn point_lookup_half_open() {
    let mut map = IntervalMap::default();
    map.insert(Span::new(0x1000, 64), "a");
    // Start is inside, end is one past.
    assert_eq!(map.get_point(0x1000), Some(&"a"));
    assert_eq!(map.get_point(0x1000 + 32), Some(&"a"));
    assert_eq!(map.get_point(0x1000 + 63), Some(&"a"));
    assert_eq!(map.get_point(0x1000 + 64), None);
    assert_eq!(map.get_point(0xfff), None);
}

#[test]
fn exact_key_lookup() {
    let mut map = IntervalMap::default();
    map.insert(Span::new(0x100, 16), 1u32);
    map.insert(Span::new(0x200, 16), 2);
    assert_eq!(map.get(&Span::new(0x100, 16)), Some(&1));
    assert_eq!(map.get(&Span::new(0x200, 16)), Some(&2));
    assert_eq!(map.len(), 2);
}

#[test]
fn insert_replaces_duplicate_span() {
    let mut map = IntervalMap::default();
    assert_eq!(map.insert(Span::new(0x100, 32), 1u32), None);
    assert_eq!(map.insert(Span::new(0x100, 32), 2), Some(1));
    assert_eq!(map.len(), 1);
    assert_eq!(map.get_point(0x110), Some(&2));
}

#[test]
fn remove_roundtrip() {
    let mut map = IntervalMap::default();
    for i in 0..64usize {
        map.insert(Span::new(i * 0x40, 0x40), i);
    }
    assert_eq!(map.len(), 64);
    for i in (0..64usize).rev() {
        assert_eq!(map.remove(&Span::new(i * 0x40, 0x40)), Some(i));
        assert_eq!(map.get_point(i * 0x40), None);
    }
    assert!(map.is_empty());
    assert_eq!(map.remove(&Span::new(0, 0x40)), None);
}

#[test]
fn remove_inner_nodes() {
    let mut map = IntervalMap::default();
    for i in 0..129usize {
        map.insert(Span::new(i * 0x10, 0x10), i);
    }
    // Remove every other span; the survivors must stay reachable.
    for i in (0..129usize).step_by(2) {
        assert_eq!(map.remove(&Span::new(i * 0x10, 0x10)), Some(i));
    }
    assert_eq!(map.len(), 64);
    for i in 0..129usize {
        let expected = if i % 2 == 1 { Some(i) } else { None };
        assert_eq!(map.get_point(i * 0x10 + 0x8).copied(), expected);
    }
}

#[test]
fn ascending_insertion_stays_searchable() {
    // Sequential code emission produces strictly ascending spans; an
    // unbalanced tree degenerates to a list here.
    let mut map = IntervalMap::default();
    const N: usize = 100_000;
    for i in 0..N {
        map.insert(Span::new(0x10_0000 + i * 0x20, 0x20), i);
    }
    assert_eq!(map.len(), N);
    assert_eq!(map.get_point(0x10_0000 + 0x1f), Some(&0));
    assert_eq!(map.get_point(0x10_0000 + (N - 1) * 0x20), Some(&(N - 1)));
    assert_eq!(map.get_point(0x10_0000 + N * 0x20), None);
}

#[test]
fn iteration_is_in_span_order() {
    let mut map = IntervalMap::default();
    let starts = [0x500usize, 0x100, 0x300, 0x700, 0x200, 0x600, 0x400];
    for start in starts {
        map.insert(Span::new(start, 0x80), start);
    }
    let seen: Vec<usize> = map.iter().map(|(span, _)| span.start).collect();
    assert_eq!(seen, vec![0x100, 0x200, 0x300, 0x400, 0x500, 0x600, 0x700]);
    for (span, value) in &map {
        assert_eq!(span.start, *value);
    }
}

#[test]
fn clear_drops_everything() {
    let mut map = IntervalMap::default();
    for i in 0..16usize {
        map.insert(Span::new(i * 0x1000, 0x800), i);
    }
    map.clear();
    assert!(map.is_empty());
    assert_eq!(map.get_point(0x800), None);
    // Reusable after clearing.
    map.insert(Span::new(0, 0x10), 42);
    assert_eq!(map.get_point(0xf), Some(&42));
}

#[test]
fn owned_values_are_released() {
    use std::sync::Arc;

    let value = Arc::new(());
    let mut map = IntervalMap::default();
    for i in 0..8usize {
        map.insert(Span::new(i * 0x100, 0x100), Arc::clone(&value));
    }
    assert_eq!(Arc::strong_count(&value), 9);
    map.remove(&Span::new(0, 0x100));
    assert_eq!(Arc::strong_count(&value), 8);
    map.clear();
    assert_eq!(Arc::strong_count(&value), 1);
}

#[test]
fn point_comparator_semantics() {
    use std::cmp::Ordering;

    let span = Span::new(0x100, 0x40);
    assert_eq!(Span::point(0x0ff).cmp(&span), Ordering::Less);
    assert_eq!(Span::point(0x100).cmp(&span), Ordering::Equal);
    assert_eq!(Span::point(0x13f).cmp(&span), Ordering::Equal);
    assert_eq!(Span::point(0x140).cmp(&span), Ordering::Greater);
    // Symmetric when the stored span is on the left.
    assert_eq!(span.cmp(&Span::point(0x0ff)), Ordering::Greater);
    assert_eq!(span.cmp(&Span::point(0x120)), Ordering::Equal);
    assert_eq!(span.cmp(&Span::point(0x140)), Ordering::Less);
}
