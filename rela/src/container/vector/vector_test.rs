// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Tests for the ordered vector container (§4.B, §8 "Sort idempotence").

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;

fn int_less(a: Item, b: Item) -> bool {
    match (a, b) {
        (Item::Int(x), Item::Int(y)) => x < y,
        _ => false,
    }
}

#[test]
fn negative_index_counts_from_end() {
    let mut v = VectorObj::new();
    v.push(Item::Int(1));
    v.push(Item::Int(2));
    v.push(Item::Int(3));
    assert!(matches!(v.get(-1), Some(Item::Int(3))));
    assert!(matches!(v.get(-3), Some(Item::Int(1))));
    assert!(v.get(-4).is_none());
    assert!(v.get(3).is_none());
}

#[test]
fn set_at_len_appends() {
    let mut v = VectorObj::new();
    v.push(Item::Int(1));
    v.set(1, Item::Int(2));
    assert_eq!(v.len(), 2);
    assert!(matches!(v.get(1), Some(Item::Int(2))));
}

#[test]
fn set_out_of_range_is_noop() {
    let mut v = VectorObj::new();
    v.push(Item::Int(1));
    v.set(5, Item::Int(9));
    assert_eq!(v.len(), 1);
}

#[test]
fn insert_and_delete() {
    let mut v = VectorObj::new();
    v.push(Item::Int(1));
    v.push(Item::Int(3));
    v.insert(1, Item::Int(2));
    assert_eq!(
        v.as_slice(),
        &[Item::Int(1), Item::Int(2), Item::Int(3)][..]
    );
    let deleted = v.delete(1);
    assert!(matches!(deleted, Some(Item::Int(2))));
    assert_eq!(v.as_slice(), &[Item::Int(1), Item::Int(3)][..]);
}

#[test]
fn swap_swaps_in_place() {
    let mut v = VectorObj::new();
    v.push(Item::Int(1));
    v.push(Item::Int(2));
    v.swap(0, 1);
    assert!(matches!(v.get(0), Some(Item::Int(2))));
    assert!(matches!(v.get(1), Some(Item::Int(1))));
}

#[test]
fn lower_bound_matches_above_and_below_the_linear_binary_threshold() {
    let mut small = VectorObj::new();
    for n in [1, 3, 5, 7] {
        small.push(Item::Int(n));
    }
    assert_eq!(small.lower_bound(Item::Int(4), int_less), 2);

    let mut large = VectorObj::new();
    for n in 0..20 {
        large.push(Item::Int(n * 2));
    }
    assert_eq!(large.lower_bound(Item::Int(7), int_less), 4);
    assert_eq!(large.lower_bound(Item::Int(6), int_less), 3);
}

#[test]
fn sort_orders_and_is_idempotent() {
    let mut v = VectorObj::new();
    for n in [5, 3, 1, 4, 1, 5, 9, 2, 6] {
        v.push(Item::Int(n));
    }
    v.sort_by(int_less);
    let sorted: Vec<i64> = v
        .as_slice()
        .iter()
        .map(|it| match it {
            Item::Int(n) => *n,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(sorted, vec![1, 1, 2, 3, 4, 5, 5, 6, 9]);

    v.sort_by(int_less);
    let sorted_again: Vec<i64> = v
        .as_slice()
        .iter()
        .map(|it| match it {
            Item::Int(n) => *n,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(sorted, sorted_again);
}

#[test]
fn clear_empties_the_vector() {
    let mut v = VectorObj::new();
    v.push(Item::Int(1));
    v.clear();
    assert!(v.is_empty());
}
