// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Tests for the bitmap slab allocator (§4.A "Pools & interned strings").

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;

#[test]
fn alloc_get_free_round_trip() {
    let mut pool: Pool<i32> = Pool::new();
    let a = pool.alloc(1);
    let b = pool.alloc(2);
    assert_eq!(pool.get(a), Some(&1));
    assert_eq!(pool.get(b), Some(&2));
    assert_eq!(pool.extant(), 2);

    pool.free(a);
    assert_eq!(pool.get(a), None);
    assert_eq!(pool.extant(), 1);
}

#[test]
fn freed_slot_is_recycled_before_growing() {
    let mut pool: Pool<i32> = Pool::new();
    let a = pool.alloc(1);
    let b = pool.alloc(2);
    pool.free(a);
    let c = pool.alloc(3);
    assert_eq!(c, a, "alloc should reuse the freed slot, not grow");
    assert_eq!(pool.get(b), Some(&2));
    assert_eq!(pool.get(c), Some(&3));
}

#[test]
fn grows_by_a_full_page_when_no_slot_is_free() {
    let mut pool: Pool<i32> = Pool::new();
    for i in 0..PAGE {
        pool.alloc(i as i32);
    }
    assert_eq!(pool.extant(), PAGE);
    let next = pool.alloc(999);
    assert_eq!(next, PoolIndex(PAGE));
    assert_eq!(pool.extant(), PAGE + 1);
}

#[test]
fn sweep_frees_unmarked_slots_and_keeps_marked_ones() {
    let mut pool: Pool<i32> = Pool::new();
    let keep = pool.alloc(1);
    let drop1 = pool.alloc(2);
    let drop2 = pool.alloc(3);

    pool.clear_marks();
    pool.mark(keep);
    let freed = pool.sweep();

    assert_eq!(freed, 2);
    assert_eq!(pool.extant(), 1);
    assert_eq!(pool.get(keep), Some(&1));
    assert_eq!(pool.get(drop1), None);
    assert_eq!(pool.get(drop2), None);
}

#[test]
fn double_free_is_a_noop() {
    let mut pool: Pool<i32> = Pool::new();
    let a = pool.alloc(1);
    pool.free(a);
    pool.free(a);
    assert_eq!(pool.extant(), 0);
}

#[test]
fn iter_yields_only_live_slots() {
    let mut pool: Pool<i32> = Pool::new();
    let a = pool.alloc(10);
    let b = pool.alloc(20);
    pool.free(a);
    let live: Vec<(PoolIndex, &i32)> = pool.iter().collect();
    assert_eq!(live, vec![(b, &20)]);
}
