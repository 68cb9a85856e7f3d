// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Mark-and-sweep collector (§4.H). Runs only at the explicit `collect`
//! call site — never implicitly between opcodes (§9 "GC only runs at
//! well-defined safe points").
//!
//! Roots: the `core` scope's values, the fresh-per-run `global` map, and
//! every coroutine reachable from the routine chain (which in turn marks
//! its own stacks, frames and stash). Everything else in the four pools
//! is swept; the young interned-string region is swept against the set
//! of `Item::Str` handles actually reached during marking.

#[cfg(test)]
mod gc_test;

use crate::pool::PoolIndex;
use crate::value::Item;
use crate::vm::Vm;

pub fn collect(vm: &mut Vm) {
    vm.heap_mut().vectors.clear_marks();
    vm.heap_mut().maps.clear_marks();
    vm.heap_mut().coroutines.clear_marks();
    vm.heap_mut().userdata.clear_marks();

    let mut young_keep = vec![false; vm.heap().strings.young_len()];

    let global = Item::Map(vm.global_index());
    mark_item(vm, &mut young_keep, global);

    for value in vm.core_values() {
        mark_item(vm, &mut young_keep, value);
    }

    for &routine in vm.routines() {
        mark_item(vm, &mut young_keep, Item::Coroutine(routine));
    }
    // index 0 (the main routine) is always alive even while suspended
    // deep in a resume chain that doesn't currently list it.
    mark_item(vm, &mut young_keep, Item::Coroutine(PoolIndex(0)));

    let freed_vectors = vm.heap_mut().vectors.sweep();
    let freed_maps = vm.heap_mut().maps.sweep();
    let freed_userdata = vm.heap_mut().userdata.sweep();
    let freed_coroutines = vm.heap_mut().coroutines.sweep();
    vm.heap_mut().strings.sweep_young(&young_keep);
    tracing::debug!(
        freed_vectors,
        freed_maps,
        freed_userdata,
        freed_coroutines,
        "gc sweep"
    );
}

fn mark_item(vm: &mut Vm, young_keep: &mut Vec<bool>, item: Item) {
    match item {
        Item::Str(h) => {
            if h.region == crate::intern::Region::Young {
                if h.index >= young_keep.len() {
                    young_keep.resize(h.index + 1, false);
                }
                young_keep[h.index] = true;
            }
        }
        Item::Vector(idx) => {
            if vm.heap().vectors.is_marked(idx) {
                return;
            }
            vm.heap_mut().vectors.mark(idx);
            let meta = vm.heap().vectors.get(idx).map(|v| v.meta);
            let items: Vec<Item> = vm
                .heap()
                .vectors
                .get(idx)
                .map(|v| v.as_slice().to_vec())
                .unwrap_or_default();
            for it in items {
                mark_item(vm, young_keep, it);
            }
            if let Some(meta) = meta {
                mark_item(vm, young_keep, meta);
            }
        }
        Item::Map(idx) => {
            if vm.heap().maps.is_marked(idx) {
                return;
            }
            vm.heap_mut().maps.mark(idx);
            let (keys, values, meta) = match vm.heap().maps.get(idx) {
                Some(m) => (m.keys().to_vec(), m.values().to_vec(), m.meta),
                None => return,
            };
            for k in keys {
                mark_item(vm, young_keep, k);
            }
            for v in values {
                mark_item(vm, young_keep, v);
            }
            mark_item(vm, young_keep, meta);
        }
        Item::UserData(idx) => {
            if vm.heap().userdata.is_marked(idx) {
                return;
            }
            vm.heap_mut().userdata.mark(idx);
            let meta = vm.heap().userdata.get(idx).map(|u| u.meta);
            if let Some(meta) = meta {
                mark_item(vm, young_keep, meta);
            }
        }
        Item::Coroutine(idx) => {
            if vm.heap().coroutines.is_marked(idx) {
                return;
            }
            vm.heap_mut().coroutines.mark(idx);
            let Some(coro) = vm.heap().coroutines.get(idx) else {
                return;
            };
            let mut to_mark: Vec<Item> = Vec::new();
            to_mark.extend(coro.stack.iter().copied());
            to_mark.extend(coro.other.iter().copied());
            to_mark.extend(coro.maps.iter().copied());
            for frame in &coro.frames {
                to_mark.extend(frame.locals.iter().map(|(_, v)| *v));
            }
            for it in to_mark {
                mark_item(vm, young_keep, it);
            }
        }
        _ => {}
    }
}
