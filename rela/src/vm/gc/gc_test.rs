// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Tests for the mark-and-sweep collector (§4.H, §8 "GC safety").

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::value::Item;
use crate::vm::Vm;

fn dummy_less(_a: Item, _b: Item) -> bool {
    false
}

#[test]
fn unreachable_objects_are_swept() {
    let mut vm = Vm::create("").expect("compile");

    let kept = vm.make_vector();
    let garbage = vm.make_vector();

    let key = vm.heap_mut().intern("k");
    let gidx = vm.global_index();
    vm.heap_mut()
        .maps
        .get_mut(gidx)
        .expect("global map exists")
        .set(Item::Str(key), kept, dummy_less);

    assert_eq!(vm.heap().vectors.extant(), 2);
    vm.collect();
    assert_eq!(
        vm.heap().vectors.extant(),
        1,
        "only the vector reachable from global should survive"
    );
    assert!(matches!(kept, Item::Vector(_)));
    assert!(matches!(garbage, Item::Vector(_)));
}

#[test]
fn reachability_is_transitive_through_containers() {
    let mut vm = Vm::create("").expect("compile");

    let inner = vm.make_vector();
    let outer = vm.make_map();
    if let Item::Map(outer_idx) = outer {
        let key = vm.heap_mut().intern("inner");
        vm.heap_mut()
            .maps
            .get_mut(outer_idx)
            .expect("map exists")
            .set(Item::Str(key), inner, dummy_less);
    }

    let key = vm.heap_mut().intern("root");
    let gidx = vm.global_index();
    vm.heap_mut()
        .maps
        .get_mut(gidx)
        .expect("global map exists")
        .set(Item::Str(key), outer, dummy_less);

    vm.collect();
    assert_eq!(vm.heap().maps.extant(), 2, "global map + outer map survive");
    assert_eq!(vm.heap().vectors.extant(), 1, "inner vector survives via outer map");
}

#[test]
fn collect_at_a_safe_point_does_not_change_observable_output() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink_lines = Rc::clone(&lines);
    let mut vm = Vm::create("collect()\nprint(1+1)\ncollect()").expect("compile");
    vm.set_print_sink(Box::new(move |line| sink_lines.borrow_mut().push(line.to_string())));
    vm.run(0).expect("run");
    assert_eq!(*lines.borrow(), vec!["2".to_string()]);
}
