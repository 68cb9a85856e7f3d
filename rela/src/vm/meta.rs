// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Meta-method dispatch (§4.C "Meta-method dispatch"): operator
//! fall-through for `+ - * / == < # $` and string-keyed `GET` misses,
//! when a Vector, Map or UserData carries a non-nil meta.
//!
//! This is a VM-level concern rather than a [`crate::value::ops`] one
//! because invoking a meta-method may call a subroutine, which needs
//! the call machinery in [`super`].

use crate::value::Item;
use crate::vm::heap::Heap;
use crate::vm::Vm;

/// The meta `Item` attached to `item`, if any (`Nil` for anything
/// without a meta slot, and for compounds whose meta hasn't been set).
fn meta_of(heap: &Heap, item: Item) -> Item {
    match item {
        Item::Vector(v) => heap.vectors.get(v).map_or(Item::Nil, |v| v.meta),
        Item::Map(m) => heap.maps.get(m).map_or(Item::Nil, |m| m.meta),
        Item::UserData(u) => heap.userdata.get(u).map_or(Item::Nil, |u| u.meta),
        _ => Item::Nil,
    }
}

/// Invoke `handler` with `args`, whether it is a Map of named methods
/// (looked up by `name`) or a bare Subroutine/Callback acting as a
/// catch-all for every operator.
fn invoke(vm: &mut Vm, handler: Item, name: &str, args: Vec<Item>) -> crate::error::Result<Item> {
    let target = match handler {
        Item::Map(m) => {
            let key = {
                let heap = vm.heap_mut();
                Item::Str(heap.intern(name))
            };
            let looked_up = vm
                .heap()
                .maps
                .get(m)
                .map(|map| map.get(key, |a, b| crate::value::ops::less(vm.heap(), a, b)))
                .unwrap_or(Item::Nil);
            if looked_up.is_nil() {
                return Ok(Item::Nil);
            }
            looked_up
        }
        other @ (Item::Sub(_) | Item::Callback(_)) => other,
        _ => return Ok(Item::Nil),
    };
    let mut results = vm.call_value_sync(target, args)?;
    Ok(if results.is_empty() {
        Item::Nil
    } else {
        results.remove(0)
    })
}

/// Try a binary operator's meta fallback. `Ok(None)` means neither
/// operand carries an applicable meta and the caller should fall back
/// to (or report a type error from) the structural default.
pub fn try_binary(vm: &mut Vm, name: &str, a: Item, b: Item) -> crate::error::Result<Option<Item>> {
    let meta_a = meta_of(vm.heap(), a);
    let meta_b = meta_of(vm.heap(), b);
    let handler = if !meta_a.is_nil() {
        meta_a
    } else if !meta_b.is_nil() {
        meta_b
    } else {
        return Ok(None);
    };
    invoke(vm, handler, name, vec![a, b]).map(Some)
}

/// Try a unary operator's (`#`, `$`) meta fallback.
pub fn try_unary(vm: &mut Vm, name: &str, a: Item) -> crate::error::Result<Option<Item>> {
    let meta = meta_of(vm.heap(), a);
    if meta.is_nil() {
        return Ok(None);
    }
    invoke(vm, meta, name, vec![a]).map(Some)
}

/// `GET` fallback when a string key misses on a Map, or is used on
/// UserData (which has no primary keyed storage at all).
pub fn try_index(vm: &mut Vm, base: Item, key: Item) -> crate::error::Result<Option<Item>> {
    if !matches!(key, Item::Str(_)) {
        return Ok(None);
    }
    let meta = meta_of(vm.heap(), base);
    if meta.is_nil() {
        return Ok(None);
    }
    match meta {
        Item::Map(m) => {
            let v = vm
                .heap()
                .maps
                .get(m)
                .map(|map| map.get(key, |a, b| crate::value::ops::less(vm.heap(), a, b)))
                .unwrap_or(Item::Nil);
            Ok(Some(v))
        }
        Item::Sub(_) | Item::Callback(_) => invoke(vm, meta, "", vec![base, key]).map(Some),
        _ => Ok(None),
    }
}
