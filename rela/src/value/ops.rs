// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Structural value operations (§4.C): equality, ordering, truthiness,
//! arithmetic, count and display — the parts that only need to look
//! inside the heap, not call back into the VM. Operator fall-through to
//! a meta-method (§4.C "Meta-method dispatch") is a VM-level concern
//! (invoking a subroutine needs the call machinery) and lives in
//! [`crate::vm::meta`]; these functions implement the *default* behavior
//! a meta-method can override.

use crate::value::Item;
use crate::vm::heap::Heap;

/// `truth(a)` (§4.C). Empty string/vector/map are falsy, everything
/// else non-nil/non-false/non-zero is truthy.
#[must_use]
pub fn truth(heap: &Heap, item: Item) -> bool {
    if let Some(b) = item.truth_immediate() {
        return b;
    }
    match item {
        Item::Str(s) => !heap.resolve(s).is_empty(),
        Item::Vector(v) => heap.vectors.get(v).is_some_and(|v| !v.is_empty()),
        Item::Map(m) => heap.maps.get(m).is_some_and(|m| !m.is_empty()),
        _ => true,
    }
}

/// Structural equality, without meta dispatch. Vectors/maps compare by
/// pool identity first, then element-wise.
#[must_use]
pub fn equal(heap: &Heap, a: Item, b: Item) -> bool {
    match (a, b) {
        (Item::Nil, Item::Nil) => true,
        (Item::Bool(x), Item::Bool(y)) => x == y,
        (Item::Int(x), Item::Int(y)) => x == y,
        (Item::Float(x), Item::Float(y)) => x == y,
        (Item::Int(x), Item::Float(y)) | (Item::Float(y), Item::Int(x)) => (x as f64) == y,
        (Item::Str(x), Item::Str(y)) => x == y,
        (Item::Sub(x), Item::Sub(y)) => x == y,
        (Item::Callback(x), Item::Callback(y)) => x == y,
        (Item::Coroutine(x), Item::Coroutine(y)) => x == y,
        (Item::UserData(x), Item::UserData(y)) => x == y,
        (Item::Vector(x), Item::Vector(y)) => {
            if x == y {
                return true;
            }
            match (heap.vectors.get(x), heap.vectors.get(y)) {
                (Some(a), Some(b)) => {
                    a.len() == b.len()
                        && a.as_slice()
                            .iter()
                            .zip(b.as_slice())
                            .all(|(&ai, &bi)| equal(heap, ai, bi))
                }
                _ => false,
            }
        }
        (Item::Map(x), Item::Map(y)) => {
            if x == y {
                return true;
            }
            match (heap.maps.get(x), heap.maps.get(y)) {
                (Some(a), Some(b)) => {
                    a.len() == b.len()
                        && a.keys().iter().zip(b.keys()).all(|(&k1, &k2)| equal(heap, k1, k2))
                        && a.values()
                            .iter()
                            .zip(b.values())
                            .all(|(&v1, &v2)| equal(heap, v1, v2))
                }
                _ => false,
            }
        }
        _ => false,
    }
}

/// `less(a,b)` (§4.C): numeric by value, strings lexicographically,
/// vectors/maps by length. Mixed types are never less.
#[must_use]
pub fn less(heap: &Heap, a: Item, b: Item) -> bool {
    match (a, b) {
        (Item::Int(x), Item::Int(y)) => x < y,
        (Item::Float(x), Item::Float(y)) => x < y,
        (Item::Int(x), Item::Float(y)) => (x as f64) < y,
        (Item::Float(x), Item::Int(y)) => x < (y as f64),
        (Item::Str(x), Item::Str(y)) => heap.resolve(x) < heap.resolve(y),
        (Item::Vector(x), Item::Vector(y)) => {
            let la = heap.vectors.get(x).map_or(0, VectorObjLen::len0);
            let lb = heap.vectors.get(y).map_or(0, VectorObjLen::len0);
            la < lb
        }
        (Item::Map(x), Item::Map(y)) => {
            let la = heap.maps.get(x).map_or(0, |m| m.len());
            let lb = heap.maps.get(y).map_or(0, |m| m.len());
            la < lb
        }
        _ => false,
    }
}

/// Tiny shim so `less` can call `.len()` through the `Option` combinator
/// above without importing the concrete type into this match arm twice.
trait VectorObjLen {
    fn len0(&self) -> usize;
}
impl VectorObjLen for crate::container::VectorObj {
    fn len0(&self) -> usize {
        self.len()
    }
}

/// `count(a)` (§4.C): int value, floor of float, string byte length,
/// vector/map size.
#[must_use]
pub fn count(heap: &Heap, item: Item) -> i64 {
    match item {
        Item::Int(n) => n,
        Item::Float(f) => f.floor() as i64,
        Item::Str(s) => heap.resolve(s).len() as i64,
        Item::Vector(v) => heap.vectors.get(v).map_or(0, |v| v.len() as i64),
        Item::Map(m) => heap.maps.get(m).map_or(0, |m| m.len() as i64),
        _ => 0,
    }
}

/// `a + b` promotion rule (§4.C). Preserves the source's unusual
/// int-truncates-float behavior for `int op float`, see
/// `DESIGN.md` / spec §9 "Open questions".
#[must_use]
pub fn add(a: Item, b: Item) -> Option<Item> {
    match (a, b) {
        (Item::Int(x), Item::Int(y)) => Some(Item::Int(x.wrapping_add(y))),
        (Item::Int(x), Item::Float(y)) => Some(Item::Int(x.wrapping_add(y as i64))),
        (Item::Float(x), Item::Int(y)) => Some(Item::Float(x + y as f64)),
        (Item::Float(x), Item::Float(y)) => Some(Item::Float(x + y)),
        _ => None,
    }
}

#[must_use]
pub fn negate(a: Item) -> Option<Item> {
    match a {
        Item::Int(x) => Some(Item::Int(-x)),
        Item::Float(x) => Some(Item::Float(-x)),
        _ => None,
    }
}

/// `a - b` via `add(a, negate(b))` (§4.C "sub via negate+add").
#[must_use]
pub fn sub(a: Item, b: Item) -> Option<Item> {
    add(a, negate(b)?)
}

#[must_use]
pub fn mul(a: Item, b: Item) -> Option<Item> {
    match (a, b) {
        (Item::Int(x), Item::Int(y)) => Some(Item::Int(x.wrapping_mul(y))),
        (Item::Int(x), Item::Float(y)) => Some(Item::Int(x.wrapping_mul(y as i64))),
        (Item::Float(x), Item::Int(y)) => Some(Item::Float(x * y as f64)),
        (Item::Float(x), Item::Float(y)) => Some(Item::Float(x * y)),
        _ => None,
    }
}

#[must_use]
pub fn div(a: Item, b: Item) -> Option<Item> {
    match (a, b) {
        (Item::Int(_), Item::Int(0)) => None,
        (Item::Int(x), Item::Int(y)) => Some(Item::Int(x.wrapping_div(y))),
        (Item::Int(x), Item::Float(y)) => Some(Item::Int((x as f64 / y) as i64)),
        (Item::Float(x), Item::Int(y)) => Some(Item::Float(x / y as f64)),
        (Item::Float(x), Item::Float(y)) => Some(Item::Float(x / y)),
        _ => None,
    }
}

/// `a % b`, integers only (§4.C "mod for integers").
#[must_use]
pub fn rem(a: Item, b: Item) -> Option<Item> {
    match (a, b) {
        (Item::Int(_), Item::Int(0)) => None,
        (Item::Int(x), Item::Int(y)) => Some(Item::Int(x.wrapping_rem(y))),
        _ => None,
    }
}

/// Default (non-meta) string-ification, used by `print`, string
/// interpolation and the `$` fallback.
#[must_use]
pub fn display(heap: &Heap, item: Item) -> String {
    match item {
        Item::Nil => "nil".to_string(),
        Item::Bool(b) => b.to_string(),
        Item::Int(n) => n.to_string(),
        Item::Float(f) => f.to_string(),
        Item::Str(s) => heap.resolve(s).to_string(),
        Item::Vector(v) => {
            let Some(vec) = heap.vectors.get(v) else {
                return "[]".to_string();
            };
            let parts: Vec<String> = vec.as_slice().iter().map(|&i| display(heap, i)).collect();
            format!("[{}]", parts.join(", "))
        }
        Item::Map(m) => {
            let Some(map) = heap.maps.get(m) else {
                return "{}".to_string();
            };
            let parts: Vec<String> = map
                .keys()
                .iter()
                .zip(map.values())
                .map(|(&k, &v)| format!("{}={}", display(heap, k), display(heap, v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Item::Sub(i) => format!("<function {i}>"),
        Item::Coroutine(_) => "<coroutine>".to_string(),
        Item::Callback(_) => "<callback>".to_string(),
        Item::UserData(_) => "<userdata>".to_string(),
    }
}
