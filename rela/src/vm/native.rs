// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Native callback registry and the `core` scope's built-in functions
//! (§4.I "Embedding", §6 "the host can register native callbacks
//! alongside whatever `core` already publishes").
//!
//! `print` and the math/comparison helpers are ordinary calls from the
//! compiler's point of view: they resolve through the normal
//! `Find`/`CFunc` name lookup to an `Item::Callback` planted in `core`
//! at construction time, exactly like a callback a host program
//! registers later with [`crate::vm::Vm::register`]. `compile_call`
//! special-cases `coroutine`/`resume`/`yield`/`type`/`assert`/`sort`/
//! `setmeta`/`getmeta`/`collect` as dedicated opcodes when called by a
//! bare name, but this module also registers native equivalents for all
//! of them but `yield` so they remain reachable as plain values (through
//! `lib`, or by taking a reference to the bare name without calling it).

use crate::error::{Error, Result};
use crate::value::{ops, Item};
use crate::vm::coroutine::Coroutine;
use crate::vm::Vm;

pub type NativeFn = Box<dyn Fn(&mut Vm, &[Item]) -> Result<Vec<Item>>>;

fn arg_f64(args: &[Item], i: usize) -> Result<f64> {
    match args.get(i) {
        Some(Item::Int(n)) => Ok(*n as f64),
        Some(Item::Float(f)) => Ok(*f),
        _ => Err(Error::type_error(format!("expected a number at argument {i}"), -1)),
    }
}

fn one_arg_math(f: impl Fn(f64) -> f64 + 'static) -> NativeFn {
    Box::new(move |_vm, args| Ok(vec![Item::Float(f(arg_f64(args, 0)?))]))
}

/// Populate `core` with `print` and the standard math/comparison
/// helpers (§5 "Non-goals" carves out everything beyond this short
/// list; SPEC_FULL.md "Supplemented features" names `lib` enumeration).
pub fn install_core(vm: &mut Vm) {
    vm.register("print", Box::new(native_print));
    vm.register("sin", one_arg_math(f64::sin));
    vm.register("cos", one_arg_math(f64::cos));
    vm.register("tan", one_arg_math(f64::tan));
    vm.register("sqrt", one_arg_math(f64::sqrt));
    vm.register("floor", one_arg_math(f64::floor));
    vm.register("ceil", one_arg_math(f64::ceil));
    vm.register("abs", one_arg_math(f64::abs));
    vm.register(
        "pow",
        Box::new(|_vm, args| Ok(vec![Item::Float(arg_f64(args, 0)?.powf(arg_f64(args, 1)?))])),
    );
    vm.register("min", Box::new(native_min));
    vm.register("max", Box::new(native_max));
    vm.register("slurp", Box::new(native_slurp));

    install_lib(vm);
}

/// Build the `lib` map (§6 "`core` publishes ... `lib`, a map of the
/// opcodes that are also library-callable") and plant it in `core` as
/// `Item::Map`. Every entry is a genuine `Item::Callback`, reachable
/// both by the keyword/opcode the compiler special-cases in
/// `compile_call` and by indexing `lib` as an ordinary map, e.g.
/// `lib.sort(v)` runs the identical logic as the `sort(v)` opcode form.
///
/// `yield` is deliberately absent: it suspends the *currently running*
/// routine in place and hands control back to the resumer, which only
/// makes sense as an opcode the stepping loop dispatches on directly —
/// a native call just returns a value into the same routine and cannot
/// itself perform that switch.
fn install_lib(vm: &mut Vm) {
    // `print` and the math/comparison helpers are already registered by
    // `install_core`; the rest only exist as dedicated opcodes today, so
    // register native equivalents under the same names here.
    vm.register("coroutine", Box::new(native_coroutine));
    vm.register("resume", Box::new(native_resume));
    vm.register("type", Box::new(native_type));
    vm.register("assert", Box::new(native_assert));
    vm.register("sort", Box::new(native_sort));
    vm.register("setmeta", Box::new(native_setmeta));
    vm.register("getmeta", Box::new(native_getmeta));
    vm.register("collect", Box::new(native_collect));

    let names = [
        "print", "coroutine", "resume", "type", "assert", "sort", "setmeta", "getmeta",
        "collect", "sin", "cos", "tan", "sqrt", "floor", "ceil", "abs", "pow", "min", "max",
    ];
    let lib = Item::Map(vm.heap_mut().alloc_map());
    for name in names {
        let Some(callback) = vm.lookup_core(name) else { continue };
        let key = vm.heap_mut().intern(name);
        vm.map_set_entry(lib, Item::Str(key), callback);
    }
    vm.register_value("lib", lib);
}

fn native_coroutine(vm: &mut Vm, args: &[Item]) -> Result<Vec<Item>> {
    let Some(Item::Sub(entry)) = args.first() else {
        return Err(Error::type_error("coroutine expects a subroutine argument", -1));
    };
    let idx = vm.heap_mut().alloc_coroutine(Coroutine::new(*entry));
    Ok(vec![Item::Coroutine(idx)])
}

fn native_resume(vm: &mut Vm, args: &[Item]) -> Result<Vec<Item>> {
    let Some(Item::Coroutine(idx)) = args.first() else {
        return Err(Error::type_error("resume expects a coroutine argument", -1));
    };
    vm.resume_from_native(*idx, args[1..].to_vec())
}

fn native_type(vm: &mut Vm, args: &[Item]) -> Result<Vec<Item>> {
    let v = args.first().copied().unwrap_or(Item::Nil);
    let handle = vm.heap_mut().intern(v.type_name());
    Ok(vec![Item::Str(handle)])
}

fn native_assert(vm: &mut Vm, args: &[Item]) -> Result<Vec<Item>> {
    let v = args.first().copied().unwrap_or(Item::Nil);
    if !ops::truth(vm.heap(), v) {
        return Err(Error::runtime("assertion failed", -1));
    }
    Ok(vec![v])
}

fn native_sort(vm: &mut Vm, args: &[Item]) -> Result<Vec<Item>> {
    let v = args.first().copied().unwrap_or(Item::Nil);
    let Item::Vector(idx) = v else {
        return Err(Error::type_error("sort expects a vector", -1));
    };
    vm.sort_vector(idx);
    Ok(vec![v])
}

fn native_setmeta(vm: &mut Vm, args: &[Item]) -> Result<Vec<Item>> {
    let obj = args.first().copied().unwrap_or(Item::Nil);
    let meta = args.get(1).copied().unwrap_or(Item::Nil);
    vm.set_meta(obj, meta)?;
    Ok(vec![obj])
}

fn native_getmeta(vm: &mut Vm, args: &[Item]) -> Result<Vec<Item>> {
    let obj = args.first().copied().unwrap_or(Item::Nil);
    Ok(vec![vm.get_meta(obj)])
}

fn native_collect(vm: &mut Vm, _args: &[Item]) -> Result<Vec<Item>> {
    vm.collect();
    Ok(vec![Item::Nil])
}

fn native_print(vm: &mut Vm, args: &[Item]) -> Result<Vec<Item>> {
    let parts: Vec<String> = args.iter().map(|&a| ops::display(vm.heap(), a)).collect();
    vm.emit_print(&parts.join("\t"));
    Ok(vec![Item::Nil])
}

fn native_min(vm: &mut Vm, args: &[Item]) -> Result<Vec<Item>> {
    let mut best = *args.first().ok_or_else(|| Error::type_error("min needs at least one argument", -1))?;
    for &a in &args[1..] {
        if ops::less(vm.heap(), a, best) {
            best = a;
        }
    }
    Ok(vec![best])
}

fn native_max(vm: &mut Vm, args: &[Item]) -> Result<Vec<Item>> {
    let mut best = *args.first().ok_or_else(|| Error::type_error("max needs at least one argument", -1))?;
    for &a in &args[1..] {
        if ops::less(vm.heap(), best, a) {
            best = a;
        }
    }
    Ok(vec![best])
}

/// Read an entire file as a string (SPEC_FULL.md "Supplemented
/// features": gated behind [`crate::vm::VmConfig::allow_filesystem`]
/// since a script that can read arbitrary host paths is a capability
/// an embedder must opt into).
fn native_slurp(vm: &mut Vm, args: &[Item]) -> Result<Vec<Item>> {
    if !vm.config().allow_filesystem {
        return Err(Error::host("slurp is disabled (VmConfig::allow_filesystem is false)", -1));
    }
    let Some(Item::Str(h)) = args.first() else {
        return Err(Error::type_error("slurp expects a string path", -1));
    };
    let path = vm.heap().resolve(*h).to_string();
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let handle = vm.heap_mut().intern(&contents);
            Ok(vec![Item::Str(handle)])
        }
        Err(e) => Err(Error::host(format!("slurp: {e}"), -1)),
    }
}
