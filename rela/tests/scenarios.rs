// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! End-to-end scenarios: run a full source string through
//! `Vm::create`/`run` and assert on captured `print` output.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::cell::RefCell;
use std::rc::Rc;

fn run_and_capture(source: &str) -> Vec<String> {
    let mut vm = rela::Vm::create(source).expect("compile");
    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink_lines = Rc::clone(&lines);
    vm.set_print_sink(Box::new(move |line| sink_lines.borrow_mut().push(line.to_string())));
    vm.run(0).expect("run");
    Rc::try_unwrap(lines).unwrap().into_inner()
}

#[test]
fn arithmetic_precedence() {
    let out = run_and_capture("print(1+2*3)");
    assert_eq!(out, vec!["7"]);
}

#[test]
fn function_call() {
    let out = run_and_capture("function add(a,b) return a+b end\nprint(add(2,3))");
    assert_eq!(out, vec!["5"]);
}

#[test]
fn vector_for_loop_sum() {
    let out = run_and_capture(
        "v = [1,2,3]\ns=0\nfor _,x in v do s=s+x end\nprint(s)",
    );
    assert_eq!(out, vec!["6"]);
}

#[test]
fn coroutine_counter() {
    let out = run_and_capture(
        "function counter()\n\
         i=0\n\
         while true do\n\
         i=i+1\n\
         yield(i)\n\
         end\n\
         end\n\
         c=coroutine(counter)\n\
         print(resume(c), resume(c), resume(c))",
    );
    assert_eq!(out, vec!["1\t2\t3"]);
}

#[test]
fn map_field_get_set() {
    let out = run_and_capture("m = {a=1,b=2}\nm.a=10\nprint(m.a, m.b)");
    assert_eq!(out, vec!["10\t2"]);
}

#[test]
fn string_interpolation() {
    let out = run_and_capture(r#"print("hi $(1+1) there")"#);
    assert_eq!(out, vec!["hi 2 there"]);
}

#[test]
fn multi_return_assignment() {
    let out = run_and_capture(
        "function f() return 1,2 end\n\
         a,b = f()\n\
         print(a, b)\n\
         c = f()\n\
         print(c)",
    );
    assert_eq!(out, vec!["1\t2", "1"]);
}

#[test]
fn if_else_branches() {
    let out = run_and_capture(
        "function pick(a) if a return 1 else return 2 end end\n\
         print(pick(true), pick(false))",
    );
    assert_eq!(out, vec!["1\t2"]);
}

#[test]
fn sort_idempotence() {
    let out = run_and_capture(
        "v = [3,1,2]\n\
         s1 = sort(v)\n\
         s2 = sort(s1)\n\
         print(s1[0], s1[1], s1[2])\n\
         print(s2[0], s2[1], s2[2])",
    );
    assert_eq!(out, vec!["1\t2\t3", "1\t2\t3"]);
}

#[test]
fn lib_map_exposes_builtins() {
    let out = run_and_capture(
        "v = [3,1,2]\n\
         lib.sort(v)\n\
         print(v[0], v[1], v[2])\n\
         print(lib.type(1), lib.type(\"s\"))",
    );
    assert_eq!(out, vec!["1\t2\t3", "integer\tstring"]);
}

#[test]
fn decompile_does_not_affect_output() {
    let mut vm = rela::Vm::create("print(1+1)").expect("compile");
    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink_lines = Rc::clone(&lines);
    vm.set_print_sink(Box::new(move |line| sink_lines.borrow_mut().push(line.to_string())));
    vm.run(0).expect("run");
    let disasm = vm.disassemble();
    assert!(!disasm.is_empty());
    assert_eq!(*lines.borrow(), vec!["2".to_string()]);
}
