// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Property tests for §8 "Laws": map round-trip, map delete, sort
//! idempotence, and `if`/`else` branch selection, checked over randomly
//! generated inputs rather than a handful of fixed cases.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;

fn run(source: &str) -> Vec<String> {
    let mut vm = rela::Vm::create(source).expect("compile");
    let lines = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink_lines = std::rc::Rc::clone(&lines);
    vm.set_print_sink(Box::new(move |line| sink_lines.borrow_mut().push(line.to_string())));
    vm.run(0).expect("run");
    std::rc::Rc::try_unwrap(lines).unwrap().into_inner()
}

proptest! {
    /// `m[k]=v; m[k]` equals `v` for any integer key and non-nil integer
    /// value (§8 "Map round-trip").
    #[test]
    fn map_round_trip(k in -1000i64..1000, v in 1i64..1000) {
        let out = run(&format!("m = {{}}\nm[{k}] = {v}\nprint(m[{k}])"));
        prop_assert_eq!(out, vec![v.to_string()]);
    }

    /// `m[k]=v; m[k]=nil; m[k]` equals nil (§8 "Map delete").
    #[test]
    fn map_delete(k in -1000i64..1000, v in 1i64..1000) {
        let out = run(&format!(
            "m = {{}}\nm[{k}] = {v}\nm[{k}] = nil\nprint(m[{k}])\nprint(#m)"
        ));
        prop_assert_eq!(out, vec!["nil".to_string(), "0".to_string()]);
    }

    /// `sort(sort(v))` equals `sort(v)` under total order (§8 "Sort
    /// idempotence").
    #[test]
    fn sort_idempotence(mut values in prop::collection::vec(-500i64..500, 0..30)) {
        let literal = values
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let out = run(&format!(
            "v = [{literal}]\ns1 = sort(v)\ns2 = sort(s1)\n\
             eq = true\nfor i,x in s1 do if x != s2[i] eq = false end end\n\
             print(eq)"
        ));
        prop_assert_eq!(out, vec!["true".to_string()]);

        values.sort_unstable();
        let expected = values
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join("\t");
        let printed = run(&format!(
            "v = [{literal}]\ns = sort(v)\nfor i,x in s do print(x) end"
        ))
        .join("\t");
        prop_assert_eq!(printed, expected);
    }

    /// `if a then x else y end` equals `x` when `truth(a)`, else `y`
    /// (§8 "if/else law").
    #[test]
    fn if_else_selects_the_taken_branch(cond in any::<bool>(), x in 1i64..100, y in 100i64..200) {
        let out = run(&format!(
            "function pick(a) if a return {x} else return {y} end end\nprint(pick({cond}))"
        ));
        let expected = if cond { x } else { y };
        prop_assert_eq!(out, vec![expected.to_string()]);
    }
}
