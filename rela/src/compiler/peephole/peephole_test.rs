// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Tests for the peephole fusion pass (§4.E "Peephole fusions", §9
//! "must never cross a jump target").

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::intern::{Region, StrHandle};
use std::collections::HashSet;

fn name(index: usize) -> Item {
    Item::Str(StrHandle {
        region: Region::Old,
        index,
    })
}

#[test]
fn lit_add_fuses_to_add_lit() {
    let mut instrs = vec![
        Instr::with_imm(OpCode::Lit, Item::Int(5)),
        Instr::new(OpCode::Add),
    ];
    optimize(&mut instrs, &HashSet::new());
    assert_eq!(instrs.len(), 1);
    assert_eq!(instrs[0].op, OpCode::AddLit);
    assert!(matches!(instrs[0].imm, Item::Int(5)));
}

#[test]
fn lit_mul_fuses_to_mul_lit() {
    let mut instrs = vec![
        Instr::with_imm(OpCode::Lit, Item::Float(2.5)),
        Instr::new(OpCode::Mul),
    ];
    optimize(&mut instrs, &HashSet::new());
    assert_eq!(instrs.len(), 1);
    assert_eq!(instrs[0].op, OpCode::MulLit);
}

#[test]
fn repeated_find_fuses_into_copies() {
    let mut instrs = vec![
        Instr::with_imm(OpCode::Find, name(0)),
        Instr::with_imm(OpCode::Find, name(0)),
    ];
    optimize(&mut instrs, &HashSet::new());
    assert_eq!(instrs.len(), 1);
    assert_eq!(instrs[0].op, OpCode::Copies);
    assert_eq!(instrs[0].cache, 2);
}

#[test]
fn find_of_different_names_does_not_fuse() {
    let mut instrs = vec![
        Instr::with_imm(OpCode::Find, name(0)),
        Instr::with_imm(OpCode::Find, name(1)),
    ];
    optimize(&mut instrs, &HashSet::new());
    assert_eq!(instrs.len(), 2);
}

#[test]
fn clean_clean_collapses() {
    let mut instrs = vec![Instr::new(OpCode::Clean), Instr::new(OpCode::Clean)];
    optimize(&mut instrs, &HashSet::new());
    assert_eq!(instrs.len(), 1);
    assert_eq!(instrs[0].op, OpCode::Clean);
}

#[test]
fn return_clean_collapses_to_return() {
    let mut instrs = vec![Instr::new(OpCode::Return), Instr::new(OpCode::Clean)];
    optimize(&mut instrs, &HashSet::new());
    assert_eq!(instrs.len(), 1);
    assert_eq!(instrs[0].op, OpCode::Return);
}

#[test]
fn fusion_never_crosses_a_jump_target() {
    // Three instructions where ip 1 is itself a jump target: `Lit;Add`
    // would normally fuse, but index 1 (the `Add`) appears in
    // `jump_targets`, so nothing downstream can ever land mid-pair.
    let mut instrs = vec![
        Instr::with_imm(OpCode::Lit, Item::Int(1)),
        Instr::new(OpCode::Add),
        Instr::new(OpCode::Drop),
    ];
    let mut targets = HashSet::new();
    targets.insert(1);
    optimize(&mut instrs, &targets);
    assert_eq!(instrs.len(), 3, "fusion must not swallow a jump target");
    assert_eq!(instrs[0].op, OpCode::Lit);
    assert_eq!(instrs[1].op, OpCode::Add);
}

#[test]
fn jump_targets_are_remapped_after_fusion() {
    // Jmp -> ip 3 (the Drop), preceded by a fusible Lit;Add pair at 0..2.
    // After fusion, ip 3 shifts down to ip 2 and the Jmp's cache must
    // follow it.
    let mut instrs = vec![
        Instr::with_cache(OpCode::Jmp, 3),
        Instr::with_imm(OpCode::Lit, Item::Int(1)),
        Instr::new(OpCode::Add),
        Instr::new(OpCode::Drop),
    ];
    let mut targets = HashSet::new();
    targets.insert(3);
    optimize(&mut instrs, &targets);
    assert_eq!(instrs.len(), 3);
    assert_eq!(instrs[0].op, OpCode::Jmp);
    assert_eq!(instrs[0].cache, 2);
    assert_eq!(instrs[2].op, OpCode::Drop);
}
