// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! `slurp` (SPEC_FULL.md "Supplemented features"): a script-level
//! filesystem read gated behind `VmConfig::allow_filesystem`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use rela::{Vm, VmConfig};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

#[test]
fn slurp_reads_a_file_when_enabled() {
    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    write!(file, "hello from disk").expect("write temp file");
    let path = file.path().to_str().expect("utf8 path").to_string();

    let source = format!("print(slurp(\"{path}\"))");
    let mut vm = Vm::create(&source).expect("compile");
    vm.set_config(VmConfig {
        allow_filesystem: true,
        trace_opcodes: false,
    });

    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink_lines = Rc::clone(&lines);
    vm.set_print_sink(Box::new(move |line| sink_lines.borrow_mut().push(line.to_string())));
    vm.run(0).expect("run");
    assert_eq!(*lines.borrow(), vec!["hello from disk".to_string()]);
}

#[test]
fn slurp_is_a_host_error_when_disabled() {
    let mut vm = Vm::create("print(slurp(\"/etc/hostname\"))").expect("compile");
    // Default VmConfig has allow_filesystem = false.
    let err = vm.run(0).expect_err("slurp must fail closed by default");
    assert!(err.to_string().contains("disabled"));
}
