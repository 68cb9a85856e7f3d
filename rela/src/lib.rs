// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Rela: an embeddable scripting language (see `SPEC_FULL.md` at the
//! workspace root for the full design).
//!
//! A host program embeds Rela by compiling source into a [`vm::Vm`],
//! optionally registering native callbacks with [`vm::Vm::register`],
//! and calling [`vm::Vm::run`]. Everything the language needs —
//! parsing, compiling, bytecode execution, coroutines and GC — lives
//! under this crate; nothing here reads argv, opens files on its own,
//! or talks to a terminal. That is `rela-cli`'s job.
//!
//! ```
//! let mut vm = rela::Vm::create("print(1 + 2 * 3)").unwrap();
//! vm.run(0).unwrap();
//! ```

pub mod compiler;
pub mod container;
pub mod error;
pub mod intern;
pub mod parser;
pub mod pool;
pub mod value;
pub mod vm;

pub use error::{Error, Result};
pub use value::Item;
pub use vm::{Vm, VmConfig};
