// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! Thin CLI driver implementing the §6 "CLI contract" collaborator: read
//! one script file, optionally disassemble it, run it, and map the
//! result onto the two exit codes the spec names (0 success, 1 any
//! failure). Everything interesting lives in the `rela` library; this
//! binary only owns argv, the script file and process exit status.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Rela script interpreter.
#[derive(Parser)]
#[command(name = "rela", version, about = "Run a Rela script")]
struct Args {
    /// Disassemble the compiled bytecode to stderr after running.
    #[arg(short = 'd')]
    decompile: bool,

    /// Path to the script to run.
    script: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run(&args)
}

fn run(args: &Args) -> ExitCode {
    let source = match std::fs::read_to_string(&args.script) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot read script file {}: {e}", args.script.display());
            return ExitCode::FAILURE;
        }
    };

    let mut vm = match rela::Vm::create(&source) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let result = vm.run(0);

    if args.decompile {
        eprint!("{}", vm.disassemble());
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
