// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Rela Contributors

//! SPEC_FULL.md's ambient "Logging" section: `tracing` events at
//! coroutine switches, GC sweeps, and module loads. Installs a
//! subscriber writing into a shared buffer and checks the three named
//! events actually fire.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
struct BufWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for BufWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for BufWriter {
    type Writer = BufWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn named_ambient_events_fire() {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(BufWriter(Arc::clone(&buf)))
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let mut vm = rela::Vm::create(
            "function counter()\n\
             i=0\n\
             while true do\n\
             i=i+1\n\
             yield(i)\n\
             end\n\
             end\n\
             c=coroutine(counter)\n\
             resume(c)\n\
             collect()",
        )
        .expect("compile");
        vm.run(0).expect("run");
    });

    let output = String::from_utf8(buf.lock().unwrap().clone()).expect("utf8 log");
    assert!(output.contains("loading module"), "{output}");
    assert!(output.contains("coroutine resume"), "{output}");
    assert!(output.contains("coroutine yield"), "{output}");
    assert!(output.contains("gc sweep"), "{output}");
}
